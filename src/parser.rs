//! Hand-written recursive-descent parser.
//!
//! Produces a flat parse tree over the scanned token stream. Precedences,
//! low to high: assignment, disjunction, conjunction, comparison chains,
//! equality/membership, addition and set union, multiplication variants,
//! left-unary, implicit multiplication, right-unary, primary.
//!
//! On failure the parser emits a single error and advances to end of input;
//! later passes still run so the editor gets a best-effort symbol table.

use std::collections::HashMap;

use crate::errors::ErrorCode;
use crate::intern::Name;
use crate::model::{Marker, ModelId, Selection};
use crate::ops::Op;
use crate::parse_tree::{ParseNode, ParseTree, NONE};
use crate::program::{FileResult, Program};
use crate::token::{Token, TokenKind};

pub struct Parser<'p> {
    program: &'p mut Program,
    tokens: Vec<Token>,
    model: ModelId,
    pub parse_tree: ParseTree,
    /// Open/close marker pairs, for the editor's grouping highlights.
    pub open_symbols: HashMap<Marker, Marker>,
    pub close_symbols: HashMap<Marker, Marker>,
    index: usize,
    loops: usize,
    comment: usize,
}

impl<'p> Parser<'p> {
    pub fn new(program: &'p mut Program, model: ModelId, tokens: Vec<Token>) -> Self {
        Parser {
            program,
            tokens,
            model,
            parse_tree: ParseTree::new(),
            open_symbols: HashMap::new(),
            close_symbols: HashMap::new(),
            index: 0,
            loops: 0,
            comment: NONE,
        }
    }

    pub fn parse_all(&mut self) {
        self.parse_tree.clear();
        self.index = 0;

        self.parse_tree.prepare_nary();
        self.skip_newlines();
        while !self.peek(TokenKind::EndOfFile) {
            let stmt = self.checked_statement();
            self.parse_tree.add_nary_child(stmt);
            self.skip_newlines();
        }

        let sel = Selection::from_span(
            self.model,
            self.tokens.first().map(|t| t.sel.start).unwrap_or(0),
            self.tokens.last().map(|t| t.sel.end).unwrap_or(0),
        );
        self.parse_tree.root = self.parse_tree.finish_nary(Op::Block, sel);

        // Lazy calculator: a sole expression statement becomes a print
        if self.parse_tree.num_args(self.parse_tree.root) == 1 {
            let stmt = self.parse_tree.child(self.parse_tree.root);
            if self.parse_tree.op(stmt) == Op::ExprStmt {
                self.parse_tree.set_op(stmt, Op::Print);
            }
        }
    }

    // Token helpers ---------------------------------------------------------

    fn current_kind(&self) -> TokenKind {
        self.tokens[self.index.min(self.tokens.len() - 1)].kind
    }

    fn current_token(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn peek(&self, kind: TokenKind) -> bool {
        self.current_kind() == kind
    }

    fn lookahead(&self, kind: TokenKind) -> bool {
        self.tokens
            .get(self.index + 1)
            .map(|t| t.kind == kind)
            .unwrap_or(false)
    }

    fn advance(&mut self) {
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
        if self.peek(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, code: ErrorCode) -> bool {
        if self.match_kind(kind) {
            true
        } else {
            self.error(code);
            false
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.current_kind(), TokenKind::Newline | TokenKind::Comment) {
            if self.current_kind() == TokenKind::Comment {
                self.comment = self.index;
            }
            self.advance();
        }
    }

    fn skip_newline(&mut self) {
        self.match_kind(TokenKind::Newline);
    }

    fn selection(&self) -> Selection {
        self.current_token().sel
    }

    fn selection_prev(&self) -> Selection {
        self.tokens[self.index.saturating_sub(1)].sel
    }

    fn l_mark(&self) -> Marker {
        self.selection().left()
    }

    fn r_mark(&self) -> Marker {
        self.selection().right()
    }

    fn r_mark_prev(&self) -> Marker {
        self.selection_prev().right()
    }

    fn no_errors(&self) -> bool {
        self.program.no_errors()
    }

    fn recover(&mut self) {
        self.index = self.tokens.len() - 1;
    }

    fn register_grouping(&mut self, left: Marker, right: Marker) {
        if self.no_errors() {
            self.open_symbols.insert(left, right);
            self.close_symbols.insert(right, left);
        }
    }

    fn error(&mut self, code: ErrorCode) -> ParseNode {
        self.error_at(code, self.selection())
    }

    fn error_at(&mut self, code: ErrorCode, sel: Selection) -> ParseNode {
        if self.no_errors() {
            self.program.fail(sel, code);
        }
        self.parse_tree.add_terminal(Op::Error, sel)
    }

    fn make_terminal(&mut self, op: Op) -> ParseNode {
        self.parse_tree.add_terminal(op, self.selection())
    }

    fn terminal_and_advance(&mut self, op: Op) -> ParseNode {
        let pn = self.make_terminal(op);
        self.advance();
        pn
    }

    fn intern_current(&mut self) -> Name {
        let sel = self.selection();
        self.program.intern_selection(&sel)
    }

    fn attach_comment(&mut self, id: ParseNode) {
        if self.comment != NONE {
            let sel = self.tokens[self.comment].sel;
            let comment_node = self.parse_tree.add_terminal(Op::Comment, sel);
            self.parse_tree.set_flag(id, comment_node);
            self.comment = NONE;
        }
    }

    // Statements ------------------------------------------------------------

    fn checked_statement(&mut self) -> ParseNode {
        let n = self.statement();
        if !self.no_errors() {
            self.recover();
        }
        n
    }

    fn statement(&mut self) -> ParseNode {
        self.skip_newlines();
        use TokenKind::*;
        match self.current_kind() {
            Algorithm => self.alg_statement(),
            Assert => self.assert_statement(),
            Break => {
                if self.loops > 0 {
                    self.terminal_and_advance(Op::Break)
                } else {
                    self.error(ErrorCode::BadBreak)
                }
            }
            Class => self.class_statement(),
            Continue => {
                if self.loops > 0 {
                    self.terminal_and_advance(Op::Continue)
                } else {
                    self.error(ErrorCode::BadContinue)
                }
            }
            Enum => self.enum_statement(),
            For => self.for_statement(),
            From => self.from_statement(),
            If => self.if_statement(),
            Import => self.import_statement(),
            LeftBracket => self.lexical_scope_statement(),
            Namespace => self.namespace_statement(),
            Plot => self.plot_statement(),
            Print => self.print_statement(),
            Return => self.return_statement(),
            Switch => self.switch_statement(),
            SettingsUpdate => self.settings_statement(),
            Unknown => self.unknowns_statement(),
            While => self.while_statement(),
            _ => self.math_statement(),
        }
    }

    fn if_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let cond_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let condition = self.disjunction();
        let cond_r = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(cond_l, cond_r);
        let body = self.block_statement();
        if self.match_kind(TokenKind::Else) {
            let else_body = self.block_statement();
            let sel = Selection::new(left, self.r_mark_prev());
            self.parse_tree
                .add_node(Op::IfElse, sel, &[condition, body, else_body])
        } else {
            let sel = Selection::new(left, self.r_mark_prev());
            self.parse_tree.add_node(Op::If, sel, &[condition, body])
        }
    }

    fn while_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let cond_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let condition = self.disjunction();
        let cond_r = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(cond_l, cond_r);
        self.loops += 1;
        let body = self.block_statement();
        self.loops -= 1;
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_node(Op::While, sel, &[condition, body])
    }

    fn for_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let paren_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let initializer = if self.peek(TokenKind::Semicolon) {
            self.make_terminal(Op::Block)
        } else {
            self.simple_statement()
        };

        if self.match_kind(TokenKind::Colon) {
            return self.ranged_for(left, paren_l, initializer);
        }
        if !self.consume(TokenKind::Semicolon, ErrorCode::ExpectSemicolon) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let condition = if self.peek(TokenKind::Semicolon) {
            self.make_terminal(Op::True)
        } else {
            self.disjunction()
        };
        if !self.consume(TokenKind::Semicolon, ErrorCode::ExpectSemicolon) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let update = if self.peek(TokenKind::RightParen) {
            self.make_terminal(Op::Block)
        } else {
            self.simple_statement()
        };
        let paren_r = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(paren_l, paren_r);
        self.loops += 1;
        let body = self.block_statement();
        self.loops -= 1;
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::For, sel, &[initializer, condition, update, body])
    }

    fn ranged_for(
        &mut self,
        stmt_left: Marker,
        paren_left: Marker,
        initializer: ParseNode,
    ) -> ParseNode {
        if self.parse_tree.op(initializer) != Op::ExprStmt {
            let sel = self.parse_tree.sel(initializer);
            return self.error_at(ErrorCode::BadRangedForVar, sel);
        }
        let id = self.parse_tree.child(initializer);
        if self.parse_tree.op(id) != Op::Identifier {
            let sel = self.parse_tree.sel(id);
            return self.error_at(ErrorCode::BadRangedForVar, sel);
        }

        let collection = self.expression();
        let paren_right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(paren_left, paren_right);
        self.loops += 1;
        let body = self.block_statement();
        self.loops -= 1;
        let sel = Selection::new(stmt_left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::RangedFor, sel, &[id, collection, body])
    }

    /// A statement without trailing-terminator checks, for `for(...)` slots.
    fn simple_statement(&mut self) -> ParseNode {
        let n = self.expression();
        match self.current_kind() {
            TokenKind::Equals | TokenKind::DefEquals => {
                self.advance();
                let rhs = self.expression();
                self.parse_tree.add_node_span(Op::Equal, &[n, rhs])
            }
            TokenKind::LeftArrow => {
                self.advance();
                let rhs = self.expression();
                self.parse_tree.add_node_span(Op::Assign, &[n, rhs])
            }
            _ => self.parse_tree.wrap_unary(Op::ExprStmt, n),
        }
    }

    fn enum_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let id = self.isolated_identifier();
        let bracket_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftBracket) {
            return self.error(ErrorCode::ExpectLeftBracket);
        }

        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(id);
        self.skip_newlines();
        while !self.match_kind(TokenKind::RightBracket) && self.no_errors() {
            let member = self.isolated_identifier();
            self.parse_tree.add_nary_child(member);
            self.match_kind(TokenKind::Comma);
            self.skip_newlines();
        }

        if self.no_errors() {
            let end = self.r_mark_prev();
            self.register_grouping(bracket_l, end);
            self.parse_tree
                .finish_nary(Op::Enum, Selection::new(left, end))
        } else {
            self.parse_tree.cancel_nary();
            self.error(ErrorCode::ExpectCase)
        }
    }

    fn settings_statement(&mut self) -> ParseNode {
        self.terminal_and_advance(Op::SettingsUpdate)
    }

    fn switch_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let cond_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let key = self.disjunction();
        let cond_r = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(cond_l, cond_r);
        let body_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftBracket) {
            return self.error(ErrorCode::ExpectLeftBracket);
        }
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(key);
        while !self.match_kind(TokenKind::RightBracket) && self.no_errors() {
            match self.current_kind() {
                TokenKind::Case => {
                    self.advance();
                    let case_key = self.disjunction();
                    self.consume(TokenKind::Colon, ErrorCode::ExpectColon);
                    self.match_kind(TokenKind::Newline);
                    let fallthrough = matches!(
                        self.current_kind(),
                        TokenKind::Case | TokenKind::Default | TokenKind::RightBracket
                    );
                    let codepath = if fallthrough { NONE } else { self.block_statement() };
                    let sel = self.parse_tree.sel(case_key);
                    let case_node = self
                        .parse_tree
                        .add_node(Op::Case, sel, &[case_key, codepath]);
                    self.parse_tree.add_nary_child(case_node);
                }
                TokenKind::Default => {
                    let label = self.terminal_and_advance(Op::Default);
                    self.consume(TokenKind::Colon, ErrorCode::ExpectColon);
                    self.match_kind(TokenKind::Newline);
                    let fallthrough = matches!(
                        self.current_kind(),
                        TokenKind::Case | TokenKind::Default | TokenKind::RightBracket
                    );
                    let codepath = if fallthrough { NONE } else { self.block_statement() };
                    let sel = self.parse_tree.sel(label);
                    let default_node = self
                        .parse_tree
                        .add_node(Op::Default, sel, &[label, codepath]);
                    self.parse_tree.add_nary_child(default_node);
                }
                TokenKind::Newline | TokenKind::Comment => self.advance(),
                _ => {
                    self.parse_tree.cancel_nary();
                    return self.error(ErrorCode::ExpectCase);
                }
            }
        }

        let end = self.r_mark_prev();
        if self.no_errors() {
            self.register_grouping(body_l, end);
            self.parse_tree
                .finish_nary(Op::Switch, Selection::new(left, end))
        } else {
            self.parse_tree.cancel_nary();
            self.error(ErrorCode::ExpectCase)
        }
    }

    fn print_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }

        self.parse_tree.prepare_nary();
        loop {
            let arg = self.disjunction();
            self.parse_tree.add_nary_child(arg);
            if !(self.no_errors() && self.match_kind(TokenKind::Comma)) {
                break;
            }
        }

        let right = self.r_mark();
        let sel = Selection::new(left, right);
        if !self.match_kind(TokenKind::RightParen) {
            self.parse_tree.cancel_nary();
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        self.parse_tree.finish_nary(Op::Print, sel)
    }

    fn assert_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let e = self.disjunction();
        let right = self.r_mark();
        let sel = Selection::new(left, right);
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        self.parse_tree.add_unary(Op::Assert, sel, e)
    }

    fn block_statement(&mut self) -> ParseNode {
        self.skip_newline();
        if !self.peek(TokenKind::LeftBracket) {
            let pn = self.statement();
            self.match_kind(TokenKind::Newline);
            return pn;
        }

        let left = self.l_mark();
        self.advance();
        self.parse_tree.prepare_nary();

        self.skip_newlines();
        while self.no_errors() && !self.match_kind(TokenKind::RightBracket) {
            let stmt = self.statement();
            self.parse_tree.add_nary_child(stmt);
            self.skip_newlines();
        }

        let sel = Selection::new(left, self.r_mark_prev());
        if self.no_errors() {
            self.register_grouping(sel.left(), sel.right());
        }
        self.parse_tree.finish_nary(Op::Block, sel)
    }

    fn lexical_scope_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        self.parse_tree.prepare_nary();

        self.skip_newlines();
        while self.no_errors() && !self.match_kind(TokenKind::RightBracket) {
            let stmt = self.statement();
            self.parse_tree.add_nary_child(stmt);
            self.skip_newlines();
        }

        let sel = Selection::new(left, self.r_mark_prev());
        if self.no_errors() {
            self.register_grouping(sel.left(), sel.right());
        }
        self.parse_tree.finish_nary(Op::LexicalScope, sel)
    }

    fn alg_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        let id = self.isolated_identifier();
        if self.parse_tree.op(id) == Op::Error {
            return id;
        }
        self.attach_comment(id);

        if !self.peek(TokenKind::LeftParen) && !self.peek(TokenKind::LeftBracket) {
            return self.parse_tree.wrap_unary(Op::PrototypeAlg, id);
        }

        let val_captures = if self.peek(TokenKind::LeftBracket) {
            self.capture_list()
        } else {
            NONE
        };

        if !self.consume(TokenKind::LeftParen, ErrorCode::ExpectLeftParen) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let params = self.param_list();

        let saved_loops = std::mem::take(&mut self.loops);
        let body = self.block_statement();
        self.loops = saved_loops;
        let sel = Selection::new(left, self.r_mark_prev());

        self.parse_tree
            .add_node(Op::Algorithm, sel, &[val_captures, NONE, params, body, id])
    }

    fn capture_list(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        self.parse_tree.prepare_nary();
        loop {
            let id = self.isolated_identifier();
            self.parse_tree.add_nary_child(id);
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightBracket) {
            self.parse_tree.cancel_nary();
            return self.error(ErrorCode::ExpectRightBracket);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .finish_nary(Op::List, Selection::new(left, right))
    }

    fn param_list(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.parse_tree.prepare_nary();
        if !self.peek(TokenKind::RightParen) {
            loop {
                let param = self.param();
                self.parse_tree.add_nary_child(param);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            self.parse_tree.cancel_nary();
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .finish_nary(Op::List, Selection::new(left, right))
    }

    fn param(&mut self) -> ParseNode {
        let id = self.isolated_identifier();
        if self.match_kind(TokenKind::Equals) {
            let default = self.disjunction();
            self.parse_tree.add_node_span(Op::Equal, &[id, default])
        } else {
            id
        }
    }

    fn return_statement(&mut self) -> ParseNode {
        let m = self.l_mark();
        self.advance();
        if matches!(
            self.current_kind(),
            TokenKind::Newline | TokenKind::EndOfFile | TokenKind::RightBracket
        ) {
            return self
                .parse_tree
                .add_terminal(Op::ReturnEmpty, Selection::new(m, self.r_mark_prev()));
        }
        let value = self.disjunction();
        self.parse_tree.add_left_unary(Op::Return, m, value)
    }

    fn plot_statement(&mut self) -> ParseNode {
        let m = self.l_mark();
        self.advance();
        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let title = self.expression();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let x_label = self.expression();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let x = self.expression();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let y_label = self.expression();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let y = self.expression();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        let sel = Selection::new(m, right);
        self.parse_tree
            .add_node(Op::Plot, sel, &[title, x_label, x, y_label, y])
    }

    fn import_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        let file = self.filename();
        if self.parse_tree.op(file) == Op::Error {
            return file;
        }
        let alias = if self.match_kind(TokenKind::As) {
            self.isolated_identifier()
        } else {
            NONE
        };
        let sel = Selection::new(left, self.r_mark_prev());
        let import_stmt = self.parse_tree.add_unary(Op::Import, sel, file);
        self.parse_tree.set_flag(import_stmt, alias);
        import_stmt
    }

    fn from_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        let file = self.filename();
        if self.parse_tree.op(file) == Op::Error {
            return file;
        }

        if !self.match_kind(TokenKind::Import) {
            return self.error(ErrorCode::UnrecognizedExpr);
        }

        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(file);
        loop {
            if !self.peek(TokenKind::Identifier) {
                self.parse_tree.cancel_nary();
                return self.error(ErrorCode::ExpectedPrimary);
            }
            let component = self.isolated_identifier();
            let alias = if self.match_kind(TokenKind::As) {
                self.isolated_identifier()
            } else {
                NONE
            };
            self.parse_tree.add_nary_child(component);
            self.parse_tree.add_nary_child(alias);
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }

        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.finish_nary(Op::FromImport, sel)
    }

    /// Parse and open an import target; the model id is stored in the
    /// node's `double` slot and checked against self-import.
    fn filename(&mut self) -> ParseNode {
        if !self.peek(TokenKind::Filepath) {
            return self.error(ErrorCode::ExpectedFilepath);
        }
        let sel = self.selection();
        let file = self.terminal_and_advance(Op::FileRef);

        let path = self.program.selection_text(&sel).to_string();
        let importing_dir = self
            .program
            .model(self.model)
            .path
            .parent()
            .map(|p| p.to_path_buf());
        let result = self
            .program
            .open_from_relative_path(&path, importing_dir.as_deref());

        match result {
            FileResult::NotFound => self.error_at(ErrorCode::FileNotFound, sel),
            FileResult::Corrupted => self.error_at(ErrorCode::FileCorrupted, sel),
            FileResult::Opened(id) | FileResult::AlreadyOpen(id) => {
                if id == self.model {
                    return self.error_at(ErrorCode::SelfImport, sel);
                }
                self.parse_tree.set_double(file, id as f64);
                file
            }
        }
    }

    fn namespace_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let name = self.isolated_identifier();
        let body = self.block_statement();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_node(Op::Namespace, sel, &[name, body])
    }

    fn unknowns_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        if !self.consume(TokenKind::Colon, ErrorCode::ExpectColon) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        self.parse_tree.prepare_nary();
        loop {
            let id = self.isolated_identifier();
            self.parse_tree.add_nary_child(id);
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }

        if !self.no_errors() {
            self.parse_tree.cancel_nary();
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }

        let sel = Selection::new(left, self.r_mark_prev());
        let unknown_list = self.parse_tree.finish_nary(Op::UnknownList, sel);

        if self.match_kind(TokenKind::Member) {
            let member_of = self.expression();
            self.parse_tree.set_flag(unknown_list, member_of);
            let right = self.r_mark_prev();
            self.parse_tree.set_right(unknown_list, right);
        }

        unknown_list
    }

    fn class_statement(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let name = self.isolated_identifier();
        let mut parents = NONE;

        if self.match_kind(TokenKind::Colon) {
            self.parse_tree.prepare_nary();
            loop {
                let is_private = if self.match_kind(TokenKind::Private) {
                    true
                } else {
                    self.match_kind(TokenKind::Public);
                    false
                };
                let parent = self.isolated_identifier();
                self.parse_tree.set_flag(parent, is_private as usize);
                self.parse_tree.add_nary_child(parent);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
            parents = self.parse_tree.finish_nary_span(Op::List);
        }

        self.skip_newline();
        let bracket_left = self.l_mark();
        if !self.consume(TokenKind::LeftBracket, ErrorCode::ExpectLeftBracket) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        self.skip_newlines();

        self.parse_tree.prepare_nary();
        while self.no_errors() && !self.match_kind(TokenKind::RightBracket) {
            let is_static = self.match_kind(TokenKind::Static);
            let member = self.isolated_identifier();
            self.parse_tree.set_flag(member, is_static as usize);
            self.parse_tree.add_nary_child(member);
            self.match_kind(TokenKind::Comma);
            self.skip_newlines();
        }
        if !self.no_errors() {
            self.parse_tree.cancel_nary();
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }

        let members_sel = Selection::new(bracket_left, self.r_mark_prev());
        self.register_grouping(members_sel.left(), members_sel.right());
        let member_list = self.parse_tree.finish_nary(Op::List, members_sel);

        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::Class, sel, &[name, parents, member_list])
    }

    fn math_statement(&mut self) -> ParseNode {
        let n = self.expression();

        let stmt = match self.current_kind() {
            TokenKind::Equals | TokenKind::DefEquals => {
                if self.parse_tree.op(n) == Op::Call && self.parse_tree.num_args(n) >= 2 {
                    self.named_lambda_stmt(n)
                } else {
                    self.equality(n)
                }
            }
            TokenKind::LeftArrow => self.assignment(n),
            _ => self.parse_tree.wrap_unary(Op::ExprStmt, n),
        };

        match self.current_kind() {
            TokenKind::Newline | TokenKind::Comment => {
                if self.current_kind() == TokenKind::Comment {
                    self.comment = self.index;
                }
                self.advance();
                stmt
            }
            TokenKind::ArgClose
            | TokenKind::Colon
            | TokenKind::Semicolon
            | TokenKind::RightBrace
            | TokenKind::RightParen
            | TokenKind::RightBracket
            | TokenKind::EndOfFile => stmt,
            _ => self.error(ErrorCode::UnrecognizedExpr),
        }
    }

    /// `f(x) = expr` defines a named lambda algorithm; the call node is
    /// repurposed as the parameter list.
    fn named_lambda_stmt(&mut self, call: ParseNode) -> ParseNode {
        self.advance();

        let expr = self.expression();
        if !self.no_errors() {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let body = self.parse_tree.wrap_unary(Op::Return, expr);

        let id = self.parse_tree.arg(call, 0);
        if self.parse_tree.op(id) == Op::SubscriptAccess {
            self.convert_subscript_to_identifier(id);
        }

        let nargs = self.parse_tree.num_args(call) - 1;
        for i in 0..nargs {
            let param = self.parse_tree.arg(call, i + 1);
            let op = self.parse_tree.op(param);
            let valid = op == Op::Identifier
                || (op == Op::Equal && self.parse_tree.op(self.parse_tree.lhs(param)) == Op::Identifier);
            if !valid {
                let sel = self.parse_tree.sel(param);
                let err = self.error_at(ErrorCode::InvalidParameter, sel);
                self.parse_tree.set_arg(call, i + 1, err);
            }
        }

        // Repurpose the call node as the parameter list
        let params = call;
        for i in 0..nargs {
            let arg = self.parse_tree.arg(call, i + 1);
            self.parse_tree.set_arg(params, i, arg);
        }
        self.parse_tree.reduce_num_args(params, nargs);
        self.parse_tree.set_op(params, Op::List);

        let sel = Selection::new(self.parse_tree.left(id), self.parse_tree.right(body));
        self.parse_tree
            .add_node(Op::Algorithm, sel, &[NONE, NONE, params, body, id])
    }

    /// `x_1` style subscript access treated as a single identifier name.
    fn convert_subscript_to_identifier(&mut self, pn: ParseNode) {
        let base = self.parse_tree.lhs(pn);
        let script = self.parse_tree.rhs(pn);
        let base_name = self.parse_tree.name(base);
        let script_sel = self.parse_tree.sel(script);
        let compound = format!(
            "{}_{}",
            self.program.interner.resolve(base_name),
            self.program.selection_text(&script_sel)
        );
        let name = self.program.interner.intern(&compound);
        self.parse_tree.set_op(pn, Op::Identifier);
        self.parse_tree.reduce_num_args(pn, 0);
        self.parse_tree.set_name(pn, name);
    }

    fn assignment(&mut self, lhs: ParseNode) -> ParseNode {
        self.advance();
        let rhs = self.expression();
        let pn = self.parse_tree.add_node_span(Op::Assign, &[lhs, rhs]);
        if self.peek(TokenKind::Comment) {
            self.comment = self.index;
            self.advance();
        }
        self.attach_comment(lhs);
        pn
    }

    fn equality(&mut self, lhs: ParseNode) -> ParseNode {
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(lhs);

        loop {
            self.advance();
            let rhs = self.expression();
            self.parse_tree.add_nary_child(rhs);
            if !self.peek(TokenKind::Equals) {
                break;
            }
        }

        let pn = self.parse_tree.finish_nary_span(Op::Equal);
        if self.peek(TokenKind::Comment) {
            self.comment = self.index;
            self.advance();
        }
        self.attach_comment(lhs);
        pn
    }

    // Expressions -----------------------------------------------------------

    fn expression(&mut self) -> ParseNode {
        self.addition()
    }

    fn disjunction(&mut self) -> ParseNode {
        let mut n = self.conjunction();
        while self.match_kind(TokenKind::Disjunction) {
            let rhs = self.conjunction();
            n = self.parse_tree.add_node_span(Op::LogicalOr, &[n, rhs]);
        }
        n
    }

    fn conjunction(&mut self) -> ParseNode {
        let mut n = self.comparison();
        while self.match_kind(TokenKind::Conjunction) {
            let rhs = self.comparison();
            n = self.parse_tree.add_node_span(Op::LogicalAnd, &[n, rhs]);
        }
        n
    }

    fn comparison(&mut self) -> ParseNode {
        let n = self.addition();

        use TokenKind::*;
        match self.current_kind() {
            Equals => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::Equal, &[n, rhs])
            }
            NotEqual => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::NotEqual, &[n, rhs])
            }
            Approx => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::Approx, &[n, rhs])
            }
            NotApprox => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::NotApprox, &[n, rhs])
            }
            Member => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::Member, &[n, rhs])
            }
            NotMember => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::NotMember, &[n, rhs])
            }
            Subset => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::Subset, &[n, rhs])
            }
            SubsetEq => {
                self.advance();
                let rhs = self.addition();
                self.parse_tree.add_node_span(Op::SubsetEq, &[n, rhs])
            }
            Less => self.less_chain(n, 0),
            LessEqual => self.less_chain(n, 1),
            Greater => self.greater_chain(n, 0),
            GreaterEqual => self.greater_chain(n, 1),
            _ => n,
        }
    }

    /// Comparison chains build one n-ary node; bit i of the flag records
    /// whether step i is inclusive.
    fn less_chain(&mut self, first: ParseNode, mut flag: usize) -> ParseNode {
        self.advance();
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(first);
        let operand = self.addition();
        self.parse_tree.add_nary_child(operand);
        let mut comparisons = 1;

        loop {
            if self.match_kind(TokenKind::LessEqual) {
                flag |= 1 << comparisons;
            } else if !self.match_kind(TokenKind::Less) {
                let pn = self.parse_tree.finish_nary_span(Op::Less);
                self.parse_tree.set_flag(pn, flag);
                return pn;
            }
            comparisons += 1;
            let operand = self.addition();
            self.parse_tree.add_nary_child(operand);
        }
    }

    fn greater_chain(&mut self, first: ParseNode, mut flag: usize) -> ParseNode {
        self.advance();
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(first);
        let operand = self.addition();
        self.parse_tree.add_nary_child(operand);
        let mut comparisons = 1;

        loop {
            if self.match_kind(TokenKind::GreaterEqual) {
                flag |= 1 << comparisons;
            } else if !self.match_kind(TokenKind::Greater) {
                let pn = self.parse_tree.finish_nary_span(Op::Greater);
                self.parse_tree.set_flag(pn, flag);
                return pn;
            }
            comparisons += 1;
            let operand = self.addition();
            self.parse_tree.add_nary_child(operand);
        }
    }

    fn addition(&mut self) -> ParseNode {
        let mut n = self.multiplication();
        loop {
            let op = match self.current_kind() {
                TokenKind::Plus => Op::Addition,
                TokenKind::Minus => Op::Subtraction,
                TokenKind::Cup => Op::Union,
                TokenKind::Cap => Op::Intersection,
                _ => return n,
            };
            self.advance();
            let rhs = self.multiplication();
            n = self.parse_tree.add_node_span(op, &[n, rhs]);
        }
    }

    fn multiplication(&mut self) -> ParseNode {
        let mut n = self.left_unary();
        loop {
            let op = match self.current_kind() {
                TokenKind::Multiply => Op::Multiplication,
                TokenKind::DotProduct => Op::Dot,
                TokenKind::Divide => Op::Division,
                TokenKind::Forwardslash => Op::Division,
                TokenKind::Backslash => Op::LinearSolve,
                TokenKind::Times => Op::Cross,
                TokenKind::Percent => Op::Modulus,
                TokenKind::OuterProduct => Op::OuterProduct,
                TokenKind::ODot => Op::EntrywiseProduct,
                TokenKind::Composition => Op::Composition,
                _ => return n,
            };
            self.advance();
            let rhs = self.left_unary();
            n = self.parse_tree.add_node_span(op, &[n, rhs]);
        }
    }

    fn left_unary(&mut self) -> ParseNode {
        match self.current_kind() {
            TokenKind::Minus => {
                let m = self.l_mark();
                self.advance();
                let operand = self.implicit_mult();
                self.parse_tree.add_left_unary(Op::UnaryMinus, m, operand)
            }
            TokenKind::Not => {
                let m = self.l_mark();
                self.advance();
                let operand = self.implicit_mult();
                self.parse_tree.add_left_unary(Op::LogicalNot, m, operand)
            }
            TokenKind::Pound => {
                let m = self.l_mark();
                self.advance();
                let operand = self.implicit_mult();
                self.parse_tree.add_left_unary(Op::Cardinality, m, operand)
            }
            TokenKind::Nabla => {
                let m = self.l_mark();
                self.advance();
                let op = if self.match_kind(TokenKind::DotProduct) {
                    Op::Divergence
                } else if self.match_kind(TokenKind::Times) {
                    Op::Curl
                } else {
                    Op::Gradient
                };
                let operand = self.implicit_mult();
                self.parse_tree.add_left_unary(op, m, operand)
            }
            _ => self.implicit_mult(),
        }
    }

    fn starts_implicit_factor(kind: TokenKind) -> bool {
        use TokenKind::*;
        matches!(
            kind,
            Identifier
                | ConstructFraction
                | ConstructSqrt
                | ConstructNRoot
                | ConstructMatrix
                | ConstructBinomial
                | ConstructBigSum
                | ConstructBigProd
                | ConstructDefiniteIntegral
                | ConstructIntegral
                | ConstructLimit
                | ConstructAccentHat
                | ConstructAccentBar
                | Sin | Cos | Tan | Arcsin | Arccos | Arctan | Arctan2
                | Csc | Sec | Cot | Arccsc | Arcsec | Arccot
                | Sinh | Cosh | Tanh | Arcsinh | Arccosh | Arctanh
                | Csch | Sech | Coth | Arccsch | Arcsech | Arccoth
                | Exp | NaturalLog | Log | Erf | Erfc | Sgn
                | Length | Rows | Cols
        )
    }

    fn implicit_mult(&mut self) -> ParseNode {
        let n = self.right_unary();

        if Self::starts_implicit_factor(self.current_kind()) {
            return self.collect_implicit_mult(n);
        }
        match self.current_kind() {
            TokenKind::LeftParen => {
                let pn = self.collect_implicit_mult(n);
                if self.parse_tree.op(pn) == Op::ImplicitMultiply
                    && self.parse_tree.num_args(pn) == 1
                {
                    self.parse_tree.child(pn)
                } else {
                    pn
                }
            }
            TokenKind::Integer => self.error(ErrorCode::TrailingConstant),
            _ => n,
        }
    }

    fn collect_implicit_mult(&mut self, n: ParseNode) -> ParseNode {
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(n);

        loop {
            if !self.no_errors() {
                self.parse_tree.cancel_nary();
                return self.parse_tree.add_terminal(Op::Error, self.selection());
            }

            if Self::starts_implicit_factor(self.current_kind()) {
                let factor = self.right_unary();
                self.parse_tree.add_nary_child(factor);
            } else if self.peek(TokenKind::LeftParen) {
                let head = self.parse_tree.pop_nary_child();
                let applied = self.call_or_mult(head);
                self.parse_tree.add_nary_child(applied);
            } else if self.peek(TokenKind::Integer) {
                self.parse_tree.cancel_nary();
                return self.error(ErrorCode::TrailingConstant);
            } else {
                let pn = self.parse_tree.finish_nary_span(Op::ImplicitMultiply);
                if self.parse_tree.num_args(pn) == 1 {
                    return self.parse_tree.child(pn);
                }
                return pn;
            }
        }
    }

    fn call_or_mult(&mut self, n: ParseNode) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        if self.match_kind(TokenKind::RightParen) {
            let right = self.r_mark_prev();
            self.register_grouping(left, right);
            return self.parse_tree.add_right_unary(Op::Call, right, n);
        }

        let parenthetical = self.disjunction();
        if self.match_kind(TokenKind::RightParen) {
            let right = self.r_mark_prev();
            self.register_grouping(left, right);

            let post_high_prec = self.right_unary_on(parenthetical);
            let op = if post_high_prec == parenthetical {
                Op::Call
            } else {
                Op::AmbiguousParenthetical
            };

            let sel = Selection::new(self.parse_tree.left(n), right);
            return self.parse_tree.add_node(op, sel, &[n, post_high_prec]);
        }

        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(n);
        self.parse_tree.add_nary_child(parenthetical);

        while !self.match_kind(TokenKind::RightParen) && self.no_errors() {
            if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
                break;
            }
            let arg = self.disjunction();
            self.parse_tree.add_nary_child(arg);
        }

        if !self.no_errors() {
            self.parse_tree.cancel_nary();
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }

        let right = self.r_mark_prev();
        self.register_grouping(left, right);
        let sel = Selection::new(self.parse_tree.left(n), right);
        self.parse_tree.finish_nary(Op::Call, sel)
    }

    fn right_unary(&mut self) -> ParseNode {
        let primary = self.primary();
        self.right_unary_on(primary)
    }

    fn right_unary_on(&mut self, mut n: ParseNode) -> ParseNode {
        loop {
            match self.current_kind() {
                TokenKind::Exclam => {
                    let m = self.r_mark();
                    self.advance();
                    return self.parse_tree.add_right_unary(Op::Factorial, m, n);
                }
                TokenKind::Caret => {
                    self.advance();
                    let exponent = self.implicit_mult();
                    return self.parse_tree.add_node_span(Op::Power, &[n, exponent]);
                }
                TokenKind::ConstructSuperscript => n = self.superscript(n),
                TokenKind::ConstructSubscript => n = self.subscript(n),
                TokenKind::ConstructDualscript => n = self.dualscript(n),
                TokenKind::Period => {
                    self.advance();
                    if !self.peek(TokenKind::Identifier) {
                        let m = self.r_mark_prev();
                        let sel = Selection::new(m, m);
                        let blank = self.parse_tree.add_terminal(Op::Error, sel);
                        if self.no_errors() {
                            self.program.fail(sel, ErrorCode::TrailingDot);
                        }
                        n = self.parse_tree.add_node_span(Op::ScopeAccess, &[n, blank]);
                        continue;
                    }
                    let member = self.identifier();
                    n = self.parse_tree.add_node_span(Op::ScopeAccess, &[n, member]);
                }
                _ => return n,
            }
        }
    }

    /// Superscript construct: transpose, adjoint, pseudo-inverse, or power.
    fn superscript(&mut self, lhs: ParseNode) -> ParseNode {
        let right = self.r_mark();
        self.advance();

        let n = match self.current_kind() {
            TokenKind::Identifier if self.lookahead(TokenKind::ArgClose) => {
                let text = self.program.selection_text(&self.selection()).to_string();
                match text.as_str() {
                    "T" => {
                        self.advance();
                        self.parse_tree.add_right_unary(Op::Transpose, right, lhs)
                    }
                    "†" | "H" => {
                        self.advance();
                        self.parse_tree.add_right_unary(Op::Adjoint, right, lhs)
                    }
                    _ => {
                        let exponent = self.expression();
                        self.parse_tree.add_node_span(Op::Power, &[lhs, exponent])
                    }
                }
            }
            TokenKind::Plus if self.lookahead(TokenKind::ArgClose) => {
                self.advance();
                self.parse_tree.add_right_unary(Op::PseudoInverse, right, lhs)
            }
            _ => {
                let exponent = self.expression();
                self.parse_tree.add_node_span(Op::Power, &[lhs, exponent])
            }
        };
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        n
    }

    /// Subscript construct: one or two indices / slices. The lexical pass
    /// may later reinterpret `id_script` as a compound identifier.
    fn subscript(&mut self, lhs: ParseNode) -> ParseNode {
        self.advance();
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(lhs);
        loop {
            let item = self.subscript_item();
            self.parse_tree.add_nary_child(item);
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        let right = self.r_mark();
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        let sel = Selection::new(self.parse_tree.left(lhs), right);
        self.parse_tree.finish_nary(Op::SubscriptAccess, sel)
    }

    fn subscript_item(&mut self) -> ParseNode {
        // Forms: expr | : | expr:expr | :expr | expr: | expr:expr:step
        let first = if self.peek(TokenKind::Colon) {
            self.make_terminal(Op::SliceAll)
        } else {
            let expr = self.expression();
            if !self.peek(TokenKind::Colon) {
                return expr;
            }
            expr
        };
        self.advance(); // the ':'

        let second = if matches!(
            self.current_kind(),
            TokenKind::Colon | TokenKind::ArgClose | TokenKind::Comma
        ) {
            self.make_terminal(Op::SliceAll)
        } else {
            self.expression()
        };

        if self.match_kind(TokenKind::Colon) {
            let step = self.expression();
            self.parse_tree.add_node_span(Op::Slice, &[first, second, step])
        } else {
            self.parse_tree.add_node_span(Op::Slice, &[first, second])
        }
    }

    fn dualscript(&mut self, lhs: ParseNode) -> ParseNode {
        let right = self.r_mark();
        self.advance();
        // Subscript argument
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(lhs);
        loop {
            let item = self.subscript_item();
            self.parse_tree.add_nary_child(item);
            if !self.match_kind(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        let sel = Selection::new(self.parse_tree.left(lhs), right);
        let subscripted = self.parse_tree.finish_nary(Op::SubscriptAccess, sel);

        // Superscript argument
        let n = match self.current_kind() {
            TokenKind::Identifier if self.lookahead(TokenKind::ArgClose) => {
                let text = self.program.selection_text(&self.selection()).to_string();
                if text == "T" {
                    self.advance();
                    self.parse_tree.add_right_unary(Op::Transpose, right, subscripted)
                } else {
                    let exponent = self.expression();
                    self.parse_tree
                        .add_node_span(Op::Power, &[subscripted, exponent])
                }
            }
            _ => {
                let exponent = self.expression();
                self.parse_tree
                    .add_node_span(Op::Power, &[subscripted, exponent])
            }
        };
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        n
    }

    fn primary(&mut self) -> ParseNode {
        use TokenKind::*;
        match self.current_kind() {
            Integer => self.integer(),
            Identifier => self.identifier(),
            StringLiteral => self.string(),
            TrueLiteral => self.terminal_and_advance(Op::True),
            FalseLiteral => self.terminal_and_advance(Op::False),
            Infinity => self.terminal_and_advance(Op::Infinity),
            EmptySet => self.terminal_and_advance(Op::EmptySet),
            PoundSterling => self.terminal_and_advance(Op::CurrencyPounds),
            Euro => self.terminal_and_advance(Op::CurrencyEuros),
            Dollar => self.terminal_and_advance(Op::CurrencyDollars),

            DoublestruckR => self.set_with_signs(Op::Reals, Op::PositiveReals, Op::NegativeReals),
            DoublestruckQ => {
                self.set_with_signs(Op::Rationals, Op::PositiveRationals, Op::NegativeRationals)
            }
            DoublestruckZ => self.terminal_and_advance(Op::Integers),
            DoublestruckN => self.terminal_and_advance(Op::Naturals),
            DoublestruckC => self.terminal_and_advance(Op::ComplexNums),
            DoublestruckB => self.terminal_and_advance(Op::Booleans),
            DoublestruckP => self.terminal_and_advance(Op::Primes),
            DoublestruckH => self.terminal_and_advance(Op::Quaternions),
            SpecialOrthogonal => self.one_arg_require_paren(Op::SpecialOrthogonal),

            LeftParen => self.paren_grouping(),
            LeftBracket => self.brace_grouping(),
            LeftBrace => self.set(),
            LeftCeil => self.grouping(Op::Ceil, RightCeil, ErrorCode::ExpectRightParen),
            LeftFloor => self.grouping(Op::Floor, RightFloor, ErrorCode::ExpectRightParen),
            Bar => self.grouping(Op::Abs, Bar, ErrorCode::ExpectRightParen),
            DoubleBar => self.norm(),
            LeftAngle => self.inner_product(),
            LeftDoubleBrace => self.integer_range(),

            ConstructFraction => self.fraction(),
            ConstructBinomial => self.binomial(),
            ConstructMatrix => self.matrix(),
            ConstructCases => self.cases(),
            ConstructSqrt => self.square_root(),
            ConstructNRoot => self.n_root(),
            ConstructLimit => self.limit(),
            ConstructIntegral => self.indefinite_integral(),
            ConstructDefiniteIntegral => self.definite_integral(),
            ConstructBigSum0 | ConstructBigProd0 => self.error(ErrorCode::EmptyBigSymbol),
            ConstructBigSum => self.big(Op::Summation),
            ConstructBigProd => self.big(Op::Product),
            ConstructAccentHat => self.one_arg_construct(Op::AccentHat),
            ConstructAccentBar => self.one_arg_construct(Op::AccentBar),

            Sgn => self.one_arg(Op::SignFunction),
            Length => self.one_arg(Op::Length),
            Rows => self.one_arg(Op::RowsFn),
            Cols => self.one_arg(Op::ColsFn),
            Sin => self.trig(Op::Sine),
            Cos => self.trig(Op::Cosine),
            Tan => self.trig(Op::Tangent),
            Arcsin => self.trig(Op::Arcsine),
            Arccos => self.trig(Op::Arccosine),
            Arctan => self.trig(Op::Arctangent),
            Arctan2 => self.two_args(Op::Arctangent2),
            Csc => self.trig(Op::Cosecant),
            Sec => self.trig(Op::Secant),
            Cot => self.trig(Op::Cotangent),
            Arccsc => self.trig(Op::Arccosecant),
            Arcsec => self.trig(Op::Arcsecant),
            Arccot => self.trig(Op::Arccotangent),
            Sinh => self.trig(Op::HyperbolicSine),
            Cosh => self.trig(Op::HyperbolicCosine),
            Tanh => self.trig(Op::HyperbolicTangent),
            Arcsinh => self.trig(Op::HyperbolicArcsine),
            Arccosh => self.trig(Op::HyperbolicArccosine),
            Arctanh => self.trig(Op::HyperbolicArctangent),
            Csch => self.trig(Op::HyperbolicCosecant),
            Sech => self.trig(Op::HyperbolicSecant),
            Coth => self.trig(Op::HyperbolicCotangent),
            Arccsch => self.trig(Op::HyperbolicArccosecant),
            Arcsech => self.trig(Op::HyperbolicArcsecant),
            Arccoth => self.trig(Op::HyperbolicArccotangent),
            Exp => self.one_arg(Op::Exp),
            NaturalLog => self.one_arg(Op::NaturalLog),
            Log => self.log(),
            Erf => self.one_arg(Op::ErrorFunction),
            Erfc => self.one_arg(Op::CompErrFunc),

            Gravity => self.terminal_and_advance(Op::Gravity),

            ArgClose => {
                let m = self.l_mark();
                self.error_at(ErrorCode::ExpectedPrimary, Selection::new(m, m))
            }
            _ => self.error(ErrorCode::ExpectedPrimary),
        }
    }

    fn integer(&mut self) -> ParseNode {
        let text = self.program.selection_text(&self.selection()).to_string();
        let value: f64 = text.parse().unwrap_or(f64::NAN);
        let op = if text.contains('.') {
            Op::DecimalLiteral
        } else {
            Op::IntegerLiteral
        };
        let pn = self.terminal_and_advance(op);
        self.parse_tree.set_double(pn, value);
        pn
    }

    fn identifier(&mut self) -> ParseNode {
        let name = self.intern_current();
        let pn = self.terminal_and_advance(Op::Identifier);
        self.parse_tree.set_name(pn, name);
        pn
    }

    fn isolated_identifier(&mut self) -> ParseNode {
        if !self.peek(TokenKind::Identifier) {
            return self.error(ErrorCode::ExpectedPrimary);
        }
        self.identifier()
    }

    fn string(&mut self) -> ParseNode {
        let sel = self.selection();
        let quoted = self.program.selection_text(&sel);
        let content = quoted[1..quoted.len() - 1].to_string();
        let pn = self.terminal_and_advance(Op::StringLiteral);
        let index = self.parse_tree.add_string(content);
        self.parse_tree.set_flag(pn, index);
        pn
    }

    fn set_with_signs(&mut self, basic: Op, positive: Op, negative: Op) -> ParseNode {
        let pn = self.terminal_and_advance(basic);
        match self.current_kind() {
            TokenKind::Plus => {
                self.advance();
                self.parse_tree.set_op(pn, positive);
                let right = self.r_mark_prev();
                self.parse_tree.set_right(pn, right);
                pn
            }
            TokenKind::Minus => {
                self.advance();
                self.parse_tree.set_op(pn, negative);
                let right = self.r_mark_prev();
                self.parse_tree.set_right(pn, right);
                pn
            }
            _ => pn,
        }
    }

    fn paren_grouping(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        self.skip_newline();
        let nested = self.disjunction();
        if self.peek(TokenKind::RightParen) {
            let right = self.r_mark();
            self.register_grouping(left, right);
            self.advance();
            let sel = Selection::new(left, right);
            if self.peek(TokenKind::MapsTo) {
                let params = self.parse_tree.add_unary(Op::List, sel, nested);
                return self.lambda(params);
            }
            return self.parse_tree.add_unary(Op::GroupParen, sel, nested);
        }

        // Comma form: only valid as a lambda parameter list
        if !self.peek(TokenKind::Comma) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(nested);
        while self.match_kind(TokenKind::Comma) {
            let item = self.disjunction();
            self.parse_tree.add_nary_child(item);
        }
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            self.parse_tree.cancel_nary();
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(left, right);
        let params = self
            .parse_tree
            .finish_nary(Op::List, Selection::new(left, right));
        if self.peek(TokenKind::MapsTo) {
            self.lambda(params)
        } else {
            self.error(ErrorCode::UnrecognizedExpr)
        }
    }

    fn lambda(&mut self, params: ParseNode) -> ParseNode {
        self.advance();
        let body = self.expression();
        let sel = Selection::new(self.parse_tree.left(params), self.parse_tree.right(body));
        self.parse_tree
            .add_node(Op::Lambda, sel, &[NONE, NONE, params, body])
    }

    /// `{…}` in expression position: empty list, bracketed grouping, list,
    /// or interval.
    fn brace_grouping(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        if self.peek(TokenKind::RightBracket) {
            let right = self.r_mark();
            self.register_grouping(left, right);
            self.advance();
            return self
                .parse_tree
                .add_terminal(Op::List, Selection::new(left, right));
        }

        let nested = self.disjunction();
        if self.peek(TokenKind::RightBracket) {
            let right = self.r_mark();
            self.register_grouping(left, right);
            self.advance();
            return self
                .parse_tree
                .add_unary(Op::GroupBracket, Selection::new(left, right), nested);
        }

        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let end = self.disjunction();

        if self.match_kind(TokenKind::Comma) {
            self.parse_tree.prepare_nary();
            self.parse_tree.add_nary_child(nested);
            self.parse_tree.add_nary_child(end);
            loop {
                let item = self.disjunction();
                self.parse_tree.add_nary_child(item);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
            let right = self.r_mark();
            if !self.match_kind(TokenKind::RightBracket) {
                self.parse_tree.cancel_nary();
                return self.error(ErrorCode::ExpectRightBracket);
            }
            self.register_grouping(left, right);
            return self
                .parse_tree
                .finish_nary(Op::List, Selection::new(left, right));
        }

        // Interval: `{a, b}` closed-closed or `{a, b)` closed-open
        let right = self.r_mark();
        let op = if self.match_kind(TokenKind::RightParen) {
            Op::IntervalCloseOpen
        } else if self.match_kind(TokenKind::RightBracket) {
            Op::IntervalCloseClose
        } else {
            return self.error(ErrorCode::ExpectRightBracket);
        };
        self.register_grouping(left, right);
        self.parse_tree
            .add_node(op, Selection::new(left, right), &[nested, end])
    }

    /// `[…]`: set literal or set-builder.
    fn set(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        if self.peek(TokenKind::RightBrace) {
            let right = self.r_mark();
            self.register_grouping(left, right);
            self.advance();
            return self
                .parse_tree
                .add_terminal(Op::SetLiteral, Selection::new(left, right));
        }

        let first = self.disjunction();
        if self.match_kind(TokenKind::Colon) {
            let predicate = self.disjunction();
            let right = self.r_mark();
            if !self.match_kind(TokenKind::RightBrace) {
                return self.error(ErrorCode::ExpectRightBrace);
            }
            self.register_grouping(left, right);
            return self.parse_tree.add_node(
                Op::SetBuilder,
                Selection::new(left, right),
                &[first, predicate],
            );
        }

        self.parse_tree.prepare_nary();
        self.parse_tree.add_nary_child(first);
        while self.match_kind(TokenKind::Comma) {
            let item = self.disjunction();
            self.parse_tree.add_nary_child(item);
        }
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightBrace) {
            self.parse_tree.cancel_nary();
            return self.error(ErrorCode::ExpectRightBrace);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .finish_nary(Op::SetLiteral, Selection::new(left, right))
    }

    fn grouping(&mut self, op: Op, close: TokenKind, code: ErrorCode) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let nested = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(close) {
            return self.error(code);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .add_unary(op, Selection::new(left, right), nested)
    }

    /// `‖…‖` with an optional subscript selecting the norm kind and the
    /// p-norm value.
    fn norm(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let nested = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::DoubleBar) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(left, right);
        let sel = Selection::new(left, right);

        if self.peek(TokenKind::ConstructSubscript) {
            self.advance();
            let pn = match self.current_kind() {
                TokenKind::Integer
                    if self.program.selection_text(&self.selection()) == "1"
                        && self.lookahead(TokenKind::ArgClose) =>
                {
                    self.advance();
                    self.parse_tree.add_unary(Op::Norm1, sel, nested)
                }
                TokenKind::Infinity if self.lookahead(TokenKind::ArgClose) => {
                    self.advance();
                    self.parse_tree.add_unary(Op::NormInfinity, sel, nested)
                }
                _ => {
                    let p = self.expression();
                    self.parse_tree.add_node(Op::NormP, sel, &[nested, p])
                }
            };
            self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
            return pn;
        }

        self.parse_tree.add_unary(Op::Norm, sel, nested)
    }

    /// `⟨u|v⟩`
    fn inner_product(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let lhs = self.addition();
        if !self.consume(TokenKind::Bar, ErrorCode::ExpectedPrimary) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let rhs = self.addition();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightAngle) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .add_node(Op::InnerProduct, Selection::new(left, right), &[lhs, rhs])
    }

    /// `⟦a, b⟧`
    fn integer_range(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let lo = self.addition();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let hi = self.addition();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightDoubleBrace) {
            return self.error(ErrorCode::ExpectRightBrace);
        }
        self.register_grouping(left, right);
        self.parse_tree
            .add_node(Op::IntegerRange, Selection::new(left, right), &[lo, hi])
    }

    // Constructs ------------------------------------------------------------

    fn construct_arg(&mut self) -> ParseNode {
        let arg = self.expression();
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        arg
    }

    fn fraction(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        // A numerator of `d` or `∂` makes the fraction a derivative
        if self.peek(TokenKind::Identifier) && self.lookahead(TokenKind::ArgClose) {
            let text = self.program.selection_text(&self.selection()).to_string();
            if text == "d" || text == "∂" {
                let op = if text == "d" { Op::Derivative } else { Op::Partial };
                return self.fraction_derivative(left, op, &text);
            }
        }

        let numerator = self.construct_arg();
        let denominator = self.construct_arg();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::Division, sel, &[numerator, denominator])
    }

    fn fraction_derivative(&mut self, left: Marker, op: Op, leader: &str) -> ParseNode {
        self.advance();
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);

        if !self.peek(TokenKind::Identifier) {
            return self.error(ErrorCode::ExpectedPrimary);
        }
        let denom_sel = self.selection();
        let text = self.program.selection_text(&denom_sel).to_string();
        if !text.starts_with(leader) || text.len() == leader.len() {
            return self.error(ErrorCode::ExpectedPrimary);
        }
        self.advance();
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);

        let var_sel = Selection::from_span(
            denom_sel.model,
            denom_sel.start + leader.len(),
            denom_sel.end,
        );
        let var_name = self.program.intern_selection(&var_sel);
        let decl = self.parse_tree.add_terminal(Op::Identifier, var_sel);
        self.parse_tree.set_name(decl, var_name);
        let previous = self.parse_tree.add_terminal(Op::Identifier, var_sel);
        self.parse_tree.set_name(previous, var_name);

        let expr = self.implicit_mult();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_node(op, sel, &[expr, decl, previous])
    }

    fn binomial(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let n = self.construct_arg();
        let k = self.construct_arg();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_node(Op::Binomial, sel, &[n, k])
    }

    fn matrix(&mut self) -> ParseNode {
        let left = self.l_mark();
        let rows = self.current_token().rows as usize;
        let cols = self.current_token().cols as usize;
        self.advance();

        if rows * cols == 1 {
            let arg = self.construct_arg();
            let sel = self.parse_tree.sel(arg);
            let _ = arg;
            return self.error_at(ErrorCode::ScalarMatrix, sel);
        }

        self.parse_tree.prepare_nary();
        for _ in 0..rows * cols {
            let entry = self.construct_arg();
            self.parse_tree.add_nary_child(entry);
            if !self.no_errors() {
                self.parse_tree.cancel_nary();
                return self.parse_tree.add_terminal(Op::Error, self.selection());
            }
        }
        let sel = Selection::new(left, self.r_mark_prev());
        let pn = self.parse_tree.finish_nary(Op::Matrix, sel);
        self.parse_tree.set_flag(pn, rows);
        pn
    }

    fn cases(&mut self) -> ParseNode {
        let left = self.l_mark();
        let rows = self.current_token().rows as usize;
        self.advance();

        self.parse_tree.prepare_nary();
        for _ in 0..rows {
            let value = self.construct_arg();
            self.parse_tree.add_nary_child(value);
            let condition = self.construct_arg();
            self.parse_tree.add_nary_child(condition);
            if !self.no_errors() {
                self.parse_tree.cancel_nary();
                return self.parse_tree.add_terminal(Op::Error, self.selection());
            }
        }
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.finish_nary(Op::Cases, sel)
    }

    fn square_root(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let radicand = self.construct_arg();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_unary(Op::Sqrt, sel, radicand)
    }

    fn n_root(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let degree = self.construct_arg();
        let radicand = self.construct_arg();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::NRoot, sel, &[degree, radicand])
    }

    fn limit(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let var = self.isolated_identifier();
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        let approach = self.construct_arg();
        let body = self.implicit_mult();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree
            .add_node(Op::Limit, sel, &[var, approach, body])
    }

    fn indefinite_integral(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let body = self.implicit_mult();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_unary(Op::Integral, sel, body)
    }

    fn definite_integral(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let lo = self.construct_arg();
        let hi = self.construct_arg();
        let kernel = self.implicit_mult();
        let sel = Selection::new(left, self.r_mark_prev());

        let (var, kernel) = self.split_differential(kernel);
        match var {
            Some(var) => self
                .parse_tree
                .add_node(Op::DefiniteIntegral, sel, &[var, hi, lo, kernel]),
            None => self.error_at(ErrorCode::ExpectedPrimary, sel),
        }
    }

    /// Split the trailing differential (`dx`) off an integral kernel.
    fn split_differential(&mut self, kernel: ParseNode) -> (Option<ParseNode>, ParseNode) {
        let make_var = |parser: &mut Self, ident: ParseNode| -> Option<ParseNode> {
            let sel = parser.parse_tree.sel(ident);
            let text = parser.program.selection_text(&sel).to_string();
            if text.len() > 1 && text.starts_with('d') {
                let var_sel = Selection::from_span(sel.model, sel.start + 1, sel.end);
                let name = parser.program.intern_selection(&var_sel);
                let var = parser.parse_tree.add_terminal(Op::Identifier, var_sel);
                parser.parse_tree.set_name(var, name);
                Some(var)
            } else {
                None
            }
        };

        if self.parse_tree.op(kernel) == Op::ImplicitMultiply {
            let n = self.parse_tree.num_args(kernel);
            let last = self.parse_tree.arg(kernel, n - 1);
            if self.parse_tree.op(last) == Op::Identifier {
                if let Some(var) = make_var(self, last) {
                    if n == 2 {
                        return (Some(var), self.parse_tree.arg(kernel, 0));
                    }
                    self.parse_tree.reduce_num_args(kernel, n - 1);
                    return (Some(var), kernel);
                }
            }
            (None, kernel)
        } else if self.parse_tree.op(kernel) == Op::Identifier {
            if let Some(var) = make_var(self, kernel) {
                let sel = self.parse_tree.sel(kernel);
                let one = self.parse_tree.make_one(sel);
                return (Some(var), one);
            }
            (None, kernel)
        } else {
            (None, kernel)
        }
    }

    fn big(&mut self, op: Op) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        // Lower bound: `i = start`
        let id = self.isolated_identifier();
        if !(self.match_kind(TokenKind::Equals) || self.match_kind(TokenKind::LeftArrow)) {
            return self.error(ErrorCode::UnrecognizedExpr);
        }
        let start = self.expression();
        let assign = self.parse_tree.add_node_span(Op::Assign, &[id, start]);
        self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);

        let stop = self.construct_arg();
        let body = self.implicit_mult();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_node(op, sel, &[assign, stop, body])
    }

    fn one_arg_construct(&mut self, op: Op) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let arg = self.construct_arg();
        let sel = Selection::new(left, self.r_mark_prev());
        self.parse_tree.add_unary(op, sel, arg)
    }

    // Keyword functions -----------------------------------------------------

    fn one_arg_require_paren(&mut self, op: Op) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let arg = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        self.parse_tree
            .add_unary(op, Selection::new(left, right), arg)
    }

    fn one_arg(&mut self, op: Op) -> ParseNode {
        self.one_arg_require_paren(op)
    }

    fn two_args(&mut self, op: Op) -> ParseNode {
        let left = self.l_mark();
        self.advance();
        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let first = self.disjunction();
        if !self.consume(TokenKind::Comma, ErrorCode::ExpectComma) {
            return self.parse_tree.add_terminal(Op::Error, self.selection());
        }
        let second = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        self.parse_tree
            .add_node(op, Selection::new(left, right), &[first, second])
    }

    /// Trig functions accept a superscript power: `sin²(x)`.
    fn trig(&mut self, op: Op) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        let mut power = NONE;
        if self.peek(TokenKind::ConstructSuperscript) {
            self.advance();
            power = self.expression();
            self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        }

        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let arg = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        let sel = Selection::new(left, right);
        let call = self.parse_tree.add_unary(op, sel, arg);
        if power == NONE {
            call
        } else {
            self.parse_tree.add_node(Op::Power, sel, &[call, power])
        }
    }

    /// `log` with an optional subscript base.
    fn log(&mut self) -> ParseNode {
        let left = self.l_mark();
        self.advance();

        let mut base = NONE;
        if self.peek(TokenKind::ConstructSubscript) {
            self.advance();
            base = self.expression();
            self.consume(TokenKind::ArgClose, ErrorCode::ExpectArgClose);
        }

        let group_l = self.l_mark();
        if !self.match_kind(TokenKind::LeftParen) {
            return self.error(ErrorCode::ExpectLeftParen);
        }
        let arg = self.disjunction();
        let right = self.r_mark();
        if !self.match_kind(TokenKind::RightParen) {
            return self.error(ErrorCode::ExpectRightParen);
        }
        self.register_grouping(group_l, right);
        let sel = Selection::new(left, right);
        if base == NONE {
            self.parse_tree.add_unary(Op::Log, sel, arg)
        } else {
            self.parse_tree.add_node(Op::LogBase, sel, &[arg, base])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;
    use std::path::PathBuf;

    fn parse(source: &str) -> (Program, ParseTree) {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("test.nte"), source)
            .model()
            .expect("valid serial");
        let tokens = Scanner::new(&mut program, id).scan_all();
        let mut parser = Parser::new(&mut program, id, tokens);
        parser.parse_all();
        let tree = std::mem::take(&mut parser.parse_tree);
        (program, tree)
    }

    #[test]
    fn parses_assignment() {
        let (program, tree) = parse("x ← 3\nprint(x)");
        assert!(program.no_errors());
        let root = tree.root;
        assert_eq!(tree.op(root), Op::Block);
        assert_eq!(tree.num_args(root), 2);
        assert_eq!(tree.op(tree.arg(root, 0)), Op::Assign);
        assert_eq!(tree.op(tree.arg(root, 1)), Op::Print);
    }

    #[test]
    fn sole_expression_becomes_print() {
        let (program, tree) = parse("1 + 2");
        assert!(program.no_errors());
        let stmt = tree.child(tree.root);
        assert_eq!(tree.op(stmt), Op::Print);
        assert_eq!(tree.op(tree.child(stmt)), Op::Addition);
    }

    #[test]
    fn precedence_mul_binds_tighter_than_add() {
        let (_, tree) = parse("x ← 1 + 2 * 3");
        let assign = tree.child(tree.root);
        let sum = tree.rhs(assign);
        assert_eq!(tree.op(sum), Op::Addition);
        assert_eq!(tree.op(tree.rhs(sum)), Op::Multiplication);
    }

    #[test]
    fn comparison_chain_is_nary_with_mask() {
        let (_, tree) = parse("y ← 1 < 2 <= 3 < 4");
        let assign = tree.child(tree.root);
        let chain = tree.rhs(assign);
        assert_eq!(tree.op(chain), Op::Less);
        assert_eq!(tree.num_args(chain), 4);
        // second step inclusive: bit 1 set
        assert_eq!(tree.flag(chain) & 0b10, 0b10);
        assert_eq!(tree.flag(chain) & 0b101, 0);
    }

    #[test]
    fn equals_statement_is_const_definition() {
        let (program, tree) = parse("y = 4");
        assert!(program.no_errors());
        let stmt = tree.child(tree.root);
        assert_eq!(tree.op(stmt), Op::Equal);
    }

    #[test]
    fn named_lambda_is_rewritten_to_algorithm() {
        let (program, tree) = parse("f(x) = x * x\nprint(f(3))");
        assert!(program.no_errors());
        let alg = tree.arg(tree.root, 0);
        assert_eq!(tree.op(alg), Op::Algorithm);
        let params = tree.param_list(alg);
        assert_eq!(tree.op(params), Op::List);
        assert_eq!(tree.num_args(params), 1);
        assert_eq!(tree.op(tree.body(alg)), Op::Return);
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let (program, _) = parse("break");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::BadBreak
        );
    }

    #[test]
    fn while_loop_allows_break() {
        let (program, _) = parse("while(true) {\nbreak\n}");
        assert!(program.no_errors());
    }

    #[test]
    fn ranged_for_requires_identifier() {
        let (program, _) = parse("for(2 : v) {\nprint(2)\n}");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::BadRangedForVar
        );
    }

    #[test]
    fn c_style_for_has_four_children() {
        let (program, tree) = parse("for(i ← 0; i < 3; i ← i + 1) {\nprint(i)\n}");
        assert!(program.no_errors());
        let for_node = tree.child(tree.root);
        assert_eq!(tree.op(for_node), Op::For);
        assert_eq!(tree.num_args(for_node), 4);
    }

    #[test]
    fn switch_collects_cases() {
        let (program, tree) =
            parse("switch(2) {\ncase 1:\nprint(1)\ncase 2:\nprint(2)\ndefault:\nprint(3)\n}");
        assert!(program.no_errors());
        let switch = tree.child(tree.root);
        assert_eq!(tree.op(switch), Op::Switch);
        assert_eq!(tree.num_args(switch), 4);
        assert_eq!(tree.op(tree.arg(switch, 1)), Op::Case);
        assert_eq!(tree.op(tree.arg(switch, 3)), Op::Default);
    }

    #[test]
    fn fallthrough_case_has_no_codepath() {
        let (_, tree) = parse("switch(2) {\ncase 1:\ncase 2:\nprint(2)\n}");
        let switch = tree.child(tree.root);
        let first_case = tree.arg(switch, 1);
        assert_eq!(tree.rhs(first_case), NONE);
    }

    #[test]
    fn matrix_construct_parses_entries() {
        let serial = format!("A ← {}", crate::serial::matrix(2, 2, &["1", "2", "3", "4"]));
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let assign = tree.child(tree.root);
        let matrix = tree.rhs(assign);
        assert_eq!(tree.op(matrix), Op::Matrix);
        assert_eq!(tree.num_args(matrix), 4);
        assert_eq!(tree.flag(matrix), 2);
    }

    #[test]
    fn scalar_matrix_is_an_error() {
        let serial = format!("A ← {}", crate::serial::matrix(1, 1, &["1"]));
        let (program, _) = parse(&serial);
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::ScalarMatrix
        );
    }

    #[test]
    fn fraction_parses_as_division() {
        let serial = format!(
            "x ← {}",
            crate::serial::binary(crate::serial::KEY_FRACTION, "1", "2")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let assign = tree.child(tree.root);
        assert_eq!(tree.op(tree.rhs(assign)), Op::Division);
    }

    #[test]
    fn derivative_fraction_is_recognised() {
        let serial = format!(
            "y ← {} x",
            crate::serial::binary(crate::serial::KEY_FRACTION, "d", "dx")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let assign = tree.child(tree.root);
        let deriv = tree.rhs(assign);
        assert_eq!(tree.op(deriv), Op::Derivative);
        assert_eq!(tree.num_args(deriv), 3);
    }

    #[test]
    fn empty_big_symbol_is_an_error() {
        let serial = format!("y ← {}S x", crate::serial::CONSTRUCT);
        let (program, _) = parse(&serial);
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::EmptyBigSymbol
        );
    }

    #[test]
    fn big_sum_parses_bounds_and_body() {
        let serial = format!(
            "y ← {}k",
            crate::serial::binary(crate::serial::KEY_BIG_SUM, "k = 1", "10")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors(), "{:?}", program.error_stream.errors.first().map(|e| e.code));
        let assign = tree.child(tree.root);
        let sum = tree.rhs(assign);
        assert_eq!(tree.op(sum), Op::Summation);
        assert_eq!(tree.op(tree.arg(sum, 0)), Op::Assign);
    }

    #[test]
    fn implicit_multiplication_collects_factors() {
        let (program, tree) = parse("a ← 1\nb ← 2\nc ← a b");
        assert!(program.no_errors());
        let third = tree.arg(tree.root, 2);
        let product = tree.rhs(third);
        assert_eq!(tree.op(product), Op::ImplicitMultiply);
        assert_eq!(tree.num_args(product), 2);
    }

    #[test]
    fn trailing_constant_is_an_error() {
        let (program, _) = parse("b ← 2\nc ← b 3");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::TrailingConstant
        );
    }

    #[test]
    fn lambda_with_mapsto() {
        let (program, tree) = parse("f ← (x) ↦ x + 1");
        assert!(program.no_errors());
        let assign = tree.child(tree.root);
        let lambda = tree.rhs(assign);
        assert_eq!(tree.op(lambda), Op::Lambda);
        assert_eq!(tree.num_args(tree.param_list(lambda)), 1);
    }

    #[test]
    fn algorithm_statement_parses() {
        let (program, tree) = parse("algorithm f(x, y = 2) {\nreturn x + y\n}");
        assert!(program.no_errors());
        let alg = tree.child(tree.root);
        assert_eq!(tree.op(alg), Op::Algorithm);
        let params = tree.param_list(alg);
        assert_eq!(tree.num_args(params), 2);
        assert_eq!(tree.op(tree.arg(params, 1)), Op::Equal);
    }

    #[test]
    fn import_missing_file_reports_not_found() {
        let (program, _) = parse("import missing_module_xyz");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::FileNotFound
        );
    }

    #[test]
    fn transpose_superscript() {
        let serial = format!(
            "a ← 1\nB ← a{}",
            crate::serial::unary(crate::serial::KEY_SUPERSCRIPT, "T")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let second = tree.arg(tree.root, 1);
        assert_eq!(tree.op(tree.rhs(second)), Op::Transpose);
    }

    #[test]
    fn power_superscript() {
        let serial = format!(
            "a ← 2\nb ← a{}",
            crate::serial::unary(crate::serial::KEY_SUPERSCRIPT, "2")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let second = tree.arg(tree.root, 1);
        assert_eq!(tree.op(tree.rhs(second)), Op::Power);
    }

    #[test]
    fn subscript_access_parses() {
        let serial = format!(
            "v ← 1\nx ← v{}",
            crate::serial::unary(crate::serial::KEY_SUBSCRIPT, "0")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let second = tree.arg(tree.root, 1);
        assert_eq!(tree.op(tree.rhs(second)), Op::SubscriptAccess);
    }

    #[test]
    fn slice_subscript_parses() {
        let serial = format!(
            "v ← 1\nx ← v{}",
            crate::serial::unary(crate::serial::KEY_SUBSCRIPT, "0:2")
        );
        let (program, tree) = parse(&serial);
        assert!(program.no_errors());
        let second = tree.arg(tree.root, 1);
        let access = tree.rhs(second);
        assert_eq!(tree.op(tree.arg(access, 1)), Op::Slice);
    }

    #[test]
    fn unrecognised_statement_is_single_error() {
        let (program, _) = parse("x ← 3 3\ny ← oops oops");
        assert_eq!(program.error_stream.errors.len(), 1);
    }

    #[test]
    fn groupings_are_registered() {
        let (program, _tree) = parse("print(1)");
        assert!(program.no_errors());
    }
}
