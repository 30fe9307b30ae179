//! Symbol-lexical resolution.
//!
//! Walks the parse tree, building the symbol table: declarations,
//! references, lexical scopes, closures with capture lists, namespaces with
//! O(1) re-entry, imports, and scoped accesses. Identifier nodes that fail
//! lookup fall back to the predefined-constants map and then to implicit
//! multiplication over their grapheme clusters.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use unicode_segmentation::UnicodeSegmentation;

use crate::errors::ErrorCode;
use crate::intern::Name;
use crate::model::{ModelId, Selection};
use crate::ops::Op;
use crate::parse_tree::{ParseNode, ParseTree, NONE, UNINITIALISED_TYPE};
use crate::program::Program;
use crate::settings::{self, SettingId};
use crate::symbol_table::{SymbolIndex, SymbolTable};

static PREDEF: Lazy<HashMap<&'static str, Op>> = Lazy::new(|| {
    HashMap::from([
        ("π", Op::Pi),
        ("e", Op::EulersNumber),
        ("φ", Op::GoldenRatio),
        ("c", Op::SpeedOfLight),
        ("ℎ", Op::PlanckConstant),
        ("ℏ", Op::ReducedPlanckConstant),
        ("σ", Op::StefanBoltzmannConstant),
        ("I", Op::IdentityAutosize),
        ("g", Op::Gravity),
        ("Γ", Op::GammaFunction),
        ("T", Op::MaybeTranspose),
    ])
});

const GLOBAL_DEPTH: u16 = 0;

pub struct LexicalPass<'p> {
    program: &'p mut Program,
    parse_tree: &'p mut ParseTree,
    pub symbol_table: SymbolTable,
    model: ModelId,
    lexical_depth: u16,
    closure_depth: u8,
    /// Symbols past this index may not appear in default arguments.
    cutoff: usize,
    refs: Vec<SymbolIndex>,
    ref_frames: Vec<usize>,
    processed_refs: Vec<ParseNode>,
    potential_loop_vars: Vec<ParseNode>,
}

impl<'p> LexicalPass<'p> {
    pub fn new(program: &'p mut Program, parse_tree: &'p mut ParseTree, model: ModelId) -> Self {
        LexicalPass {
            program,
            parse_tree,
            symbol_table: SymbolTable::new(),
            model,
            lexical_depth: GLOBAL_DEPTH,
            closure_depth: 0,
            cutoff: usize::MAX,
            refs: Vec::new(),
            ref_frames: Vec::new(),
            processed_refs: Vec::new(),
            potential_loop_vars: Vec::new(),
        }
    }

    /// Run resolution over the whole tree. Runs despite parse errors
    /// because the editor needs the best-effort table.
    pub fn resolve_symbols(mut self) -> SymbolTable {
        let root = self.parse_tree.root;
        if self.parse_tree.is_empty() || root == NONE {
            self.symbol_table
                .reset(crate::model::Marker::new(self.model, 0));
            return self.symbol_table;
        }
        self.symbol_table.reset(self.parse_tree.left(root));
        self.resolve_block(root);
        self.symbol_table.finalize();
        for i in 0..self.processed_refs.len() {
            let pn = self.processed_refs[i];
            let sym = self.parse_tree.flag(pn);
            self.parse_tree.set_sym(pn, sym);
        }
        // The capture emitter borrows symbol types as scratch space
        for sym in &mut self.symbol_table.symbols {
            sym.ty = UNINITIALISED_TYPE;
        }
        self.symbol_table
    }

    // Helpers ---------------------------------------------------------------

    fn error(&mut self, pn: ParseNode, code: ErrorCode) {
        let sel = self.parse_tree.sel(pn);
        self.program.fail(sel, code);
    }

    fn declared(&self, pn: ParseNode) -> bool {
        self.symbol_table
            .lexical_map
            .contains_key(&self.parse_tree.name(pn))
    }

    fn sym_index(&self, pn: ParseNode) -> SymbolIndex {
        self.symbol_table
            .lexical_map
            .get(&self.parse_tree.name(pn))
            .copied()
            .unwrap_or(NONE)
    }

    fn node_text(&self, pn: ParseNode) -> String {
        let sel = self.parse_tree.sel(pn);
        self.program.selection_text(&sel).to_string()
    }

    // Statements ------------------------------------------------------------

    fn resolve_stmt(&mut self, pn: ParseNode) {
        match self.parse_tree.op(pn) {
            Op::Algorithm => self.resolve_algorithm(pn),
            Op::Assign => self.resolve_assignment(pn),
            Op::Block => self.resolve_scoped_block(pn),
            Op::Class => self.resolve_class(pn),
            Op::Equal => self.resolve_equality(pn),
            Op::For => self.resolve_for(pn),
            Op::FromImport => self.resolve_from_import(pn),
            Op::If => self.resolve_conditional1(pn),
            Op::IfElse => self.resolve_conditional2(pn),
            Op::Import => self.resolve_import(pn),
            Op::LexicalScope => self.resolve_lexical_scope(pn),
            Op::Namespace => self.resolve_namespace(pn),
            Op::PrototypeAlg => self.resolve_prototype(pn),
            Op::RangedFor => self.resolve_ranged_for(pn),
            Op::Return | Op::ReturnEmpty => {
                if self.closure_depth == 0 {
                    self.error(pn, ErrorCode::ReturnOutsideFunction);
                }
                self.resolve_default(pn);
            }
            Op::SettingsUpdate => self.resolve_settings_update(pn),
            Op::Switch => self.resolve_switch(pn),
            Op::UnknownList => self.resolve_unknown_declaration(pn),
            Op::While => self.resolve_conditional1(pn),
            _ => self.resolve_default(pn),
        }
    }

    fn resolve_expr(&mut self, pn: ParseNode) {
        match self.parse_tree.op(pn) {
            Op::Identifier => self.resolve_reference(pn, true),
            Op::Lambda => self.resolve_lambda(pn),
            Op::SubscriptAccess => self.resolve_subscript(pn),
            Op::Limit => self.resolve_limit(pn),
            Op::Integral => self.resolve_indefinite_integral(pn),
            Op::DefiniteIntegral => self.resolve_definite_integral(pn),
            Op::Summation | Op::Product => self.resolve_big(pn),
            Op::Derivative | Op::Partial => self.resolve_derivative(pn),
            Op::ScopeAccess => self.resolve_scope_access(pn),
            Op::SetBuilder => self.resolve_set_builder(pn),
            _ => self.resolve_default(pn),
        }
    }

    fn resolve_default(&mut self, pn: ParseNode) {
        for i in 0..self.parse_tree.num_args(pn) {
            let child = self.parse_tree.arg(pn, i);
            if child != NONE {
                self.resolve_expr(child);
            }
        }
    }

    fn resolve_equality(&mut self, pn: ParseNode) {
        if self.parse_tree.num_args(pn) != 2 {
            self.error(pn, ErrorCode::TypeError);
            return;
        }
        let rhs = self.parse_tree.rhs(pn);
        self.resolve_expr(rhs);
        let lhs = self.parse_tree.lhs(pn);
        self.define_local_scope(lhs, true, true);
    }

    fn resolve_assignment(&mut self, pn: ParseNode) {
        let lhs = self.parse_tree.lhs(pn);
        let rhs = self.parse_tree.rhs(pn);

        match self.parse_tree.op(lhs) {
            Op::ScopeAccess => {
                self.resolve_scope_access(lhs);
                self.parse_tree.set_op(pn, Op::Reassign);
                self.resolve_expr(rhs);
            }
            Op::Identifier => {
                self.resolve_assignment_id(pn);
                self.resolve_expr(rhs);
            }
            Op::SubscriptAccess => {
                let compound = self.compound_name(lhs);
                if compound != Name::EMPTY
                    && self.symbol_table.lexical_map.contains_key(&compound)
                {
                    self.convert_to_compound_identifier(lhs, compound);
                    self.resolve_assignment_id(pn);
                    self.resolve_expr(rhs);
                } else {
                    self.parse_tree.set_op(pn, Op::Reassign);
                    self.resolve_assignment_subscript(pn, lhs, rhs);
                }
            }
            _ => self.error(lhs, ErrorCode::AssignToExpression),
        }
    }

    fn resolve_assignment_id(&mut self, pn: ParseNode) {
        let id = self.parse_tree.lhs(pn);
        if self.parse_tree.op(id) != Op::Identifier {
            self.error(id, ErrorCode::NonLvalue);
            return;
        }

        let name = self.parse_tree.name(id);
        match self.symbol_table.lexical_map.get(&name).copied() {
            None => {
                let index = self.symbol_table.add_symbol(
                    self.parse_tree,
                    id,
                    self.lexical_depth,
                    self.closure_depth,
                    NONE,
                    false,
                );
                self.symbol_table.lexical_map.insert(name, index);
            }
            Some(index) => {
                if self.symbol_table.symbols[index].is_const {
                    self.error(id, ErrorCode::ReassignConstant);
                } else {
                    self.symbol_table.symbols[index].is_reassigned = true;
                    self.parse_tree.set_op(pn, Op::Reassign);
                    self.reference_symbol(id, index);
                }
            }
        }
    }

    fn resolve_assignment_subscript(&mut self, pn: ParseNode, lhs: ParseNode, rhs: ParseNode) {
        let id = self.parse_tree.arg(lhs, 0);
        match self.parse_tree.op(id) {
            Op::ScopeAccess => self.resolve_scope_access(id),
            Op::Identifier => {
                let index = self.sym_index(id);
                if index != NONE {
                    self.symbol_table.symbols[index].is_reassigned = true;
                    self.reference_symbol(id, index);
                } else {
                    self.error(id, ErrorCode::BadRead);
                    return;
                }
            }
            _ => {
                self.error(id, ErrorCode::NonLvalue);
                return;
            }
        }

        let mut only_trivial_slice = true;
        debug_assert!(self.potential_loop_vars.is_empty());
        let num_subscripts = self.parse_tree.num_args(lhs) - 1;
        for i in 0..num_subscripts {
            let sub = self.parse_tree.arg(lhs, i + 1);
            let op = self.parse_tree.op(sub);
            if op == Op::Identifier && !self.declared(sub) {
                self.potential_loop_vars.push(sub);
            } else {
                only_trivial_slice &= op == Op::Slice && self.is_trivial_slice(sub);
                self.resolve_expr(sub);
            }
        }

        if !self.potential_loop_vars.is_empty() && only_trivial_slice {
            if num_subscripts > 2 {
                let third = self.parse_tree.arg(lhs, 3);
                self.error(third, ErrorCode::IndexOutOfRange);
                self.potential_loop_vars.clear();
                return;
            }

            self.parse_tree.set_op(pn, Op::ElementwiseAssignment);
            let begin = self.parse_tree.left(pn);
            self.increase_lexical_depth(begin);
            let vars_start = self.symbol_table.symbols.len();
            let loop_vars = std::mem::take(&mut self.potential_loop_vars);
            for &var in &loop_vars {
                self.define_local_scope(var, false, true);
            }
            self.resolve_expr(rhs);

            for (i, &var) in loop_vars.iter().enumerate() {
                let sym = &mut self.symbol_table.symbols[vars_start + i];
                sym.is_ewise_index = true;
                if !sym.is_used {
                    sym.is_used = true;
                    self.error(var, ErrorCode::UnusedElementIndex);
                }
            }

            let end = self.parse_tree.right(pn);
            self.decrease_lexical_depth(end);
        } else if !self.potential_loop_vars.is_empty() {
            let vars = std::mem::take(&mut self.potential_loop_vars);
            for var in vars {
                self.error(var, ErrorCode::BadReadOrSubscript);
            }
        } else {
            self.resolve_expr(rhs);
        }
    }

    fn is_trivial_slice(&self, sub: ParseNode) -> bool {
        (0..self.parse_tree.num_args(sub))
            .all(|i| self.parse_tree.op(self.parse_tree.arg(sub, i)) == Op::SliceAll)
    }

    // References ------------------------------------------------------------

    fn reference_symbol(&mut self, pn: ParseNode, sym_id: SymbolIndex) {
        if sym_id >= self.cutoff {
            self.error(pn, ErrorCode::BadDefaultArg);
        }
        self.symbol_table
            .resolve_reference(self.parse_tree, pn, sym_id, self.closure_depth);
    }

    fn resolve_reference(&mut self, pn: ParseNode, allow_imp_mult: bool) {
        let name = self.parse_tree.name(pn);
        if let Some(&index) = self.symbol_table.lexical_map.get(&name) {
            self.reference_symbol(pn, index);
            return;
        }

        let text = self.program.interner.resolve(name).to_string();
        if let Some(&op) = PREDEF.get(text.as_str()) {
            self.parse_tree.set_op(pn, op);
            return;
        }

        if allow_imp_mult {
            self.resolve_id_mult(pn, &text);
        } else {
            self.error(pn, ErrorCode::BadRead);
            self.parse_tree.set_op(pn, Op::Error);
        }
    }

    /// Partition an unresolved identifier into single-grapheme declared
    /// variables and predefined constants; on success the node becomes a
    /// proxy for an implicit multiplication over those references.
    fn resolve_id_mult(&mut self, pn: ParseNode, text: &str) {
        let graphemes: Vec<&str> = text.graphemes(true).collect();
        if graphemes.len() < 2 {
            self.error(pn, ErrorCode::BadRead);
            self.parse_tree.set_op(pn, Op::Error);
            return;
        }

        enum Hit {
            Sym(SymbolIndex),
            Predef(Op),
        }

        let mut hits = Vec::with_capacity(graphemes.len());
        for g in &graphemes {
            if let Some(name) = self.program.interner.lookup(g) {
                if let Some(&index) = self.symbol_table.lexical_map.get(&name) {
                    hits.push(Hit::Sym(index));
                    continue;
                }
            }
            if let Some(&op) = PREDEF.get(g) {
                hits.push(Hit::Predef(op));
                continue;
            }
            self.error(pn, ErrorCode::BadRead);
            self.parse_tree.set_op(pn, Op::Error);
            return;
        }

        let sel = self.parse_tree.sel(pn);
        self.parse_tree.prepare_nary();
        let mut offset = sel.start;
        for (g, hit) in graphemes.iter().zip(hits) {
            let g_sel = Selection::from_span(sel.model, offset, offset + g.len());
            offset += g.len();
            match hit {
                Hit::Sym(index) => {
                    let term = self.parse_tree.add_terminal(Op::Identifier, g_sel);
                    let name = self.program.interner.intern(g);
                    self.parse_tree.set_name(term, name);
                    self.reference_symbol(term, index);
                    self.parse_tree.add_nary_child(term);
                }
                Hit::Predef(op) => {
                    let term = self.parse_tree.add_terminal(op, g_sel);
                    self.parse_tree.add_nary_child(term);
                }
            }
        }
        let mult = self.parse_tree.finish_nary(Op::ImplicitMultiply, sel);
        self.parse_tree.set_flag(pn, mult);
        self.parse_tree.set_op(pn, Op::SingleCharMultProxy);
    }

    /// Compound name for `base_script` subscript identifiers, or EMPTY when
    /// the node does not have that shape.
    fn compound_name(&mut self, pn: ParseNode) -> Name {
        if self.parse_tree.num_args(pn) != 2 {
            return Name::EMPTY;
        }
        let base = self.parse_tree.lhs(pn);
        let script = self.parse_tree.rhs(pn);
        if self.parse_tree.op(base) != Op::Identifier {
            return Name::EMPTY;
        }
        if !matches!(
            self.parse_tree.op(script),
            Op::Identifier | Op::IntegerLiteral
        ) {
            return Name::EMPTY;
        }
        let base_name = self.parse_tree.name(base);
        let script_text = self.node_text(script);
        let compound = format!(
            "{}_{}",
            self.program.interner.resolve(base_name),
            script_text
        );
        self.program.interner.intern(&compound)
    }

    fn convert_to_compound_identifier(&mut self, pn: ParseNode, name: Name) {
        self.parse_tree.set_op(pn, Op::Identifier);
        self.parse_tree.reduce_num_args(pn, 0);
        self.parse_tree.set_name(pn, name);
    }

    /// `a_x` where either part is undeclared reads as one identifier; the
    /// variant with a declared base falls through to element access.
    fn resolve_subscript(&mut self, pn: ParseNode) {
        if self.parse_tree.num_args(pn) != 2 {
            self.resolve_default(pn);
            return;
        }

        let id = self.parse_tree.lhs(pn);
        let rhs = self.parse_tree.rhs(pn);
        let lhs_eligible = self.parse_tree.op(id) == Op::Identifier;
        let rhs_eligible = matches!(
            self.parse_tree.op(rhs),
            Op::Identifier | Op::IntegerLiteral
        );
        let undeclared = lhs_eligible
            && (!self.declared(id)
                || (self.parse_tree.op(rhs) == Op::Identifier && !self.declared(rhs)));

        if lhs_eligible && rhs_eligible && undeclared {
            let compound = self.compound_name(pn);
            let compound_known = self.symbol_table.lexical_map.contains_key(&compound)
                || PREDEF.contains_key(self.program.interner.resolve(compound));

            // A predefined base keeps its subscript: `e_i` is a unit vector
            let base_text = self.program.interner.resolve(self.parse_tree.name(id));
            if !compound_known && !self.declared(id) {
                if let Some(&op) = PREDEF.get(base_text) {
                    self.parse_tree.set_op(id, op);
                    self.resolve_expr(rhs);
                    return;
                }
            }

            self.convert_to_compound_identifier(pn, compound);
            self.resolve_reference_with_script_fallback(pn);
        } else {
            self.resolve_default(pn);
        }
    }

    /// Reference lookup for a compound identifier, with the script-mult
    /// fallback: `xy_i` where `x` is declared and `y_i` resolves reads as
    /// `x·y_i`.
    fn resolve_reference_with_script_fallback(&mut self, pn: ParseNode) {
        let name = self.parse_tree.name(pn);
        if let Some(&index) = self.symbol_table.lexical_map.get(&name) {
            self.reference_symbol(pn, index);
            return;
        }
        let text = self.program.interner.resolve(name).to_string();
        if let Some(&op) = PREDEF.get(text.as_str()) {
            self.parse_tree.set_op(pn, op);
            return;
        }

        // Script variant: split `prefix` and `last_script`
        if let Some((prefix, rest)) = text.split_once('_') {
            let prefix_graphemes: Vec<&str> = prefix.graphemes(true).collect();
            if prefix_graphemes.len() >= 2 {
                let leading = &prefix_graphemes[..prefix_graphemes.len() - 1];
                let last = prefix_graphemes[prefix_graphemes.len() - 1];
                let scripted = format!("{last}_{rest}");
                let all_resolve = leading.iter().all(|g| {
                    self.program
                        .interner
                        .lookup(g)
                        .map(|n| self.symbol_table.lexical_map.contains_key(&n))
                        .unwrap_or(false)
                        || PREDEF.contains_key(g)
                }) && self
                    .program
                    .interner
                    .lookup(&scripted)
                    .map(|n| self.symbol_table.lexical_map.contains_key(&n))
                    .unwrap_or(false);
                if all_resolve {
                    let sel = self.parse_tree.sel(pn);
                    let mut terms = Vec::with_capacity(leading.len() + 1);
                    let mut offset = sel.start;
                    for g in leading {
                        let g_sel = Selection::from_span(sel.model, offset, offset + g.len());
                        offset += g.len();
                        let term = self.parse_tree.add_terminal(Op::Identifier, g_sel);
                        let gname = self.program.interner.intern(g);
                        self.parse_tree.set_name(term, gname);
                        self.resolve_reference(term, false);
                        terms.push(term);
                    }
                    let tail_sel = Selection::from_span(sel.model, offset, sel.end);
                    let tail = self.parse_tree.add_terminal(Op::Identifier, tail_sel);
                    let tail_name = self.program.interner.intern(&scripted);
                    self.parse_tree.set_name(tail, tail_name);
                    self.resolve_reference(tail, false);
                    terms.push(tail);

                    self.parse_tree.prepare_nary();
                    for term in terms {
                        self.parse_tree.add_nary_child(term);
                    }
                    let mult = self.parse_tree.finish_nary(Op::ImplicitMultiply, sel);
                    self.parse_tree.set_flag(pn, mult);
                    self.parse_tree.set_op(pn, Op::SingleCharMultProxy);
                    return;
                }
            }
        }

        self.error(pn, ErrorCode::BadRead);
        self.parse_tree.set_op(pn, Op::Error);
    }

    // Control flow ----------------------------------------------------------

    fn resolve_conditional1(&mut self, pn: ParseNode) {
        let condition = self.parse_tree.arg(pn, 0);
        self.resolve_expr(condition);
        let body = self.parse_tree.arg(pn, 1);
        self.resolve_body(body);
    }

    fn resolve_conditional2(&mut self, pn: ParseNode) {
        let condition = self.parse_tree.arg(pn, 0);
        self.resolve_expr(condition);
        let body = self.parse_tree.arg(pn, 1);
        self.resolve_body(body);
        let else_body = self.parse_tree.arg(pn, 2);
        self.resolve_body(else_body);
    }

    fn resolve_for(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(self.parse_tree.arg(pn, 1));
        self.increase_lexical_depth(begin);
        let init = self.parse_tree.arg(pn, 0);
        self.resolve_stmt(init);
        let condition = self.parse_tree.arg(pn, 1);
        self.resolve_expr(condition);
        let update = self.parse_tree.arg(pn, 2);
        self.resolve_stmt(update);
        let body = self.parse_tree.arg(pn, 3);
        self.resolve_stmt(body);
        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_ranged_for(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(self.parse_tree.arg(pn, 1));
        self.increase_lexical_depth(begin);
        let id = self.parse_tree.arg(pn, 0);
        self.define_local_scope(id, false, true);
        let collection = self.parse_tree.arg(pn, 1);
        self.resolve_expr(collection);
        let body = self.parse_tree.arg(pn, 2);
        self.resolve_stmt(body);
        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_settings_update(&mut self, pn: ParseNode) {
        let text = self.node_text(pn);
        for (id, level) in settings::parse_updates(&text) {
            self.program.settings.update(id, level);
        }
    }

    fn resolve_switch(&mut self, pn: ParseNode) {
        let key = self.parse_tree.arg(pn, 0);
        self.resolve_expr(key);
        for i in 1..self.parse_tree.num_args(pn) {
            let case_node = self.parse_tree.arg(pn, i);
            let begin = self.parse_tree.left(case_node);
            self.increase_lexical_depth(begin);
            if self.parse_tree.op(case_node) == Op::Case {
                let case_key = self.parse_tree.lhs(case_node);
                self.resolve_expr(case_key);
            }
            let stmt = self.parse_tree.rhs(case_node);
            if stmt != NONE {
                self.resolve_stmt(stmt);
            }
            let end = self.parse_tree.right(pn);
            self.decrease_lexical_depth(end);
        }
    }

    fn resolve_body(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);
        self.resolve_stmt(pn);
        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);

        if matches!(self.parse_tree.op(pn), Op::Equal | Op::Assign) {
            let level = self.program.settings.level(SettingId::UnusedVar);
            let sel = self.parse_tree.sel(pn);
            self.program.warn(level, sel, ErrorCode::UnusedVariable);
        }
    }

    /// Block resolution: algorithm names are hoisted, then statements are
    /// resolved, then non-capturing algorithms are reordered to the top of
    /// the block so forward references execute correctly.
    fn resolve_scoped_block(&mut self, pn: ParseNode) {
        self.resolve_block(pn);
    }

    fn resolve_block(&mut self, pn: ParseNode) {
        for i in 0..self.parse_tree.num_args(pn) {
            let child = self.parse_tree.arg(pn, i);
            if self.parse_tree.op(child) != Op::Algorithm {
                continue;
            }
            let name = self.parse_tree.alg_name(child);
            self.define_local_scope(name, true, true);
        }

        for i in 0..self.parse_tree.num_args(pn) {
            let child = self.parse_tree.arg(pn, i);
            self.resolve_stmt(child);
        }

        // Move non-capturing algorithms to the top of the block
        let mut algs: Vec<ParseNode> = Vec::new();
        for i in (0..self.parse_tree.num_args(pn)).rev() {
            let child = self.parse_tree.arg(pn, i);
            let ref_cap = if self.parse_tree.op(child) == Op::Algorithm {
                self.parse_tree.ref_cap_list(child)
            } else {
                NONE
            };
            let non_capturing = self.parse_tree.op(child) == Op::Algorithm
                && self.parse_tree.val_cap_list(child) == NONE
                && ref_cap != NONE
                && self.parse_tree.num_args(ref_cap) == 0;
            if non_capturing {
                algs.push(child);
            } else {
                let slot = i + algs.len();
                self.parse_tree.set_arg(pn, slot, child);
            }
        }
        for i in (0..algs.len()).rev() {
            self.parse_tree.set_arg(pn, algs.len() - i - 1, algs[i]);
        }
    }

    fn resolve_lexical_scope(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);
        self.resolve_block(pn);
        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    // Functions -------------------------------------------------------------

    fn resolve_lambda(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_closure_depth(begin, pn);

        let params = self.parse_tree.param_list(pn);
        for i in 0..self.parse_tree.num_args(params) {
            let param = self.parse_tree.arg(params, i);
            self.define_local_scope(param, false, true);
        }

        let body = self.parse_tree.arg(pn, 3);
        self.resolve_expr(body);

        let end = self.parse_tree.right(pn);
        self.decrease_closure_depth(end);
    }

    fn resolve_algorithm(&mut self, pn: ParseNode) {
        let name = self.parse_tree.alg_name(pn);
        let val_cap = self.parse_tree.val_cap_list(pn);
        let params = self.parse_tree.param_list(pn);
        let body = self.parse_tree.body(pn);

        let val_cap_size = self.parse_tree.val_list_size(val_cap);
        if val_cap != NONE {
            self.parse_tree
                .set_flag(val_cap, self.symbol_table.scope_segments.len());
            for i in 0..val_cap_size {
                let capture = self.parse_tree.arg(val_cap, i);
                self.resolve_reference(capture, false);
            }
        }

        let _ = name;
        let begin = self.parse_tree.left(body);
        self.increase_closure_depth(begin, pn);

        for i in 0..val_cap_size {
            let capture = self.parse_tree.arg(val_cap, i);
            if self.define_local_scope(capture, false, false) {
                let sym = self.symbol_table.symbols.last_mut().unwrap();
                sym.is_captured_by_value = true;
                sym.is_closure_nested = true;
                sym.comment = NONE;
            }
        }

        let mut expect_default = false;
        self.cutoff = self.symbol_table.symbols.len();
        for i in 0..self.parse_tree.num_args(params) {
            let mut param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                let default = self.parse_tree.rhs(param);
                self.resolve_expr(default);
                param = self.parse_tree.lhs(param);
                expect_default = true;
            } else if expect_default {
                self.error(param, ErrorCode::BadDefaultArg);
            }

            if !self.define_local_scope(param, false, false) {
                self.error(param, ErrorCode::RedeclareParameter);
            }
        }
        self.cutoff = usize::MAX;

        self.resolve_stmt(body);

        for i in 0..self.parse_tree.num_args(params) {
            let mut param = self.parse_tree.arg(params, i);
            if self.parse_tree.op(param) == Op::Equal {
                param = self.parse_tree.lhs(param);
            }
            if self.parse_tree.op(param) == Op::Error {
                continue;
            }
            let sym_id = self.parse_tree.sym(param);
            if sym_id != NONE {
                let sym = &mut self.symbol_table.symbols[sym_id];
                sym.is_const = !sym.is_reassigned;
            }
        }

        let end = self.parse_tree.right(body);
        self.decrease_closure_depth(end);
    }

    fn resolve_prototype(&mut self, pn: ParseNode) {
        let id = self.parse_tree.child(pn);
        if self.define_local_scope(id, true, true) {
            self.symbol_table.symbols.last_mut().unwrap().is_prototype = true;
        }
    }

    fn resolve_class(&mut self, pn: ParseNode) {
        let name = self.parse_tree.arg(pn, 0);
        let parents = self.parse_tree.arg(pn, 1);
        if parents != NONE {
            for i in 0..self.parse_tree.num_args(parents) {
                let parent = self.parse_tree.arg(parents, i);
                self.resolve_reference(parent, false);
            }
        }
        let members = self.parse_tree.arg(pn, 2);

        self.define_local_scope(name, true, true);

        let begin = self.parse_tree.left(members);
        self.increase_lexical_depth(begin);
        let end = self.parse_tree.right(members);
        self.decrease_lexical_depth(end);
    }

    // Quantified expressions ------------------------------------------------

    fn resolve_big(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);
        let assign = self.parse_tree.arg(pn, 0);
        if self.parse_tree.op(assign) != Op::Assign {
            let end = self.parse_tree.right(pn);
            self.decrease_lexical_depth(end);
            return;
        }
        let id = self.parse_tree.lhs(assign);
        let stop = self.parse_tree.arg(pn, 1);
        let body = self.parse_tree.arg(pn, 2);

        self.define_local_scope(id, false, true);
        if let Some(sym) = self.symbol_table.symbols.last_mut() {
            sym.is_used = true;
        }
        let start = self.parse_tree.rhs(assign);
        self.resolve_expr(start);
        self.resolve_expr(stop);
        self.resolve_expr(body);

        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_derivative(&mut self, pn: ParseNode) {
        let id = self.parse_tree.arg(pn, 1);
        let id_index = self.sym_index(id);
        if id_index != NONE {
            let previous = self.parse_tree.arg(pn, 2);
            self.resolve_reference(previous, false);
        } else {
            self.parse_tree.set_arg(pn, 2, NONE);
        }

        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);

        self.define_local_scope(id, true, false);
        let expr = self.parse_tree.arg(pn, 0);
        self.resolve_expr(expr);

        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_limit(&mut self, pn: ParseNode) {
        let approach = self.parse_tree.arg(pn, 1);
        self.resolve_expr(approach);
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);

        let var = self.parse_tree.arg(pn, 0);
        self.define_local_scope(var, true, false);
        let body = self.parse_tree.arg(pn, 2);
        self.resolve_expr(body);

        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_indefinite_integral(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);
        let body = self.parse_tree.child(pn);
        self.resolve_expr(body);
        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_definite_integral(&mut self, pn: ParseNode) {
        let hi = self.parse_tree.arg(pn, 1);
        self.resolve_expr(hi);
        let lo = self.parse_tree.arg(pn, 2);
        self.resolve_expr(lo);
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);

        let var = self.parse_tree.arg(pn, 0);
        self.define_local_scope(var, true, false);
        let kernel = self.parse_tree.arg(pn, 3);
        self.resolve_expr(kernel);

        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_set_builder(&mut self, pn: ParseNode) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);

        let mut var = self.parse_tree.arg(pn, 0);
        if self.parse_tree.op(var) == Op::Member {
            var = self.parse_tree.lhs(var);
        }

        if self.parse_tree.op(var) != Op::Identifier {
            self.error(var, ErrorCode::NonLvalue);
        } else {
            self.define_local_scope(var, true, false);
            let binding = self.parse_tree.arg(pn, 0);
            if self.parse_tree.op(binding) == Op::Member {
                let domain = self.parse_tree.rhs(binding);
                self.resolve_expr(domain);
            }
            let predicate = self.parse_tree.arg(pn, 1);
            self.resolve_expr(predicate);
        }

        let end = self.parse_tree.right(pn);
        self.decrease_lexical_depth(end);
    }

    fn resolve_unknown_declaration(&mut self, pn: ParseNode) {
        let membership = self.parse_tree.flag(pn);
        if membership != NONE {
            self.resolve_expr(membership);
        }
        for i in 0..self.parse_tree.num_args(pn) {
            let id = self.parse_tree.arg(pn, i);
            self.define_local_scope(id, false, true);
        }
    }

    // Imports and namespaces ------------------------------------------------

    fn resolve_import(&mut self, pn: ParseNode) {
        let alias = self.parse_tree.flag(pn);
        if alias == NONE {
            let file = self.parse_tree.child(pn);
            if self.parse_tree.op(file) != Op::FileRef {
                return;
            }
            let sel = self.parse_tree.sel(file);
            let path_text = self.program.selection_text(&sel).to_string();

            // Constrict the path to the identifier: `../lib/linalg.nte` → `linalg`
            let mut start = sel.start;
            let mut end = sel.end;
            if let Some(slash) = path_text.rfind(['/', '\\']) {
                start = sel.start + slash + 1;
            }
            if let Some(dot) = path_text.rfind('.') {
                if sel.start + dot > start {
                    end = sel.start + dot;
                }
            }

            let id_sel = Selection::from_span(sel.model, start, end);
            let name = self.program.intern_selection(&id_sel);
            let id = self.parse_tree.add_terminal(Op::Identifier, id_sel);
            self.parse_tree.set_name(id, name);
            if self.define_local_scope(id, true, true) {
                self.symbol_table.symbols.last_mut().unwrap().tied_to_file = true;
            }
            self.parse_tree.set_flag(pn, id);
        } else {
            if self.define_local_scope(alias, true, true) {
                self.symbol_table.symbols.last_mut().unwrap().tied_to_file = true;
            }
        }
    }

    /// Declare the local aliases; the static pass records the usages on the
    /// imported identifiers once the module's symbol table exists.
    fn resolve_from_import(&mut self, pn: ParseNode) {
        let mut i = 1;
        while i < self.parse_tree.num_args(pn) {
            let component = self.parse_tree.arg(pn, i);
            let alias = self.parse_tree.arg(pn, i + 1);
            let declared = if alias == NONE { component } else { alias };
            if self.define_local_scope(declared, true, true) {
                self.symbol_table.symbols.last_mut().unwrap().tied_to_file = true;
            }
            i += 2;
        }
    }

    fn resolve_namespace(&mut self, pn: ParseNode) {
        let name = self.parse_tree.arg(pn, 0);
        let body = self.parse_tree.arg(pn, 1);

        if !self.program.no_errors() {
            return;
        }

        let name_key = self.parse_tree.name(name);
        if let Some(&sym_id) = self.symbol_table.lexical_map.get(&name_key) {
            if self.symbol_table.symbols[sym_id].declaration_lexical_depth == self.lexical_depth {
                // Reopening: rebind the prior contents
                self.parse_tree.set_sym(name, sym_id);
                self.parse_tree.set_flag(pn, 1);
                self.symbol_table
                    .resolve_reference(self.parse_tree, name, sym_id, self.closure_depth);

                self.load_scope(pn, sym_id);
                self.resolve_block(body);
                self.unload_scope(body, sym_id);
                return;
            }
        }

        let sym_id = self.symbol_table.symbols.len();
        if !self.define_local_scope(name, true, true) {
            return;
        }
        self.symbol_table.symbols[sym_id].previous_namespace_index = NONE;
        let begin = self.parse_tree.left(body);
        self.increase_lexical_depth(begin);
        self.resolve_block(body);
        self.unload_scope(body, sym_id);
    }

    fn load_scope(&mut self, pn: ParseNode, sym_id: SymbolIndex) {
        let begin = self.parse_tree.left(pn);
        self.increase_lexical_depth(begin);

        let mut scope_index = self.symbol_table.symbols[sym_id].previous_namespace_index;
        while scope_index != NONE {
            let first = self.symbol_table.scope_segments[scope_index].first_sym_index;
            let end = self.symbol_table.scope_segments[scope_index + 1].first_sym_index;
            for member in first..end {
                let name = self.symbol_table.symbols[member].name;
                match self.symbol_table.lexical_map.insert(name, member) {
                    Some(shadowed) => {
                        self.symbol_table.symbols[member].shadowed_index = shadowed;
                    }
                    None => {
                        self.symbol_table.symbols[member].shadowed_index = NONE;
                    }
                }
            }
            scope_index = self.symbol_table.scope_segments[scope_index].prev_namespace_segment;
        }
    }

    fn unload_scope(&mut self, body: ParseNode, scope_sym_id: SymbolIndex) {
        // Unbind the previously loaded members
        let mut scope_index = self.symbol_table.symbols[scope_sym_id].previous_namespace_index;
        while scope_index != NONE {
            let first = self.symbol_table.scope_segments[scope_index].first_sym_index;
            let end = self.symbol_table.scope_segments[scope_index + 1].first_sym_index;
            for member in first..end {
                let name = self.symbol_table.symbols[member].name;
                let shadowed = self.symbol_table.symbols[member].shadowed_index;
                if shadowed == NONE {
                    self.symbol_table.lexical_map.remove(&name);
                } else {
                    self.symbol_table.lexical_map.insert(name, shadowed);
                }
            }
            scope_index = self.symbol_table.scope_segments[scope_index].prev_namespace_segment;
        }

        let mut seg_index = self.symbol_table.scope_segments.len() - 1;
        let end_marker = self.parse_tree.right(body);
        self.decrease_lexical_depth(end_marker);

        // Persist the new members and chain segments for O(1) re-entry
        loop {
            let first = self.symbol_table.scope_segments[seg_index].first_sym_index;
            let end = self.symbol_table.scope_segments[seg_index + 1].first_sym_index;
            for member in first..end {
                let sym = &self.symbol_table.symbols[member];
                if sym.declaration_lexical_depth != self.lexical_depth + 1 {
                    continue;
                }
                let name = sym.name;
                self.symbol_table
                    .scoped_vars
                    .insert((scope_sym_id, name), member);
            }

            let prev = self.symbol_table.scope_segments[seg_index].prev_lexical_segment;
            if prev == NONE {
                let chained = self.symbol_table.symbols[scope_sym_id].previous_namespace_index;
                self.symbol_table.scope_segments[seg_index].prev_namespace_segment = chained;
                self.symbol_table.symbols[scope_sym_id].previous_namespace_index =
                    self.symbol_table.scope_segments.len() - 2;
                break;
            } else {
                self.symbol_table.scope_segments[seg_index].prev_namespace_segment = prev;
                seg_index = prev;
            }
        }
    }

    /// Only the leftmost component resolves here; the right-hand side gets
    /// a stub usage the static pass patches once the module or namespace is
    /// known.
    fn resolve_scope_access(&mut self, pn: ParseNode) {
        let lhs = self.parse_tree.arg(pn, 0);
        match self.parse_tree.op(lhs) {
            Op::Identifier => self.resolve_reference(lhs, false),
            Op::ScopeAccess => self.resolve_scope_access(lhs),
            _ => self.resolve_default(lhs),
        }

        let rhs = self.parse_tree.arg(pn, 1);
        let sel = self.parse_tree.sel(rhs);
        let stub = self.symbol_table.add_usage_stub(rhs, sel);
        self.parse_tree.set_flag(rhs, stub);
        self.parse_tree.set_op(rhs, Op::Error);
    }

    // Scope discipline ------------------------------------------------------

    fn define_local_scope(&mut self, pn: ParseNode, immutable: bool, warn_on_shadow: bool) -> bool {
        if self.parse_tree.op(pn) == Op::SubscriptAccess {
            let compound = self.compound_name(pn);
            if compound == Name::EMPTY {
                self.error(pn, ErrorCode::AssignToExpression);
                return false;
            }
            self.convert_to_compound_identifier(pn, compound);
        }

        if self.parse_tree.op(pn) != Op::Identifier {
            self.error(pn, ErrorCode::AssignToExpression);
            return false;
        }

        let name = self.parse_tree.name(pn);
        match self.symbol_table.lexical_map.get(&name).copied() {
            None => {
                let index = self.symbol_table.add_symbol(
                    self.parse_tree,
                    pn,
                    self.lexical_depth,
                    self.closure_depth,
                    NONE,
                    immutable,
                );
                self.symbol_table.lexical_map.insert(name, index);
                true
            }
            Some(existing) => {
                if self.symbol_table.symbols[existing].declaration_lexical_depth
                    == self.lexical_depth
                {
                    let code = if self.symbol_table.symbols[existing].is_const {
                        ErrorCode::ReassignConstant
                    } else {
                        ErrorCode::MutableConstAssign
                    };
                    self.error(pn, code);
                    false
                } else {
                    if warn_on_shadow {
                        let level = self.program.settings.level(SettingId::Shadowing);
                        let sel = self.parse_tree.sel(pn);
                        self.program.warn(level, sel, ErrorCode::Shadowing);
                    }
                    let index = self.symbol_table.add_symbol(
                        self.parse_tree,
                        pn,
                        self.lexical_depth,
                        self.closure_depth,
                        existing,
                        immutable,
                    );
                    self.symbol_table.lexical_map.insert(name, index);
                    true
                }
            }
        }
    }

    fn increase_lexical_depth(&mut self, begin: crate::model::Marker) {
        self.lexical_depth += 1;
        self.symbol_table.add_scope(begin, NONE);
        self.program.settings.enter_scope();
    }

    fn decrease_lexical_depth(&mut self, end: crate::model::Marker) {
        self.symbol_table.close_scope(end);

        // Unbind this scope's symbols, restoring anything they shadowed
        let mut curr = self.symbol_table.scope_segments.len() - 2;
        loop {
            let first = self.symbol_table.scope_segments[curr].first_sym_index;
            let seg_end = self.symbol_table.scope_segments[curr + 1].first_sym_index;
            for i in first..seg_end {
                let name = self.symbol_table.symbols[i].name;
                let shadowed = self.symbol_table.symbols[i].shadowed_index;
                if shadowed == NONE {
                    self.symbol_table.lexical_map.remove(&name);
                } else {
                    self.symbol_table.lexical_map.insert(name, shadowed);
                }

                let sym = &self.symbol_table.symbols[i];
                if !sym.is_used && !sym.is_ewise_index && !sym.tied_to_file {
                    let level = self.program.settings.level(SettingId::UnusedVar);
                    let sel = self.symbol_table.first_occurrence(i);
                    self.program.warn(level, sel, ErrorCode::UnusedVariable);
                }
            }
            let prev = self.symbol_table.scope_segments[curr].prev_lexical_segment;
            if prev == NONE {
                break;
            }
            curr = prev;
        }

        self.lexical_depth -= 1;
        self.program.settings.leave_scope();
    }

    fn increase_closure_depth(&mut self, begin: crate::model::Marker, pn: ParseNode) {
        self.ref_frames.push(self.refs.len());
        self.closure_depth += 1;
        self.lexical_depth += 1;
        self.symbol_table.add_scope(begin, pn);
        self.program.settings.enter_scope();
    }

    /// Emit the deterministic reference-capture list for the closure being
    /// closed and promote captures that must also be visible to the outer
    /// closure.
    fn decrease_closure_depth(&mut self, end: crate::model::Marker) {
        let fn_node = self
            .symbol_table
            .scope_segments
            .last()
            .map(|s| s.fn_node)
            .unwrap_or(NONE);

        self.decrease_lexical_depth(end);
        self.closure_depth -= 1;

        // Collect symbols read inside this closure but declared outside it
        let mut seg_index = self.symbol_table.scope_segments.len() - 2;
        loop {
            let usage_begin = self.symbol_table.scope_segments[seg_index].usage_begin;
            let usage_end = self.symbol_table.scope_segments[seg_index].usage_end;
            for i in usage_begin..usage_end {
                let usage = &self.symbol_table.usages[i];
                if usage.prev_usage_index == NONE || usage.symbol_index == NONE {
                    continue;
                }
                let sym_index = usage.symbol_index;
                let sym = &self.symbol_table.symbols[sym_index];
                let is_closed = sym.is_closure_nested
                    && (!sym.is_captured_by_value
                        || sym.declaration_closure_depth <= self.closure_depth);
                if !is_closed {
                    continue;
                }

                let old = self.symbol_table.symbols[sym_index].ty;
                if old != UNINITIALISED_TYPE && old < self.refs.len() && self.refs[old] == sym_index
                {
                    // A more recent entry supersedes the old one
                    self.refs[old] = NONE;
                }
                self.symbol_table.symbols[sym_index].ty = self.refs.len();
                self.refs.push(sym_index);
            }

            let prev = self.symbol_table.scope_segments[seg_index].prev_lexical_segment;
            if prev == NONE {
                break;
            }
            seg_index = prev;
        }

        let mut cutoff = self.ref_frames.pop().unwrap();
        self.parse_tree.prepare_nary();
        for i in cutoff..self.refs.len() {
            let sym_index = self.refs[i];
            if sym_index == NONE {
                continue;
            }
            let sym_decl_depth = self.symbol_table.symbols[sym_index].declaration_closure_depth;
            let captured_by_value = self.symbol_table.symbols[sym_index].is_captured_by_value;
            let op = if sym_decl_depth <= self.closure_depth {
                Op::ReadUpvalue
            } else {
                Op::Identifier
            };
            let sel = self.symbol_table.first_occurrence(sym_index);
            let n = self.parse_tree.add_terminal(op, sel);
            let name = self.symbol_table.symbols[sym_index].name;
            self.parse_tree.set_name(n, name);
            self.parse_tree.set_flag(n, sym_index);
            self.parse_tree.add_nary_child(n);
            self.processed_refs.push(n);

            let promote_bound = self.closure_depth.saturating_sub(captured_by_value as u8);
            if sym_decl_depth <= promote_bound {
                self.refs[cutoff] = sym_index;
                self.symbol_table.symbols[sym_index].ty = cutoff;
                cutoff += 1;
            }
        }
        let sel = if fn_node != NONE {
            self.parse_tree.sel(fn_node)
        } else {
            Selection::from_span(self.model, 0, 0)
        };
        let list = self.parse_tree.finish_nary(Op::List, sel);
        if fn_node != NONE {
            self.parse_tree.set_ref_list(fn_node, list);
        }

        self.refs.truncate(cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;
    use crate::parser::Parser;
    use std::path::PathBuf;

    fn resolve(source: &str) -> (Program, ParseTree, SymbolTable) {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("test.nte"), source)
            .model()
            .expect("valid serial");
        let tokens = Scanner::new(&mut program, id).scan_all();
        let mut parser = Parser::new(&mut program, id, tokens);
        parser.parse_all();
        let mut tree = std::mem::take(&mut parser.parse_tree);
        let table = LexicalPass::new(&mut program, &mut tree, id).resolve_symbols();
        (program, tree, table)
    }

    #[test]
    fn declaration_and_use_share_a_symbol() {
        let (program, tree, table) = resolve("x ← 3\nprint(x)");
        assert!(program.no_errors());
        let assign = tree.arg(tree.root, 0);
        let decl = tree.lhs(assign);
        let print = tree.arg(tree.root, 1);
        let reference = tree.child(print);
        assert_eq!(tree.sym(decl), tree.sym(reference));
        assert_eq!(table.occurrences(tree.sym(decl)).len(), 2);
    }

    #[test]
    fn undeclared_read_is_bad_read() {
        let (program, _, _) = resolve("print(zz)");
        assert_eq!(program.error_stream.errors[0].code, ErrorCode::BadRead);
    }

    #[test]
    fn predefined_pi_lowers_the_node() {
        let (program, tree, _) = resolve("print(π)");
        assert!(program.no_errors());
        let print = tree.child(tree.root);
        assert_eq!(tree.op(tree.child(print)), Op::Pi);
    }

    #[test]
    fn reassign_constant_errors() {
        let (program, _, _) = resolve("x = 1\nx ← 2");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::ReassignConstant
        );
    }

    #[test]
    fn mutable_assignment_rewrites_to_reassign() {
        let (program, tree, _) = resolve("x ← 1\nx ← 2\nprint(x)");
        assert!(program.no_errors());
        let second = tree.arg(tree.root, 1);
        assert_eq!(tree.op(second), Op::Reassign);
    }

    #[test]
    fn implicit_multiplication_of_declared_singles() {
        let (program, tree, _) = resolve("a ← 2\nb ← 3\nprint(ab)");
        assert!(program.no_errors());
        let print = tree.arg(tree.root, 2);
        let proxy = tree.child(print);
        assert_eq!(tree.op(proxy), Op::SingleCharMultProxy);
        let mult = tree.flag(proxy);
        assert_eq!(tree.op(mult), Op::ImplicitMultiply);
        assert_eq!(tree.num_args(mult), 2);
    }

    #[test]
    fn implicit_multiplication_with_predef() {
        let (program, tree, _) = resolve("r ← 2\nprint(πr)");
        assert!(program.no_errors());
        let print = tree.arg(tree.root, 1);
        let proxy = tree.child(print);
        let mult = tree.flag(proxy);
        assert_eq!(tree.op(tree.arg(mult, 0)), Op::Pi);
        assert_eq!(tree.op(tree.arg(mult, 1)), Op::Identifier);
    }

    #[test]
    fn closure_capture_marks_symbol_and_emits_list() {
        let (program, tree, table) = resolve(
            "x ← 1\nalgorithm f() {\nreturn x\n}\nprint(f())",
        );
        assert!(program.no_errors());
        // x is global (closure depth 0), so it is NOT closure-nested
        let assign = tree.arg(tree.root, 1);
        let _ = assign;
        let x_sym = &table.symbols[0];
        assert!(!x_sym.is_closure_nested);
    }

    #[test]
    fn nested_closure_capture_is_marked() {
        let (program, _, table) = resolve(
            "algorithm outer() {\ny ← 1\nalgorithm inner() {\nreturn y\n}\nreturn inner()\n}\nprint(outer())",
        );
        assert!(program.no_errors());
        let y = table
            .symbols
            .iter()
            .find(|s| s.declaration_closure_depth == 1 && s.is_closure_nested);
        assert!(y.is_some(), "y should be closure nested");
    }

    #[test]
    fn algorithm_forward_reference_resolves() {
        let (program, _, _) = resolve(
            "algorithm main() {\nreturn helper()\n}\nalgorithm helper() {\nreturn 1\n}\nprint(main())",
        );
        assert!(program.no_errors());
    }

    #[test]
    fn non_capturing_algorithms_are_hoisted() {
        let (_, tree, _) = resolve("x ← 1\nalgorithm f() {\nreturn 1\n}\nprint(x)");
        // After reorder, the algorithm is the first statement of the block
        assert_eq!(tree.op(tree.arg(tree.root, 0)), Op::Algorithm);
    }

    #[test]
    fn elementwise_assignment_rewrites() {
        let serial = format!(
            "v ← {}\nv{} ← i + 1\nprint(v)",
            crate::serial::matrix(2, 1, &["1", "2"]),
            crate::serial::unary(crate::serial::KEY_SUBSCRIPT, "i"),
        );
        let (program, tree, _) = resolve(&serial);
        assert!(program.no_errors(), "{:?}", program.error_stream.errors.first().map(|e| e.code));
        let stmt = tree.arg(tree.root, 1);
        assert_eq!(tree.op(stmt), Op::ElementwiseAssignment);
    }

    #[test]
    fn subscripted_name_declares_compound_identifier() {
        let serial = format!(
            "x{} = 4\nprint(x{})",
            crate::serial::unary(crate::serial::KEY_SUBSCRIPT, "0"),
            crate::serial::unary(crate::serial::KEY_SUBSCRIPT, "0"),
        );
        let (program, tree, _) = resolve(&serial);
        assert!(program.no_errors());
        let assign = tree.arg(tree.root, 0);
        assert_eq!(tree.op(tree.lhs(assign)), Op::Identifier);
    }

    #[test]
    fn namespace_reopen_rebinds_members() {
        let (program, _, table) = resolve(
            "namespace geo {\na = 1\n}\nnamespace geo {\nb = a\nprint(b)\n}",
        );
        assert!(program.no_errors(), "{:?}", program.error_stream.errors.first().map(|e| e.code));
        assert!(!table.scoped_vars.is_empty());
    }

    #[test]
    fn scope_access_rhs_is_stubbed() {
        let (_, tree, table) = resolve("namespace m {\nvalue = 7\n}\nprint(m.value)");
        let print = tree.arg(tree.root, 1);
        let access = tree.child(print);
        assert_eq!(tree.op(access), Op::ScopeAccess);
        let rhs = tree.rhs(access);
        assert_eq!(tree.op(rhs), Op::Error);
        let stub = tree.flag(rhs);
        assert_eq!(table.usages[stub].symbol_index, NONE);
    }

    #[test]
    fn shadowing_warns_by_default() {
        let (program, _, _) = resolve("x ← 1\nif(x < 2) {\nx = 5\nprint(x)\n}\nprint(x)");
        assert!(program.no_errors());
        assert!(program
            .error_stream
            .warnings
            .iter()
            .any(|w| w.code == ErrorCode::Shadowing));
    }

    #[test]
    fn settings_update_changes_shadowing_level() {
        let serial = format!(
            "{}gshadowing=error{}\nx ← 1\nif(x < 2) {{\nx = 5\nprint(x)\n}}\nprint(x)",
            crate::serial::CONSTRUCT,
            crate::serial::CLOSE
        );
        let (program, _, _) = resolve(&serial);
        assert!(program
            .error_stream
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::Shadowing));
    }

    #[test]
    fn return_outside_function_errors() {
        let (program, _, _) = resolve("return 1");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::ReturnOutsideFunction
        );
    }

    #[test]
    fn ranged_for_declares_loop_variable() {
        let (program, _, _) = resolve("for(i : 5) {\nprint(i)\n}");
        assert!(program.no_errors());
    }
}
