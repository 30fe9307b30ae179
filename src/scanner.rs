//! Deterministic scanner over the typeset serial.
//!
//! Emits a flat token stream, including synthetic tokens for construct
//! boundaries (one token per construct entry, `ArgClose` per argument
//! close). All tokens carry their source selection. After `import` or
//! `from` the scanner switches to a filepath sub-scan.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::errors::ErrorCode;
use crate::model::{ModelId, Selection};
use crate::program::Program;
use crate::serial;
use crate::token::{Token, TokenKind};

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    use TokenKind::*;
    HashMap::from([
        ("algorithm", Algorithm),
        ("assert", Assert),
        ("break", Break),
        ("case", Case),
        ("class", Class),
        ("continue", Continue),
        ("default", Default),
        ("else", Else),
        ("enum", Enum),
        ("false", FalseLiteral),
        ("for", For),
        ("from", From),
        ("if", If),
        ("import", Import),
        ("as", As),
        ("namespace", Namespace),
        ("plot", Plot),
        ("print", Print),
        ("private", Private),
        ("public", Public),
        ("return", Return),
        ("static", Static),
        ("switch", Switch),
        ("true", TrueLiteral),
        ("unknown", Unknown),
        ("while", While),
        ("sin", Sin),
        ("cos", Cos),
        ("tan", Tan),
        ("arcsin", Arcsin),
        ("arccos", Arccos),
        ("arctan", Arctan),
        ("arctan2", Arctan2),
        ("csc", Csc),
        ("sec", Sec),
        ("cot", Cot),
        ("arccsc", Arccsc),
        ("arcsec", Arcsec),
        ("arccot", Arccot),
        ("sinh", Sinh),
        ("cosh", Cosh),
        ("tanh", Tanh),
        ("arcsinh", Arcsinh),
        ("arccosh", Arccosh),
        ("arctanh", Arctanh),
        ("csch", Csch),
        ("sech", Sech),
        ("coth", Coth),
        ("arccsch", Arccsch),
        ("arcsech", Arcsech),
        ("arccoth", Arccoth),
        ("exp", Exp),
        ("ln", NaturalLog),
        ("log", Log),
        ("erf", Erf),
        ("erfc", Erfc),
        ("sgn", Sgn),
        ("length", Length),
        ("rows", Rows),
        ("cols", Cols),
    ])
});

fn construct_token(key: char) -> Option<TokenKind> {
    use TokenKind::*;
    match key {
        serial::KEY_FRACTION => Some(ConstructFraction),
        serial::KEY_BINOMIAL => Some(ConstructBinomial),
        serial::KEY_SUPERSCRIPT => Some(ConstructSuperscript),
        serial::KEY_SUBSCRIPT => Some(ConstructSubscript),
        serial::KEY_DUALSCRIPT => Some(ConstructDualscript),
        serial::KEY_SQRT => Some(ConstructSqrt),
        serial::KEY_NROOT => Some(ConstructNRoot),
        serial::KEY_LIMIT => Some(ConstructLimit),
        serial::KEY_INTEGRAL => Some(ConstructIntegral),
        serial::KEY_DEFINITE_INTEGRAL => Some(ConstructDefiniteIntegral),
        serial::KEY_BIG_SUM0 => Some(ConstructBigSum0),
        serial::KEY_BIG_SUM => Some(ConstructBigSum),
        serial::KEY_BIG_PROD0 => Some(ConstructBigProd0),
        serial::KEY_BIG_PROD => Some(ConstructBigProd),
        serial::KEY_ACCENT_HAT => Some(ConstructAccentHat),
        serial::KEY_ACCENT_BAR => Some(ConstructAccentBar),
        _ => None,
    }
}

fn is_script_char(ch: char) -> bool {
    matches!(ch, '\u{2070}'..='\u{209C}' | '\u{1D62}'..='\u{1D6A}' | '\u{00B2}' | '\u{00B3}' | '\u{00B9}')
}

fn is_identifier_start(ch: char) -> bool {
    (ch.is_alphabetic() || matches!(ch, '_' | '∂' | '†'))
        && !matches!(ch, 'ℝ' | 'ℚ' | 'ℤ' | 'ℕ' | 'ℂ' | 'ℍ' | '𝔹' | 'ℙ' | '𝕊' | '𝕆')
}

fn is_identifier_continue(ch: char) -> bool {
    (ch.is_alphanumeric() || matches!(ch, '_' | '∂' | '†'))
        && !matches!(ch, 'ℝ' | 'ℚ' | 'ℤ' | 'ℕ' | 'ℂ' | 'ℍ' | '𝔹' | 'ℙ' | '𝕊' | '𝕆')
}

pub struct Scanner<'p> {
    program: &'p mut Program,
    model: ModelId,
    chars: Vec<(usize, char)>,
    /// Byte length of the source; selections end here at EOF.
    len: usize,
    pos: usize,
    anchor: usize,
    scope_depth: usize,
    pub tokens: Vec<Token>,
}

impl<'p> Scanner<'p> {
    pub fn new(program: &'p mut Program, model: ModelId) -> Self {
        let source = program.model(model).source.clone();
        let chars: Vec<(usize, char)> = source.char_indices().collect();
        Scanner {
            program,
            model,
            chars,
            len: source.len(),
            pos: 0,
            anchor: 0,
            scope_depth: 0,
            tokens: Vec::new(),
        }
    }

    /// Scan the whole document. Always ends with an `EndOfFile` token.
    pub fn scan_all(mut self) -> Vec<Token> {
        loop {
            self.scan_token();
            if self.tokens.last().map(|t| t.kind) == Some(TokenKind::EndOfFile) {
                break;
            }
        }
        self.tokens
    }

    // Cursor helpers --------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|&(_, ch)| ch)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, ch)| ch)
    }

    fn byte_pos(&self) -> usize {
        self.chars.get(self.pos).map(|&(i, _)| i).unwrap_or(self.len)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn selection(&self) -> Selection {
        Selection::from_span(self.model, self.anchor, self.byte_pos())
    }

    fn push(&mut self, kind: TokenKind) {
        self.tokens.push(Token::new(kind, self.selection()));
    }

    fn error(&mut self, code: ErrorCode) {
        self.push(TokenKind::ScannerError);
        let sel = self.selection();
        self.program.fail(sel, code);
    }

    fn record_line_depth(&mut self) {
        let sel = self.selection();
        let line = self.program.line_of(&sel) - 1;
        let depth = self.scope_depth;
        let depths = &mut self.program.model_mut(self.model).line_scope_depth;
        if line < depths.len() {
            depths[line] = depth;
        }
    }

    // Scanning --------------------------------------------------------------

    fn scan_token(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
        self.anchor = self.byte_pos();

        let ch = match self.bump() {
            Some(ch) => ch,
            None => {
                self.record_line_depth();
                self.push(TokenKind::EndOfFile);
                return;
            }
        };

        use TokenKind::*;
        match ch {
            '\n' => {
                self.record_line_depth();
                self.push(Newline);
            }
            serial::CLOSE => self.push(ArgClose),
            serial::CONSTRUCT => self.scan_construct(),
            '"' => self.scan_string(),
            '/' => {
                if self.eat('/') {
                    self.scan_comment();
                } else {
                    self.push(Forwardslash);
                }
            }
            '0'..='9' => self.scan_number(ch),
            '+' => self.push(Plus),
            '-' | '−' => self.push(Minus),
            '*' => self.push(Multiply),
            '·' => self.push(DotProduct),
            '÷' => self.push(Divide),
            '\\' => self.push(Backslash),
            '×' => self.push(Times),
            '⊗' => self.push(OuterProduct),
            '⊙' => self.push(ODot),
            '∘' => self.push(Composition),
            '%' => self.push(Percent),
            '^' => self.push(Caret),
            '!' => {
                if self.eat('=') {
                    self.push(NotEqual);
                } else {
                    self.push(Exclam);
                }
            }
            '#' => self.push(Pound),
            '∇' => self.push(Nabla),
            '¬' => self.push(Not),
            '=' => self.push(Equals),
            '≠' => self.push(NotEqual),
            '≈' => self.push(Approx),
            '≉' => self.push(NotApprox),
            '<' => {
                if self.eat('=') {
                    self.push(LessEqual);
                } else {
                    self.push(Less);
                }
            }
            '>' => {
                if self.eat('=') {
                    self.push(GreaterEqual);
                } else {
                    self.push(Greater);
                }
            }
            '≤' => self.push(LessEqual),
            '≥' => self.push(GreaterEqual),
            '∈' => self.push(Member),
            '∉' => self.push(NotMember),
            '⊂' => self.push(Subset),
            '⊆' => self.push(SubsetEq),
            '∪' => self.push(Cup),
            '∩' => self.push(Cap),
            '∧' => self.push(Conjunction),
            '∨' => self.push(Disjunction),
            '←' => self.push(LeftArrow),
            ':' => {
                if self.eat('=') {
                    self.push(DefEquals);
                } else {
                    self.push(Colon);
                }
            }
            ';' => self.push(Semicolon),
            ',' => self.push(Comma),
            '.' => self.push(Period),
            '↦' => self.push(MapsTo),
            '(' => self.push(LeftParen),
            ')' => self.push(RightParen),
            '{' => {
                self.scope_depth += 1;
                self.push(LeftBracket);
            }
            '}' => {
                self.scope_depth = self.scope_depth.saturating_sub(1);
                self.push(RightBracket);
            }
            '[' => self.push(LeftBrace),
            ']' => self.push(RightBrace),
            '⌈' => self.push(LeftCeil),
            '⌉' => self.push(RightCeil),
            '⌊' => self.push(LeftFloor),
            '⌋' => self.push(RightFloor),
            '|' => self.push(Bar),
            '‖' => self.push(DoubleBar),
            '⟨' => self.push(LeftAngle),
            '⟩' => self.push(RightAngle),
            '⟦' => self.push(LeftDoubleBrace),
            '⟧' => self.push(RightDoubleBrace),
            '∞' => self.push(Infinity),
            '∅' => self.push(EmptySet),
            '£' => self.push(PoundSterling),
            '€' => self.push(Euro),
            '$' => self.push(Dollar),
            'ℝ' => self.push(DoublestruckR),
            'ℚ' => self.push(DoublestruckQ),
            'ℤ' => self.push(DoublestruckZ),
            'ℕ' => self.push(DoublestruckN),
            'ℂ' => self.push(DoublestruckC),
            '𝔹' => self.push(DoublestruckB),
            'ℙ' => self.push(DoublestruckP),
            'ℍ' => self.push(DoublestruckH),
            '𝕊' => {
                if self.eat('𝕆') {
                    self.push(SpecialOrthogonal);
                } else {
                    self.error(ErrorCode::UnrecognizedSymbol);
                }
            }
            _ if is_identifier_start(ch) => self.scan_identifier(),
            _ => self.error(ErrorCode::UnrecognizedSymbol),
        }
    }

    fn scan_number(&mut self, first: char) {
        let second_is_digit = matches!(self.peek(), Some('0'..='9'));
        if first == '0' && second_is_digit {
            while matches!(self.peek(), Some('0'..='9')) {
                self.pos += 1;
            }
            self.error(ErrorCode::LeadingZeros);
            return;
        }
        while matches!(self.peek(), Some('0'..='9')) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some('0'..='9')) {
            self.pos += 1;
            while matches!(self.peek(), Some('0'..='9')) {
                self.pos += 1;
            }
        }
        self.push(TokenKind::Integer);
    }

    fn scan_identifier(&mut self) {
        while self.peek().map(is_identifier_continue).unwrap_or(false) {
            self.pos += 1;
        }
        while self.peek().map(is_script_char).unwrap_or(false) {
            self.pos += 1;
        }

        let sel = self.selection();
        let text = self.program.selection_text(&sel).to_string();
        match KEYWORDS.get(text.as_str()) {
            None => self.push(TokenKind::Identifier),
            Some(&kind) => {
                self.push(kind);
                if kind == TokenKind::Import || kind == TokenKind::From {
                    self.scan_filepath();
                }
            }
        }
    }

    /// Select the token span as a filepath, up to whitespace.
    fn scan_filepath(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
        self.anchor = self.byte_pos();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || ch == serial::CLOSE || ch == serial::CONSTRUCT {
                break;
            }
            self.pos += 1;
        }
        if self.byte_pos() == self.anchor {
            self.error(ErrorCode::ExpectedFilepath);
        } else {
            self.push(TokenKind::Filepath);
        }
    }

    fn scan_string(&mut self) {
        loop {
            match self.peek() {
                None | Some('\n') | Some(serial::CLOSE) | Some(serial::CONSTRUCT) => {
                    self.error(ErrorCode::UnterminatedString);
                    return;
                }
                Some('\\') => {
                    self.pos += 1;
                    self.pos += 1;
                }
                Some('"') => {
                    self.pos += 1;
                    self.push(TokenKind::StringLiteral);
                    return;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn scan_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.pos += 1;
        }
        self.push(TokenKind::Comment);
    }

    fn scan_construct(&mut self) {
        let key = match self.bump() {
            Some(key) => key,
            None => {
                self.error(ErrorCode::UnrecognizedSymbol);
                return;
            }
        };

        match key {
            serial::KEY_MATRIX => {
                let rest: String = self.chars[self.pos..].iter().map(|&(_, c)| c).collect();
                let mut it = rest.chars().peekable();
                match serial::parse_matrix_dims(&mut it) {
                    Some((rows, cols)) => {
                        // consumed: dims digits + 'x' + ']'
                        let consumed = rest.chars().count() - it.count();
                        self.pos += consumed;
                        self.eat(serial::OPEN);
                        let sel = self.selection();
                        self.tokens
                            .push(Token::with_dims(TokenKind::ConstructMatrix, sel, rows, cols));
                    }
                    None => self.error(ErrorCode::UnrecognizedSymbol),
                }
            }
            serial::KEY_CASES => {
                let rest: String = self.chars[self.pos..].iter().map(|&(_, c)| c).collect();
                let mut it = rest.chars().peekable();
                match serial::parse_cases_rows(&mut it) {
                    Some(rows) => {
                        let consumed = rest.chars().count() - it.count();
                        self.pos += consumed;
                        let sel = self.selection();
                        self.tokens
                            .push(Token::with_dims(TokenKind::ConstructCases, sel, rows, 2));
                    }
                    None => self.error(ErrorCode::UnrecognizedSymbol),
                }
            }
            serial::KEY_SETTINGS => {
                self.anchor = self.byte_pos();
                while let Some(ch) = self.peek() {
                    if ch == serial::CLOSE {
                        break;
                    }
                    self.pos += 1;
                }
                self.push(TokenKind::SettingsUpdate);
                self.eat(serial::CLOSE);
            }
            _ => match construct_token(key) {
                Some(kind) => {
                    self.push(kind);
                    if serial::construct_arity(key).unwrap_or(0) > 0 {
                        self.eat(serial::OPEN);
                    }
                }
                None => self.error(ErrorCode::UnrecognizedSymbol),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scan(source: &str) -> (Program, Vec<Token>) {
        let mut program = Program::new();
        let id = program
            .set_entry_source(PathBuf::from("test.nte"), source)
            .model()
            .expect("valid serial");
        let tokens = Scanner::new(&mut program, id).scan_all();
        (program, tokens)
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_simple_assignment() {
        let (_, tokens) = scan("x ← 3");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Identifier,
                TokenKind::LeftArrow,
                TokenKind::Integer,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn ends_with_eof() {
        let (_, tokens) = scan("");
        assert_eq!(kinds(&tokens), vec![TokenKind::EndOfFile]);
    }

    #[test]
    fn keywords_are_recognised() {
        let (_, tokens) = scan("while print sin");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::While,
                TokenKind::Print,
                TokenKind::Sin,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn leading_zero_integer_is_an_error() {
        let (program, tokens) = scan("07");
        assert_eq!(tokens[0].kind, TokenKind::ScannerError);
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::LeadingZeros
        );
    }

    #[test]
    fn zero_alone_is_fine() {
        let (program, tokens) = scan("0");
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert!(program.no_errors());
    }

    #[test]
    fn decimal_numbers_are_one_token() {
        let (program, tokens) = scan("3.25");
        assert_eq!(tokens[0].kind, TokenKind::Integer);
        assert_eq!(program.selection_text(&tokens[0].sel), "3.25");
    }

    #[test]
    fn comment_runs_to_end_of_line() {
        let (_, tokens) = scan("// note\nx");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Comment,
                TokenKind::Newline,
                TokenKind::Identifier,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let (program, _) = scan("\"abc");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::UnterminatedString
        );
    }

    #[test]
    fn string_with_escapes_scans() {
        let (program, tokens) = scan(r#""a\"b\n""#);
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
        assert!(program.no_errors());
    }

    #[test]
    fn matrix_construct_carries_dims() {
        let serial = crate::serial::matrix(2, 3, &["1", "2", "3", "4", "5", "6"]);
        let (_, tokens) = scan(&serial);
        assert_eq!(tokens[0].kind, TokenKind::ConstructMatrix);
        assert_eq!((tokens[0].rows, tokens[0].cols), (2, 3));
        let closes = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::ArgClose)
            .count();
        assert_eq!(closes, 6);
    }

    #[test]
    fn fraction_construct_emits_token_and_arg_closes() {
        let serial = crate::serial::binary(crate::serial::KEY_FRACTION, "1", "2");
        let (_, tokens) = scan(&serial);
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::ConstructFraction,
                TokenKind::Integer,
                TokenKind::ArgClose,
                TokenKind::Integer,
                TokenKind::ArgClose,
                TokenKind::EndOfFile
            ]
        );
    }

    #[test]
    fn import_switches_to_filepath_scan() {
        let (program, tokens) = scan("import util/linalg.nte");
        assert_eq!(tokens[0].kind, TokenKind::Import);
        assert_eq!(tokens[1].kind, TokenKind::Filepath);
        assert_eq!(program.selection_text(&tokens[1].sel), "util/linalg.nte");
    }

    #[test]
    fn import_without_path_is_an_error() {
        let (program, _) = scan("import ");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::ExpectedFilepath
        );
    }

    #[test]
    fn identifier_with_script_suffix_is_one_token() {
        let (program, tokens) = scan("xₙ");
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(program.selection_text(&tokens[0].sel), "xₙ");
    }

    #[test]
    fn unrecognised_symbol_reports_error() {
        let (program, _) = scan("x ⅋ y");
        assert_eq!(
            program.error_stream.errors[0].code,
            ErrorCode::UnrecognizedSymbol
        );
    }

    #[test]
    fn newline_records_scope_depth() {
        let (program, _) = scan("{\nx\n}");
        let depths = &program.model(0).line_scope_depth;
        assert_eq!(depths[0], 1);
        assert_eq!(depths[1], 1);
    }

    #[test]
    fn settings_construct_scans_to_close() {
        let serial = format!("{}gshadowing=error{}", crate::serial::CONSTRUCT, crate::serial::CLOSE);
        let (program, tokens) = scan(&serial);
        assert_eq!(tokens[0].kind, TokenKind::SettingsUpdate);
        assert_eq!(program.selection_text(&tokens[0].sel), "shadowing=error");
    }
}
