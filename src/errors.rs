//! Diagnostics for every pipeline stage.
//!
//! The stream keeps one append-only message buffer; each `Error` records an
//! (offset, length) pair into it, so the buffer may grow freely and message
//! text is read back through [`ErrorStream::message`].

use crate::model::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WarningLevel {
    NoWarning,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Lexical
    UnterminatedString,
    UnrecognizedSymbol,
    ExpectedFilepath,
    LeadingZeros,
    UnterminatedComment,

    // Parse
    ExpectLeftParen,
    ExpectRightParen,
    ExpectLeftBracket,
    ExpectRightBracket,
    ExpectLeftBrace,
    ExpectRightBrace,
    ExpectColon,
    ExpectSemicolon,
    ExpectComma,
    ExpectArgClose,
    ExpectedPrimary,
    ExpectCase,
    UnrecognizedExpr,
    UnrecognizedStmt,
    EmptyBigSymbol,
    BadRangedForVar,
    TrailingConstant,
    TrailingDot,
    ScalarMatrix,
    BadBreak,
    BadContinue,
    InvalidParameter,
    NonLvalue,
    AssignToExpression,
    EmptyString,

    // Resolution
    BadRead,
    BadReadOrSubscript,
    ReassignConstant,
    MutableConstAssign,
    RedeclareParameter,
    BadDefaultArg,
    Shadowing,
    UnusedVariable,
    UnusedExpression,
    UnusedElementIndex,
    ReturnOutsideFunction,
    FileNotFound,
    FileCorrupted,
    SelfImport,
    ModuleFieldNotFound,
    TransposeTWarning,

    // Typing
    TypeError,
    DimensionMismatch,
    NotCallable,
    TooFewArgs,
    TooManyArgs,
    RecursiveType,
    IndexOutOfRange,
    NonTerminatingSlice,
    UnsupportedSwitchType,
    RedundantCase,
    ExpectNaturalNumber,
    ExpectPositiveInt,
    ExpectScalar,
    ExpectBoolean,
    Autosize,
    CheckScalarGuard,

    // Runtime
    RuntimeDimensionMismatch,
    RuntimeTypeError,
    UseBeforeDefine,
    AssertFail,
    BigSymbolArg,
    BigSymbolRange,
    CalcOverflow,
    NoReturn,
    EmptyCases,
    InvalidArgs,
    BinomialKExceedsN,
    UserStop,

    /// Sentinel for "no error recorded"; never stored in the stream.
    NoErrorFound,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        use ErrorCode::*;
        match self {
            UnterminatedString => "string is not terminated",
            UnrecognizedSymbol => "unrecognised symbol",
            ExpectedFilepath => "expected a file path",
            LeadingZeros => "integer literals may not start with 0",
            UnterminatedComment => "comment is not terminated",
            ExpectLeftParen => "expected '('",
            ExpectRightParen => "expected ')'",
            ExpectLeftBracket => "expected '{'",
            ExpectRightBracket => "expected '}'",
            ExpectLeftBrace => "expected '['",
            ExpectRightBrace => "expected ']'",
            ExpectColon => "expected ':'",
            ExpectSemicolon => "expected ';'",
            ExpectComma => "expected ','",
            ExpectArgClose => "expected end of construct argument",
            ExpectedPrimary => "expected an expression here",
            ExpectCase => "expected 'case' or 'default'",
            UnrecognizedExpr => "unrecognised expression",
            UnrecognizedStmt => "unrecognised statement",
            EmptyBigSymbol => "big symbol requires bounds",
            BadRangedForVar => "ranged for-loop variable must be a plain identifier",
            TrailingConstant => "number may not follow a value",
            TrailingDot => "trailing '.' is not a scope access",
            ScalarMatrix => "a 1x1 matrix is a scalar; remove the matrix brackets",
            BadBreak => "break outside of loop",
            BadContinue => "continue outside of loop",
            InvalidParameter => "parameter must be an identifier",
            NonLvalue => "cannot assign to this expression",
            AssignToExpression => "left-hand side of assignment is not assignable",
            EmptyString => "string is empty",
            BadRead => "no variable of this name is in scope",
            BadReadOrSubscript => "not a variable or subscript in scope",
            ReassignConstant => "cannot reassign a constant",
            MutableConstAssign => "cannot '=' an existing variable; use '←' to reassign",
            RedeclareParameter => "parameter is declared twice",
            BadDefaultArg => "default argument refers to a later parameter",
            Shadowing => "declaration shadows an existing variable",
            UnusedVariable => "variable is never used",
            UnusedExpression => "expression result is unused",
            UnusedElementIndex => "element-wise index is never used",
            ReturnOutsideFunction => "return outside of function",
            FileNotFound => "file not found",
            FileCorrupted => "file is not a valid typeset document",
            SelfImport => "file imports itself",
            ModuleFieldNotFound => "module has no member of this name",
            TransposeTWarning => "'T' used as transpose; declare it to silence",
            TypeError => "type mismatch",
            DimensionMismatch => "matrix dimensions disagree",
            NotCallable => "value is not callable",
            TooFewArgs => "too few arguments",
            TooManyArgs => "too many arguments",
            RecursiveType => "recursive call never resolves to a concrete type",
            IndexOutOfRange => "index out of range",
            NonTerminatingSlice => "slice does not terminate",
            UnsupportedSwitchType => "switch key must be numeric or string",
            RedundantCase => "duplicate case key",
            ExpectNaturalNumber => "expected a natural number",
            ExpectPositiveInt => "expected a non-negative integer",
            ExpectScalar => "expected a scalar",
            ExpectBoolean => "expected a boolean",
            Autosize => "matrix size cannot be deduced here",
            CheckScalarGuard => "subscript target must be scalar here",
            RuntimeDimensionMismatch => "matrix dimensions disagree at runtime",
            RuntimeTypeError => "value has the wrong type at runtime",
            UseBeforeDefine => "variable read before it is defined",
            AssertFail => "assertion failed",
            BigSymbolArg => "big symbol bound must be a scalar",
            BigSymbolRange => "big symbol range is empty",
            CalcOverflow => "calculation overflows",
            NoReturn => "function ended without returning a value",
            EmptyCases => "no case condition was true",
            InvalidArgs => "arguments do not match any signature",
            BinomialKExceedsN => "binomial requires k ≤ n",
            UserStop => "stopped by user",
            NoErrorFound => "no error",
        }
    }

    /// Whether the errant selection text is quoted after the message.
    pub fn quotes_source(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            UnrecognizedSymbol
                | BadRead
                | BadReadOrSubscript
                | ReassignConstant
                | MutableConstAssign
                | Shadowing
                | UnusedVariable
                | FileNotFound
                | SelfImport
                | ModuleFieldNotFound
                | RedundantCase
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Error {
    pub selection: Selection,
    pub code: ErrorCode,
    pub line: usize,
    pub level: WarningLevel,
    start: usize,
    len: usize,
}

impl Error {
    /// 1-based line of the selection's start, captured at report time.
    pub fn line(&self) -> usize {
        self.line
    }
}

/// Collects errors and warnings across all pipeline stages.
pub struct ErrorStream {
    buffer: String,
    pub errors: Vec<Error>,
    pub warnings: Vec<Error>,
}

impl ErrorStream {
    pub fn new() -> Self {
        ErrorStream {
            buffer: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.errors.clear();
        self.warnings.clear();
    }

    pub fn no_errors(&self) -> bool {
        self.errors.is_empty()
    }

    /// Message text of a previously reported error.
    pub fn message(&self, error: &Error) -> &str {
        &self.buffer[error.start..error.start + error.len]
    }

    pub fn fail(&mut self, selection: Selection, code: ErrorCode, line: usize, quoted: &str) {
        let error = self.record(selection, code, line, WarningLevel::Error, code.message(), quoted);
        self.errors.push(error);
    }

    pub fn fail_with_message(
        &mut self,
        selection: Selection,
        message: &str,
        code: ErrorCode,
        line: usize,
    ) {
        let error = self.record(selection, code, line, WarningLevel::Error, message, "");
        self.errors.push(error);
    }

    /// A warning at `WarningLevel::Error` is treated as an error.
    pub fn warn(
        &mut self,
        level: WarningLevel,
        selection: Selection,
        code: ErrorCode,
        line: usize,
        quoted: &str,
    ) {
        match level {
            WarningLevel::NoWarning => {}
            WarningLevel::Warn => {
                let error = self.record(selection, code, line, level, code.message(), quoted);
                self.warnings.push(error);
            }
            WarningLevel::Error => self.fail(selection, code, line, quoted),
        }
    }

    fn record(
        &mut self,
        selection: Selection,
        code: ErrorCode,
        line: usize,
        level: WarningLevel,
        message: &str,
        quoted: &str,
    ) -> Error {
        self.buffer.push_str("Line ");
        self.buffer.push_str(&line.to_string());
        self.buffer.push_str(" - ");
        let start = self.buffer.len();
        self.buffer.push_str(message);
        if code.quotes_source() && !quoted.is_empty() {
            self.buffer.push_str(": ");
            self.buffer.push_str(quoted);
        }
        let len = self.buffer.len() - start;
        self.buffer.push('\n');
        Error {
            selection,
            code,
            line,
            level,
            start,
            len,
        }
    }
}

impl Default for ErrorStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Selection;

    fn sel() -> Selection {
        Selection::from_span(0, 0, 3)
    }

    #[test]
    fn new_stream_has_no_errors() {
        assert!(ErrorStream::new().no_errors());
    }

    #[test]
    fn fail_records_error_with_line() {
        let mut stream = ErrorStream::new();
        stream.fail(sel(), ErrorCode::TypeError, 4, "");
        assert!(!stream.no_errors());
        assert_eq!(stream.errors[0].line(), 4);
        assert_eq!(stream.errors[0].code, ErrorCode::TypeError);
    }

    #[test]
    fn message_survives_buffer_growth() {
        let mut stream = ErrorStream::new();
        stream.fail(sel(), ErrorCode::TypeError, 1, "");
        for _ in 0..100 {
            stream.warn(WarningLevel::Warn, sel(), ErrorCode::UnusedVariable, 2, "x");
        }
        assert_eq!(stream.message(&stream.errors[0]), "type mismatch");
    }

    #[test]
    fn quoting_appends_selection_text() {
        let mut stream = ErrorStream::new();
        stream.fail(sel(), ErrorCode::BadRead, 1, "vel");
        assert_eq!(
            stream.message(&stream.errors[0]),
            "no variable of this name is in scope: vel"
        );
    }

    #[test]
    fn warn_at_error_level_is_an_error() {
        let mut stream = ErrorStream::new();
        stream.warn(WarningLevel::Error, sel(), ErrorCode::Shadowing, 1, "x");
        assert!(!stream.no_errors());
        assert!(stream.warnings.is_empty());
    }

    #[test]
    fn warn_at_no_warning_is_dropped() {
        let mut stream = ErrorStream::new();
        stream.warn(WarningLevel::NoWarning, sel(), ErrorCode::Shadowing, 1, "x");
        assert!(stream.no_errors());
        assert!(stream.warnings.is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let mut stream = ErrorStream::new();
        stream.fail(sel(), ErrorCode::TypeError, 1, "");
        stream.reset();
        assert!(stream.no_errors());
    }
}
