use crate::model::Selection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Structure
    Newline,
    Comment,
    EndOfFile,
    ScannerError,
    ArgClose,
    Filepath,

    // Literals
    Integer,
    StringLiteral,
    Identifier,
    TrueLiteral,
    FalseLiteral,
    Infinity,
    EmptySet,
    Gravity,
    PoundSterling,
    Euro,
    Dollar,

    // Predefined sets
    DoublestruckR,
    DoublestruckQ,
    DoublestruckZ,
    DoublestruckN,
    DoublestruckC,
    DoublestruckB,
    DoublestruckP,
    DoublestruckH,
    SpecialOrthogonal,

    // Operators
    Plus,
    Minus,
    Multiply,
    Divide,
    Forwardslash,
    Backslash,
    Times,
    DotProduct,
    Percent,
    OuterProduct,
    ODot,
    Composition,
    Caret,
    Exclam,
    Pound,
    Nabla,
    Not,
    Equals,
    NotEqual,
    Approx,
    NotApprox,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Member,
    NotMember,
    Subset,
    SubsetEq,
    Cup,
    Cap,
    Conjunction,
    Disjunction,
    LeftArrow,
    DefEquals,
    Colon,
    Semicolon,
    Comma,
    Period,
    MapsTo,

    // Brackets
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    LeftCeil,
    RightCeil,
    LeftFloor,
    RightFloor,
    Bar,
    DoubleBar,
    LeftAngle,
    RightAngle,
    LeftDoubleBrace,
    RightDoubleBrace,

    // Keywords
    Algorithm,
    Assert,
    Break,
    Case,
    Class,
    Continue,
    Default,
    Else,
    Enum,
    For,
    From,
    If,
    Import,
    As,
    Namespace,
    Plot,
    Print,
    Private,
    Public,
    Return,
    Static,
    Switch,
    Unknown,
    While,

    // Keyword functions
    Sin,
    Cos,
    Tan,
    Arcsin,
    Arccos,
    Arctan,
    Arctan2,
    Csc,
    Sec,
    Cot,
    Arccsc,
    Arcsec,
    Arccot,
    Sinh,
    Cosh,
    Tanh,
    Arcsinh,
    Arccosh,
    Arctanh,
    Csch,
    Sech,
    Coth,
    Arccsch,
    Arcsech,
    Arccoth,
    Exp,
    NaturalLog,
    Log,
    Erf,
    Erfc,
    Sgn,
    Length,
    Rows,
    Cols,

    // Typeset constructs
    ConstructFraction,
    ConstructBinomial,
    ConstructSuperscript,
    ConstructSubscript,
    ConstructDualscript,
    ConstructSqrt,
    ConstructNRoot,
    ConstructLimit,
    ConstructIntegral,
    ConstructDefiniteIntegral,
    ConstructBigSum0,
    ConstructBigSum,
    ConstructBigProd0,
    ConstructBigProd,
    ConstructAccentHat,
    ConstructAccentBar,
    ConstructMatrix,
    ConstructCases,
    SettingsUpdate,
}

/// A scanned token. `rows`/`cols` carry the structural parameters of
/// matrix and cases construct tokens; zero elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub sel: Selection,
    pub rows: u16,
    pub cols: u16,
}

impl Token {
    pub fn new(kind: TokenKind, sel: Selection) -> Self {
        Token {
            kind,
            sel,
            rows: 0,
            cols: 0,
        }
    }

    pub fn with_dims(kind: TokenKind, sel: Selection, rows: u16, cols: u16) -> Self {
        Token {
            kind,
            sel,
            rows,
            cols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Selection;

    #[test]
    fn token_keeps_selection() {
        let token = Token::new(TokenKind::Integer, Selection::from_span(0, 3, 5));
        assert_eq!(token.sel.start, 3);
        assert_eq!(token.sel.end, 5);
        assert_eq!(token.rows, 0);
    }

    #[test]
    fn matrix_token_carries_dims() {
        let token = Token::with_dims(
            TokenKind::ConstructMatrix,
            Selection::from_span(0, 0, 1),
            2,
            3,
        );
        assert_eq!((token.rows, token.cols), (2, 3));
    }
}
