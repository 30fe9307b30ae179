//! Operation codes for parse-tree nodes.

/// Every node in the parse tree carries one `Op`. The parser produces the
/// surface ops; the resolution passes rewrite nodes in place (e.g.
/// `Identifier` → `ReadGlobal`, `Switch` → `SwitchNumeric`, `Power` →
/// `Invert`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Statements
    Block,
    LexicalScope,
    DoNothing,
    ExprStmt,
    Print,
    Assert,
    Plot,
    Assign,
    Equal,
    Reassign,
    ElementwiseAssignment,
    If,
    IfElse,
    While,
    For,
    RangedFor,
    Switch,
    SwitchNumeric,
    SwitchString,
    Case,
    Default,
    Break,
    Continue,
    Return,
    ReturnEmpty,
    Algorithm,
    PrototypeAlg,
    Lambda,
    Import,
    FromImport,
    FileRef,
    Namespace,
    Class,
    Enum,
    UnknownList,
    SettingsUpdate,
    Comment,
    List,

    // Identifiers and reads (rewritten by the passes)
    Identifier,
    ReadGlobal,
    ReadUpvalue,
    SingleCharMultProxy,
    Error,

    // Literals
    IntegerLiteral,
    DecimalLiteral,
    StringLiteral,
    True,
    False,
    Infinity,
    EmptySet,
    Undefined,

    // Predefined constants
    Pi,
    EulersNumber,
    GoldenRatio,
    SpeedOfLight,
    PlanckConstant,
    ReducedPlanckConstant,
    StefanBoltzmannConstant,
    IdentityAutosize,
    MaybeTranspose,
    GammaFunction,
    Gravity,
    CurrencyPounds,
    CurrencyEuros,
    CurrencyDollars,

    // Predefined sets
    Reals,
    PositiveReals,
    NegativeReals,
    Rationals,
    PositiveRationals,
    NegativeRationals,
    Integers,
    Naturals,
    ComplexNums,
    Booleans,
    Primes,
    Quaternions,
    SpecialOrthogonal,

    // Arithmetic
    Addition,
    Subtraction,
    Multiplication,
    Division,
    Forwardslash,
    Backslash,
    Cross,
    Dot,
    Modulus,
    OuterProduct,
    EntrywiseProduct,
    Composition,
    ImplicitMultiply,
    UnaryMinus,
    Power,
    Sqrt,
    NRoot,
    Factorial,
    Binomial,
    Fraction,
    Derivative,
    Partial,
    Limit,
    Integral,
    DefiniteIntegral,
    Summation,
    Product,

    // Matrix-shaped operations
    Matrix,
    Cases,
    UnitVector,
    IdentityMatrix,
    OnesMatrix,
    ZeroMatrix,
    Transpose,
    Adjoint,
    PseudoInverse,
    Invert,
    LinearSolve,
    NormSquared,
    Norm,
    NormP,
    Norm1,
    NormInfinity,
    AccentHat,
    AccentBar,

    // Grouping
    GroupParen,
    GroupBracket,
    Ceil,
    Floor,
    Abs,
    InnerProduct,
    SetLiteral,
    SetBuilder,
    IntegerRange,
    IntervalCloseClose,
    IntervalCloseOpen,

    // Comparison and logic
    Less,
    Greater,
    NotEqual,
    Approx,
    NotApprox,
    Member,
    NotMember,
    Subset,
    SubsetEq,
    Union,
    Intersection,
    LogicalAnd,
    LogicalOr,
    LogicalNot,
    Cardinality,
    Gradient,
    Divergence,
    Curl,

    // Calls and access
    Call,
    AmbiguousParenthetical,
    ScopeAccess,
    SubscriptAccess,
    Slice,
    SliceAll,

    // Keyword functions
    Length,
    RowsFn,
    ColsFn,
    SignFunction,
    ErrorFunction,
    CompErrFunc,
    Exp,
    NaturalLog,
    Log,
    LogBase,
    Sine,
    Cosine,
    Tangent,
    Arcsine,
    Arccosine,
    Arctangent,
    Arctangent2,
    Cosecant,
    Secant,
    Cotangent,
    Arccosecant,
    Arcsecant,
    Arccotangent,
    HyperbolicSine,
    HyperbolicCosine,
    HyperbolicTangent,
    HyperbolicArcsine,
    HyperbolicArccosine,
    HyperbolicArctangent,
    HyperbolicCosecant,
    HyperbolicSecant,
    HyperbolicCotangent,
    HyperbolicArccosecant,
    HyperbolicArcsecant,
    HyperbolicArccotangent,
}

impl Op {
    /// Ops the symbol-lexical pass lowers predefined constants to.
    pub fn is_predefined_constant(self) -> bool {
        matches!(
            self,
            Op::Pi
                | Op::EulersNumber
                | Op::GoldenRatio
                | Op::SpeedOfLight
                | Op::PlanckConstant
                | Op::ReducedPlanckConstant
                | Op::StefanBoltzmannConstant
                | Op::IdentityAutosize
                | Op::MaybeTranspose
                | Op::GammaFunction
                | Op::Gravity
        )
    }

    /// Unary elementwise numeric functions sharing one interpreter path.
    pub fn scalar_function(self) -> Option<fn(f64) -> f64> {
        match self {
            Op::Sine => Some(f64::sin),
            Op::Cosine => Some(f64::cos),
            Op::Tangent => Some(f64::tan),
            Op::Arcsine => Some(f64::asin),
            Op::Arccosine => Some(f64::acos),
            Op::Arctangent => Some(f64::atan),
            Op::Cosecant => Some(|x| 1.0 / x.sin()),
            Op::Secant => Some(|x| 1.0 / x.cos()),
            Op::Cotangent => Some(|x| 1.0 / x.tan()),
            Op::Arccosecant => Some(|x: f64| (1.0 / x).asin()),
            Op::Arcsecant => Some(|x: f64| (1.0 / x).acos()),
            Op::Arccotangent => Some(|x: f64| (1.0 / x).atan()),
            Op::HyperbolicSine => Some(f64::sinh),
            Op::HyperbolicCosine => Some(f64::cosh),
            Op::HyperbolicTangent => Some(f64::tanh),
            Op::HyperbolicArcsine => Some(f64::asinh),
            Op::HyperbolicArccosine => Some(f64::acosh),
            Op::HyperbolicArctangent => Some(f64::atanh),
            Op::HyperbolicCosecant => Some(|x: f64| 1.0 / x.sinh()),
            Op::HyperbolicSecant => Some(|x: f64| 1.0 / x.cosh()),
            Op::HyperbolicCotangent => Some(|x: f64| 1.0 / x.tanh()),
            Op::HyperbolicArccosecant => Some(|x: f64| (1.0 / x).asinh()),
            Op::HyperbolicArcsecant => Some(|x: f64| (1.0 / x).acosh()),
            Op::HyperbolicArccotangent => Some(|x: f64| (1.0 / x).atanh()),
            Op::Exp => Some(f64::exp),
            Op::NaturalLog => Some(f64::ln),
            Op::Log => Some(f64::log10),
            Op::SignFunction => Some(|x: f64| {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }),
            Op::ErrorFunction => Some(erf),
            Op::CompErrFunc => Some(|x| 1.0 - erf(x)),
            _ => None,
        }
    }
}

/// Abramowitz & Stegun 7.1.26 rational approximation, max error 1.5e-7.
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_constants_are_flagged() {
        assert!(Op::Pi.is_predefined_constant());
        assert!(!Op::Addition.is_predefined_constant());
    }

    #[test]
    fn scalar_function_covers_trig() {
        let sine = Op::Sine.scalar_function().unwrap();
        assert!((sine(std::f64::consts::FRAC_PI_2) - 1.0).abs() < 1e-12);
        assert!(Op::Block.scalar_function().is_none());
    }

    #[test]
    fn erf_matches_known_values() {
        assert!((erf(0.0)).abs() < 1e-12);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
    }
}
