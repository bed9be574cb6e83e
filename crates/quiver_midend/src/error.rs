use quiver_common::data::typed_ir::VarName;
use quiver_common::data::types::{FuncName, Type};

/// Every failure the mid-end can report.  None of these are recoverable: a pass that hits one
/// abandons the function it was rewriting and publishes nothing.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("axis {axis} is out of range for a value of rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("arguments disagree on their size along axis {axis}: {sizes:?}")]
    AxisSizeMismatch { axis: usize, sizes: Vec<i64> },

    #[error("rank mismatch in {context}: {detail}")]
    RankMismatch { context: &'static str, detail: String },

    #[error("type mismatch in {context}: expected {expected}, got {actual}")]
    TypeMismatch {
        context: &'static str,
        expected: Type,
        actual: Type,
    },

    #[error("merge entry for '{name}' (declared {declared}) joins values of type {left} and {right}")]
    MergeTypeMismatch {
        name: VarName,
        declared: Type,
        left: Type,
        right: Type,
    },

    #[error("expected an array, got a value of type {0}")]
    NotAnArray(Type),

    #[error("expected a scalar, got a value of type {0}")]
    NotAScalar(Type),

    #[error("tuple index must be an integer constant, got '{0}'")]
    NonConstantTupleIndex(String),

    #[error("tuple index {idx} is out of range for {type_}")]
    TupleIndexOutOfRange { idx: usize, type_: Type },

    #[error("cannot index a value of type {container} with an index of type {index}")]
    InvalidIndex { container: Type, index: Type },

    #[error("unknown function '{0}'")]
    UnknownFunction(FuncName),

    #[error("function '{0}' is already registered")]
    DuplicateFunction(FuncName),

    #[error("unknown variable '{0}'")]
    UnknownVariable(VarName),

    #[error("function '{func}' expects {expected} arguments, got {actual}")]
    ArityMismatch {
        func: FuncName,
        expected: usize,
        actual: usize,
    },

    #[error("{adverb} expects {expected} array arguments, got {actual}")]
    AdverbArity {
        adverb: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("malformed closure: {0}")]
    MalformedClosure(String),

    #[error("downward-stepping loops cannot be unrolled (step = {0})")]
    DownwardStep(i64),

    #[error("unroll factor must be positive, got {0}")]
    InvalidUnrollFactor(usize),

    #[error("'{0}' reaches a tiled adverb through a recursive call")]
    RecursiveTiling(FuncName),

    #[error("'{0}' needs run-time tile sizes but is used as a function value")]
    DynamicTilesInCallable(FuncName),

    #[error("cannot inline '{func}': {reason}")]
    UnsupportedInline { func: FuncName, reason: &'static str },

    #[error("shape inference failed: {0}")]
    ShapeInference(String),

    #[error("'{0}' is defined more than once")]
    Redefinition(VarName),

    #[error("'{name}' is declared as {declared} but defined with type {actual}")]
    DeclarationMismatch {
        name: VarName,
        declared: Type,
        actual: Type,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}
