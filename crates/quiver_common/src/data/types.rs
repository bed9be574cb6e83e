use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScalarType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ScalarType {
    pub fn nbytes(self) -> i64 {
        match self {
            ScalarType::Bool => 1,
            ScalarType::Int32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::Float64 => 8,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, ScalarType::Int32 | ScalarType::Int64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    /// The smallest type both operands can be upcast to without losing range.
    pub fn combine(self, other: ScalarType) -> ScalarType {
        use ScalarType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Float64, _) | (_, Float64) => Float64,
            // An Int64 does not fit in the mantissa of a Float32
            (Float32, Int64) | (Int64, Float32) => Float64,
            (Float32, _) | (_, Float32) => Float32,
            (Int64, _) | (_, Int64) => Int64,
            (Int32, _) | (_, Int32) => Int32,
            (Bool, Bool) => Bool,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::Int32 => "i32",
            ScalarType::Int64 => "i64",
            ScalarType::Float32 => "f32",
            ScalarType::Float64 => "f64",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncName(pub String);

impl fmt::Display for FuncName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    Scalar(ScalarType),
    NoneType,
    // Raw buffer returned by an allocation
    Ptr(ScalarType),
    Array(ScalarType, usize),
    Tuple(Vec<Type>),
    // (start, stop, step) triple; absent bounds are represented by `None` constants
    Slice,
    Fn(FuncName),
    Closure(FuncName, Vec<Type>),
}

pub const BOOL: Type = Type::Scalar(ScalarType::Bool);
pub const INT32: Type = Type::Scalar(ScalarType::Int32);
pub const INT64: Type = Type::Scalar(ScalarType::Int64);
pub const FLOAT32: Type = Type::Scalar(ScalarType::Float32);
pub const FLOAT64: Type = Type::Scalar(ScalarType::Float64);

impl Type {
    /// Arrays of rank zero collapse to their element type.
    pub fn make_array(elt: ScalarType, rank: usize) -> Type {
        if rank == 0 {
            Type::Scalar(elt)
        } else {
            Type::Array(elt, rank)
        }
    }

    pub fn shape_tuple(rank: usize) -> Type {
        Type::Tuple(vec![INT64; rank])
    }

    pub fn rank(&self) -> usize {
        match self {
            Type::Array(_, rank) => *rank,
            _ => 0,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Type::Scalar(s) if s.is_int())
    }

    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn elt_type(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(s) | Type::Array(s, _) | Type::Ptr(s) => Some(*s),
            _ => None,
        }
    }

    pub fn tuple_elts(&self) -> Option<&[Type]> {
        match self {
            Type::Tuple(elts) => Some(elts),
            _ => None,
        }
    }

    /// The function a callable value refers to, plus the types of any captured values.
    pub fn callee(&self) -> Option<(&FuncName, &[Type])> {
        match self {
            Type::Fn(name) => Some((name, &[])),
            Type::Closure(name, captured) => Some((name, captured)),
            _ => None,
        }
    }

    /// Whether a value of this type can live in a register, i.e. contains no array anywhere.
    pub fn is_simple_assignment(&self) -> bool {
        match self {
            Type::Tuple(elts) => elts.iter().all(Type::is_simple_assignment),
            Type::Array(_, _) => false,
            _ => true,
        }
    }

    /// Result type of indexing a value of this type, or `None` if the index is not meaningful.
    pub fn index_type(&self, idx: &Type) -> Option<Type> {
        let (elt, rank) = match self {
            Type::Array(elt, rank) => (*elt, *rank),
            _ => return None,
        };

        let dropped = match idx {
            Type::Scalar(s) if s.is_int() => 1,
            Type::Slice => 0,
            Type::Tuple(items) => {
                if items.len() > rank {
                    return None;
                }
                let mut dropped = 0;
                for item in items {
                    match item {
                        Type::Scalar(s) if s.is_int() => dropped += 1,
                        Type::Slice => {}
                        _ => return None,
                    }
                }
                dropped
            }
            _ => return None,
        };

        if dropped > rank {
            return None;
        }
        Some(Type::make_array(elt, rank - dropped))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(s) => write!(f, "{}", s),
            Type::NoneType => write!(f, "none"),
            Type::Ptr(s) => write!(f, "ptr<{}>", s),
            Type::Array(s, rank) => write!(f, "array{}<{}>", rank, s),
            Type::Tuple(elts) => {
                write!(f, "(")?;
                for (i, elt) in elts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elt)?;
                }
                if elts.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Type::Slice => write!(f, "slice"),
            Type::Fn(name) => write!(f, "fn {}", name),
            Type::Closure(name, captured) => {
                write!(f, "closure {}[", name)?;
                for (i, t) in captured.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "]")
            }
        }
    }
}
