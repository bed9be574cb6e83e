use crate::data::types::ScalarType;

// To add a primitive:
// 1. Add it to this file, including its entry in `Prim::signature`
// 2. Add its evaluation rule to the interpreter in quiver_midend
// 3. Add its lowering rule to the backend (outside this workspace)

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Prim {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Neg,

    // Comparison
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,

    // Logic
    And,
    Or,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Arith,
    Compare,
    Logic,
}

impl Prim {
    pub fn arity(self) -> usize {
        match self {
            Prim::Neg | Prim::Not => 1,
            _ => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Prim::Add => "add",
            Prim::Sub => "sub",
            Prim::Mul => "mul",
            Prim::Div => "div",
            Prim::Mod => "mod",
            Prim::Min => "min",
            Prim::Max => "max",
            Prim::Neg => "neg",
            Prim::Lt => "lt",
            Prim::Lte => "lte",
            Prim::Gt => "gt",
            Prim::Gte => "gte",
            Prim::Eq => "eq",
            Prim::Neq => "neq",
            Prim::And => "and",
            Prim::Or => "or",
            Prim::Not => "not",
        }
    }

    fn kind(self) -> Kind {
        match self {
            Prim::Add
            | Prim::Sub
            | Prim::Mul
            | Prim::Div
            | Prim::Mod
            | Prim::Min
            | Prim::Max
            | Prim::Neg => Kind::Arith,
            Prim::Lt | Prim::Lte | Prim::Gt | Prim::Gte | Prim::Eq | Prim::Neq => Kind::Compare,
            Prim::And | Prim::Or | Prim::Not => Kind::Logic,
        }
    }

    pub fn is_comparison(self) -> bool {
        self.kind() == Kind::Compare
    }

    /// Types the operands must be cast to before the primitive can be applied.  Arithmetic and
    /// comparisons upcast every operand to their common type; logic ops require booleans.
    pub fn expected_input_types(self, arg_types: &[ScalarType]) -> Vec<ScalarType> {
        match self.kind() {
            Kind::Logic => vec![ScalarType::Bool; arg_types.len()],
            Kind::Arith | Kind::Compare => {
                let common = arg_types
                    .iter()
                    .copied()
                    .reduce(ScalarType::combine)
                    .unwrap_or(ScalarType::Int64);
                // Arithmetic on booleans is performed on integers
                let common = if common == ScalarType::Bool && self.kind() == Kind::Arith {
                    ScalarType::Int64
                } else {
                    common
                };
                vec![common; arg_types.len()]
            }
        }
    }

    pub fn result_type(self, upcast_types: &[ScalarType]) -> ScalarType {
        match self.kind() {
            Kind::Compare | Kind::Logic => ScalarType::Bool,
            Kind::Arith => upcast_types.first().copied().unwrap_or(ScalarType::Int64),
        }
    }
}
