//! Typed, structured SSA IR consumed and produced by every mid-end pass.

use crate::data::prims::Prim;
use crate::data::types::{FuncName, ScalarType, Type, BOOL};
use im_rc::OrdMap;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarName(pub String);

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Const {
    Bool(bool),
    Int(i64),
    Float(f64),
    None,
}

/// Fields of an array view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Data,
    Shape,
    // In bytes
    Strides,
    // In elements, relative to the start of `Data`
    Offset,
    Size,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Data => "data",
            Field::Shape => "shape",
            Field::Strides => "strides",
            Field::Offset => "offset",
            Field::Size => "size",
        }
    }
}

/// Where a tiled adverb gets its tile size from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TilePolicy {
    // Next entry of the pass's fixed tile size list
    Fixed,
    // Element of a tile-size tuple supplied by the caller at run time
    Dynamic,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub type_: Type,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Var(VarName),
    Const(Const),
    PrimCall(Prim, Vec<Expr>),
    // Callee is always a registered function; closure captures are already prepended to `args`
    Call(FuncName, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    TupleProj(Box<Expr>, usize),
    Attribute(Box<Expr>, Field),
    Cast(Box<Expr>),
    Alloc(ScalarType, Box<Expr>),
    ArrayView {
        data: Box<Expr>,
        shape: Box<Expr>,
        strides: Box<Expr>,
        offset: Box<Expr>,
        size: Box<Expr>,
    },
    Tuple(Vec<Expr>),
    Slice {
        start: Box<Expr>,
        stop: Box<Expr>,
        step: Box<Expr>,
    },
    FnRef(FuncName),
    Closure(FuncName, Vec<Expr>),
    ClosureElt(Box<Expr>, usize),

    Map {
        func: Box<Expr>,
        args: Vec<Expr>,
        axis: usize,
    },
    Reduce {
        func: Box<Expr>,
        combine: Box<Expr>,
        init: Option<Box<Expr>>,
        args: Vec<Expr>,
        axis: usize,
    },
    Scan {
        func: Box<Expr>,
        combine: Box<Expr>,
        emit: Box<Expr>,
        init: Option<Box<Expr>>,
        args: Vec<Expr>,
        axis: usize,
    },
    AllPairs {
        func: Box<Expr>,
        args: Vec<Expr>,
        axis: usize,
    },
    TiledMap {
        func: Box<Expr>,
        args: Vec<Expr>,
        axes: Vec<usize>,
        tile: TilePolicy,
    },
    TiledReduce {
        func: Box<Expr>,
        combine: Box<Expr>,
        init: Box<Expr>,
        args: Vec<Expr>,
        axes: Vec<usize>,
        tile: TilePolicy,
    },
}

pub type Block = Vec<Stmt>;

/// Join-point name -> (value flowing in on entry / from the true branch, value flowing in from the
/// loop back edge / the false branch).
pub type MergeMap = BTreeMap<VarName, (Expr, Expr)>;

pub type TypeEnv = OrdMap<VarName, Type>;

#[derive(Clone, Debug, PartialEq)]
pub struct If {
    pub cond: Expr,
    pub true_block: Block,
    pub false_block: Block,
    pub merge: MergeMap,
}

/// `cond` is re-evaluated at the loop header on every iteration, after the merge names have been
/// bound, so it must be a side-effect-free expression over the merge names and outer values.
#[derive(Clone, Debug, PartialEq)]
pub struct While {
    pub cond: Expr,
    pub body: Block,
    pub merge: MergeMap,
}

/// Iterates `var` over `start, start + step, ...` while `var < stop` (or `var > stop` when `step` is
/// negative).
#[derive(Clone, Debug, PartialEq)]
pub struct ForLoop {
    pub var: VarName,
    pub start: Expr,
    pub stop: Expr,
    pub step: Expr,
    pub body: Block,
    pub merge: MergeMap,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    // The left-hand side is either a `Var` (a definition) or an `Index` (an in-place store)
    Assign(Expr, Expr),
    Return(Expr),
    If(If),
    While(While),
    ForLoop(ForLoop),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypedFn {
    pub name: FuncName,
    pub arg_names: Vec<VarName>,
    pub input_types: Vec<Type>,
    pub return_type: Type,
    pub type_env: TypeEnv,
    pub body: Block,
}

impl TypedFn {
    pub fn fn_type(&self) -> Type {
        Type::Fn(self.name.clone())
    }
}

impl Expr {
    pub fn new(kind: ExprKind, type_: Type) -> Self {
        Expr { kind, type_ }
    }

    pub fn var(name: VarName, type_: Type) -> Self {
        Expr::new(ExprKind::Var(name), type_)
    }

    pub fn int(value: i64, type_: ScalarType) -> Self {
        debug_assert!(type_.is_int());
        Expr::new(ExprKind::Const(Const::Int(value)), Type::Scalar(type_))
    }

    pub fn int64(value: i64) -> Self {
        Expr::int(value, ScalarType::Int64)
    }

    pub fn float(value: f64, type_: ScalarType) -> Self {
        debug_assert!(type_.is_float());
        Expr::new(ExprKind::Const(Const::Float(value)), Type::Scalar(type_))
    }

    pub fn bool(value: bool) -> Self {
        Expr::new(ExprKind::Const(Const::Bool(value)), BOOL)
    }

    pub fn none() -> Self {
        Expr::new(ExprKind::Const(Const::None), Type::NoneType)
    }

    /// The `:` slice, selecting an entire dimension.
    pub fn slice_all() -> Self {
        Expr::new(
            ExprKind::Slice {
                start: Box::new(Expr::none()),
                stop: Box::new(Expr::none()),
                step: Box::new(Expr::int64(1)),
            },
            Type::Slice,
        )
    }

    pub fn slice(start: Expr, stop: Expr, step: Expr) -> Self {
        Expr::new(
            ExprKind::Slice {
                start: Box::new(start),
                stop: Box::new(stop),
                step: Box::new(step),
            },
            Type::Slice,
        )
    }

    pub fn tuple(elts: Vec<Expr>) -> Self {
        let type_ = Type::Tuple(elts.iter().map(|e| e.type_.clone()).collect());
        Expr::new(ExprKind::Tuple(elts), type_)
    }

    pub fn fn_ref(func: &TypedFn) -> Self {
        Expr::new(ExprKind::FnRef(func.name.clone()), func.fn_type())
    }

    pub fn closure(func: &TypedFn, captured: Vec<Expr>) -> Self {
        let captured_types = captured.iter().map(|e| e.type_.clone()).collect();
        Expr::new(
            ExprKind::Closure(func.name.clone(), captured),
            Type::Closure(func.name.clone(), captured_types),
        )
    }

    /// A constant of the given scalar type, converting `value` as needed.
    pub fn scalar_const(value: i64, type_: ScalarType) -> Self {
        match type_ {
            ScalarType::Bool => Expr::bool(value != 0),
            t if t.is_int() => Expr::int(value, t),
            t => Expr::float(value as f64, t),
        }
    }

    pub fn as_var(&self) -> Option<&VarName> {
        match &self.kind {
            ExprKind::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::Const(Const::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self.kind, ExprKind::Const(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, ExprKind::Const(Const::None))
    }

    /// Immediate subexpressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::Var(_) | ExprKind::Const(_) | ExprKind::FnRef(_) => Vec::new(),
            ExprKind::PrimCall(_, args)
            | ExprKind::Call(_, args)
            | ExprKind::Tuple(args)
            | ExprKind::Closure(_, args) => args.iter().collect(),
            ExprKind::Index(x, y) => vec![&**x, &**y],
            ExprKind::TupleProj(x, _)
            | ExprKind::Attribute(x, _)
            | ExprKind::Cast(x)
            | ExprKind::Alloc(_, x)
            | ExprKind::ClosureElt(x, _) => vec![&**x],
            ExprKind::ArrayView {
                data,
                shape,
                strides,
                offset,
                size,
            } => vec![&**data, &**shape, &**strides, &**offset, &**size],
            ExprKind::Slice { start, stop, step } => vec![&**start, &**stop, &**step],
            ExprKind::Map { func, args, .. }
            | ExprKind::AllPairs { func, args, .. }
            | ExprKind::TiledMap { func, args, .. } => {
                std::iter::once(&**func).chain(args).collect()
            }
            ExprKind::Reduce {
                func,
                combine,
                init,
                args,
                ..
            } => [&**func, &**combine]
                .into_iter()
                .chain(init.as_deref())
                .chain(args)
                .collect(),
            ExprKind::Scan {
                func,
                combine,
                emit,
                init,
                args,
                ..
            } => [&**func, &**combine, &**emit]
                .into_iter()
                .chain(init.as_deref())
                .chain(args)
                .collect(),
            ExprKind::TiledReduce {
                func,
                combine,
                init,
                args,
                ..
            } => [&**func, &**combine, &**init]
                .into_iter()
                .chain(args)
                .collect(),
        }
    }

    /// Whether `pred` holds for this expression or any expression nested in it.
    pub fn any(&self, pred: &mut impl FnMut(&Expr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|child| child.any(pred))
    }
}

impl Stmt {
    pub fn assign(lhs: Expr, rhs: Expr) -> Self {
        Stmt::Assign(lhs, rhs)
    }

    /// Expressions appearing directly in this statement, excluding those inside nested blocks but
    /// including both sides of its merge.
    pub fn exprs(&self) -> Vec<&Expr> {
        fn merge_values(merge: &MergeMap) -> impl Iterator<Item = &Expr> {
            merge.values().flat_map(|(l, r)| [l, r])
        }
        match self {
            Stmt::Assign(lhs, rhs) => vec![lhs, rhs],
            Stmt::Return(value) => vec![value],
            Stmt::If(if_) => std::iter::once(&if_.cond)
                .chain(merge_values(&if_.merge))
                .collect(),
            Stmt::While(while_) => std::iter::once(&while_.cond)
                .chain(merge_values(&while_.merge))
                .collect(),
            Stmt::ForLoop(for_loop) => [&for_loop.start, &for_loop.stop, &for_loop.step]
                .into_iter()
                .chain(merge_values(&for_loop.merge))
                .collect(),
        }
    }

    pub fn blocks(&self) -> Vec<&Block> {
        match self {
            Stmt::Assign(_, _) | Stmt::Return(_) => Vec::new(),
            Stmt::If(if_) => vec![&if_.true_block, &if_.false_block],
            Stmt::While(while_) => vec![&while_.body],
            Stmt::ForLoop(for_loop) => vec![&for_loop.body],
        }
    }
}

/// Whether `pred` holds for any expression anywhere in `block`, nested blocks included.
pub fn block_any_expr(block: &[Stmt], pred: &mut impl FnMut(&Expr) -> bool) -> bool {
    block.iter().any(|stmt| {
        stmt.exprs().into_iter().any(|e| e.any(pred))
            || stmt.blocks().into_iter().any(|b| block_any_expr(b, pred))
    })
}
