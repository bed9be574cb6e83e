//! Symbolic evaluation of a callee to find the shape of its result.

use crate::adverb_semantics::AdverbSemantics;
use crate::builder::Builder;
use crate::error::Error;
use quiver_common::data::typed_ir::{Const, Expr, ExprKind, Field, Stmt, TypedFn, VarName};
use quiver_common::data::types::{FuncName, ScalarType, Type};
use std::collections::BTreeMap;

// Beyond this depth the callee is assumed to be recursive
const MAX_CALL_DEPTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum Bound {
    Absent,
    Known(Expr),
    Unknown,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    // Carries the caller-side value when it can be computed without running the callee
    Scalar(ScalarType, Option<Expr>),
    Array(ScalarType, Vec<Expr>),
    Tuple(Vec<Shape>),
    Slice { start: Bound, stop: Bound, step: Bound },
    Ptr(ScalarType),
    Func(FuncName, Vec<Shape>),
    NoneValue,
}

impl Shape {
    /// Element type and extents of an array or scalar result.
    pub fn into_array_parts(self) -> Result<(ScalarType, Vec<Expr>), Error> {
        match self {
            Shape::Scalar(elt, _) => Ok((elt, Vec::new())),
            Shape::Array(elt, dims) => Ok((elt, dims)),
            other => Err(Error::ShapeInference(format!(
                "expected an array or scalar result, got {:?}",
                other
            ))),
        }
    }
}

pub struct ShapeInference<'b, 'a> {
    builder: &'b mut Builder<'a>,
    depth: usize,
}

type Env = BTreeMap<VarName, Shape>;

/// The shape of `callable(args)`, with extents computed from the caller-side `args`.
pub fn call_shape(b: &mut Builder<'_>, callable: &Expr, args: Vec<Expr>) -> Result<Shape, Error> {
    let mut infer = ShapeInference {
        builder: b,
        depth: 0,
    };
    let func = infer.value_shape(callable)?;
    let args = args
        .iter()
        .map(|arg| infer.value_shape(arg))
        .collect::<Result<Vec<_>, _>>()?;
    infer.invoke(&func, args)
}

fn known_extent(shape: &Shape) -> Result<Expr, Error> {
    match shape {
        Shape::Scalar(_, Some(value)) => Ok(value.clone()),
        other => Err(Error::ShapeInference(format!(
            "array extent {:?} depends on a value unknown at the call site",
            other
        ))),
    }
}

impl<'b, 'a> ShapeInference<'b, 'a> {
    /// The shape of a value that already exists on the caller side.
    fn value_shape(&mut self, expr: &Expr) -> Result<Shape, Error> {
        match &expr.type_ {
            Type::Scalar(t) => Ok(Shape::Scalar(*t, Some(expr.clone()))),
            Type::NoneType => Ok(Shape::NoneValue),
            Type::Ptr(t) => Ok(Shape::Ptr(*t)),
            Type::Array(t, rank) => {
                let shape = self.builder.shape(expr, None)?;
                let dims = (0..*rank)
                    .map(|d| self.builder.tuple_proj(&shape, d))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Shape::Array(*t, dims))
            }
            Type::Tuple(elt_types) => {
                let elts = match &expr.kind {
                    ExprKind::Tuple(elts) => elts.clone(),
                    _ => elt_types
                        .iter()
                        .enumerate()
                        .map(|(i, t)| {
                            Expr::new(ExprKind::TupleProj(Box::new(expr.clone()), i), t.clone())
                        })
                        .collect(),
                };
                Ok(Shape::Tuple(
                    elts.iter()
                        .map(|elt| self.value_shape(elt))
                        .collect::<Result<_, _>>()?,
                ))
            }
            Type::Slice => match &expr.kind {
                ExprKind::Slice { start, stop, step } => Ok(Shape::Slice {
                    start: self.value_bound(start)?,
                    stop: self.value_bound(stop)?,
                    step: self.value_bound(step)?,
                }),
                _ => Ok(Shape::Slice {
                    start: Bound::Unknown,
                    stop: Bound::Unknown,
                    step: Bound::Unknown,
                }),
            },
            Type::Fn(name) => Ok(Shape::Func(name.clone(), Vec::new())),
            Type::Closure(name, _) => {
                let captured = self.builder.closure_args(expr)?;
                Ok(Shape::Func(
                    name.clone(),
                    captured
                        .iter()
                        .map(|c| self.value_shape(c))
                        .collect::<Result<_, _>>()?,
                ))
            }
        }
    }

    fn value_bound(&mut self, expr: &Expr) -> Result<Bound, Error> {
        if expr.is_none() {
            Ok(Bound::Absent)
        } else {
            Ok(Bound::Known(expr.clone()))
        }
    }

    fn shape_bound(&mut self, env: &Env, expr: &Expr) -> Result<Bound, Error> {
        if expr.is_none() {
            return Ok(Bound::Absent);
        }
        match self.eval_expr(env, expr)? {
            Shape::Scalar(_, Some(value)) => Ok(Bound::Known(value)),
            Shape::NoneValue => Ok(Bound::Absent),
            _ => Ok(Bound::Unknown),
        }
    }

    fn eval_fn(&mut self, func: &TypedFn, args: Vec<Shape>) -> Result<Shape, Error> {
        let mut env: Env = func.arg_names.iter().cloned().zip(args).collect();
        self.eval_block(&mut env, &func.body)?.ok_or_else(|| {
            Error::ShapeInference(format!("'{}' has no reachable return", func.name))
        })
    }

    fn eval_block(&mut self, env: &mut Env, block: &[Stmt]) -> Result<Option<Shape>, Error> {
        for stmt in block {
            if let Some(result) = self.eval_stmt(env, stmt)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn eval_merge_entries(
        &mut self,
        env: &mut Env,
        merge: &BTreeMap<VarName, (Expr, Expr)>,
    ) -> Result<(), Error> {
        for (name, (left, _)) in merge {
            let shape = self.eval_expr(env, left)?;
            env.insert(name.clone(), shape);
        }
        Ok(())
    }

    fn eval_stmt(&mut self, env: &mut Env, stmt: &Stmt) -> Result<Option<Shape>, Error> {
        match stmt {
            Stmt::Assign(lhs, rhs) => {
                // Stores into arrays cannot change their shape
                if let ExprKind::Var(name) = &lhs.kind {
                    let shape = self.eval_expr(env, rhs)?;
                    env.insert(name.clone(), shape);
                }
                Ok(None)
            }
            Stmt::Return(value) => Ok(Some(self.eval_expr(env, value)?)),
            Stmt::If(if_) => {
                if let Some(result) = self.eval_block(env, &if_.true_block)? {
                    return Ok(Some(result));
                }
                if let Some(result) = self.eval_block(env, &if_.false_block)? {
                    return Ok(Some(result));
                }
                self.eval_merge_entries(env, &if_.merge)?;
                Ok(None)
            }
            Stmt::While(while_) => {
                self.eval_merge_entries(env, &while_.merge)?;
                Ok(None)
            }
            Stmt::ForLoop(for_loop) => {
                self.eval_merge_entries(env, &for_loop.merge)?;
                Ok(None)
            }
        }
    }

    fn eval_exprs(&mut self, env: &Env, exprs: &[Expr]) -> Result<Vec<Shape>, Error> {
        exprs.iter().map(|e| self.eval_expr(env, e)).collect()
    }

    fn eval_expr(&mut self, env: &Env, expr: &Expr) -> Result<Shape, Error> {
        match &expr.kind {
            ExprKind::Var(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownVariable(name.clone())),

            ExprKind::Const(Const::None) => Ok(Shape::NoneValue),

            ExprKind::Const(_) => match expr.type_.as_scalar() {
                Some(t) => Ok(Shape::Scalar(t, Some(expr.clone()))),
                None => Err(Error::NotAScalar(expr.type_.clone())),
            },

            ExprKind::PrimCall(prim, args) => {
                let result_type = expr
                    .type_
                    .as_scalar()
                    .ok_or_else(|| Error::NotAScalar(expr.type_.clone()))?;
                let args = self.eval_exprs(env, args)?;
                let known = args
                    .iter()
                    .map(|arg| match arg {
                        Shape::Scalar(_, Some(value)) => Some(value.clone()),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>();
                match known {
                    Some(values) => {
                        let value = self.builder.prim(*prim, &values, "dim")?;
                        Ok(Shape::Scalar(result_type, Some(value)))
                    }
                    None => Ok(Shape::Scalar(result_type, None)),
                }
            }

            ExprKind::Call(name, args) => {
                let args = self.eval_exprs(env, args)?;
                self.invoke(&Shape::Func(name.clone(), Vec::new()), args)
            }

            ExprKind::Index(container, idx) => {
                let container = self.eval_expr(env, container)?;
                let idx = self.eval_expr(env, idx)?;
                self.index_value(&container, &idx)
            }

            ExprKind::TupleProj(tuple, i) => match self.eval_expr(env, tuple)? {
                Shape::Tuple(mut elts) if *i < elts.len() => Ok(elts.swap_remove(*i)),
                _ => Err(Error::TupleIndexOutOfRange {
                    idx: *i,
                    type_: tuple.type_.clone(),
                }),
            },

            ExprKind::Attribute(array, field) => match self.eval_expr(env, array)? {
                Shape::Array(elt, dims) => Ok(match field {
                    Field::Shape => Shape::Tuple(
                        dims.into_iter()
                            .map(|d| Shape::Scalar(ScalarType::Int64, Some(d)))
                            .collect(),
                    ),
                    Field::Strides => {
                        Shape::Tuple(vec![Shape::Scalar(ScalarType::Int64, None); dims.len()])
                    }
                    Field::Data => Shape::Ptr(elt),
                    Field::Offset | Field::Size => Shape::Scalar(ScalarType::Int64, None),
                }),
                _ => Err(Error::NotAnArray(array.type_.clone())),
            },

            ExprKind::Cast(value) => {
                let target = expr
                    .type_
                    .as_scalar()
                    .ok_or_else(|| Error::NotAScalar(expr.type_.clone()))?;
                match self.eval_expr(env, value)? {
                    Shape::Scalar(_, Some(value)) => Ok(Shape::Scalar(
                        target,
                        Some(self.builder.cast(&value, target)?),
                    )),
                    Shape::Scalar(_, None) => Ok(Shape::Scalar(target, None)),
                    _ => Err(Error::NotAScalar(value.type_.clone())),
                }
            }

            ExprKind::Alloc(elt, _) => Ok(Shape::Ptr(*elt)),

            ExprKind::ArrayView { shape, .. } => {
                let elt = expr
                    .type_
                    .elt_type()
                    .ok_or_else(|| Error::NotAnArray(expr.type_.clone()))?;
                match self.eval_expr(env, shape)? {
                    Shape::Tuple(dims) => Ok(Shape::Array(
                        elt,
                        dims.iter().map(known_extent).collect::<Result<_, _>>()?,
                    )),
                    other => Err(Error::ShapeInference(format!(
                        "array view with non-tuple shape {:?}",
                        other
                    ))),
                }
            }

            ExprKind::Tuple(elts) => Ok(Shape::Tuple(self.eval_exprs(env, elts)?)),

            ExprKind::Slice { start, stop, step } => Ok(Shape::Slice {
                start: self.shape_bound(env, start)?,
                stop: self.shape_bound(env, stop)?,
                step: self.shape_bound(env, step)?,
            }),

            ExprKind::FnRef(name) => Ok(Shape::Func(name.clone(), Vec::new())),

            ExprKind::Closure(name, captured) => Ok(Shape::Func(
                name.clone(),
                self.eval_exprs(env, captured)?,
            )),

            ExprKind::ClosureElt(closure, i) => match self.eval_expr(env, closure)? {
                Shape::Func(_, mut captured) if *i < captured.len() => {
                    Ok(captured.swap_remove(*i))
                }
                _ => Err(Error::MalformedClosure(format!(
                    "no captured value {} in a value of type {}",
                    i, closure.type_
                ))),
            },

            ExprKind::Map { func, args, axis } => {
                let func = self.eval_expr(env, func)?;
                let args = self.eval_exprs(env, args)?;
                self.eval_map(&func, &args, *axis)
            }

            ExprKind::Reduce {
                func,
                combine,
                init,
                args,
                axis,
            } => {
                let func = self.eval_expr(env, func)?;
                let combine = self.eval_expr(env, combine)?;
                let init = match init {
                    Some(init) => Some(self.eval_expr(env, init)?),
                    None => None,
                };
                let args = self.eval_exprs(env, args)?;
                self.eval_reduce(&func, &combine, init.as_ref(), &args, *axis)
            }

            ExprKind::Scan {
                func,
                combine,
                emit,
                init,
                args,
                axis,
            } => {
                let func = self.eval_expr(env, func)?;
                let combine = self.eval_expr(env, combine)?;
                let emit = self.eval_expr(env, emit)?;
                let init = match init {
                    Some(init) => Some(self.eval_expr(env, init)?),
                    None => None,
                };
                let args = self.eval_exprs(env, args)?;
                self.eval_scan(&func, &combine, &emit, init.as_ref(), &args, *axis)
            }

            ExprKind::AllPairs { func, args, axis } => {
                let func = self.eval_expr(env, func)?;
                let args = self.eval_exprs(env, args)?;
                match &args[..] {
                    [x, y] => self.eval_all_pairs(&func, x, y, *axis),
                    _ => Err(Error::AdverbArity {
                        adverb: "allpairs",
                        expected: 2,
                        actual: args.len(),
                    }),
                }
            }

            // A tiled adverb has the result shape of its function applied to the whole input
            ExprKind::TiledMap { func, args, .. } | ExprKind::TiledReduce { func, args, .. } => {
                let func = self.eval_expr(env, func)?;
                let args = self.eval_exprs(env, args)?;
                self.invoke(&func, args)
            }
        }
    }

    // Extent of `start:stop` taken from a dimension of extent `dim`
    fn slice_extent(
        &mut self,
        dim: &Expr,
        start: &Bound,
        stop: &Bound,
        step: &Bound,
    ) -> Result<Expr, Error> {
        match step {
            Bound::Absent => {}
            Bound::Known(step) if step.as_const_int() == Some(1) => {}
            _ => {
                return Err(Error::ShapeInference(
                    "only unit-stride slices have an extent known at the call site".into(),
                ))
            }
        }
        let unknown = || {
            Error::ShapeInference("slice bound depends on a value unknown at the call site".into())
        };
        let stop = match stop {
            Bound::Absent => dim.clone(),
            Bound::Known(stop) => self.builder.min(stop, dim, "slice_stop")?,
            Bound::Unknown => return Err(unknown()),
        };
        match start {
            Bound::Absent => Ok(stop),
            Bound::Known(start) => self.builder.sub(&stop, start, "extent"),
            Bound::Unknown => Err(unknown()),
        }
    }
}

impl AdverbSemantics for ShapeInference<'_, '_> {
    type Value = Shape;

    fn rank(&self, x: &Shape) -> usize {
        match x {
            Shape::Array(_, dims) => dims.len(),
            _ => 0,
        }
    }

    fn const_int(&mut self, value: i64) -> Shape {
        Shape::Scalar(ScalarType::Int64, Some(Expr::int64(value)))
    }

    fn none_value(&mut self) -> Shape {
        Shape::NoneValue
    }

    fn is_none_value(&self, x: &Shape) -> bool {
        matches!(x, Shape::NoneValue)
    }

    fn slice_all_value(&mut self) -> Shape {
        Shape::Slice {
            start: Bound::Absent,
            stop: Bound::Absent,
            step: Bound::Known(Expr::int64(1)),
        }
    }

    fn tuple_value(&mut self, elts: Vec<Shape>) -> Result<Shape, Error> {
        Ok(Shape::Tuple(elts))
    }

    fn index_value(&mut self, x: &Shape, idx: &Shape) -> Result<Shape, Error> {
        match x {
            Shape::Scalar(_, _) => Ok(x.clone()),
            Shape::Tuple(elts) => match idx {
                Shape::Scalar(_, Some(i)) => match i.as_const_int() {
                    Some(i) if i >= 0 && (i as usize) < elts.len() => Ok(elts[i as usize].clone()),
                    Some(_) => Err(Error::ShapeInference(format!(
                        "tuple index {:?} out of range",
                        i
                    ))),
                    None => Err(Error::NonConstantTupleIndex(format!("{:?}", i))),
                },
                other => Err(Error::NonConstantTupleIndex(format!("{:?}", other))),
            },
            Shape::Array(elt, dims) => {
                let components: Vec<&Shape> = match idx {
                    Shape::Tuple(items) => items.iter().collect(),
                    single => vec![single],
                };
                if components.len() > dims.len() {
                    return Err(Error::ShapeInference(format!(
                        "{} indices into an array of rank {}",
                        components.len(),
                        dims.len()
                    )));
                }
                let mut result_dims = Vec::new();
                for (d, dim) in dims.iter().enumerate() {
                    match components.get(d) {
                        None => result_dims.push(dim.clone()),
                        Some(Shape::Scalar(_, _)) => {}
                        Some(Shape::Slice { start, stop, step }) => {
                            result_dims.push(self.slice_extent(dim, start, stop, step)?)
                        }
                        Some(other) => {
                            return Err(Error::ShapeInference(format!(
                                "invalid index component {:?}",
                                other
                            )))
                        }
                    }
                }
                if result_dims.is_empty() {
                    Ok(Shape::Scalar(*elt, None))
                } else {
                    Ok(Shape::Array(*elt, result_dims))
                }
            }
            other => Err(Error::ShapeInference(format!("cannot index {:?}", other))),
        }
    }

    fn size_along_axis(&mut self, x: &Shape, axis: usize) -> Result<Shape, Error> {
        match x {
            Shape::Array(_, dims) if axis < dims.len() => Ok(Shape::Scalar(
                ScalarType::Int64,
                Some(dims[axis].clone()),
            )),
            _ => Err(Error::AxisOutOfRange {
                axis,
                rank: self.rank(x),
            }),
        }
    }

    fn check_equal_sizes(&mut self, axis: usize, sizes: &[Shape]) -> Result<(), Error> {
        let known: Vec<i64> = sizes
            .iter()
            .filter_map(|size| match size {
                Shape::Scalar(_, Some(value)) => value.as_const_int(),
                _ => None,
            })
            .collect();
        if known.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::AxisSizeMismatch { axis, sizes: known });
        }
        Ok(())
    }

    fn invoke(&mut self, func: &Shape, args: Vec<Shape>) -> Result<Shape, Error> {
        let (name, captured) = match func {
            Shape::Func(name, captured) => (name, captured),
            other => {
                return Err(Error::MalformedClosure(format!(
                    "{:?} is not callable",
                    other
                )))
            }
        };
        let callee = self.builder.session().lookup(name)?;
        let mut all_args = captured.clone();
        all_args.extend(args);
        if all_args.len() != callee.arg_names.len() {
            return Err(Error::ArityMismatch {
                func: name.clone(),
                expected: callee.arg_names.len(),
                actual: all_args.len(),
            });
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::ShapeInference(format!(
                "call depth limit reached inside '{}'; recursive functions are not supported",
                name
            )));
        }
        self.depth += 1;
        let result = self.eval_fn(&callee, all_args);
        self.depth -= 1;
        result
    }

    // Loop bodies only store into results whose shapes are already known
    fn loop_over(
        &mut self,
        _start: Shape,
        _stop: Shape,
        _body: &mut dyn FnMut(&mut Self, Shape) -> Result<(), Error>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn accumulate_loop(
        &mut self,
        _start: Shape,
        _stop: Shape,
        init: Shape,
        body: &mut dyn FnMut(&mut Self, Shape, Shape) -> Result<Shape, Error>,
    ) -> Result<Shape, Error> {
        body(self, init, Shape::Scalar(ScalarType::Int64, None))
    }

    fn alloc_result(&mut self, first: &Shape, outer_shape: Vec<Shape>) -> Result<Shape, Error> {
        let mut dims = outer_shape
            .iter()
            .map(known_extent)
            .collect::<Result<Vec<_>, _>>()?;
        match first {
            Shape::Scalar(elt, _) => Ok(Shape::Array(*elt, dims)),
            Shape::Array(elt, inner) => {
                dims.extend(inner.iter().cloned());
                Ok(Shape::Array(*elt, dims))
            }
            other => Err(Error::ShapeInference(format!(
                "adverb results must be scalars or arrays, got {:?}",
                other
            ))),
        }
    }

    fn set_index(&mut self, _array: &Shape, _idx: Shape, _value: Shape) -> Result<(), Error> {
        Ok(())
    }
}
