//! Statement-emitting construction helpers shared by every pass.

use crate::adverb_semantics::AdverbSemantics;
use crate::error::Error;
use crate::session::Session;
use crate::shape_infer;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{
    Block, Const, Expr, ExprKind, Field, ForLoop, MergeMap, Stmt, TypeEnv, TypedFn, VarName,
};
use quiver_common::data::types::{ScalarType, Type, INT64};
use std::rc::Rc;

pub struct Builder<'a> {
    session: &'a mut Session,
    type_env: TypeEnv,
    current: Block,
}

fn fold_int(prim: Prim, x: i64, y: i64) -> Option<i64> {
    match prim {
        Prim::Add => x.checked_add(y),
        Prim::Sub => x.checked_sub(y),
        Prim::Mul => x.checked_mul(y),
        // Truncating, like the run-time operation
        Prim::Div => x.checked_div(y),
        Prim::Min => Some(x.min(y)),
        Prim::Max => Some(x.max(y)),
        _ => None,
    }
}

// Types of formal parameters mention function names, which every pass refreshes.  Any callable
// may therefore be passed where a callable is expected.
fn compatible_arg(actual: &Type, formal: &Type) -> bool {
    match (actual, formal) {
        (Type::Fn(_) | Type::Closure(_, _), Type::Fn(_) | Type::Closure(_, _)) => true,
        (Type::Tuple(a), Type::Tuple(f)) => {
            a.len() == f.len() && a.iter().zip(f).all(|(a, f)| compatible_arg(a, f))
        }
        _ => actual == formal,
    }
}

impl<'a> Builder<'a> {
    pub fn new(session: &'a mut Session, type_env: TypeEnv) -> Self {
        Builder {
            session,
            type_env,
            current: Vec::new(),
        }
    }

    pub fn session(&mut self) -> &mut Session {
        self.session
    }

    pub fn type_env(&self) -> &TypeEnv {
        &self.type_env
    }

    pub fn into_parts(self) -> (Block, TypeEnv) {
        (self.current, self.type_env)
    }

    pub fn lookup_type(&self, name: &VarName) -> Result<Type, Error> {
        self.type_env
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(name.clone()))
    }

    pub fn declare(&mut self, name: VarName, type_: Type) -> Expr {
        self.type_env.insert(name.clone(), type_.clone());
        Expr::var(name, type_)
    }

    pub fn fresh_name(&mut self, prefix: &str) -> VarName {
        self.session.fresh_var(prefix)
    }

    pub fn fresh_var(&mut self, type_: Type, prefix: &str) -> Expr {
        let name = self.fresh_name(prefix);
        self.declare(name, type_)
    }

    pub fn insert_stmt(&mut self, stmt: Stmt) {
        self.current.push(stmt);
    }

    /// Runs `body` with a fresh, empty scope, then restores the enclosing scope and returns the
    /// statements `body` emitted.  The enclosing scope is restored even if `body` fails.
    pub fn with_scope<R>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<(Block, R), Error> {
        let outer = std::mem::take(&mut self.current);
        let result = body(self);
        let inner = std::mem::replace(&mut self.current, outer);
        result.map(|result| (inner, result))
    }

    pub fn assign(&mut self, lhs: &Expr, rhs: Expr) {
        debug_assert!(lhs.as_var().is_some());
        self.insert_stmt(Stmt::Assign(lhs.clone(), rhs));
    }

    pub fn assign_temp(&mut self, rhs: Expr, prefix: &str) -> Expr {
        let temp = self.fresh_var(rhs.type_.clone(), prefix);
        self.assign(&temp, rhs);
        temp
    }

    pub fn cast(&mut self, value: &Expr, target: ScalarType) -> Result<Expr, Error> {
        let source = value
            .type_
            .as_scalar()
            .ok_or_else(|| Error::NotAScalar(value.type_.clone()))?;
        if source == target {
            return Ok(value.clone());
        }
        match &value.kind {
            ExprKind::Const(Const::Int(v)) => Ok(Expr::scalar_const(*v, target)),
            ExprKind::Const(Const::Bool(v)) => Ok(Expr::scalar_const(*v as i64, target)),
            _ => Ok(self.assign_temp(
                Expr::new(ExprKind::Cast(Box::new(value.clone())), Type::Scalar(target)),
                "cast",
            )),
        }
    }

    /// Converts `value` to `target`, casting scalars and rejecting anything else that differs.
    pub fn coerce(
        &mut self,
        value: &Expr,
        target: &Type,
        context: &'static str,
    ) -> Result<Expr, Error> {
        if &value.type_ == target {
            return Ok(value.clone());
        }
        match (&value.type_, target) {
            (Type::Scalar(_), Type::Scalar(t)) => self.cast(value, *t),
            _ => Err(Error::TypeMismatch {
                context,
                expected: target.clone(),
                actual: value.type_.clone(),
            }),
        }
    }

    pub fn prim(&mut self, prim: Prim, args: &[Expr], prefix: &str) -> Result<Expr, Error> {
        debug_assert_eq!(args.len(), prim.arity());
        let arg_types = args
            .iter()
            .map(|arg| {
                arg.type_
                    .as_scalar()
                    .ok_or_else(|| Error::NotAScalar(arg.type_.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let upcast = prim.expected_input_types(&arg_types);
        let args = args
            .iter()
            .zip(&upcast)
            .map(|(arg, t)| self.cast(arg, *t))
            .collect::<Result<Vec<_>, _>>()?;
        let result_type = prim.result_type(&upcast);

        if let [x, y] = &args[..] {
            if let (Some(x), Some(y)) = (x.as_const_int(), y.as_const_int()) {
                if let Some(folded) = fold_int(prim, x, y) {
                    return Ok(Expr::int(folded, result_type));
                }
            }
        }

        Ok(self.assign_temp(
            Expr::new(ExprKind::PrimCall(prim, args), Type::Scalar(result_type)),
            prefix,
        ))
    }

    pub fn add(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Add, &[x.clone(), y.clone()], prefix)
    }

    pub fn sub(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Sub, &[x.clone(), y.clone()], prefix)
    }

    pub fn mul(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Mul, &[x.clone(), y.clone()], prefix)
    }

    pub fn div(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Div, &[x.clone(), y.clone()], prefix)
    }

    pub fn min(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Min, &[x.clone(), y.clone()], prefix)
    }

    pub fn lte(&mut self, x: &Expr, y: &Expr, prefix: &str) -> Result<Expr, Error> {
        self.prim(Prim::Lte, &[x.clone(), y.clone()], prefix)
    }

    // Indexing a scalar yields the scalar itself, so adverbs broadcast scalar arguments
    pub fn index(&mut self, container: &Expr, idx: &Expr, prefix: &str) -> Result<Expr, Error> {
        match &container.type_ {
            Type::Scalar(_) => Ok(container.clone()),
            Type::Tuple(_) => match idx.as_const_int() {
                Some(i) if i >= 0 => self.tuple_proj(container, i as usize),
                _ => Err(Error::NonConstantTupleIndex(
                    quiver_common::pretty_print::typed_ir::expr_to_string(idx),
                )),
            },
            Type::Array(_, _) => {
                let result_type =
                    container
                        .type_
                        .index_type(&idx.type_)
                        .ok_or_else(|| Error::InvalidIndex {
                            container: container.type_.clone(),
                            index: idx.type_.clone(),
                        })?;
                Ok(self.assign_temp(
                    Expr::new(
                        ExprKind::Index(Box::new(container.clone()), Box::new(idx.clone())),
                        result_type,
                    ),
                    prefix,
                ))
            }
            other => Err(Error::InvalidIndex {
                container: other.clone(),
                index: idx.type_.clone(),
            }),
        }
    }

    pub fn tuple_proj(&mut self, tuple: &Expr, idx: usize) -> Result<Expr, Error> {
        let elt_types = tuple
            .type_
            .tuple_elts()
            .ok_or_else(|| Error::TypeMismatch {
                context: "tuple projection",
                expected: Type::Tuple(Vec::new()),
                actual: tuple.type_.clone(),
            })?;
        let elt_type = elt_types
            .get(idx)
            .cloned()
            .ok_or_else(|| Error::TupleIndexOutOfRange {
                idx,
                type_: tuple.type_.clone(),
            })?;
        if let ExprKind::Tuple(elts) = &tuple.kind {
            return Ok(elts[idx].clone());
        }
        Ok(self.assign_temp(
            Expr::new(ExprKind::TupleProj(Box::new(tuple.clone()), idx), elt_type),
            "elt",
        ))
    }

    pub fn attr(&mut self, array: &Expr, field: Field) -> Result<Expr, Error> {
        let (elt, rank) = match &array.type_ {
            Type::Array(elt, rank) => (*elt, *rank),
            other => return Err(Error::NotAnArray(other.clone())),
        };
        let type_ = match field {
            Field::Data => Type::Ptr(elt),
            Field::Shape | Field::Strides => Type::shape_tuple(rank),
            Field::Offset | Field::Size => INT64,
        };
        Ok(self.assign_temp(
            Expr::new(ExprKind::Attribute(Box::new(array.clone()), field), type_),
            field.name(),
        ))
    }

    fn shape_or_strides(
        &mut self,
        array: &Expr,
        field: Field,
        dim: Option<usize>,
    ) -> Result<Expr, Error> {
        let tuple = self.attr(array, field)?;
        match dim {
            None => Ok(tuple),
            Some(dim) => {
                let rank = array.type_.rank();
                if dim >= rank {
                    return Err(Error::AxisOutOfRange { axis: dim, rank });
                }
                self.tuple_proj(&tuple, dim)
            }
        }
    }

    /// The whole shape tuple of `array`, or its extent along `dim`.
    pub fn shape(&mut self, array: &Expr, dim: Option<usize>) -> Result<Expr, Error> {
        self.shape_or_strides(array, Field::Shape, dim)
    }

    pub fn strides(&mut self, array: &Expr, dim: Option<usize>) -> Result<Expr, Error> {
        self.shape_or_strides(array, Field::Strides, dim)
    }

    pub fn prod(&mut self, values: &[Expr], prefix: &str) -> Result<Expr, Error> {
        let mut values = values.iter();
        let mut acc = match values.next() {
            Some(first) => first.clone(),
            None => return Ok(Expr::int64(1)),
        };
        for value in values {
            acc = self.mul(&acc, value, prefix)?;
        }
        Ok(acc)
    }

    pub fn alloc_array(
        &mut self,
        elt: ScalarType,
        length: &Expr,
        prefix: &str,
    ) -> Result<Expr, Error> {
        self.alloc_shaped_array(elt, &[length.clone()], prefix)
    }

    /// A fresh row-major array with the given extents.  With no extents at all, the result is an
    /// unbound scalar variable of the element type, to be defined by the caller.
    pub fn alloc_shaped_array(
        &mut self,
        elt: ScalarType,
        dims: &[Expr],
        prefix: &str,
    ) -> Result<Expr, Error> {
        if dims.is_empty() {
            return Ok(self.fresh_var(Type::Scalar(elt), prefix));
        }
        let dims = dims
            .iter()
            .map(|dim| self.cast(dim, ScalarType::Int64))
            .collect::<Result<Vec<_>, _>>()?;
        let nelts = self.prod(&dims, "nelts")?;
        let data = self.assign_temp(
            Expr::new(
                ExprKind::Alloc(elt, Box::new(nelts.clone())),
                Type::Ptr(elt),
            ),
            "data",
        );

        let rank = dims.len();
        let mut strides = vec![Expr::int64(elt.nbytes()); rank];
        for i in (0..rank - 1).rev() {
            strides[i] = self.mul(&strides[i + 1], &dims[i + 1], "stride")?;
        }

        let view = ExprKind::ArrayView {
            data: Box::new(data),
            shape: Box::new(Expr::tuple(dims)),
            strides: Box::new(Expr::tuple(strides)),
            offset: Box::new(Expr::int64(0)),
            size: Box::new(nelts),
        };
        Ok(self.assign_temp(Expr::new(view, Type::Array(elt, rank)), prefix))
    }

    /// Emits the in-place store `array[idx] = value`.  A scalar stored into a region fills it; an
    /// array must match the region's rank and element type exactly.
    pub fn setidx(&mut self, array: &Expr, idx: &Expr, value: &Expr) -> Result<(), Error> {
        let region_type =
            array
                .type_
                .index_type(&idx.type_)
                .ok_or_else(|| Error::InvalidIndex {
                    container: array.type_.clone(),
                    index: idx.type_.clone(),
                })?;
        let value = match (&region_type, &value.type_) {
            (Type::Scalar(t), Type::Scalar(_)) => self.cast(value, *t)?,
            (Type::Array(elt, _), Type::Scalar(_)) => self.cast(value, *elt)?,
            (region, actual) if region == actual => value.clone(),
            (region, actual) => {
                return Err(Error::TypeMismatch {
                    context: "array store",
                    expected: region.clone(),
                    actual: actual.clone(),
                })
            }
        };
        let lhs = Expr::new(
            ExprKind::Index(Box::new(array.clone()), Box::new(idx.clone())),
            region_type,
        );
        self.insert_stmt(Stmt::Assign(lhs, value));
        Ok(())
    }

    pub fn callee(&self, callable: &Expr) -> Result<Rc<TypedFn>, Error> {
        match callable.type_.callee() {
            Some((name, _)) => self.session.lookup(name),
            None => Err(Error::MalformedClosure(format!(
                "a value of type {} is not callable",
                callable.type_
            ))),
        }
    }

    pub fn closure_args(&self, callable: &Expr) -> Result<Vec<Expr>, Error> {
        match (&callable.kind, &callable.type_) {
            (ExprKind::FnRef(_), _) | (_, Type::Fn(_)) => Ok(Vec::new()),
            (ExprKind::Closure(_, captured), Type::Closure(_, captured_types)) => {
                if captured.len() != captured_types.len() {
                    return Err(Error::MalformedClosure(format!(
                        "closure over {} values has {} captured types",
                        captured.len(),
                        captured_types.len()
                    )));
                }
                Ok(captured.clone())
            }
            (_, Type::Closure(_, captured_types)) => Ok(captured_types
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    Expr::new(
                        ExprKind::ClosureElt(Box::new(callable.clone()), i),
                        t.clone(),
                    )
                })
                .collect()),
            (_, other) => Err(Error::MalformedClosure(format!(
                "a value of type {} is not callable",
                other
            ))),
        }
    }

    pub fn call(&mut self, callable: &Expr, args: Vec<Expr>, prefix: &str) -> Result<Expr, Error> {
        let func = self.callee(callable)?;
        let mut all_args = self.closure_args(callable)?;
        all_args.extend(args);
        if all_args.len() != func.arg_names.len() {
            return Err(Error::ArityMismatch {
                func: func.name.clone(),
                expected: func.arg_names.len(),
                actual: all_args.len(),
            });
        }
        let all_args = all_args
            .iter()
            .zip(&func.input_types)
            .map(|(arg, formal)| {
                if compatible_arg(&arg.type_, formal) {
                    Ok(arg.clone())
                } else {
                    self.coerce(arg, formal, "call argument")
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.assign_temp(
            Expr::new(
                ExprKind::Call(func.name.clone(), all_args),
                func.return_type.clone(),
            ),
            prefix,
        ))
    }

    /// A loop counter `i` starting at `start`, the name `i_after` its next value should be bound
    /// to inside the loop body, and the merge map joining the two.
    pub fn loop_counter(&mut self, prefix: &str, start: Expr) -> (Expr, Expr, MergeMap) {
        let counter_name = self.fresh_name(prefix);
        let counter = self.declare(counter_name.clone(), start.type_.clone());
        let after = self.fresh_var(start.type_.clone(), &format!("{}_after", prefix));
        let mut merge = MergeMap::new();
        merge.insert(counter_name, (start, after.clone()));
        (counter, after, merge)
    }

    /// Emits `for i in range(start, stop, step)` whose body is produced by `body`.
    pub fn for_loop(
        &mut self,
        start: &Expr,
        stop: &Expr,
        step: &Expr,
        merge: MergeMap,
        body: impl FnOnce(&mut Self, &Expr) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let start = self.cast(start, ScalarType::Int64)?;
        let stop = self.cast(stop, ScalarType::Int64)?;
        let step = self.cast(step, ScalarType::Int64)?;
        let var = self.fresh_name("i");
        let counter = self.declare(var.clone(), INT64);
        let (body, ()) = self.with_scope(|b| body(b, &counter))?;
        self.insert_stmt(Stmt::ForLoop(ForLoop {
            var,
            start,
            stop,
            step,
            body,
            merge,
        }));
        Ok(())
    }

    /// Allocates storage for the result of applying `callable` to `inner_args` once per point of
    /// `outer_shape`.  The result has extents `outer_shape ++ shape(callable(inner_args))`.
    pub fn create_output_array(
        &mut self,
        callable: &Expr,
        inner_args: Vec<Expr>,
        outer_shape: Vec<Expr>,
        prefix: &str,
    ) -> Result<Expr, Error> {
        let inner = shape_infer::call_shape(self, callable, inner_args)?;
        let (elt, inner_dims) = inner.into_array_parts()?;
        let mut dims = outer_shape;
        dims.extend(inner_dims);
        self.alloc_shaped_array(elt, &dims, prefix)
    }

    /// Allocates the result of mapping `callable` over `arrays` along `axis`.  In cartesian-product
    /// mode each argument contributes its own outer extent; otherwise the highest-rank one does.
    pub fn create_map_output_array(
        &mut self,
        callable: &Expr,
        arrays: &[Expr],
        axis: usize,
        cartesian_product: bool,
        prefix: &str,
    ) -> Result<Expr, Error> {
        let zero = Expr::int64(0);
        let inner_args = arrays
            .iter()
            .map(|array| self.slice_along_axis(array, axis, &zero))
            .collect::<Result<Vec<_>, _>>()?;

        let outer_shape = if cartesian_product {
            let mut extents = Vec::with_capacity(arrays.len());
            for array in arrays {
                if array.type_.rank() > axis {
                    extents.push(self.shape(array, Some(axis))?);
                } else {
                    extents.push(Expr::int64(1));
                }
            }
            extents
        } else {
            let biggest = arrays
                .iter()
                .fold(None, |best: Option<&Expr>, array| match best {
                    Some(best) if best.type_.rank() >= array.type_.rank() => Some(best),
                    _ => Some(array),
                });
            let biggest = match biggest {
                Some(array) if array.type_.rank() > axis => array,
                Some(array) => {
                    return Err(Error::AxisOutOfRange {
                        axis,
                        rank: array.type_.rank(),
                    })
                }
                None => {
                    return Err(Error::AdverbArity {
                        adverb: "map",
                        expected: 1,
                        actual: 0,
                    })
                }
            };
            vec![self.shape(biggest, Some(axis))?]
        };

        self.create_output_array(callable, inner_args, outer_shape, prefix)
    }
}

impl AdverbSemantics for Builder<'_> {
    type Value = Expr;

    fn rank(&self, x: &Expr) -> usize {
        x.type_.rank()
    }

    fn const_int(&mut self, value: i64) -> Expr {
        Expr::int64(value)
    }

    fn none_value(&mut self) -> Expr {
        Expr::none()
    }

    fn is_none_value(&self, x: &Expr) -> bool {
        x.type_ == Type::NoneType
    }

    fn slice_all_value(&mut self) -> Expr {
        Expr::slice_all()
    }

    fn tuple_value(&mut self, elts: Vec<Expr>) -> Result<Expr, Error> {
        Ok(Expr::tuple(elts))
    }

    fn index_value(&mut self, x: &Expr, idx: &Expr) -> Result<Expr, Error> {
        self.index(x, idx, "elt")
    }

    fn size_along_axis(&mut self, x: &Expr, axis: usize) -> Result<Expr, Error> {
        self.shape(x, Some(axis))
    }

    // Only extents known at compile time can be compared here; there is no IR construct for a
    // run-time assertion.
    fn check_equal_sizes(&mut self, axis: usize, sizes: &[Expr]) -> Result<(), Error> {
        let known: Vec<i64> = sizes.iter().filter_map(Expr::as_const_int).collect();
        if known.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::AxisSizeMismatch { axis, sizes: known });
        }
        Ok(())
    }

    fn invoke(&mut self, func: &Expr, args: Vec<Expr>) -> Result<Expr, Error> {
        self.call(func, args, "call_result")
    }

    fn loop_over(
        &mut self,
        start: Expr,
        stop: Expr,
        body: &mut dyn FnMut(&mut Self, Expr) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.for_loop(&start, &stop, &Expr::int64(1), MergeMap::new(), |b, i| {
            body(b, i.clone())
        })
    }

    fn accumulate_loop(
        &mut self,
        start: Expr,
        stop: Expr,
        init: Expr,
        body: &mut dyn FnMut(&mut Self, Expr, Expr) -> Result<Expr, Error>,
    ) -> Result<Expr, Error> {
        let acc_name = self.fresh_name("acc");
        let acc = self.declare(acc_name.clone(), init.type_.clone());
        let acc_after = self.fresh_var(init.type_.clone(), "acc_after");
        let mut merge = MergeMap::new();
        merge.insert(acc_name, (init, acc_after.clone()));
        self.for_loop(&start, &stop, &Expr::int64(1), merge, |b, i| {
            let next = body(b, acc.clone(), i.clone())?;
            let next = b.coerce(&next, &acc.type_, "accumulator")?;
            b.assign(&acc_after, next);
            Ok(())
        })?;
        Ok(acc)
    }

    fn alloc_result(&mut self, first: &Expr, outer_shape: Vec<Expr>) -> Result<Expr, Error> {
        match &first.type_ {
            Type::Scalar(elt) => self.alloc_shaped_array(*elt, &outer_shape, "result"),
            Type::Array(elt, rank) => {
                let mut dims = outer_shape;
                let shape = self.shape(first, None)?;
                for d in 0..*rank {
                    dims.push(self.tuple_proj(&shape, d)?);
                }
                self.alloc_shaped_array(*elt, &dims, "result")
            }
            other => Err(Error::NotAnArray(other.clone())),
        }
    }

    fn set_index(&mut self, array: &Expr, idx: Expr, value: Expr) -> Result<(), Error> {
        self.setidx(array, &idx, &value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interpreter::Value;
    use crate::test::{build_fn, prim_fn, run};
    use quiver_common::data::types::{FLOAT64, INT32};

    #[test]
    fn temporaries_are_typed_and_bound_in_the_current_scope() {
        let mut session = Session::default();
        let mut b = Builder::new(&mut session, TypeEnv::new());
        let x = b.fresh_var(INT32, "x");
        let y = b.fresh_var(FLOAT64, "y");
        let sum = b.add(&x, &y, "sum").unwrap();
        assert_eq!(sum.type_, FLOAT64);

        let (block, env) = b.into_parts();
        // One cast of `x` to f64, then the addition
        assert_eq!(block.len(), 2);
        assert_eq!(env.get(sum.as_var().unwrap()), Some(&FLOAT64));
        match &block[1] {
            Stmt::Assign(lhs, Expr { kind: ExprKind::PrimCall(Prim::Add, args), .. }) => {
                assert_eq!(lhs, &sum);
                assert!(args.iter().all(|arg| arg.type_ == FLOAT64));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn nested_scopes_collect_their_own_statements() {
        let mut session = Session::default();
        let mut b = Builder::new(&mut session, TypeEnv::new());
        let x = b.fresh_var(INT64, "x");
        let _ = b.add(&x, &x, "outer").unwrap();
        let (inner, ()) = b
            .with_scope(|b| {
                b.mul(&x, &x, "inner")?;
                b.mul(&x, &x, "inner")?;
                Ok(())
            })
            .unwrap();
        let failed = b.with_scope(|b| -> Result<(), Error> {
            b.mul(&x, &x, "discarded")?;
            Err(Error::Runtime("stop".into()))
        });
        assert!(failed.is_err());
        let _ = b.add(&x, &x, "outer").unwrap();
        let (outer, _) = b.into_parts();
        assert_eq!(inner.len(), 2);
        assert_eq!(outer.len(), 2);
    }

    #[test]
    fn constant_arithmetic_is_folded() {
        let mut session = Session::default();
        let mut b = Builder::new(&mut session, TypeEnv::new());
        let product = b.mul(&Expr::int64(6), &Expr::int64(7), "p").unwrap();
        assert_eq!(product.as_const_int(), Some(42));
        assert!(b.into_parts().0.is_empty());
    }

    #[test]
    fn index_follows_the_container_kind() {
        let mut session = Session::default();
        let mut b = Builder::new(&mut session, TypeEnv::new());

        let scalar = b.fresh_var(FLOAT64, "s");
        assert_eq!(b.index(&scalar, &Expr::int64(3), "e").unwrap(), scalar);

        let pair = b.fresh_var(Type::Tuple(vec![INT64, FLOAT64]), "pair");
        assert_eq!(b.index(&pair, &Expr::int64(1), "e").unwrap().type_, FLOAT64);
        let i = b.fresh_var(INT64, "i");
        assert!(matches!(
            b.index(&pair, &i, "e"),
            Err(Error::NonConstantTupleIndex(_))
        ));

        let mat = b.fresh_var(Type::Array(ScalarType::Float64, 2), "m");
        let row = b.index(&mat, &i, "row").unwrap();
        assert_eq!(row.type_, Type::Array(ScalarType::Float64, 1));
        let col = b
            .index(&mat, &Expr::tuple(vec![Expr::slice_all(), i.clone()]), "col")
            .unwrap();
        assert_eq!(col.type_, Type::Array(ScalarType::Float64, 1));

        assert!(matches!(b.shape(&scalar, None), Err(Error::NotAnArray(_))));
        assert!(matches!(
            b.shape(&mat, Some(2)),
            Err(Error::AxisOutOfRange { axis: 2, rank: 2 })
        ));
    }

    #[test]
    fn one_dimensional_alloc_uses_the_element_size_as_stride() {
        let mut session = Session::default();
        let mut b = Builder::new(&mut session, TypeEnv::new());
        let n = b.fresh_var(INT64, "n");
        let arr = b.alloc_array(ScalarType::Float32, &n, "arr").unwrap();
        assert_eq!(arr.type_, Type::Array(ScalarType::Float32, 1));
        let (block, _) = b.into_parts();
        let view = block
            .iter()
            .find_map(|stmt| match stmt {
                Stmt::Assign(lhs, rhs) if lhs == &arr => Some(rhs.clone()),
                _ => None,
            })
            .unwrap();
        match view.kind {
            ExprKind::ArrayView { strides, size, .. } => {
                assert_eq!(*strides, Expr::tuple(vec![Expr::int64(4)]));
                assert_eq!(*size, n);
            }
            other => panic!("expected an array view, got {:?}", other),
        }
    }

    fn int_vector() -> Type {
        Type::Array(ScalarType::Int64, 1)
    }

    #[test]
    fn cartesian_map_output_has_one_extent_per_argument() {
        let mut session = Session::default();
        let mul = prim_fn(&mut session, "mul", Prim::Mul, ScalarType::Int64);
        let f = build_fn(
            &mut session,
            "outer_shape",
            vec![int_vector(), int_vector()],
            |b, args| {
                let out =
                    b.create_map_output_array(&Expr::fn_ref(&mul), args, 0, true, "outer")?;
                assert_eq!(out.type_, Type::Array(ScalarType::Int64, 2));
                b.shape(&out, None)
            },
        );
        let result = run(
            &session,
            &f,
            vec![
                Value::int_array(vec![3], &[1, 2, 3]),
                Value::int_array(vec![4], &[1, 2, 3, 4]),
            ],
        );
        assert_eq!(result, Value::Tuple(vec![Value::int(3), Value::int(4)]));
    }

    #[test]
    fn broadcast_map_output_follows_the_highest_rank_argument() {
        let mut session = Session::default();
        let add = prim_fn(&mut session, "add", Prim::Add, ScalarType::Int64);
        let f = build_fn(
            &mut session,
            "broadcast_shape",
            vec![INT64, int_vector()],
            |b, args| {
                let out =
                    b.create_map_output_array(&Expr::fn_ref(&add), args, 0, false, "sums")?;
                assert_eq!(out.type_, int_vector());
                b.shape(&out, None)
            },
        );
        let result = run(
            &session,
            &f,
            vec![Value::int(10), Value::int_array(vec![5], &[1, 2, 3, 4, 5])],
        );
        assert_eq!(result, Value::Tuple(vec![Value::int(5)]));

        let mut b = Builder::new(&mut session, TypeEnv::new());
        let x = b.fresh_var(INT64, "x");
        assert!(matches!(
            b.create_map_output_array(&Expr::fn_ref(&add), &[x.clone(), x], 0, false, "r"),
            Err(Error::AxisOutOfRange { axis: 0, rank: 0 })
        ));
    }

    #[test]
    fn row_major_strides_are_in_bytes() {
        let mut session = Session::default();
        let f = build_fn(&mut session, "strides", vec![INT64, INT64], |b, args| {
            let arr = b.alloc_shaped_array(ScalarType::Float64, args, "arr")?;
            let row_stride = b.strides(&arr, Some(0))?;
            let all = b.strides(&arr, None)?;
            let col_stride = b.tuple_proj(&all, 1)?;
            Ok(Expr::tuple(vec![row_stride, col_stride]))
        });
        let result = run(&session, &f, vec![Value::int(3), Value::int(5)]);
        assert_eq!(result, Value::Tuple(vec![Value::int(5 * 8), Value::int(8)]));
    }
}
