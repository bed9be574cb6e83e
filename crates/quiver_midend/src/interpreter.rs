//! A direct evaluator for the typed IR, used to check that passes preserve meaning.

use crate::adverb_semantics::AdverbSemantics;
use crate::error::Error;
use crate::session::Session;
use im_rc::OrdMap;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{Block, Const, Expr, ExprKind, Field, MergeMap, Stmt, VarName};
use quiver_common::data::types::{FuncName, ScalarType};
use std::cell::RefCell;
use std::rc::Rc;

const STACK_RED_ZONE_BYTES: usize = 256 * 1024;
const STACK_GROW_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    fn zero(elt: ScalarType) -> Scalar {
        Scalar::Int(0).convert(elt)
    }

    fn scalar_type(self) -> ScalarType {
        match self {
            Scalar::Bool(_) => ScalarType::Bool,
            Scalar::Int(_) => ScalarType::Int64,
            Scalar::Float(_) => ScalarType::Float64,
        }
    }

    fn as_int(self) -> Result<i64, Error> {
        match self {
            Scalar::Bool(b) => Ok(b as i64),
            Scalar::Int(i) => Ok(i),
            Scalar::Float(f) => Err(Error::Runtime(format!(
                "expected an integer, got the float {}",
                f
            ))),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as i64 as f64,
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
        }
    }

    fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(i) => i != 0,
            Scalar::Float(f) => f != 0.0,
        }
    }

    fn convert(self, target: ScalarType) -> Scalar {
        match target {
            ScalarType::Bool => Scalar::Bool(self.as_bool()),
            ScalarType::Int32 => Scalar::Int(match self {
                Scalar::Bool(b) => b as i64,
                Scalar::Int(i) => i as i32 as i64,
                Scalar::Float(f) => f as i32 as i64,
            }),
            ScalarType::Int64 => Scalar::Int(match self {
                Scalar::Bool(b) => b as i64,
                Scalar::Int(i) => i,
                Scalar::Float(f) => f as i64,
            }),
            ScalarType::Float32 => Scalar::Float(self.as_f64() as f32 as f64),
            ScalarType::Float64 => Scalar::Float(self.as_f64()),
        }
    }
}

pub type Buffer = Rc<RefCell<Vec<Scalar>>>;

/// A strided view of a shared buffer.
#[derive(Clone, Debug)]
pub struct ArrayValue {
    pub elt: ScalarType,
    pub data: Buffer,
    pub shape: Vec<i64>,
    // In elements
    pub strides: Vec<i64>,
    pub offset: i64,
}

impl ArrayValue {
    pub fn zeroed(elt: ScalarType, shape: Vec<i64>) -> ArrayValue {
        let len: i64 = shape.iter().product();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        ArrayValue {
            elt,
            data: Rc::new(RefCell::new(vec![Scalar::zero(elt); len.max(0) as usize])),
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn len(&self) -> i64 {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Buffer offsets of every element, in row-major order
    fn offsets(&self) -> Vec<usize> {
        if self.shape.iter().any(|&d| d <= 0) {
            return Vec::new();
        }
        let rank = self.shape.len();
        let mut result = Vec::with_capacity(self.len() as usize);
        let mut idx = vec![0i64; rank];
        loop {
            let offset: i64 = self.offset
                + idx
                    .iter()
                    .zip(&self.strides)
                    .map(|(i, s)| i * s)
                    .sum::<i64>();
            result.push(offset as usize);
            let mut d = rank;
            loop {
                if d == 0 {
                    return result;
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < self.shape[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
    }

    pub fn elements(&self) -> Vec<Scalar> {
        let data = self.data.borrow();
        self.offsets().into_iter().map(|o| data[o]).collect()
    }

    /// The (possibly rank-zero) view selected by `idx`.
    fn resolve(&self, idx: &Value) -> Result<ArrayValue, Error> {
        let components = match idx {
            Value::Tuple(items) => items.clone(),
            single => vec![single.clone()],
        };
        if components.len() > self.shape.len() {
            return Err(Error::Runtime(format!(
                "{} indices into an array of rank {}",
                components.len(),
                self.shape.len()
            )));
        }

        let mut shape = Vec::new();
        let mut strides = Vec::new();
        let mut offset = self.offset;
        for (d, (&dim, &stride)) in self.shape.iter().zip(&self.strides).enumerate() {
            match components.get(d) {
                None => {
                    shape.push(dim);
                    strides.push(stride);
                }
                Some(Value::Scalar(i)) => {
                    let i = i.as_int()?;
                    if i < 0 || i >= dim {
                        return Err(Error::Runtime(format!(
                            "index {} out of bounds for axis {} of extent {}",
                            i, d, dim
                        )));
                    }
                    offset += i * stride;
                }
                Some(Value::Slice(start, stop, step)) => {
                    if *step <= 0 {
                        return Err(Error::Runtime(format!("slice step {} is not positive", step)));
                    }
                    let start = start.unwrap_or(0).clamp(0, dim);
                    let stop = stop.unwrap_or(dim).clamp(start, dim);
                    shape.push((stop - start + step - 1) / step);
                    strides.push(stride * step);
                    offset += start * stride;
                }
                Some(other) => {
                    return Err(Error::Runtime(format!("invalid index component {:?}", other)))
                }
            }
        }

        Ok(ArrayValue {
            elt: self.elt,
            data: self.data.clone(),
            shape,
            strides,
            offset,
        })
    }

    pub fn read(&self, idx: &Value) -> Result<Value, Error> {
        let view = self.resolve(idx)?;
        if view.shape.is_empty() {
            let value = view.data.borrow()[view.offset as usize];
            Ok(Value::Scalar(value))
        } else {
            Ok(Value::Array(view))
        }
    }

    /// Stores `value` into the region selected by `idx`.  Scalars fill the region; arrays must
    /// match its trailing extents and are repeated over any leading ones.
    pub fn write(&self, idx: &Value, value: Value) -> Result<(), Error> {
        let region = self.resolve(idx)?;
        let targets = region.offsets();
        let values = match value {
            Value::Scalar(s) => vec![s],
            Value::Array(source) => {
                if !region.shape.ends_with(&source.shape) {
                    return Err(Error::Runtime(format!(
                        "cannot store an array of shape {:?} into a region of shape {:?}",
                        source.shape, region.shape
                    )));
                }
                // Snapshot first: source and destination may share a buffer
                source.elements()
            }
            other => {
                return Err(Error::Runtime(format!(
                    "cannot store {:?} into an array",
                    other
                )))
            }
        };
        if values.is_empty() {
            return Ok(());
        }
        let mut data = self.data.borrow_mut();
        for (k, target) in targets.into_iter().enumerate() {
            data[target] = values[k % values.len()].convert(self.elt);
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Scalar(Scalar),
    None,
    Tuple(Vec<Value>),
    Slice(Option<i64>, Option<i64>, i64),
    Buffer(ScalarType, Buffer),
    Array(ArrayValue),
    Closure(FuncName, Vec<Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::None, Value::None) => true,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Slice(a0, a1, a2), Value::Slice(b0, b1, b2)) => (a0, a1, a2) == (b0, b1, b2),
            (Value::Buffer(_, a), Value::Buffer(_, b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => {
                a.shape == b.shape && a.elements() == b.elements()
            }
            (Value::Closure(a, ca), Value::Closure(b, cb)) => a == b && ca == cb,
            _ => false,
        }
    }
}

impl Value {
    pub fn int(value: i64) -> Value {
        Value::Scalar(Scalar::Int(value))
    }

    pub fn float(value: f64) -> Value {
        Value::Scalar(Scalar::Float(value))
    }

    pub fn bool(value: bool) -> Value {
        Value::Scalar(Scalar::Bool(value))
    }

    pub fn array(elt: ScalarType, shape: Vec<i64>, values: Vec<Scalar>) -> Value {
        let array = ArrayValue::zeroed(elt, shape);
        debug_assert_eq!(array.len() as usize, values.len());
        {
            let mut data = array.data.borrow_mut();
            for (slot, value) in data.iter_mut().zip(values) {
                *slot = value.convert(elt);
            }
        }
        Value::Array(array)
    }

    pub fn int_array(shape: Vec<i64>, values: &[i64]) -> Value {
        Value::array(
            ScalarType::Int64,
            shape,
            values.iter().map(|&v| Scalar::Int(v)).collect(),
        )
    }

    pub fn float_array(shape: Vec<i64>, values: &[f64]) -> Value {
        Value::array(
            ScalarType::Float64,
            shape,
            values.iter().map(|&v| Scalar::Float(v)).collect(),
        )
    }

    pub fn shape(&self) -> Vec<i64> {
        match self {
            Value::Array(array) => array.shape.clone(),
            _ => Vec::new(),
        }
    }

    /// Elements in row-major order; a scalar is its own single element.
    pub fn elements(&self) -> Option<Vec<Scalar>> {
        match self {
            Value::Scalar(s) => Some(vec![*s]),
            Value::Array(array) => Some(array.elements()),
            _ => None,
        }
    }

    fn as_scalar(&self) -> Result<Scalar, Error> {
        match self {
            Value::Scalar(s) => Ok(*s),
            other => Err(Error::Runtime(format!("expected a scalar, got {:?}", other))),
        }
    }

    fn as_int(&self) -> Result<i64, Error> {
        self.as_scalar()?.as_int()
    }

    fn as_opt_int(&self) -> Result<Option<i64>, Error> {
        match self {
            Value::None => Ok(None),
            other => other.as_int().map(Some),
        }
    }

    fn as_ints(&self) -> Result<Vec<i64>, Error> {
        match self {
            Value::Tuple(items) => items.iter().map(Value::as_int).collect(),
            other => Err(Error::Runtime(format!("expected a tuple, got {:?}", other))),
        }
    }
}

fn eval_prim(prim: Prim, args: &[Scalar], result_type: ScalarType) -> Result<Scalar, Error> {
    let any_float = args.iter().any(|arg| matches!(arg, Scalar::Float(_)));
    let result = match (prim, args) {
        (Prim::Not, [x]) => Scalar::Bool(!x.as_bool()),
        (Prim::And, [x, y]) => Scalar::Bool(x.as_bool() && y.as_bool()),
        (Prim::Or, [x, y]) => Scalar::Bool(x.as_bool() || y.as_bool()),

        (Prim::Neg, [x]) if any_float => Scalar::Float(-x.as_f64()),
        (Prim::Neg, [x]) => Scalar::Int(x.as_int()?.wrapping_neg()),

        (p, [x, y]) if p.is_comparison() => {
            let ordering = if any_float {
                x.as_f64().partial_cmp(&y.as_f64())
            } else {
                Some(x.as_int()?.cmp(&y.as_int()?))
            };
            use std::cmp::Ordering::*;
            Scalar::Bool(match (p, ordering) {
                (Prim::Lt, Some(o)) => o == Less,
                (Prim::Lte, Some(o)) => o != Greater,
                (Prim::Gt, Some(o)) => o == Greater,
                (Prim::Gte, Some(o)) => o != Less,
                (Prim::Eq, Some(o)) => o == Equal,
                (Prim::Neq, o) => o != Some(Equal),
                // NaN compares false
                _ => false,
            })
        }

        (p, [x, y]) if any_float || result_type.is_float() => {
            let (x, y) = (x.as_f64(), y.as_f64());
            Scalar::Float(match p {
                Prim::Add => x + y,
                Prim::Sub => x - y,
                Prim::Mul => x * y,
                Prim::Div => x / y,
                Prim::Mod => x % y,
                Prim::Min => x.min(y),
                Prim::Max => x.max(y),
                p => return Err(Error::Runtime(format!("'{}' is not binary", p.name()))),
            })
        }

        (p, [x, y]) => {
            let (x, y) = (x.as_int()?, y.as_int()?);
            if matches!(p, Prim::Div | Prim::Mod) && y == 0 {
                return Err(Error::Runtime("integer division by zero".into()));
            }
            Scalar::Int(match p {
                Prim::Add => x.wrapping_add(y),
                Prim::Sub => x.wrapping_sub(y),
                Prim::Mul => x.wrapping_mul(y),
                Prim::Div => x.wrapping_div(y),
                Prim::Mod => x.wrapping_rem(y),
                Prim::Min => x.min(y),
                Prim::Max => x.max(y),
                p => return Err(Error::Runtime(format!("'{}' is not binary", p.name()))),
            })
        }

        (p, args) => {
            return Err(Error::Runtime(format!(
                "'{}' applied to {} operands",
                p.name(),
                args.len()
            )))
        }
    };
    Ok(result.convert(result_type))
}

type Locals = OrdMap<VarName, Value>;

pub struct Interpreter<'s> {
    session: &'s Session,
}

/// Runs the registered function `name` on `args`.
pub fn run(session: &Session, name: &FuncName, args: Vec<Value>) -> Result<Value, Error> {
    Interpreter::new(session).call(name, args)
}

impl<'s> Interpreter<'s> {
    pub fn new(session: &'s Session) -> Self {
        Interpreter { session }
    }

    pub fn call(&mut self, name: &FuncName, args: Vec<Value>) -> Result<Value, Error> {
        let func = self.session.lookup(name)?;
        if args.len() != func.arg_names.len() {
            return Err(Error::ArityMismatch {
                func: name.clone(),
                expected: func.arg_names.len(),
                actual: args.len(),
            });
        }
        stacker::maybe_grow(STACK_RED_ZONE_BYTES, STACK_GROW_BYTES, move || {
            let mut locals: Locals = func.arg_names.iter().cloned().zip(args).collect();
            match self.eval_block(&mut locals, &func.body)? {
                Some(result) => Ok(result),
                None => Err(Error::Runtime(format!(
                    "'{}' finished without returning",
                    func.name
                ))),
            }
        })
    }

    fn eval_block(&mut self, locals: &mut Locals, block: &Block) -> Result<Option<Value>, Error> {
        for stmt in block {
            if let Some(result) = self.eval_stmt(locals, stmt)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    // All merge values are read before any merge name is rebound
    fn bind_merge(
        &mut self,
        locals: &mut Locals,
        merge: &MergeMap,
        take_left: bool,
    ) -> Result<(), Error> {
        let mut values = Vec::with_capacity(merge.len());
        for (name, (left, right)) in merge {
            let source = if take_left { left } else { right };
            values.push((name.clone(), self.eval_expr(locals, source)?));
        }
        for (name, value) in values {
            locals.insert(name, value);
        }
        Ok(())
    }

    fn eval_bool(&mut self, locals: &Locals, cond: &Expr) -> Result<bool, Error> {
        match self.eval_expr(locals, cond)? {
            Value::Scalar(Scalar::Bool(b)) => Ok(b),
            other => Err(Error::Runtime(format!(
                "condition evaluated to {:?}",
                other
            ))),
        }
    }

    fn eval_stmt(&mut self, locals: &mut Locals, stmt: &Stmt) -> Result<Option<Value>, Error> {
        match stmt {
            Stmt::Assign(lhs, rhs) => {
                let value = self.eval_expr(locals, rhs)?;
                match &lhs.kind {
                    ExprKind::Var(name) => {
                        locals.insert(name.clone(), value);
                    }
                    ExprKind::Index(array, idx) => {
                        let array = self.eval_expr(locals, array)?;
                        let idx = self.eval_expr(locals, idx)?;
                        match array {
                            Value::Array(array) => array.write(&idx, value)?,
                            other => {
                                return Err(Error::Runtime(format!(
                                    "store into non-array {:?}",
                                    other
                                )))
                            }
                        }
                    }
                    _ => {
                        return Err(Error::Runtime(
                            "assignment target is neither a variable nor an index".into(),
                        ))
                    }
                }
                Ok(None)
            }

            Stmt::Return(value) => Ok(Some(self.eval_expr(locals, value)?)),

            Stmt::If(if_) => {
                let cond = self.eval_bool(locals, &if_.cond)?;
                let block = if cond {
                    &if_.true_block
                } else {
                    &if_.false_block
                };
                if let Some(result) = self.eval_block(locals, block)? {
                    return Ok(Some(result));
                }
                self.bind_merge(locals, &if_.merge, cond)?;
                Ok(None)
            }

            Stmt::While(while_) => {
                self.bind_merge(locals, &while_.merge, true)?;
                while self.eval_bool(locals, &while_.cond)? {
                    if let Some(result) = self.eval_block(locals, &while_.body)? {
                        return Ok(Some(result));
                    }
                    self.bind_merge(locals, &while_.merge, false)?;
                }
                Ok(None)
            }

            Stmt::ForLoop(for_loop) => {
                let start = self.eval_expr(locals, &for_loop.start)?.as_int()?;
                let stop = self.eval_expr(locals, &for_loop.stop)?.as_int()?;
                let step = self.eval_expr(locals, &for_loop.step)?.as_int()?;
                if step == 0 {
                    return Err(Error::Runtime("for loop with a zero step".into()));
                }
                self.bind_merge(locals, &for_loop.merge, true)?;
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    locals.insert(for_loop.var.clone(), Value::int(i));
                    if let Some(result) = self.eval_block(locals, &for_loop.body)? {
                        return Ok(Some(result));
                    }
                    self.bind_merge(locals, &for_loop.merge, false)?;
                    i += step;
                }
                Ok(None)
            }
        }
    }

    fn eval_exprs(&mut self, locals: &Locals, exprs: &[Expr]) -> Result<Vec<Value>, Error> {
        exprs.iter().map(|e| self.eval_expr(locals, e)).collect()
    }

    fn eval_array(&mut self, locals: &Locals, expr: &Expr) -> Result<ArrayValue, Error> {
        match self.eval_expr(locals, expr)? {
            Value::Array(array) => Ok(array),
            _ => Err(Error::NotAnArray(expr.type_.clone())),
        }
    }

    fn eval_expr(&mut self, locals: &Locals, expr: &Expr) -> Result<Value, Error> {
        match &expr.kind {
            ExprKind::Var(name) => locals
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownVariable(name.clone())),

            ExprKind::Const(Const::None) => Ok(Value::None),
            ExprKind::Const(Const::Bool(b)) => Ok(Value::bool(*b)),
            ExprKind::Const(Const::Int(i)) => {
                let t = expr.type_.as_scalar().unwrap_or(ScalarType::Int64);
                Ok(Value::Scalar(Scalar::Int(*i).convert(t)))
            }
            ExprKind::Const(Const::Float(f)) => Ok(Value::float(*f)),

            ExprKind::PrimCall(prim, args) => {
                let args = self
                    .eval_exprs(locals, args)?
                    .iter()
                    .map(Value::as_scalar)
                    .collect::<Result<Vec<_>, _>>()?;
                let result_type = expr
                    .type_
                    .as_scalar()
                    .ok_or_else(|| Error::NotAScalar(expr.type_.clone()))?;
                Ok(Value::Scalar(eval_prim(*prim, &args, result_type)?))
            }

            ExprKind::Call(name, args) => {
                let args = self.eval_exprs(locals, args)?;
                self.call(name, args)
            }

            ExprKind::Index(container, idx) => {
                let container = self.eval_expr(locals, container)?;
                let idx = self.eval_expr(locals, idx)?;
                self.index_value(&container, &idx)
            }

            ExprKind::TupleProj(tuple, i) => match self.eval_expr(locals, tuple)? {
                Value::Tuple(mut elts) if *i < elts.len() => Ok(elts.swap_remove(*i)),
                other => Err(Error::Runtime(format!(
                    "cannot project element {} of {:?}",
                    i, other
                ))),
            },

            ExprKind::Attribute(array, field) => {
                let array = self.eval_array(locals, array)?;
                let ints = |values: Vec<i64>| Value::Tuple(values.into_iter().map(Value::int).collect());
                Ok(match field {
                    Field::Data => Value::Buffer(array.elt, array.data.clone()),
                    Field::Shape => ints(array.shape.clone()),
                    Field::Strides => ints(
                        array
                            .strides
                            .iter()
                            .map(|s| s * array.elt.nbytes())
                            .collect(),
                    ),
                    Field::Offset => Value::int(array.offset),
                    Field::Size => Value::int(array.len()),
                })
            }

            ExprKind::Cast(value) => {
                let value = self.eval_expr(locals, value)?.as_scalar()?;
                let target = expr
                    .type_
                    .as_scalar()
                    .ok_or_else(|| Error::NotAScalar(expr.type_.clone()))?;
                Ok(Value::Scalar(value.convert(target)))
            }

            ExprKind::Alloc(elt, count) => {
                let count = self.eval_expr(locals, count)?.as_int()?;
                if count < 0 {
                    return Err(Error::Runtime(format!(
                        "allocation of {} elements",
                        count
                    )));
                }
                Ok(Value::Buffer(
                    *elt,
                    Rc::new(RefCell::new(vec![Scalar::zero(*elt); count as usize])),
                ))
            }

            ExprKind::ArrayView {
                data,
                shape,
                strides,
                offset,
                size: _,
            } => {
                let (elt, data) = match self.eval_expr(locals, data)? {
                    Value::Buffer(elt, data) => (elt, data),
                    other => {
                        return Err(Error::Runtime(format!(
                            "array view over non-buffer {:?}",
                            other
                        )))
                    }
                };
                let shape = self.eval_expr(locals, shape)?.as_ints()?;
                let strides = self
                    .eval_expr(locals, strides)?
                    .as_ints()?
                    .into_iter()
                    .map(|s| s / elt.nbytes())
                    .collect();
                let offset = self.eval_expr(locals, offset)?.as_int()?;
                Ok(Value::Array(ArrayValue {
                    elt,
                    data,
                    shape,
                    strides,
                    offset,
                }))
            }

            ExprKind::Tuple(elts) => Ok(Value::Tuple(self.eval_exprs(locals, elts)?)),

            ExprKind::Slice { start, stop, step } => {
                let start = self.eval_expr(locals, start)?.as_opt_int()?;
                let stop = self.eval_expr(locals, stop)?.as_opt_int()?;
                let step = self.eval_expr(locals, step)?.as_opt_int()?.unwrap_or(1);
                Ok(Value::Slice(start, stop, step))
            }

            ExprKind::FnRef(name) => Ok(Value::Closure(name.clone(), Vec::new())),

            ExprKind::Closure(name, captured) => Ok(Value::Closure(
                name.clone(),
                self.eval_exprs(locals, captured)?,
            )),

            ExprKind::ClosureElt(closure, i) => match self.eval_expr(locals, closure)? {
                Value::Closure(_, mut captured) if *i < captured.len() => {
                    Ok(captured.swap_remove(*i))
                }
                other => Err(Error::MalformedClosure(format!(
                    "no captured value {} in {:?}",
                    i, other
                ))),
            },

            ExprKind::Map { func, args, axis } => {
                let func = self.eval_expr(locals, func)?;
                let args = self.eval_exprs(locals, args)?;
                self.eval_map(&func, &args, *axis)
            }

            ExprKind::Reduce {
                func,
                combine,
                init,
                args,
                axis,
            } => {
                let func = self.eval_expr(locals, func)?;
                let combine = self.eval_expr(locals, combine)?;
                let init = match init {
                    Some(init) => Some(self.eval_expr(locals, init)?),
                    None => None,
                };
                let args = self.eval_exprs(locals, args)?;
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
                let func = self.eval_expr(locals, func)?;
                let combine = self.eval_expr(locals, combine)?;
                let emit = self.eval_expr(locals, emit)?;
                let init = match init {
                    Some(init) => Some(self.eval_expr(locals, init)?),
                    None => None,
                };
                let args = self.eval_exprs(locals, args)?;
                self.eval_scan(&func, &combine, &emit, init.as_ref(), &args, *axis)
            }

            ExprKind::AllPairs { func, args, axis } => {
                let func = self.eval_expr(locals, func)?;
                let args = self.eval_exprs(locals, args)?;
                match &args[..] {
                    [x, y] => self.eval_all_pairs(&func, x, y, *axis),
                    _ => Err(Error::AdverbArity {
                        adverb: "allpairs",
                        expected: 2,
                        actual: args.len(),
                    }),
                }
            }

            ExprKind::TiledMap { func, args, .. } => {
                let func = self.eval_expr(locals, func)?;
                let args = self.eval_exprs(locals, args)?;
                self.invoke(&func, args)
            }

            ExprKind::TiledReduce {
                func,
                combine,
                init,
                args,
                axes,
                ..
            } => {
                let func = self.eval_expr(locals, func)?;
                let combine = self.eval_expr(locals, combine)?;
                let init = self.eval_expr(locals, init)?;
                let args = self.eval_exprs(locals, args)?;
                self.eval_tiled_reduce(&func, &combine, init, &args, axes)
            }
        }
    }

    // Every tile has extent one along its axis, so the fold visits elements in order
    fn eval_tiled_reduce(
        &mut self,
        func: &Value,
        combine: &Value,
        init: Value,
        args: &[Value],
        axes: &[usize],
    ) -> Result<Value, Error> {
        let (first, axis) = match (args.first(), axes.first()) {
            (Some(first), Some(axis)) => (first, *axis),
            _ => {
                return Err(Error::AdverbArity {
                    adverb: "tiled reduce",
                    expected: 1,
                    actual: 0,
                })
            }
        };
        let niters = self.size_along_axis(first, axis)?.as_int()?;

        let mut acc: Option<Value> = None;
        for i in 0..niters {
            let bounds = Value::Slice(Some(i), Some(i + 1), 1);
            let mut tiles = Vec::with_capacity(args.len());
            for (arg, &axis) in args.iter().zip(axes) {
                tiles.push(self.slice_along_axis(arg, axis, &bounds)?);
            }
            let tile_result = self.invoke(func, tiles)?;
            let current = match acc.take() {
                Some(acc) => acc,
                None => broadcast_like(&init, &tile_result)?,
            };
            acc = Some(self.invoke(combine, vec![current, tile_result])?);
        }
        Ok(acc.unwrap_or(init))
    }
}

// `init` repeated over the leading extents of `like`
fn broadcast_like(init: &Value, like: &Value) -> Result<Value, Error> {
    match like {
        Value::Array(like) => {
            let result = ArrayValue::zeroed(like.elt, like.shape.clone());
            result.write(&Value::Tuple(Vec::new()), init.clone())?;
            Ok(Value::Array(result))
        }
        _ => Ok(init.clone()),
    }
}

impl AdverbSemantics for Interpreter<'_> {
    type Value = Value;

    fn rank(&self, x: &Value) -> usize {
        x.shape().len()
    }

    fn const_int(&mut self, value: i64) -> Value {
        Value::int(value)
    }

    fn none_value(&mut self) -> Value {
        Value::None
    }

    fn is_none_value(&self, x: &Value) -> bool {
        matches!(x, Value::None)
    }

    fn slice_all_value(&mut self) -> Value {
        Value::Slice(None, None, 1)
    }

    fn tuple_value(&mut self, elts: Vec<Value>) -> Result<Value, Error> {
        Ok(Value::Tuple(elts))
    }

    fn index_value(&mut self, x: &Value, idx: &Value) -> Result<Value, Error> {
        match x {
            Value::Scalar(_) => Ok(x.clone()),
            Value::Tuple(elts) => {
                let i = idx.as_int()?;
                elts.get(i as usize)
                    .cloned()
                    .ok_or_else(|| Error::Runtime(format!("tuple index {} out of range", i)))
            }
            Value::Array(array) => array.read(idx),
            other => Err(Error::Runtime(format!("cannot index {:?}", other))),
        }
    }

    fn size_along_axis(&mut self, x: &Value, axis: usize) -> Result<Value, Error> {
        let shape = x.shape();
        shape
            .get(axis)
            .map(|&extent| Value::int(extent))
            .ok_or(Error::AxisOutOfRange {
                axis,
                rank: shape.len(),
            })
    }

    fn check_equal_sizes(&mut self, axis: usize, sizes: &[Value]) -> Result<(), Error> {
        let sizes = sizes
            .iter()
            .map(Value::as_int)
            .collect::<Result<Vec<_>, _>>()?;
        if sizes.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::AxisSizeMismatch { axis, sizes });
        }
        Ok(())
    }

    fn invoke(&mut self, func: &Value, args: Vec<Value>) -> Result<Value, Error> {
        match func {
            Value::Closure(name, captured) => {
                let mut all_args = captured.clone();
                all_args.extend(args);
                self.call(name, all_args)
            }
            other => Err(Error::MalformedClosure(format!(
                "{:?} is not callable",
                other
            ))),
        }
    }

    fn loop_over(
        &mut self,
        start: Value,
        stop: Value,
        body: &mut dyn FnMut(&mut Self, Value) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for i in start.as_int()?..stop.as_int()? {
            body(self, Value::int(i))?;
        }
        Ok(())
    }

    fn accumulate_loop(
        &mut self,
        start: Value,
        stop: Value,
        init: Value,
        body: &mut dyn FnMut(&mut Self, Value, Value) -> Result<Value, Error>,
    ) -> Result<Value, Error> {
        let mut acc = init;
        for i in start.as_int()?..stop.as_int()? {
            acc = body(self, acc, Value::int(i))?;
        }
        Ok(acc)
    }

    fn alloc_result(&mut self, first: &Value, outer_shape: Vec<Value>) -> Result<Value, Error> {
        let mut shape = outer_shape
            .iter()
            .map(Value::as_int)
            .collect::<Result<Vec<_>, _>>()?;
        let elt = match first {
            Value::Scalar(s) => s.scalar_type(),
            Value::Array(array) => {
                shape.extend(&array.shape);
                array.elt
            }
            other => {
                return Err(Error::Runtime(format!(
                    "adverb results must be scalars or arrays, got {:?}",
                    other
                )))
            }
        };
        Ok(Value::Array(ArrayValue::zeroed(elt, shape)))
    }

    fn set_index(&mut self, array: &Value, idx: Value, value: Value) -> Result<(), Error> {
        match array {
            Value::Array(array) => array.write(&idx, value),
            other => Err(Error::Runtime(format!("store into non-array {:?}", other))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slicing_shares_storage_and_clamps_bounds() {
        let Value::Array(mat) = Value::int_array(vec![3, 4], &(0..12).collect::<Vec<_>>()) else {
            unreachable!()
        };
        let col = mat
            .read(&Value::Tuple(vec![Value::Slice(None, None, 1), Value::int(2)]))
            .unwrap();
        assert_eq!(col, Value::int_array(vec![3], &[2, 6, 10]));

        let tail = mat
            .read(&Value::Tuple(vec![Value::Slice(Some(2), Some(10), 1)]))
            .unwrap();
        assert_eq!(tail.shape(), vec![1, 4]);

        mat.write(&Value::int(1), Value::int(-1)).unwrap();
        assert_eq!(
            mat.read(&Value::int(1)).unwrap(),
            Value::int_array(vec![4], &[-1, -1, -1, -1])
        );
        assert!(mat.read(&Value::int(3)).is_err());
    }

    #[test]
    fn lower_rank_stores_repeat_over_leading_axes() {
        let target = ArrayValue::zeroed(ScalarType::Float64, vec![2, 3]);
        target
            .write(
                &Value::Tuple(Vec::new()),
                Value::float_array(vec![3], &[1.0, 2.0, 3.0]),
            )
            .unwrap();
        assert_eq!(
            Value::Array(target),
            Value::float_array(vec![2, 3], &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn integer_arithmetic_truncates_and_wraps_to_the_result_type() {
        let r = eval_prim(
            Prim::Div,
            &[Scalar::Int(-7), Scalar::Int(2)],
            ScalarType::Int64,
        )
        .unwrap();
        assert_eq!(r, Scalar::Int(-3));
        let r = eval_prim(
            Prim::Add,
            &[Scalar::Int(i32::MAX as i64), Scalar::Int(1)],
            ScalarType::Int32,
        )
        .unwrap();
        assert_eq!(r, Scalar::Int(i32::MIN as i64));
        assert!(eval_prim(Prim::Mod, &[Scalar::Int(1), Scalar::Int(0)], ScalarType::Int64).is_err());
    }
}
