use crate::adverb_semantics::AdverbSemantics;
use crate::builder::Builder;
use crate::error::Error;
use crate::transform::{cached_apply, walk_expr, Transform};
use quiver_common::data::typed_ir::{Expr, ExprKind};
use quiver_common::data::types::Type;

#[derive(Clone, Copy, Debug, Default)]
pub struct LowerAdverbs;

impl LowerAdverbs {
    /// `callable` rebuilt to refer to the lowered version of its function.
    fn lower_callable(&mut self, b: &mut Builder<'_>, callable: &Expr) -> Result<Expr, Error> {
        let callee = b.callee(callable)?;
        let lowered = cached_apply(&mut LowerAdverbs, b.session(), &callee)?;
        let captured = b.closure_args(callable)?;
        let captured = self.transform_exprs(b, &captured)?;
        Ok(match callable.type_ {
            Type::Fn(_) => Expr::fn_ref(&lowered),
            _ => Expr::closure(&lowered, captured),
        })
    }

    fn lower_optional(
        &mut self,
        b: &mut Builder<'_>,
        init: &Option<Box<Expr>>,
    ) -> Result<Option<Expr>, Error> {
        match init {
            Some(init) => Ok(Some(self.transform_expr(b, init)?)),
            None => Ok(None),
        }
    }
}

impl Transform for LowerAdverbs {
    fn cache_key(&self) -> String {
        "lower_adverbs".to_owned()
    }

    fn transform_expr(&mut self, b: &mut Builder<'_>, expr: &Expr) -> Result<Expr, Error> {
        let result = match &expr.kind {
            ExprKind::Map { func, args, axis } => {
                let func = self.lower_callable(b, func)?;
                let args = self.transform_exprs(b, args)?;
                b.eval_map(&func, &args, *axis)?
            }
            ExprKind::Reduce {
                func,
                combine,
                init,
                args,
                axis,
            } => {
                let func = self.lower_callable(b, func)?;
                let combine = self.lower_callable(b, combine)?;
                let init = self.lower_optional(b, init)?;
                let args = self.transform_exprs(b, args)?;
                b.eval_reduce(&func, &combine, init.as_ref(), &args, *axis)?
            }
            ExprKind::Scan {
                func,
                combine,
                emit,
                init,
                args,
                axis,
            } => {
                let func = self.lower_callable(b, func)?;
                let combine = self.lower_callable(b, combine)?;
                let emit = self.lower_callable(b, emit)?;
                let init = self.lower_optional(b, init)?;
                let args = self.transform_exprs(b, args)?;
                b.eval_scan(&func, &combine, &emit, init.as_ref(), &args, *axis)?
            }
            ExprKind::AllPairs { func, args, axis } => {
                let [x, y] = match &args[..] {
                    [x, y] => [x, y],
                    _ => {
                        return Err(Error::AdverbArity {
                            adverb: "all-pairs",
                            expected: 2,
                            actual: args.len(),
                        })
                    }
                };
                let func = self.lower_callable(b, func)?;
                let x = self.transform_expr(b, x)?;
                let y = self.transform_expr(b, y)?;
                b.eval_all_pairs(&func, &x, &y, *axis)?
            }
            ExprKind::Call(name, args) => {
                let callee = b.session().lookup(name)?;
                let lowered = cached_apply(&mut LowerAdverbs, b.session(), &callee)?;
                let args = self.transform_exprs(b, args)?;
                return Ok(Expr::new(
                    ExprKind::Call(lowered.name.clone(), args),
                    expr.type_.clone(),
                ));
            }
            _ => return walk_expr(self, b, expr),
        };
        b.coerce(&result, &expr.type_, "lowered adverb")
    }
}
