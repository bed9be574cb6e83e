//! Splicing a callee's body into the scope being built.

use crate::builder::Builder;
use crate::error::Error;
use crate::rename::Renamer;
use crate::transform::Transform;
use quiver_common::data::typed_ir::{Expr, ExprKind, Stmt, TypedFn};
use quiver_common::data::types::Type;
use tracing::trace;

fn contains_return(block: &[Stmt]) -> bool {
    block.iter().any(|stmt| {
        matches!(stmt, Stmt::Return(_)) || stmt.blocks().into_iter().any(|b| contains_return(b))
    })
}

fn compatible(actual: &Type, formal: &Type) -> bool {
    matches!(
        (actual, formal),
        (Type::Fn(_) | Type::Closure(_, _), Type::Fn(_) | Type::Closure(_, _))
    ) || actual == formal
}

/// The index selecting every element of a value of rank `rank`.
pub fn full_slice(rank: usize) -> Expr {
    Expr::tuple(vec![Expr::slice_all(); rank])
}

/// Inlines `callee(args)` into the current scope and returns the value it computes.
///
/// With `output` set, the result is instead copied into that existing region, which is returned.
/// `args` must already include any closure captures.  Only callees whose single `return` is their
/// final statement can be inlined.
pub fn inline(
    b: &mut Builder<'_>,
    callee: &TypedFn,
    args: Vec<Expr>,
    output: Option<&Expr>,
) -> Result<Expr, Error> {
    if args.len() != callee.arg_names.len() {
        return Err(Error::ArityMismatch {
            func: callee.name.clone(),
            expected: callee.arg_names.len(),
            actual: args.len(),
        });
    }
    let (result, prefix) = match callee.body.split_last() {
        Some((Stmt::Return(result), prefix)) => (result, prefix),
        _ => {
            return Err(Error::UnsupportedInline {
                func: callee.name.clone(),
                reason: "body does not end in a return",
            })
        }
    };
    if contains_return(prefix) {
        return Err(Error::UnsupportedInline {
            func: callee.name.clone(),
            reason: "early return",
        });
    }
    trace!(callee = %callee.name, "inlining");

    let mut renamer = Renamer::new(callee.type_env.clone());
    for ((formal, formal_type), actual) in callee
        .arg_names
        .iter()
        .zip(&callee.input_types)
        .zip(args)
    {
        let actual = if compatible(&actual.type_, formal_type) {
            actual
        } else {
            b.coerce(&actual, formal_type, "inlined argument")?
        };
        let actual = match actual.kind {
            ExprKind::Var(_) | ExprKind::Const(_) | ExprKind::FnRef(_) => actual,
            _ => b.assign_temp(actual, &formal.0),
        };
        renamer.bind(formal.clone(), actual);
    }

    renamer.transform_stmts(b, prefix)?;
    let result = renamer.transform_expr(b, result)?;
    match output {
        None => Ok(match result.kind {
            ExprKind::Var(_) | ExprKind::Const(_) => result,
            _ => b.assign_temp(result, "inline_result"),
        }),
        Some(region) => {
            b.setidx(region, &full_slice(region.type_.rank()), &result)?;
            Ok(region.clone())
        }
    }
}
