use crate::builder::Builder;
use crate::error::Error;
use crate::session::Session;
use crate::verify::verify;
use quiver_common::data::typed_ir::{
    Block, Expr, ExprKind, ForLoop, If, MergeMap, Stmt, TypedFn, VarName, While,
};
use quiver_common::pretty_print::typed_ir::fn_to_string;
use quiver_common::progress_ui::{self, ProgressLogger, ProgressSession};
use std::rc::Rc;
use tracing::{debug, instrument, trace};

pub trait Transform {
    /// Identifies the pass, including any parameters that affect its output, in the pass cache.
    fn cache_key(&self) -> String;

    fn pre_apply(&mut self, _b: &mut Builder<'_>, _func: &TypedFn) -> Result<(), Error> {
        Ok(())
    }

    fn post_apply(&mut self, func: TypedFn) -> Result<TypedFn, Error> {
        Ok(func)
    }

    fn transform_expr(&mut self, b: &mut Builder<'_>, expr: &Expr) -> Result<Expr, Error> {
        walk_expr(self, b, expr)
    }

    fn transform_lhs(&mut self, b: &mut Builder<'_>, lhs: &Expr) -> Result<Expr, Error> {
        self.transform_expr(b, lhs)
    }

    /// Called for every name a statement binds other than through an assignment: merge names and
    /// loop induction variables.
    fn transform_binding(
        &mut self,
        _b: &mut Builder<'_>,
        name: &VarName,
    ) -> Result<VarName, Error> {
        Ok(name.clone())
    }

    fn transform_assign(
        &mut self,
        b: &mut Builder<'_>,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Stmt, Error> {
        let rhs = self.transform_expr(b, rhs)?;
        let lhs = self.transform_lhs(b, lhs)?;
        Ok(Stmt::Assign(lhs, rhs))
    }

    fn transform_return(&mut self, b: &mut Builder<'_>, value: &Expr) -> Result<Stmt, Error> {
        Ok(Stmt::Return(self.transform_expr(b, value)?))
    }

    fn transform_if(&mut self, b: &mut Builder<'_>, if_: &If) -> Result<Stmt, Error> {
        Ok(Stmt::If(walk_if(self, b, if_)?))
    }

    fn transform_while(&mut self, b: &mut Builder<'_>, while_: &While) -> Result<Stmt, Error> {
        Ok(Stmt::While(walk_while(self, b, while_)?))
    }

    fn transform_for(&mut self, b: &mut Builder<'_>, for_loop: &ForLoop) -> Result<Stmt, Error> {
        Ok(Stmt::ForLoop(walk_for(self, b, for_loop)?))
    }

    fn transform_stmt(&mut self, b: &mut Builder<'_>, stmt: &Stmt) -> Result<Stmt, Error> {
        match stmt {
            Stmt::Assign(lhs, rhs) => self.transform_assign(b, lhs, rhs),
            Stmt::Return(value) => self.transform_return(b, value),
            Stmt::If(if_) => self.transform_if(b, if_),
            Stmt::While(while_) => self.transform_while(b, while_),
            Stmt::ForLoop(for_loop) => self.transform_for(b, for_loop),
        }
    }

    fn transform_stmts(&mut self, b: &mut Builder<'_>, stmts: &[Stmt]) -> Result<(), Error> {
        for stmt in stmts {
            let stmt = self.transform_stmt(b, stmt)?;
            b.insert_stmt(stmt);
        }
        Ok(())
    }

    fn transform_block(&mut self, b: &mut Builder<'_>, block: &[Stmt]) -> Result<Block, Error> {
        let (block, ()) = b.with_scope(|b| self.transform_stmts(b, block))?;
        Ok(block)
    }

    fn transform_exprs(&mut self, b: &mut Builder<'_>, exprs: &[Expr]) -> Result<Vec<Expr>, Error> {
        exprs.iter().map(|e| self.transform_expr(b, e)).collect()
    }
}

fn transform_box<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    expr: &Expr,
) -> Result<Box<Expr>, Error> {
    Ok(Box::new(pass.transform_expr(b, expr)?))
}

/// Rebuilds `expr` from its rewritten children.  The node keeps its kind and its type.
pub fn walk_expr<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    expr: &Expr,
) -> Result<Expr, Error> {
    let kind = match &expr.kind {
        ExprKind::Var(_) | ExprKind::Const(_) | ExprKind::FnRef(_) => expr.kind.clone(),
        ExprKind::PrimCall(prim, args) => ExprKind::PrimCall(*prim, pass.transform_exprs(b, args)?),
        ExprKind::Call(name, args) => ExprKind::Call(name.clone(), pass.transform_exprs(b, args)?),
        ExprKind::Index(container, idx) => ExprKind::Index(
            transform_box(pass, b, container)?,
            transform_box(pass, b, idx)?,
        ),
        ExprKind::TupleProj(tuple, i) => ExprKind::TupleProj(transform_box(pass, b, tuple)?, *i),
        ExprKind::Attribute(array, field) => {
            ExprKind::Attribute(transform_box(pass, b, array)?, *field)
        }
        ExprKind::Cast(value) => ExprKind::Cast(transform_box(pass, b, value)?),
        ExprKind::Alloc(elt, count) => ExprKind::Alloc(*elt, transform_box(pass, b, count)?),
        ExprKind::ArrayView {
            data,
            shape,
            strides,
            offset,
            size,
        } => ExprKind::ArrayView {
            data: transform_box(pass, b, data)?,
            shape: transform_box(pass, b, shape)?,
            strides: transform_box(pass, b, strides)?,
            offset: transform_box(pass, b, offset)?,
            size: transform_box(pass, b, size)?,
        },
        ExprKind::Tuple(elts) => ExprKind::Tuple(pass.transform_exprs(b, elts)?),
        ExprKind::Slice { start, stop, step } => ExprKind::Slice {
            start: transform_box(pass, b, start)?,
            stop: transform_box(pass, b, stop)?,
            step: transform_box(pass, b, step)?,
        },
        ExprKind::Closure(name, captured) => {
            ExprKind::Closure(name.clone(), pass.transform_exprs(b, captured)?)
        }
        ExprKind::ClosureElt(closure, i) => {
            ExprKind::ClosureElt(transform_box(pass, b, closure)?, *i)
        }
        ExprKind::Map { func, args, axis } => ExprKind::Map {
            func: transform_box(pass, b, func)?,
            args: pass.transform_exprs(b, args)?,
            axis: *axis,
        },
        ExprKind::Reduce {
            func,
            combine,
            init,
            args,
            axis,
        } => ExprKind::Reduce {
            func: transform_box(pass, b, func)?,
            combine: transform_box(pass, b, combine)?,
            init: match init {
                Some(init) => Some(transform_box(pass, b, init)?),
                None => None,
            },
            args: pass.transform_exprs(b, args)?,
            axis: *axis,
        },
        ExprKind::Scan {
            func,
            combine,
            emit,
            init,
            args,
            axis,
        } => ExprKind::Scan {
            func: transform_box(pass, b, func)?,
            combine: transform_box(pass, b, combine)?,
            emit: transform_box(pass, b, emit)?,
            init: match init {
                Some(init) => Some(transform_box(pass, b, init)?),
                None => None,
            },
            args: pass.transform_exprs(b, args)?,
            axis: *axis,
        },
        ExprKind::AllPairs { func, args, axis } => ExprKind::AllPairs {
            func: transform_box(pass, b, func)?,
            args: pass.transform_exprs(b, args)?,
            axis: *axis,
        },
        ExprKind::TiledMap {
            func,
            args,
            axes,
            tile,
        } => ExprKind::TiledMap {
            func: transform_box(pass, b, func)?,
            args: pass.transform_exprs(b, args)?,
            axes: axes.clone(),
            tile: *tile,
        },
        ExprKind::TiledReduce {
            func,
            combine,
            init,
            args,
            axes,
            tile,
        } => ExprKind::TiledReduce {
            func: transform_box(pass, b, func)?,
            combine: transform_box(pass, b, combine)?,
            init: transform_box(pass, b, init)?,
            args: pass.transform_exprs(b, args)?,
            axes: axes.clone(),
            tile: *tile,
        },
    };
    Ok(Expr::new(kind, expr.type_.clone()))
}

fn transform_side<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    merge: &MergeMap,
    left: bool,
) -> Result<Vec<Expr>, Error> {
    merge
        .values()
        .map(|(l, r)| pass.transform_expr(b, if left { l } else { r }))
        .collect()
}

fn rebuild_merge(names: Vec<VarName>, lefts: Vec<Expr>, rights: Vec<Expr>) -> MergeMap {
    names
        .into_iter()
        .zip(lefts.into_iter().zip(rights))
        .collect()
}

/// Each side of the merge is rewritten at the end of the branch it flows out of.
pub fn walk_if<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    if_: &If,
) -> Result<If, Error> {
    let cond = pass.transform_expr(b, &if_.cond)?;
    let (true_block, lefts) = b.with_scope(|b| {
        pass.transform_stmts(b, &if_.true_block)?;
        transform_side(pass, b, &if_.merge, true)
    })?;
    let (false_block, rights) = b.with_scope(|b| {
        pass.transform_stmts(b, &if_.false_block)?;
        transform_side(pass, b, &if_.merge, false)
    })?;
    let names = if_
        .merge
        .keys()
        .map(|name| pass.transform_binding(b, name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(If {
        cond,
        true_block,
        false_block,
        merge: rebuild_merge(names, lefts, rights),
    })
}

/// Entry values are rewritten ahead of the loop; back-edge values at the end of its body.
pub fn walk_while<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    while_: &While,
) -> Result<While, Error> {
    let entries = transform_side(pass, b, &while_.merge, true)?;
    let names = while_
        .merge
        .keys()
        .map(|name| pass.transform_binding(b, name))
        .collect::<Result<Vec<_>, _>>()?;
    let cond = pass.transform_expr(b, &while_.cond)?;
    let (body, backs) = b.with_scope(|b| {
        pass.transform_stmts(b, &while_.body)?;
        transform_side(pass, b, &while_.merge, false)
    })?;
    Ok(While {
        cond,
        body,
        merge: rebuild_merge(names, entries, backs),
    })
}

pub fn walk_for<T: Transform + ?Sized>(
    pass: &mut T,
    b: &mut Builder<'_>,
    for_loop: &ForLoop,
) -> Result<ForLoop, Error> {
    let start = pass.transform_expr(b, &for_loop.start)?;
    let stop = pass.transform_expr(b, &for_loop.stop)?;
    let step = pass.transform_expr(b, &for_loop.step)?;
    let entries = transform_side(pass, b, &for_loop.merge, true)?;
    let names = for_loop
        .merge
        .keys()
        .map(|name| pass.transform_binding(b, name))
        .collect::<Result<Vec<_>, _>>()?;
    let var = pass.transform_binding(b, &for_loop.var)?;
    let (body, backs) = b.with_scope(|b| {
        pass.transform_stmts(b, &for_loop.body)?;
        transform_side(pass, b, &for_loop.merge, false)
    })?;
    Ok(ForLoop {
        var,
        start,
        stop,
        step,
        body,
        merge: rebuild_merge(names, entries, backs),
    })
}

/// Rewrites `func` with `pass` and publishes the result under a fresh name.  Nothing is published
/// if the pass or verification fails.
#[instrument(level = "debug", skip_all, fields(pass = %pass.cache_key(), func = %func.name))]
pub fn apply<T: Transform + ?Sized>(
    pass: &mut T,
    session: &mut Session,
    func: &TypedFn,
) -> Result<Rc<TypedFn>, Error> {
    let mut b = Builder::new(session, func.type_env.clone());
    pass.pre_apply(&mut b, func)?;
    let body = pass.transform_block(&mut b, &func.body)?;
    let (mut prelude, type_env) = b.into_parts();
    prelude.extend(body);

    let name = session.refresh_fn(&func.name);
    let new_fn = pass.post_apply(TypedFn {
        name,
        arg_names: func.arg_names.clone(),
        input_types: func.input_types.clone(),
        return_type: func.return_type.clone(),
        type_env,
        body: prelude,
    })?;
    verify(&new_fn)?;

    debug!(source = %func.name, result = %new_fn.name, "applied");
    trace!("\n{}", fn_to_string(&new_fn));
    session.register(new_fn)
}

/// `apply`, memoized per (pass, source function).
pub fn cached_apply<T: Transform + ?Sized>(
    pass: &mut T,
    session: &mut Session,
    func: &TypedFn,
) -> Result<Rc<TypedFn>, Error> {
    let key = pass.cache_key();
    if let Some(cached) = session.cached(&key, &func.name) {
        trace!(pass = %key, func = %func.name, result = %cached.name, "cache hit");
        return Ok(cached);
    }
    let result = apply(pass, session, func)?;
    session.insert_cached(key, func.name.clone(), result.clone());
    Ok(result)
}

/// Runs `passes` in order, feeding each one's output to the next.
pub fn apply_pipeline(
    session: &mut Session,
    func: &Rc<TypedFn>,
    passes: &mut [&mut dyn Transform],
) -> Result<Rc<TypedFn>, Error> {
    let mut progress =
        progress_ui::bar(session.options.progress, &func.name).start_session(Some(passes.len()));
    let mut current = func.clone();
    for pass in passes.iter_mut() {
        progress.begin_pass(&pass.cache_key());
        current = cached_apply(&mut **pass, session, &current)?;
        progress.end_pass();
    }
    progress.finish();
    Ok(current)
}
