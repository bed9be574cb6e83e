use crate::builder::Builder;
use crate::error::Error;
use crate::rename::Renamer;
use crate::transform::{walk_for, Transform};
use quiver_common::config::{PassOptions, MAX_UNROLL_BODY_STMTS};
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{Block, Expr, ExprKind, ForLoop, MergeMap, Stmt};
use quiver_common::data::types::ScalarType;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct LoopUnrolling {
    unroll_factor: usize,
}

fn is_simple_block(block: &[Stmt]) -> bool {
    block.iter().all(|stmt| match stmt {
        Stmt::Assign(lhs, _) => lhs.type_.is_simple_assignment(),
        Stmt::If(if_) => is_simple_block(&if_.true_block) && is_simple_block(&if_.false_block),
        Stmt::Return(_) | Stmt::While(_) | Stmt::ForLoop(_) => false,
    })
}

fn count_stmts(block: &[Stmt]) -> usize {
    block
        .iter()
        .map(|stmt| 1 + stmt.blocks().into_iter().map(|b| count_stmts(b)).sum::<usize>())
        .sum()
}

impl LoopUnrolling {
    pub fn new(unroll_factor: usize) -> Result<Self, Error> {
        if unroll_factor == 0 {
            return Err(Error::InvalidUnrollFactor(unroll_factor));
        }
        Ok(LoopUnrolling { unroll_factor })
    }

    pub fn from_options(options: &PassOptions) -> Result<Self, Error> {
        Self::new(options.unroll_factor)
    }

    fn unroll(&self, b: &mut Builder<'_>, for_loop: ForLoop) -> Result<Stmt, Error> {
        let counter_type = b.lookup_type(&for_loop.var)?;
        let counter_scalar = counter_type.as_scalar().unwrap_or(ScalarType::Int64);

        // Bounds of the unrolled loop, computed once ahead of it
        let factor = Expr::scalar_const(self.unroll_factor as i64, counter_scalar);
        let iter_range = b.sub(&for_loop.stop, &for_loop.start, "iter_range")?;
        let big_step = b.mul(&factor, &for_loop.step, "big_step")?;
        let big_steps = b.div(&iter_range, &big_step, "big_steps")?;
        let trunc = b.mul(&big_steps, &big_step, "trunc")?;
        let unrolled_stop = b.add(&for_loop.start, &trunc, "unrolled_stop")?;

        let source_env = b.type_env().clone();
        let mut renamer = Renamer::new(source_env.clone());
        let first_var = renamer.rename_binding(b, &for_loop.var)?;
        let first_counter = Expr::var(first_var.clone(), counter_type.clone());
        for name in for_loop.merge.keys() {
            renamer.rename_binding(b, name)?;
        }
        let first = renamer.renames.clone();
        let mut body: Block = renamer.transform_block(b, &for_loop.body)?;

        for k in 1..self.unroll_factor {
            let previous = renamer.renames.clone();
            let counter_k = renamer.rename_binding(b, &for_loop.var)?;
            for name in for_loop.merge.keys() {
                renamer.rename_binding(b, name)?;
            }

            // Values carried out of copy k - 1 become the inputs of copy k
            let mut carried = Renamer::with_renames(source_env.clone(), previous);
            for (name, (_, back)) in &for_loop.merge {
                let value = carried.transform_expr(b, back)?;
                body.push(Stmt::Assign(renamer.renames[name].clone(), value));
            }

            let offset = b.mul(
                &for_loop.step,
                &Expr::scalar_const(k as i64, counter_scalar),
                "offset",
            )?;
            body.push(Stmt::Assign(
                Expr::var(counter_k, counter_type.clone()),
                Expr::new(
                    ExprKind::PrimCall(Prim::Add, vec![first_counter.clone(), offset]),
                    counter_type.clone(),
                ),
            ));
            body.extend(renamer.transform_block(b, &for_loop.body)?);
        }

        let mut unrolled_merge = MergeMap::new();
        let mut remainder_merge = MergeMap::new();
        for (name, (entry, back)) in &for_loop.merge {
            let merged = first[name].clone();
            let last = renamer.transform_expr(b, back)?;
            if let Some(merged_name) = merged.as_var() {
                unrolled_merge.insert(merged_name.clone(), (entry.clone(), last));
            }
            remainder_merge.insert(name.clone(), (merged, back.clone()));
        }

        b.insert_stmt(Stmt::ForLoop(ForLoop {
            var: first_var,
            start: for_loop.start.clone(),
            stop: unrolled_stop.clone(),
            step: big_step,
            body,
            merge: unrolled_merge,
        }));
        debug!(factor = self.unroll_factor, var = %for_loop.var, "unrolled loop");

        Ok(Stmt::ForLoop(ForLoop {
            start: unrolled_stop,
            merge: remainder_merge,
            ..for_loop
        }))
    }
}

impl Transform for LoopUnrolling {
    fn cache_key(&self) -> String {
        format!("loop_unrolling({})", self.unroll_factor)
    }

    fn transform_for(&mut self, b: &mut Builder<'_>, for_loop: &ForLoop) -> Result<Stmt, Error> {
        // Inner loops first; their remainder loops then make the outer body non-simple
        let for_loop = walk_for(self, b, for_loop)?;
        if self.unroll_factor == 1 {
            return Ok(Stmt::ForLoop(for_loop));
        }
        if let Some(step) = for_loop.step.as_const_int() {
            if step <= 0 {
                return Err(Error::DownwardStep(step));
            }
        }
        if !is_simple_block(&for_loop.body) || count_stmts(&for_loop.body) > MAX_UNROLL_BODY_STMTS
        {
            return Ok(Stmt::ForLoop(for_loop));
        }
        self.unroll(b, for_loop)
    }
}
