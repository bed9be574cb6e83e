use crate::adverb_semantics::AdverbSemantics;
use crate::builder::Builder;
use crate::error::Error;
use crate::inline::{full_slice, inline};
use crate::session::Session;
use crate::transform::{apply, walk_expr, Transform};
use quiver_common::config::PassOptions;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{
    block_any_expr, Expr, ExprKind, If, MergeMap, Stmt, TilePolicy, TypedFn, VarName, While,
};
use quiver_common::data::types::{FuncName, Type, BOOL, INT64};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct LowerTiledAdverbs {
    options: PassOptions,
    // Next entry of the fixed tile size list to hand out
    fixed_idx: usize,
    // Next element of the tile-size tuple to hand out
    nesting_idx: usize,
    // Whether the function being lowered reads the tile-size tuple
    tiling: bool,
    tile_sizes_param: Option<Expr>,
    num_tiles: usize,
    // Callable-typed locals whose callee was replaced by its lowered version
    retyped: BTreeMap<VarName, Type>,
}

fn is_tiled(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::TiledMap { .. } | ExprKind::TiledReduce { .. }
    )
}

fn referenced_functions(func: &TypedFn) -> BTreeSet<FuncName> {
    let mut names = BTreeSet::new();
    block_any_expr(&func.body, &mut |expr| {
        if let ExprKind::Call(name, _) = &expr.kind {
            names.insert(name.clone());
        }
        if let Some((name, _)) = expr.type_.callee() {
            names.insert(name.clone());
        }
        false
    });
    names
}

/// Whether `func`, or anything it calls or refers to, contains a tiled adverb.
pub fn reaches_tiled(session: &Session, func: &TypedFn) -> Result<bool, Error> {
    let mut visited = BTreeSet::new();
    let mut pending = vec![func.name.clone()];
    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }
        let func = session.lookup(&name)?;
        if block_any_expr(&func.body, &mut is_tiled) {
            return Ok(true);
        }
        pending.extend(referenced_functions(&func));
    }
    Ok(false)
}

/// How many run-time tile sizes lowering `func` consumes, including those consumed by the
/// functions its tiled adverbs and calls reach.
pub fn num_dynamic_tiles(session: &Session, func: &TypedFn) -> Result<usize, Error> {
    count_dynamic_tiles(session, func, &mut Vec::new())
}

fn count_dynamic_tiles(
    session: &Session,
    func: &TypedFn,
    stack: &mut Vec<FuncName>,
) -> Result<usize, Error> {
    if stack.contains(&func.name) {
        return Err(Error::RecursiveTiling(func.name.clone()));
    }
    let mut callees = Vec::new();
    let mut count = 0;
    block_any_expr(&func.body, &mut |expr| {
        match &expr.kind {
            ExprKind::TiledMap { func, tile, .. } => {
                count += (*tile == TilePolicy::Dynamic) as usize;
                callees.extend(func.type_.callee().map(|(name, _)| name.clone()));
            }
            ExprKind::TiledReduce {
                func,
                combine,
                tile,
                ..
            } => {
                count += (*tile == TilePolicy::Dynamic) as usize;
                callees.extend(func.type_.callee().map(|(name, _)| name.clone()));
                callees.extend(combine.type_.callee().map(|(name, _)| name.clone()));
            }
            ExprKind::Call(name, _) => callees.push(name.clone()),
            _ => {}
        }
        false
    });

    stack.push(func.name.clone());
    for name in callees {
        let callee = session.lookup(&name)?;
        if reaches_tiled(session, &callee)? {
            count += count_dynamic_tiles(session, &callee, stack)?;
        }
    }
    stack.pop();
    Ok(count)
}

impl LowerTiledAdverbs {
    pub fn new(fixed_tile_sizes: Vec<i64>) -> Self {
        Self::from_options(&PassOptions {
            fixed_tile_sizes,
            ..PassOptions::default()
        })
    }

    pub fn from_options(options: &PassOptions) -> Self {
        debug_assert!(options.fixed_tile_sizes.iter().all(|&size| size > 0));
        LowerTiledAdverbs {
            options: options.clone(),
            fixed_idx: 0,
            nesting_idx: 0,
            tiling: false,
            tile_sizes_param: None,
            num_tiles: 0,
            retyped: BTreeMap::new(),
        }
    }

    fn tile_sizes_param(&self) -> Result<Expr, Error> {
        self.tile_sizes_param.clone().ok_or_else(|| {
            Error::ShapeInference("dynamic tile size requested without a tile-size tuple".into())
        })
    }

    fn tile_size(&mut self, b: &mut Builder<'_>, policy: TilePolicy) -> Result<Expr, Error> {
        match policy {
            TilePolicy::Fixed => {
                let size = self.options.fixed_tile_size(self.fixed_idx);
                self.fixed_idx += 1;
                Ok(Expr::int64(size))
            }
            TilePolicy::Dynamic => {
                let param = self.tile_sizes_param()?;
                self.tiling = true;
                let idx = self.nesting_idx;
                self.nesting_idx += 1;
                b.tuple_proj(&param, idx)
            }
        }
    }

    // Returns the lowered function and the number of run-time tile sizes it consumes
    fn lower_function(
        &mut self,
        b: &mut Builder<'_>,
        callee: Rc<TypedFn>,
    ) -> Result<(Rc<TypedFn>, usize), Error> {
        if !reaches_tiled(b.session(), &callee)? {
            return Ok((callee, 0));
        }

        let nested_tiles = num_dynamic_tiles(b.session(), &callee)?;
        let mut nested = LowerTiledAdverbs {
            options: self.options.clone(),
            fixed_idx: self.fixed_idx,
            nesting_idx: self.nesting_idx,
            tiling: false,
            tile_sizes_param: if nested_tiles > 0 {
                Some(self.tile_sizes_param()?)
            } else {
                None
            },
            num_tiles: nested_tiles,
            retyped: BTreeMap::new(),
        };
        let lowered = apply(&mut nested, b.session(), &callee)?;
        self.fixed_idx = nested.fixed_idx;
        self.tiling |= nested.tiling;
        self.nesting_idx += nested_tiles;
        Ok((lowered, nested_tiles))
    }

    fn lower_callee(
        &mut self,
        b: &mut Builder<'_>,
        callable: &Expr,
    ) -> Result<(Rc<TypedFn>, Vec<Expr>, usize), Error> {
        let callee = b.callee(callable)?;
        let captured = b.closure_args(callable)?;
        let captured = self.transform_exprs(b, &captured)?;
        let (lowered, nested_tiles) = self.lower_function(b, callee)?;
        Ok((lowered, captured, nested_tiles))
    }

    // A function value passed around (rather than called or tiled) cannot be handed the tile-size
    // tuple, so everything it reaches must use fixed tile sizes.
    fn lower_callable_value(
        &mut self,
        b: &mut Builder<'_>,
        callable: &Expr,
    ) -> Result<Expr, Error> {
        let callee = b.callee(callable)?;
        if num_dynamic_tiles(b.session(), &callee)? > 0 {
            return Err(Error::DynamicTilesInCallable(callee.name.clone()));
        }
        let (lowered, captured, _) = self.lower_callee(b, callable)?;
        Ok(match callable.kind {
            ExprKind::FnRef(_) => Expr::fn_ref(&lowered),
            _ => Expr::closure(&lowered, captured),
        })
    }

    fn nested_tile_sizes(&self, nested_tiles: usize) -> Result<Option<Expr>, Error> {
        if nested_tiles > 0 {
            Ok(Some(self.tile_sizes_param()?))
        } else {
            Ok(None)
        }
    }

    // Tile sizes never affect the shape of a result, so shape inference sees a tuple of ones
    fn shape_args(captured: &[Expr], args: &[Expr], tile_sizes: Option<&Expr>) -> Vec<Expr> {
        let mut shape_args = captured.to_vec();
        shape_args.extend(args.iter().cloned());
        if let Some(tile_sizes) = tile_sizes {
            let len = tile_sizes.type_.tuple_elts().map_or(0, <[Type]>::len);
            shape_args.push(Expr::tuple(vec![Expr::int64(1); len]));
        }
        shape_args
    }

    fn iteration_extent(
        b: &mut Builder<'_>,
        adverb: &'static str,
        args: &[Expr],
        axes: &[usize],
    ) -> Result<Expr, Error> {
        if args.len() != axes.len() || args.is_empty() {
            return Err(Error::AdverbArity {
                adverb,
                expected: axes.len().max(1),
                actual: args.len(),
            });
        }
        b.shape(&args[0], Some(axes[0]))
    }

    fn tile_args(
        b: &mut Builder<'_>,
        captured: &[Expr],
        args: &[Expr],
        axes: &[usize],
        bounds: &Expr,
        tile_sizes: Option<&Expr>,
    ) -> Result<Vec<Expr>, Error> {
        let mut tile_args = captured.to_vec();
        for (arg, &axis) in args.iter().zip(axes) {
            tile_args.push(b.slice_along_axis(arg, axis, bounds)?);
        }
        tile_args.extend(tile_sizes.cloned());
        Ok(tile_args)
    }

    fn lower_tiled_map(
        &mut self,
        b: &mut Builder<'_>,
        func: &Expr,
        args: &[Expr],
        axes: &[usize],
        tile: TilePolicy,
    ) -> Result<Expr, Error> {
        let args = self.transform_exprs(b, args)?;
        let niters = Self::iteration_extent(b, "tiled map", &args, axes)?;
        let tile_size = self.tile_size(b, tile)?;
        let (inner, captured, nested_tiles) = self.lower_callee(b, func)?;
        let tile_sizes = self.nested_tile_sizes(nested_tiles)?;

        let result = b.create_output_array(
            &Expr::fn_ref(&inner),
            Self::shape_args(&captured, &args, tile_sizes.as_ref()),
            Vec::new(),
            "tiled_result",
        )?;
        let out_axis = axes[0];
        if result.type_.rank() <= out_axis {
            return Err(Error::AxisOutOfRange {
                axis: out_axis,
                rank: result.type_.rank(),
            });
        }

        b.for_loop(
            &Expr::int64(0),
            &niters,
            &tile_size,
            MergeMap::new(),
            |b, i| {
                let next = b.add(i, &tile_size, "next")?;
                let stop = b.min(&next, &niters, "slice_stop")?;
                let bounds = Expr::slice(i.clone(), stop, Expr::int64(1));
                let tile_args =
                    Self::tile_args(b, &captured, &args, axes, &bounds, tile_sizes.as_ref())?;
                let region = b.slice_along_axis(&result, out_axis, &bounds)?;
                inline(b, &inner, tile_args, Some(&region))?;
                Ok(())
            },
        )?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_tiled_reduce(
        &mut self,
        b: &mut Builder<'_>,
        func: &Expr,
        combine: &Expr,
        init: &Expr,
        args: &[Expr],
        axes: &[usize],
        tile: TilePolicy,
    ) -> Result<Expr, Error> {
        let args = self.transform_exprs(b, args)?;
        let niters = Self::iteration_extent(b, "tiled reduce", &args, axes)?;
        let tile_size = self.tile_size(b, tile)?;
        let (inner, captured, nested_tiles) = self.lower_callee(b, func)?;
        let (combine_fn, combine_captured, combine_tiles) = self.lower_callee(b, combine)?;
        let init = self.transform_expr(b, init)?;
        let tile_sizes = self.nested_tile_sizes(nested_tiles)?;
        let combine_tile_sizes = self.nested_tile_sizes(combine_tiles)?;

        let acc = b.create_output_array(
            &Expr::fn_ref(&inner),
            Self::shape_args(&captured, &args, tile_sizes.as_ref()),
            Vec::new(),
            "loop_result",
        )?;

        let (i, i_after, mut merge) = b.loop_counter("i", Expr::int64(0));
        // A scalar accumulator is carried through the loop; an array one is updated in place
        let acc_after = if acc.type_.rank() == 0 {
            let entry = b.coerce(&init, &acc.type_, "tiled reduce initializer")?;
            let acc_after = b.fresh_var(acc.type_.clone(), "loop_after");
            if let Some(name) = acc.as_var() {
                merge.insert(name.clone(), (entry, acc_after.clone()));
            }
            Some(acc_after)
        } else {
            lift_init(b, &acc, &init)?;
            None
        };

        let cond = Expr::new(
            ExprKind::PrimCall(Prim::Lt, vec![i.clone(), niters.clone()]),
            BOOL,
        );
        let (body, ()) = b.with_scope(|b| {
            // The last tile stops at the end of the input
            let next_bound = b.add(&i, &tile_size, "next_bound")?;
            let fits = b.lte(&next_bound, &niters, "tile_fits")?;
            let mut guard = MergeMap::new();
            if let Some(name) = i_after.as_var() {
                guard.insert(name.clone(), (next_bound, niters.clone()));
            }
            b.insert_stmt(Stmt::If(If {
                cond: fits,
                true_block: Vec::new(),
                false_block: Vec::new(),
                merge: guard,
            }));

            let bounds = Expr::slice(i.clone(), i_after.clone(), Expr::int64(1));
            let tile_args =
                Self::tile_args(b, &captured, &args, axes, &bounds, tile_sizes.as_ref())?;
            let tile_result = b.call(&Expr::fn_ref(&inner), tile_args, "tile_result")?;
            let mut combine_args = combine_captured.clone();
            combine_args.push(acc.clone());
            combine_args.push(tile_result);
            combine_args.extend(combine_tile_sizes.clone());
            let combined = b.call(&Expr::fn_ref(&combine_fn), combine_args, "combined")?;
            match &acc_after {
                Some(acc_after) => {
                    let combined = b.coerce(&combined, &acc_after.type_, "tiled reduce")?;
                    b.assign(acc_after, combined);
                }
                None => b.setidx(&acc, &full_slice(acc.type_.rank()), &combined)?,
            }
            Ok(())
        })?;
        b.insert_stmt(Stmt::While(While { cond, body, merge }));
        Ok(acc)
    }
}

/// Fills the array accumulator `acc` with `init`, repeating it across however many leading
/// dimensions `acc` has beyond `init`'s.
fn lift_init(b: &mut Builder<'_>, acc: &Expr, init: &Expr) -> Result<(), Error> {
    let acc_rank = acc.type_.rank();
    let init_rank = init.type_.rank();
    if init_rank > acc_rank {
        return Err(Error::RankMismatch {
            context: "tiled reduce initializer",
            detail: format!(
                "initializer of rank {} for an accumulator of rank {}",
                init_rank, acc_rank
            ),
        });
    }
    lift_level(b, acc, init, acc_rank - init_rank, Vec::new())
}

fn lift_level(
    b: &mut Builder<'_>,
    acc: &Expr,
    init: &Expr,
    remaining: usize,
    prefix: Vec<Expr>,
) -> Result<(), Error> {
    if remaining == 0 {
        let mut idx = prefix;
        idx.resize(acc.type_.rank(), Expr::slice_all());
        return b.setidx(acc, &Expr::tuple(idx), init);
    }
    let extent = b.shape(acc, Some(prefix.len()))?;
    let (j, j_after, merge) = b.loop_counter("j", Expr::int64(0));
    let cond = Expr::new(
        ExprKind::PrimCall(Prim::Lt, vec![j.clone(), extent]),
        BOOL,
    );
    let (body, ()) = b.with_scope(|b| {
        let mut prefix = prefix.clone();
        prefix.push(j.clone());
        lift_level(b, acc, init, remaining - 1, prefix)?;
        let next = b.add(&j, &Expr::int64(1), "j_next")?;
        b.assign(&j_after, next);
        Ok(())
    })?;
    b.insert_stmt(Stmt::While(While { cond, body, merge }));
    Ok(())
}

impl Transform for LowerTiledAdverbs {
    fn cache_key(&self) -> String {
        format!("lower_tiled_adverbs({:?})", self.options.fixed_tile_sizes)
    }

    fn pre_apply(&mut self, b: &mut Builder<'_>, func: &TypedFn) -> Result<(), Error> {
        if self.tile_sizes_param.is_none() {
            self.num_tiles = num_dynamic_tiles(b.session(), func)?;
            if self.num_tiles > 0 {
                let param = b.fresh_var(Type::Tuple(vec![INT64; self.num_tiles]), "tile_sizes");
                self.tile_sizes_param = Some(param);
            }
        }
        Ok(())
    }

    fn post_apply(&mut self, mut func: TypedFn) -> Result<TypedFn, Error> {
        if self.tiling {
            let param = self.tile_sizes_param()?;
            if let Some(name) = param.as_var() {
                func.arg_names.push(name.clone());
                func.input_types.push(param.type_.clone());
                func.type_env.insert(name.clone(), param.type_.clone());
            }
            debug!(func = %func.name, num_tiles = self.num_tiles, "added tile-size parameter");
        }
        Ok(func)
    }

    fn transform_expr(&mut self, b: &mut Builder<'_>, expr: &Expr) -> Result<Expr, Error> {
        match &expr.kind {
            ExprKind::TiledMap {
                func,
                args,
                axes,
                tile,
            } => self.lower_tiled_map(b, func, args, axes, *tile),
            ExprKind::TiledReduce {
                func,
                combine,
                init,
                args,
                axes,
                tile,
            } => self.lower_tiled_reduce(b, func, combine, init, args, axes, *tile),
            ExprKind::Call(name, args) => {
                let callee = b.session().lookup(name)?;
                let mut args = self.transform_exprs(b, args)?;
                let (lowered, nested_tiles) = self.lower_function(b, callee)?;
                args.extend(self.nested_tile_sizes(nested_tiles)?);
                Ok(Expr::new(
                    ExprKind::Call(lowered.name.clone(), args),
                    expr.type_.clone(),
                ))
            }
            ExprKind::FnRef(_) | ExprKind::Closure(_, _) => self.lower_callable_value(b, expr),
            ExprKind::Var(name) => Ok(match self.retyped.get(name) {
                Some(type_) => Expr::var(name.clone(), type_.clone()),
                None => expr.clone(),
            }),
            _ => walk_expr(self, b, expr),
        }
    }

    fn transform_assign(
        &mut self,
        b: &mut Builder<'_>,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<Stmt, Error> {
        let rhs = self.transform_expr(b, rhs)?;
        if let ExprKind::Var(name) = &lhs.kind {
            if rhs.type_ != lhs.type_ && rhs.type_.callee().is_some() {
                self.retyped.insert(name.clone(), rhs.type_.clone());
                let lhs = b.declare(name.clone(), rhs.type_.clone());
                return Ok(Stmt::Assign(lhs, rhs));
            }
        }
        let lhs = self.transform_lhs(b, lhs)?;
        Ok(Stmt::Assign(lhs, rhs))
    }
}
