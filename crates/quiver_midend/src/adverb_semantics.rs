//! The meaning of each data-parallel adverb, written once against an abstract value domain.

use crate::error::Error;

pub trait AdverbSemantics: Sized {
    type Value: Clone;

    fn rank(&self, x: &Self::Value) -> usize;

    fn const_int(&mut self, value: i64) -> Self::Value;

    fn none_value(&mut self) -> Self::Value;

    fn is_none_value(&self, x: &Self::Value) -> bool;

    fn slice_all_value(&mut self) -> Self::Value;

    fn tuple_value(&mut self, elts: Vec<Self::Value>) -> Result<Self::Value, Error>;

    fn index_value(&mut self, x: &Self::Value, idx: &Self::Value) -> Result<Self::Value, Error>;

    fn size_along_axis(&mut self, x: &Self::Value, axis: usize) -> Result<Self::Value, Error>;

    fn check_equal_sizes(&mut self, axis: usize, sizes: &[Self::Value]) -> Result<(), Error>;

    fn invoke(&mut self, func: &Self::Value, args: Vec<Self::Value>)
        -> Result<Self::Value, Error>;

    fn loop_over(
        &mut self,
        start: Self::Value,
        stop: Self::Value,
        body: &mut dyn FnMut(&mut Self, Self::Value) -> Result<(), Error>,
    ) -> Result<(), Error>;

    fn accumulate_loop(
        &mut self,
        start: Self::Value,
        stop: Self::Value,
        init: Self::Value,
        body: &mut dyn FnMut(&mut Self, Self::Value, Self::Value) -> Result<Self::Value, Error>,
    ) -> Result<Self::Value, Error>;

    /// Storage for `outer_shape` copies of values shaped like `first`.
    fn alloc_result(
        &mut self,
        first: &Self::Value,
        outer_shape: Vec<Self::Value>,
    ) -> Result<Self::Value, Error>;

    fn set_index(
        &mut self,
        array: &Self::Value,
        idx: Self::Value,
        value: Self::Value,
    ) -> Result<(), Error>;

    /// The index selecting position `idx` along `axis` and everything along every other axis.
    fn build_slice_indices(
        &mut self,
        rank: usize,
        axis: usize,
        idx: &Self::Value,
    ) -> Result<Self::Value, Error> {
        if rank == 1 {
            debug_assert_eq!(axis, 0);
            return Ok(idx.clone());
        }
        let mut indices = Vec::with_capacity(rank);
        for dim in 0..rank {
            if dim == axis {
                indices.push(idx.clone());
            } else {
                indices.push(self.slice_all_value());
            }
        }
        self.tuple_value(indices)
    }

    /// `x` at position `idx` along `axis`.  Values without that axis broadcast unchanged.
    fn slice_along_axis(
        &mut self,
        x: &Self::Value,
        axis: usize,
        idx: &Self::Value,
    ) -> Result<Self::Value, Error> {
        let rank = self.rank(x);
        if rank <= axis {
            return Ok(x.clone());
        }
        let indices = self.build_slice_indices(rank, axis, idx)?;
        self.index_value(x, &indices)
    }

    /// The common extent of `xs` along `axis`, ignoring (broadcasting) arguments too low-rank to
    /// have that axis.
    fn sizes_along_axis(&mut self, xs: &[Self::Value], axis: usize) -> Result<Self::Value, Error> {
        let mut sizes = Vec::new();
        for x in xs {
            if self.rank(x) > axis {
                sizes.push(self.size_along_axis(x, axis)?);
            }
        }
        if sizes.is_empty() {
            let rank = xs.iter().map(|x| self.rank(x)).max().unwrap_or(0);
            return Err(Error::AxisOutOfRange { axis, rank });
        }
        self.check_equal_sizes(axis, &sizes)?;
        Ok(sizes.swap_remove(0))
    }

    fn map_elt(
        &mut self,
        func: &Self::Value,
        xs: &[Self::Value],
        axis: usize,
        idx: &Self::Value,
    ) -> Result<Self::Value, Error> {
        let mut elts = Vec::with_capacity(xs.len());
        for x in xs {
            elts.push(self.slice_along_axis(x, axis, idx)?);
        }
        self.invoke(func, elts)
    }

    /// The accumulator after element 0: `func(elt0)` with no initial value, otherwise
    /// `combine(init, func(elt0))`.  Accumulation then continues from element 1.
    fn acc_prelude(
        &mut self,
        func: &Self::Value,
        combine: &Self::Value,
        init: Option<&Self::Value>,
        xs: &[Self::Value],
        axis: usize,
    ) -> Result<Self::Value, Error> {
        let zero = self.const_int(0);
        let first = self.map_elt(func, xs, axis, &zero)?;
        match init {
            Some(init) if !self.is_none_value(init) => {
                self.invoke(combine, vec![init.clone(), first])
            }
            _ => Ok(first),
        }
    }

    fn eval_map(
        &mut self,
        func: &Self::Value,
        xs: &[Self::Value],
        axis: usize,
    ) -> Result<Self::Value, Error> {
        let niters = self.sizes_along_axis(xs, axis)?;
        let zero = self.const_int(0);
        let first = self.map_elt(func, xs, axis, &zero)?;
        let result = self.alloc_result(&first, vec![niters.clone()])?;
        // The iteration dimension always comes first in the result
        let rank = self.rank(&result);
        let first_idx = self.build_slice_indices(rank, 0, &zero)?;
        self.set_index(&result, first_idx, first)?;

        let one = self.const_int(1);
        self.loop_over(one, niters, &mut |s, idx| {
            let elt = s.map_elt(func, xs, axis, &idx)?;
            let out_idx = s.build_slice_indices(rank, 0, &idx)?;
            s.set_index(&result, out_idx, elt)
        })?;
        Ok(result)
    }

    /// Left fold: `combine(...combine(combine(init, f(x0)), f(x1))..., f(xn-1))`.
    fn eval_reduce(
        &mut self,
        func: &Self::Value,
        combine: &Self::Value,
        init: Option<&Self::Value>,
        xs: &[Self::Value],
        axis: usize,
    ) -> Result<Self::Value, Error> {
        let niters = self.sizes_along_axis(xs, axis)?;
        let acc = self.acc_prelude(func, combine, init, xs, axis)?;
        let one = self.const_int(1);
        self.accumulate_loop(one, niters, acc, &mut |s, acc, idx| {
            let elt = s.map_elt(func, xs, axis, &idx)?;
            s.invoke(combine, vec![acc, elt])
        })
    }

    /// Like `eval_reduce`, but stores `emit(acc)` after every step.
    fn eval_scan(
        &mut self,
        func: &Self::Value,
        combine: &Self::Value,
        emit: &Self::Value,
        init: Option<&Self::Value>,
        xs: &[Self::Value],
        axis: usize,
    ) -> Result<Self::Value, Error> {
        let niters = self.sizes_along_axis(xs, axis)?;
        let acc = self.acc_prelude(func, combine, init, xs, axis)?;
        let first_output = self.invoke(emit, vec![acc.clone()])?;
        let result = self.alloc_result(&first_output, vec![niters.clone()])?;
        let rank = self.rank(&result);
        let zero = self.const_int(0);
        let first_idx = self.build_slice_indices(rank, 0, &zero)?;
        self.set_index(&result, first_idx, first_output)?;

        let one = self.const_int(1);
        self.accumulate_loop(one, niters, acc, &mut |s, acc, idx| {
            let elt = s.map_elt(func, xs, axis, &idx)?;
            let next = s.invoke(combine, vec![acc, elt])?;
            let output = s.invoke(emit, vec![next.clone()])?;
            let out_idx = s.build_slice_indices(rank, 0, &idx)?;
            s.set_index(&result, out_idx, output)?;
            Ok(next)
        })?;
        Ok(result)
    }

    /// `result[i, j] = func(x[i], y[j])` for every pair of positions along `axis`.
    fn eval_all_pairs(
        &mut self,
        func: &Self::Value,
        x: &Self::Value,
        y: &Self::Value,
        axis: usize,
    ) -> Result<Self::Value, Error> {
        let nx = self.size_along_axis(x, axis)?;
        let ny = self.size_along_axis(y, axis)?;
        let zero = self.const_int(0);
        let first_x = self.slice_along_axis(x, axis, &zero)?;
        let first_y = self.slice_along_axis(y, axis, &zero)?;
        let first_output = self.invoke(func, vec![first_x, first_y])?;
        let result = self.alloc_result(&first_output, vec![nx.clone(), ny.clone()])?;

        self.loop_over(zero, nx, &mut |s, i| {
            let xi = s.slice_along_axis(x, axis, &i)?;
            let zero = s.const_int(0);
            s.loop_over(zero, ny.clone(), &mut |s, j| {
                let yj = s.slice_along_axis(y, axis, &j)?;
                let output = s.invoke(func, vec![xi.clone(), yj])?;
                let out_idx = s.tuple_value(vec![i.clone(), j])?;
                s.set_index(&result, out_idx, output)
            })
        })?;
        Ok(result)
    }
}
