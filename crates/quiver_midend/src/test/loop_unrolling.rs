use super::{build_fn, rng, run};
use crate::builder::Builder;
use crate::error::Error;
use crate::interpreter::Value;
use crate::loop_unrolling::LoopUnrolling;
use crate::session::Session;
use crate::transform::apply;
use quiver_common::config::PassOptions;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{Expr, If, MergeMap, Stmt, TypedFn};
use quiver_common::data::types::INT64;
use rand::Rng;
use std::rc::Rc;

fn count_loops(block: &[Stmt]) -> usize {
    block
        .iter()
        .map(|stmt| {
            let nested: usize = stmt.blocks().into_iter().map(|b| count_loops(b)).sum();
            nested + usize::from(matches!(stmt, Stmt::ForLoop(_)))
        })
        .sum()
}

/// `acc = 0; for i in range(start, stop, step): acc = acc + body(i)`
fn accumulate(
    b: &mut Builder<'_>,
    start: &Expr,
    stop: &Expr,
    step: i64,
    term: impl FnOnce(&mut Builder<'_>, &Expr) -> Result<Expr, Error>,
) -> Result<Expr, Error> {
    let acc_name = b.fresh_name("acc");
    let acc = b.declare(acc_name.clone(), INT64);
    let acc_after = b.fresh_var(INT64, "acc_after");
    let mut merge = MergeMap::new();
    merge.insert(acc_name, (Expr::int64(0), acc_after.clone()));
    b.for_loop(start, stop, &Expr::int64(step), merge, |b, i| {
        let term = term(b, i)?;
        let next = b.add(&acc, &term, "next")?;
        b.assign(&acc_after, next);
        Ok(())
    })?;
    Ok(acc)
}

/// `sum(i * i for i in range(start, stop, step))`
fn sum_of_squares(session: &mut Session, step: i64) -> Rc<TypedFn> {
    build_fn(session, "sum_of_squares", vec![INT64, INT64], |b, args| {
        accumulate(b, &args[0], &args[1], step, |b, i| b.mul(i, i, "square"))
    })
}

fn expected_sum_of_squares(start: i64, stop: i64, step: i64) -> i64 {
    (start..stop).step_by(step as usize).map(|i| i * i).sum()
}

#[test]
fn unrolled_sums_match_for_every_factor() {
    let mut session = Session::default();
    let f = sum_of_squares(&mut session, 1);
    for factor in [1, 2, 4, 8] {
        let unrolled = apply(&mut LoopUnrolling::new(factor).unwrap(), &mut session, &f).unwrap();
        let expected_loops = if factor == 1 { 1 } else { 2 };
        assert_eq!(count_loops(&unrolled.body), expected_loops);
        for n in [0, 8, 16, 64, 13] {
            let args = vec![Value::int(0), Value::int(n)];
            assert_eq!(
                run(&session, &unrolled, args.clone()),
                run(&session, &f, args),
                "factor {} over {} iterations",
                factor,
                n
            );
            assert_eq!(
                run(&session, &unrolled, vec![Value::int(0), Value::int(n)]),
                Value::int(expected_sum_of_squares(0, n, 1))
            );
        }
    }
}

#[test]
fn strided_loops_keep_their_step() {
    let mut session = Session::default();
    let f = sum_of_squares(&mut session, 3);
    let unrolled = apply(&mut LoopUnrolling::new(4).unwrap(), &mut session, &f).unwrap();
    let mut rng = rng();
    for _ in 0..20 {
        let start = rng.random_range(-20..20);
        let stop = start + rng.random_range(0..50);
        assert_eq!(
            run(&session, &unrolled, vec![Value::int(start), Value::int(stop)]),
            Value::int(expected_sum_of_squares(start, stop, 3)),
            "range({}, {}, 3)",
            start,
            stop
        );
    }
}

#[test]
fn branches_in_the_body_are_unrolled() {
    let mut session = Session::default();
    // Sum of the odd numbers below n
    let f = build_fn(&mut session, "sum_odds", vec![INT64], |b, args| {
        accumulate(b, &Expr::int64(0), &args[0], 1, |b, i| {
            let rem = b.prim(Prim::Mod, &[i.clone(), Expr::int64(2)], "rem")?;
            let is_odd = b.prim(Prim::Eq, &[rem, Expr::int64(1)], "is_odd")?;
            let contrib_name = b.fresh_name("contrib");
            let contrib = b.declare(contrib_name.clone(), INT64);
            let mut merge = MergeMap::new();
            merge.insert(contrib_name, (i.clone(), Expr::int64(0)));
            b.insert_stmt(Stmt::If(If {
                cond: is_odd,
                true_block: Vec::new(),
                false_block: Vec::new(),
                merge,
            }));
            Ok(contrib)
        })
    });

    let unrolled = apply(&mut LoopUnrolling::new(4).unwrap(), &mut session, &f).unwrap();
    assert_eq!(count_loops(&unrolled.body), 2);
    for n in [0, 1, 7, 8, 21] {
        let expected: i64 = (0..n).filter(|i| i % 2 == 1).sum();
        assert_eq!(run(&session, &unrolled, vec![Value::int(n)]), Value::int(expected));
    }
}

#[test]
fn only_inner_loops_are_unrolled() {
    let mut session = Session::default();
    // sum(sum(i * j for j in range(m)) for i in range(n))
    let f = build_fn(&mut session, "nested", vec![INT64, INT64], |b, args| {
        let m = args[1].clone();
        accumulate(b, &Expr::int64(0), &args[0], 1, move |b, i| {
            let i = i.clone();
            accumulate(b, &Expr::int64(0), &m, 1, move |b, j| b.mul(&i, j, "product"))
        })
    });

    let unrolled = apply(&mut LoopUnrolling::new(2).unwrap(), &mut session, &f).unwrap();
    // The outer loop plus the unrolled and remainder inner loops
    assert_eq!(count_loops(&unrolled.body), 3);
    for (n, m) in [(0, 5), (3, 4), (5, 7)] {
        let expected: i64 = (0..n).map(|i| (0..m).map(|j| i * j).sum::<i64>()).sum();
        assert_eq!(
            run(&session, &unrolled, vec![Value::int(n), Value::int(m)]),
            Value::int(expected)
        );
    }
}

#[test]
fn zero_unroll_factor_is_rejected() {
    assert!(matches!(
        LoopUnrolling::new(0),
        Err(Error::InvalidUnrollFactor(0))
    ));
    let options = PassOptions {
        unroll_factor: 0,
        ..Default::default()
    };
    assert!(LoopUnrolling::from_options(&options).is_err());
}
