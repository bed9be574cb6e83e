use super::{build_fn, identity_fn, prim_fn, random_ints, rng, run};
use crate::interpreter::Value;
use crate::lower_adverbs::LowerAdverbs;
use crate::session::Session;
use crate::transform::{apply, cached_apply};
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{block_any_expr, Expr, ExprKind, TypedFn};
use quiver_common::data::types::{ScalarType, Type, INT64};
use std::rc::Rc;

const INT_VECTOR: Type = Type::Array(ScalarType::Int64, 1);
const INT_MATRIX: Type = Type::Array(ScalarType::Int64, 2);

fn has_adverbs(func: &TypedFn) -> bool {
    block_any_expr(&func.body, &mut |e| {
        matches!(
            e.kind,
            ExprKind::Map { .. }
                | ExprKind::Reduce { .. }
                | ExprKind::Scan { .. }
                | ExprKind::AllPairs { .. }
        )
    })
}

/// `fn(row) -> map(add, row, row)`
fn double_row(session: &mut Session) -> Rc<TypedFn> {
    let add = prim_fn(session, "add", Prim::Add, ScalarType::Int64);
    build_fn(session, "double_row", vec![INT_VECTOR], |_, args| {
        Ok(Expr::new(
            ExprKind::Map {
                func: Box::new(Expr::fn_ref(&add)),
                args: vec![args[0].clone(), args[0].clone()],
                axis: 0,
            },
            INT_VECTOR,
        ))
    })
}

fn reduce_fn(session: &mut Session, combine: Prim, init: Option<i64>) -> Rc<TypedFn> {
    let identity = identity_fn(session, INT64);
    let combine = prim_fn(session, "combine", combine, ScalarType::Int64);
    build_fn(session, "fold", vec![INT_VECTOR], |_, args| {
        Ok(Expr::new(
            ExprKind::Reduce {
                func: Box::new(Expr::fn_ref(&identity)),
                combine: Box::new(Expr::fn_ref(&combine)),
                init: init.map(|v| Box::new(Expr::int64(v))),
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT64,
        ))
    })
}

fn lower_and_compare(session: &mut Session, func: &Rc<TypedFn>, args: Vec<Value>) -> Value {
    let lowered = apply(&mut LowerAdverbs, session, func).unwrap();
    assert!(!has_adverbs(&lowered));
    let expected = run(session, func, args.clone());
    let actual = run(session, &lowered, args);
    assert_eq!(actual, expected);
    actual
}

#[test]
fn map_over_rows_keeps_the_row_shape() {
    let mut session = Session::default();
    let double_row = double_row(&mut session);
    let f = build_fn(&mut session, "double_rows", vec![INT_MATRIX], |_, args| {
        Ok(Expr::new(
            ExprKind::Map {
                func: Box::new(Expr::fn_ref(&double_row)),
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT_MATRIX,
        ))
    });

    let values: Vec<i64> = (0..10).collect();
    let result = lower_and_compare(
        &mut session,
        &f,
        vec![Value::int_array(vec![5, 2], &values)],
    );
    let doubled: Vec<i64> = values.iter().map(|v| 2 * v).collect();
    assert_eq!(result, Value::int_array(vec![5, 2], &doubled));
}

#[test]
fn reduce_is_a_left_fold() {
    let mut session = Session::default();
    let f = reduce_fn(&mut session, Prim::Sub, None);
    let result = lower_and_compare(
        &mut session,
        &f,
        vec![Value::int_array(vec![4], &[10, 1, 2, 3])],
    );
    assert_eq!(result, Value::int(((10 - 1) - 2) - 3));
}

#[test]
fn reduce_starts_from_init() {
    let mut session = Session::default();
    let f = reduce_fn(&mut session, Prim::Sub, Some(100));
    let result = lower_and_compare(
        &mut session,
        &f,
        vec![Value::int_array(vec![3], &[1, 2, 3])],
    );
    assert_eq!(result, Value::int(100 - 1 - 2 - 3));
}

#[test]
fn scan_emits_every_prefix() {
    let mut session = Session::default();
    let identity = identity_fn(&mut session, INT64);
    let add = prim_fn(&mut session, "add", Prim::Add, ScalarType::Int64);
    let f = build_fn(&mut session, "prefix_sums", vec![INT_VECTOR], |_, args| {
        Ok(Expr::new(
            ExprKind::Scan {
                func: Box::new(Expr::fn_ref(&identity)),
                combine: Box::new(Expr::fn_ref(&add)),
                emit: Box::new(Expr::fn_ref(&identity)),
                init: None,
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT_VECTOR,
        ))
    });

    let result = lower_and_compare(
        &mut session,
        &f,
        vec![Value::int_array(vec![5], &[1, 2, 3, 4, 5])],
    );
    assert_eq!(result, Value::int_array(vec![5], &[1, 3, 6, 10, 15]));
}

#[test]
fn all_pairs_builds_an_outer_product() {
    let mut session = Session::default();
    let mul = prim_fn(&mut session, "mul", Prim::Mul, ScalarType::Int64);
    let f = build_fn(
        &mut session,
        "outer",
        vec![INT_VECTOR, INT_VECTOR],
        |_, args| {
            Ok(Expr::new(
                ExprKind::AllPairs {
                    func: Box::new(Expr::fn_ref(&mul)),
                    args: args.to_vec(),
                    axis: 0,
                },
                INT_MATRIX,
            ))
        },
    );

    let x = [1, 2, 3];
    let y = [1, 10, 100, 1000];
    let result = lower_and_compare(
        &mut session,
        &f,
        vec![Value::int_array(vec![3], &x), Value::int_array(vec![4], &y)],
    );
    let expected: Vec<i64> = x.iter().flat_map(|a| y.iter().map(move |b| a * b)).collect();
    assert_eq!(result, Value::int_array(vec![3, 4], &expected));
}

#[test]
fn callees_are_lowered_too() {
    let mut session = Session::default();
    let double_row = double_row(&mut session);
    let f = build_fn(&mut session, "caller", vec![INT_VECTOR], |b, args| {
        b.call(&Expr::fn_ref(&double_row), vec![args[0].clone()], "doubled")
    });

    let lowered = apply(&mut LowerAdverbs, &mut session, &f).unwrap();
    let callees: Vec<_> = lowered
        .body
        .iter()
        .flat_map(|stmt| stmt.exprs())
        .filter_map(|e| match &e.kind {
            ExprKind::Call(name, _) => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(callees.len(), 1);
    assert_ne!(callees[0], double_row.name);
    assert!(!has_adverbs(&session.lookup(&callees[0]).unwrap()));

    let mut rng = rng();
    let values = random_ints(&mut rng, 7);
    let args = vec![Value::int_array(vec![7], &values)];
    assert_eq!(run(&session, &lowered, args.clone()), run(&session, &f, args));
}

#[test]
fn cached_lowering_is_shared() {
    let mut session = Session::default();
    let f = reduce_fn(&mut session, Prim::Add, None);
    let first = cached_apply(&mut LowerAdverbs, &mut session, &f).unwrap();
    let count = session.num_functions();
    let second = cached_apply(&mut LowerAdverbs, &mut session, &f).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    assert_eq!(session.num_functions(), count);
}

#[test]
fn lowering_random_folds() {
    let mut session = Session::default();
    let f = reduce_fn(&mut session, Prim::Max, Some(-1000));
    let lowered = apply(&mut LowerAdverbs, &mut session, &f).unwrap();
    let mut rng = rng();
    for len in [1, 2, 9, 33] {
        let values = random_ints(&mut rng, len);
        let args = vec![Value::int_array(vec![len as i64], &values)];
        let expected = values.iter().copied().max().unwrap();
        assert_eq!(run(&session, &lowered, args), Value::int(expected));
    }
}
