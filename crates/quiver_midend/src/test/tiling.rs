use super::{build_fn, identity_fn, prim_fn, random_ints, rng, run};
use crate::interpreter::Value;
use crate::error::Error;
use crate::lower_tiled_adverbs::{num_dynamic_tiles, reaches_tiled, LowerTiledAdverbs};
use crate::session::Session;
use crate::transform::apply;
use quiver_common::config::PassOptions;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{block_any_expr, Expr, ExprKind, Stmt, TilePolicy, TypedFn};
use quiver_common::data::types::{ScalarType, Type, INT64};
use std::rc::Rc;

const INT_VECTOR: Type = Type::Array(ScalarType::Int64, 1);
const INT_MATRIX: Type = Type::Array(ScalarType::Int64, 2);

fn has_tiled_adverbs(func: &TypedFn) -> bool {
    block_any_expr(&func.body, &mut |e| {
        matches!(
            e.kind,
            ExprKind::TiledMap { .. } | ExprKind::TiledReduce { .. }
        )
    })
}

fn map_expr(func: &Rc<TypedFn>, arg: &Expr, type_: Type) -> Expr {
    Expr::new(
        ExprKind::Map {
            func: Box::new(Expr::fn_ref(func)),
            args: vec![arg.clone(), arg.clone()],
            axis: 0,
        },
        type_,
    )
}

fn tiled_map_expr(func: &Rc<TypedFn>, arg: &Expr, tile: TilePolicy, type_: Type) -> Expr {
    Expr::new(
        ExprKind::TiledMap {
            func: Box::new(Expr::fn_ref(func)),
            args: vec![arg.clone()],
            axes: vec![0],
            tile,
        },
        type_,
    )
}

/// `fn(x: i64[]) -> map(add, x, x)`
fn double_vector(session: &mut Session) -> Rc<TypedFn> {
    let add = prim_fn(session, "add", Prim::Add, ScalarType::Int64);
    build_fn(session, "double", vec![INT_VECTOR], |_, args| {
        Ok(map_expr(&add, &args[0], INT_VECTOR))
    })
}

/// `fn(x: i64[]) -> tiled_map(double, x)`
fn tiled_double(session: &mut Session, tile: TilePolicy) -> Rc<TypedFn> {
    let double = double_vector(session);
    build_fn(session, "tiled_double", vec![INT_VECTOR], |_, args| {
        Ok(tiled_map_expr(&double, &args[0], tile, INT_VECTOR))
    })
}

/// `fn(x: i64[]) -> tiled_reduce(fold, combine, init, x)`, where `fold` reduces each tile with
/// `combine` too.
fn tiled_fold(session: &mut Session, tile: TilePolicy, combine: Prim, init: i64) -> Rc<TypedFn> {
    let identity = identity_fn(session, INT64);
    let combine = prim_fn(session, "combine", combine, ScalarType::Int64);
    let fold = build_fn(session, "fold", vec![INT_VECTOR], |_, args| {
        Ok(Expr::new(
            ExprKind::Reduce {
                func: Box::new(Expr::fn_ref(&identity)),
                combine: Box::new(Expr::fn_ref(&combine)),
                init: None,
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT64,
        ))
    });
    build_fn(session, "tiled_fold", vec![INT_VECTOR], |_, args| {
        Ok(Expr::new(
            ExprKind::TiledReduce {
                func: Box::new(Expr::fn_ref(&fold)),
                combine: Box::new(Expr::fn_ref(&combine)),
                init: Box::new(Expr::int64(init)),
                args: vec![args[0].clone()],
                axes: vec![0],
                tile,
            },
            INT64,
        ))
    })
}

fn tiled_sum(session: &mut Session, tile: TilePolicy) -> Rc<TypedFn> {
    tiled_fold(session, tile, Prim::Add, 0)
}

/// `fn(x: i64[]) -> callee(x)`
fn caller(session: &mut Session, callee: &Rc<TypedFn>) -> Rc<TypedFn> {
    build_fn(session, "caller", vec![INT_VECTOR], |b, args| {
        b.call(&Expr::fn_ref(callee), vec![args[0].clone()], "result")
    })
}

/// `fn(x: i64[][]) -> map(row_fn, x)`
fn map_rows(session: &mut Session, row_fn: &Rc<TypedFn>) -> Rc<TypedFn> {
    build_fn(session, "map_rows", vec![INT_MATRIX], |_, args| {
        Ok(Expr::new(
            ExprKind::Map {
                func: Box::new(Expr::fn_ref(row_fn)),
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT_MATRIX,
        ))
    })
}

fn tile_loop(func: &TypedFn) -> &Stmt {
    func.body
        .iter()
        .find(|stmt| matches!(stmt, Stmt::ForLoop(_) | Stmt::While(_)))
        .expect("lowered function should contain the tile loop")
}

#[test]
fn tile_size_one_visits_every_element() {
    let mut session = Session::default();
    let f = tiled_double(&mut session, TilePolicy::Fixed);
    let lowered = apply(&mut LowerTiledAdverbs::new(vec![1]), &mut session, &f).unwrap();
    assert!(!has_tiled_adverbs(&lowered));
    let args = vec![Value::int_array(vec![4], &[1, 2, 3, 4])];
    assert_eq!(
        run(&session, &lowered, args),
        Value::int_array(vec![4], &[2, 4, 6, 8])
    );
}

#[test]
fn tiled_map_handles_partial_tiles() {
    let mut session = Session::default();
    let f = tiled_double(&mut session, TilePolicy::Fixed);
    let values: Vec<i64> = (0..10).collect();
    let doubled: Vec<i64> = values.iter().map(|v| 2 * v).collect();

    for tile in [3, 4, 7, 10, 11] {
        let lowered = apply(&mut LowerTiledAdverbs::new(vec![tile]), &mut session, &f).unwrap();
        match tile_loop(&lowered) {
            Stmt::ForLoop(for_loop) => assert_eq!(for_loop.step, Expr::int64(tile)),
            other => panic!("expected a for loop over tiles, got {:?}", other),
        }
        assert_eq!(
            run(&session, &lowered, vec![Value::int_array(vec![10], &values)]),
            Value::int_array(vec![10], &doubled),
            "tile size {}",
            tile
        );
    }
}

#[test]
fn tiled_reduce_matches_the_untiled_fold() {
    let mut session = Session::default();
    let f = tiled_sum(&mut session, TilePolicy::Fixed);
    let mut rng = rng();
    let values = random_ints(&mut rng, 10);
    let args = vec![Value::int_array(vec![10], &values)];
    let expected = run(&session, &f, args.clone());
    assert_eq!(expected, Value::int(values.iter().sum()));

    for tile in [1, 3, 4, 7, 10, 11] {
        let lowered = apply(&mut LowerTiledAdverbs::new(vec![tile]), &mut session, &f).unwrap();
        assert!(matches!(tile_loop(&lowered), Stmt::While(_)));
        assert_eq!(
            run(&session, &lowered, args.clone()),
            expected,
            "tile size {}",
            tile
        );
    }
}

#[test]
fn missing_fixed_sizes_fall_back_to_the_default() {
    let mut session = Session::default();
    let f = tiled_double(&mut session, TilePolicy::Fixed);
    let lowered = apply(&mut LowerTiledAdverbs::new(Vec::new()), &mut session, &f).unwrap();
    match tile_loop(&lowered) {
        Stmt::ForLoop(for_loop) => assert_eq!(
            for_loop.step,
            Expr::int64(quiver_common::config::DEFAULT_REG_TILE_SIZE)
        ),
        other => panic!("expected a for loop over tiles, got {:?}", other),
    }
}

#[test]
fn dynamic_tiles_add_a_tile_size_parameter() {
    let mut session = Session::default();
    let f = tiled_sum(&mut session, TilePolicy::Dynamic);
    assert_eq!(num_dynamic_tiles(&session, &f).unwrap(), 1);

    let lowered = apply(&mut LowerTiledAdverbs::new(Vec::new()), &mut session, &f).unwrap();
    assert_eq!(lowered.input_types.len(), 2);
    assert_eq!(lowered.input_types[1], Type::Tuple(vec![INT64]));

    let values: Vec<i64> = (1..=9).collect();
    for tile in [1, 2, 5, 9, 20] {
        let args = vec![
            Value::int_array(vec![9], &values),
            Value::Tuple(vec![Value::int(tile)]),
        ];
        assert_eq!(run(&session, &lowered, args), Value::int(45), "tile size {}", tile);
    }
}

#[test]
fn nested_dynamic_tiles_share_one_tuple() {
    let mut session = Session::default();
    let double = double_vector(&mut session);
    let double_rows = build_fn(&mut session, "double_rows", vec![INT_MATRIX], |_, args| {
        Ok(Expr::new(
            ExprKind::Map {
                func: Box::new(Expr::fn_ref(&double)),
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT_MATRIX,
        ))
    });
    let inner = build_fn(&mut session, "inner", vec![INT_MATRIX], |_, args| {
        Ok(tiled_map_expr(
            &double_rows,
            &args[0],
            TilePolicy::Dynamic,
            INT_MATRIX,
        ))
    });
    let outer = build_fn(&mut session, "outer", vec![INT_MATRIX], |_, args| {
        Ok(tiled_map_expr(&inner, &args[0], TilePolicy::Dynamic, INT_MATRIX))
    });
    assert_eq!(num_dynamic_tiles(&session, &outer).unwrap(), 2);

    let lowered = apply(&mut LowerTiledAdverbs::new(Vec::new()), &mut session, &outer).unwrap();
    assert_eq!(
        lowered.input_types.last(),
        Some(&Type::Tuple(vec![INT64, INT64]))
    );
    assert!(!has_tiled_adverbs(&lowered));

    let values: Vec<i64> = (0..24).collect();
    let doubled: Vec<i64> = values.iter().map(|v| 2 * v).collect();
    for (outer_tile, inner_tile) in [(1, 1), (4, 3), (5, 2), (6, 6), (7, 10)] {
        let args = vec![
            Value::int_array(vec![6, 4], &values),
            Value::Tuple(vec![Value::int(outer_tile), Value::int(inner_tile)]),
        ];
        assert_eq!(
            run(&session, &lowered, args),
            Value::int_array(vec![6, 4], &doubled),
            "tile sizes ({}, {})",
            outer_tile,
            inner_tile
        );
    }
}

#[test]
fn array_accumulators_are_updated_in_place() {
    let mut session = Session::default();
    let identity = identity_fn(&mut session, INT_VECTOR);
    let add = prim_fn(&mut session, "add", Prim::Add, ScalarType::Int64);
    let add_rows = build_fn(
        &mut session,
        "add_rows",
        vec![INT_VECTOR, INT_VECTOR],
        |_, args| {
            Ok(Expr::new(
                ExprKind::Map {
                    func: Box::new(Expr::fn_ref(&add)),
                    args: args.to_vec(),
                    axis: 0,
                },
                INT_VECTOR,
            ))
        },
    );
    let column_sums = build_fn(&mut session, "column_sums", vec![INT_MATRIX], |_, args| {
        Ok(Expr::new(
            ExprKind::Reduce {
                func: Box::new(Expr::fn_ref(&identity)),
                combine: Box::new(Expr::fn_ref(&add_rows)),
                init: None,
                args: vec![args[0].clone()],
                axis: 0,
            },
            INT_VECTOR,
        ))
    });
    let f = build_fn(&mut session, "tiled_column_sums", vec![INT_MATRIX], |_, args| {
        Ok(Expr::new(
            ExprKind::TiledReduce {
                func: Box::new(Expr::fn_ref(&column_sums)),
                combine: Box::new(Expr::fn_ref(&add_rows)),
                init: Box::new(Expr::int64(0)),
                args: vec![args[0].clone()],
                axes: vec![0],
                tile: TilePolicy::Fixed,
            },
            INT_VECTOR,
        ))
    });

    let mut rng = rng();
    let values = random_ints(&mut rng, 15);
    let expected: Vec<i64> = (0..3)
        .map(|col| (0..5).map(|row| values[row * 3 + col]).sum())
        .collect();
    for tile in [1, 2, 5, 8] {
        let lowered = apply(&mut LowerTiledAdverbs::new(vec![tile]), &mut session, &f).unwrap();
        assert_eq!(
            run(&session, &lowered, vec![Value::int_array(vec![5, 3], &values)]),
            Value::int_array(vec![3], &expected),
            "tile size {}",
            tile
        );
    }
}

#[test]
fn full_pipeline_matches_the_interpreter() {
    let mut session = Session::new(PassOptions {
        unroll_factor: 2,
        fixed_tile_sizes: vec![3],
        ..PassOptions::default()
    });
    let f = tiled_double(&mut session, TilePolicy::Fixed);
    let lowered = crate::lower(&mut session, &f).unwrap();
    assert!(!has_tiled_adverbs(&lowered));
    assert!(!block_any_expr(&lowered.body, &mut |e| matches!(
        e.kind,
        ExprKind::Map { .. }
    )));

    let mut rng = rng();
    for len in [1, 3, 8, 17] {
        let values = random_ints(&mut rng, len);
        let args = vec![Value::int_array(vec![len as i64], &values)];
        assert_eq!(
            run(&session, &lowered, args.clone()),
            run(&session, &f, args),
            "length {}",
            len
        );
    }
}

#[test]
fn tiled_reduce_keeps_the_order_of_a_non_associative_fold() {
    let mut session = Session::default();
    let f = tiled_fold(&mut session, TilePolicy::Fixed, Prim::Sub, 100);
    let args = vec![Value::int_array(vec![4], &[1, 2, 3, 4])];
    let expected = run(&session, &f, args.clone());
    assert_eq!(expected, Value::int(100 - 1 - 2 - 3 - 4));

    let lowered = apply(&mut LowerTiledAdverbs::new(vec![1]), &mut session, &f).unwrap();
    assert!(!has_tiled_adverbs(&lowered));
    assert_eq!(run(&session, &lowered, args), expected);
}

#[test]
fn tiled_functions_behind_a_call_are_lowered() {
    let mut session = Session::new(PassOptions {
        fixed_tile_sizes: vec![3],
        ..PassOptions::default()
    });
    let tiled = tiled_double(&mut session, TilePolicy::Fixed);
    let f = caller(&mut session, &tiled);
    assert!(reaches_tiled(&session, &f).unwrap());

    let lowered = crate::lower(&mut session, &f).unwrap();
    assert!(!reaches_tiled(&session, &lowered).unwrap());

    let mut rng = rng();
    for len in [1, 4, 10] {
        let values = random_ints(&mut rng, len);
        let args = vec![Value::int_array(vec![len as i64], &values)];
        assert_eq!(
            run(&session, &lowered, args.clone()),
            run(&session, &f, args),
            "length {}",
            len
        );
    }
}

#[test]
fn dynamic_tiles_behind_a_call_reach_the_caller() {
    let mut session = Session::default();
    let tiled = tiled_sum(&mut session, TilePolicy::Dynamic);
    let f = caller(&mut session, &tiled);
    assert_eq!(num_dynamic_tiles(&session, &f).unwrap(), 1);

    let lowered = apply(&mut LowerTiledAdverbs::new(Vec::new()), &mut session, &f).unwrap();
    assert_eq!(lowered.input_types.last(), Some(&Type::Tuple(vec![INT64])));
    assert!(!reaches_tiled(&session, &lowered).unwrap());

    let values: Vec<i64> = (1..=9).collect();
    for tile in [1, 4, 9] {
        let args = vec![
            Value::int_array(vec![9], &values),
            Value::Tuple(vec![Value::int(tile)]),
        ];
        assert_eq!(run(&session, &lowered, args), Value::int(45), "tile size {}", tile);
    }
}

#[test]
fn tiled_functions_mapped_over_rows_are_lowered() {
    let mut session = Session::default();
    let tiled = tiled_double(&mut session, TilePolicy::Fixed);
    let f = map_rows(&mut session, &tiled);

    let lowered = apply(&mut LowerTiledAdverbs::new(vec![2]), &mut session, &f).unwrap();
    assert!(!reaches_tiled(&session, &lowered).unwrap());

    let values: Vec<i64> = (0..15).collect();
    let doubled: Vec<i64> = values.iter().map(|v| 2 * v).collect();
    assert_eq!(
        run(&session, &lowered, vec![Value::int_array(vec![5, 3], &values)]),
        Value::int_array(vec![5, 3], &doubled)
    );
}

#[test]
fn dynamic_tiles_in_a_mapped_function_are_rejected() {
    let mut session = Session::default();
    let tiled = tiled_double(&mut session, TilePolicy::Dynamic);
    let f = map_rows(&mut session, &tiled);
    let count = session.num_functions();
    assert!(matches!(
        apply(&mut LowerTiledAdverbs::new(Vec::new()), &mut session, &f),
        Err(Error::DynamicTilesInCallable(_))
    ));
    assert_eq!(session.num_functions(), count);
}
