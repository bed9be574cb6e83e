mod adverbs;
mod loop_unrolling;
mod tiling;

use crate::builder::Builder;
use crate::error::Error;
use crate::interpreter::{self, Value};
use crate::session::Session;
use quiver_common::data::prims::Prim;
use quiver_common::data::typed_ir::{Expr, Stmt, TypeEnv, TypedFn};
use quiver_common::data::types::{FuncName, ScalarType, Type};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::rc::Rc;

/// Registers a function whose body is whatever `body` emits, returning the value it produces.
pub fn build_fn(
    session: &mut Session,
    name: &str,
    arg_types: Vec<Type>,
    body: impl FnOnce(&mut Builder<'_>, &[Expr]) -> Result<Expr, Error>,
) -> Rc<TypedFn> {
    let mut b = Builder::new(session, TypeEnv::new());
    let args: Vec<Expr> = arg_types
        .iter()
        .map(|t| b.fresh_var(t.clone(), "arg"))
        .collect();
    let result = body(&mut b, &args).expect("test function body should build");
    let result = if result.as_var().is_some() || result.is_const() {
        result
    } else {
        b.assign_temp(result, "result")
    };
    b.insert_stmt(Stmt::Return(result.clone()));
    let (body, type_env) = b.into_parts();

    let name = FuncName(session.fresh(name));
    session
        .register(TypedFn {
            name,
            arg_names: args.iter().filter_map(|a| a.as_var().cloned()).collect(),
            input_types: arg_types,
            return_type: result.type_,
            type_env,
            body,
        })
        .expect("test function names are fresh")
}

/// `fn(x: elt, y: elt) -> prim(x, y)`
pub fn prim_fn(session: &mut Session, name: &str, prim: Prim, elt: ScalarType) -> Rc<TypedFn> {
    build_fn(
        session,
        name,
        vec![Type::Scalar(elt); 2],
        |b, args| b.prim(prim, args, "r"),
    )
}

/// `fn(x: t) -> x`
pub fn identity_fn(session: &mut Session, t: Type) -> Rc<TypedFn> {
    build_fn(session, "identity", vec![t], |_, args| Ok(args[0].clone()))
}

pub fn run(session: &Session, func: &TypedFn, args: Vec<Value>) -> Value {
    interpreter::run(session, &func.name, args).expect("interpretation should succeed")
}

pub fn rng() -> Pcg64 {
    Pcg64::seed_from_u64(0x5eed_0f_7e57)
}

pub fn random_ints(rng: &mut Pcg64, len: usize) -> Vec<i64> {
    (0..len).map(|_| rng.random_range(-100..100)).collect()
}
