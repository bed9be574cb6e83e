pub mod adverb_semantics;
pub mod builder;
pub mod error;
pub mod inline;
pub mod interpreter;
pub mod loop_unrolling;
pub mod lower_adverbs;
pub mod lower_tiled_adverbs;
pub mod rename;
pub mod session;
pub mod shape_infer;
pub mod transform;
pub mod verify;

#[cfg(test)]
mod test;

pub use error::Error;
pub use session::Session;

use loop_unrolling::LoopUnrolling;
use lower_adverbs::LowerAdverbs;
use lower_tiled_adverbs::LowerTiledAdverbs;
use quiver_common::data::typed_ir::TypedFn;
use std::rc::Rc;
use tracing::info;

/// Lowers `func` to explicit loops: tiled adverbs first, then the remaining adverbs, then loop
/// unrolling, each configured from the session's options.
pub fn lower(session: &mut Session, func: &Rc<TypedFn>) -> Result<Rc<TypedFn>, Error> {
    let options = session.options.clone();
    let mut tiled = LowerTiledAdverbs::from_options(&options);
    let mut adverbs = LowerAdverbs;
    let mut unrolling = LoopUnrolling::from_options(&options)?;
    let lowered = transform::apply_pipeline(
        session,
        func,
        &mut [&mut tiled, &mut adverbs, &mut unrolling],
    )?;
    info!(source = %func.name, result = %lowered.name, "lowered");
    Ok(lowered)
}
