pub mod prims;
pub mod typed_ir;
pub mod types;
