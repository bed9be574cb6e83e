pub mod typed_ir;
