use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod common;
pub mod dataset;
pub mod encoder;
pub mod model;
pub mod table_encoder;
pub mod training;
