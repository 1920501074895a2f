mod densemap;
pub mod eval;
pub mod graph;
pub mod hash;
pub mod id;
pub mod process;
pub mod progress;
mod smallmap;
pub mod store;
pub mod task;
pub mod work;

pub use smallmap::SmallMap;
