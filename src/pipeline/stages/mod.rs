//! Built-in origins and stages.
//!
//! Small generic building blocks for wiring chains without writing a trait
//! impl for every step. Domain stages (decoders, renderers, encoders) are
//! expected to implement [`Stage`](crate::pipeline::Stage) directly.

pub mod collect;
pub mod filter;
pub mod iter_origin;
pub mod map;

pub use collect::{CollectStage, Collected, CountStage};
pub use filter::FilterStage;
pub use iter_origin::IterOrigin;
pub use map::MapStage;
