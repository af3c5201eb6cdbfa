//! # stagepipe: segmented pipeline engine
//!
//! Runs a linear chain of processing stages as a set of concurrently executing
//! segments. Segments are connected by bounded Sink/Source channels, the root
//! segment is driven at a governed (optionally adaptive) rate, and a blocking
//! invoker starts every segment and returns once the whole chain has drained.
//!
//! ## Architecture
//!
//! - **Pipeline**: channels, rate governor, segments, invoker and assembly
//! - **Config**: serde-backed run configuration (TOML or JSON)
//! - **Workload**: a synthetic frame chain for the binary and benches
//!
//! ## Example
//!
//! ```ignore
//! use stagepipe::pipeline::{CutPoints, PipelineBuilder, RatePolicy};
//! use stagepipe::pipeline::stages::{CollectStage, IterOrigin, MapStage};
//!
//! let (collect, collected) = CollectStage::new("collect");
//! let pipeline = PipelineBuilder::new(IterOrigin::new("numbers", 0..100u32))
//!     .stage(MapStage::new("double", |x: u32| Ok(x * 2)))
//!     .stage(collect)
//!     .assemble(CutPoints::EveryStage)?;
//!
//! let report = pipeline.run(RatePolicy::dynamic(500.0))?;
//! assert!(!report.failed);
//! assert_eq!(collected.len(), 100);
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod workload;

// Re-export commonly used types
pub use config::{AssemblyMode, PipelineConfig};
pub use error::{PipelineError, PipelineResult, ResultExt};
pub use pipeline::{
    CutPoints, Invoker, Monitor, Pipeline, PipelineBuilder, RatePolicy, RunReport, Segment,
};
