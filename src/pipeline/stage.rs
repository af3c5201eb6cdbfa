//! Stage abstraction for the pipeline.
//!
//! Two traits cover every external collaborator:
//! - **`Origin`**: the root of a chain. Produces items until it reports
//!   end-of-stream by returning `Ok(None)`.
//! - **`Stage`**: consumes one item at a time and emits zero, one or many
//!   items into an [`Emitter`].
//!
//! Stages are attached to each other only during assembly (see
//! [`crate::pipeline::PipelineBuilder`] and [`crate::pipeline::Segment::then`]),
//! and are afterwards owned by exactly one segment thread.

use crate::error::PipelineResult;

/// Whether a stage wants more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    /// The stage has seen enough; the segment stops pulling and drains.
    Stop,
}

/// Output buffer handed to [`Stage::process`] and [`Stage::finish`].
#[derive(Debug)]
pub struct Emitter<T> {
    items: Vec<T>,
}

impl<T> Emitter<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Send an item downstream.
    pub fn emit(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for Emitter<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.items.extend(iter);
    }
}

/// The ultimate data origin of a chain.
pub trait Origin<T>: Send {
    /// Human-readable name of this origin.
    fn name(&self) -> &str;

    /// One-time setup before any thread starts. An error aborts assembly.
    fn prepare(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// Produce the next item; `Ok(None)` is end-of-stream.
    fn produce(&mut self) -> PipelineResult<Option<T>>;
}

/// A processing stage with exactly one upstream.
pub trait Stage<T>: Send {
    /// Human-readable name of this stage.
    fn name(&self) -> &str;

    /// One-time setup before any thread starts. An error aborts assembly.
    fn prepare(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// Process one input item.
    fn process(&mut self, item: T, out: &mut Emitter<T>) -> PipelineResult<Flow>;

    /// Called once at end-of-stream to flush buffered output.
    fn finish(&mut self, _out: &mut Emitter<T>) -> PipelineResult<()> {
        Ok(())
    }
}

impl<T, S: Stage<T> + ?Sized> Stage<T> for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        (**self).prepare()
    }

    fn process(&mut self, item: T, out: &mut Emitter<T>) -> PipelineResult<Flow> {
        (**self).process(item, out)
    }

    fn finish(&mut self, out: &mut Emitter<T>) -> PipelineResult<()> {
        (**self).finish(out)
    }
}

impl<T, O: Origin<T> + ?Sized> Origin<T> for Box<O> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn prepare(&mut self) -> PipelineResult<()> {
        (**self).prepare()
    }

    fn produce(&mut self) -> PipelineResult<Option<T>> {
        (**self).produce()
    }
}
