//! MapStage: one item in, one item out.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::stage::{Emitter, Flow, Stage};

/// Applies a fallible function to every item.
///
/// An `Err(message)` from the function fails the stage with
/// [`PipelineError::Stage`].
pub struct MapStage<F> {
    name: String,
    func: F,
}

impl<F> MapStage<F> {
    pub fn new<T>(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut(T) -> Result<T, String> + Send,
    {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<T, F> Stage<T> for MapStage<F>
where
    F: FnMut(T) -> Result<T, String> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, out: &mut Emitter<T>) -> PipelineResult<Flow> {
        let mapped = (self.func)(item).map_err(|message| PipelineError::stage(&self.name, message))?;
        out.emit(mapped);
        Ok(Flow::Continue)
    }
}
