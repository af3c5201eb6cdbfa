//! IterOrigin: turns any iterator into the root of a chain.

use crate::error::PipelineResult;
use crate::pipeline::stage::Origin;

/// Origin that yields the items of an iterator, then end-of-stream.
pub struct IterOrigin<I> {
    name: String,
    iter: I,
}

impl<I> IterOrigin<I> {
    pub fn new(name: impl Into<String>, iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            name: name.into(),
            iter: iter.into_iter(),
        }
    }
}

impl<T, I> Origin<T> for IterOrigin<I>
where
    I: Iterator<Item = T> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&mut self) -> PipelineResult<Option<T>> {
        Ok(self.iter.next())
    }
}
