//! FilterStage: drops items that fail a predicate.
//!
//! With `invert` set the predicate selects items to drop instead of items to
//! keep. An optional limit stops the chain after that many items have passed.

use crate::error::PipelineResult;
use crate::pipeline::stage::{Emitter, Flow, Stage};

pub struct FilterStage<P> {
    name: String,
    predicate: P,
    /// Drop matching items instead of keeping them.
    invert: bool,
    limit: Option<u64>,
    passed: u64,
    dropped: u64,
}

impl<P> FilterStage<P> {
    pub fn new(name: impl Into<String>, predicate: P) -> Self {
        Self {
            name: name.into(),
            predicate,
            invert: false,
            limit: None,
            passed: 0,
            dropped: 0,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Stop the chain once `limit` items have passed.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<T, P> Stage<T> for FilterStage<P>
where
    P: FnMut(&T) -> bool + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, item: T, out: &mut Emitter<T>) -> PipelineResult<Flow> {
        if self.limit.is_some_and(|limit| self.passed >= limit) {
            return Ok(Flow::Stop);
        }

        // Pass if: (matches AND !invert) OR (!matches AND invert)
        if (self.predicate)(&item) != self.invert {
            out.emit(item);
            self.passed += 1;
        } else {
            self.dropped += 1;
        }

        match self.limit {
            Some(limit) if self.passed >= limit => Ok(Flow::Stop),
            _ => Ok(Flow::Continue),
        }
    }
}
