//! Identity types for the pipeline system.
//!
//! IDs are newtypes over `u32` handed out in assembly order, so a segment's
//! ID is also its position in `Pipeline::segments`.

use serde::Serialize;
use std::fmt;

/// Index of a segment within an assembled pipeline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub const INVALID: SegmentId = SegmentId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "SegmentId(INVALID)")
        } else {
            write!(f, "SegmentId({})", self.0)
        }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies a channel (one Sink/Source pair) for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
