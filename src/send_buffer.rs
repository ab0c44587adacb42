//! Upload frame sizing shared between a coordinator and its streams.
//!
//! Frames grow through three tiers as throughput ramps up, trading per-frame
//! overhead against how quickly the transport's flow control reacts. The
//! coordinator owns the tier and is the only writer; each stream holds a
//! clone of the handle and reads the tier once per send.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Per-stream rate (MB/s) above which frames grow to at least [`BufferTier::Medium`].
pub const MEDIUM_TIER_THRESHOLD: f64 = 0.05;

/// Per-stream rate (MB/s) above which frames grow to [`BufferTier::Large`].
pub const LARGE_TIER_THRESHOLD: f64 = 0.5;

/// Discrete upload frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferTier {
    Small,
    Medium,
    Large,
}

impl BufferTier {
    /// Frame size in bytes.
    pub const fn size(self) -> usize {
        match self {
            BufferTier::Small => 1_000,
            BufferTier::Medium => 10_000,
            BufferTier::Large => 100_000,
        }
    }

    /// Tier suggested by a per-stream rate in MB/s, without history.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::send_buffer::BufferTier;
    ///
    /// assert_eq!(BufferTier::for_rate(0.01), BufferTier::Small);
    /// assert_eq!(BufferTier::for_rate(0.0625), BufferTier::Medium);
    /// assert_eq!(BufferTier::for_rate(0.625), BufferTier::Large);
    /// ```
    pub fn for_rate(per_stream_mbps: f64) -> Self {
        if per_stream_mbps > LARGE_TIER_THRESHOLD {
            BufferTier::Large
        } else if per_stream_mbps > MEDIUM_TIER_THRESHOLD {
            BufferTier::Medium
        } else {
            BufferTier::Small
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => BufferTier::Small,
            1 => BufferTier::Medium,
            _ => BufferTier::Large,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BufferTier::Small => 0,
            BufferTier::Medium => 1,
            BufferTier::Large => 2,
        }
    }
}

/// Shared handle to the current upload tier.
///
/// Cloning yields another handle to the same tier.
#[derive(Debug, Clone)]
pub struct SendBuffer {
    tier: Arc<AtomicU8>,
}

impl SendBuffer {
    /// Creates a handle starting at the smallest tier.
    pub fn new() -> Self {
        Self {
            tier: Arc::new(AtomicU8::new(BufferTier::Small.as_u8())),
        }
    }

    pub fn tier(&self) -> BufferTier {
        BufferTier::from_u8(self.tier.load(Ordering::Relaxed))
    }

    /// Current frame size in bytes.
    pub fn size(&self) -> usize {
        self.tier().size()
    }

    /// A zeroed frame of the current size.
    pub fn payload(&self) -> Vec<u8> {
        vec![0u8; self.size()]
    }

    /// Drops back to the smallest tier for a new run.
    pub(crate) fn reset(&self) {
        self.tier.store(BufferTier::Small.as_u8(), Ordering::Relaxed);
    }

    /// Re-evaluates the tier from a per-stream rate in MB/s.
    ///
    /// The tier only ever grows. Returns the new tier when it changed.
    pub(crate) fn adapt(&self, per_stream_mbps: f64) -> Option<BufferTier> {
        let current = self.tier();
        let next = current.max(BufferTier::for_rate(per_stream_mbps));
        if next == current {
            return None;
        }
        self.tier.store(next.as_u8(), Ordering::Relaxed);
        Some(next)
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}
