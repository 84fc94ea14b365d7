// src/candidates.rs
//
// Peer candidates that arrive ahead of the remote description wait here
// and are drained, in arrival order, the moment it is applied.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;

use serde_json::Value;

/// Queue of remote negotiation candidates that arrived before the remote
/// description was applied.
///
/// Append-only until the one-shot flush; after that, `enqueue` hands the
/// candidate straight back so the caller applies it immediately.  Candidates
/// are never re-ordered or deduplicated.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<Value>,
    flushed: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `candidate`, or return it if the buffer has already been
    /// flushed and the candidate must be applied right away.
    pub fn enqueue(&mut self, candidate: Value) -> Option<Value> {
        if self.flushed {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Drain every buffered candidate through `apply` in arrival order.
    ///
    /// Only the first call does anything; it returns how many candidates
    /// were handed to `apply`.  Later calls return 0.
    pub fn flush<F>(&mut self, mut apply: F) -> usize
    where
        F: FnMut(Value),
    {
        if self.flushed {
            return 0;
        }
        self.flushed = true;

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            apply(candidate);
            applied += 1;
        }
        applied
    }

    /// Convenience wrapper over `flush` for async callers.
    pub fn drain_once(&mut self) -> Vec<Value> {
        let mut drained = Vec::with_capacity(self.pending.len());
        self.flush(|c| drained.push(c));
        drained
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop whatever is still queued.  Used when the owning link closes.
    pub fn release(&mut self) {
        self.pending.clear();
    }
}
