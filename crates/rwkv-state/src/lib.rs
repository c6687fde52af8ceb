//! # rwkv-state
//!
//! Single-slot prefix cache for recurrent-state inference.
//!
//! An RNN-style model carries its entire memory of a token sequence in one
//! fixed-size state vector, so a generation call whose prompt extends the
//! previous call's token history can skip straight past the shared prefix
//! instead of recomputing it. This crate stores one `(tokens, state, logits)`
//! checkpoint per model session and answers "how much of this request is
//! already paid for".
//!
//! A single slot (rather than a multi-entry map) is sufficient: within one
//! chat session, successive calls are prefix-extensions of the previous call
//! (a new user message appended, or a regeneration from the same point).
//!
//! # Invariants
//! - `CacheEntry::state` is the exact state after consuming
//!   `CacheEntry::tokens` in order from the zero state, and
//!   `CacheEntry::logits` is the model output at that position.
//! - [`StateCache::checkout`] never hands out a state that does not
//!   correspond to the prefix it reports as reused.

use rwkv_engine::{RecurrentState, TokenId};

/// One cached checkpoint: a token history, the state after it, and the
/// output logits at that position.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub tokens: Vec<TokenId>,
    pub state: RecurrentState,
    pub logits: Vec<f32>,
}

/// Result of a cache probe for a generation request.
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Number of leading request tokens whose effect is already captured in
    /// `state`. Zero means start from scratch.
    pub reused: usize,
    /// Working state for the request: a copy of the cached state when
    /// `reused > 0`, otherwise a fresh zero state.
    pub state: RecurrentState,
    /// The cached output logits, present only on a full hit (`reused ==
    /// request length`) — the caller can skip the forward pass entirely and
    /// sample from these directly.
    pub logits: Option<Vec<f32>>,
}

/// Single-slot prefix cache for one model session.
///
/// Created when a model is loaded; dropped (or [`clear`](StateCache::clear)ed)
/// when it is unloaded. Never shared across models — a state vector is
/// meaningless under different weights.
#[derive(Debug)]
pub struct StateCache {
    state_len: usize,
    entry: Option<CacheEntry>,
}

impl StateCache {
    /// Create an empty cache for a model whose flattened state has
    /// `state_len` elements.
    pub fn new(state_len: usize) -> Self {
        StateCache {
            state_len,
            entry: None,
        }
    }

    pub fn state_len(&self) -> usize {
        self.state_len
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// The current checkpoint, if any.
    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    /// Length of the longest common prefix between `tokens` and the cached
    /// history. A pure probe — this says nothing about whether the cached
    /// state is reusable for that prefix.
    pub fn prefix_len(&self, tokens: &[TokenId]) -> usize {
        match &self.entry {
            None => 0,
            Some(entry) => entry
                .tokens
                .iter()
                .zip(tokens.iter())
                .take_while(|(a, b)| a == b)
                .count(),
        }
    }

    /// Probe the cache for `tokens` and check out a working state.
    ///
    /// The cached state corresponds to the *entire* cached history, so it is
    /// only reusable when that whole history is a prefix of the request.
    /// A partial overlap (the request diverges from, or stops short of, the
    /// cached history) yields a zero state and `reused == 0` — there is no
    /// stored state for the shared prefix alone.
    ///
    /// Read-only: the slot is untouched and the returned state is a copy.
    pub fn checkout(&self, tokens: &[TokenId]) -> Checkout {
        let matched = self.prefix_len(tokens);
        match &self.entry {
            Some(entry) if matched > 0 && matched == entry.tokens.len() => Checkout {
                reused: matched,
                state: entry.state.clone(),
                logits: (matched == tokens.len()).then(|| entry.logits.clone()),
            },
            _ => Checkout {
                reused: 0,
                state: RecurrentState::zeroed(self.state_len),
                logits: None,
            },
        }
    }

    /// Replace the slot with a new checkpoint. Called once at the end of
    /// every generation call with the full token history (prompt plus all
    /// generated tokens) and the state immediately after the last consumed
    /// token. Cannot fail; a pure in-memory overwrite.
    pub fn checkin(&mut self, tokens: Vec<TokenId>, state: RecurrentState, logits: Vec<f32>) {
        self.entry = Some(CacheEntry {
            tokens,
            state,
            logits,
        });
    }

    /// Drop the checkpoint (model unload, explicit session reset).
    pub fn clear(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_LEN: usize = 4;

    fn state_of(fill: f32) -> RecurrentState {
        let mut state = RecurrentState::zeroed(STATE_LEN);
        state.as_mut_slice().fill(fill);
        state
    }

    #[test]
    fn empty_cache_checks_out_zero_state() {
        let cache = StateCache::new(STATE_LEN);
        let out = cache.checkout(&[1, 2, 3]);

        assert_eq!(out.reused, 0);
        assert_eq!(out.state, RecurrentState::zeroed(STATE_LEN));
        assert!(out.logits.is_none());
        assert_eq!(cache.prefix_len(&[1, 2, 3]), 0);
    }

    #[test]
    fn extension_reuses_full_cached_history() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3], state_of(1.0), vec![0.5; 8]);

        let out = cache.checkout(&[1, 2, 3, 4, 5]);
        assert_eq!(out.reused, 3);
        assert_eq!(out.state, state_of(1.0));
        // Not a full hit: the request continues past the checkpoint.
        assert!(out.logits.is_none());
    }

    #[test]
    fn full_hit_returns_cached_logits() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3], state_of(2.0), vec![0.25; 8]);

        let out = cache.checkout(&[1, 2, 3]);
        assert_eq!(out.reused, 3);
        assert_eq!(out.logits.as_deref(), Some(&[0.25; 8][..]));
    }

    #[test]
    fn prefix_len_reports_raw_overlap() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3, 4], state_of(1.0), vec![]);

        assert_eq!(cache.prefix_len(&[1, 2, 9, 9]), 2);
        assert_eq!(cache.prefix_len(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(cache.prefix_len(&[9]), 0);
    }

    #[test]
    fn divergent_request_gets_no_state() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3, 4], state_of(3.0), vec![]);

        // Shares [1, 2] but the cached state has consumed [1, 2, 3, 4];
        // there is no state for the shared prefix alone.
        let out = cache.checkout(&[1, 2, 9, 9]);
        assert_eq!(out.reused, 0);
        assert_eq!(out.state, RecurrentState::zeroed(STATE_LEN));
        assert!(out.logits.is_none());
    }

    #[test]
    fn truncated_request_gets_no_state() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3, 4], state_of(3.0), vec![]);

        // The request is a strict prefix of the cached history: the cached
        // state is too far advanced to represent it.
        let out = cache.checkout(&[1, 2]);
        assert_eq!(out.reused, 0);
        assert_eq!(out.state, RecurrentState::zeroed(STATE_LEN));
    }

    #[test]
    fn first_token_mismatch_is_a_miss() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2], state_of(1.0), vec![]);

        let out = cache.checkout(&[7, 2]);
        assert_eq!(out.reused, 0);
    }

    #[test]
    fn checkin_overwrites_single_slot() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2, 3], state_of(1.0), vec![]);
        cache.checkin(vec![7, 8], state_of(2.0), vec![]);

        // No match against the first entry's tokens survives.
        assert_eq!(cache.checkout(&[1, 2, 3]).reused, 0);

        let out = cache.checkout(&[7, 8, 9]);
        assert_eq!(out.reused, 2);
        assert_eq!(out.state, state_of(2.0));
    }

    #[test]
    fn checkout_is_read_only() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1, 2], state_of(1.0), vec![0.1; 4]);

        let mut out = cache.checkout(&[1, 2]);
        out.state.as_mut_slice().fill(99.0);

        // Mutating the checked-out copy must not touch the slot.
        assert_eq!(cache.entry().unwrap().state, state_of(1.0));
        assert_eq!(cache.checkout(&[1, 2]).state, state_of(1.0));
    }

    #[test]
    fn clear_empties_the_slot() {
        let mut cache = StateCache::new(STATE_LEN);
        cache.checkin(vec![1], state_of(1.0), vec![]);
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.checkout(&[1]).reused, 0);
    }
}
