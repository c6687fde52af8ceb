//! # rwkv-engine
//!
//! The "narrow waist" of the rwkv stack. Defines the core contracts that all
//! other crates depend on: token and model-info types, the recurrent state
//! buffer, the [`ModelRuntime`] forward-pass trait, and the [`Tokenizer`]
//! adapter trait. Implementations can swap compute backends (wasm/WebGPU,
//! CPU, a worker process) without changing pipeline code.
//!
//! ## Design Notes
//!
//! ### Shared Access
//! `ModelRuntime` methods take `&self`; the state they advance is passed in
//! explicitly as a [`RecurrentState`], so a single runtime can serve
//! successive generations without interior mutability of its own. Backends
//! that do hold device buffers internally are responsible for thread-safe
//! access.
//!
//! ### Token Type
//! `TokenId` is aliased as `u16`: the RWKV world vocabulary has 65536
//! entries and token batches cross the compute boundary as dense `u16`
//! slices.

pub type Result<T> = std::result::Result<T, RwkvError>;

/// Token ID type — an index into the model vocabulary.
pub type TokenId = u16;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum RwkvError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("vocabulary not loaded")]
    VocabNotLoaded,
    #[error("forward pass failed: {0}")]
    Forward(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("state length mismatch: expected {expected}, got {got}")]
    StateLenMismatch { expected: usize, got: usize },
}

/// Static description of a loaded model, queried once at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Vocabulary size — the length of every logits vector.
    pub num_vocab: usize,
    /// Number of residual layers.
    pub num_layer: usize,
    /// Embedding width.
    pub num_emb: usize,
    /// Total length of the flattened recurrent state vector.
    pub state_len: usize,
}

/// The model's full recurrent memory after consuming some token sequence.
///
/// A fixed-length `f32` vector. A state is only meaningful together with the
/// exact ordered token sequence that produced it, starting from the zero
/// state — states are not composable or interpolatable.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    data: Vec<f32>,
}

impl RecurrentState {
    /// A zero-initialized state — the model's memory before any token.
    pub fn zeroed(state_len: usize) -> Self {
        RecurrentState {
            data: vec![0.0; state_len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reset to the zero state in place, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.fill(0.0);
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Overwrite this state with the contents of `other`.
    ///
    /// # Errors
    /// `StateLenMismatch` if the two states belong to different models.
    pub fn copy_from(&mut self, other: &RecurrentState) -> Result<()> {
        if self.data.len() != other.data.len() {
            return Err(RwkvError::StateLenMismatch {
                expected: self.data.len(),
                got: other.data.len(),
            });
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }
}

/// The opaque forward-pass primitive.
///
/// Both operations advance `state` in place past the consumed tokens and
/// return the output logits (length `num_vocab`) for the final position.
/// Implementations must be deterministic given identical inputs — the
/// prefix cache and the resume law depend on it.
pub trait ModelRuntime: Send + Sync {
    /// Metadata for the loaded model.
    fn info(&self) -> ModelInfo;

    /// Batched prefill: consume `tokens` (non-empty) in order.
    fn run_prefill(&self, tokens: &[TokenId], state: &mut RecurrentState) -> Result<Vec<f32>>;

    /// Single-token decode step, the steady-state operation of the
    /// generation loop.
    fn run_step(&self, token: TokenId, state: &mut RecurrentState) -> Result<Vec<f32>> {
        self.run_prefill(&[token], state)
    }
}

/// Text <-> token adapter over a fixed vocabulary.
///
/// Must be deterministic and round-trip-stable for valid vocabulary
/// sequences. `decode` returns raw bytes: a single token may hold a partial
/// UTF-8 sequence, so text conversion is the caller's concern.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> Result<Vec<u8>>;
}
