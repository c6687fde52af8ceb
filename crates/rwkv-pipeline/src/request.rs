//! Generation request parameters.

use rwkv_engine::{Result, RwkvError, TokenId};
use rwkv_sampling::SamplerConfig;
use serde::Deserialize;

use crate::prompt::{format_prompt, PromptSegment};

/// Token 0 terminates generation for RWKV world models.
pub const DEFAULT_STOP_TOKENS: &[TokenId] = &[0];

/// The model starting a new `User:` turn means the reply is over.
pub const DEFAULT_STOP_WORDS: &[&str] = &["\n\nUser"];

fn default_max_tokens() -> usize {
    2048
}

fn default_stop_tokens() -> Vec<TokenId> {
    DEFAULT_STOP_TOKENS.to_vec()
}

fn default_stop_words() -> Vec<String> {
    DEFAULT_STOP_WORDS.iter().map(|w| w.to_string()).collect()
}

fn default_seed() -> u64 {
    42
}

/// Parameters for one generation call. Immutable for its duration.
///
/// Exactly one of `prompt` (pre-formatted text) or `messages` (structured
/// segments, flattened by [`format_prompt`]) must be supplied.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub messages: Option<Vec<PromptSegment>>,

    /// Upper bound on generated tokens for this call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Tokens that terminate generation. The stop token itself is still
    /// emitted before the stream ends.
    #[serde(default = "default_stop_tokens")]
    pub stop_tokens: Vec<TokenId>,

    /// Substrings of the decoded output that terminate generation.
    #[serde(default = "default_stop_words")]
    pub stop_words: Vec<String>,

    #[serde(default)]
    pub sampler: SamplerConfig,

    /// RNG seed for the sampler; a fixed seed reproduces the token stream.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl GenerateRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        GenerateRequest {
            prompt: Some(prompt.into()),
            messages: None,
            max_tokens: default_max_tokens(),
            stop_tokens: default_stop_tokens(),
            stop_words: default_stop_words(),
            sampler: SamplerConfig::default(),
            seed: default_seed(),
        }
    }

    pub fn from_messages(messages: Vec<PromptSegment>) -> Self {
        let mut request = GenerateRequest::from_prompt(String::new());
        request.prompt = None;
        request.messages = Some(messages);
        request
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop_tokens(mut self, stop_tokens: Vec<TokenId>) -> Self {
        self.stop_tokens = stop_tokens;
        self
    }

    pub fn with_stop_words(mut self, stop_words: Vec<String>) -> Self {
        self.stop_words = stop_words;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The prompt text this request asks the model to continue.
    ///
    /// # Errors
    /// `MalformedRequest` if both or neither of `prompt`/`messages` are
    /// supplied.
    pub fn resolve_prompt(&self) -> Result<String> {
        match (&self.prompt, &self.messages) {
            (Some(_), Some(_)) => Err(RwkvError::MalformedRequest(
                "both prompt and messages supplied".into(),
            )),
            (None, None) => Err(RwkvError::MalformedRequest(
                "neither prompt nor messages supplied".into(),
            )),
            (Some(prompt), None) => Ok(prompt.clone()),
            (None, Some(messages)) => Ok(format_prompt(messages)),
        }
    }
}
