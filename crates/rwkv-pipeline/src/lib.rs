//! # rwkv-pipeline
//!
//! The stateful token-generation pipeline for an RWKV-style recurrent
//! model, and the session coordinator that serializes access to it.
//!
//! One generation call runs: prompt formatting and tokenization, prefix
//! cache checkout, batched prefill over the tokens the cache did not cover,
//! then the autoregressive loop — transform/softmax/sample, stream the
//! token, check stop conditions, single-token decode step — and finally a
//! state check-in so the next call can resume where this one left off.
//!
//! The pipeline surface is pull-based: [`Pipeline::generate`] returns a
//! [`TokenStream`] iterator and no token is computed until the consumer
//! asks for it. [`RwkvSession`] wraps the pipeline in a dedicated inference
//! thread (one generation at a time, callers queue first-come-first-served)
//! and streams `{token, text}` events back, with cooperative token-granular
//! cancellation.

pub mod pipeline;
pub mod prompt;
pub mod request;
pub mod session;

pub use pipeline::{Emission, FinishReason, GenerationStats, Pipeline, TokenStream};
pub use prompt::{clean_prompt, format_prompt, PromptSegment};
pub use request::{GenerateRequest, DEFAULT_STOP_TOKENS, DEFAULT_STOP_WORDS};
pub use session::{PipelineHandle, RwkvSession, SessionCommand, SessionEvent};
