//! The stateful generation pipeline.
//!
//! Orchestrates one generation call end to end:
//!
//! 1. Resolve and tokenize the prompt.
//! 2. Check out the prefix cache: tokens the previous call already pushed
//!    through the model are skipped, their effect recovered from the cached
//!    recurrent state.
//! 3. Batched prefill over the remaining prompt slice (skipped entirely on
//!    a full cache hit — sampling starts from the cached logits).
//! 4. The decode loop: penalty/temperature transform, softmax, nucleus
//!    draw, stream the token, stop checks, single-token decode step.
//! 5. Check the full token history and final state back into the cache so
//!    the next call resumes from here.
//!
//! The consumer drives the loop: [`Pipeline::generate`] returns a
//! [`TokenStream`] and no forward pass runs until `next()` is called.
//! Cancellation is a shared flag observed after every sampled token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rwkv_engine::{
    ModelInfo, ModelRuntime, RecurrentState, Result, RwkvError, TokenId, Tokenizer,
};
use rwkv_sampling::{softmax, NucleusSampler};
use rwkv_state::StateCache;
use uuid::Uuid;

use crate::request::GenerateRequest;

/// Why a generation stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was sampled. It is still emitted before the stream ends.
    Stop,
    /// The accumulated decoded output contains a stop word.
    StopWord,
    /// `max_tokens` were produced.
    Length,
    /// The caller cancelled the run.
    Abort,
}

/// One streamed token together with its decoded text.
///
/// `text` may contain U+FFFD when the token holds a partial UTF-8 sequence;
/// the byte-accurate transcript is the concatenation of the token decodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub token: TokenId,
    pub text: String,
}

/// Statistics from one completed (or aborted) generation run.
#[derive(Debug, Clone)]
pub struct GenerationStats {
    /// Unique id for this completion, surfaced to consumers per run.
    pub completion_id: String,

    /// Tokens in the resolved prompt.
    pub prompt_tokens: usize,

    /// Leading prompt tokens recovered from the prefix cache instead of
    /// being recomputed.
    pub reused_prefix: usize,

    /// Tokens produced by the sampler.
    pub generated_tokens: usize,

    /// Wall-clock time of the batched prefill in milliseconds.
    pub prefill_ms: f64,

    /// Wall-clock time of the decode loop in milliseconds.
    pub decode_ms: f64,

    /// Decode throughput.
    pub tokens_per_second: f64,

    pub finish: FinishReason,
}

/// The generation pipeline for one loaded model.
///
/// Owns the prefix cache and the cancellation flag. `generate` takes
/// `&mut self`, so at most one [`TokenStream`] can exist per pipeline —
/// the single-flight guarantee the cache and state buffer rely on.
pub struct Pipeline {
    runtime: Arc<dyn ModelRuntime>,
    info: ModelInfo,
    cache: StateCache,
    is_running: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        let info = runtime.info();
        let cache = StateCache::new(info.state_len);
        Pipeline {
            runtime,
            info,
            cache,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Shared cancellation flag; stored `false` to request an abort.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.is_running.clone()
    }

    /// Request a cooperative abort of the in-flight generation.
    pub fn cancel(&self) {
        self.is_running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Drop the cached checkpoint (conversation reset).
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Start one generation call.
    ///
    /// Tokenizes the prompt and probes the cache eagerly; all forward-pass
    /// work is deferred to the returned [`TokenStream`].
    ///
    /// # Errors
    /// - `MalformedRequest`: prompt/messages shape invalid, empty prompt,
    ///   or invalid sampler configuration — rejected before any mutation.
    /// - `Tokenizer`: the prompt cannot be encoded.
    pub fn generate<'a>(
        &'a mut self,
        tokenizer: Arc<dyn Tokenizer>,
        request: &GenerateRequest,
    ) -> Result<TokenStream<'a>> {
        let prompt = request.resolve_prompt()?;
        let sampler = NucleusSampler::new(request.sampler.clone())
            .map_err(|e| RwkvError::MalformedRequest(format!("sampler config: {e}")))?
            .with_seed(request.seed);

        let full = tokenizer.encode(&prompt)?;
        if full.is_empty() {
            return Err(RwkvError::MalformedRequest("empty prompt".into()));
        }

        let checkout = self.cache.checkout(&full);
        tracing::debug!(
            reused = checkout.reused,
            total = full.len(),
            "state cache checkout"
        );

        let history = full[..checkout.reused].to_vec();
        let pending = full[checkout.reused..].to_vec();
        let completion_id = format!("cmpl-{}", Uuid::new_v4());

        self.is_running.store(true, Ordering::Release);

        Ok(TokenStream {
            pipeline: self,
            tokenizer,
            sampler,
            state: checkout.state,
            logits: checkout.logits,
            history,
            pending,
            last_unexecuted: None,
            prompt_tokens: full.len(),
            reused: checkout.reused,
            produced: 0,
            max_tokens: request.max_tokens,
            stop_tokens: request.stop_tokens.clone(),
            stop_words: request.stop_words.clone(),
            decoded: Vec::new(),
            completion_id,
            started: Instant::now(),
            prefill_ms: 0.0,
            finish: None,
            stats: None,
            done: false,
            errored: false,
        })
    }
}

/// Lazy, cancellable stream of generated tokens.
///
/// Implements `Iterator`; each `next()` performs at most one forward-pass
/// dispatch. When the stream ends (stop condition, `max_tokens`, abort, or
/// early drop) the pipeline runs one trailing decode step over the final
/// emitted token and checks the full history into the prefix cache, so the
/// cached state always covers exactly the checked-in tokens. A forward-pass
/// failure skips the check-in and leaves the previous cache entry intact.
pub struct TokenStream<'a> {
    pipeline: &'a mut Pipeline,
    tokenizer: Arc<dyn Tokenizer>,
    sampler: NucleusSampler,

    /// Working recurrent state; covers exactly `history` minus
    /// `last_unexecuted`.
    state: RecurrentState,

    /// Logits at the current sampling position, when already available
    /// (after prefill, or straight from the cache on a full hit).
    logits: Option<Vec<f32>>,

    /// All tokens of this call, prompt and generated, in order.
    history: Vec<TokenId>,

    /// Prompt tokens not yet pushed through the model.
    pending: Vec<TokenId>,

    /// The most recent sampled token, emitted but not yet executed.
    last_unexecuted: Option<TokenId>,

    prompt_tokens: usize,
    reused: usize,
    produced: usize,
    max_tokens: usize,
    stop_tokens: Vec<TokenId>,
    stop_words: Vec<String>,

    /// Bytes decoded since the start of this call, scanned for stop words.
    decoded: Vec<u8>,

    completion_id: String,
    started: Instant,
    prefill_ms: f64,

    finish: Option<FinishReason>,
    stats: Option<GenerationStats>,
    done: bool,
    errored: bool,
}

impl TokenStream<'_> {
    pub fn completion_id(&self) -> &str {
        &self.completion_id
    }

    /// Prompt tokens recovered from the cache for this call.
    pub fn reused_prefix(&self) -> usize {
        self.reused
    }

    /// Why the stream ended; `None` while still running or after an error.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        if self.done && !self.errored {
            self.finish
        } else {
            None
        }
    }

    /// Final statistics, available once the stream has completed.
    pub fn stats(&self) -> Option<&GenerationStats> {
        self.stats.as_ref()
    }

    /// Logits for the current sampling position, running the model as
    /// needed: batched prefill the first time, a single decode step for the
    /// previously emitted token afterwards.
    fn advance(&mut self) -> Result<Vec<f32>> {
        if let Some(logits) = self.logits.take() {
            return Ok(logits);
        }

        if !self.pending.is_empty() {
            let prefill_started = Instant::now();
            let pending = std::mem::take(&mut self.pending);
            let logits = self.pipeline.runtime.run_prefill(&pending, &mut self.state)?;
            self.history.extend_from_slice(&pending);
            self.prefill_ms = prefill_started.elapsed().as_secs_f64() * 1000.0;
            return Ok(logits);
        }

        if let Some(token) = self.last_unexecuted.take() {
            return self.pipeline.runtime.run_step(token, &mut self.state);
        }

        // generate() guarantees a non-empty prompt or a full cache hit.
        Err(RwkvError::Forward("no position to sample from".into()))
    }

    /// Terminal transition for a successful (or aborted) run: execute the
    /// final emitted token so the state covers the full history, check the
    /// checkpoint in, and finalize statistics.
    fn complete(&mut self, reason: FinishReason) {
        if self.done {
            return;
        }
        self.done = true;
        self.finish = Some(reason);
        self.pipeline.is_running.store(false, Ordering::Release);

        if let Some(token) = self.last_unexecuted.take() {
            match self.pipeline.runtime.run_step(token, &mut self.state) {
                Ok(logits) => self.logits = Some(logits),
                Err(e) => {
                    // The state no longer matches the history; keep the
                    // previous cache entry instead.
                    tracing::warn!("trailing decode step failed, cache not updated: {e}");
                    self.errored = true;
                    return;
                }
            }
        }

        if self.history.len() > self.reused {
            if let Some(logits) = self.logits.take() {
                self.pipeline
                    .cache
                    .checkin(self.history.clone(), self.state.clone(), logits);
                tracing::debug!(tokens = self.history.len(), "state cache check-in");
            }
        }

        let total_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let decode_ms = (total_ms - self.prefill_ms).max(0.0);
        let tokens_per_second = if decode_ms > 0.0 {
            self.produced as f64 / (decode_ms / 1000.0)
        } else {
            0.0
        };

        self.stats = Some(GenerationStats {
            completion_id: self.completion_id.clone(),
            prompt_tokens: self.prompt_tokens,
            reused_prefix: self.reused,
            generated_tokens: self.produced,
            prefill_ms: self.prefill_ms,
            decode_ms,
            tokens_per_second,
            finish: reason,
        });
    }

    /// Terminal transition for a failed run: no check-in, the cache keeps
    /// its pre-call entry.
    fn fail(&mut self) {
        self.done = true;
        self.errored = true;
        self.pipeline.is_running.store(false, Ordering::Release);
    }
}

impl Iterator for TokenStream<'_> {
    type Item = Result<Emission>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // A stop condition recorded while emitting the previous token.
        if let Some(reason) = self.finish {
            self.complete(reason);
            return None;
        }

        // Cooperative cancellation, observed before the next forward pass.
        if !self.pipeline.is_running.load(Ordering::Acquire) {
            self.complete(FinishReason::Abort);
            return None;
        }

        if self.produced >= self.max_tokens {
            self.complete(FinishReason::Length);
            return None;
        }

        let mut logits = match self.advance() {
            Ok(logits) => logits,
            Err(e) => {
                self.fail();
                return Some(Err(e));
            }
        };

        self.sampler.transform(&mut logits);
        let probs = softmax(&logits);
        let token = match self.sampler.sample(&probs) {
            Ok(token) => token,
            Err(e) => {
                self.fail();
                return Some(Err(RwkvError::Forward(format!("sampling failed: {e}"))));
            }
        };
        self.sampler.update(token);

        self.history.push(token);
        self.last_unexecuted = Some(token);
        self.produced += 1;

        let bytes = match self.tokenizer.decode(&[token]) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail();
                return Some(Err(e));
            }
        };
        self.decoded.extend_from_slice(&bytes);
        let text = String::from_utf8_lossy(&bytes).into_owned();

        if self.stop_tokens.contains(&token) {
            self.finish = Some(FinishReason::Stop);
        } else if !self.stop_words.is_empty() {
            let transcript = String::from_utf8_lossy(&self.decoded);
            if self.stop_words.iter().any(|w| transcript.contains(w.as_str())) {
                self.finish = Some(FinishReason::StopWord);
            }
        }

        Some(Ok(Emission { token, text }))
    }
}

impl Drop for TokenStream<'_> {
    fn drop(&mut self) {
        // Abandoning the stream counts as an abort: the partial history is
        // still a valid checkpoint for a retry.
        if !self.done {
            self.complete(FinishReason::Abort);
        }
    }
}
