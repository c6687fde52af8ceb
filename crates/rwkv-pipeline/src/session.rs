//! Session coordination for the generation pipeline.
//!
//! The pipeline runs on a dedicated OS thread (the inference actor) so
//! blocking forward-pass calls never stall the caller. Commands queue in a
//! bounded FIFO channel, which serializes generations — only one runs at a
//! time, callers are served first-come-first-served — and token events
//! stream back over a second channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     crossbeam channel     ┌───────────────────┐
//! │  UI thread    │ ──── SessionCommand ─────>│ Inference thread   │
//! │ (RwkvSession) │ <──── SessionEvent ───────│ Owns: Pipeline     │
//! │               │                           │ (cache + state)    │
//! └──────────────┘                           └───────────────────┘
//! ```
//!
//! Cancellation is the shared running flag: the consumer flips it and the
//! in-flight [`TokenStream`] observes it after the current token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rwkv_engine::{ModelInfo, ModelRuntime, Result, RwkvError, TokenId, Tokenizer};

use crate::pipeline::{GenerationStats, Pipeline, TokenStream};
use crate::request::GenerateRequest;

/// Commands sent from the consumer to the inference thread.
pub enum SessionCommand {
    /// Start a generation run.
    Generate {
        request: GenerateRequest,
        tokenizer: Arc<dyn Tokenizer>,
    },

    /// Interrupt the current generation (the flag does the real work; the
    /// command is a wake-up for an idle thread).
    Cancel,

    /// Clear the prefix cache (new conversation).
    Reset,

    /// Shut the inference thread down.
    Shutdown,
}

/// Events streamed from the inference thread back to the consumer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One generated token with its decoded text.
    Token { token: TokenId, text: String },

    /// The run finished; carries the final statistics (including the
    /// finish reason — an aborted run still ends with `Done`).
    Done { stats: GenerationStats },

    /// The run failed; the prefix cache keeps its pre-call entry.
    Error(String),

    /// The inference thread has shut down.
    Stopped,
}

/// Handle to the inference thread.
pub struct PipelineHandle {
    cmd_tx: Sender<SessionCommand>,
    event_rx: Receiver<SessionEvent>,
    is_running: Arc<AtomicBool>,
    info: ModelInfo,
    thread: Option<thread::JoinHandle<()>>,
}

impl PipelineHandle {
    /// Spawn the inference actor on a dedicated OS thread.
    pub fn spawn(pipeline: Pipeline) -> Self {
        let (cmd_tx, cmd_rx) = bounded::<SessionCommand>(16);
        let (event_tx, event_rx) = bounded::<SessionEvent>(256);
        let is_running = pipeline.running_flag();
        let info = pipeline.info().clone();

        let thread = thread::Builder::new()
            .name("rwkv-inference".into())
            .spawn(move || {
                actor_loop(pipeline, cmd_rx, event_tx);
            })
            .expect("failed to spawn inference thread");

        PipelineHandle {
            cmd_tx,
            event_rx,
            is_running,
            info,
            thread: Some(thread),
        }
    }

    /// Queue a generation request. Requests are served in order.
    pub fn generate(&self, request: GenerateRequest, tokenizer: Arc<dyn Tokenizer>) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Generate { request, tokenizer })
            .map_err(|_| RwkvError::ModelNotLoaded)
    }

    /// Cancel the current generation.
    pub fn cancel(&self) {
        self.is_running.store(false, Ordering::Release);
        let _ = self.cmd_tx.send(SessionCommand::Cancel);
    }

    /// Clear the prefix cache.
    pub fn reset(&self) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Reset)
            .map_err(|_| RwkvError::ModelNotLoaded)
    }

    /// Shut down the inference thread and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Try to receive the next event (non-blocking).
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Option<SessionEvent> {
        self.event_rx.recv().ok()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Whether a generation is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The main loop on the inference thread.
fn actor_loop(
    mut pipeline: Pipeline,
    cmd_rx: Receiver<SessionCommand>,
    event_tx: Sender<SessionEvent>,
) {
    loop {
        match cmd_rx.recv() {
            Ok(SessionCommand::Generate { request, tokenizer }) => {
                run_generation(&mut pipeline, tokenizer, &request, &event_tx);
            }

            Ok(SessionCommand::Cancel) => {
                pipeline.cancel();
            }

            Ok(SessionCommand::Reset) => {
                pipeline.reset();
            }

            Ok(SessionCommand::Shutdown) => {
                let _ = event_tx.send(SessionEvent::Stopped);
                break;
            }

            Err(_) => {
                // All handles dropped.
                break;
            }
        }
    }
}

/// Drive one generation run, adapting the pull-based stream to events.
fn run_generation(
    pipeline: &mut Pipeline,
    tokenizer: Arc<dyn Tokenizer>,
    request: &GenerateRequest,
    event_tx: &Sender<SessionEvent>,
) {
    let mut stream: TokenStream<'_> = match pipeline.generate(tokenizer, request) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = event_tx.send(SessionEvent::Error(e.to_string()));
            return;
        }
    };

    for item in &mut stream {
        match item {
            Ok(emission) => {
                if event_tx
                    .send(SessionEvent::Token {
                        token: emission.token,
                        text: emission.text,
                    })
                    .is_err()
                {
                    // Consumer gone; dropping the stream aborts and still
                    // checks the partial history in.
                    return;
                }
            }
            Err(e) => {
                let _ = event_tx.send(SessionEvent::Error(e.to_string()));
                return;
            }
        }
    }

    match stream.stats() {
        Some(stats) => {
            let _ = event_tx.send(SessionEvent::Done {
                stats: stats.clone(),
            });
        }
        None => {
            // Stream ended without stats: the trailing decode step failed.
            let _ = event_tx.send(SessionEvent::Error(
                "generation ended without a final checkpoint".into(),
            ));
        }
    }
}

/// A chat session over one loaded model — the surface the UI drives.
///
/// Owns the model runtime (via the inference actor) and the tokenizer as
/// explicit state. Loading a model replaces the actor wholesale, which
/// invalidates the prefix cache: a state vector is meaningless under
/// different weights.
#[derive(Default)]
pub struct RwkvSession {
    actor: Option<PipelineHandle>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    model_name: Option<String>,
}

impl RwkvSession {
    pub fn new() -> Self {
        RwkvSession::default()
    }

    /// Load a model, replacing (and shutting down) any previous one.
    pub fn load_model(&mut self, name: impl Into<String>, runtime: Arc<dyn ModelRuntime>) {
        if self.actor.is_some() {
            self.unload_model();
        }
        let name = name.into();
        tracing::info!(model = %name, "loading model");
        self.actor = Some(PipelineHandle::spawn(Pipeline::new(runtime)));
        self.model_name = Some(name);
    }

    /// Unload the current model and drop its cache.
    pub fn unload_model(&mut self) {
        if let Some(actor) = self.actor.take() {
            tracing::info!(model = self.model_name.as_deref(), "unloading model");
            actor.shutdown();
        }
        self.model_name = None;
    }

    /// Install the tokenizer used to encode prompts and decode tokens.
    pub fn load_tokenizer(&mut self, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizer = Some(tokenizer);
    }

    /// Queue a generation request.
    ///
    /// # Errors
    /// `ModelNotLoaded` / `VocabNotLoaded` if the session is missing its
    /// model or tokenizer — rejected before anything runs.
    pub fn generate(&self, request: GenerateRequest) -> Result<()> {
        let actor = self.actor.as_ref().ok_or(RwkvError::ModelNotLoaded)?;
        let tokenizer = self.tokenizer.clone().ok_or(RwkvError::VocabNotLoaded)?;
        actor.generate(request, tokenizer)
    }

    /// Cancel the current generation.
    pub fn cancel(&self) {
        if let Some(actor) = &self.actor {
            actor.cancel();
        }
    }

    /// Clear the prefix cache (new conversation, same model).
    pub fn reset(&self) -> Result<()> {
        self.actor
            .as_ref()
            .ok_or(RwkvError::ModelNotLoaded)?
            .reset()
    }

    /// Poll for the next event (non-blocking).
    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.actor.as_ref()?.try_recv()
    }

    /// Block until the next event.
    pub fn wait_event(&self) -> Option<SessionEvent> {
        self.actor.as_ref()?.recv()
    }

    /// Block until the next event or the timeout.
    pub fn wait_event_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.actor.as_ref()?.recv_timeout(timeout)
    }

    pub fn is_loaded(&self) -> bool {
        self.actor.is_some()
    }

    pub fn is_generating(&self) -> bool {
        self.actor.as_ref().is_some_and(|a| a.is_running())
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn info(&self) -> Option<&ModelInfo> {
        self.actor.as_ref().map(|a| a.info())
    }
}
