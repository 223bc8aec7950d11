//! Turn-by-turn conversation with an AI backend
//!
//! [`ConversationEngine`] owns the dialogue memory. Each call to
//! [`respond_with`](ConversationEngine::respond_with) builds a prompt from
//! the remembered turns plus the new input, queries the backend on a helper
//! thread and, if the [`TurnTicket`] was not cancelled meanwhile, records the
//! new turn. Only one query may be outstanding per engine: the slot is held
//! by the query thread itself, so an abandoned query keeps the engine busy
//! until the backend actually returns.

use super::backend::{AiBackend, BackendError, BackendParams};
use super::config::LLMConfig;
use super::context::{ConversationMemory, Turn};
use super::prompts::{build_prompt, build_system_prompt};
use crate::speech::text::strip_reasoning;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversationError {
    #[error("nothing to respond to")]
    EmptyInput,

    #[error("a reply is already being generated")]
    Busy,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Backend(BackendError),

    #[error("turn cancelled")]
    Cancelled,
}

impl From<BackendError> for ConversationError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unreachable(msg) => ConversationError::BackendUnavailable(msg),
            BackendError::Timeout(after) => {
                ConversationError::BackendUnavailable(format!("no reply within {:?}", after))
            }
            other => ConversationError::Backend(other),
        }
    }
}

impl From<ConversationError> for crate::ParleyError {
    fn from(e: ConversationError) -> Self {
        crate::ParleyError::Conversation(e.to_string())
    }
}

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// Cancellation token for one turn.
///
/// Either the turn commits (its reply is written to memory) or the ticket is
/// cancelled first; never both. A reply arriving after cancellation is
/// discarded.
#[derive(Clone)]
pub struct TurnTicket {
    state: Arc<AtomicU8>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl TurnTicket {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = bounded(1);
        Self {
            state: Arc::new(AtomicU8::new(PENDING)),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Cancel the turn; false if it already committed
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if cancelled {
            let _ = self.cancel_tx.try_send(());
        }
        cancelled || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    pub fn is_committed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == COMMITTED
    }

    /// Fires once the ticket is cancelled
    pub fn cancelled(&self) -> &Receiver<()> {
        &self.cancel_rx
    }

    fn commit(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMMITTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for TurnTicket {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in-flight flag when the backend call returns, however it ends
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConversationEngine {
    backend: Arc<dyn AiBackend>,
    config: RwLock<LLMConfig>,
    system_prompt: RwLock<String>,
    memory: Mutex<ConversationMemory>,
    in_flight: Arc<AtomicBool>,
}

impl ConversationEngine {
    pub fn new(backend: Arc<dyn AiBackend>, config: LLMConfig) -> Self {
        let system_prompt = system_prompt_for(&config);
        let memory = ConversationMemory::new(config.memory_window);
        info!(
            "Conversation engine ready: model={} window={} timeout={:?}",
            config.model,
            config.memory_window,
            config.timeout()
        );
        Self {
            backend,
            config: RwLock::new(config),
            system_prompt: RwLock::new(system_prompt),
            memory: Mutex::new(memory),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Respond to `user_text` without external cancellation
    pub fn respond(&self, user_text: &str) -> Result<Turn, ConversationError> {
        self.respond_with(user_text, &TurnTicket::new())
    }

    /// Respond to `user_text`, abandoning the query if `ticket` is cancelled
    pub fn respond_with(&self, user_text: &str, ticket: &TurnTicket) -> Result<Turn, ConversationError> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(ConversationError::EmptyInput);
        }
        if ticket.is_cancelled() {
            return Err(ConversationError::Cancelled);
        }
        let in_flight = InFlight::acquire(&self.in_flight).ok_or(ConversationError::Busy)?;

        let (prompt, params, timeout) = {
            let config = self.config.read();
            let memory = self.memory.lock();
            let prompt = build_prompt(&self.system_prompt.read(), &memory, user_text);
            (prompt, BackendParams::from(&*config), config.timeout())
        };

        let started = Instant::now();
        let (reply_tx, reply_rx) = bounded(1);
        let backend = Arc::clone(&self.backend);
        thread::Builder::new()
            .name("backend-query".into())
            .spawn(move || {
                let reply = backend.query(&prompt, &params, timeout);
                drop(in_flight);
                let _ = reply_tx.send(reply);
            })
            .map_err(|e| ConversationError::BackendUnavailable(format!("failed to spawn query: {}", e)))?;

        let reply = select! {
            recv(reply_rx) -> reply => match reply {
                Ok(reply) => reply?,
                Err(_) => return Err(ConversationError::BackendUnavailable("query worker exited".into())),
            },
            recv(ticket.cancelled()) -> _ => {
                debug!("Turn cancelled while waiting for the backend");
                return Err(ConversationError::Cancelled);
            }
            default(timeout) => {
                warn!("Backend gave no reply within {:?}", timeout);
                return Err(ConversationError::BackendUnavailable(format!("no reply within {:?}", timeout)));
            }
        };

        let assistant_text = strip_reasoning(&reply);
        if assistant_text.is_empty() {
            return Err(ConversationError::Backend(BackendError::EmptyReply));
        }
        let turn = Turn::new(user_text, assistant_text, started.elapsed().as_millis() as u64);

        let mut memory = self.memory.lock();
        if !ticket.commit() {
            debug!("Discarding reply that arrived after cancellation");
            return Err(ConversationError::Cancelled);
        }
        memory.push(turn.clone());
        debug!("Recorded turn {} ({} ms)", turn.id, turn.latency_ms);
        Ok(turn)
    }

    /// True while a backend query is outstanding, including one whose turn
    /// was already abandoned
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Remembered turns, oldest first
    pub fn history(&self) -> Vec<Turn> {
        self.memory.lock().turns().cloned().collect()
    }

    pub fn clear(&self) {
        self.memory.lock().clear();
        info!("Conversation history cleared");
    }

    pub fn config(&self) -> LLMConfig {
        self.config.read().clone()
    }

    /// Apply new backend settings; a different window size rebuilds the
    /// memory keeping the most recent turns
    pub fn update_config(&self, config: LLMConfig) {
        {
            let mut memory = self.memory.lock();
            if memory.capacity() != config.memory_window {
                *memory = memory.resized(config.memory_window);
                info!("Memory window resized to {}", config.memory_window);
            }
        }
        *self.system_prompt.write() = system_prompt_for(&config);
        *self.config.write() = config;
    }

}

fn system_prompt_for(config: &LLMConfig) -> String {
    config
        .system_prompt
        .clone()
        .unwrap_or_else(|| build_system_prompt(&config.assistant_name))
}
