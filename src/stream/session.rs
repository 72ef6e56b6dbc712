//! One logical conversation against the backend.
//!
//! [`StreamSession`] owns the session id and the generation counter. Every
//! [`send`](StreamSession::send) starts a new generation; events are
//! tagged with the generation of the turn that produced them and dropped
//! at delivery time when that generation is no longer current. Stale
//! turns are therefore filtered by comparison, without waiting for their
//! connections to wind down.
//!
//! Session-level notices ([`SessionUpdate::Stopped`],
//! [`SessionUpdate::Cleared`]) are untagged and always delivered.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec::SseLineCodec;
use super::event::{parse_line, StreamEvent};
use super::form::FormResponse;
use crate::client::{BackendClient, ChatReply};
use crate::{AppError, Result};

/// Phase of the most recent turn.
///
/// `Completed`, `Cancelled` and `Errored` are idle phases that remember how
/// the last turn ended.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// No turn has run yet.
    #[default]
    Idle,
    /// A turn is receiving events.
    Streaming,
    /// The last turn finished normally.
    Completed,
    /// The last turn was cancelled by the user.
    Cancelled,
    /// The last turn failed.
    Errored,
}

impl TurnPhase {
    /// Whether no turn is in flight.
    #[must_use]
    pub fn is_idle(self) -> bool {
        self != Self::Streaming
    }
}

/// Something the UI layer should render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "update", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// An event of the current turn.
    Event(StreamEvent),
    /// The current turn ended normally.
    TurnCompleted {
        /// Session id in effect after the turn.
        session_id: Option<String>,
    },
    /// The current turn failed.
    TurnFailed {
        /// Human-readable cause.
        message: String,
    },
    /// The user stopped the turn.
    Stopped {
        /// Whether the server-side conversation survives.
        context_preserved: bool,
    },
    /// History was cleared.
    Cleared,
}

#[derive(Debug)]
struct Tagged {
    generation: Option<u64>,
    update: SessionUpdate,
}

#[derive(Debug)]
struct ActiveTurn {
    generation: u64,
    epoch: u64,
    cancel: CancellationToken,
    header_session: Arc<Mutex<Option<String>>>,
}

#[derive(Debug)]
struct Shared {
    client: BackendClient,
    generation: AtomicU64,
    /// Bumped by `clear()`; a turn started under an older epoch must not
    /// re-adopt a session id.
    epoch: AtomicU64,
    session_id: Mutex<Option<String>>,
    phase: Mutex<TurnPhase>,
    active: Mutex<Option<ActiveTurn>>,
    updates: mpsc::UnboundedSender<Tagged>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Deliver `update` for generation `g`. Returns `false` once `g` is stale.
    fn deliver(&self, g: u64, update: SessionUpdate) -> bool {
        if self.current_generation() != g {
            return false;
        }
        self.updates
            .send(Tagged {
                generation: Some(g),
                update,
            })
            .is_ok()
    }

    fn notify(&self, update: SessionUpdate) {
        let _ = self.updates.send(Tagged {
            generation: None,
            update,
        });
    }

    fn set_phase(&self, phase: TurnPhase) {
        *lock(&self.phase) = phase;
    }

    /// Adopt `id` unless history was cleared since `epoch`.
    fn adopt_session(&self, epoch: u64, id: &str) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let mut current = lock(&self.session_id);
        if current.as_deref() != Some(id) {
            info!(session_id = id, "adopted server session id");
            *current = Some(id.to_owned());
        }
    }

    /// Clear the active slot if it still belongs to `g`.
    fn finish(&self, g: u64, phase: TurnPhase) -> bool {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|t| t.generation == g) {
            *active = None;
            drop(active);
            self.set_phase(phase);
            true
        } else {
            false
        }
    }
}

/// Receiving half of a [`StreamSession`].
///
/// Drops any turn update whose generation is no longer current.
#[derive(Debug)]
pub struct SessionUpdates {
    rx: mpsc::UnboundedReceiver<Tagged>,
    shared: Arc<Shared>,
}

impl SessionUpdates {
    /// Next update for the UI; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionUpdate> {
        loop {
            let tagged = self.rx.recv().await?;
            match tagged.generation {
                Some(g) if g != self.shared.current_generation() => {
                    debug!(generation = g, "dropping update from superseded turn");
                }
                _ => return Some(tagged.update),
            }
        }
    }
}

/// A cancellable, generation-tracked conversation.
#[derive(Debug)]
pub struct StreamSession {
    shared: Arc<Shared>,
}

enum TurnEnd {
    Done,
    EndOfStream,
    ServerError(String),
    Superseded,
}

impl StreamSession {
    /// New session with no id, plus the receiver for its updates.
    #[must_use]
    pub fn new(client: BackendClient) -> (Self, SessionUpdates) {
        let (updates, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            client,
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            session_id: Mutex::new(None),
            phase: Mutex::new(TurnPhase::Idle),
            active: Mutex::new(None),
            updates,
        });
        let receiver = SessionUpdates {
            rx,
            shared: Arc::clone(&shared),
        };
        (Self { shared }, receiver)
    }

    /// Current session id.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        lock(&self.shared.session_id).clone()
    }

    /// Current generation; `0` before the first turn.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.current_generation()
    }

    /// Phase of the latest turn.
    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        *lock(&self.shared.phase)
    }

    /// Start a streaming turn for `message` and return its generation.
    ///
    /// A turn still in flight is superseded: its connection is dropped and
    /// none of its remaining events are delivered. It is not sealed.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn send(&self, message: &str) -> u64 {
        let shared = &self.shared;
        let g = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = shared.epoch.load(Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let header_session = Arc::new(Mutex::new(None));

        let previous = lock(&shared.active).replace(ActiveTurn {
            generation: g,
            epoch,
            cancel: cancel.clone(),
            header_session: Arc::clone(&header_session),
        });
        if let Some(previous) = previous {
            debug!(superseded = previous.generation, generation = g, "superseding turn");
            previous.cancel.cancel();
        }
        shared.set_phase(TurnPhase::Streaming);

        let session_id = self.session_id();
        let task = run_turn(
            Arc::clone(shared),
            g,
            epoch,
            message.to_owned(),
            session_id,
            cancel,
            header_session,
        );
        tokio::spawn(task.instrument(info_span!("turn", generation = g)));
        g
    }

    /// Answer a form; equivalent to [`send`](Self::send) with the encoded
    /// response.
    pub fn respond_to_form(&self, response: &FormResponse) -> u64 {
        self.send(&response.to_message())
    }

    /// Stop the turn in flight.
    ///
    /// Drops the connection at once and retires the turn's generation. When
    /// a session id is known the server is asked, in the background, to seal
    /// the partial turn so the conversation continues with context. The
    /// [`SessionUpdate::Stopped`] notice does not wait for that call.
    ///
    /// Returns `false`, doing nothing, when no turn is in flight.
    pub fn cancel(&self) -> bool {
        let shared = &self.shared;
        let Some(turn) = lock(&shared.active).take() else {
            debug!("cancel with no active turn");
            return false;
        };

        shared.generation.fetch_add(1, Ordering::SeqCst);
        turn.cancel.cancel();
        shared.set_phase(TurnPhase::Cancelled);

        let header_id = lock(&turn.header_session).clone();
        if let Some(id) = header_id {
            shared.adopt_session(turn.epoch, &id);
        }
        let session_id = self.session_id();

        info!(
            generation = turn.generation,
            session_id = session_id.as_deref(),
            "turn cancelled"
        );
        shared.notify(SessionUpdate::Stopped {
            context_preserved: session_id.is_some(),
        });

        if let Some(id) = session_id {
            let client = shared.client.clone();
            tokio::spawn(async move {
                match client.seal_session(&id).await {
                    Ok(outcome) if outcome.preserved => {
                        debug!(session_id = %id, "session sealed");
                    }
                    Ok(_) => warn!(session_id = %id, "server could not preserve interrupted turn"),
                    Err(err) => warn!(session_id = %id, %err, "seal request failed"),
                }
            });
        }
        true
    }

    /// Forget the session id and ask the server to delete its state.
    ///
    /// The generation is untouched; a turn in flight keeps streaming but
    /// will not re-adopt its session id.
    pub fn clear(&self) {
        let shared = &self.shared;
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        let previous = lock(&shared.session_id).take();
        shared.notify(SessionUpdate::Cleared);

        if let Some(id) = previous {
            info!(session_id = %id, "session cleared");
            let client = shared.client.clone();
            tokio::spawn(async move {
                match client.delete_session(&id).await {
                    Ok(deleted) => debug!(session_id = %id, deleted, "server session deleted"),
                    Err(err) => warn!(session_id = %id, %err, "session delete failed"),
                }
            });
        }
    }

    /// Run one non-streaming turn via `POST /chat`.
    ///
    /// Adopts the returned session id. Does not affect the generation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Http` when the call fails.
    pub async fn ask(&self, message: &str) -> Result<ChatReply> {
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        let session_id = self.session_id();
        let reply = self
            .shared
            .client
            .chat(message, session_id.as_deref())
            .await?;
        self.shared.adopt_session(epoch, &reply.session_id);
        Ok(reply)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(turn) = lock(&self.shared.active).take() {
            turn.cancel.cancel();
        }
        self.shared.generation.store(0, Ordering::SeqCst);
    }
}

async fn run_turn(
    shared: Arc<Shared>,
    g: u64,
    epoch: u64,
    message: String,
    session_id: Option<String>,
    cancel: CancellationToken,
    header_session: Arc<Mutex<Option<String>>>,
) {
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!("turn connection aborted");
            return;
        }
        outcome = stream_turn(&shared, g, &message, session_id.as_deref(), &header_session) => outcome,
    };

    match outcome {
        Ok(TurnEnd::Superseded) => {}
        Ok(TurnEnd::ServerError(text)) => {
            if shared.finish(g, TurnPhase::Errored) {
                warn!(message = %text, "server reported a turn failure");
                shared.deliver(g, SessionUpdate::TurnFailed { message: text });
            }
        }
        Ok(end @ (TurnEnd::Done | TurnEnd::EndOfStream)) => {
            if shared.current_generation() != g {
                return;
            }
            if let Some(id) = lock(&header_session).clone() {
                shared.adopt_session(epoch, &id);
            }
            if shared.finish(g, TurnPhase::Completed) {
                if matches!(end, TurnEnd::EndOfStream) {
                    debug!("stream ended without done marker");
                }
                let session_id = lock(&shared.session_id).clone();
                shared.deliver(g, SessionUpdate::TurnCompleted { session_id });
            }
        }
        Err(err) => {
            if cancel.is_cancelled() {
                debug!(%err, "ignoring error from aborted turn");
                return;
            }
            if shared.finish(g, TurnPhase::Errored) {
                warn!(%err, "turn failed");
                shared.deliver(
                    g,
                    SessionUpdate::TurnFailed {
                        message: err.to_string(),
                    },
                );
            }
        }
    }
}

async fn stream_turn(
    shared: &Shared,
    g: u64,
    message: &str,
    session_id: Option<&str>,
    header_session: &Mutex<Option<String>>,
) -> Result<TurnEnd> {
    let open = shared.client.open_stream(message, session_id).await?;
    if let Some(id) = open.session_id {
        *lock(header_session) = Some(id);
    }

    let body = open
        .response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let mut lines = pin!(FramedRead::new(StreamReader::new(body), SseLineCodec::new()));

    while let Some(item) = lines.next().await {
        let line = match item {
            Ok(line) => line,
            Err(AppError::Io(msg)) => return Err(AppError::Stream(msg)),
            Err(err) => return Err(err),
        };

        let events = match parse_line(&line) {
            Ok(events) => events,
            Err(err) => {
                warn!(%err, raw_line = %line, "skipping malformed stream line");
                continue;
            }
        };

        for event in events {
            let end = match &event {
                StreamEvent::Done => Some(TurnEnd::Done),
                StreamEvent::Error { message } => Some(TurnEnd::ServerError(message.clone())),
                _ => None,
            };
            if !shared.deliver(g, SessionUpdate::Event(event)) {
                return Ok(TurnEnd::Superseded);
            }
            if let Some(end) = end {
                return Ok(end);
            }
        }
    }

    Ok(TurnEnd::EndOfStream)
}
