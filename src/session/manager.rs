//! Live session registry.
//!
//! Each connection owns one [`SessionSlot`]. The slot holds the session
//! behind its own lock plus the tasks of its current turn, so nothing is
//! shared between sessions except the transcoding permits inside
//! [`PipelineDeps`].
//!
//! Cancel, disconnect and the upload watchdog follow one rule: whoever moves
//! the session to `ERROR` reports it, then fires the turn's token so the
//! pipeline stops without reporting a second time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::core::reassembly::Packet;

use super::context::{Session, SessionLimits, SessionSnapshot, TurnInputs};
use super::error::PipelineError;
use super::events::{EventSink, SessionEvent, Variant};
use super::pipeline::{PipelineDeps, TurnHandle, run_turn};
use super::state::SessionState;

#[derive(Default)]
struct TurnTasks {
    cancel: CancellationToken,
    pipeline: Option<AbortOnDropHandle<()>>,
    watchdog: Option<AbortOnDropHandle<()>>,
}

impl TurnTasks {
    fn stop(&mut self) {
        self.cancel.cancel();
        self.pipeline = None;
        self.watchdog = None;
    }
}

pub struct SessionSlot {
    session: Arc<Mutex<Session>>,
    events: EventSink,
    tasks: Mutex<TurnTasks>,
}

impl SessionSlot {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state()
    }
}

pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionSlot>>,
    deps: PipelineDeps,
    limits: SessionLimits,
    upload_timeout: Duration,
}

impl SessionManager {
    pub fn new(deps: PipelineDeps, limits: SessionLimits, upload_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            deps,
            limits,
            upload_timeout,
        }
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// Register a session for a new connection and greet the client
    pub async fn open(&self, variant: Variant, events: EventSink) -> String {
        let id = Uuid::new_v4().to_string();
        let slot = Arc::new(SessionSlot {
            session: Arc::new(Mutex::new(Session::new(id.clone(), variant, self.limits))),
            events: events.clone(),
            tasks: Mutex::new(TurnTasks::default()),
        });
        self.sessions.insert(id.clone(), slot);
        info!(session_id = %id, variant = %variant, "Session opened");

        events
            .emit(SessionEvent::Connected {
                session_id: id.clone(),
            })
            .await;
        id
    }

    fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, PipelineError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::Malformed(format!("Unknown session {id}")))
    }

    /// Store a packet, acknowledge it and start the pipeline once the upload
    /// is complete. Errors are per-packet rejections for the caller to report.
    pub async fn submit(&self, id: &str, packet: Packet) -> Result<(), PipelineError> {
        let slot = self.slot(id)?;
        let channel = packet.channel;
        let seq = packet.seq;

        let (accepted, turn) = {
            let mut session = slot.session.lock();
            let accepted = session.accept_packet(packet);
            (accepted, session.turn())
        };
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(session_id = %id, channel = %channel, seq, error = %e, "Packet rejected");
                return Err(e);
            }
        };

        debug!(
            session_id = %id,
            channel = %channel,
            seq,
            received = accepted.report.received,
            total = accepted.report.total,
            duplicate = accepted.report.duplicate,
            "Packet accepted"
        );

        if accepted.new_turn {
            self.begin_turn(&slot, turn);
        }

        let report = accepted.report;
        slot.events
            .emit(SessionEvent::PacketAck {
                channel: report.channel,
                seq: report.seq,
                received: report.received,
                total: report.total,
                duplicate: report.duplicate,
            })
            .await;

        if let Some(inputs) = accepted.ready {
            self.start_pipeline(&slot, inputs);
        }
        Ok(())
    }

    /// Explicit end-of-upload marker
    pub async fn finalize(&self, id: &str) -> Result<(), PipelineError> {
        let slot = self.slot(id)?;
        let inputs = slot.session.lock().finalize()?;
        self.start_pipeline(&slot, inputs);
        Ok(())
    }

    /// Client-requested cancel. Returns whether a running turn was stopped.
    pub async fn cancel(&self, id: &str) -> Result<bool, PipelineError> {
        let slot = self.slot(id)?;
        let moved = slot.session.lock().fail();
        if moved {
            info!(session_id = %id, "Turn cancelled by client");
            let err = PipelineError::Cancelled;
            slot.events
                .emit(SessionEvent::error(err.code(), err.to_string()))
                .await;
        }
        slot.tasks.lock().stop();
        Ok(moved)
    }

    /// Connection closed. Stops the turn and forgets the session.
    pub fn close(&self, id: &str) {
        let Some((_, slot)) = self.sessions.remove(id) else {
            return;
        };
        let (moved, state) = {
            let mut session = slot.session.lock();
            let state = session.state();
            (session.fail(), state)
        };
        if moved {
            info!(
                session_id = %id,
                state = %state,
                cause = PipelineError::Disconnected.code(),
                "Session ended before completion"
            );
        }
        slot.tasks.lock().stop();
        info!(session_id = %id, "Session closed");
    }

    pub fn get(&self, id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(id).map(|entry| entry.value().snapshot())
    }

    /// Whether the session's current turn is past reassembly and running
    pub fn is_processing(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| entry.value().state().is_processing())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn begin_turn(&self, slot: &Arc<SessionSlot>, turn: u32) {
        let mut tasks = slot.tasks.lock();
        // the previous turn's pipeline has already reached a terminal state
        tasks.pipeline = None;
        tasks.cancel = CancellationToken::new();
        tasks.watchdog = Some(self.arm_watchdog(slot, turn, tasks.cancel.clone()));
    }

    fn arm_watchdog(
        &self,
        slot: &Arc<SessionSlot>,
        turn: u32,
        cancel: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let session = slot.session.clone();
        let events = slot.events.clone();
        let limit = self.upload_timeout;

        AbortOnDropHandle::new(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    let (failed, id) = {
                        let mut session = session.lock();
                        let stalled = session.turn() == turn
                            && session.state() == SessionState::Receiving;
                        (stalled && session.fail(), session.id().to_string())
                    };
                    if failed {
                        let err = PipelineError::UploadTimeout(limit.as_secs());
                        warn!(session_id = %id, turn, error = %err, "Upload stalled");
                        events.emit(SessionEvent::error(err.code(), err.to_string())).await;
                        cancel.cancel();
                    }
                }
            }
        }))
    }

    fn start_pipeline(&self, slot: &Arc<SessionSlot>, inputs: TurnInputs) {
        let mut tasks = slot.tasks.lock();
        tasks.watchdog = None;

        let span = info_span!(
            "turn",
            session_id = %inputs.session_id,
            turn = inputs.turn,
            variant = %inputs.variant
        );
        info!(
            session_id = %inputs.session_id,
            turn = inputs.turn,
            audio_bytes = inputs.audio.len(),
            image_bytes = inputs.image.as_ref().map(|i| i.len()).unwrap_or(0),
            "Upload complete, starting pipeline"
        );

        let handle = TurnHandle {
            session: slot.session.clone(),
            events: slot.events.clone(),
            cancel: tasks.cancel.clone(),
        };
        let task = tokio::spawn(run_turn(self.deps.clone(), handle, inputs).instrument(span));
        tasks.pipeline = Some(AbortOnDropHandle::new(task));
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().tasks.lock().stop();
        }
    }
}
