//! Per-connection session: reassembly buffers, state machine and transcripts.
//!
//! A `Session` is owned by the [`SessionManager`](super::SessionManager) and
//! always accessed under its own lock, so packet submissions from one
//! connection are serialized while other sessions proceed independently.

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::core::reassembly::{Channel, Packet, Reassembler, ReassemblyError, SubmitReport};
use crate::core::storage::now_rfc3339;

use super::error::PipelineError;
use super::events::Variant;
use super::state::{InvalidTransition, SessionState, StateMachine};

/// Ordered text deltas with a materialized full view
#[derive(Debug, Clone, Default)]
pub struct StreamingTranscript {
    deltas: Vec<String>,
    full: String,
}

impl StreamingTranscript {
    pub fn push(&mut self, delta: &str) {
        self.deltas.push(delta.to_string());
        self.full.push_str(delta);
    }

    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn deltas(&self) -> &[String] {
        &self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    fn clear(&mut self) {
        self.deltas.clear();
        self.full.clear();
    }
}

/// Packet bounds applied to new sessions
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub audio_packet_max_bytes: usize,
    pub vlm_packet_max_bytes: usize,
    pub max_packets_per_channel: u32,
}

impl From<&PipelineConfig> for SessionLimits {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            audio_packet_max_bytes: config.audio_packet_max_bytes,
            vlm_packet_max_bytes: config.vlm_packet_max_bytes,
            max_packets_per_channel: config.max_packets_per_channel,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Reassembled input of one turn, handed to the pipeline
#[derive(Debug, Clone)]
pub struct TurnInputs {
    pub session_id: String,
    pub turn: u32,
    pub variant: Variant,
    pub audio: Bytes,
    pub image: Option<Bytes>,
    pub packets: u64,
    pub packets_declared: u64,
    pub started: Instant,
    /// RFC 3339 wall-clock start
    pub started_wall: String,
}

/// Result of an accepted packet
#[derive(Debug)]
pub struct Accepted {
    pub report: SubmitReport,
    /// The packet opened a new turn
    pub new_turn: bool,
    /// Reassembly completed and the turn moved to `TRANSCRIBING`
    pub ready: Option<TurnInputs>,
}

/// Operational view for the sessions endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub variant: Variant,
    pub turn: u32,
    pub state: SessionState,
    pub packets_received: u64,
    pub packets_declared: u64,
    pub age_seconds: f64,
    pub created_at: String,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    variant: Variant,
    limits: SessionLimits,
    turn: u32,
    machine: StateMachine,
    reassembler: Reassembler,
    turn_started: Instant,
    turn_started_wall: String,
    created: Instant,
    created_at: String,
    /// User transcription of the current turn
    pub transcript: StreamingTranscript,
    /// Assistant response of the current turn
    pub response: StreamingTranscript,
}

impl Session {
    pub fn new(id: impl Into<String>, variant: Variant, limits: SessionLimits) -> Self {
        let now = Instant::now();
        let wall = now_rfc3339();
        Self {
            id: id.into(),
            variant,
            limits,
            turn: 0,
            machine: StateMachine::new(),
            reassembler: Self::reassembler_for(variant, &limits),
            turn_started: now,
            turn_started_wall: wall.clone(),
            created: now,
            created_at: wall,
            transcript: StreamingTranscript::default(),
            response: StreamingTranscript::default(),
        }
    }

    fn reassembler_for(variant: Variant, limits: &SessionLimits) -> Reassembler {
        match variant {
            Variant::Audio => Reassembler::audio_only(
                limits.audio_packet_max_bytes,
                limits.max_packets_per_channel,
            ),
            Variant::Multimodal => Reassembler::multimodal(
                limits.vlm_packet_max_bytes,
                limits.max_packets_per_channel,
            ),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Current turn number, 0 before the first packet
    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        let from = self.machine.state();
        self.machine.transition(next)?;
        debug!(
            session_id = %self.id,
            turn = self.turn,
            from = %from,
            state = %next,
            "Session state changed"
        );
        Ok(())
    }

    /// Move to `ERROR`. Returns `false` when the turn was already terminal.
    pub fn fail(&mut self) -> bool {
        let moved = self.machine.fail();
        if moved {
            debug!(session_id = %self.id, turn = self.turn, "Session moved to ERROR");
        }
        moved
    }

    /// Validate and store a packet.
    ///
    /// A packet arriving after a terminal state opens the next turn. Rejected
    /// packets leave the state machine and buffers as they were.
    pub fn accept_packet(&mut self, packet: Packet) -> Result<Accepted, PipelineError> {
        let state = self.machine.state();
        if state.is_processing() {
            return Err(PipelineError::Busy);
        }

        let report = if state.is_terminal() {
            let mut fresh = Self::reassembler_for(self.variant, &self.limits);
            let report = fresh.submit(packet)?;
            self.reset_turn(fresh);
            report
        } else {
            self.reassembler.submit(packet)?
        };

        let new_turn = self.machine.state() == SessionState::Idle;
        if new_turn {
            self.turn += 1;
            self.turn_started = Instant::now();
            self.turn_started_wall = now_rfc3339();
            self.transition(SessionState::Receiving)?;
        }

        let ready = if self.reassembler.is_complete() {
            Some(self.begin_processing()?)
        } else {
            None
        };

        Ok(Accepted {
            report,
            new_turn,
            ready,
        })
    }

    /// Explicit end-of-upload marker
    pub fn finalize(&mut self) -> Result<TurnInputs, PipelineError> {
        match self.machine.state() {
            SessionState::Receiving => {}
            state if state.is_processing() => return Err(PipelineError::Busy),
            _ => return Err(ReassemblyError::MissingChannel(Channel::Audio).into()),
        }
        self.reassembler.finalize()?;
        self.begin_processing()
    }

    fn begin_processing(&mut self) -> Result<TurnInputs, PipelineError> {
        let audio = self
            .reassembler
            .assemble(Channel::Audio)
            .ok_or(ReassemblyError::MissingChannel(Channel::Audio))?;
        let image = match self.variant {
            Variant::Audio => None,
            Variant::Multimodal => Some(
                self.reassembler
                    .assemble(Channel::Image)
                    .ok_or(ReassemblyError::MissingChannel(Channel::Image))?,
            ),
        };
        self.transition(SessionState::Transcribing)?;

        Ok(TurnInputs {
            session_id: self.id.clone(),
            turn: self.turn,
            variant: self.variant,
            audio,
            image,
            packets: self.reassembler.packets_received(),
            packets_declared: self.reassembler.packets_declared(),
            started: self.turn_started,
            started_wall: self.turn_started_wall.clone(),
        })
    }

    fn reset_turn(&mut self, reassembler: Reassembler) {
        self.machine = StateMachine::new();
        self.reassembler = reassembler;
        self.transcript.clear();
        self.response.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            variant: self.variant,
            turn: self.turn,
            state: self.machine.state(),
            packets_received: self.reassembler.packets_received(),
            packets_declared: self.reassembler.packets_declared(),
            age_seconds: self.created.elapsed().as_secs_f64(),
            created_at: self.created_at.clone(),
        }
    }
}
