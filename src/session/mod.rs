//! Conversation sessions.
//!
//! - [`state`]: the per-turn state machine
//! - [`context`]: one connection's buffers, transcripts and turn counter
//! - [`pipeline`]: the collaborator chain of a single turn
//! - [`manager`]: the registry of live sessions
//! - [`events`]: client events and their wire profiles
//! - [`segmenter`]: sentence batching of chat deltas

pub mod context;
pub mod error;
pub mod events;
pub mod manager;
pub mod pipeline;
pub mod segmenter;
pub mod state;

pub use context::{Session, SessionLimits, SessionSnapshot, StreamingTranscript, TurnInputs};
pub use error::PipelineError;
pub use events::{EventSink, SessionEvent, TurnSummary, Variant, WireProfile};
pub use manager::SessionManager;
pub use pipeline::{PipelineDeps, PipelineSettings, TurnHandle, run_turn};
pub use segmenter::SentenceSegmenter;
pub use state::{InvalidTransition, SessionState, StateMachine};
