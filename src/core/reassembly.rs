//! Out-of-order packet reassembly.
//!
//! Clients upload an utterance (and, on the multimodal channel, an image) as a
//! sequence of numbered packets. Each logical channel gets one
//! [`ReassemblyBuffer`], a fixed slot array sized by the first packet's declared
//! total. Completion is decided purely by slot occupancy, so arrival order does
//! not matter.
//!
//! Two completion modes are supported per channel:
//!
//! - [`CompletionMode::WhenFull`]: the channel completes as soon as every slot
//!   is filled (audio-only conversations).
//! - [`CompletionMode::OnFinalize`]: the channel additionally waits for an
//!   explicit finalize call (the multimodal `{"type":"end"}` marker).

use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Audio packet bound for the audio-only channel (8 KiB)
pub const AUDIO_PACKET_MAX_BYTES: usize = 8 * 1024;

/// Packet bound for the multimodal channel (50 KiB)
pub const MULTIMODAL_PACKET_MAX_BYTES: usize = 50 * 1024;

/// Default ceiling on a declared packet total
pub const DEFAULT_MAX_TOTAL_PACKETS: u32 = 4096;

// =============================================================================
// Types
// =============================================================================

/// Logical upload channel of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Audio,
    Image,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Audio => "audio",
            Channel::Image => "image",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a channel counts as complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    WhenFull,
    OnFinalize,
}

/// A single uploaded packet. `seq` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub channel: Channel,
    pub seq: u32,
    pub total: u32,
    pub payload: Bytes,
}

/// Per-channel limits and completion behaviour
#[derive(Debug, Clone, Copy)]
pub struct ChannelPolicy {
    pub max_packet_bytes: usize,
    pub max_total_packets: u32,
    pub mode: CompletionMode,
}

/// Result of an accepted submission, echoed back to the client as an ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub channel: Channel,
    pub seq: u32,
    pub received: u32,
    pub total: u32,
    pub duplicate: bool,
    pub buffer_complete: bool,
}

/// Per-packet rejection. None of these end the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Declared total must be at least 1")]
    InvalidTotal,

    #[error("Sequence number {seq} outside [1, {total}]")]
    OutOfRange { seq: u32, total: u32 },

    #[error("Packet payload of {size} bytes exceeds the {limit} byte bound")]
    Oversized { size: usize, limit: usize },

    #[error("Declared total {got} conflicts with established total {expected}")]
    TotalMismatch { expected: u32, got: u32 },

    #[error("Declared total {total} exceeds the {limit} packet ceiling")]
    TooManyPackets { total: u32, limit: u32 },

    #[error("Channel '{0}' is not accepted on this connection")]
    UnsupportedChannel(Channel),

    #[error("Channel '{0}' has not received any packets")]
    MissingChannel(Channel),

    #[error("Channel '{channel}' incomplete: {received}/{total} packets")]
    Incomplete {
        channel: Channel,
        received: u32,
        total: u32,
    },
}

impl ReassemblyError {
    /// Machine-readable code sent in the client `error` event
    pub fn code(&self) -> &'static str {
        match self {
            ReassemblyError::InvalidTotal | ReassemblyError::UnsupportedChannel(_) => {
                "malformed_packet"
            }
            ReassemblyError::OutOfRange { .. } => "out_of_range",
            ReassemblyError::Oversized { .. } => "oversized_packet",
            ReassemblyError::TotalMismatch { .. } => "total_mismatch",
            ReassemblyError::TooManyPackets { .. } => "too_many_packets",
            ReassemblyError::MissingChannel(_) | ReassemblyError::Incomplete { .. } => {
                "incomplete_upload"
            }
        }
    }
}

// =============================================================================
// ReassemblyBuffer
// =============================================================================

/// Fixed slot array for one channel
#[derive(Debug)]
pub struct ReassemblyBuffer {
    slots: Vec<Option<Bytes>>,
    received: u32,
    bytes: usize,
    mode: CompletionMode,
    finalized: bool,
}

impl ReassemblyBuffer {
    pub fn new(total: u32, mode: CompletionMode) -> Self {
        Self {
            slots: vec![None; total as usize],
            received: 0,
            bytes: 0,
            mode,
            finalized: false,
        }
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Sum of the currently stored payload sizes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Store `payload` at `seq`. Returns `true` when the slot was already
    /// occupied; the new payload replaces the old one without changing the
    /// received count.
    pub fn insert(&mut self, seq: u32, payload: Bytes) -> Result<bool, ReassemblyError> {
        let total = self.total();
        if seq == 0 || seq > total {
            return Err(ReassemblyError::OutOfRange { seq, total });
        }

        let slot = &mut self.slots[(seq - 1) as usize];
        let new_len = payload.len();
        match slot.replace(payload) {
            Some(previous) => {
                self.bytes = self.bytes - previous.len() + new_len;
                Ok(true)
            }
            None => {
                self.received += 1;
                self.bytes += new_len;
                Ok(false)
            }
        }
    }

    /// Every slot holds a payload
    pub fn is_full(&self) -> bool {
        self.received == self.total() && self.slots.iter().all(Option::is_some)
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn is_complete(&self) -> bool {
        self.is_full()
            && match self.mode {
                CompletionMode::WhenFull => true,
                CompletionMode::OnFinalize => self.finalized,
            }
    }

    /// Concatenate the slots in sequence order. `None` until full.
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_full() {
            return None;
        }
        let mut merged = BytesMut::with_capacity(self.bytes);
        for slot in self.slots.iter().flatten() {
            merged.extend_from_slice(slot);
        }
        Some(merged.freeze())
    }
}

// =============================================================================
// Reassembler
// =============================================================================

/// Reassembly state for every channel of one session turn.
///
/// Owned by a single session and mutated under that session's lock only.
#[derive(Debug)]
pub struct Reassembler {
    policies: Vec<(Channel, ChannelPolicy)>,
    buffers: HashMap<Channel, ReassemblyBuffer>,
    packets_received: u64,
}

impl Reassembler {
    pub fn new(policies: Vec<(Channel, ChannelPolicy)>) -> Self {
        Self {
            policies,
            buffers: HashMap::new(),
            packets_received: 0,
        }
    }

    /// Audio-only channel completing when its slots are full
    pub fn audio_only(max_packet_bytes: usize, max_total_packets: u32) -> Self {
        Self::new(vec![(
            Channel::Audio,
            ChannelPolicy {
                max_packet_bytes,
                max_total_packets,
                mode: CompletionMode::WhenFull,
            },
        )])
    }

    /// Audio plus image channels, both waiting for an explicit finalize
    pub fn multimodal(max_packet_bytes: usize, max_total_packets: u32) -> Self {
        let policy = ChannelPolicy {
            max_packet_bytes,
            max_total_packets,
            mode: CompletionMode::OnFinalize,
        };
        Self::new(vec![(Channel::Audio, policy), (Channel::Image, policy)])
    }

    fn policy(&self, channel: Channel) -> Option<ChannelPolicy> {
        self.policies
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, p)| *p)
    }

    /// Validate and store a packet.
    ///
    /// A rejected packet leaves every buffer untouched, including allocation:
    /// a channel's total is only fixed by its first accepted packet.
    pub fn submit(&mut self, packet: Packet) -> Result<SubmitReport, ReassemblyError> {
        let policy = self
            .policy(packet.channel)
            .ok_or(ReassemblyError::UnsupportedChannel(packet.channel))?;

        if packet.total == 0 {
            return Err(ReassemblyError::InvalidTotal);
        }
        if packet.total > policy.max_total_packets {
            return Err(ReassemblyError::TooManyPackets {
                total: packet.total,
                limit: policy.max_total_packets,
            });
        }
        if let Some(existing) = self.buffers.get(&packet.channel)
            && existing.total() != packet.total
        {
            return Err(ReassemblyError::TotalMismatch {
                expected: existing.total(),
                got: packet.total,
            });
        }
        if packet.seq == 0 || packet.seq > packet.total {
            return Err(ReassemblyError::OutOfRange {
                seq: packet.seq,
                total: packet.total,
            });
        }
        if packet.payload.len() > policy.max_packet_bytes {
            return Err(ReassemblyError::Oversized {
                size: packet.payload.len(),
                limit: policy.max_packet_bytes,
            });
        }

        let buffer = self
            .buffers
            .entry(packet.channel)
            .or_insert_with(|| ReassemblyBuffer::new(packet.total, policy.mode));
        let duplicate = buffer.insert(packet.seq, packet.payload)?;
        self.packets_received += 1;

        Ok(SubmitReport {
            channel: packet.channel,
            seq: packet.seq,
            received: buffer.received(),
            total: buffer.total(),
            duplicate,
            buffer_complete: buffer.is_full(),
        })
    }

    /// Mark every channel finalized.
    ///
    /// Fails without side effects unless all configured channels are declared
    /// and full.
    pub fn finalize(&mut self) -> Result<(), ReassemblyError> {
        for (channel, _) in &self.policies {
            let buffer = self
                .buffers
                .get(channel)
                .ok_or(ReassemblyError::MissingChannel(*channel))?;
            if !buffer.is_full() {
                return Err(ReassemblyError::Incomplete {
                    channel: *channel,
                    received: buffer.received(),
                    total: buffer.total(),
                });
            }
        }
        for buffer in self.buffers.values_mut() {
            buffer.finalize();
        }
        Ok(())
    }

    /// All configured channels are present and complete
    pub fn is_complete(&self) -> bool {
        self.policies.iter().all(|(channel, _)| {
            self.buffers
                .get(channel)
                .is_some_and(ReassemblyBuffer::is_complete)
        })
    }

    pub fn buffer(&self, channel: Channel) -> Option<&ReassemblyBuffer> {
        self.buffers.get(&channel)
    }

    /// Merged payload of a full channel
    pub fn assemble(&self, channel: Channel) -> Option<Bytes> {
        self.buffers.get(&channel).and_then(ReassemblyBuffer::assemble)
    }

    /// Accepted packets across all channels, duplicates included
    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    /// Sum of the declared totals of every channel seen so far
    pub fn packets_declared(&self) -> u64 {
        self.buffers.values().map(|b| b.total() as u64).sum()
    }

    /// Drop every buffer
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.packets_received = 0;
    }
}
