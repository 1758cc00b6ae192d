//! Segment encoders for 16-bit little-endian mono PCM.
//!
//! Encoders are stateful: an odd trailing byte from one call is carried into
//! the next so a sample is never split across output chunks. This is why a
//! session's frames must pass through a single encoder in order.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use bytes::Bytes;

use super::TranscodeError;

/// Configured output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncoderKind {
    /// Each segment is a self-contained WAV file
    #[default]
    Wav,
    /// G.711 mu-law, one byte per sample
    Mulaw,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Wav => "wav",
            EncoderKind::Mulaw => "mulaw",
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wav" => Ok(EncoderKind::Wav),
            "mulaw" | "ulaw" | "pcmu" => Ok(EncoderKind::Mulaw),
            other => Err(format!(
                "Unknown encoder '{other}', expected 'wav' or 'mulaw'"
            )),
        }
    }
}

/// Converts PCM segments into the configured compact format
pub trait SegmentEncoder: Send {
    /// Format label reported to clients
    fn format(&self) -> &'static str;

    /// Encode one segment. May return an empty buffer when `pcm` holds less
    /// than a full sample.
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, TranscodeError>;
}

pub fn create_encoder(kind: EncoderKind, sample_rate: u32) -> Box<dyn SegmentEncoder> {
    match kind {
        EncoderKind::Wav => Box::new(WavSegmentEncoder::new(sample_rate)),
        EncoderKind::Mulaw => Box::new(MulawEncoder::default()),
    }
}

/// Carries a dangling byte between calls and yields whole samples
#[derive(Debug, Default)]
struct SampleCarry {
    pending: Option<u8>,
}

impl SampleCarry {
    fn samples(&mut self, pcm: &[u8]) -> Vec<i16> {
        let mut joined;
        let bytes: &[u8] = match self.pending.take() {
            Some(first) => {
                joined = Vec::with_capacity(pcm.len() + 1);
                joined.push(first);
                joined.extend_from_slice(pcm);
                &joined
            }
            None => pcm,
        };

        let chunks = bytes.chunks_exact(2);
        if let [last] = chunks.remainder() {
            self.pending = Some(*last);
        }
        chunks
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }
}

// =============================================================================
// WAV
// =============================================================================

#[derive(Debug)]
pub struct WavSegmentEncoder {
    spec: hound::WavSpec,
    carry: SampleCarry,
}

impl WavSegmentEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            spec: hound::WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            carry: SampleCarry::default(),
        }
    }
}

impl SegmentEncoder for WavSegmentEncoder {
    fn format(&self) -> &'static str {
        "wav"
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, TranscodeError> {
        let samples = self.carry.samples(pcm);
        if samples.is_empty() {
            return Ok(Bytes::new());
        }

        let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, self.spec)
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
            for sample in samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| TranscodeError::Encode(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| TranscodeError::Encode(e.to_string()))?;
        }
        Ok(Bytes::from(cursor.into_inner()))
    }
}

// =============================================================================
// mu-law
// =============================================================================

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// G.711 mu-law compression of one sample
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(MULAW_CLIP) + MULAW_BIAS;

    let exponent = (31 - (magnitude as u32).leading_zeros() as i32 - 7).clamp(0, 7);
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

#[derive(Debug, Default)]
pub struct MulawEncoder {
    carry: SampleCarry,
}

impl SegmentEncoder for MulawEncoder {
    fn format(&self) -> &'static str {
        "mulaw"
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, TranscodeError> {
        let encoded: Vec<u8> = self
            .carry
            .samples(pcm)
            .into_iter()
            .map(linear_to_mulaw)
            .collect();
        Ok(Bytes::from(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_mulaw_reference_values() {
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(linear_to_mulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_mulaw(-32768), 0x00);
        assert_eq!(linear_to_mulaw(-1), 0x7F);
    }

    #[test]
    fn test_mulaw_halves_size() {
        let mut encoder = MulawEncoder::default();
        let out = encoder.encode(&pcm(&[0, 100, -100, 1000])).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(encoder.format(), "mulaw");
    }

    #[test]
    fn test_odd_byte_carried_to_next_segment() {
        let mut encoder = MulawEncoder::default();
        let bytes = pcm(&[0, 0, 0]);
        let first = encoder.encode(&bytes[..3]).unwrap();
        assert_eq!(first.len(), 1);
        let second = encoder.encode(&bytes[3..]).unwrap();
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_wav_segment_is_readable() {
        let mut encoder = WavSegmentEncoder::new(24_000);
        let samples = [1i16, -2, 300, -400];
        let out = encoder.encode(&pcm(&samples)).unwrap();
        assert_eq!(&out[..4], b"RIFF");

        let reader = hound::WavReader::new(Cursor::new(out.to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_wav_empty_input() {
        let mut encoder = WavSegmentEncoder::new(24_000);
        assert!(encoder.encode(&[7]).unwrap().is_empty());
    }

    #[test]
    fn test_encoder_kind_parse() {
        assert_eq!("WAV".parse::<EncoderKind>().unwrap(), EncoderKind::Wav);
        assert_eq!("ulaw".parse::<EncoderKind>().unwrap(), EncoderKind::Mulaw);
        assert!("mp3".parse::<EncoderKind>().is_err());
        assert_eq!(create_encoder(EncoderKind::Mulaw, 8000).format(), "mulaw");
    }
}
