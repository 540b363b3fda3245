//! RIFF/WAVE parsing for TTS responses.
//!
//! Providers that answer with WAV get their header fields trusted over any
//! configured sample rate. Headers are not assumed to be 44 bytes; the
//! `data` chunk is located by walking the chunk list, which also skips the
//! `LIST`/`fact` chunks some encoders insert.

use thiserror::Error;

use crate::audio::pcm16_from_le_bytes;

/// Errors raised while interpreting a WAV payload.
#[derive(Debug, Error)]
pub enum WavError {
    #[error("payload too short to be a WAV file ({0} bytes)")]
    Truncated(usize),

    #[error("missing RIFF/WAVE magic")]
    NotRiff,

    #[error("no data chunk found")]
    MissingData,

    #[error("unsupported bit depth: {0} (only 16-bit PCM is accepted)")]
    UnsupportedBitDepth(u16),

    #[error("channel count of zero")]
    NoChannels,
}

/// Decoded WAV payload: mono 16-bit PCM plus the header's sample rate.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Parses a WAV byte buffer into mono PCM.
///
/// Multi-channel audio is downmixed by averaging. Bit depths other than 16
/// are rejected so the failure surfaces as a per-turn synthesis error
/// rather than garbled audio on the wire.
pub fn parse_wav(bytes: &[u8]) -> Result<WavAudio, WavError> {
    if bytes.len() < 44 {
        return Err(WavError::Truncated(bytes.len()));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(WavError::NotRiff);
    }

    let channels = u16::from_le_bytes([bytes[22], bytes[23]]);
    let sample_rate = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
    let bits_per_sample = u16::from_le_bytes([bytes[34], bytes[35]]);

    if bits_per_sample != 16 {
        return Err(WavError::UnsupportedBitDepth(bits_per_sample));
    }
    if channels == 0 {
        return Err(WavError::NoChannels);
    }

    let data = find_data_chunk(bytes).ok_or(WavError::MissingData)?;
    let interleaved = pcm16_from_le_bytes(data);

    let samples = if channels == 1 {
        interleaved
    } else {
        downmix(&interleaved, channels as usize)
    };

    Ok(WavAudio {
        samples,
        sample_rate,
    })
}

/// Walks RIFF chunks starting after the 12-byte file header and returns the
/// payload of the first `data` chunk.
fn find_data_chunk(bytes: &[u8]) -> Option<&[u8]> {
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body = offset + 8;

        if id == b"data" {
            let end = (body + size).min(bytes.len());
            return Some(&bytes[body..end]);
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        offset = body + size + (size & 1);
    }
    None
}

fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
