//! WAV and raw PCM conversion for wire payloads.

use crate::audio::dsp;
use crate::error::{Result, VoiceError};

/// Decoded response audio, mono f32.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Encode f32 samples as a 16-bit PCM WAV file.
///
/// # Errors
///
/// Returns an error if WAV encoding fails.
pub fn encode_pcm16(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| VoiceError::Audio(e.to_string()))?;
        for &sample in samples {
            writer
                .write_sample(dsp::f32_to_i16(sample))
                .map_err(|e| VoiceError::Audio(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| VoiceError::Audio(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Decode backend audio into mono f32 samples.
///
/// RIFF/WAV input is parsed with its own header. Anything else is treated
/// as raw little-endian 16-bit mono PCM at `raw_sample_rate`.
///
/// # Errors
///
/// Returns an error if the input is empty or the WAV payload is malformed.
pub fn decode_audio(bytes: &[u8], raw_sample_rate: u32) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Err(VoiceError::Audio("response audio is empty".into()));
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        return decode_wav(bytes);
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Audio(format!(
            "raw PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| dsp::i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    Ok(DecodedAudio {
        samples,
        sample_rate: raw_sample_rate,
    })
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .map_err(|e| VoiceError::Audio(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoiceError::Audio(format!("invalid WAV samples: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoiceError::Audio(format!("invalid WAV samples: {e}")))?
        }
    };

    Ok(DecodedAudio {
        samples: dsp::to_mono(&interleaved, spec.channels),
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn wav_encode_decode_preserves_rate_and_length() {
        let samples: Vec<f32> = (0..1600).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        let wav = encode_pcm16(&samples, 16_000, 1).expect("encode");
        assert_eq!(&wav[0..4], b"RIFF");

        let decoded = decode_audio(&wav, 8_000).expect("decode");
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), samples.len());
        assert!((decoded.samples[100] - samples[100]).abs() < 1e-3);
    }

    #[test]
    fn stereo_wav_is_mixed_down() {
        let wav = encode_pcm16(&[0.5, 0.0, 0.5, 0.0], 24_000, 2).expect("encode");
        let decoded = decode_audio(&wav, 16_000).expect("decode");
        assert_eq!(decoded.samples.len(), 2);
        assert!((decoded.samples[0] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn raw_pcm_uses_fallback_rate() {
        let raw: Vec<u8> = [16384_i16, -16384].iter().flat_map(|s| s.to_le_bytes()).collect();
        let decoded = decode_audio(&raw, 16_000).expect("decode");
        assert_eq!(decoded.sample_rate, 16_000);
        assert!((decoded.samples[0] - 0.5).abs() < 1e-3);
        assert!((decoded.samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn odd_raw_payload_is_rejected() {
        assert!(decode_audio(&[1, 2, 3], 16_000).is_err());
        assert!(decode_audio(&[], 16_000).is_err());
    }
}
