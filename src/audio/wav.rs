//! WAV container validation, decoding and encoding

use std::io::Cursor;
use std::path::Path;

use tokio::io::AsyncReadExt;

use super::AudioBuffer;
use crate::{Error, Result};

/// Bytes inspected by header validation
pub const HEADER_LEN: usize = 12;

/// Check a RIFF/WAVE header: `RIFF` at offset 0 and `WAVE` at offset 8
///
/// Bytes 4..8 (the chunk size) are not inspected.
///
/// # Errors
///
/// Returns `Error::Format` if the prefix is short or does not match
pub fn validate_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Format(format!(
            "expected at least {HEADER_LEN} header bytes, got {}",
            bytes.len()
        )));
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(Error::Format(format!(
            "missing RIFF marker (found {:02x?})",
            &bytes[0..4]
        )));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(Error::Format(format!(
            "missing WAVE marker (found {:02x?})",
            &bytes[8..12]
        )));
    }
    Ok(())
}

/// True if `bytes` starts with a RIFF/WAVE header
#[must_use]
pub fn is_wav(bytes: &[u8]) -> bool {
    validate_header(bytes).is_ok()
}

/// Read the first 12 bytes of a staged file and validate them
///
/// # Errors
///
/// Returns `Error::Format` for a short or foreign header, `Error::Io` if the
/// file cannot be opened
pub async fn validate_file(path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = [0u8; HEADER_LEN];
    match file.read_exact(&mut header).await {
        Ok(_) => validate_header(&header),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Format(format!(
            "{} is shorter than a WAV header",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Decode an uncompressed WAV file into an `AudioBuffer`
///
/// Integer PCM of 8 to 32 bits and 32-bit float are supported.
///
/// # Errors
///
/// Returns `Error::Format` if the header is wrong, `Error::Decode` if the
/// body is corrupt, uses an unsupported encoding, or holds no samples
#[allow(clippy::cast_precision_loss)]
pub fn decode(bytes: &[u8]) -> Result<AudioBuffer> {
    validate_header(bytes)?;

    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?,
        (hound::SampleFormat::Int, bits @ 8..=32) => {
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(e.to_string()))?
        }
        (format, bits) => {
            return Err(Error::Decode(format!(
                "unsupported sample encoding: {format:?} at {bits} bits"
            )));
        }
    };

    if samples.is_empty() {
        return Err(Error::Decode("WAV file contains no samples".to_string()));
    }

    let buffer = AudioBuffer::new(samples, spec.channels, spec.sample_rate)?;

    tracing::debug!(
        channels = buffer.channels(),
        sample_rate = buffer.sample_rate(),
        frames = buffer.frames(),
        "decoded WAV"
    );

    Ok(buffer)
}

/// Encode mono f32 samples as 16-bit PCM WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn encode_mono(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
