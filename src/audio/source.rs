//! WAV audio source for one transcription run.
//!
//! The whole encoded file is held in memory: backends hash it, upload it,
//! or stream it out in chunks, and concurrent pump tasks share the buffer
//! read-only.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// PCM format parameters passed along to recognition backends.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("not a usable WAV file '{path}': {source}")]
    Wav {
        path: String,
        source: hound::Error,
    },
}

/// An opened audio file: format metadata plus the full encoded byte buffer.
pub struct AudioSource {
    format: AudioFormat,
    total_samples: u32,
    bytes: Arc<[u8]>,
}

impl AudioSource {
    /// Read and validate a WAV file. The byte buffer keeps the complete
    /// container, header included, since that is what gets uploaded.
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        let display = path.to_string_lossy().into_owned();
        let bytes = std::fs::read(path).map_err(|source| AudioError::Read {
            path: display.clone(),
            source,
        })?;
        let (format, total_samples) = {
            let reader = hound::WavReader::new(Cursor::new(&bytes)).map_err(|source| {
                AudioError::Wav {
                    path: display,
                    source,
                }
            })?;
            let spec = reader.spec();
            (
                AudioFormat {
                    sample_rate: spec.sample_rate,
                    channels: spec.channels,
                    bits_per_sample: spec.bits_per_sample,
                },
                reader.duration(),
            )
        };
        Ok(Self {
            format,
            total_samples,
            bytes: bytes.into(),
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    /// Playback length derived from the per-channel sample count.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.total_samples) / f64::from(self.format.sample_rate))
    }

    /// The complete encoded file, shareable with pump tasks.
    pub fn bytes(&self) -> Arc<[u8]> {
        self.bytes.clone()
    }

    /// Streaming frame size: the file divided into roughly 50 chunks,
    /// bounded to the backends' frame limits.
    pub fn chunk_size(&self) -> usize {
        chunk_size(self.bytes.len())
    }
}

/// Clamp `total_len / 50` into the 4 KiB..32767-byte frame window.
pub fn chunk_size(total_len: usize) -> usize {
    (total_len / 50).clamp(4096, 32767)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_wav(dir: &tempfile::TempDir, samples: &[i16]) -> std::path::PathBuf {
        let path = dir.path().join("tone.wav");
        let mut writer = hound::WavWriter::create(
            &path,
            hound::WavSpec {
                channels: 1,
                sample_rate: 16000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
        )
        .unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn open_reads_format_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, &[0i16; 16000]);
        let source = AudioSource::open(&path).unwrap();
        assert_eq!(source.sample_rate(), 16000);
        assert_eq!(source.format().channels, 1);
        assert_eq!(source.format().bits_per_sample, 16);
        assert_eq!(source.duration(), Duration::from_secs(1));
        assert!(source.bytes().len() > 16000); // header + 2 bytes per sample
    }

    #[test]
    fn open_rejects_non_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not.wav");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"definitely not audio").unwrap();
        assert!(matches!(
            AudioSource::open(&path),
            Err(AudioError::Wav { .. })
        ));
    }

    #[test]
    fn open_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AudioSource::open(&dir.path().join("absent.wav")),
            Err(AudioError::Read { .. })
        ));
    }

    #[test]
    fn chunk_size_clamps_to_frame_window() {
        assert_eq!(chunk_size(0), 4096);
        assert_eq!(chunk_size(200_000), 4096);
        assert_eq!(chunk_size(500_000), 10_000);
        assert_eq!(chunk_size(10_000_000), 32767);
    }
}
