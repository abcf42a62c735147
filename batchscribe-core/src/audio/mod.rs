//! Audio decoding for in-process backends.
//!
//! Only PCM/float WAV is decoded here (via `hound`). Other container formats
//! are expected to be converted upstream; in-process backends reject them
//! with `ScribeError::UnsupportedAudio`, which fails that item only.

pub mod resample;

use std::path::Path;

use tracing::debug;

use crate::error::{Result, ScribeError};

use self::resample::RateConverter;

/// Sample rate every Whisper-family model expects.
pub const MODEL_SAMPLE_RATE: u32 = 16_000;

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 44100, 48000).
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this clip in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert to `target_rate`, returning `self` untouched when rates match.
    pub fn resampled(self, target_rate: u32) -> Result<Self> {
        if self.sample_rate == target_rate {
            return Ok(self);
        }
        let mut rc = RateConverter::new(self.sample_rate, target_rate, 1024)?;
        let mut out = rc.process(&self.samples);
        out.extend(rc.finish());
        Ok(Self::new(out, target_rate))
    }

    /// Split into consecutive windows of at most `max_samples`.
    pub fn windows(&self, max_samples: usize) -> impl Iterator<Item = &[f32]> {
        self.samples.chunks(max_samples.max(1))
    }
}

/// Decode a WAV file into a mono clip (channels averaged).
///
/// # Errors
/// `UnsupportedAudio` for non-WAV extensions, `Inference` for undecodable data.
pub fn read_wav_mono(path: &Path) -> Result<AudioClip> {
    let is_wav = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);
    if !is_wav {
        return Err(ScribeError::UnsupportedAudio {
            path: path.to_path_buf(),
        });
    }

    let decode_err = |e: hound::Error| ScribeError::Inference(format!("{}: {e}", path.display()));
    let mut reader = hound::WavReader::open(path).map_err(decode_err)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            // Full scale is 2^(bits-1) at every depth, 8-bit included.
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(decode_err)?
        }
    };

    debug!(
        path = ?path,
        channels,
        sample_rate = spec.sample_rate,
        frames = interleaved.len() / channels,
        "decoded wav"
    );

    if channels == 1 {
        return Ok(AudioClip::new(interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok(AudioClip::new(mono, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, channels: u16, rate: u32, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for &s in frames {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();
    }

    #[test]
    fn stereo_is_downmixed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.wav");
        write_wav(&path, 2, 16_000, &[i16::MAX, 0, 0, i16::MAX, i16::MAX, i16::MAX]);

        let clip = read_wav_mono(&path).unwrap();
        assert_eq!(clip.sample_rate, 16_000);
        assert_eq!(clip.samples.len(), 3);
        assert!((clip.samples[0] - 0.5).abs() < 1e-4);
        assert!((clip.samples[2] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn eight_bit_pcm_uses_full_scale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("u8.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 8,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(&path, spec).unwrap();
        for s in [64_i8, -128, 127] {
            w.write_sample(s).unwrap();
        }
        w.finalize().unwrap();

        let clip = read_wav_mono(&path).unwrap();
        assert!((clip.samples[0] - 0.5).abs() < 1e-3, "{:?}", clip.samples);
        assert!((clip.samples[1] + 1.0).abs() < 1e-3);
        assert!(clip.samples[2] > 0.99);
    }

    #[test]
    fn non_wav_is_unsupported() {
        let err = read_wav_mono(Path::new("a.mp3")).unwrap_err();
        assert!(matches!(err, ScribeError::UnsupportedAudio { .. }));
    }

    #[test]
    fn corrupt_wav_is_inference_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.wav");
        std::fs::write(&path, b"RIFFnope").unwrap();
        assert!(matches!(
            read_wav_mono(&path).unwrap_err(),
            ScribeError::Inference(_)
        ));
    }

    #[test]
    fn resampled_clip_has_expected_length() {
        let clip = AudioClip::new(vec![0.0; 48_000], 48_000);
        let out = clip.resampled(MODEL_SAMPLE_RATE).unwrap();
        assert_eq!(out.sample_rate, MODEL_SAMPLE_RATE);
        assert!(
            (out.samples.len() as isize - 16_000).unsigned_abs() <= 400,
            "len={}",
            out.samples.len()
        );
        assert!((out.duration_secs() - 1.0).abs() < 0.05);
    }

    #[test]
    fn windows_cover_all_samples() {
        let clip = AudioClip::new(vec![0.0; 25], 16_000);
        let lens: Vec<_> = clip.windows(10).map(<[f32]>::len).collect();
        assert_eq!(lens, vec![10, 10, 5]);
    }
}
