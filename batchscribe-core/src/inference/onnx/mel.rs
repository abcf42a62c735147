//! Whisper log-mel frontend.
//!
//! | Parameter       | Value          |
//! |-----------------|----------------|
//! | Hann window     | 400 samples    |
//! | FFT size        | 400            |
//! | Frequency bins  | 201 (400/2+1)  |
//! | Hop length      | 160 (10 ms)    |
//! | Mel bands       | 80 (or what the encoder declares) |
//! | Mel range       | 0–8 000 Hz     |
//! | Frames          | 3 000 (30 s)   |

use std::sync::Arc;

use ndarray::Array3;
use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::audio::MODEL_SAMPLE_RATE;

pub const N_FFT: usize = 400;
const N_FREQS: usize = N_FFT / 2 + 1;
pub const HOP: usize = 160;
pub const DEFAULT_N_MELS: usize = 80;
pub const N_FRAMES: usize = 3_000;
/// Samples in one 30 s encoder window at 16 kHz.
pub const WINDOW_SAMPLES: usize = N_FRAMES * HOP;

pub struct MelFrontend {
    n_mels: usize,
    filters: Vec<Vec<f32>>,
    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl MelFrontend {
    pub fn new(n_mels: usize) -> Self {
        Self {
            n_mels,
            filters: build_mel_filters(N_FFT, MODEL_SAMPLE_RATE, n_mels, 0.0, 8_000.0),
            hann: build_hann_window(N_FFT),
            fft: FftPlanner::<f32>::new().plan_fft_forward(N_FFT),
        }
    }

    /// `[1, n_mels, 3000]` features for up to 30 s of 16 kHz audio.
    ///
    /// Shorter input is zero-padded; frames past the active audio are left
    /// at the padding floor without running the FFT.
    pub fn features(&self, window: &[f32]) -> Array3<f32> {
        let active = window.len().min(WINDOW_SAMPLES);
        let mut samples = window[..active].to_vec();
        normalize_rms_in_place(&mut samples, 0.10);
        samples.resize(WINDOW_SAMPLES, 0.0);

        let centered = reflect_pad(&samples, N_FFT / 2);
        let active_frames = ((active + N_FFT + HOP - 1) / HOP).clamp(1, N_FRAMES);

        let mut mel = Array3::<f32>::zeros((1, self.n_mels, N_FRAMES));
        let mut buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        for frame in 0..active_frames {
            let start = frame * HOP;
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = Complex::new(centered[start + i] * self.hann[i], 0.0);
            }
            self.fft.process(&mut buf);

            for (m, filter) in self.filters.iter().enumerate() {
                let energy: f32 = filter
                    .iter()
                    .zip(&buf[..N_FREQS])
                    .map(|(w, c)| w * c.norm_sqr())
                    .sum();
                mel[[0, m, frame]] = energy;
            }
        }

        mel.mapv_inplace(|v| v.max(1e-10).log10());
        let max_val = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        mel.mapv_inplace(|v| (v.max(max_val - 8.0) + 4.0) / 4.0);
        mel
    }
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

/// Slaney-normalised triangular filters, `[n_mels][n_fft/2 + 1]`.
fn build_mel_filters(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let hz_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (hz_pts[m], hz_pts[m + 1], hz_pts[m + 2]);
            let enorm = 2.0 / (upper - lower).max(1e-10);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * sr as f32 / fft_size as f32;
                    let w = if freq >= lower && freq <= center {
                        (freq - lower) / (center - lower).max(1e-10)
                    } else if freq > center && freq <= upper {
                        (upper - freq) / (upper - center).max(1e-10)
                    } else {
                        0.0
                    };
                    (w * enorm).max(0.0)
                })
                .collect()
        })
        .collect()
}

fn normalize_rms_in_place(samples: &mut [f32], target_rms: f32) {
    if samples.is_empty() {
        return;
    }
    let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
    if rms <= 1e-6 {
        return;
    }
    let gain = (target_rms / rms).clamp(0.8, 15.0);
    if (gain - 1.0).abs() < 1e-3 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    match samples.len() {
        0 => vec![0.0; pad * 2],
        1 => vec![samples[0]; 1 + pad * 2],
        len => {
            let max = len as isize - 1;
            (-(pad as isize)..(len + pad) as isize)
                .map(|mut i| {
                    while i < 0 || i > max {
                        i = if i < 0 { -i } else { 2 * max - i };
                    }
                    samples[i as usize]
                })
                .collect()
        }
    }
}

const F_SP: f32 = 200.0 / 3.0;
const MIN_LOG_HZ: f32 = 1_000.0;
const MIN_LOG_MEL: f32 = MIN_LOG_HZ / F_SP;

fn log_step() -> f32 {
    6.4_f32.ln() / 27.0
}

fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}
