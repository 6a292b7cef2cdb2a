//! Audio loading and the log-mel front end.
//!
//! Qwen3-ASR uses the Whisper-family feature extractor: 16 kHz mono,
//! 400-point FFT with a 160-sample hop, 128 Slaney-scale mel bins,
//! log10 magnitudes clamped to an 8 dB dynamic range and rescaled.
//! The encoder consumes the result as `[mel_bins, frames]` with
//! `frames = n_samples / hop_length`.

use crate::config::MelConfig;
use crate::error::{Error, Result};
use hound::{WavReader, WavSpec};
use ndarray::Array2;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;
use std::path::Path;

pub fn load_audio<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, WavSpec)> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("failed to read float samples: {e}")))?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|s| s as f32 / 32768.0))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Audio(format!("failed to read int samples: {e}")))?,
    };

    Ok((samples, spec))
}

/// Average interleaved channels down to mono.
pub fn mixdown(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|c| c.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn hann_window(window_length: usize) -> Vec<f32> {
    (0..window_length)
        .map(|i| 0.5 - 0.5 * ((2.0 * PI * i as f32) / (window_length as f32 - 1.0)).cos())
        .collect()
}

/// Centered power-spectrogram STFT. Output is `[n_fft/2 + 1, frames]`.
fn stft(audio: &[f32], n_fft: usize, hop_length: usize) -> Array2<f32> {
    let pad_amount = n_fft / 2;
    let mut padded = vec![0.0f32; pad_amount];
    padded.extend_from_slice(audio);
    padded.resize(padded.len() + pad_amount, 0.0);

    let window = hann_window(n_fft);
    let num_frames = (padded.len() - n_fft) / hop_length + 1;
    let freq_bins = n_fft / 2 + 1;
    let mut spectrogram = Array2::<f32>::zeros((freq_bins, num_frames));

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);

    for frame_idx in 0..num_frames {
        let start = frame_idx * hop_length;

        let mut frame: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); n_fft];
        for i in 0..n_fft.min(padded.len() - start) {
            frame[i] = Complex::new(padded[start + i] * window[i], 0.0);
        }

        fft.process(&mut frame);

        for k in 0..freq_bins {
            let mag_sq = frame[k].norm_sqr();
            spectrogram[[k, frame_idx]] = if mag_sq.is_finite() { mag_sq } else { 0.0 };
        }
    }

    spectrogram
}

// Slaney mel scale, as librosa computes it.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
const LOG_STEP: f64 = 0.06875177742094912;

fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / F_SP
    } else {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / LOG_STEP
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * LOG_STEP).exp()
    }
}

pub fn create_mel_filterbank(n_fft: usize, n_mels: usize, sample_rate: usize) -> Array2<f32> {
    let freq_bins = n_fft / 2 + 1;
    let mut filterbank = Array2::<f32>::zeros((n_mels, freq_bins));

    let fmax = sample_rate as f64 / 2.0;
    let mel_min = hz_to_mel_slaney(0.0);
    let mel_max = hz_to_mel_slaney(fmax);

    let mel_points: Vec<f64> = (0..=n_mels + 1)
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let fft_freqs: Vec<f64> = (0..freq_bins)
        .map(|i| i as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let fdiff: Vec<f64> = mel_points.windows(2).map(|w| w[1] - w[0]).collect();

    for i in 0..n_mels {
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - mel_points[i]) / fdiff[i];
            let upper = (mel_points[i + 2] - freq) / fdiff[i + 1];
            filterbank[[i, k]] = 0.0f64.max(lower.min(upper)) as f32;
        }
    }

    // Slaney area normalization
    for i in 0..n_mels {
        let enorm = 2.0 / (mel_points[i + 2] - mel_points[i]);
        for k in 0..freq_bins {
            filterbank[[i, k]] *= enorm as f32;
        }
    }

    filterbank
}

/// Compute the log-mel spectrogram of mono 16 kHz samples.
///
/// Returns `[feature_size, frames]` with `frames = samples.len() / hop`.
pub fn mel_spectrogram(samples: &[f32], config: &MelConfig) -> Result<Array2<f32>> {
    if samples.is_empty() {
        return Err(Error::Audio("empty audio".into()));
    }

    let spec = stft(samples, config.n_fft, config.hop_length);
    let filterbank = create_mel_filterbank(config.n_fft, config.feature_size, config.sampling_rate);
    let mut mel = filterbank.dot(&spec);

    mel.mapv_inplace(|x| x.max(1e-10).log10());
    let global_max = mel.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    mel.mapv_inplace(|x| (x.max(global_max - 8.0) + 4.0) / 4.0);

    // The centered STFT yields one frame past the hop grid; drop it so the
    // frame count is exactly samples/hop.
    let frames = samples.len() / config.hop_length;
    let keep = frames.min(mel.shape()[1]);
    Ok(mel.slice_move(ndarray::s![.., ..keep]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_tracks_hop_grid() {
        let config = MelConfig::default();
        // 3.17 s at 16 kHz: 50720 samples, 317 frames.
        let samples = vec![0.0f32; 50720];
        let mel = mel_spectrogram(&samples, &config).unwrap();
        assert_eq!(mel.shape(), &[128, 317]);

        let one_sec = vec![0.0f32; 16000];
        let mel = mel_spectrogram(&one_sec, &config).unwrap();
        assert_eq!(mel.shape(), &[128, 100]);
    }

    #[test]
    fn empty_audio_is_an_error() {
        assert!(mel_spectrogram(&[], &MelConfig::default()).is_err());
    }

    #[test]
    fn silence_maps_to_the_floor_value() {
        let config = MelConfig::default();
        let mel = mel_spectrogram(&vec![0.0f32; 16000], &config).unwrap();
        // log10(1e-10) = -10, clamped to max-8 = -10 too, then (x+4)/4.
        for &v in mel.iter() {
            assert!((v - (-10.0 + 4.0) / 4.0).abs() < 1e-6);
        }
    }

    #[test]
    fn tone_lands_in_a_matching_mel_band() {
        let config = MelConfig::default();
        // 440 Hz sine, 1 s.
        let samples: Vec<f32> = (0..16000)
            .map(|i| (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let mel = mel_spectrogram(&samples, &config).unwrap();

        // The strongest bin in a mid-utterance frame should sit in the low
        // third of the mel axis (440 Hz out of an 8 kHz range).
        let frame = mel.column(50);
        let (best, _) = frame
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| {
                if v > acc.1 { (i, v) } else { acc }
            });
        assert!(best < 43, "peak bin {best}");
    }

    #[test]
    fn mixdown_averages_channels() {
        let stereo = [1.0f32, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(mixdown(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(mixdown(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn filterbank_rows_cover_the_spectrum() {
        let fb = create_mel_filterbank(400, 128, 16000);
        assert_eq!(fb.shape(), &[128, 201]);
        // Every filter has some mass and no negatives.
        for row in fb.rows() {
            assert!(row.iter().all(|&v| v >= 0.0));
            assert!(row.iter().any(|&v| v > 0.0));
        }
    }
}
