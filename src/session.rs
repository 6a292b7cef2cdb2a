//! ONNX Runtime session management.
//!
//! Some mobile ORT builds fail to load certain optimized graphs, so every
//! session is created through a fallback chain of graph-optimization
//! levels: the encoder goes straight to disable-all, the decoders prefer
//! basic fusions and accept disable-all. Memory pattern stays off — it
//! pre-allocates worst-case buffers and inflates RSS on exactly the
//! devices this engine targets.

use crate::error::{Error, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::{Path, PathBuf};

/// Decoder layer count upper bound; the probe rejects anything above it.
pub const MAX_DEC_LAYERS: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    DisableAll,
    Basic,
}

impl OptLevel {
    fn to_ort(self) -> GraphOptimizationLevel {
        match self {
            OptLevel::DisableAll => GraphOptimizationLevel::Disable,
            OptLevel::Basic => GraphOptimizationLevel::Level1,
        }
    }
}

pub const ENCODER_LEVELS: &[OptLevel] = &[OptLevel::DisableAll];
pub const DECODER_LEVELS: &[OptLevel] = &[OptLevel::Basic, OptLevel::DisableAll];

fn try_create(path: &Path, intra_threads: usize, level: OptLevel) -> ort::Result<Session> {
    Session::builder()?
        .with_optimization_level(level.to_ort())?
        .with_intra_threads(intra_threads)?
        .with_inter_threads(1)?
        .with_memory_pattern(false)?
        .commit_from_file(path)
}

/// Create a session, walking `levels` in order until one loads.
pub fn create_session_with_fallback(
    path: &Path,
    intra_threads: usize,
    levels: &[OptLevel],
) -> Result<Session> {
    let mut last_error = String::new();
    for &level in levels {
        log::debug!(
            "creating session (opt={level:?}, threads={intra_threads}) from {}",
            path.display()
        );
        match try_create(path, intra_threads, level) {
            Ok(session) => {
                log::debug!("session loaded (opt={level:?})");
                return Ok(session);
            }
            Err(e) => {
                log::warn!(
                    "session creation failed (opt={level:?}) for {}: {e}",
                    path.display()
                );
                last_error = e.to_string();
            }
        }
    }
    Err(Error::Model(format!(
        "session creation failed at every optimization level for {}: {last_error}",
        path.display()
    )))
}

/// Resolve a logical model name inside the model directory, preferring the
/// `.int8` quantized variant.
pub fn find_model(model_dir: &Path, base_name: &str) -> PathBuf {
    if let Some((stem, ext)) = base_name.rsplit_once('.') {
        let quantized = model_dir.join(format!("{stem}.int8.{ext}"));
        if quantized.is_file() {
            return quantized;
        }
    }
    model_dir.join(base_name)
}

/// Intra-op thread counts as `(encoder, decoder)`.
///
/// The encoder is a one-shot batch job and takes the wider fanout; the
/// autoregressive decoders stay conservative for memory stability.
pub fn thread_counts() -> (usize, usize) {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8);
    let encoder = cores.min(6);
    let decoder = if cores >= 6 { 3 } else { 2 };
    (encoder, decoder)
}

/// Derive the decoder layer count from the prefill session's output list:
/// one logits tensor plus a K and a V cache per layer.
pub fn decoder_layers(prefill: &Session) -> Result<usize> {
    let n_outputs = prefill.outputs().len();
    if n_outputs < 3 || (n_outputs - 1) % 2 != 0 {
        return Err(Error::Model(format!(
            "prefill graph has {n_outputs} outputs, expected logits plus K/V pairs"
        )));
    }
    let layers = (n_outputs - 1) / 2;
    if layers > MAX_DEC_LAYERS {
        return Err(Error::Model(format!(
            "prefill graph reports {layers} decoder layers, limit is {MAX_DEC_LAYERS}"
        )));
    }
    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_counts_stay_in_policy() {
        let (enc, dec) = thread_counts();
        assert!((1..=6).contains(&enc));
        assert!(dec == 2 || dec == 3);
        if dec == 3 {
            assert_eq!(enc, 6);
        }
    }

    #[test]
    fn find_model_prefers_quantized() {
        let dir = std::env::temp_dir().join(format!("qwen_asr_models_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        // Only full precision present.
        std::fs::write(dir.join("encoder.onnx"), b"x").unwrap();
        assert_eq!(find_model(&dir, "encoder.onnx"), dir.join("encoder.onnx"));

        // Quantized variant wins once it exists.
        std::fs::write(dir.join("encoder.int8.onnx"), b"x").unwrap();
        assert_eq!(
            find_model(&dir, "encoder.onnx"),
            dir.join("encoder.int8.onnx")
        );

        // Missing both still resolves to the full-precision name.
        assert_eq!(
            find_model(&dir, "decoder_decode.onnx"),
            dir.join("decoder_decode.onnx")
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn fallback_chains_match_policy() {
        assert_eq!(ENCODER_LEVELS, &[OptLevel::DisableAll]);
        assert_eq!(DECODER_LEVELS, &[OptLevel::Basic, OptLevel::DisableAll]);
    }
}
