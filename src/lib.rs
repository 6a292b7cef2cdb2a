//! On-device Qwen3-ASR speech-to-text via ONNX Runtime.
//!
//! The engine sequences three exported graphs (encoder, decoder prefill,
//! decoder decode) plus a memory-mapped fp16 token embedding matrix
//! through a single greedy transcription, with a session staging policy
//! sized for 4 GB mobile devices.
//!
//! ```no_run
//! use qwen_asr_rs::QwenAsr;
//!
//! # fn main() -> qwen_asr_rs::Result<()> {
//! let mut engine = QwenAsr::from_pretrained("./qwen3-asr-onnx")?;
//! let samples: Vec<f32> = vec![0.0; 16000]; // mono 16 kHz
//! let text = engine.transcribe(&samples)?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fp16;
pub mod npy;
pub mod session;
pub mod vocab;

mod qwen;

pub use config::MelConfig;
pub use error::{Error, Result};
pub use qwen::{EngineOptions, QwenAsr, Timings};
