/*
Offline transcription of a WAV file.

cargo run --release --example transcribe ./qwen3-asr-onnx hello.wav

Model directory (https://huggingface.co — Qwen3-ASR ONNX export):
- encoder.int8.onnx (or encoder.onnx)
- decoder_prefill.int8.onnx (or decoder_prefill.onnx)
- decoder_decode.int8.onnx (or decoder_decode.onnx)
- embed_tokens.fp16.npy
- vocab.json

Audio must be 16 kHz; multichannel input is mixed down to mono.
*/

use qwen_asr_rs::{audio, QwenAsr};
use std::env;
use std::time::Instant;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let model_dir = args.get(1).map(String::as_str).unwrap_or("./qwen3-asr-onnx");
    let audio_path = args.get(2).map(String::as_str).unwrap_or("hello.wav");

    let (samples, spec) = audio::load_audio(audio_path)?;
    if spec.sample_rate != 16000 {
        return Err(format!("Expected 16kHz, got {}Hz", spec.sample_rate).into());
    }
    let samples = audio::mixdown(&samples, spec.channels);
    let duration = samples.len() as f32 / 16000.0;

    let load_start = Instant::now();
    let mut engine = QwenAsr::from_pretrained(model_dir)?;
    println!(
        "Loaded model in {:.1}s (vocab {}, hidden {})",
        load_start.elapsed().as_secs_f32(),
        engine.vocab_size(),
        engine.hidden_dim()
    );

    let text = engine.transcribe(&samples)?;
    println!("Transcript: {text}");

    if let Some(t) = engine.last_timing() {
        println!(
            "Timing: mel {:.0}ms | encoder {:.0}ms | prefill {:.0}ms | decode {:.0}ms | total {:.0}ms",
            t.mel_ms, t.encoder_ms, t.prefill_ms, t.decode_ms, t.total_ms
        );
        println!(
            "{} tokens, {:.1} ms/token, {:.2}x realtime",
            t.n_tokens,
            t.decode_ms / t.n_tokens.max(1) as f64,
            duration as f64 * 1000.0 / t.total_ms.max(1.0)
        );
    }

    Ok(())
}
