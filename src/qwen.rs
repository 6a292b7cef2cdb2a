//! Qwen3-ASR inference pipeline.
//!
//! audio → mel → encoder → prompt embedding → decoder prefill → decode
//! loop → token decode → text.
//!
//! The three ONNX graphs are large (encoder ~191 MB, each decoder
//! ~570 MB); on 4 GB devices holding them all resident triggers the OS
//! out-of-memory killer. With `keep_sessions = false` the pipeline loads
//! each session right before its stage and drops it right after, so the
//! peak is one session plus the KV caches plus the paged-in slice of the
//! embedding matrix.

use crate::audio;
use crate::config::MelConfig;
use crate::embedding::EmbedTable;
use crate::error::{Error, Result};
use crate::session::{self, OptLevel};
use crate::vocab::QwenVocab;
use ndarray::Array2;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, TensorRef};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Mel frames per encoder chunk; input frame counts are padded up to a
/// multiple of this.
const CHUNK_FRAMES: usize = 100;

/// Generation cap, counting the prefill token.
const MAX_NEW_TOKENS: usize = 1024;

/// `<|im_start|>system\n<|im_end|>\n<|im_start|>user\n<|audio_start|>`
///
/// These ids are part of the model's training contract and must not
/// change.
const PROMPT_PREFIX: [u32; 9] = [151644, 8948, 198, 151645, 198, 151644, 872, 198, 151669];

/// `<|audio_end|><|im_end|>\n<|im_start|>assistant\n`
const PROMPT_SUFFIX: [u32; 6] = [151670, 151645, 198, 151644, 77091, 198];

const EOS_TOKENS: [u32; 2] = [151643, 151645];

/// Every id at or above this is a special token.
const FIRST_SPECIAL_TOKEN: u32 = 151643;

fn is_eos(token: u32) -> bool {
    EOS_TOKENS.contains(&token)
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

fn ms(from: Instant, to: Instant) -> f64 {
    to.duration_since(from).as_secs_f64() * 1000.0
}

/// Load-time overrides for host tuning.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    keep_sessions: Option<bool>,
    encoder_threads: Option<usize>,
    decoder_threads: Option<usize>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep ONNX sessions resident between stages and across calls.
    /// Defaults by host class: true on desktop, false on android/ios.
    pub fn with_keep_sessions(mut self, keep: bool) -> Self {
        self.keep_sessions = Some(keep);
        self
    }

    pub fn with_encoder_threads(mut self, threads: usize) -> Self {
        self.encoder_threads = Some(threads);
        self
    }

    pub fn with_decoder_threads(mut self, threads: usize) -> Self {
        self.decoder_threads = Some(threads);
        self
    }
}

/// Per-stage wall-clock breakdown of the last successful transcription.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Timings {
    pub mel_ms: f64,
    pub encoder_ms: f64,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub total_ms: f64,
    pub n_tokens: usize,
}

/// Qwen3-ASR speech-to-text engine.
///
/// One engine serves one caller at a time (`transcribe` takes `&mut
/// self`); run independent engines for parallel work. The token embedding
/// matrix stays memory-mapped for the engine's lifetime.
pub struct QwenAsr {
    encoder: Option<Session>,
    prefill: Option<Session>,
    decode: Option<Session>,
    embeddings: EmbedTable,
    vocab: QwenVocab,
    mel_config: MelConfig,
    model_dir: PathBuf,
    encoder_threads: usize,
    decoder_threads: usize,
    keep_sessions: bool,
    /// 0 until the prefill graph has been inspected.
    n_layers: usize,
    last_timing: Option<Timings>,
}

impl QwenAsr {
    /// Load from a directory containing:
    /// - `encoder.int8.onnx` (or `encoder.onnx`)
    /// - `decoder_prefill.int8.onnx` (or `decoder_prefill.onnx`)
    /// - `decoder_decode.int8.onnx` (or `decoder_decode.onnx`)
    /// - `embed_tokens.fp16.npy` (or `embed_tokens.npy`)
    /// - `vocab.json`
    pub fn from_pretrained<P: AsRef<Path>>(model_dir: P) -> Result<Self> {
        Self::from_pretrained_with_options(model_dir, EngineOptions::default())
    }

    pub fn from_pretrained_with_options<P: AsRef<Path>>(
        model_dir: P,
        options: EngineOptions,
    ) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        log::info!("loading Qwen3-ASR from {}", model_dir.display());

        let vocab = QwenVocab::from_file(model_dir.join("vocab.json"))?;
        log::info!("tokenizer loaded ({} pieces)", vocab.size());

        let embeddings = EmbedTable::open(&model_dir)?;
        let mel_config = MelConfig::from_model_dir(&model_dir)?;

        let (enc_default, dec_default) = session::thread_counts();
        let encoder_threads = options.encoder_threads.unwrap_or(enc_default);
        let decoder_threads = options.decoder_threads.unwrap_or(dec_default);

        // Desktop hosts keep sessions resident (CreateSession cost
        // dominates); memory-constrained mobile hosts reload per stage.
        let keep_sessions = options
            .keep_sessions
            .unwrap_or(!cfg!(any(target_os = "android", target_os = "ios")));
        log::debug!(
            "threads enc={encoder_threads} dec={decoder_threads}, keep_sessions={keep_sessions}"
        );

        let mut engine = Self {
            encoder: None,
            prefill: None,
            decode: None,
            embeddings,
            vocab,
            mel_config,
            model_dir,
            encoder_threads,
            decoder_threads,
            keep_sessions,
            n_layers: 0,
            last_timing: None,
        };

        if engine.keep_sessions {
            engine.load_all_sessions()?;
            log::info!(
                "load complete (eager sessions, {} decoder layers)",
                engine.n_layers
            );
        } else {
            log::info!("load complete; sessions load on demand per stage");
        }

        Ok(engine)
    }

    fn load_all_sessions(&mut self) -> Result<()> {
        ensure_session(
            &mut self.encoder,
            &self.model_dir,
            "encoder.onnx",
            self.encoder_threads,
            session::ENCODER_LEVELS,
        )?;
        let prefill = ensure_session(
            &mut self.prefill,
            &self.model_dir,
            "decoder_prefill.onnx",
            self.decoder_threads,
            session::DECODER_LEVELS,
        )?;
        self.n_layers = session::decoder_layers(prefill)?;
        ensure_session(
            &mut self.decode,
            &self.model_dir,
            "decoder_decode.onnx",
            self.decoder_threads,
            session::DECODER_LEVELS,
        )?;
        Ok(())
    }

    /// Which of the encoder / prefill / decode session slots currently
    /// hold a loaded session.
    pub fn sessions_loaded(&self) -> [bool; 3] {
        [
            self.encoder.is_some(),
            self.prefill.is_some(),
            self.decode.is_some(),
        ]
    }

    /// Stage timings of the most recent successful `transcribe`.
    pub fn last_timing(&self) -> Option<Timings> {
        self.last_timing
    }

    pub fn vocab_size(&self) -> usize {
        self.embeddings.vocab_size()
    }

    pub fn hidden_dim(&self) -> usize {
        self.embeddings.hidden_dim()
    }

    /// Transcribe mono 16 kHz samples to text.
    ///
    /// Runs the staged pipeline to completion or to the first error; in
    /// either case the session teardown policy is applied before
    /// returning, so a failed call leaves the engine usable.
    pub fn transcribe(&mut self, samples: &[f32]) -> Result<String> {
        let result = self.transcribe_inner(samples);
        if !self.keep_sessions {
            self.drop_sessions();
        }
        result
    }

    fn transcribe_inner(&mut self, samples: &[f32]) -> Result<String> {
        if samples.is_empty() {
            return Err(Error::Audio("no samples to transcribe".into()));
        }

        let hidden = self.embeddings.hidden_dim();
        let vocab_size = self.embeddings.vocab_size();
        let t_start = Instant::now();

        // ---- Stage 1: mel spectrogram, padded to the encoder chunk ----
        let mel = audio::mel_spectrogram(samples, &self.mel_config)?;
        if mel.shape()[1] == 0 {
            return Err(Error::Audio("audio shorter than one mel frame".into()));
        }
        let mel_bins = mel.shape()[0];
        let (mel_buf, padded_frames) = pad_mel_frames(&mel, CHUNK_FRAMES);
        let t_mel = Instant::now();
        log::debug!(
            "mel: {mel_bins} x {padded_frames} (padded from {}), {:.1} ms",
            mel.shape()[1],
            ms(t_start, t_mel)
        );

        // ---- Stage 2: encoder ----
        let audio_embeds = {
            let encoder = ensure_session(
                &mut self.encoder,
                &self.model_dir,
                "encoder.onnx",
                self.encoder_threads,
                session::ENCODER_LEVELS,
            )?;
            let mel_tensor =
                TensorRef::from_array_view(([1, mel_bins, padded_frames], mel_buf.as_slice()))?;
            let mut outputs = encoder.run(ort::inputs!["mel_input" => mel_tensor])?;
            outputs
                .remove("audio_embeddings")
                .ok_or_else(|| Error::Model("encoder produced no audio_embeddings".into()))?
        };
        drop(mel_buf);
        let t_encoder = Instant::now();
        log::debug!("encoder: {:.1} ms", ms(t_mel, t_encoder));

        let n_audio = {
            let (shape, _) = audio_embeds.try_extract_tensor::<f32>()?;
            let dims = shape.as_ref();
            if dims.len() != 3 || dims[2] as usize != hidden {
                return Err(Error::Model(format!(
                    "unexpected audio embedding shape {dims:?}, hidden_dim is {hidden}"
                )));
            }
            dims[1] as usize
        };
        log::debug!("audio embeddings: {n_audio} tokens x {hidden} dim");

        // The encoder session is ~191 MB; with per-stage staging it goes
        // away before the prefill session loads. The output value owns its
        // buffer and survives the session.
        if !self.keep_sessions && self.encoder.take().is_some() {
            log::debug!("released encoder session");
        }

        // ---- Stage 3: decoder prefill over the assembled prompt ----
        let prefill = ensure_session(
            &mut self.prefill,
            &self.model_dir,
            "decoder_prefill.onnx",
            self.decoder_threads,
            session::DECODER_LEVELS,
        )?;
        if self.n_layers == 0 {
            self.n_layers = session::decoder_layers(prefill)?;
            log::debug!("decoder layers: {}", self.n_layers);
        }
        let n_layers = self.n_layers;
        let n_kv = 2 * n_layers;

        let input_embeds = {
            let (_, audio_data) = audio_embeds.try_extract_tensor::<f32>()?;
            build_prompt(&self.embeddings, audio_data, hidden)?
        };
        drop(audio_embeds);
        let prompt_len = PROMPT_PREFIX.len() + n_audio + PROMPT_SUFFIX.len();

        let mut kv_caches: Vec<DynValue> = Vec::with_capacity(n_kv);
        let first_token = {
            let prompt_tensor = TensorRef::from_array_view((
                [1, prompt_len, hidden],
                input_embeds.as_slice(),
            ))?;
            let mut outputs = prefill.run(ort::inputs!["input_embeds" => prompt_tensor])?;

            let logits = outputs
                .remove("logits")
                .ok_or_else(|| Error::Model("prefill produced no logits".into()))?;
            let first_token = {
                let (_, data) = logits.try_extract_tensor::<f32>()?;
                if data.len() < vocab_size {
                    return Err(Error::Model(format!(
                        "prefill logits hold {} values, vocab is {vocab_size}",
                        data.len()
                    )));
                }
                argmax(&data[..vocab_size]) as u32
            };

            // The K/V outputs move into the persistent cache; logits drop
            // at the end of this block.
            for prefix in ["k_cache_", "v_cache_"] {
                for i in 0..n_layers {
                    let name = format!("{prefix}{i}");
                    let value = outputs.remove(name.as_str()).ok_or_else(|| {
                        Error::Model(format!("prefill produced no {name} output"))
                    })?;
                    kv_caches.push(value);
                }
            }
            first_token
        };
        drop(input_embeds);
        let t_prefill = Instant::now();
        log::debug!(
            "prefill: {:.1} ms, first token {first_token}",
            ms(t_encoder, t_prefill)
        );

        // ---- Stage 4: swap prefill for decode ----
        // Release before loading so both ~570 MB graphs are never resident
        // together; the KV cache values are independent of the session.
        if !self.keep_sessions && self.prefill.take().is_some() {
            log::debug!("released decoder_prefill session");
        }
        let decode = ensure_session(
            &mut self.decode,
            &self.model_dir,
            "decoder_decode.onnx",
            self.decoder_threads,
            session::DECODER_LEVELS,
        )?;

        // ---- Stage 5: greedy decode loop ----
        let mut input_names: Vec<String> = Vec::with_capacity(2 + n_kv);
        input_names.push("token_embed".into());
        input_names.push("position".into());
        let mut output_names: Vec<String> = Vec::with_capacity(1 + n_kv);
        output_names.push("logits".into());
        for (input_prefix, output_prefix) in
            [("k_cache_in_", "k_cache_out_"), ("v_cache_in_", "v_cache_out_")]
        {
            for i in 0..n_layers {
                input_names.push(format!("{input_prefix}{i}"));
                output_names.push(format!("{output_prefix}{i}"));
            }
        }

        let mut generated: Vec<u32> = Vec::with_capacity(MAX_NEW_TOKENS);
        generated.push(first_token);
        let mut token = first_token;

        // One token-embedding buffer and one position scalar serve every
        // step; the tensors wrap them in place.
        let mut token_buf = vec![0.0f32; hidden];
        let mut position = [0i64; 1];

        for step in 0..MAX_NEW_TOKENS - 1 {
            if is_eos(token) {
                break;
            }

            self.embeddings.embed(token, &mut token_buf)?;
            position[0] = (prompt_len + step) as i64;

            let mut inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
                Vec::with_capacity(2 + n_kv);
            inputs.push((
                Cow::Borrowed(input_names[0].as_str()),
                TensorRef::from_array_view(([1, 1, hidden], token_buf.as_slice()))?.into(),
            ));
            inputs.push((
                Cow::Borrowed(input_names[1].as_str()),
                TensorRef::from_array_view(([1usize], position.as_slice()))?.into(),
            ));
            for (i, cache) in kv_caches.iter().enumerate() {
                inputs.push((
                    Cow::Borrowed(input_names[2 + i].as_str()),
                    SessionInputValue::from(cache),
                ));
            }

            let mut outputs = decode.run(inputs)?;

            let logits = outputs
                .remove("logits")
                .ok_or_else(|| Error::Model("decode step produced no logits".into()))?;
            {
                let (_, data) = logits.try_extract_tensor::<f32>()?;
                if data.len() < vocab_size {
                    return Err(Error::Model(format!(
                        "decode logits hold {} values, vocab is {vocab_size}",
                        data.len()
                    )));
                }
                token = argmax(&data[..vocab_size]) as u32;
            }
            generated.push(token);

            // Rotate the cache: adopt each new K/V value, dropping the one
            // it replaces.
            for (i, name) in output_names.iter().enumerate().skip(1) {
                let value = outputs.remove(name.as_str()).ok_or_else(|| {
                    Error::Model(format!("decode step produced no {name} output"))
                })?;
                kv_caches[i - 1] = value;
            }
        }

        let t_decode = Instant::now();
        let n_tokens = generated.len();
        log::debug!(
            "decode loop: {:.1} ms ({n_tokens} tokens, {:.1} ms/token)",
            ms(t_prefill, t_decode),
            ms(t_prefill, t_decode) / n_tokens.max(1) as f64
        );
        log::debug!(
            "total inference: {:.1} ms for {:.2} s of audio",
            ms(t_start, t_decode),
            samples.len() as f64 / self.mel_config.sampling_rate as f64
        );

        self.last_timing = Some(Timings {
            mel_ms: ms(t_start, t_mel),
            encoder_ms: ms(t_mel, t_encoder),
            prefill_ms: ms(t_encoder, t_prefill),
            decode_ms: ms(t_prefill, t_decode),
            total_ms: ms(t_start, t_decode),
            n_tokens,
        });

        // ---- Stage 6: tokens to text ----
        Ok(detokenize(&self.vocab, &generated))
    }

    fn drop_sessions(&mut self) {
        if self.encoder.take().is_some() {
            log::debug!("released encoder session");
        }
        if self.prefill.take().is_some() {
            log::debug!("released decoder_prefill session");
        }
        if self.decode.take().is_some() {
            log::debug!("released decoder_decode session");
        }
    }
}

fn ensure_session<'a>(
    slot: &'a mut Option<Session>,
    model_dir: &Path,
    base_name: &str,
    threads: usize,
    levels: &[OptLevel],
) -> Result<&'a mut Session> {
    if slot.is_none() {
        let path = session::find_model(model_dir, base_name);
        log::debug!("loading {base_name} on demand");
        let t = Instant::now();
        *slot = Some(session::create_session_with_fallback(&path, threads, levels)?);
        log::debug!("{base_name} loaded in {:.1} ms", t.elapsed().as_secs_f64() * 1000.0);
    }
    match slot {
        Some(session) => Ok(session),
        None => Err(Error::Model(format!("{base_name} session unavailable"))),
    }
}

/// Copy the mel matrix into a `[bins, padded]` row-major buffer, the frame
/// count rounded up to a multiple of `chunk` with zero fill.
fn pad_mel_frames(mel: &Array2<f32>, chunk: usize) -> (Vec<f32>, usize) {
    let bins = mel.shape()[0];
    let frames = mel.shape()[1];
    let padded = frames.div_ceil(chunk) * chunk;

    let mut buf = vec![0.0f32; bins * padded];
    for (m, row) in mel.rows().into_iter().enumerate() {
        for (t, &v) in row.iter().enumerate() {
            buf[m * padded + t] = v;
        }
    }
    (buf, padded)
}

/// Splice prefix embeddings, the encoder output block and suffix
/// embeddings into one contiguous `[prompt_len, hidden]` buffer.
fn build_prompt(embeddings: &EmbedTable, audio: &[f32], hidden: usize) -> Result<Vec<f32>> {
    if hidden == 0 || audio.len() % hidden != 0 {
        return Err(Error::Model(format!(
            "audio embedding block of {} values is not a multiple of hidden_dim {hidden}",
            audio.len()
        )));
    }
    let n_audio = audio.len() / hidden;
    let prompt_len = PROMPT_PREFIX.len() + n_audio + PROMPT_SUFFIX.len();
    let mut buf = vec![0.0f32; prompt_len * hidden];

    for (i, &id) in PROMPT_PREFIX.iter().enumerate() {
        embeddings.embed(id, &mut buf[i * hidden..(i + 1) * hidden])?;
    }

    let audio_base = PROMPT_PREFIX.len() * hidden;
    buf[audio_base..audio_base + audio.len()].copy_from_slice(audio);

    let suffix_base = (PROMPT_PREFIX.len() + n_audio) * hidden;
    for (i, &id) in PROMPT_SUFFIX.iter().enumerate() {
        embeddings.embed(id, &mut buf[suffix_base + i * hidden..][..hidden])?;
    }

    Ok(buf)
}

/// Assemble the transcript from the generated stream.
///
/// Trailing EOS tokens are stripped. Everything before the `<asr_text>`
/// marker is header metadata (language and special tokens) and is
/// discarded; when the marker never appears, all non-special ids are
/// decoded instead. The result is trimmed of outer ASCII whitespace.
fn detokenize(vocab: &QwenVocab, generated: &[u32]) -> String {
    let mut tokens = generated;
    while let Some((&last, rest)) = tokens.split_last() {
        if !is_eos(last) {
            break;
        }
        tokens = rest;
    }

    let sentinel = vocab.asr_text_id();
    let mut bytes: Vec<u8> = Vec::new();
    match sentinel.and_then(|id| tokens.iter().position(|&t| t == id)) {
        Some(pos) => {
            for &t in &tokens[pos + 1..] {
                if Some(t) == sentinel {
                    continue;
                }
                if let Some(piece) = vocab.decode(t) {
                    bytes.extend_from_slice(piece);
                }
            }
        }
        None => {
            for &t in tokens {
                if t >= FIRST_SPECIAL_TOKEN {
                    continue;
                }
                if let Some(piece) = vocab.decode(t) {
                    bytes.extend_from_slice(piece);
                }
            }
        }
    }

    String::from_utf8_lossy(&bytes)
        .trim_matches([' ', '\t', '\n'])
        .to_string()
}
