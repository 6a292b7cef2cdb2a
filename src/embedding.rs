//! Token embedding store.
//!
//! The `[vocab_size, hidden_dim]` fp16 matrix stays memory-mapped for the
//! lifetime of the engine; a transcription touches roughly prompt length
//! plus one row per decode step, so the OS pages in a few hundred KB of a
//! ~300 MB file. Rows are converted to f32 at the point of use, no cache.

use crate::error::{Error, Result};
use crate::fp16::f16_to_f32;
use crate::npy::MappedNpyF16;
use std::path::Path;

pub struct EmbedTable {
    matrix: MappedNpyF16,
}

impl EmbedTable {
    /// Open the embedding matrix from a model directory. Prefers
    /// `embed_tokens.fp16.npy`; falls back to `embed_tokens.npy`, which
    /// must still hold fp16 data for the in-place mapping.
    pub fn open(model_dir: &Path) -> Result<Self> {
        let preferred = model_dir.join("embed_tokens.fp16.npy");
        let path = if preferred.is_file() {
            preferred
        } else {
            model_dir.join("embed_tokens.npy")
        };

        let matrix = MappedNpyF16::open(&path)?;
        log::info!(
            "embeddings: {} x {} fp16, mapped from {}",
            matrix.rows(),
            matrix.cols(),
            path.display()
        );
        Ok(Self { matrix })
    }

    pub fn vocab_size(&self) -> usize {
        self.matrix.rows()
    }

    pub fn hidden_dim(&self) -> usize {
        self.matrix.cols()
    }

    /// Write the f32 embedding of `token_id` into `out`, which must hold
    /// exactly `hidden_dim` values.
    pub fn embed(&self, token_id: u32, out: &mut [f32]) -> Result<()> {
        let row = token_id as usize;
        if row >= self.matrix.rows() {
            return Err(Error::Model(format!(
                "token id {token_id} out of range for vocab of {}",
                self.matrix.rows()
            )));
        }
        if out.len() != self.matrix.cols() {
            return Err(Error::Model(format!(
                "embedding buffer holds {} values, hidden_dim is {}",
                out.len(),
                self.matrix.cols()
            )));
        }

        for (dst, bits) in out.iter_mut().zip(self.matrix.row_bits(row)) {
            *dst = f16_to_f32(bits);
        }
        Ok(())
    }

    /// Raw fp16 bits of one row, for diagnostics and tests.
    pub fn row_bits(&self, token_id: u32) -> Vec<u16> {
        self.matrix.row_bits(token_id as usize).collect()
    }
}
