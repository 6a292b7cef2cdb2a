//! Decode-only byte-level BPE vocabulary.
//!
//! Qwen ships a flat `vocab.json` mapping piece strings to ids. Pieces use
//! the GPT-2 byte-to-unicode encoding, so decoding a token means mapping
//! each char of its piece back to the raw byte it stands for; the decoded
//! transcript is assembled as bytes and converted to UTF-8 once, which
//! keeps multi-byte characters split across tokens intact.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;

/// The marker piece separating header tokens from the transcript.
const ASR_TEXT_PIECE: &str = "<asr_text>";

pub struct QwenVocab {
    pieces: HashMap<u32, Vec<u8>>,
    asr_text_id: Option<u32>,
}

/// Inverse of the GPT-2 byte-to-unicode table: printable latin-1 ranges
/// map to themselves, everything else was remapped to U+0100 and up.
fn byte_decoder() -> HashMap<char, u8> {
    let mut map = HashMap::with_capacity(256);
    let mut shifted: u32 = 0;
    for b in 0u32..=255 {
        let printable =
            (33..=126).contains(&b) || (161..=172).contains(&b) || (174..=255).contains(&b);
        let c = if printable {
            char::from_u32(b).unwrap()
        } else {
            let c = char::from_u32(256 + shifted).unwrap();
            shifted += 1;
            c
        };
        map.insert(c, b as u8);
    }
    map
}

impl QwenVocab {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Tokenizer(format!("failed to read vocab.json: {e}")))?;
        let raw: HashMap<String, u32> = serde_json::from_str(&text)
            .map_err(|e| Error::Tokenizer(format!("failed to parse vocab.json: {e}")))?;
        if raw.is_empty() {
            return Err(Error::Tokenizer("vocab.json is empty".into()));
        }
        Ok(Self::from_piece_map(raw))
    }

    fn from_piece_map(raw: HashMap<String, u32>) -> Self {
        let decoder = byte_decoder();
        let asr_text_id = raw.get(ASR_TEXT_PIECE).copied();

        let mut pieces = HashMap::with_capacity(raw.len());
        for (piece, id) in raw {
            let mut bytes = Vec::with_capacity(piece.len());
            for ch in piece.chars() {
                match decoder.get(&ch) {
                    Some(&b) => bytes.push(b),
                    // Chars outside the table only appear in added special
                    // pieces; keep their UTF-8 bytes as written.
                    None => {
                        let mut buf = [0u8; 4];
                        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                }
            }
            pieces.insert(id, bytes);
        }

        Self {
            pieces,
            asr_text_id,
        }
    }

    /// Raw bytes of the piece for `id`, or None for ids the vocabulary
    /// does not carry (unknown and most special ids).
    pub fn decode(&self, id: u32) -> Option<&[u8]> {
        self.pieces.get(&id).map(Vec::as_slice)
    }

    /// Id of the `<asr_text>` marker, when the vocabulary carries it.
    pub fn asr_text_id(&self) -> Option<u32> {
        self.asr_text_id
    }

    pub fn size(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    pub(crate) fn write_vocab(name: &str, entries: &[(&str, u32)]) -> PathBuf {
        let json = serde_json::to_string(
            &entries
                .iter()
                .map(|(piece, id)| ((*piece).to_string(), *id))
                .collect::<HashMap<String, u32>>(),
        )
        .unwrap();
        let path =
            std::env::temp_dir().join(format!("qwen_asr_vocab_{}_{name}", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(json.as_bytes()).unwrap();
        path
    }

    #[test]
    fn decodes_byte_level_pieces() {
        let path = write_vocab(
            "basic.json",
            &[("hello", 0), ("\u{0120}world", 1), ("<asr_text>", 5)],
        );
        let vocab = QwenVocab::from_file(&path).unwrap();

        assert_eq!(vocab.size(), 3);
        assert_eq!(vocab.decode(0), Some(b"hello".as_slice()));
        // U+0120 is the byte-level encoding of a leading space.
        assert_eq!(vocab.decode(1), Some(b" world".as_slice()));
        assert_eq!(vocab.decode(42), None);
        assert_eq!(vocab.asr_text_id(), Some(5));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn multibyte_utf8_survives_byte_mapping() {
        // "é" is stored byte-level as the two chars for 0xC3 0xA9.
        let path = write_vocab("utf8.json", &[("\u{00C3}\u{00A9}", 0)]);
        let vocab = QwenVocab::from_file(&path).unwrap();
        assert_eq!(vocab.decode(0), Some("é".as_bytes()));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn sentinel_absent() {
        let path = write_vocab("nosentinel.json", &[("a", 0)]);
        let vocab = QwenVocab::from_file(&path).unwrap();
        assert_eq!(vocab.asr_text_id(), None);
        std::fs::remove_file(&path).ok();
    }
}
