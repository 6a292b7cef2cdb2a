use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

/// Mel front-end parameters, matching the Whisper-family feature extractor
/// the model was trained with. Read from `preprocessor_config.json` when
/// the model directory ships one; the defaults are the released model's
/// values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MelConfig {
    pub sampling_rate: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub feature_size: usize,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 16000,
            n_fft: 400,
            hop_length: 160,
            feature_size: 128,
        }
    }
}

impl MelConfig {
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("preprocessor_config.json");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: MelConfig = serde_json::from_str(&text).map_err(|e| {
            crate::Error::Config(format!("{}: {e}", path.display()))
        })?;
        log::debug!("mel config from {}: {config:?}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_released_model() {
        let c = MelConfig::default();
        assert_eq!(c.sampling_rate, 16000);
        assert_eq!(c.n_fft, 400);
        assert_eq!(c.hop_length, 160);
        assert_eq!(c.feature_size, 128);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("qwen_asr_nocfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let c = MelConfig::from_model_dir(&dir).unwrap();
        assert_eq!(c.feature_size, MelConfig::default().feature_size);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn partial_json_keeps_defaults_for_absent_keys() {
        let dir = std::env::temp_dir().join(format!("qwen_asr_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("preprocessor_config.json")).unwrap();
        f.write_all(br#"{"feature_size": 80, "padding_value": 0.0}"#).unwrap();

        let c = MelConfig::from_model_dir(&dir).unwrap();
        assert_eq!(c.feature_size, 80);
        assert_eq!(c.hop_length, 160);
        std::fs::remove_dir_all(&dir).ok();
    }
}
