use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error. String variants carry context from the failing stage.
#[derive(Debug)]
pub enum Error {
    /// Missing or malformed model files (fails the load).
    Config(String),
    /// Audio input problems (sample rate, empty input, WAV decode).
    Audio(String),
    /// vocab.json problems.
    Tokenizer(String),
    /// Backend, shape and protocol failures during inference.
    Model(String),
    Io(std::io::Error),
    Ort(ort::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Audio(msg) => write!(f, "audio error: {msg}"),
            Error::Tokenizer(msg) => write!(f, "tokenizer error: {msg}"),
            Error::Model(msg) => write!(f, "model error: {msg}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Ort(e) => write!(f, "onnxruntime error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Ort(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::Ort(e)
    }
}

impl From<hound::Error> for Error {
    fn from(e: hound::Error) -> Self {
        Error::Audio(format!("wav: {e}"))
    }
}
