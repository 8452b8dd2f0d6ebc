//! Error types for ballbot-eye

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

impl From<opencv::Error> for BotError {
    fn from(err: opencv::Error) -> Self {
        BotError::OpenCv(err.message)
    }
}
