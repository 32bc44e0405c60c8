use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchingError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Image file not found: {}", .0.display())]
    MissingImage(PathBuf),

    #[error("Template {template_width}x{template_height} does not fit inside {target_width}x{target_height} target")]
    TemplateTooLarge {
        template_width: u32,
        template_height: u32,
        target_width: u32,
        target_height: u32,
    },

    #[error("Degenerate image data: {0}")]
    DegenerateImage(String),
}

pub type Result<T> = std::result::Result<T, MatchingError>;
