//! Ball localization: color detection and detector fusion

pub mod color;
pub mod fusion;

pub use color::{ColorDetector, ColorOutcome, ColorProfile};
pub use fusion::{FusionResult, LocalizationFusion};
