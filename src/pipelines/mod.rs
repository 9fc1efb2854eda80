//! # Pipelines

pub mod stable_diffusion;

pub use stable_diffusion::{load_models, Models, StableDiffusionConfig};
