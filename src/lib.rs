//! # Stable Diffusion checkpoint loading
//!
//! Loads a single Stable Diffusion v1.x checkpoint into its four models, using
//! Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs):
//! - `clip`: the CLIP text transformer,
//! - `encoder` and `decoder`: the two halves of the variational auto-encoder,
//! - `diffusion`: the conditional UNet.
//!
//! Loading is strict, every model has to receive exactly the parameters it
//! declares. Both the single file layout of the original release and the
//! partitioned files written by [`Models::save`] can be read.
//!
//! ```no_run
//! let models = sd_loader::load_models("v1-5-pruned-emaonly.safetensors", "cpu")?;
//! println!("{}", models.diffusion.num_parameters());
//! # Ok::<(), sd_loader::LoadError>(())
//! ```

pub mod checkpoint;
pub mod convert;
pub mod error;
pub mod models;
pub mod pipelines;
pub mod utils;
pub mod weights;

pub use error::LoadError;
pub use pipelines::{load_models, Models, StableDiffusionConfig};
pub use utils::DeviceSetup;
pub use weights::{ModelKind, StateDict, StateDicts};
