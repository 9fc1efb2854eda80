//! # Weight conversion
//!
//! Splits a checkpoint into one [`crate::weights::StateDict`] per model, renaming the tensors
//! to the names the models declare and moving them to the device of their
//! model.
//!
//! Two layouts are understood:
//! - the single file layout of the LDM release of Stable Diffusion v1.x, with
//!   the `model.diffusion_model.`, `first_stage_model.` and
//!   `cond_stage_model.` prefixes,
//! - the partitioned layout written by [`crate::Models::save`], where every
//!   name is prefixed with the key of its model.
use crate::error::LoadError;
use crate::pipelines::StableDiffusionConfig;
use crate::utils::DeviceSetup;
use crate::weights::{ModelKind, StateDicts};
use std::path::Path;
use tch::Tensor;

pub mod clip;
pub mod unet;
pub mod vae;

const LDM_PREFIXES: [&str; 3] = ["model.diffusion_model.", "first_stage_model.", "cond_stage_model."];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Ldm,
    Partitioned,
}

impl Layout {
    pub fn detect<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let is_ldm =
            |name: &str| LDM_PREFIXES.iter().any(|prefix| name.starts_with(prefix));
        if names.into_iter().any(is_ldm) {
            Layout::Ldm
        } else {
            Layout::Partitioned
        }
    }
}

/// Where a tensor of an LDM checkpoint ends up, `None` for the tensors that
/// no model declares (noise schedule, EMA copies, the VAE loss...).
fn route_ldm(
    name: &str,
    config: &StableDiffusionConfig,
) -> Result<Option<(ModelKind, String)>, LoadError> {
    let unknown = || LoadError::UnknownTensor { name: name.to_string() };
    if let Some(rest) = name.strip_prefix("model.diffusion_model.") {
        let layers = config.unet.layers_per_block as usize;
        return Ok(Some((ModelKind::Diffusion, unet::rename(rest, layers))));
    }
    if let Some(rest) = name.strip_prefix("cond_stage_model.") {
        // Anything outside of the transformer is left as is so that strict
        // loading reports it.
        let route = match rest.strip_prefix("transformer.") {
            Some(rest) => clip::rename(rest).map(|name| (ModelKind::Clip, name)),
            None => Some((ModelKind::Clip, name.to_string())),
        };
        return Ok(route);
    }
    if let Some(rest) = name.strip_prefix("first_stage_model.") {
        let route = if rest.starts_with("loss.") {
            None
        } else if let Some(rest) = rest.strip_prefix("encoder.") {
            Some((ModelKind::Encoder, vae::rename_encoder(rest)))
        } else if let Some(rest) = rest.strip_prefix("decoder.") {
            let num_blocks = config.autoencoder.block_out_channels.len();
            Some((ModelKind::Decoder, vae::rename_decoder(rest, num_blocks)))
        } else if rest.starts_with("quant_conv.") {
            Some((ModelKind::Encoder, rest.to_string()))
        } else if rest.starts_with("post_quant_conv.") {
            Some((ModelKind::Decoder, rest.to_string()))
        } else {
            return Err(unknown());
        };
        return Ok(route);
    }
    // A partitioned name next to LDM names, the two layouts cannot be mixed.
    match name.split_once('.') {
        Some((key, _)) if ModelKind::from_key(key).is_some() => Err(unknown()),
        _ => Ok(None),
    }
}

fn route_partitioned(name: &str) -> Result<(ModelKind, String), LoadError> {
    name.split_once('.')
        .and_then(|(key, param)| ModelKind::from_key(key).map(|kind| (kind, param.to_string())))
        .ok_or_else(|| LoadError::UnknownTensor { name: name.to_string() })
}

/// Routes named tensors to their models.
pub fn partition(
    tensors: Vec<(String, Tensor)>,
    devices: &DeviceSetup,
    config: &StableDiffusionConfig,
) -> Result<StateDicts, LoadError> {
    let layout = Layout::detect(tensors.iter().map(|(name, _)| name.as_str()));
    log::info!("{layout:?} layout, {} tensors", tensors.len());
    let mut state_dicts = StateDicts::default();
    let mut skipped = 0;
    for (name, tensor) in tensors.into_iter() {
        let (kind, param) = match layout {
            Layout::Partitioned => route_partitioned(&name)?,
            Layout::Ldm => match route_ldm(&name, config)? {
                Some(route) => route,
                None => {
                    log::trace!("skipping {name}");
                    skipped += 1;
                    continue;
                }
            },
        };
        let tensor = match kind {
            ModelKind::Encoder | ModelKind::Decoder => vae::adapt_tensor(&param, tensor),
            _ => tensor,
        };
        let tensor = tensor.to_device(devices.get(kind));
        state_dicts.get_mut(kind).insert(param, tensor);
    }
    if skipped > 0 {
        log::debug!("skipped {skipped} tensors that no model declares");
    }
    for kind in ModelKind::ALL {
        log::debug!("{kind}: {} tensors", state_dicts.get(kind).len());
    }
    Ok(state_dicts)
}

/// Reads a checkpoint and splits it per model.
pub fn load_from_standard_weights<P: AsRef<Path>>(
    path: P,
    devices: &DeviceSetup,
    config: &StableDiffusionConfig,
) -> Result<StateDicts, LoadError> {
    let tensors = crate::checkpoint::read(path)?;
    partition(tensors, devices, config)
}
