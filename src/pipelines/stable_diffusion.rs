use crate::checkpoint;
use crate::convert;
use crate::error::LoadError;
use crate::models::{clip, unet, vae, LoadedModel};
use crate::utils::DeviceSetup;
use crate::weights::{self, ModelKind, StateDict, StateDicts};
use std::path::Path;
use tch::{nn, Device};

#[derive(Clone, Debug)]
pub struct StableDiffusionConfig {
    pub clip: clip::Config,
    pub autoencoder: vae::AutoEncoderConfig,
    pub unet: unet::UNetConfig,
}

/// The four models of a Stable Diffusion checkpoint, keyed by their role.
#[derive(Debug)]
pub struct Models {
    pub clip: LoadedModel<clip::ClipTextTransformer>,
    pub encoder: LoadedModel<vae::Encoder>,
    pub decoder: LoadedModel<vae::Decoder>,
    pub diffusion: LoadedModel<unet::UNet2DConditionModel>,
}

impl Models {
    pub fn var_store(&self, kind: ModelKind) -> &nn::VarStore {
        match kind {
            ModelKind::Clip => self.clip.var_store(),
            ModelKind::Encoder => self.encoder.var_store(),
            ModelKind::Decoder => self.decoder.var_store(),
            ModelKind::Diffusion => self.diffusion.var_store(),
        }
    }

    pub fn state_dicts(&self) -> StateDicts {
        StateDicts {
            clip: self.clip.state_dict(),
            encoder: self.encoder.state_dict(),
            decoder: self.decoder.state_dict(),
            diffusion: self.diffusion.state_dict(),
        }
    }

    /// Writes the four models to a single safetensors file, each parameter
    /// being prefixed with the key of its model.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LoadError> {
        let mut tensors = vec![];
        for kind in ModelKind::ALL {
            for (name, tensor) in self.var_store(kind).variables() {
                tensors.push((format!("{kind}.{name}"), tensor))
            }
        }
        tensors.sort_by(|(a, _), (b, _)| a.cmp(b));
        log::info!("saving {} tensors to {:?}", tensors.len(), path.as_ref());
        checkpoint::write_safetensors(path, &tensors)
    }
}

// Creates the variables of a model and, when some weights are given, fills
// them in and freezes them.
fn build<M>(
    kind: ModelKind,
    device: Device,
    weights: Option<StateDict>,
    new_model: impl FnOnce(nn::Path) -> M,
) -> Result<LoadedModel<M>, LoadError> {
    let mut vs = nn::VarStore::new(device);
    let model = new_model(vs.root());
    if let Some(weights) = weights {
        weights::load_state_dict(&mut vs, kind, weights)?;
        vs.freeze();
    }
    log::info!("{kind}: {} variables on {device:?}", vs.len());
    Ok(LoadedModel::new(model, vs))
}

impl StableDiffusionConfig {
    pub fn v1_5() -> Self {
        Self {
            clip: clip::Config::v1_5(),
            autoencoder: vae::AutoEncoderConfig::v1_5(),
            unet: unet::UNetConfig::v1_5(),
        }
    }

    pub fn build_encoder(
        &self,
        weights: StateDict,
        device: Device,
    ) -> Result<LoadedModel<vae::Encoder>, LoadError> {
        build(ModelKind::Encoder, device, Some(weights), |vs| {
            vae::Encoder::new(vs, &self.autoencoder)
        })
    }

    pub fn build_decoder(
        &self,
        weights: StateDict,
        device: Device,
    ) -> Result<LoadedModel<vae::Decoder>, LoadError> {
        build(ModelKind::Decoder, device, Some(weights), |vs| {
            vae::Decoder::new(vs, &self.autoencoder)
        })
    }

    pub fn build_unet(
        &self,
        weights: StateDict,
        device: Device,
    ) -> Result<LoadedModel<unet::UNet2DConditionModel>, LoadError> {
        build(ModelKind::Diffusion, device, Some(weights), |vs| {
            unet::UNet2DConditionModel::new(vs, self.unet.clone())
        })
    }

    pub fn build_clip_transformer(
        &self,
        weights: StateDict,
        device: Device,
    ) -> Result<LoadedModel<clip::ClipTextTransformer>, LoadError> {
        build(ModelKind::Clip, device, Some(weights), |vs| {
            clip::ClipTextTransformer::new(vs, &self.clip)
        })
    }

    /// Randomly initialised models, no checkpoint involved.
    pub fn init_models(&self, devices: &DeviceSetup) -> Result<Models, LoadError> {
        let encoder = build(ModelKind::Encoder, devices.get(ModelKind::Encoder), None, |vs| {
            vae::Encoder::new(vs, &self.autoencoder)
        })?;
        let decoder = build(ModelKind::Decoder, devices.get(ModelKind::Decoder), None, |vs| {
            vae::Decoder::new(vs, &self.autoencoder)
        })?;
        let diffusion = build(ModelKind::Diffusion, devices.get(ModelKind::Diffusion), None, |vs| {
            unet::UNet2DConditionModel::new(vs, self.unet.clone())
        })?;
        let clip = build(ModelKind::Clip, devices.get(ModelKind::Clip), None, |vs| {
            clip::ClipTextTransformer::new(vs, &self.clip)
        })?;
        Ok(Models { clip, encoder, decoder, diffusion })
    }

    /// Reads a checkpoint and builds the four models from it.
    ///
    /// Each model only accepts a state dict that holds exactly the parameters
    /// it declares, with the declared shapes. Any difference is an error and
    /// no model is returned.
    pub fn load_models<P: AsRef<Path>>(
        &self,
        path: P,
        devices: &DeviceSetup,
    ) -> Result<Models, LoadError> {
        let mut state_dicts = convert::load_from_standard_weights(path, devices, self)?;
        let encoder =
            self.build_encoder(state_dicts.take(ModelKind::Encoder), devices.get(ModelKind::Encoder))?;
        let decoder =
            self.build_decoder(state_dicts.take(ModelKind::Decoder), devices.get(ModelKind::Decoder))?;
        let diffusion =
            self.build_unet(state_dicts.take(ModelKind::Diffusion), devices.get(ModelKind::Diffusion))?;
        let clip = self
            .build_clip_transformer(state_dicts.take(ModelKind::Clip), devices.get(ModelKind::Clip))?;
        Ok(Models { clip, encoder, decoder, diffusion })
    }
}

/// Loads a Stable Diffusion v1.x checkpoint, placing the four models on
/// `device` (`cpu`, `cuda`, `cuda:N`, `mps` or `auto`).
pub fn load_models<P: AsRef<Path>>(path: P, device: &str) -> Result<Models, LoadError> {
    let devices = DeviceSetup::new(device, vec![])?;
    StableDiffusionConfig::v1_5().load_models(path, &devices)
}
