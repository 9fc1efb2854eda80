//! # Models
//!
//! The four networks held by a Stable Diffusion checkpoint. Each of them owns
//! its parameters through a dedicated var store.
use crate::weights::{self, StateDict};
use tch::nn;

pub mod attention;
pub mod clip;
pub mod layers;
pub mod unet;
pub mod vae;

/// A model together with the var store holding its parameters.
#[derive(Debug)]
pub struct LoadedModel<M> {
    model: M,
    vs: nn::VarStore,
}

impl<M> LoadedModel<M> {
    pub(crate) fn new(model: M, vs: nn::VarStore) -> Self {
        Self { model, vs }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// The current parameters, keyed by the names the model declares.
    pub fn state_dict(&self) -> StateDict {
        weights::state_dict(&self.vs)
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> i64 {
        self.vs.variables().values().map(|t| t.numel() as i64).sum()
    }
}

impl<M> std::ops::Deref for LoadedModel<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}
