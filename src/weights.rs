//! # Parameter mappings
//!
//! A checkpoint is split into one [`StateDict`] per model. Applying a state dict
//! to a model is exact-match: every declared parameter has to be supplied with
//! the declared shape and no extra tensor may be left over.
use crate::error::LoadError;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tch::{nn, Tensor};

/// Parameter name to tensor mapping for a single model.
pub type StateDict = HashMap<String, Tensor>;

/// The four models a Stable Diffusion checkpoint holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKind {
    Clip,
    Encoder,
    Decoder,
    Diffusion,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] =
        [ModelKind::Clip, ModelKind::Encoder, ModelKind::Decoder, ModelKind::Diffusion];

    /// The fixed key used for this model, also the name prefix in saved checkpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Clip => "clip",
            ModelKind::Encoder => "encoder",
            ModelKind::Decoder => "decoder",
            ModelKind::Diffusion => "diffusion",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == key)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A checkpoint after remapping, one state dict per model.
#[derive(Debug, Default)]
pub struct StateDicts {
    pub clip: StateDict,
    pub encoder: StateDict,
    pub decoder: StateDict,
    pub diffusion: StateDict,
}

impl StateDicts {
    pub fn get(&self, kind: ModelKind) -> &StateDict {
        match kind {
            ModelKind::Clip => &self.clip,
            ModelKind::Encoder => &self.encoder,
            ModelKind::Decoder => &self.decoder,
            ModelKind::Diffusion => &self.diffusion,
        }
    }

    pub fn get_mut(&mut self, kind: ModelKind) -> &mut StateDict {
        match kind {
            ModelKind::Clip => &mut self.clip,
            ModelKind::Encoder => &mut self.encoder,
            ModelKind::Decoder => &mut self.decoder,
            ModelKind::Diffusion => &mut self.diffusion,
        }
    }

    /// Moves the state dict of one model out, leaving an empty one behind.
    pub fn take(&mut self, kind: ModelKind) -> StateDict {
        std::mem::take(self.get_mut(kind))
    }

    pub fn len(&self) -> usize {
        ModelKind::ALL.iter().map(|kind| self.get(*kind).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copies `state` into the variables of `vs`.
///
/// Nothing is written unless the names match exactly and all the shapes agree.
pub fn load_state_dict(
    vs: &mut nn::VarStore,
    model: ModelKind,
    state: StateDict,
) -> Result<(), LoadError> {
    let mut variables = vs.variables();
    let declared: BTreeSet<&String> = variables.keys().collect();
    let supplied: BTreeSet<&String> = state.keys().collect();
    let missing: Vec<String> = declared.difference(&supplied).map(|s| s.to_string()).collect();
    let unexpected: Vec<String> = supplied.difference(&declared).map(|s| s.to_string()).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(LoadError::ParameterMismatch { model, missing, unexpected });
    }

    let mut names: Vec<&String> = state.keys().collect();
    names.sort();
    for name in names.iter() {
        let expected = variables[*name].size();
        let actual = state[*name].size();
        if expected != actual {
            return Err(LoadError::ShapeMismatch {
                model,
                name: name.to_string(),
                expected,
                actual,
            });
        }
    }

    tch::no_grad(|| -> Result<(), LoadError> {
        for (name, src) in state.iter() {
            if let Some(var) = variables.get_mut(name) {
                var.f_copy_(src)?;
            }
        }
        Ok(())
    })?;
    log::debug!("{model}: copied {} tensors", state.len());
    Ok(())
}

/// Shallow copies of the variables held by `vs`, keyed by parameter name.
pub fn state_dict(vs: &nn::VarStore) -> StateDict {
    vs.variables()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn linear_store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(&vs.root() / "proj", 3, 2, Default::default());
        vs
    }

    fn matching_state() -> StateDict {
        let mut state = StateDict::new();
        state.insert("proj.weight".to_string(), Tensor::randn([2, 3], (Kind::Float, Device::Cpu)));
        state.insert("proj.bias".to_string(), Tensor::randn([2], (Kind::Float, Device::Cpu)));
        state
    }

    #[test]
    fn exact_match_copies_values() {
        let mut vs = linear_store();
        let state = matching_state();
        let expected: Vec<(String, Tensor)> =
            state.iter().map(|(k, v)| (k.clone(), v.copy())).collect();
        load_state_dict(&mut vs, ModelKind::Clip, state).unwrap();
        let loaded = state_dict(&vs);
        for (name, tensor) in expected {
            assert!(loaded[&name].equal(&tensor), "{name}");
        }
    }

    #[test]
    fn missing_parameter() {
        let mut vs = linear_store();
        let mut state = matching_state();
        state.remove("proj.bias");
        match load_state_dict(&mut vs, ModelKind::Encoder, state) {
            Err(LoadError::ParameterMismatch { model, missing, unexpected }) => {
                assert_eq!(model, ModelKind::Encoder);
                assert_eq!(missing, vec!["proj.bias".to_string()]);
                assert!(unexpected.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn unexpected_parameter() {
        let mut vs = linear_store();
        let mut state = matching_state();
        state.insert("proj.scale".to_string(), Tensor::ones([2], (Kind::Float, Device::Cpu)));
        match load_state_dict(&mut vs, ModelKind::Decoder, state) {
            Err(LoadError::ParameterMismatch { missing, unexpected, .. }) => {
                assert!(missing.is_empty());
                assert_eq!(unexpected, vec!["proj.scale".to_string()]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn shape_mismatch_leaves_variables_untouched() {
        let mut vs = linear_store();
        let before = state_dict(&vs)["proj.bias"].copy();
        let mut state = matching_state();
        state.insert("proj.weight".to_string(), Tensor::zeros([3, 2], (Kind::Float, Device::Cpu)));
        match load_state_dict(&mut vs, ModelKind::Diffusion, state) {
            Err(LoadError::ShapeMismatch { name, expected, actual, .. }) => {
                assert_eq!(name, "proj.weight");
                assert_eq!(expected, vec![2, 3]);
                assert_eq!(actual, vec![3, 2]);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(state_dict(&vs)["proj.bias"].equal(&before));
    }

    #[test]
    fn half_precision_is_cast_on_copy() {
        let mut vs = linear_store();
        let state: StateDict =
            matching_state().into_iter().map(|(k, v)| (k, v.to_kind(Kind::Half))).collect();
        load_state_dict(&mut vs, ModelKind::Clip, state).unwrap();
        assert_eq!(state_dict(&vs)["proj.weight"].kind(), Kind::Float);
    }

    #[test]
    fn model_keys() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_key(kind.as_str()), Some(kind));
        }
        assert_eq!(ModelKind::from_key("vae"), None);
    }
}
