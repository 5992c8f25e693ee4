//! Capability contract the harnesses expect from a sequence model.
//!
//! Models own their parameters and compute their own loss: a forward pass
//! takes the tensors of one collated batch and returns `(predictions, loss)`
//! where `loss` is a scalar. Parameters are enumerated together with the kind
//! of module that owns them so the optimizer can decide which ones receive
//! weight decay.

use std::collections::HashSet;

use candle_core::{Result as CandleResult, Tensor, TensorId, Var};

use crate::TrainingError;

/// Kind of layer a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Linear,
    Conv1d,
    Other,
}

/// Role a parameter plays inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    Weight,
    Bias,
}

#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
    pub module: ModuleKind,
    pub role: ParamRole,
}

impl NamedParameter {
    pub fn new(name: impl Into<String>, var: Var, module: ModuleKind, role: ParamRole) -> Self {
        Self {
            name: name.into(),
            var,
            module,
            role,
        }
    }

    pub fn id(&self) -> TensorId {
        self.var.as_tensor().id()
    }

    fn is_dense(&self) -> bool {
        matches!(self.module, ModuleKind::Linear | ModuleKind::Conv1d)
    }
}

pub trait TrainableModel: Send {
    /// Runs the model on one batch, returning `(predictions, scalar loss)`.
    fn forward(&self, inputs: &[Tensor]) -> CandleResult<(Tensor, Tensor)>;

    fn parameters(&self) -> Vec<NamedParameter>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

/// Parameters split into the decayed and the exempt optimizer groups.
#[derive(Debug, Clone, Default)]
pub struct ParameterGroups {
    pub decay: Vec<NamedParameter>,
    pub no_decay: Vec<NamedParameter>,
}

impl ParameterGroups {
    pub fn len(&self) -> usize {
        self.decay.len() + self.no_decay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `parameters` into weight-decay groups.
///
/// Weights of `Linear` and `Conv1d` modules are decayed, everything else is
/// exempt. With `decay_dense_biases` the biases of those modules join the
/// decayed group. A tensor enumerated more than once is kept once, under its
/// first name, and is decayed if any of its owners qualifies.
pub fn partition_parameters(
    parameters: Vec<NamedParameter>,
    decay_dense_biases: bool,
) -> Result<ParameterGroups, TrainingError> {
    let decay_ids: HashSet<TensorId> = parameters
        .iter()
        .filter(|param| {
            param.is_dense() && (param.role == ParamRole::Weight || decay_dense_biases)
        })
        .map(NamedParameter::id)
        .collect();

    let mut all_ids = HashSet::new();
    let mut unique = Vec::with_capacity(parameters.len());
    for param in parameters {
        if all_ids.insert(param.id()) {
            unique.push(param);
        }
    }

    let mut groups = ParameterGroups::default();
    for param in unique {
        if decay_ids.contains(&param.id()) {
            groups.decay.push(param);
        } else {
            groups.no_decay.push(param);
        }
    }

    let decay_set: HashSet<_> = groups.decay.iter().map(NamedParameter::id).collect();
    let no_decay_set: HashSet<_> = groups.no_decay.iter().map(NamedParameter::id).collect();
    if decay_set.intersection(&no_decay_set).next().is_some() {
        return Err(TrainingError::initialization(
            "parameter assigned to both weight decay groups",
        ));
    }
    let union: HashSet<_> = decay_set.union(&no_decay_set).copied().collect();
    if union != all_ids {
        return Err(TrainingError::initialization(
            "weight decay groups do not cover every model parameter",
        ));
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn var(shape: &[usize]) -> Var {
        Var::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn sample_parameters() -> Vec<NamedParameter> {
        vec![
            NamedParameter::new("embed.weight", var(&[8, 4]), ModuleKind::Other, ParamRole::Weight),
            NamedParameter::new("conv.weight", var(&[4, 4, 3]), ModuleKind::Conv1d, ParamRole::Weight),
            NamedParameter::new("conv.bias", var(&[4]), ModuleKind::Conv1d, ParamRole::Bias),
            NamedParameter::new("norm.weight", var(&[4]), ModuleKind::Other, ParamRole::Weight),
            NamedParameter::new("head.weight", var(&[8, 4]), ModuleKind::Linear, ParamRole::Weight),
            NamedParameter::new("head.bias", var(&[8]), ModuleKind::Linear, ParamRole::Bias),
        ]
    }

    fn names(params: &[NamedParameter]) -> Vec<&str> {
        params.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn dense_weights_are_decayed_and_everything_else_is_exempt() {
        let groups = partition_parameters(sample_parameters(), false).unwrap();
        assert_eq!(names(&groups.decay), vec!["conv.weight", "head.weight"]);
        assert_eq!(
            names(&groups.no_decay),
            vec!["embed.weight", "conv.bias", "norm.weight", "head.bias"]
        );
    }

    #[test]
    fn dense_biases_can_join_the_decayed_group() {
        let groups = partition_parameters(sample_parameters(), true).unwrap();
        assert_eq!(
            names(&groups.decay),
            vec!["conv.weight", "conv.bias", "head.weight", "head.bias"]
        );
        assert_eq!(names(&groups.no_decay), vec!["embed.weight", "norm.weight"]);
    }

    #[test]
    fn partition_is_exact_cover() {
        let params = sample_parameters();
        let all: HashSet<_> = params.iter().map(NamedParameter::id).collect();
        let groups = partition_parameters(params, false).unwrap();
        let decay: HashSet<_> = groups.decay.iter().map(NamedParameter::id).collect();
        let exempt: HashSet<_> = groups.no_decay.iter().map(NamedParameter::id).collect();
        assert!(decay.is_disjoint(&exempt));
        assert_eq!(decay.union(&exempt).copied().collect::<HashSet<_>>(), all);
    }

    #[test]
    fn shared_tensors_are_kept_once_and_decayed_if_any_owner_is_dense() {
        let tied = var(&[8, 4]);
        let params = vec![
            NamedParameter::new("embed.weight", tied.clone(), ModuleKind::Other, ParamRole::Weight),
            NamedParameter::new("head.weight", tied, ModuleKind::Linear, ParamRole::Weight),
        ];
        let groups = partition_parameters(params, false).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(names(&groups.decay), vec!["embed.weight"]);
        assert!(groups.no_decay.is_empty());
    }
}
