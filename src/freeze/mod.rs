//! Parameter freezing policy
//!
//! Turns the model's ordered parameter groups plus the declarative freeze and
//! adapter settings into a per-group trainable flag. Adapter mode is a
//! structural transformation: every base group is frozen and new
//! `adapter.layer.<i>` groups are derived from the targeted projections.

use crate::config::{AdapterConfig, FreezeSpec};
use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What part of the network a group belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    Embeddings,
    Layer(usize),
    Head,
    Adapter(usize),
}

/// One named weight tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParameterInfo {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Projection module a weight belongs to, e.g. `q_proj` for `encoder.layer.0.q_proj.weight`
    pub fn module(&self) -> Option<&str> {
        let mut parts = self.name.rsplit('.');
        let leaf = parts.next()?;
        if leaf != "weight" {
            return None;
        }
        parts.next()
    }
}

/// A named subset of model weights that is frozen or trained as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterGroup {
    pub name: String,
    pub kind: GroupKind,
    pub parameters: Vec<ParameterInfo>,
}

impl ParameterGroup {
    pub fn new(name: impl Into<String>, kind: GroupKind, parameters: Vec<ParameterInfo>) -> Self {
        Self {
            name: name.into(),
            kind,
            parameters,
        }
    }

    pub fn numel(&self) -> usize {
        self.parameters.iter().map(ParameterInfo::numel).sum()
    }
}

/// Trainable flag for one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDecision {
    pub name: String,
    pub kind: GroupKind,
    pub trainable: bool,
    pub numel: usize,
}

/// Outcome of the policy for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezePlan {
    /// Base groups in model order, followed by any adapter groups
    pub decisions: Vec<GroupDecision>,
    /// Groups created by adapter injection (empty outside adapter mode)
    pub adapter_groups: Vec<ParameterGroup>,
}

impl FreezePlan {
    pub fn trainable(&self) -> impl Iterator<Item = &GroupDecision> {
        self.decisions.iter().filter(|d| d.trainable)
    }

    pub fn frozen(&self) -> impl Iterator<Item = &GroupDecision> {
        self.decisions.iter().filter(|d| !d.trainable)
    }

    pub fn frozen_names(&self) -> BTreeSet<String> {
        self.frozen().map(|d| d.name.clone()).collect()
    }

    pub fn is_trainable(&self, group: &str) -> bool {
        self.decisions.iter().any(|d| d.name == group && d.trainable)
    }

    pub fn trainable_parameters(&self) -> usize {
        self.trainable().map(|d| d.numel).sum()
    }

    pub fn total_parameters(&self) -> usize {
        self.decisions.iter().map(|d| d.numel).sum()
    }

    /// The optimizer needs at least one trainable weight
    pub fn ensure_trainable(&self) -> HarnessResult<()> {
        if self.trainable_parameters() == 0 {
            return Err(HarnessError::Config(
                "freeze settings leave no trainable parameters; unfreeze the head or enable adapters"
                    .into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for FreezePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total_parameters().max(1);
        write!(
            f,
            "trainable {}/{} params ({:.2}%) | groups trainable={} frozen={}",
            self.trainable_parameters(),
            self.total_parameters(),
            100.0 * self.trainable_parameters() as f64 / total as f64,
            self.trainable().count(),
            self.frozen().count(),
        )
    }
}

/// Decide, for every group, whether it is trained
pub fn plan(
    groups: &[ParameterGroup],
    freeze: &FreezeSpec,
    adapter: &AdapterConfig,
) -> HarnessResult<FreezePlan> {
    if adapter.enabled {
        let adapter_groups = derive_adapter_groups(groups, adapter)?;
        let mut decisions: Vec<GroupDecision> =
            groups.iter().map(|g| decision(g, false)).collect();
        decisions.extend(adapter_groups.iter().map(|g| decision(g, true)));
        return Ok(FreezePlan {
            decisions,
            adapter_groups,
        });
    }

    let mut layer_indices: Vec<usize> = groups
        .iter()
        .filter_map(|g| match g.kind {
            GroupKind::Layer(i) => Some(i),
            _ => None,
        })
        .collect();
    layer_indices.sort_unstable();
    let frozen_layers: BTreeSet<usize> = layer_indices
        .into_iter()
        .take(freeze.encoder_layers)
        .collect();

    let decisions = groups
        .iter()
        .map(|g| {
            let frozen = match g.kind {
                GroupKind::Embeddings => freeze.embeddings,
                GroupKind::Layer(i) => frozen_layers.contains(&i),
                GroupKind::Head => freeze.head,
                GroupKind::Adapter(_) => false,
            };
            decision(g, !frozen)
        })
        .collect();

    Ok(FreezePlan {
        decisions,
        adapter_groups: Vec::new(),
    })
}

fn decision(group: &ParameterGroup, trainable: bool) -> GroupDecision {
    GroupDecision {
        name: group.name.clone(),
        kind: group.kind,
        trainable,
        numel: group.numel(),
    }
}

/// Low-rank pair shapes for every targeted projection, one group per layer
fn derive_adapter_groups(
    groups: &[ParameterGroup],
    adapter: &AdapterConfig,
) -> HarnessResult<Vec<ParameterGroup>> {
    let mut matched: BTreeSet<&str> = BTreeSet::new();
    let mut derived = Vec::new();

    for group in groups {
        let GroupKind::Layer(index) = group.kind else {
            continue;
        };
        let mut parameters = Vec::new();
        for param in &group.parameters {
            let Some(module) = param.module() else {
                continue;
            };
            let Some(target) = adapter.target_modules.iter().find(|t| t.as_str() == module) else {
                continue;
            };
            let [out_dim, in_dim] = param.shape.as_slice() else {
                continue;
            };
            matched.insert(target.as_str());
            let prefix = format!("adapter.layer.{index}.{module}");
            parameters.push(ParameterInfo::new(format!("{prefix}.lora_a"), &[adapter.rank, *in_dim]));
            parameters.push(ParameterInfo::new(format!("{prefix}.lora_b"), &[*out_dim, adapter.rank]));
        }
        if !parameters.is_empty() {
            derived.push(ParameterGroup::new(
                format!("adapter.layer.{index}"),
                GroupKind::Adapter(index),
                parameters,
            ));
        }
    }

    let unmatched: Vec<&str> = adapter
        .target_modules
        .iter()
        .map(String::as_str)
        .filter(|t| !matched.contains(t))
        .collect();
    if !unmatched.is_empty() {
        return Err(HarnessError::Config(format!(
            "adapter target module(s) match no projection in the model: {}",
            unmatched.join(", ")
        )));
    }
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layer(i: usize) -> ParameterGroup {
        let mut params = Vec::new();
        for module in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            params.push(ParameterInfo::new(format!("encoder.layer.{i}.{module}.weight"), &[8, 8]));
            params.push(ParameterInfo::new(format!("encoder.layer.{i}.{module}.bias"), &[8]));
        }
        ParameterGroup::new(format!("encoder.layer.{i}"), GroupKind::Layer(i), params)
    }

    fn model_groups(layers: usize) -> Vec<ParameterGroup> {
        let mut groups = vec![ParameterGroup::new(
            "embeddings",
            GroupKind::Embeddings,
            vec![ParameterInfo::new("embeddings.token.weight", &[16, 8])],
        )];
        groups.extend((0..layers).map(layer));
        groups.push(ParameterGroup::new(
            "head",
            GroupKind::Head,
            vec![ParameterInfo::new("head.lm_head.weight", &[16, 8])],
        ));
        groups
    }

    fn adapter_on() -> AdapterConfig {
        AdapterConfig {
            enabled: true,
            rank: 2,
            ..AdapterConfig::default()
        }
    }

    #[test]
    fn test_freeze_embeddings_and_first_layers() {
        let groups = model_groups(4);
        let spec = FreezeSpec {
            embeddings: true,
            encoder_layers: 2,
            head: false,
        };
        let plan = plan(&groups, &spec, &AdapterConfig::default()).unwrap();
        let frozen = plan.frozen_names();
        assert!(frozen.contains("embeddings"));
        assert!(frozen.contains("encoder.layer.0"));
        assert!(frozen.contains("encoder.layer.1"));
        assert!(plan.is_trainable("encoder.layer.2"));
        assert!(plan.is_trainable("head"));
        assert!(plan.adapter_groups.is_empty());
    }

    #[test]
    fn test_layers_frozen_by_index_not_position() {
        let mut groups = model_groups(3);
        groups[1..4].reverse();
        let spec = FreezeSpec {
            encoder_layers: 1,
            ..FreezeSpec::default()
        };
        let plan = plan(&groups, &spec, &AdapterConfig::default()).unwrap();
        assert_eq!(plan.frozen_names(), BTreeSet::from(["encoder.layer.0".to_string()]));
    }

    #[test]
    fn test_degenerate_freeze_keeps_head() {
        let groups = model_groups(2);
        let spec = FreezeSpec {
            embeddings: true,
            encoder_layers: 10,
            head: false,
        };
        let plan = plan(&groups, &spec, &AdapterConfig::default()).unwrap();
        assert_eq!(plan.trainable().count(), 1);
        assert!(plan.is_trainable("head"));
        assert!(plan.ensure_trainable().is_ok());
    }

    #[test]
    fn test_nothing_trainable_is_config_error() {
        let groups = model_groups(2);
        let spec = FreezeSpec {
            embeddings: true,
            encoder_layers: 10,
            head: true,
        };
        let plan = plan(&groups, &spec, &AdapterConfig::default()).unwrap();
        let err = plan.ensure_trainable().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_adapter_mode_supersedes_freeze_rules() {
        let groups = model_groups(3);
        let plan = plan(&groups, &FreezeSpec::default(), &adapter_on()).unwrap();
        assert_eq!(plan.frozen().count(), groups.len());
        assert_eq!(plan.adapter_groups.len(), 3);
        let first = &plan.adapter_groups[0];
        assert_eq!(first.name, "adapter.layer.0");
        assert_eq!(first.parameters.len(), 8);
        assert_eq!(first.parameters[0].name, "adapter.layer.0.q_proj.lora_a");
        assert_eq!(first.parameters[0].shape, vec![2, 8]);
        assert_eq!(first.parameters[1].shape, vec![8, 2]);
        assert!(plan.trainable().all(|d| matches!(d.kind, GroupKind::Adapter(_))));
        println!("{plan}");
    }

    #[test]
    fn test_unknown_target_module_rejected() {
        let adapter = AdapterConfig {
            target_modules: vec!["q_proj".into(), "gate_proj".into()],
            ..adapter_on()
        };
        let err = plan(&model_groups(1), &FreezeSpec::default(), &adapter).unwrap_err();
        assert!(err.to_string().contains("gate_proj"));
    }

    proptest! {
        #[test]
        fn prop_trainable_and_frozen_partition_groups(
            layers in 0usize..8,
            embeddings in any::<bool>(),
            head in any::<bool>(),
            encoder_layers in 0usize..12,
            adapter in any::<bool>(),
        ) {
            let groups = model_groups(layers);
            let spec = FreezeSpec { embeddings, encoder_layers, head };
            let adapter_cfg = if adapter && layers > 0 { adapter_on() } else { AdapterConfig::default() };
            let plan = plan(&groups, &spec, &adapter_cfg).unwrap();

            let trainable: BTreeSet<String> = plan.trainable().map(|d| d.name.clone()).collect();
            let frozen = plan.frozen_names();
            prop_assert!(trainable.is_disjoint(&frozen));

            let union: BTreeSet<String> = trainable.union(&frozen).cloned().collect();
            let mut expected: BTreeSet<String> = groups.iter().map(|g| g.name.clone()).collect();
            expected.extend(plan.adapter_groups.iter().map(|g| g.name.clone()));
            prop_assert_eq!(union, expected);

            if adapter_cfg.enabled {
                prop_assert_eq!(plan.adapter_groups.len(), layers);
                for g in &groups {
                    prop_assert!(!plan.is_trainable(&g.name));
                }
            } else {
                prop_assert!(plan.adapter_groups.is_empty());
                let frozen_layers = frozen.iter().filter(|n| n.starts_with("encoder.layer.")).count();
                prop_assert_eq!(frozen_layers, encoder_layers.min(layers));
            }
        }
    }
}
