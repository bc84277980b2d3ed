//! Ablation gate: static switches disabling modes, stages, or individual
//! mutators, used to attribute fuzzing progress to its sources in
//! controlled experiments.
//!
//! The configuration is read once from a JSON file; absent keys mean
//! "enabled". A disabled mode/stage skips its code path entirely; with
//! every mutator disabled, mutation degrades to the identity.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AblationError {
    #[error("failed to read ablation config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse ablation config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AblationConfig {
    // Modes.
    pub disable_mode_generate: bool,
    pub disable_mode_hints: bool,
    pub disable_mode_mutate: bool,
    pub disable_mode_smash: bool,
    // Mutators.
    pub disable_mutator_insert_call: bool,
    pub disable_mutator_mutate_arg: bool,
    pub disable_mutator_remove_call: bool,
    pub disable_mutator_splice: bool,
    pub disable_mutator_squash_any: bool,
    // Stages.
    pub disable_stage_collide: bool,
    pub disable_stage_minimize: bool,
}

impl AblationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AblationError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn from_json(json: &str) -> Result<Self, AblationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// False only when every mutator is disabled; mutation is then an
    /// identity operation and the mutation engine is not invoked at all.
    pub fn any_mutator_enabled(&self) -> bool {
        !(self.disable_mutator_insert_call
            && self.disable_mutator_mutate_arg
            && self.disable_mutator_remove_call
            && self.disable_mutator_splice
            && self.disable_mutator_squash_any)
    }
}
