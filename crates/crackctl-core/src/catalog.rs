//! Attack definitions per phase name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttackPhase, DependencyRef};

/// Placeholder the server substitutes with the hashlist path.
pub const HASHLIST_PLACEHOLDER: &str = "#HL#";

/// Longest built-in brute-force mask.
pub const MAX_BUILTIN_BRUTE_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackSpec {
    pub attack_cmd: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("phase catalog parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("attack command for {phase} must reference {HASHLIST_PLACEHOLDER}")]
    MissingHashlistPlaceholder { phase: AttackPhase },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseCatalog {
    phases: BTreeMap<AttackPhase, AttackSpec>,
}

impl PhaseCatalog {
    /// `brute-1` .. `brute-7`: all-printable masks, no file dependencies.
    pub fn builtin() -> Self {
        let mut phases = BTreeMap::new();
        for len in 1..=MAX_BUILTIN_BRUTE_LEN {
            let Ok(phase) = AttackPhase::parse(&format!("brute-{len}")) else {
                continue;
            };
            phases.insert(
                phase,
                AttackSpec {
                    attack_cmd: format!("{HASHLIST_PLACEHOLDER} -a 3 {}", "?a".repeat(len)),
                    dependencies: Vec::new(),
                },
            );
        }
        Self { phases }
    }

    /// Parses a JSON object `{ "<phase>": { "attack_cmd": ..., "dependencies": [...] } }`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let phases: BTreeMap<AttackPhase, AttackSpec> = serde_json::from_slice(bytes)?;
        let catalog = Self { phases };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Entries in `other` replace same-named entries in `self`.
    pub fn merged(mut self, other: PhaseCatalog) -> Self {
        self.phases.extend(other.phases);
        self
    }

    pub fn get(&self, phase: &AttackPhase) -> Option<&AttackSpec> {
        self.phases.get(phase)
    }

    pub fn contains(&self, phase: &AttackPhase) -> bool {
        self.phases.contains_key(phase)
    }

    pub fn insert(&mut self, phase: AttackPhase, spec: AttackSpec) {
        self.phases.insert(phase, spec);
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for (phase, spec) in &self.phases {
            if !spec.attack_cmd.contains(HASHLIST_PLACEHOLDER) {
                return Err(CatalogError::MissingHashlistPlaceholder {
                    phase: phase.clone(),
                });
            }
        }
        Ok(())
    }
}
