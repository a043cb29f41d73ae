use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fleet_core::{AccessError, GrantOutcome, OperatorRegistry};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
struct OperatorsFile {
    #[serde(default)]
    operators: BTreeSet<String>,
}

/// Operator list persisted as a TOML file. Admins come from configuration.
#[derive(Debug)]
pub struct FileOperatorRegistry {
    path: PathBuf,
    admins: BTreeSet<String>,
    operators: RwLock<BTreeSet<String>>,
}

impl FileOperatorRegistry {
    /// Loads the registry; a missing file means no operators yet.
    pub fn load(path: impl AsRef<Path>, admins: &[String]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let operators = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading operators {}", path.display()))?;
            toml::from_str::<OperatorsFile>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
                .operators
        } else {
            BTreeSet::new()
        };
        Ok(Self {
            path,
            admins: admins.iter().cloned().collect(),
            operators: RwLock::new(operators),
        })
    }

    fn persist(&self, operators: &BTreeSet<String>) -> Result<(), AccessError> {
        let document = OperatorsFile {
            operators: operators.clone(),
        };
        let raw = toml::to_string(&document).map_err(|err| AccessError::Storage(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| AccessError::Storage(err.to_string()))?;
        }
        fs::write(&self.path, raw).map_err(|err| {
            AccessError::Storage(format!("writing {}: {err}", self.path.display()))
        })
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<GrantOutcome, AccessError> {
        let mut operators = self.operators.write();
        let mut next = operators.clone();
        if !apply(&mut next) {
            return Ok(GrantOutcome::Unchanged);
        }
        self.persist(&next)?;
        *operators = next;
        Ok(GrantOutcome::Changed)
    }
}

impl OperatorRegistry for FileOperatorRegistry {
    fn is_authorized(&self, operator: &str) -> bool {
        self.is_admin(operator) || self.operators.read().contains(operator)
    }

    fn is_admin(&self, operator: &str) -> bool {
        self.admins.contains(operator)
    }

    fn add(&self, operator: &str) -> Result<GrantOutcome, AccessError> {
        self.update(|set| set.insert(operator.to_string()))
    }

    fn remove(&self, operator: &str) -> Result<GrantOutcome, AccessError> {
        self.update(|set| set.remove(operator))
    }

    fn list(&self) -> Vec<String> {
        self.operators.read().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn grants_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/operators.toml");
        let admins = vec!["1".to_string()];

        let registry = FileOperatorRegistry::load(&path, &admins).unwrap();
        assert!(registry.list().is_empty());
        assert_eq!(registry.add("42"), Ok(GrantOutcome::Changed));
        assert_eq!(registry.add("42"), Ok(GrantOutcome::Unchanged));
        assert_eq!(registry.add("7"), Ok(GrantOutcome::Changed));
        assert_eq!(registry.remove("7"), Ok(GrantOutcome::Changed));

        let reloaded = FileOperatorRegistry::load(&path, &admins).unwrap();
        assert_eq!(reloaded.list(), ["42"]);
        assert!(reloaded.is_authorized("42"));
        assert!(reloaded.is_authorized("1"));
        assert!(!reloaded.is_admin("42"));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("operators.toml");
        fs::write(&path, "operators = 5").unwrap();
        assert!(FileOperatorRegistry::load(&path, &[]).is_err());
    }
}
