use serde::Deserialize;
use shared::{ClassInfo, Severity};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read class registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse class registry: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Class registry is empty")]
    Empty,
    #[error("Class index {0} is defined more than once")]
    DuplicateIndex(usize),
    #[error("Class index {0} is missing")]
    MissingIndex(usize),
    #[error("Model outputs {model} classes but the registry defines {registry}")]
    SizeMismatch { model: usize, registry: usize },
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    index: usize,
    name: String,
    abbr: String,
    full_name: String,
    severity: Severity,
    description: String,
    common_locations: String,
    action: String,
}

/// Read-only table from model output index to diagnostic metadata.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
}

impl ClassRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegistryError> {
        let entries: Vec<RegistryEntry> = serde_yaml::from_str(yaml)?;
        Self::from_entries(entries)
    }

    fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self, RegistryError> {
        if entries.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut slots: Vec<Option<ClassInfo>> = vec![None; entries.len()];
        for entry in entries {
            // An index past the table length means some lower index is absent.
            let slot = match slots.get_mut(entry.index) {
                Some(slot) => slot,
                None => continue,
            };
            if slot.is_some() {
                return Err(RegistryError::DuplicateIndex(entry.index));
            }
            *slot = Some(ClassInfo {
                name: entry.name,
                abbr: entry.abbr,
                full_name: entry.full_name,
                severity: entry.severity,
                description: entry.description,
                common_locations: entry.common_locations,
                action: entry.action,
            });
        }

        let classes = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(RegistryError::MissingIndex(index)))
            .collect::<Result<Vec<_>, _>>()?;

        log::info!("Class registry loaded with {} classes", classes.len());
        Ok(Self { classes })
    }

    /// Fails unless the registry covers exactly the model's output indices.
    pub fn ensure_covers(&self, model_classes: usize) -> Result<(), RegistryError> {
        if model_classes != self.classes.len() {
            return Err(RegistryError::SizeMismatch {
                model: model_classes,
                registry: self.classes.len(),
            });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&ClassInfo> {
        self.classes.get(index)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.full_name.as_str())
    }
}

#[cfg(test)]
pub(crate) const BUNDLED_REGISTRY: &str = include_str!("../../../config/classes.yaml");
