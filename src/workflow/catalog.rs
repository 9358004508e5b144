/// Next-step option catalog
///
/// Static configuration loaded once at startup and shared read-only behind an
/// `Arc` for the life of the process. Next-step records refer to options by id.

use crate::workflow::types::NextStepOption;
use std::{collections::HashMap, path::Path};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read next step options from {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse next step options: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate next step option id: {0}")]
    DuplicateOption(String),
}

/// Immutable lookup of next-step options keyed by id
#[derive(Debug, Default)]
pub struct NextStepCatalog {
    options: HashMap<String, NextStepOption>,
}

impl NextStepCatalog {
    /// Build a catalog, rejecting duplicate ids
    pub fn from_options(options: Vec<NextStepOption>) -> Result<Self, CatalogError> {
        let mut by_id = HashMap::with_capacity(options.len());
        for option in options {
            if by_id.contains_key(&option.id) {
                return Err(CatalogError::DuplicateOption(option.id));
            }
            by_id.insert(option.id.clone(), option);
        }
        Ok(Self { options: by_id })
    }

    /// Parse a JSON array of options
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let options: Vec<NextStepOption> = serde_json::from_str(json)?;
        Self::from_options(options)
    }

    /// Load the catalog from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;

        tracing::info!("📚 Loaded {} next step options from {}", catalog.len(), path.display());

        Ok(catalog)
    }

    pub fn lookup(&self, option_id: &str) -> Option<&NextStepOption> {
        self.options.get(option_id)
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
