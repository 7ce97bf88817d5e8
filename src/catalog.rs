//! In-memory package catalog.
//!
//! The catalog is loaded once from a [`CatalogSource`](crate::source::CatalogSource)
//! and never mutated afterwards. Ids map to descriptors in O(1); name search is
//! a linear scan over a lowercased copy of every display name, which is fine
//! at the few-thousand-entry scale of a game's mod catalog.

use crate::error::CatalogFormatError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Raw catalog record, as delivered by a source. Every field is optional so
/// validation happens in [`CatalogIndex::load`] with a useful error instead
/// of an opaque serde failure. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "downloadURL", alias = "downloadUrl")]
    pub download_url: Option<String>,
    #[serde(default, alias = "dependencyIds")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageDescriptor {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub download_url: String,
    pub dependency_ids: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct CatalogIndex {
    packages: Vec<PackageDescriptor>,
    by_id: HashMap<String, usize>,
    search_names: Vec<String>,
}

impl CatalogIndex {
    pub fn load<I>(records: I) -> Result<Self, CatalogFormatError>
    where
        I: IntoIterator<Item = CatalogRecord>,
    {
        let mut index = CatalogIndex::default();

        for (position, record) in records.into_iter().enumerate() {
            let id = match record.id.map(|id| id.trim().to_string()) {
                Some(id) if !id.is_empty() => id,
                _ => return Err(CatalogFormatError::MissingId { index: position }),
            };
            let version = match record.version {
                Some(version) if !version.trim().is_empty() => version,
                _ => return Err(CatalogFormatError::MissingVersion { id }),
            };
            let download_url = match record.download_url {
                Some(url) if !url.trim().is_empty() => url,
                _ => return Err(CatalogFormatError::MissingDownloadUrl { id }),
            };

            if index.by_id.contains_key(&id) {
                warn!(%id, "duplicate catalog id, keeping the first record");
                continue;
            }

            let display_name = record
                .name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| id.clone());
            index.search_names.push(display_name.to_lowercase());
            index.by_id.insert(id.clone(), index.packages.len());
            index.packages.push(PackageDescriptor {
                id,
                display_name,
                version,
                download_url,
                dependency_ids: record.dependencies,
            });
        }

        debug!(packages = index.packages.len(), "catalog indexed");
        Ok(index)
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<&PackageDescriptor> {
        self.by_id.get(id).map(|&slot| &self.packages[slot])
    }

    /// Case-insensitive substring match on display names, in catalog order.
    pub fn search<'a>(&'a self, query: &str) -> impl Iterator<Item = &'a PackageDescriptor> + 'a {
        let needle = query.to_lowercase();
        self.search_names
            .iter()
            .zip(&self.packages)
            .filter(move |(name, _)| name.contains(&needle))
            .map(|(_, package)| package)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
