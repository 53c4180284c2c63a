//! Persisted list view parameters
//!
//! A list view remembers its sort, order, search and filters between
//! openings. Stores are keyed by view name.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::protocol::{ListArgs, ListFilter, OrderMode};
use crate::types::{Result, ScriptoriumError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default = "default_true")]
    pub order_asc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<Value>>,
    /// Display mode (lines, cards, ...), kept as given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<String>,
}

impl Default for ViewParams {
    fn default() -> Self {
        Self {
            sort_by: None,
            order_asc: true,
            search: None,
            filters: BTreeMap::new(),
            view: None,
        }
    }
}

impl ViewParams {
    /// Arguments for the first page of this view
    pub fn to_list_args(&self, first: usize) -> ListArgs {
        ListArgs {
            first: Some(first),
            after: None,
            search: self.search.clone().filter(|s| !s.trim().is_empty()),
            order_by: self.sort_by.clone(),
            order_mode: if self.order_asc {
                OrderMode::Asc
            } else {
                OrderMode::Desc
            },
            filters: self
                .filters
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(key, values)| ListFilter {
                    key: key.clone(),
                    values: values.clone(),
                })
                .collect(),
        }
    }
}

/// Where view parameters are kept
#[async_trait]
pub trait ViewParamsStore: Send + Sync {
    async fn load(&self, view: &str) -> Result<Option<ViewParams>>;
    async fn save(&self, view: &str, params: &ViewParams) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryViewParamsStore {
    views: DashMap<String, ViewParams>,
}

impl MemoryViewParamsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ViewParamsStore for MemoryViewParamsStore {
    async fn load(&self, view: &str) -> Result<Option<ViewParams>> {
        Ok(self.views.get(view).map(|p| p.clone()))
    }

    async fn save(&self, view: &str, params: &ViewParams) -> Result<()> {
        self.views.insert(view.to_string(), params.clone());
        Ok(())
    }
}

/// One JSON file per view under a directory
pub struct FileViewParamsStore {
    dir: PathBuf,
}

impl FileViewParamsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, view: &str) -> PathBuf {
        let name: String = view
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl ViewParamsStore for FileViewParamsStore {
    async fn load(&self, view: &str) -> Result<Option<ViewParams>> {
        let path = self.path_for(view);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let params = serde_json::from_str(&raw).map_err(|e| {
            ScriptoriumError::Internal(format!("Corrupt view params {}: {}", path.display(), e))
        })?;
        Ok(Some(params))
    }

    async fn save(&self, view: &str, params: &ViewParams) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(view);
        let raw = serde_json::to_string_pretty(params)?;
        tokio::fs::write(&path, raw).await?;
        debug!("Saved view params to {}", path.display());
        Ok(())
    }
}
