//! Read-only registry of export connectors
//!
//! Records come from a JSON array file. A connector advertises the export
//! formats (MIME types) it handles in `connector_scope`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::types::{Result, ScriptoriumError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub connector_scope: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// One export format and whether any active connector serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFormat {
    pub format: String,
    pub active: bool,
    pub connectors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    records: Vec<ConnectorRecord>,
}

impl ConnectorRegistry {
    pub fn new(records: Vec<ConnectorRecord>) -> Self {
        Self { records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the registry from a JSON array of connector records
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let records: Vec<ConnectorRecord> = serde_json::from_str(&raw).map_err(|e| {
            ScriptoriumError::Config(format!("Invalid connectors file {}: {}", path.display(), e))
        })?;
        info!(
            "Loaded {} connectors from {}",
            records.len(),
            path.display()
        );
        Ok(Self::new(records))
    }

    pub fn records(&self) -> &[ConnectorRecord] {
        &self.records
    }

    /// Format -> connectors whose scope includes it (active or not)
    pub fn scopes_by_format(&self) -> BTreeMap<String, Vec<&ConnectorRecord>> {
        let mut scopes: BTreeMap<String, Vec<&ConnectorRecord>> = BTreeMap::new();
        for record in &self.records {
            for format in &record.connector_scope {
                scopes.entry(format.clone()).or_default().push(record);
            }
        }
        scopes
    }

    pub fn formats(&self) -> Vec<String> {
        self.scopes_by_format().into_keys().collect()
    }

    /// Some active connector has the format in scope
    pub fn is_export_active(&self, format: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.active && r.connector_scope.iter().any(|s| s == format))
    }

    /// Any format has an active connector
    pub fn is_export_possible(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.active && !r.connector_scope.is_empty())
    }

    pub fn export_formats(&self) -> Vec<ExportFormat> {
        self.scopes_by_format()
            .into_iter()
            .map(|(format, records)| ExportFormat {
                active: records.iter().any(|r| r.active),
                connectors: records.iter().map(|r| r.name.clone()).collect(),
                format,
            })
            .collect()
    }
}
