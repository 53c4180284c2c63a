//! Paginated list views with persisted parameters

use std::sync::Arc;
use tracing::debug;

use super::cache::LocalCache;
use super::transport::Transport;
use crate::connection::Connection;
use crate::protocol::OperationRequest;
use crate::schema::EntityType;
use crate::store::EntityProjection;
use crate::types::{Result, ScriptoriumError};
use crate::view_params::{ViewParams, ViewParamsStore};

pub const DEFAULT_LIST_PAGE_SIZE: usize = 25;

/// One named list. Its sort, order, search and filters survive reopening;
/// its loaded edges live in the shared cache under the view name.
pub struct ListView {
    transport: Arc<dyn Transport>,
    cache: LocalCache,
    params_store: Arc<dyn ViewParamsStore>,
    view: String,
    entity_type: Option<EntityType>,
    params: ViewParams,
    page_size: usize,
}

impl ListView {
    /// Restore the saved parameters and load the first page
    pub async fn open(
        transport: Arc<dyn Transport>,
        cache: LocalCache,
        params_store: Arc<dyn ViewParamsStore>,
        view: &str,
        entity_type: Option<EntityType>,
    ) -> Result<Self> {
        let params = params_store.load(view).await?.unwrap_or_default();
        let mut list = Self {
            transport,
            cache,
            params_store,
            view: view.to_string(),
            entity_type,
            params,
            page_size: DEFAULT_LIST_PAGE_SIZE,
        };
        list.reload().await?;
        Ok(list)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn params(&self) -> &ViewParams {
        &self.params
    }

    /// Save new parameters and reload from the first page
    pub async fn update_params(&mut self, params: ViewParams) -> Result<()> {
        self.params_store.save(&self.view, &params).await?;
        self.params = params;
        self.reload().await
    }

    /// Replace the loaded edges with the first page
    pub async fn reload(&mut self) -> Result<()> {
        let args = self.params.to_list_args(self.page_size);
        let page = self.fetch(OperationRequest::entities(self.entity_type, &args)).await?;
        for node in page.nodes() {
            self.cache.merge(node);
        }
        debug!(
            "View {} loaded {} of {}",
            self.view,
            page.len(),
            page.page_info.global_count
        );
        self.cache.put_connection(&self.view, page);
        Ok(())
    }

    /// Fetch `count` more edges after the last loaded one and append them.
    /// Returns how many new edges were added.
    pub async fn load_more(&mut self, count: usize) -> Result<usize> {
        let Some(loaded) = self.cache.connection(&self.view) else {
            self.reload().await?;
            return Ok(self.len());
        };
        if !loaded.page_info.has_next_page {
            return Ok(0);
        }

        let mut args = self.params.to_list_args(count.max(1));
        args.after = loaded.page_info.end_cursor.clone();
        let page = self.fetch(OperationRequest::entities(self.entity_type, &args)).await?;
        for node in page.nodes() {
            self.cache.merge(node);
        }
        Ok(self.cache.merge_connection(&self.view, page))
    }

    async fn fetch(&self, request: OperationRequest) -> Result<Connection<EntityProjection>> {
        let data = self.transport.execute(request).await?;
        serde_json::from_value(data)
            .map_err(|e| ScriptoriumError::Internal(format!("Invalid list payload: {}", e)))
    }

    pub fn connection(&self) -> Option<Connection<EntityProjection>> {
        self.cache.connection(&self.view)
    }

    pub fn global_count(&self) -> usize {
        self.connection()
            .map(|c| c.page_info.global_count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.connection().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_more(&self) -> bool {
        self.connection()
            .is_some_and(|c| c.page_info.has_next_page)
    }
}
