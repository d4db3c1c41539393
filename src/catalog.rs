//! Model catalog lookup.
//!
//! The catalog is read-only and fetched at most once per content type when
//! wrapped in a [`CachedCatalog`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::artifact::ContentType;
use crate::config::FeedConfig;
use crate::error::{FeedError, Result};
use crate::wire::ModelEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
        }
    }
}

/// Entries with neither an id nor a name are skipped.
fn model_info(entry: ModelEntry) -> Option<ModelInfo> {
    match entry {
        ModelEntry::Id(id) => Some(ModelInfo::new(id.clone(), id)),
        ModelEntry::Object {
            id,
            name,
            description,
        } => {
            let id = id.or_else(|| name.clone())?;
            let name = name.unwrap_or_else(|| id.clone());
            Some(ModelInfo {
                id,
                name,
                description,
            })
        }
    }
}

/// Find `query` by exact id, then by case-insensitive name.
pub fn resolve_model<'a>(models: &'a [ModelInfo], query: &str) -> Option<&'a ModelInfo> {
    models
        .iter()
        .find(|m| m.id == query)
        .or_else(|| models.iter().find(|m| m.name.eq_ignore_ascii_case(query)))
}

pub trait ModelCatalog: Send + Sync + 'static {
    fn list_models(&self, content_type: ContentType) -> BoxFuture<'_, Result<Arc<Vec<ModelInfo>>>>;

    /// Look `query` up with [`resolve_model`].
    fn resolve<'a>(
        &'a self,
        content_type: ContentType,
        query: &'a str,
    ) -> BoxFuture<'a, Result<Option<ModelInfo>>> {
        Box::pin(async move {
            let models = self.list_models(content_type).await?;
            Ok(resolve_model(&models, query).cloned())
        })
    }
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// A fixed catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: HashMap<ContentType, Arc<Vec<ModelInfo>>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_models(mut self, content_type: ContentType, models: Vec<ModelInfo>) -> Self {
        self.models.insert(content_type, Arc::new(models));
        self
    }
}

impl ModelCatalog for StaticCatalog {
    fn list_models(&self, content_type: ContentType) -> BoxFuture<'_, Result<Arc<Vec<ModelInfo>>>> {
        let models = self.models.get(&content_type).cloned().unwrap_or_default();
        Box::pin(async move { Ok(models) })
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpCatalog {
    client: reqwest::Client,
    image_base_url: String,
    text_base_url: String,
}

impl HttpCatalog {
    pub fn new(config: &FeedConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            image_base_url: config.image_base_url.trim_end_matches('/').to_string(),
            text_base_url: config.text_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn models_url(&self, content_type: ContentType) -> String {
        let base = match content_type {
            ContentType::Image => &self.image_base_url,
            ContentType::Text => &self.text_base_url,
        };
        format!("{base}/models")
    }
}

impl ModelCatalog for HttpCatalog {
    fn list_models(&self, content_type: ContentType) -> BoxFuture<'_, Result<Arc<Vec<ModelInfo>>>> {
        Box::pin(async move {
            let url = self.models_url(content_type);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| FeedError::transport(content_type, e))?;
            if !response.status().is_success() {
                return Err(FeedError::Http {
                    status: response.status().as_u16(),
                    url,
                });
            }
            let entries: Vec<ModelEntry> = response
                .json()
                .await
                .map_err(|e| FeedError::decode(content_type, e))?;
            let models: Vec<ModelInfo> = entries.into_iter().filter_map(model_info).collect();
            debug!(%content_type, count = models.len(), "fetched model catalog");
            Ok(Arc::new(models))
        })
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Fetches each content type's list once and serves it from memory after.
///
/// Failed fetches are not cached.
pub struct CachedCatalog<C> {
    inner: C,
    cache: Mutex<HashMap<ContentType, Arc<Vec<ModelInfo>>>>,
}

impl<C: ModelCatalog> CachedCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn invalidate(&self) {
        self.cache.lock().await.clear();
    }
}

impl<C: ModelCatalog> ModelCatalog for CachedCatalog<C> {
    fn list_models(&self, content_type: ContentType) -> BoxFuture<'_, Result<Arc<Vec<ModelInfo>>>> {
        Box::pin(async move {
            // Held across the fetch so concurrent callers share one request.
            let mut cache = self.cache.lock().await;
            if let Some(models) = cache.get(&content_type) {
                return Ok(Arc::clone(models));
            }
            let models = self.inner.list_models(content_type).await?;
            cache.insert(content_type, Arc::clone(&models));
            Ok(models)
        })
    }
}
