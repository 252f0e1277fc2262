//! Api-key authentication.
//!
//! Requests carry an `x-api-key` header. The [`AuthResolver`] turns the
//! credential into an [`AuthContext`] naming the application, its queue
//! grants and whether it is the master pseudo-application. The resolver is
//! a seam: production uses [`KeyAuthResolver`] over the metadata store,
//! tests inject canned contexts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ApiError, ErrorCode};
use crate::metastore::{MetaError, MetadataStore, WILDCARD};

/// Id of the privileged pseudo-application.
pub const MASTER_APPLICATION_ID: &str = "master";

/// Application every request resolves to while api-key auth is disabled.
pub const DEFAULT_APPLICATION_ID: &str = "default";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Resolved application id.
    pub application_id: String,
    /// Queues the application may use; may contain the wildcard.
    pub allowed_queues: Vec<String>,
    /// Whether the caller holds global admin capability.
    pub is_master: bool,
}

impl AuthContext {
    /// The master context: every queue, global admin.
    #[must_use]
    pub fn master() -> Self {
        Self {
            application_id: MASTER_APPLICATION_ID.to_string(),
            allowed_queues: vec![WILDCARD.to_string()],
            is_master: true,
        }
    }

    /// The context used while api-key auth is disabled.
    #[must_use]
    pub fn default_application() -> Self {
        Self {
            application_id: DEFAULT_APPLICATION_ID.to_string(),
            allowed_queues: vec![WILDCARD.to_string()],
            is_master: false,
        }
    }

    /// Whether the caller may use `queue`.
    #[must_use]
    pub fn allows_queue(&self, queue: &str) -> bool {
        self.is_master
            || self
                .allowed_queues
                .iter()
                .any(|q| q == WILDCARD || q == queue)
    }

    /// Whether the caller may read or mutate a job owned by `application_id`.
    #[must_use]
    pub fn owns(&self, application_id: &str) -> bool {
        self.is_master || self.application_id == application_id
    }
}

/// Resolves a credential into an [`AuthContext`].
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Resolve the `x-api-key` header value.
    ///
    /// # Errors
    ///
    /// `MISSING_API_KEY` when no credential was provided,
    /// `INVALID_API_KEY` when it resolves to nothing.
    async fn resolve(&self, api_key: Option<&str>) -> Result<AuthContext, ApiError>;
}

/// Production resolver: master key short-circuit, then metadata lookup.
pub struct KeyAuthResolver {
    metastore: Arc<dyn MetadataStore>,
    master_key: Option<String>,
    enabled: bool,
}

impl KeyAuthResolver {
    /// Create a resolver.
    #[must_use]
    pub fn new(
        metastore: Arc<dyn MetadataStore>,
        master_key: Option<String>,
        enabled: bool,
    ) -> Self {
        Self {
            metastore,
            master_key,
            enabled,
        }
    }
}

#[async_trait]
impl AuthResolver for KeyAuthResolver {
    async fn resolve(&self, api_key: Option<&str>) -> Result<AuthContext, ApiError> {
        if !self.enabled {
            return Ok(AuthContext::default_application());
        }

        let Some(key) = api_key else {
            return Err(ApiError::new(
                ErrorCode::MissingApiKey,
                "missing x-api-key header",
            )
            .with_fix("send the application's api key in the x-api-key header"));
        };

        if self.master_key.as_deref() == Some(key) {
            return Ok(AuthContext::master());
        }

        match self.metastore.application_by_api_key(key).await {
            Ok(app) => Ok(AuthContext {
                application_id: app.id,
                allowed_queues: app.allowed_queues,
                is_master: false,
            }),
            Err(MetaError::NotFound(_)) => Err(ApiError::new(
                ErrorCode::InvalidApiKey,
                "unknown api key",
            )
            .with_cause("the key was revoked or never existed")),
            Err(other) => Err(other.into()),
        }
    }
}
