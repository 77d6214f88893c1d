use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::OrganizationDoc,
    error::{StoreError, StoreErrorCode},
    protocol::WatchEvent,
};
use throttle::RateLimiter;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

use crate::{RegistryChange, RegistryStore, WatchStream};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request budget for the registry-sync client. Wider than the version API
/// default because a single full push fans out into many point writes.
pub const DEFAULT_SYNC_MAX_REQUESTS: usize = 60;

/// Document-store client over plain HTTP plus a WebSocket change feed.
///
/// A denied local rate-limit check surfaces as `resource-exhausted`, so the
/// retry policy treats local throttling exactly like remote throttling.
pub struct HttpRegistryStore {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl HttpRegistryStore {
    pub fn new(base_url: impl Into<String>, limiter: RateLimiter) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                StoreError::new(
                    StoreErrorCode::Internal,
                    format!("failed to build HTTP client: {err}"),
                )
            })?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            limiter,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/organizations", self.base_url.trim_end_matches('/'))
    }

    fn document_url(&self, key: &str) -> String {
        format!("{}/{key}", self.collection_url())
    }

    fn watch_url(&self) -> Result<String, StoreError> {
        let collection = self.collection_url();
        let ws_base = if let Some(rest) = collection.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = collection.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(StoreError::new(
                StoreErrorCode::FailedPrecondition,
                "registry store URL must start with http:// or https://",
            ));
        };
        Ok(format!("{ws_base}/watch"))
    }

    fn gate(&self) -> Result<(), StoreError> {
        if self.limiter.can_make_request() {
            Ok(())
        } else {
            Err(StoreError::new(
                StoreErrorCode::ResourceExhausted,
                "local request budget exhausted",
            ))
        }
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::new(StoreErrorCode::Unavailable, "request timed out")
    } else {
        StoreError::new(StoreErrorCode::Unavailable, err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = StoreErrorCode::from_status(status.as_u16());
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        body
    };
    Err(StoreError::new(code, message))
}

#[async_trait]
impl RegistryStore for HttpRegistryStore {
    async fn put(&self, key: &str, doc: OrganizationDoc) -> Result<(), StoreError> {
        self.gate()?;
        let response = self
            .http
            .put(self.document_url(key))
            .json(&doc)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<OrganizationDoc>, StoreError> {
        self.gate()?;
        let response = self
            .http
            .get(self.document_url(key))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let doc = response.json().await.map_err(|err| {
            StoreError::new(
                StoreErrorCode::Internal,
                format!("invalid organization document: {err}"),
            )
        })?;
        Ok(Some(doc))
    }

    async fn get_all(&self) -> Result<BTreeMap<String, OrganizationDoc>, StoreError> {
        self.gate()?;
        let response = self
            .http
            .get(self.collection_url())
            .send()
            .await
            .map_err(transport_error)?;
        // An absent collection reads as an empty registry.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        let response = check_status(response).await?;
        response.json().await.map_err(|err| {
            StoreError::new(
                StoreErrorCode::Internal,
                format!("invalid organization collection: {err}"),
            )
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.gate()?;
        let response = self
            .http
            .delete(self.document_url(key))
            .send()
            .await
            .map_err(transport_error)?;
        // Deleting an absent document is a no-op, not a failure.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn watch(&self) -> Result<WatchStream, StoreError> {
        self.gate()?;
        let url = self.watch_url()?;
        let (socket, _) = connect_async(url.as_str()).await.map_err(|err| {
            StoreError::new(
                StoreErrorCode::Unavailable,
                format!("failed to connect registry watch: {err}"),
            )
        })?;
        let (_, reader) = socket.split();

        let stream = reader.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<WatchEvent>(&text) {
                    Ok(WatchEvent::Changed) => Some(Ok(RegistryChange)),
                    Ok(WatchEvent::Error { code, message }) => {
                        Some(Err(StoreError::new(code, message)))
                    }
                    Err(err) => {
                        warn!(%err, "ignoring malformed registry watch frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(err) => Some(Err(StoreError::new(
                    StoreErrorCode::Unavailable,
                    format!("registry watch transport failed: {err}"),
                ))),
            }
        });
        Ok(stream.boxed())
    }
}
