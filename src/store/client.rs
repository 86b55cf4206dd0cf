//! HTTP store backend.
//!
//! Used by every process that does not embed the store: worker nodes,
//! standby masters and the admin CLI. Watch events arrive by long-polling
//! the serving process; connection failures surface as
//! `StoreUnavailable`, which the adapter turns into its
//! disconnected/reconnected session stream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::server::{
    ChildrenResponse, CreateBody, CreateResponse, EventsResponse, ExistsResponse, ReadResponse,
    SessionResponse, WatchBody, WriteBody, WriteResponse,
};
use super::{CreateMode, SessionId, StoreBackend, StoreEvent, WatchKind};
use crate::error::{KattaError, KattaResult};

/// Extra room on top of the requested long-poll window before the HTTP
/// call itself is abandoned
const POLL_GRACE: Duration = Duration::from_secs(5);

const OP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteStore {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteStore {
    /// `addr` is `host:port` or a full `http://` URL.
    pub fn new(addr: &str) -> Self {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { base_url, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> KattaResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| format!("http status {}", status));
        Err(match status {
            StatusCode::NOT_FOUND => KattaError::PathNotFound(message),
            StatusCode::CONFLICT => KattaError::StoreConflict(message),
            StatusCode::REQUEST_TIMEOUT => KattaError::RpcTimeout(message),
            StatusCode::SERVICE_UNAVAILABLE => KattaError::StoreUnavailable(message),
            _ => KattaError::NetworkError(message),
        })
    }
}

#[async_trait]
impl StoreBackend for RemoteStore {
    async fn create_session(&self) -> KattaResult<SessionId> {
        let response = self
            .http
            .post(self.url("/store/session"))
            .timeout(OP_TIMEOUT)
            .send()
            .await
            .map_err(|e| KattaError::StoreUnavailable(e.to_string()))?;
        let session: SessionResponse = self.decode(response).await?;
        Ok(session.session_id)
    }

    async fn close_session(&self, session: &SessionId) -> KattaResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/store/session/{}", session)))
            .timeout(OP_TIMEOUT)
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn create(
        &self,
        session: &SessionId,
        path: &str,
        data: String,
        mode: CreateMode,
    ) -> KattaResult<String> {
        let body = CreateBody {
            session: session.clone(),
            path: path.to_string(),
            data,
            mode,
        };
        let response = self
            .http
            .post(self.url("/store/entry"))
            .timeout(OP_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        match self.decode::<CreateResponse>(response).await {
            Ok(created) => Ok(created.path),
            // A create conflict means the path is taken, not a stale write
            Err(KattaError::StoreConflict(_)) => Err(KattaError::PathExists(path.to_string())),
            Err(other) => Err(other),
        }
    }

    async fn read(&self, path: &str) -> KattaResult<(String, u64)> {
        let response = self
            .http
            .get(self.url("/store/entry"))
            .timeout(OP_TIMEOUT)
            .query(&[("path", path)])
            .send()
            .await?;
        let read: ReadResponse = self.decode(response).await?;
        Ok((read.data, read.version))
    }

    async fn write(
        &self,
        path: &str,
        data: String,
        expected_version: Option<u64>,
    ) -> KattaResult<u64> {
        let body = WriteBody {
            path: path.to_string(),
            data,
            expected_version,
        };
        let response = self
            .http
            .put(self.url("/store/entry"))
            .timeout(OP_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let written: WriteResponse = self.decode(response).await?;
        Ok(written.version)
    }

    async fn delete(&self, path: &str) -> KattaResult<()> {
        let response = self
            .http
            .delete(self.url("/store/entry"))
            .timeout(OP_TIMEOUT)
            .query(&[("path", path), ("recursive", "false")])
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> KattaResult<()> {
        let response = self
            .http
            .delete(self.url("/store/entry"))
            .timeout(OP_TIMEOUT)
            .query(&[("path", path), ("recursive", "true")])
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> KattaResult<bool> {
        let response = self
            .http
            .get(self.url("/store/exists"))
            .timeout(OP_TIMEOUT)
            .query(&[("path", path)])
            .send()
            .await?;
        let exists: ExistsResponse = self.decode(response).await?;
        Ok(exists.exists)
    }

    async fn children(&self, path: &str) -> KattaResult<Vec<String>> {
        let response = self
            .http
            .get(self.url("/store/children"))
            .timeout(OP_TIMEOUT)
            .query(&[("path", path)])
            .send()
            .await?;
        let children: ChildrenResponse = self.decode(response).await?;
        Ok(children.children)
    }

    async fn watch(&self, session: &SessionId, path: &str, kind: WatchKind) -> KattaResult<()> {
        let body = WatchBody {
            session: session.clone(),
            path: path.to_string(),
            kind,
        };
        let response = self
            .http
            .post(self.url("/store/watch"))
            .timeout(OP_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn poll_events(
        &self,
        session: &SessionId,
        max_wait: Duration,
    ) -> KattaResult<Vec<StoreEvent>> {
        let wait_ms = max_wait.as_millis().to_string();
        let response = self
            .http
            .get(self.url("/store/events"))
            .timeout(max_wait + POLL_GRACE)
            .query(&[("session", session.as_str()), ("wait_ms", wait_ms.as_str())])
            .send()
            .await
            .map_err(|e| KattaError::StoreUnavailable(e.to_string()))?;
        let events: EventsResponse = self.decode(response).await?;
        Ok(events.events)
    }
}
