//! Outbound RPC to worker nodes: binary bodies over HTTP.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{KattaError, KattaResult};
use crate::protocol::query::{from_wire, to_wire};
use crate::protocol::{
    DetailsRequest, DetailsResponse, DocFreqsRequest, DocFreqsResponse, SearchRequest,
    SearchResponse,
};

pub struct NodeRpc {
    http: reqwest::Client,
}

impl NodeRpc {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        addr: &str,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> KattaResult<Resp> {
        let body = to_wire(request)?;
        let response = self
            .http
            .post(format!("http://{}/rpc/{}", addr, method))
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let bytes = response.bytes().await?;
            return from_wire(&bytes);
        }
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| format!("http status {}", status));
        Err(match status {
            StatusCode::BAD_REQUEST => KattaError::MalformedQuery(message),
            StatusCode::REQUEST_TIMEOUT => KattaError::RpcTimeout(message),
            StatusCode::SERVICE_UNAVAILABLE => KattaError::ShardUnavailable(message),
            _ => KattaError::NetworkError(message),
        })
    }

    pub async fn doc_freqs(
        &self,
        addr: &str,
        request: &DocFreqsRequest,
        timeout: Duration,
    ) -> KattaResult<DocFreqsResponse> {
        self.call(addr, "doc-freqs", request, timeout).await
    }

    pub async fn search(
        &self,
        addr: &str,
        request: &SearchRequest,
        timeout: Duration,
    ) -> KattaResult<SearchResponse> {
        self.call(addr, "search", request, timeout).await
    }

    pub async fn get_details(
        &self,
        addr: &str,
        request: &DetailsRequest,
        timeout: Duration,
    ) -> KattaResult<DetailsResponse> {
        self.call(addr, "details", request, timeout).await
    }
}

impl Default for NodeRpc {
    fn default() -> Self {
        Self::new()
    }
}
