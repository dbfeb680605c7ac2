//! Outbound HTTP transport the Pull Scheduler uses to call a peer's Sync
//! HTTP Surface. Thin `reqwest` wrapper: unwrap the `{status, data,
//! message?}` envelope, translate transport failures into
//! `PeerUnreachable` and malformed/5xx responses into `PeerProtocolError`
//! — mirroring the teacher's only outbound call site
//! (`AuthEngine::refresh_apple_keys`: `reqwest::get(...).await` then
//! `.json::<T>().await`, each failure point logged and degraded
//! separately).

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CoreError;
use crate::store::LocationReport;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: T,
    #[serde(default)]
    #[allow(dead_code)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
    port: u16,
}

impl PeerClient {
    pub fn new(per_request_timeout_ms: u64, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(per_request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { client, port }
    }

    fn base_url(&self, peer_id: &str) -> String {
        format!("http://{peer_id}:{}", self.port)
    }

    async fn get_envelope<T: DeserializeOwned>(&self, url: &str) -> Result<T, CoreError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::PeerUnreachable(format!("{url}: {e}")))?;

        if resp.status().is_server_error() {
            return Err(CoreError::PeerProtocolError(format!(
                "{url}: peer returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(CoreError::PeerProtocolError(format!(
                "{url}: unexpected status {}",
                resp.status()
            )));
        }

        let envelope: Envelope<Value> = resp
            .json()
            .await
            .map_err(|e| CoreError::PeerProtocolError(format!("{url}: malformed JSON: {e}")))?;

        if envelope.status != "success" {
            return Err(CoreError::PeerProtocolError(format!(
                "{url}: peer envelope status = {}",
                envelope.status
            )));
        }

        serde_json::from_value(envelope.data)
            .map_err(|e| CoreError::PeerProtocolError(format!("{url}: unexpected data shape: {e}")))
    }

    /// Inclusive range pull for reports authored by `node_id`, served by
    /// `peer_id`. Used for both forward and backward windowed pulls and for
    /// deep sync.
    pub async fn fetch_range(
        &self,
        peer_id: &str,
        node_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<LocationReport>, CoreError> {
        let url = format!(
            "{}/api/sync/node/{node_id}/from/{from_ms}/to/{to_ms}",
            self.base_url(peer_id)
        );
        self.get_envelope(&url).await
    }

    pub async fn fetch_node_list(&self, peer_id: &str) -> Result<Vec<String>, CoreError> {
        #[derive(Deserialize)]
        struct NodeList {
            node_ids: Vec<String>,
        }
        let url = format!("{}/api/sync/node/list", self.base_url(peer_id));
        let list: NodeList = self.get_envelope(&url).await?;
        Ok(list.node_ids)
    }

    pub async fn trigger_remote_sync(&self, peer_id: &str) -> Result<Value, CoreError> {
        let url = format!("{}/api/sync", self.base_url(peer_id));
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| CoreError::PeerUnreachable(format!("{url}: {e}")))?;
        let envelope: Envelope<Value> = resp
            .json()
            .await
            .map_err(|e| CoreError::PeerProtocolError(format!("{url}: malformed JSON: {e}")))?;
        Ok(envelope.data)
    }

    pub async fn fetch_status(&self, peer_id: &str) -> Result<Value, CoreError> {
        let url = format!("{}/api/sync/status", self.base_url(peer_id));
        self.get_envelope(&url).await
    }
}
