//! JSON-RPC client for the fullnode pool.
//!
//! Every outbound call carries a minimum acceptable chain height; endpoints
//! report their height through a background poller and a call only routes to
//! an endpoint that has reached the minimum. With several fullnodes behind
//! the indexer this is what keeps a query about block N away from a node
//! that has not synced N yet.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use acorn_common::AcornError;
use num_bigint::{BigInt, BigUint};
use serde::Deserialize;
use serde_json::{json, Value};

/// Retry delays for failed RPC calls (in seconds)
const RPC_RETRY_DELAYS: &[u64] = &[1, 2, 5, 10, 20, 30];
const RPC_MAX_RETRIES: usize = 10;

const HEIGHT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait between re-checks while no endpoint has reached the required height.
const ENDPOINT_WAIT: Duration = Duration::from_millis(500);

pub struct Endpoint {
    pub url: String,
    pub height: AtomicU64,
}

pub struct RpcClient {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
}

impl RpcClient {
    pub fn new(urls: Vec<String>) -> Result<Self, AcornError> {
        if urls.is_empty() {
            return Err(AcornError::Config("no RPC endpoints configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AcornError::Config(format!("failed to create HTTP client: {e}")))?;
        let endpoints = urls
            .into_iter()
            .map(|url| Endpoint {
                url,
                height: AtomicU64::new(0),
            })
            .collect();
        Ok(Self {
            client,
            endpoints,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Highest height any endpoint has reported.
    pub fn best_height(&self) -> u32 {
        self.endpoints
            .iter()
            .map(|e| e.height.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0) as u32
    }

    /// Block until at least one endpoint reports a height.
    pub async fn wait_for_height(&self) -> u32 {
        loop {
            let height = self.best_height();
            if height > 0 {
                return height;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Poll `getblockcount` on every endpoint forever.
    pub fn spawn_height_tracker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let rpc = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                rpc.refresh_heights().await;
                tokio::time::sleep(HEIGHT_POLL_INTERVAL).await;
            }
        })
    }

    async fn refresh_heights(&self) {
        for endpoint in &self.endpoints {
            match self.request(&endpoint.url, "getblockcount", json!([])).await {
                Ok(value) => {
                    if let Some(count) = value.as_u64() {
                        endpoint
                            .height
                            .store(count.saturating_sub(1), Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    tracing::debug!("getblockcount failed for {}: {}", endpoint.url, e);
                }
            }
        }
    }

    /// Round-robin pick among endpoints that have reached `min_height`.
    fn pick(&self, min_height: u32) -> Option<&Endpoint> {
        let n = self.endpoints.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for i in 0..n {
            let endpoint = &self.endpoints[(start + i) % n];
            if endpoint.height.load(Ordering::Relaxed) >= min_height as u64 {
                return Some(endpoint);
            }
        }
        None
    }

    async fn wait_for_endpoint(&self, min_height: u32) -> &Endpoint {
        let mut reported = false;
        loop {
            if let Some(endpoint) = self.pick(min_height) {
                return endpoint;
            }
            if !reported {
                tracing::debug!("no endpoint at height >= {min_height} yet, waiting");
                reported = true;
            }
            tokio::time::sleep(ENDPOINT_WAIT).await;
        }
    }

    /// One call with bounded retries. Waiting for an endpoint to reach the
    /// minimum height does not count as a retry; only failed requests do.
    pub async fn call(
        &self,
        min_height: u32,
        method: &str,
        params: Value,
    ) -> Result<Value, AcornError> {
        let mut last_error = None;
        for attempt in 0..RPC_MAX_RETRIES {
            let endpoint = self.wait_for_endpoint(min_height).await;
            match self.request(&endpoint.url, method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = RPC_RETRY_DELAYS
                        .get(attempt)
                        .copied()
                        .unwrap_or(*RPC_RETRY_DELAYS.last().unwrap_or(&30));
                    tracing::warn!(
                        "{} failed on {} (attempt {}/{}): {}. Retrying in {}s",
                        method,
                        endpoint.url,
                        attempt + 1,
                        RPC_MAX_RETRIES,
                        e,
                        delay
                    );
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
        Err(last_error.unwrap_or(AcornError::NoEndpoint(min_height)))
    }

    async fn request(&self, url: &str, method: &str, params: Value) -> Result<Value, AcornError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AcornError::Rpc(format!("request failed: {e}")))?;
        let value: Value = response
            .json()
            .await
            .map_err(|e| AcornError::Rpc(format!("invalid response: {e}")))?;

        if let Some(error) = value.get("error") {
            if !error.is_null() {
                return Err(AcornError::Rpc(error.to_string()));
            }
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| AcornError::Rpc("missing result".into()))
    }

    /// Application log for a transaction. The pipeline cannot skip a
    /// transaction, so this keeps trying; an unparseable payload is treated
    /// as a log with no executions.
    pub async fn get_application_log(&self, block_index: u32, txid: &str) -> ApplicationLog {
        loop {
            match self
                .call(block_index, "getapplicationlog", json!([txid]))
                .await
            {
                Ok(value) => match serde_json::from_value(value) {
                    Ok(log) => return log,
                    Err(e) => {
                        tracing::warn!("unparseable application log for {txid}: {e}");
                        return ApplicationLog::default();
                    }
                },
                Err(e) => {
                    tracing::warn!("getapplicationlog({txid}) failed: {e}, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Execute a read-only script on a node at `min_height` or above.
    pub async fn invoke_script(
        &self,
        min_height: u32,
        script: &str,
    ) -> Result<InvokeResult, AcornError> {
        let value = self.call(min_height, "invokescript", json!([script])).await?;
        serde_json::from_value(value).map_err(|e| AcornError::Rpc(format!("invalid invokescript result: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationLog {
    #[serde(default)]
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Execution {
    #[serde(default)]
    pub vmstate: String,
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub contract: String,
    pub state: Option<StackItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvokeResult {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub stack: Vec<StackItem>,
}

/// A typed VM stack value as the fullnode serializes it: `Integer` values
/// are decimal strings, `ByteArray` values are hex, `Array` values nest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

impl StackItem {
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn as_items(&self) -> Option<Vec<StackItem>> {
        serde_json::from_value(self.value.clone()).ok()
    }

    /// Numeric value: `Integer` parses its decimal string, `ByteArray` is an
    /// unsigned little-endian integer in hex. Anything else is not a number.
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self.kind.as_str() {
            "Integer" => match &self.value {
                Value::String(s) => BigInt::from_str(s).ok(),
                Value::Number(n) => n.as_i64().map(BigInt::from),
                _ => None,
            },
            "ByteArray" => {
                let hex_str = self.value.as_str()?;
                let bytes = hex::decode(hex_str).ok()?;
                Some(BigInt::from(BigUint::from_bytes_le(&bytes)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};


    fn client(urls: Vec<String>) -> RpcClient {
        RpcClient::new(urls).unwrap()
    }

    #[test]
    fn endpoint_selection_honors_min_height() {
        let rpc = client(vec!["http://a".into(), "http://b".into()]);
        rpc.endpoints[0].height.store(1000, Ordering::Relaxed);
        rpc.endpoints[1].height.store(999, Ordering::Relaxed);

        for _ in 0..8 {
            let endpoint = rpc.pick(1000).expect("node a qualifies");
            assert_eq!(endpoint.url, "http://a");
        }
        assert!(rpc.pick(1001).is_none());
        assert_eq!(rpc.best_height(), 1000);
    }

    #[tokio::test]
    async fn invoke_script_parses_state_and_stack() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {
                    "state": "HALT, BREAK",
                    "gas_consumed": "0.2",
                    "stack": [{"type": "ByteArray", "value": "0a00"}]
                }
            })))
            .mount(&server)
            .await;

        let rpc = client(vec![server.uri()]);
        rpc.endpoints[0].height.store(10, Ordering::Relaxed);

        let result = rpc.invoke_script(5, "00").await.unwrap();
        assert_eq!(result.state, "HALT, BREAK");
        assert_eq!(result.stack[0].as_bigint(), Some(BigInt::from(10)));
    }

    #[tokio::test]
    async fn rpc_error_object_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32601, "message": "method not found"}
            })))
            .mount(&server)
            .await;

        let rpc = client(vec![server.uri()]);
        let err = rpc
            .request(&rpc.endpoints[0].url, "getapplicationlog", json!(["0x0"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AcornError::Rpc(_)));
    }

    #[test]
    fn application_log_deserializes() {
        let log: ApplicationLog = serde_json::from_value(json!({
            "txid": "0xabc",
            "executions": [{
                "trigger": "Application",
                "vmstate": "HALT, BREAK",
                "gas_consumed": "2.855",
                "stack": [],
                "notifications": [{
                    "contract": "0x06fa8be9b6609d963e8fc63977b9f8dc5f10895f",
                    "state": {
                        "type": "Array",
                        "value": [
                            {"type": "ByteArray", "value": "7472616e73666572"},
                            {"type": "ByteArray", "value": ""},
                            {"type": "ByteArray", "value": "aa"},
                            {"type": "Integer", "value": "1"},
                            {"type": "Integer", "value": "7"}
                        ]
                    }
                }]
            }]
        }))
        .unwrap();

        assert_eq!(log.executions.len(), 1);
        let exec = &log.executions[0];
        assert_eq!(exec.vmstate, "HALT, BREAK");
        let state = exec.notifications[0].state.as_ref().unwrap();
        assert_eq!(state.kind, "Array");
        let items = state.as_items().unwrap();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].as_str(), Some("7472616e73666572"));
        assert_eq!(items[3].as_bigint(), Some(BigInt::from(1)));
    }

    #[test]
    fn stack_item_integers_and_byte_arrays_decode() {
        let int: StackItem =
            serde_json::from_value(json!({"type": "Integer", "value": "42"})).unwrap();
        assert_eq!(int.as_bigint(), Some(BigInt::from(42)));

        // 0x0100 little-endian = 1
        let bytes: StackItem =
            serde_json::from_value(json!({"type": "ByteArray", "value": "0100"})).unwrap();
        assert_eq!(bytes.as_bigint(), Some(BigInt::from(1)));

        let boolean: StackItem =
            serde_json::from_value(json!({"type": "Boolean", "value": true})).unwrap();
        assert_eq!(boolean.as_bigint(), None);
    }
}
