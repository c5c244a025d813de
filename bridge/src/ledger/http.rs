// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC client for a destination-ledger gateway.
//!
//! Methods:
//! - `ledger_transferFee(ledger)` returns the fee as a hex quantity.
//! - `ledger_mint(ledger, to, amount, memo)` and
//!   `ledger_burn(ledger, from, amount, memo)` return a [`TransferResult`].

use super::{LedgerClient, LedgerError, LedgerMemo};
use crate::types::{LedgerAccount, LedgerIndex, Principal};
use async_trait::async_trait;
use ethers::types::U256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_TRANSPORT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferResult {
    Ok(LedgerIndex),
    Err(LedgerError),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Clone, Debug)]
pub struct HttpLedgerClient {
    http_client: reqwest::Client,
    url: String,
    request_id: Arc<AtomicU64>,
}

fn is_transient_transport_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("connection closed")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("unexpected eof")
}

impl HttpLedgerClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(16)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(2))
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::TemporarilyUnavailable(e.to_string()))?;
        Ok(Self {
            http_client,
            url: url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, LedgerError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::SeqCst),
        };
        let unavailable = |e: String| LedgerError::TemporarilyUnavailable(format!("{method}: {e}"));

        let mut attempt = 0;
        let body = loop {
            attempt += 1;
            let result = async {
                let response = self
                    .http_client
                    .post(&self.url)
                    .json(&request)
                    .send()
                    .await?
                    .error_for_status()?;
                response.text().await
            }
            .await;
            match result {
                Ok(body) => break body,
                Err(err) if attempt < MAX_TRANSPORT_ATTEMPTS && is_transient_transport_error(&err) => {
                    warn!(
                        "[Ledger] transport error calling {} (attempt {}/{}), retrying: {}",
                        method, attempt, MAX_TRANSPORT_ATTEMPTS, err
                    );
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                Err(err) => return Err(unavailable(err.to_string())),
            }
        };
        debug!("[Ledger] <<< {} {}", method, body);

        let response: JsonRpcResponse = serde_json::from_str(&body).map_err(|e| unavailable(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(LedgerError::TemporarilyUnavailable(format!(
                "{method}: RPC error {}: {}",
                error.code, error.message
            )));
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|e| unavailable(e.to_string()))
    }

    async fn transfer(
        &self,
        method: &str,
        ledger: Principal,
        account: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError> {
        let result: TransferResult = self
            .call(
                method,
                vec![json!(ledger), json!(account), json!(amount), json!(memo)],
            )
            .await?;
        match result {
            TransferResult::Ok(index) => Ok(index),
            TransferResult::Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn transfer_fee(&self, ledger: Principal) -> Result<U256, LedgerError> {
        self.call("ledger_transferFee", vec![json!(ledger)]).await
    }

    async fn mint(
        &self,
        ledger: Principal,
        to: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError> {
        self.transfer("ledger_mint", ledger, to, amount, memo).await
    }

    async fn burn(
        &self,
        ledger: Principal,
        from: LedgerAccount,
        amount: U256,
        memo: LedgerMemo,
    ) -> Result<LedgerIndex, LedgerError> {
        self.transfer("ledger_burn", ledger, from, amount, memo).await
    }
}
