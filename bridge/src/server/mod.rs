// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::with_metrics;
use crate::{
    error::BridgeError,
    metrics::EngineMetrics,
    scheduler::{RegisterTokenError, RequestScrapingError},
    server::handler::{
        AddTokenArg, AddTokenResult, DepositEventStatus, EngineInfo, EngineRequestHandler,
        EngineRequestHandlerTrait, EventsPage, WithdrawNativeArg, WithdrawTokenArg, WrapArg,
    },
    types::{LedgerAccount, Principal, WithdrawalId},
    withdraw::intake::{
        LedgerBurnError, RetrieveReceipt, WithdrawTokenError, WithdrawalError, WrapError,
    },
    withdraw::{WithdrawalDetail, WithdrawalSearch, WithdrawalStatus},
};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, H256};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

pub mod handler;

pub const APPLICATION_JSON: &str = "application/json";

/// Header carrying the hex-encoded principal of the caller.
pub const CALLER_HEADER: &str = "x-caller";

// Note: Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const HEALTH_PATH: &str = "/health";
pub const INFO_PATH: &str = "/info";
pub const WITHDRAW_NATIVE_PATH: &str = "/withdraw/native";
pub const WITHDRAW_TOKEN_PATH: &str = "/withdraw/token";
pub const WRAP_PATH: &str = "/withdraw/wrap";
pub const WITHDRAWAL_STATUS_PATH: &str = "/withdrawal/:id";
pub const WITHDRAWALS_PATH: &str = "/withdrawals";
pub const DEPOSIT_STATUS_PATH: &str = "/deposit/:tx_hash";
pub const SCRAPE_PATH: &str = "/scrape";
pub const EVENTS_PATH: &str = "/events";
pub const TOKENS_PATH: &str = "/tokens";
pub const METRICS_PATH: &str = "/metrics";

const DEFAULT_EVENTS_PAGE: usize = 100;

type ServerState<H> = (Arc<H>, Arc<EngineMetrics>);

pub fn run_server(
    socket_address: &SocketAddr,
    handler: EngineRequestHandler,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("[Server] Failed to bind {}: {:?}", socket_address, e);
                cancel.cancel();
                return;
            }
        };
        info!("[Server] Listening on {}", socket_address);
        if let Err(e) = axum::serve(
            listener,
            make_router(Arc::new(handler), metrics).into_make_service(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        {
            error!("[Server] Stopped with error: {:?}", e);
        }
    })
}

/// Serves the registry in the Prometheus text format.
pub fn run_metrics_server(
    socket_address: &SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(socket_address).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("[Metrics] Failed to bind {}: {:?}", socket_address, e);
                return;
            }
        };
        info!("[Metrics] Serving {} on {}", METRICS_PATH, socket_address);
        let router = Router::new()
            .route(METRICS_PATH, get(metrics_handler))
            .with_state(registry);
        if let Err(e) = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!("[Metrics] Stopped with error: {:?}", e);
        }
    })
}

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    let mut buffer = vec![];
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => buffer.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub(crate) fn make_router(
    handler: Arc<impl EngineRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<EngineMetrics>,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(INFO_PATH, get(info))
        .route(WITHDRAW_NATIVE_PATH, post(withdraw_native))
        .route(WITHDRAW_TOKEN_PATH, post(withdraw_token))
        .route(WRAP_PATH, post(wrap))
        .route(WITHDRAWAL_STATUS_PATH, get(withdrawal_status))
        .route(WITHDRAWALS_PATH, get(withdrawals))
        .route(DEPOSIT_STATUS_PATH, get(deposit_status))
        .route(SCRAPE_PATH, post(request_scraping))
        .route(EVENTS_PATH, get(events))
        .route(TOKENS_PATH, post(add_token))
        .with_state((handler, metrics))
}

/// Identity of the caller, taken from the [`CALLER_HEADER`] header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub LedgerAccount);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized = |message: String| (StatusCode::UNAUTHORIZED, message);
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .ok_or_else(|| unauthorized(format!("missing {CALLER_HEADER} header")))?;
        let text = value
            .to_str()
            .map_err(|e| unauthorized(format!("invalid {CALLER_HEADER} header: {e}")))?;
        let principal = Principal::from_str(text)
            .map_err(|e| unauthorized(format!("invalid {CALLER_HEADER} header: {e}")))?;
        if principal.is_anonymous() || principal.is_management() {
            return Err(unauthorized(format!(
                "{principal} is anonymous and cannot withdraw"
            )));
        }
        Ok(Caller(principal.into()))
    }
}

/// HTTP status of an error variant returned to API callers.
trait ErrorStatus {
    fn status(&self) -> StatusCode;
}

macro_rules! impl_json_error_response {
    ($($error:ty),*) => {
        $(
            impl IntoResponse for $error {
                fn into_response(self) -> Response {
                    (self.status(), Json(self)).into_response()
                }
            }
        )*
    };
}

impl ErrorStatus for LedgerBurnError {
    fn status(&self) -> StatusCode {
        match self {
            LedgerBurnError::TemporarilyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl ErrorStatus for WithdrawalError {
    fn status(&self) -> StatusCode {
        match self {
            WithdrawalError::AmountTooLow { .. } | WithdrawalError::InvalidDestination(_) => {
                StatusCode::BAD_REQUEST
            }
            WithdrawalError::AlreadyProcessing => StatusCode::CONFLICT,
            WithdrawalError::TooManyConcurrentRequests
            | WithdrawalError::TooManyPendingRequests => StatusCode::TOO_MANY_REQUESTS,
            WithdrawalError::TemporarilyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WithdrawalError::LedgerBurn(err) => err.status(),
        }
    }
}

impl ErrorStatus for WithdrawTokenError {
    fn status(&self) -> StatusCode {
        match self {
            WithdrawTokenError::TokenNotSupported { .. }
            | WithdrawTokenError::InvalidDestination(_) => StatusCode::BAD_REQUEST,
            WithdrawTokenError::AlreadyProcessing => StatusCode::CONFLICT,
            WithdrawTokenError::TooManyConcurrentRequests
            | WithdrawTokenError::TooManyPendingRequests => StatusCode::TOO_MANY_REQUESTS,
            WithdrawTokenError::TemporarilyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WithdrawTokenError::NativeLedgerError(err)
            | WithdrawTokenError::TokenLedgerError(err) => err.status(),
        }
    }
}

impl ErrorStatus for WrapError {
    fn status(&self) -> StatusCode {
        match self {
            WrapError::UnsupportedToken { .. } | WrapError::InvalidDestination(_) => {
                StatusCode::BAD_REQUEST
            }
            WrapError::AlreadyProcessing => StatusCode::CONFLICT,
            WrapError::TooManyConcurrentRequests | WrapError::TooManyPendingRequests => {
                StatusCode::TOO_MANY_REQUESTS
            }
            WrapError::TemporarilyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            WrapError::NativeLedgerError(err) | WrapError::BaseLedgerError(err) => err.status(),
        }
    }
}

impl ErrorStatus for RequestScrapingError {
    fn status(&self) -> StatusCode {
        match self {
            RequestScrapingError::CalledTooManyTimes => StatusCode::TOO_MANY_REQUESTS,
            RequestScrapingError::TemporarilyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl ErrorStatus for RegisterTokenError {
    fn status(&self) -> StatusCode {
        match self {
            RegisterTokenError::DuplicateContract { .. }
            | RegisterTokenError::DuplicateLedger { .. } => StatusCode::CONFLICT,
            RegisterTokenError::NativeMarker => StatusCode::BAD_REQUEST,
            RegisterTokenError::TemporarilyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl_json_error_response!(
    WithdrawalError,
    WithdrawTokenError,
    WrapError,
    RequestScrapingError,
    RegisterTokenError
);

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = if self.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (
            status,
            Json(serde_json::json!({
                "error_type": self.error_type(),
                "message": format!("{:?}", self),
            })),
        )
            .into_response()
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn info<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, _)): State<ServerState<H>>,
) -> Json<EngineInfo> {
    Json(handler.info().await)
}

#[instrument(level = "error", skip_all, fields(caller = %caller.0))]
async fn withdraw_native<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, metrics)): State<ServerState<H>>,
    caller: Caller,
    Json(arg): Json<WithdrawNativeArg>,
) -> Result<Json<RetrieveReceipt>, WithdrawalError> {
    let future = async { handler.withdraw_native(caller.0, arg).await.map(Json) };
    with_metrics!(metrics.clone(), "withdraw_native", future).await
}

#[instrument(level = "error", skip_all, fields(caller = %caller.0))]
async fn withdraw_token<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, metrics)): State<ServerState<H>>,
    caller: Caller,
    Json(arg): Json<WithdrawTokenArg>,
) -> Result<Json<RetrieveReceipt>, WithdrawTokenError> {
    let future = async { handler.withdraw_token(caller.0, arg).await.map(Json) };
    with_metrics!(metrics.clone(), "withdraw_token", future).await
}

#[instrument(level = "error", skip_all, fields(caller = %caller.0))]
async fn wrap<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, metrics)): State<ServerState<H>>,
    caller: Caller,
    Json(arg): Json<WrapArg>,
) -> Result<Json<RetrieveReceipt>, WrapError> {
    let future = async { handler.wrap(caller.0, arg).await.map(Json) };
    with_metrics!(metrics.clone(), "wrap", future).await
}

async fn withdrawal_status<H: EngineRequestHandlerTrait + Sync + Send>(
    Path(id): Path<WithdrawalId>,
    State((handler, _)): State<ServerState<H>>,
) -> Json<WithdrawalStatus> {
    Json(handler.withdrawal_status(id))
}

#[derive(Debug, Default, Deserialize)]
pub struct WithdrawalsQuery {
    pub recipient: Option<Address>,
    pub sender: Option<Principal>,
}

impl WithdrawalsQuery {
    pub fn search(&self) -> Result<WithdrawalSearch, String> {
        match (self.recipient, self.sender) {
            (Some(recipient), None) => Ok(WithdrawalSearch::ByRecipient(recipient)),
            (None, Some(sender)) => Ok(WithdrawalSearch::BySender(sender)),
            _ => Err("exactly one of `recipient` or `sender` is required".to_string()),
        }
    }
}

async fn withdrawals<H: EngineRequestHandlerTrait + Sync + Send>(
    Query(query): Query<WithdrawalsQuery>,
    State((handler, _)): State<ServerState<H>>,
) -> Result<Json<Vec<WithdrawalDetail>>, (StatusCode, String)> {
    let search = query
        .search()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    Ok(Json(handler.withdrawals(search)))
}

pub fn parse_transaction_hash(text: &str) -> Result<H256, String> {
    let hex = text.strip_prefix("0x").unwrap_or(text);
    if hex.len() != 64 {
        return Err(format!("expected 32 bytes of hex, got {:?}", text));
    }
    H256::from_str(hex).map_err(|e| format!("invalid transaction hash {:?}: {}", text, e))
}

async fn deposit_status<H: EngineRequestHandlerTrait + Sync + Send>(
    Path(tx_hash): Path<String>,
    State((handler, _)): State<ServerState<H>>,
) -> Result<Json<Vec<DepositEventStatus>>, (StatusCode, String)> {
    let hash = parse_transaction_hash(&tx_hash).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    Ok(Json(handler.deposit_status(hash)))
}

async fn request_scraping<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, metrics)): State<ServerState<H>>,
) -> Result<StatusCode, RequestScrapingError> {
    let future = async { handler.request_scraping().await.map(|()| StatusCode::OK) };
    with_metrics!(metrics.clone(), "request_scraping", future).await
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub start: Option<usize>,
    pub length: Option<usize>,
}

async fn events<H: EngineRequestHandlerTrait + Sync + Send>(
    Query(query): Query<EventsQuery>,
    State((handler, _)): State<ServerState<H>>,
) -> Result<Json<EventsPage>, BridgeError> {
    let page = handler
        .events(
            query.start.unwrap_or_default(),
            query.length.unwrap_or(DEFAULT_EVENTS_PAGE),
        )
        .await?;
    Ok(Json(page))
}

async fn add_token<H: EngineRequestHandlerTrait + Sync + Send>(
    State((handler, metrics)): State<ServerState<H>>,
    Json(arg): Json<AddTokenArg>,
) -> Result<Json<AddTokenResult>, RegisterTokenError> {
    let future = async { handler.add_token(arg).await.map(Json) };
    with_metrics!(metrics.clone(), "add_token", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            tracing::info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    tracing::info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    tracing::info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::principal_with_id;
    use axum::http::Request;

    async fn caller_from(header: Option<&str>) -> Result<Caller, (StatusCode, String)> {
        let mut builder = Request::builder().uri("/withdraw/native");
        if let Some(value) = header {
            builder = builder.header(CALLER_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Caller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_is_read_from_header() {
        let principal = principal_with_id(9);
        let caller = caller_from(Some(&principal.to_string())).await.unwrap();
        assert_eq!(caller.0, LedgerAccount::from(principal));

        let (status, _) = caller_from(None).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = caller_from(Some("not hex")).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, message) = caller_from(Some("04")).await.unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(message.contains("anonymous"));
    }

    #[test]
    fn test_withdrawals_query_needs_exactly_one_filter() {
        let recipient = Address::repeat_byte(0x77);
        let query = WithdrawalsQuery {
            recipient: Some(recipient),
            sender: None,
        };
        assert_eq!(query.search(), Ok(WithdrawalSearch::ByRecipient(recipient)));
        assert!(WithdrawalsQuery::default().search().is_err());
        let both = WithdrawalsQuery {
            recipient: Some(recipient),
            sender: Some(principal_with_id(1)),
        };
        assert!(both.search().is_err());
    }

    #[test]
    fn test_parse_transaction_hash() {
        let hash = H256::repeat_byte(0xab);
        assert_eq!(parse_transaction_hash(&format!("{:#x}", hash)), Ok(hash));
        assert_eq!(parse_transaction_hash(&format!("{:x}", hash)), Ok(hash));
        assert!(parse_transaction_hash("0x1234").is_err());
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            WithdrawalError::AlreadyProcessing.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RequestScrapingError::CalledTooManyTimes
                .into_response()
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            WrapError::UnsupportedToken {
                base_ledger: principal_with_id(1)
            }
            .into_response()
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BridgeError::ProviderDisagreement("a != b".into())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            BridgeError::StorageError("disk full".into())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
