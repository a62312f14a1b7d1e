use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use axum::extract::Request;
use axum::middleware::Next;
use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use uuid::Uuid;

pub const ERROR_CODE_HEADER: &str = "X-Error-Code";

/// Distinct error-code label values tracked before new codes collapse into `other`.
pub const MAX_ERROR_CODES: usize = 40;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized { code: &'static str, message: Option<String> },
    ForbiddenMissingRole { role: &'static str, trace_id: Option<Uuid> },
    Forbidden { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    /// A required upstream dependency (payment gateway) failed after all fallbacks.
    Upstream { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    /// Detail is logged server-side and never rendered.
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest { code, trace_id: None, message: Some(message.into()) }
    }
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { code: "unauthorized", message: Some(message.into()) }
    }
    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::Forbidden { code, trace_id: None, message: Some(message.into()) }
    }
    pub fn not_found(code: &'static str) -> Self { Self::NotFound { code, trace_id: None } }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenMissingRole { .. } | ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Unauthorized { code, message } => {
                ErrorBody { code: code.into(), missing_role: None, trace_id: None, message }
            }
            ApiError::ForbiddenMissingRole { role, trace_id } => {
                ErrorBody { code: "missing_role".into(), missing_role: Some(role.into()), trace_id, message: None }
            }
            ApiError::Forbidden { code, trace_id, message }
            | ApiError::BadRequest { code, trace_id, message }
            | ApiError::Upstream { code, trace_id, message } => {
                ErrorBody { code: code.into(), missing_role: None, trace_id, message }
            }
            ApiError::NotFound { code, trace_id } => {
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None }
            }
            ApiError::Internal { trace_id, message } => {
                tracing::error!(?trace_id, detail = message.as_deref().unwrap_or("-"), "internal error");
                ErrorBody { code: "internal_error".into(), missing_role: None, trace_id, message: None }
            }
        };
        let error_code = HeaderValue::from_str(&body.code).ok();
        let mut resp = (status, Json(body)).into_response();
        if let Some(val) = error_code {
            resp.headers_mut().insert(ERROR_CODE_HEADER, val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// --- HTTP error metrics ---

static HTTP_ERROR_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    ).expect("static metric definition is valid");
    HTTP_ERROR_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

static ERROR_CODE_OVERFLOW: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "http_error_code_overflow_total",
        "Error responses whose code label was collapsed into 'other'",
    ).expect("static metric definition is valid");
    HTTP_ERROR_REGISTRY.register(Box::new(c.clone())).ok();
    c
});

static DISTINCT_ERROR_CODES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("http_error_codes_distinct", "Distinct error codes currently tracked as labels")
        .expect("static metric definition is valid");
    HTTP_ERROR_REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static SEEN_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Registry holding the shared HTTP error counters.
pub fn error_metrics_registry() -> &'static Registry {
    Lazy::force(&HTTP_ERRORS_TOTAL);
    Lazy::force(&ERROR_CODE_OVERFLOW);
    Lazy::force(&DISTINCT_ERROR_CODES);
    &HTTP_ERROR_REGISTRY
}

fn bounded_code_label(code: &str) -> String {
    let mut seen = match SEEN_CODES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.contains(code) {
        return code.to_string();
    }
    if seen.len() >= MAX_ERROR_CODES {
        ERROR_CODE_OVERFLOW.inc();
        return "other".to_string();
    }
    seen.insert(code.to_string());
    DISTINCT_ERROR_CODES.set(seen.len() as i64);
    code.to_string()
}

fn record_error(service: &str, code: &str, status: StatusCode) {
    let label = bounded_code_label(code);
    HTTP_ERRORS_TOTAL.with_label_values(&[service, &label, status.as_str()]).inc();
}

type MetricsFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Middleware for `axum::middleware::from_fn` counting responses with status >= 400
/// by the `X-Error-Code` header.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> MetricsFuture + Clone + Send + Sync + 'static {
    move |req: Request, next: Next| -> MetricsFuture {
        Box::pin(async move {
            let resp = next.run(req).await;
            let status = resp.status();
            if status.as_u16() >= 400 {
                let code = resp
                    .headers()
                    .get(ERROR_CODE_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                record_error(service, code, status);
            }
            resp
        })
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error("test-helpers", code, StatusCode::BAD_REQUEST);
    }

    pub fn distinct_gauge() -> i64 { DISTINCT_ERROR_CODES.get() }

    pub fn overflow_count() -> u64 { ERROR_CODE_OVERFLOW.get() }
}
