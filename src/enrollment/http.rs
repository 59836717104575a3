//! HTTP surface for enrollment
//!
//! Routes:
//! - `POST /api/host/register` - register or refresh a node
//! - `POST /api/host/provision` - one-shot provisioning (token only)
//!
//! Every response uses the `{code, message, data}` envelope, with `code` 0 on
//! success and 1 on failure. The HTTP status carries the error class.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    CertificateBundle, Credential, EnrollmentError, EnrollmentService, ProvisionRequest,
    RegisterRequest, ServerCertificateBundle,
};

/// Header carrying the bootstrap token
pub const REGISTER_TOKEN_HEADER: &str = "x-register-token";

/// Header carrying the fingerprint of the node's current certificate
pub const CERT_SIGNATURE_HEADER: &str = "x-client-cert-signature";

/// Response envelope shared by all enrollment routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// 0 on success, 1 on failure
    pub code: i32,
    /// Human-readable status
    pub message: String,
    /// Payload, present on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Successful response with payload
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
        }
    }

    /// Failure response
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: message.into(),
            data: None,
        }
    }

    /// Whether the envelope reports success
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Payload of a successful registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterData {
    /// Issued bundle, when one was issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_bundle: Option<CertificateBundle>,
}

/// Payload of a successful provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionData {
    /// Issued server bundle
    pub cert_bundle: ServerCertificateBundle,
}

impl IntoResponse for EnrollmentError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EnrollmentError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            EnrollmentError::TokenNotConfigured
            | EnrollmentError::InvalidToken
            | EnrollmentError::AuthenticationRequired
            | EnrollmentError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "authentication failed".to_string(),
            ),
            EnrollmentError::AlreadyRegistered(_) => (StatusCode::CONFLICT, self.to_string()),
            EnrollmentError::Issuance(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "certificate issuance failed".to_string(),
            ),
            EnrollmentError::Directory(_) | EnrollmentError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };

        (status, Json(ApiResponse::<()>::failure(message))).into_response()
    }
}

/// Header value, with blank values treated as absent
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| v.to_str().unwrap_or_default().trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Credential {
    /// Extract the credential from request headers
    ///
    /// A non-blank token header wins. A blank one falls through to the
    /// signature header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        if let Some(token) = header_value(headers, REGISTER_TOKEN_HEADER) {
            return Credential::Token(token);
        }
        match header_value(headers, CERT_SIGNATURE_HEADER) {
            Some(signature) => Credential::Signature(signature),
            None => Credential::Missing,
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, EnrollmentError> {
    serde_json::from_slice(body)
        .map_err(|e| EnrollmentError::InvalidRequest(format!("malformed body: {}", e)))
}

/// Registration handler
pub async fn register_handler(
    State(service): State<Arc<EnrollmentService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<RegisterData>>, EnrollmentError> {
    let request: RegisterRequest = parse_body(&body)?;
    debug!(address = %request.address, "Registration request received");

    let credential = Credential::from_headers(&headers);
    let outcome = service.register(&credential, request).await?;

    Ok(Json(ApiResponse::success(RegisterData {
        cert_bundle: outcome.bundle,
    })))
}

/// Provisioning handler
pub async fn provision_handler(
    State(service): State<Arc<EnrollmentService>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<ProvisionData>>, EnrollmentError> {
    let request: ProvisionRequest = parse_body(&body)?;
    debug!(address = %request.address, "Provisioning request received");

    let credential = Credential::from_headers(&headers);
    let bundle = service.provision(&credential, request).await?;

    Ok(Json(ApiResponse::success(ProvisionData {
        cert_bundle: bundle,
    })))
}

/// Create the enrollment router
pub fn enrollment_router(service: Arc<EnrollmentService>) -> Router {
    Router::new()
        .route("/api/host/register", post(register_handler))
        .route("/api/host/provision", post(provision_handler))
        .with_state(service)
}
