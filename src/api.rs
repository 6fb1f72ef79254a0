//! Request and response types for the hub API.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attrs::clearance::Clearance;
use crate::bundle::{BundleOptions, BundlePointer};
use crate::federation::FederatedResource;
use crate::spoke::{RegisterRequest, SpokeRecord, TrustGrant};
use crate::spoke::cert::CertificateWarning;
use crate::trust::TrustLevel;

//----------- ErrorKind --------------------------------------------------------

/// The error taxonomy exposed at the API boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Unknown spoke, resource, or trust edge.
    #[error("not found")]
    NotFound,

    /// Duplicate instance code, re-approval, or equivalent collision.
    #[error("conflict")]
    Conflict,

    /// Malformed certificate, instance code, or clearance.
    #[error("invalid input")]
    InvalidInput,

    /// Invalid token or missing bilateral trust.
    #[error("unauthorized")]
    Unauthorized,

    /// An outbound deadline expired.
    #[error("timeout")]
    Timeout,

    /// A retryable network or storage failure.
    #[error("transient I/O failure")]
    TransientIo,

    /// A request exceeded the capability grants of a trust agreement.
    #[error("policy violation")]
    PolicyViolation,

    /// Unrecoverable state; operator attention required.
    #[error("fatal")]
    Fatal,
}

//----------- ApiResponse ------------------------------------------------------

/// The envelope every API response is wrapped in.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Appears in logs and in any downstream call this request triggered.
    pub correlation_id: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, correlation_id: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
            correlation_id,
        }
    }

    pub fn err(error: ErrorKind, message: impl Into<String>, correlation_id: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            message: Some(message.into()),
            correlation_id,
        }
    }
}

//----------- Spoke API --------------------------------------------------------

/// `POST /spokes`
pub type SpokeRegister = RegisterRequest;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeRegisterResult {
    pub spoke: SpokeRecord,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<CertificateWarning>,
}

/// `POST /spokes/{id}/approve`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeApprove {
    pub approver: String,
    pub trust_level: TrustLevel,
    pub max_classification: Clearance,
    #[serde(default)]
    pub allowed_scopes: BTreeSet<String>,
}

impl From<SpokeApprove> for TrustGrant {
    fn from(value: SpokeApprove) -> Self {
        TrustGrant {
            trust_level: value.trust_level,
            max_classification: value.max_classification,
            allowed_scopes: value.allowed_scopes,
        }
    }
}

/// `POST /spokes/{id}/suspend` and `POST /spokes/{id}/revoke`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusChange {
    pub reason: String,
}

/// `GET /spokes`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpokeList {
    pub spokes: Vec<SpokeRecord>,
}

/// `POST /spokes/{id}/token`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpokeTokenResult {
    pub token: String,
    pub expires_at: jiff::Timestamp,
    pub scopes: BTreeSet<String>,
}

//----------- Bundle API -------------------------------------------------------

/// `POST /bundles/build` and `POST /bundles/build-and-publish`
pub type BundleBuild = BundleOptions;

/// `GET /bundles/current`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentBundle {
    pub bundle: Option<BundlePointer>,
}

/// `GET /bundles/scopes`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BundleScopes {
    pub scopes: Vec<String>,
}

//----------- Policy data API --------------------------------------------------

/// `POST /data/publish`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InlineDataPublish {
    /// The named data path, e.g. `federation/trusted-issuers`.
    pub path: String,
    pub data: Value,
    pub reason: String,
}

//----------- Federation API ---------------------------------------------------

/// `POST /federation/resources`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationPush {
    pub correlation_id: String,
    pub source_realm: String,
    pub resources: Vec<FederatedResource>,
}

/// Per-resource outcome of a federation push.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationPushOutcome {
    pub resource_id: String,
    /// "synced", "updated" or "conflicted".
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationPushResult {
    pub results: Vec<FederationPushOutcome>,
}

/// `GET /federation/resources`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederationResources {
    pub resources: Vec<FederatedResource>,
}

//----------- Introspection (RFC 7662 shape) -----------------------------------

/// `POST /introspect`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
}

/// The RFC 7662 response for locally-issued spoke tokens.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntrospectResponse {
    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}
