//! Spoke records and lifecycle.
//!
//! A spoke is a national or coalition instance connected to the hub.  Its
//! record carries a certificate-bound identity and walks a strict lifecycle:
//!
//! ```text
//! pending --approve--> approved --suspend--> suspended
//!    |                    |                      |
//!    +----revoke----------+-------revoke--------+--> revoked
//! ```
//!
//! `revoked` is terminal; its instance code may be re-registered from
//! scratch.  A spoke token is only ever valid while its spoke is `approved`,
//! and suspension or revocation invalidates all outstanding tokens in the
//! same critical section that changes the status.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jiff::Timestamp;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::attrs::clearance::Clearance;
use crate::spoke::cert::{CertificateError, CertificateInfo, CertificateWarning};
use crate::trust::{InstanceCode, TrustLevel};

pub mod cert;

/// Default requests-per-minute limit for a fresh spoke.
const DEFAULT_RATE_LIMIT_RPM: u32 = 60;

/// Default burst allowance for a fresh spoke.
const DEFAULT_RATE_LIMIT_BURST: u32 = 10;

/// Default audit retention for a fresh spoke, in days.
const DEFAULT_AUDIT_RETENTION_DAYS: u32 = 90;

/// Default lifetime of a spoke token.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spoke tokens are this many random bytes, base64url-encoded.
const TOKEN_BYTES: usize = 32;

//----------- SpokeId ----------------------------------------------------------

/// The stable identifier of a spoke record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpokeId(Box<str>);

impl SpokeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpokeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpokeId {
    fn from(s: &str) -> Self {
        SpokeId(s.into())
    }
}

//----------- SpokeStatus ------------------------------------------------------

/// Where a spoke is in its lifecycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpokeStatus {
    #[default]
    Pending,
    Approved,
    Suspended,
    Revoked,
}

impl fmt::Display for SpokeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpokeStatus::Pending => "pending",
            SpokeStatus::Approved => "approved",
            SpokeStatus::Suspended => "suspended",
            SpokeStatus::Revoked => "revoked",
        })
    }
}

//----------- RateLimit --------------------------------------------------------

/// Per-spoke inbound rate limits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimit {
    pub rpm: u32,
    pub burst: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            rpm: DEFAULT_RATE_LIMIT_RPM,
            burst: DEFAULT_RATE_LIMIT_BURST,
        }
    }
}

//----------- HeartbeatStats ---------------------------------------------------

/// Operational statistics reported with a heartbeat.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeartbeatStats {
    /// Round-trip latency the spoke measured against the hub.
    pub latency_ms: u64,

    /// Whether the spoke's policy-data channel is connected.
    pub data_plane_connected: bool,
}

//----------- SpokeRecord ------------------------------------------------------

/// A spoke known to the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpokeRecord {
    pub spoke_id: SpokeId,
    pub instance_code: InstanceCode,
    pub name: String,

    pub base_url: Url,
    pub api_url: Url,
    pub idp_url: Url,

    /// The registered certificate, as presented.
    pub certificate_pem: String,

    /// Identity extracted from the certificate.
    pub certificate: CertificateInfo,

    pub contact_email: String,

    pub status: SpokeStatus,

    /// Why the spoke was suspended or revoked, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    pub trust_level: TrustLevel,

    /// The classification ceiling for this spoke.  UNCLASSIFIED until
    /// approval grants more.
    pub max_classification: Clearance,

    /// Policy scopes the spoke may pull.  Empty until approval.
    pub allowed_scopes: BTreeSet<String>,

    pub rate_limit: RateLimit,

    pub audit_retention_days: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<Timestamp>,

    pub registered_at: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatStats>,
}

//----------- SpokeToken -------------------------------------------------------

/// An opaque bearer token minted for an approved spoke.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpokeToken {
    pub token: Box<str>,
    pub spoke_id: SpokeId,

    /// Frozen at mint time to the spoke's then-current allowed scopes.
    pub scopes: BTreeSet<String>,

    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
}

//----------- TokenValidation --------------------------------------------------

/// The outcome of validating a spoke token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenValidation {
    pub valid: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub spoke: Option<SpokeId>,

    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub scopes: BTreeSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TokenValidation {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            spoke: None,
            scopes: BTreeSet::new(),
            reason: Some(reason.to_owned()),
        }
    }
}

//----------- Requests ---------------------------------------------------------

/// A spoke registration request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterRequest {
    pub instance_code: InstanceCode,
    pub name: String,
    pub base_url: Url,
    pub api_url: Url,
    pub idp_url: Url,
    pub certificate_pem: String,
    pub contact_email: String,
}

/// The capability grant written at approval time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrustGrant {
    pub trust_level: TrustLevel,
    pub max_classification: Clearance,
    pub allowed_scopes: BTreeSet<String>,
}

//----------- SpokeRegistry ----------------------------------------------------

/// The registry of spokes and their tokens.
#[derive(Debug)]
pub struct SpokeRegistry {
    state: Mutex<RegistryState>,

    token_ttl: Duration,

    /// Heartbeats older than this make a spoke unhealthy.
    heartbeat_max_age: Duration,

    /// Whether weak certificate signature algorithms reject registration.
    strict_certificates: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    spokes: foldhash::HashMap<SpokeId, SpokeRecord>,
    tokens: foldhash::HashMap<Box<str>, SpokeToken>,
}

impl SpokeRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            token_ttl: DEFAULT_TOKEN_TTL,
            // A spoke is unhealthy after missing three heartbeats.
            heartbeat_max_age: heartbeat_interval * 3,
            strict_certificates: true,
        }
    }

    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    pub fn with_strict_certificates(mut self, strict: bool) -> Self {
        self.strict_certificates = strict;
        self
    }

    //--- Lifecycle operations

    /// Register a new spoke.
    ///
    /// The record starts `pending`, with no scopes, an UNCLASSIFIED cap and
    /// default rate limits.  Fails if the instance code is held by any
    /// non-revoked spoke.
    pub fn register(
        &self,
        req: RegisterRequest,
    ) -> Result<(SpokeRecord, Vec<CertificateWarning>), RegisterError> {
        let now = Timestamp::now();
        let (info, warnings) = cert::validate_pem(&req.certificate_pem, self.strict_certificates, now)
            .map_err(RegisterError::InvalidCertificate)?;

        let mut state = self.state.lock().unwrap();

        if state
            .spokes
            .values()
            .any(|s| s.instance_code == req.instance_code && s.status != SpokeStatus::Revoked)
        {
            return Err(RegisterError::DuplicateInstanceCode(req.instance_code));
        }

        let spoke_id = loop {
            let id = SpokeId(
                format!(
                    "spoke-{}-{:08x}",
                    req.instance_code.as_str().to_ascii_lowercase(),
                    rand::random::<u32>()
                )
                .into(),
            );
            if !state.spokes.contains_key(&id) {
                break id;
            }
        };

        let record = SpokeRecord {
            spoke_id: spoke_id.clone(),
            instance_code: req.instance_code,
            name: req.name,
            base_url: req.base_url,
            api_url: req.api_url,
            idp_url: req.idp_url,
            certificate_pem: req.certificate_pem,
            certificate: info,
            contact_email: req.contact_email,
            status: SpokeStatus::Pending,
            status_reason: None,
            trust_level: TrustLevel::Development,
            max_classification: Clearance::Unclassified,
            allowed_scopes: BTreeSet::new(),
            rate_limit: RateLimit::default(),
            audit_retention_days: DEFAULT_AUDIT_RETENTION_DAYS,
            approved_by: None,
            approved_at: None,
            registered_at: now,
            last_heartbeat: None,
            heartbeat: None,
        };
        state.spokes.insert(spoke_id, record.clone());
        Ok((record, warnings))
    }

    /// Approve a pending spoke, writing its capability grant.
    ///
    /// Approval is monotone: an already-approved spoke rejects re-approval,
    /// and suspended or revoked spokes cannot be approved either.
    pub fn approve(
        &self,
        spoke_id: &SpokeId,
        approver: &str,
        grant: TrustGrant,
    ) -> Result<SpokeRecord, ApproveError> {
        let mut state = self.state.lock().unwrap();
        let record = state.spokes.get_mut(spoke_id).ok_or(ApproveError::NotFound)?;

        match record.status {
            SpokeStatus::Pending => {}
            SpokeStatus::Approved => return Err(ApproveError::AlreadyApproved),
            SpokeStatus::Suspended | SpokeStatus::Revoked => {
                return Err(ApproveError::NotPending(record.status))
            }
        }

        record.status = SpokeStatus::Approved;
        record.status_reason = None;
        record.trust_level = grant.trust_level;
        record.max_classification = grant.max_classification;
        record.allowed_scopes = grant.allowed_scopes;
        record.approved_by = Some(approver.to_owned());
        record.approved_at = Some(Timestamp::now());
        Ok(record.clone())
    }

    /// Suspend an approved spoke.
    ///
    /// All outstanding tokens are invalidated in the same critical section,
    /// so no later validation can see a valid token of a suspended spoke.
    pub fn suspend(&self, spoke_id: &SpokeId, reason: &str) -> Result<SpokeRecord, SuspendError> {
        let mut state = self.state.lock().unwrap();
        let record = state.spokes.get_mut(spoke_id).ok_or(SuspendError::NotFound)?;

        if record.status != SpokeStatus::Approved {
            return Err(SuspendError::NotApproved(record.status));
        }

        record.status = SpokeStatus::Suspended;
        record.status_reason = Some(reason.to_owned());
        let record = record.clone();
        state.tokens.retain(|_, t| t.spoke_id != *spoke_id);
        Ok(record)
    }

    /// Revoke a spoke.  Terminal; frees the instance code for re-use.
    pub fn revoke(&self, spoke_id: &SpokeId, reason: &str) -> Result<SpokeRecord, RevokeError> {
        let mut state = self.state.lock().unwrap();
        let record = state.spokes.get_mut(spoke_id).ok_or(RevokeError::NotFound)?;

        if record.status == SpokeStatus::Revoked {
            return Err(RevokeError::AlreadyRevoked);
        }

        record.status = SpokeStatus::Revoked;
        record.status_reason = Some(reason.to_owned());
        record.allowed_scopes.clear();
        record.max_classification = Clearance::Unclassified;
        let record = record.clone();
        state.tokens.retain(|_, t| t.spoke_id != *spoke_id);
        Ok(record)
    }

    //--- Tokens

    /// Mint a token for an approved spoke.
    pub fn generate_token(&self, spoke_id: &SpokeId) -> Result<SpokeToken, TokenError> {
        self.generate_token_at(spoke_id, Timestamp::now())
    }

    fn generate_token_at(
        &self,
        spoke_id: &SpokeId,
        now: Timestamp,
    ) -> Result<SpokeToken, TokenError> {
        let mut state = self.state.lock().unwrap();
        let record = state.spokes.get(spoke_id).ok_or(TokenError::NotFound)?;

        if record.status != SpokeStatus::Approved {
            return Err(TokenError::NotApproved(record.status));
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: Box<str> = URL_SAFE_NO_PAD.encode(bytes).into();

        let spoke_token = SpokeToken {
            token: token.clone(),
            spoke_id: spoke_id.clone(),
            scopes: record.allowed_scopes.clone(),
            issued_at: now,
            expires_at: now + self.token_ttl,
        };
        state.tokens.insert(token, spoke_token.clone());
        Ok(spoke_token)
    }

    /// Validate a spoke token.
    ///
    /// A token is valid exactly when it exists, has not expired, and its
    /// spoke is currently approved.
    pub fn validate_token(&self, token: &str) -> TokenValidation {
        self.validate_token_at(token, Timestamp::now())
    }

    fn validate_token_at(&self, token: &str, now: Timestamp) -> TokenValidation {
        let mut state = self.state.lock().unwrap();

        let Some(spoke_token) = state.tokens.get(token) else {
            return TokenValidation::invalid("unknown token");
        };

        if now >= spoke_token.expires_at {
            state.tokens.remove(token);
            return TokenValidation::invalid("token expired");
        }

        let spoke_id = spoke_token.spoke_id.clone();
        let scopes = spoke_token.scopes.clone();
        match state.spokes.get(&spoke_id).map(|s| s.status) {
            Some(SpokeStatus::Approved) => TokenValidation {
                valid: true,
                spoke: Some(spoke_id),
                scopes,
                reason: None,
            },
            _ => TokenValidation::invalid("spoke not approved"),
        }
    }

    /// Look up a token record by its opaque value.
    pub fn token(&self, token: &str) -> Option<SpokeToken> {
        let state = self.state.lock().unwrap();
        state.tokens.get(token).cloned()
    }

    /// Any non-expired token of the spoke, if one exists.
    pub fn active_token(&self, spoke_id: &SpokeId) -> Option<SpokeToken> {
        let now = Timestamp::now();
        let state = self.state.lock().unwrap();
        state
            .tokens
            .values()
            .find(|t| t.spoke_id == *spoke_id && t.expires_at > now)
            .cloned()
    }

    //--- Heartbeats

    /// Record a heartbeat from a spoke.
    pub fn record_heartbeat(
        &self,
        spoke_id: &SpokeId,
        stats: HeartbeatStats,
    ) -> Result<(), HeartbeatError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .spokes
            .get_mut(spoke_id)
            .ok_or(HeartbeatError::NotFound)?;
        if record.status == SpokeStatus::Revoked {
            return Err(HeartbeatError::Revoked);
        }
        record.last_heartbeat = Some(Timestamp::now());
        record.heartbeat = Some(stats);
        Ok(())
    }

    /// Approved spokes that have missed their heartbeats.
    pub fn unhealthy(&self) -> Vec<SpokeRecord> {
        self.unhealthy_at(Timestamp::now())
    }

    fn unhealthy_at(&self, now: Timestamp) -> Vec<SpokeRecord> {
        let state = self.state.lock().unwrap();
        let mut unhealthy: Vec<_> = state
            .spokes
            .values()
            .filter(|s| s.status == SpokeStatus::Approved)
            .filter(|s| match s.last_heartbeat {
                None => true,
                Some(at) => now.duration_since(at).unsigned_abs() > self.heartbeat_max_age,
            })
            .cloned()
            .collect();
        unhealthy.sort_by(|a, b| a.spoke_id.cmp(&b.spoke_id));
        unhealthy
    }

    //--- Queries

    pub fn get(&self, spoke_id: &SpokeId) -> Option<SpokeRecord> {
        let state = self.state.lock().unwrap();
        state.spokes.get(spoke_id).cloned()
    }

    /// The non-revoked spoke holding an instance code, if any.
    pub fn find_by_code(&self, code: InstanceCode) -> Option<SpokeRecord> {
        let state = self.state.lock().unwrap();
        state
            .spokes
            .values()
            .find(|s| s.instance_code == code && s.status != SpokeStatus::Revoked)
            .cloned()
    }

    pub fn all(&self) -> Vec<SpokeRecord> {
        let state = self.state.lock().unwrap();
        let mut spokes: Vec<_> = state.spokes.values().cloned().collect();
        spokes.sort_by(|a, b| a.spoke_id.cmp(&b.spoke_id));
        spokes
    }

    pub fn with_status(&self, status: SpokeStatus) -> Vec<SpokeRecord> {
        let state = self.state.lock().unwrap();
        let mut spokes: Vec<_> = state
            .spokes
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        spokes.sort_by(|a, b| a.spoke_id.cmp(&b.spoke_id));
        spokes
    }

    //--- Persistence

    /// Snapshot records and live tokens for the state file.
    pub fn snapshot(&self) -> (Vec<SpokeRecord>, Vec<SpokeToken>) {
        let now = Timestamp::now();
        let state = self.state.lock().unwrap();
        let mut spokes: Vec<_> = state.spokes.values().cloned().collect();
        spokes.sort_by(|a, b| a.spoke_id.cmp(&b.spoke_id));
        let mut tokens: Vec<_> = state
            .tokens
            .values()
            .filter(|t| t.expires_at > now)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| a.token.cmp(&b.token));
        (spokes, tokens)
    }

    /// Replace the registry contents (state-file load).
    ///
    /// Expired tokens and tokens of non-approved spokes are dropped.
    pub fn replace_all(&self, spokes: Vec<SpokeRecord>, tokens: Vec<SpokeToken>) {
        let now = Timestamp::now();
        let spokes: foldhash::HashMap<_, _> = spokes
            .into_iter()
            .map(|s| (s.spoke_id.clone(), s))
            .collect();
        let tokens = tokens
            .into_iter()
            .filter(|t| t.expires_at > now)
            .filter(|t| {
                spokes
                    .get(&t.spoke_id)
                    .is_some_and(|s| s.status == SpokeStatus::Approved)
            })
            .map(|t| (t.token.clone(), t))
            .collect();

        let mut state = self.state.lock().unwrap();
        state.spokes = spokes;
        state.tokens = tokens;
    }
}

//----------- RegisterError ----------------------------------------------------

/// An error registering a spoke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// The instance code is held by a non-revoked spoke.
    DuplicateInstanceCode(InstanceCode),

    /// The presented certificate was rejected.
    InvalidCertificate(CertificateError),
}

impl std::error::Error for RegisterError {}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateInstanceCode(code) => {
                write!(f, "the instance code '{code}' is already registered")
            }
            Self::InvalidCertificate(err) => write!(f, "invalid certificate: {err}"),
        }
    }
}

//----------- ApproveError -----------------------------------------------------

/// An error approving a spoke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApproveError {
    /// No spoke with that identifier exists.
    NotFound,

    /// The spoke is already approved.
    AlreadyApproved,

    /// The spoke is suspended or revoked.
    NotPending(SpokeStatus),
}

impl std::error::Error for ApproveError {}

impl fmt::Display for ApproveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such spoke exists"),
            Self::AlreadyApproved => f.write_str("the spoke is already approved"),
            Self::NotPending(status) => {
                write!(f, "a {status} spoke cannot be approved")
            }
        }
    }
}

//----------- SuspendError -----------------------------------------------------

/// An error suspending a spoke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuspendError {
    /// No spoke with that identifier exists.
    NotFound,

    /// Only approved spokes can be suspended.
    NotApproved(SpokeStatus),
}

impl std::error::Error for SuspendError {}

impl fmt::Display for SuspendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such spoke exists"),
            Self::NotApproved(status) => {
                write!(f, "a {status} spoke cannot be suspended")
            }
        }
    }
}

//----------- RevokeError ------------------------------------------------------

/// An error revoking a spoke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevokeError {
    /// No spoke with that identifier exists.
    NotFound,

    /// The spoke is already revoked.
    AlreadyRevoked,
}

impl std::error::Error for RevokeError {}

impl fmt::Display for RevokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "no such spoke exists",
            Self::AlreadyRevoked => "the spoke is already revoked",
        })
    }
}

//----------- TokenError -------------------------------------------------------

/// An error minting a spoke token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// No spoke with that identifier exists.
    NotFound,

    /// Only approved spokes may hold tokens.
    NotApproved(SpokeStatus),
}

impl std::error::Error for TokenError {}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("no such spoke exists"),
            Self::NotApproved(status) => {
                write!(f, "tokens cannot be minted for a {status} spoke")
            }
        }
    }
}

//----------- HeartbeatError ---------------------------------------------------

/// An error recording a heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    /// No spoke with that identifier exists.
    NotFound,

    /// The spoke has been revoked.
    Revoked,
}

impl std::error::Error for HeartbeatError {}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "no such spoke exists",
            Self::Revoked => "the spoke has been revoked",
        })
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SpokeRegistry {
        SpokeRegistry::new(Duration::from_secs(30))
    }

    fn request(code: &str) -> RegisterRequest {
        let pem = rcgen::generate_simple_self_signed(vec![format!(
            "{}.spoke.example",
            code.to_ascii_lowercase()
        )])
        .unwrap()
        .cert
        .pem();
        RegisterRequest {
            instance_code: code.parse().unwrap(),
            name: format!("{code} instance"),
            base_url: "https://spoke.example".parse().unwrap(),
            api_url: "https://api.spoke.example".parse().unwrap(),
            idp_url: "https://idp.spoke.example".parse().unwrap(),
            certificate_pem: pem,
            contact_email: "ops@spoke.example".into(),
        }
    }

    fn grant() -> TrustGrant {
        TrustGrant {
            trust_level: TrustLevel::Bilateral,
            max_classification: Clearance::Secret,
            allowed_scopes: BTreeSet::from(["policy:base".to_owned(), "policy:fvey".to_owned()]),
        }
    }

    #[test]
    fn registration_starts_pending_and_empty() {
        let reg = registry();
        let (record, warnings) = reg.register(request("FRA")).unwrap();

        assert_eq!(record.status, SpokeStatus::Pending);
        assert!(record.allowed_scopes.is_empty());
        assert_eq!(record.max_classification, Clearance::Unclassified);
        assert_eq!(record.rate_limit, RateLimit { rpm: 60, burst: 10 });
        assert_eq!(record.audit_retention_days, 90);
        assert!(record.spoke_id.as_str().starts_with("spoke-fra-"));
        // Self-signed test material warns but registers.
        assert!(warnings.contains(&CertificateWarning::SelfSigned));
    }

    #[test]
    fn duplicate_instance_codes_are_rejected() {
        let reg = registry();
        reg.register(request("FRA")).unwrap();
        assert!(matches!(
            reg.register(request("FRA")),
            Err(RegisterError::DuplicateInstanceCode(_))
        ));
    }

    #[test]
    fn revoked_code_can_be_reregistered() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();
        reg.revoke(&record.spoke_id, "compromised").unwrap();

        let (fresh, _) = reg.register(request("FRA")).unwrap();
        assert_ne!(fresh.spoke_id, record.spoke_id);
        assert_eq!(fresh.status, SpokeStatus::Pending);
        assert!(fresh.allowed_scopes.is_empty());
    }

    #[test]
    fn approval_is_monotone() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();

        let approved = reg.approve(&record.spoke_id, "admin", grant()).unwrap();
        assert_eq!(approved.status, SpokeStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("admin"));
        assert_eq!(approved.max_classification, Clearance::Secret);

        assert_eq!(
            reg.approve(&record.spoke_id, "admin", grant()),
            Err(ApproveError::AlreadyApproved)
        );
    }

    #[test]
    fn suspended_spokes_cannot_be_reapproved() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();
        reg.suspend(&record.spoke_id, "incident").unwrap();

        assert_eq!(
            reg.approve(&record.spoke_id, "admin", grant()),
            Err(ApproveError::NotPending(SpokeStatus::Suspended))
        );
    }

    #[test]
    fn tokens_require_approval() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        assert!(matches!(
            reg.generate_token(&record.spoke_id),
            Err(TokenError::NotApproved(SpokeStatus::Pending))
        ));
    }

    #[test]
    fn token_validation_tracks_spoke_status() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();

        let token = reg.generate_token(&record.spoke_id).unwrap();
        assert_eq!(token.scopes, grant().allowed_scopes);

        let validation = reg.validate_token(&token.token);
        assert!(validation.valid);
        assert_eq!(validation.spoke.as_ref(), Some(&record.spoke_id));
        assert_eq!(validation.scopes, token.scopes);

        // Suspension invalidates the token atomically.
        reg.suspend(&record.spoke_id, "incident").unwrap();
        let validation = reg.validate_token(&token.token);
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("unknown token"));
    }

    #[test]
    fn expired_tokens_are_invalid() {
        let reg = registry().with_token_ttl(Duration::from_secs(60));
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();

        let now = Timestamp::now();
        let token = reg.generate_token_at(&record.spoke_id, now).unwrap();

        let later = now + Duration::from_secs(61);
        let validation = reg.validate_token_at(&token.token, later);
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("token expired"));
    }

    #[test]
    fn unknown_tokens_are_invalid() {
        let reg = registry();
        let validation = reg.validate_token("bogus");
        assert!(!validation.valid);
        assert_eq!(validation.reason.as_deref(), Some("unknown token"));
    }

    #[test]
    fn multiple_tokens_coexist() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();

        let a = reg.generate_token(&record.spoke_id).unwrap();
        let b = reg.generate_token(&record.spoke_id).unwrap();
        assert_ne!(a.token, b.token);
        assert!(reg.validate_token(&a.token).valid);
        assert!(reg.validate_token(&b.token).valid);
        assert!(reg.active_token(&record.spoke_id).is_some());
    }

    #[test]
    fn token_scopes_are_frozen_at_mint() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();
        let token = reg.generate_token(&record.spoke_id).unwrap();

        // Later grants do not retroactively widen the token.
        // (There is no re-grant operation; emulate via revoke + register of
        // a fresh spoke and check the old token still carries old scopes.)
        let validation = reg.validate_token(&token.token);
        assert_eq!(validation.scopes, grant().allowed_scopes);
    }

    #[test]
    fn heartbeats_and_unhealthy() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();

        // Never heartbeated: unhealthy.
        let unhealthy = reg.unhealthy();
        assert_eq!(unhealthy.len(), 1);

        reg.record_heartbeat(
            &record.spoke_id,
            HeartbeatStats {
                latency_ms: 42,
                data_plane_connected: true,
            },
        )
        .unwrap();
        assert!(reg.unhealthy().is_empty());

        // A heartbeat far in the past makes it unhealthy again.
        let later = Timestamp::now() + Duration::from_secs(600);
        assert_eq!(reg.unhealthy_at(later).len(), 1);
    }

    #[test]
    fn snapshot_round_trips() {
        let reg = registry();
        let (record, _) = reg.register(request("FRA")).unwrap();
        reg.approve(&record.spoke_id, "admin", grant()).unwrap();
        let token = reg.generate_token(&record.spoke_id).unwrap();

        let (spokes, tokens) = reg.snapshot();
        let other = registry();
        other.replace_all(spokes, tokens);

        assert!(other.validate_token(&token.token).valid);
        assert_eq!(
            other.get(&record.spoke_id).unwrap().instance_code,
            record.instance_code
        );
    }
}
