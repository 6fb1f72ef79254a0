//! Cross-instance token introspection and exchange.
//!
//! Both operations are gated the same way: the trust registry decides
//! whether the call may happen at all, the per-target breaker decides
//! whether it may happen *now*, and the wire call runs without any lock
//! held.  Failures never propagate as errors to the caller; they come back
//! as shaped results carrying an audit identifier for correlation.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use ring::digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::Url;

use crate::breaker::BreakerRegistry;
use crate::config::{FederationConfig, PeerConfig};
use crate::spoke::{SpokeRegistry, SpokeStatus};
use crate::trust::{InstanceCode, TrustRegistry};
use crate::util::{hex_encode, join_url};

/// The synthetic code for an undeterminable instance.  Always rejected.
const UNKNOWN_INSTANCE: &str = "UNKNOWN";

/// How long introspection results are cached.
const INTROSPECTION_CACHE_TTL: Duration = Duration::from_secs(5);

/// The JWKS cache fallback lifetime when no cache-control is present.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(600);

/// Federation service JWTs live at most this long.
const FEDERATION_JWT_TTL: Duration = Duration::from_secs(300);

//----------- IntrospectionResult ----------------------------------------------

/// The shaped outcome of a remote token introspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionResult {
    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Value>,

    /// Whether a bilateral trust edge covered the call.
    pub trust_verified: bool,

    pub latency_ms: u64,

    pub validated_at: Timestamp,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IntrospectionResult {
    fn failure(error: &str, trust_verified: bool, started: Instant) -> Self {
        Self {
            active: false,
            claims: None,
            trust_verified,
            latency_ms: started.elapsed().as_millis() as u64,
            validated_at: Timestamp::now(),
            error: Some(error.to_owned()),
        }
    }
}

//----------- Exchange types ---------------------------------------------------

/// An RFC-8693-style exchange request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRequest {
    pub subject_token: String,

    #[serde(default = "default_token_type")]
    pub subject_token_type: String,

    pub origin_instance: String,
    pub target_instance: String,

    #[serde(default)]
    pub requested_scopes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn default_token_type() -> String {
    "urn:ietf:params:oauth:token-type:access_token".to_owned()
}

/// The shaped outcome of an exchange.  `audit_id` is always populated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub scopes: Vec<String>,

    pub origin_instance: String,
    pub target_instance: String,

    pub audit_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ExchangeResult {
    fn failure(req: &ExchangeRequest, audit_id: String, error: &str, description: String) -> Self {
        Self {
            success: false,
            access_token: None,
            expires_in: None,
            scopes: Vec::new(),
            origin_instance: req.origin_instance.clone(),
            target_instance: req.target_instance.clone(),
            audit_id,
            error: Some(error.to_owned()),
            error_description: Some(description),
        }
    }
}

//----------- FederationClaims -------------------------------------------------

/// The claims of a federation service JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederationClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub realm: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "federationVersion")]
    pub federation_version: String,
    pub capabilities: Vec<String>,
}

//----------- ExchangeEngine ---------------------------------------------------

/// Brokers introspection and exchange against peer instances.
pub struct ExchangeEngine {
    local: InstanceCode,
    trust: Arc<TrustRegistry>,
    breakers: Arc<BreakerRegistry>,
    spokes: Arc<SpokeRegistry>,
    peers: Vec<PeerConfig>,

    client: reqwest::Client,

    /// FIFO admission for outbound calls; the excess queues with the same
    /// deadline as the call itself.
    limiter: Arc<Semaphore>,

    timeout: Duration,

    jwt_secret: String,

    caches: Mutex<EngineCaches>,
}

#[derive(Default)]
struct EngineCaches {
    /// `sha256(token) || origin` to cached introspection outcome.
    introspection: foldhash::HashMap<String, CachedIntrospection>,

    /// Per-origin JWKS documents.
    jwks: foldhash::HashMap<InstanceCode, CachedJwks>,
}

struct CachedIntrospection {
    result: IntrospectionResult,
    expires: Instant,
}

struct CachedJwks {
    keys: jsonwebtoken::jwk::JwkSet,
    expires: Instant,
}

impl std::fmt::Debug for ExchangeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeEngine")
            .field("local", &self.local)
            .field("peers", &self.peers)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ExchangeEngine {
    pub fn new(
        local: InstanceCode,
        federation: &FederationConfig,
        trust: Arc<TrustRegistry>,
        breakers: Arc<BreakerRegistry>,
        spokes: Arc<SpokeRegistry>,
    ) -> Self {
        Self {
            local,
            trust,
            breakers,
            spokes,
            peers: federation.peers.clone(),
            client: reqwest::Client::new(),
            limiter: Arc::new(Semaphore::new(federation.max_concurrent_requests)),
            timeout: federation.request_timeout,
            jwt_secret: federation.jwt_secret.clone(),
            caches: Mutex::new(EngineCaches::default()),
        }
    }

    //--- Introspection

    /// Validate an opaque token against its origin instance.
    pub async fn introspect(
        &self,
        token: &str,
        origin_instance: &str,
        requesting_instance: &str,
        request_id: &str,
    ) -> IntrospectionResult {
        let started = Instant::now();

        if origin_instance.eq_ignore_ascii_case(requesting_instance) {
            return IntrospectionResult::failure(
                "self-introspection is not permitted",
                false,
                started,
            );
        }
        if origin_instance.eq_ignore_ascii_case(UNKNOWN_INSTANCE)
            || requesting_instance.eq_ignore_ascii_case(UNKNOWN_INSTANCE)
        {
            return IntrospectionResult::failure("unknown instance", false, started);
        }
        let (Ok(origin), Ok(requesting)) = (
            origin_instance.parse::<InstanceCode>(),
            requesting_instance.parse::<InstanceCode>(),
        ) else {
            return IntrospectionResult::failure("unknown instance", false, started);
        };

        if self.trust.verify(requesting, origin).is_none() {
            debug!("introspection {request_id}: no trust edge {requesting} -> {origin}");
            return IntrospectionResult::failure("No bilateral trust", false, started);
        }

        // Cache check.
        let cache_key = introspection_cache_key(token, origin);
        if let Some(result) = self.cached_introspection(&cache_key) {
            return result;
        }

        // A JWT-format token may be decidable locally against the origin's
        // published JWKS, sparing the introspection round trip.
        if let Some(verdict) = self.try_local_verify(token, origin).await {
            let result = match verdict {
                Ok(claims) => IntrospectionResult {
                    active: true,
                    claims: Some(claims),
                    trust_verified: true,
                    latency_ms: started.elapsed().as_millis() as u64,
                    validated_at: Timestamp::now(),
                    error: None,
                },
                Err(reason) => IntrospectionResult::failure(&reason, true, started),
            };
            self.cache_introspection(cache_key, &result);
            return result;
        }

        if !self.breakers.should_allow(origin) {
            warn!("introspection {request_id}: circuit open toward {origin}");
            return IntrospectionResult::failure("circuit open", true, started);
        }

        let Some(endpoint) = self.endpoint_for(origin) else {
            return IntrospectionResult::failure("no endpoint for origin instance", true, started);
        };

        let response = self
            .post_json(
                join_url(&endpoint, "introspect"),
                origin,
                request_id,
                &serde_json::json!({ "token": token }),
            )
            .await;

        let result = match response {
            Ok(body) => {
                if let Some(event) = self.breakers.record_success(origin) {
                    debug!("breaker for {origin}: {event:?}");
                }
                let active = body.get("active").and_then(Value::as_bool).unwrap_or(false);
                IntrospectionResult {
                    active,
                    claims: active.then_some(body),
                    trust_verified: true,
                    latency_ms: started.elapsed().as_millis() as u64,
                    validated_at: Timestamp::now(),
                    error: None,
                }
            }
            Err(err) => {
                if let Some(event) = self.breakers.record_failure(origin) {
                    warn!("breaker for {origin}: {event:?}");
                }
                warn!("introspection {request_id} against {origin} failed: {err}");
                IntrospectionResult::failure(&err.to_string(), true, started)
            }
        };

        // Both active and inactive responses are cached.
        self.cache_introspection(cache_key, &result);
        result
    }

    //--- Exchange

    /// Exchange a subject token from one instance for an access token at
    /// another.  Never fails outright: the result is always shaped, with an
    /// audit identifier for correlation.
    pub async fn exchange(&self, req: ExchangeRequest) -> ExchangeResult {
        let audit_id = uuid::Uuid::new_v4().to_string();
        let request_id = req.request_id.clone().unwrap_or_else(|| audit_id.clone());

        let (Ok(origin), Ok(target)) = (
            req.origin_instance.parse::<InstanceCode>(),
            req.target_instance.parse::<InstanceCode>(),
        ) else {
            return ExchangeResult::failure(
                &req,
                audit_id,
                "invalid_grant",
                format!(
                    "No bilateral trust between {} and {}",
                    req.origin_instance, req.target_instance
                ),
            );
        };

        let Some(edge) = self.trust.verify(origin, target) else {
            return ExchangeResult::failure(
                &req,
                audit_id,
                "invalid_grant",
                format!("No bilateral trust between {origin} and {target}"),
            );
        };

        // The subject token must be live at its origin; the target is the
        // requesting party for the purpose of the trust check.
        let introspection = self
            .introspect(
                &req.subject_token,
                &req.origin_instance,
                &req.target_instance,
                &request_id,
            )
            .await;
        if !introspection.active {
            let reason = introspection
                .error
                .unwrap_or_else(|| "subject token is not active".to_owned());
            return ExchangeResult::failure(&req, audit_id, "invalid_grant", reason);
        }

        // The subject's clearance must fit under the edge's ceiling.
        if let Some(claims) = &introspection.claims {
            if let Some(clearance) = claims
                .get("clearance")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<crate::attrs::clearance::Clearance>().ok())
            {
                if clearance > edge.max_classification {
                    return ExchangeResult::failure(
                        &req,
                        audit_id,
                        "invalid_grant",
                        format!(
                            "subject clearance {clearance} exceeds the {} ceiling of the trust \
                             agreement",
                            edge.max_classification
                        ),
                    );
                }
            }
        }

        let scopes = match filter_scopes(&req.requested_scopes, &edge.allowed_scopes) {
            Ok(scopes) => scopes,
            Err(()) => {
                return ExchangeResult::failure(
                    &req,
                    audit_id,
                    "invalid_scope",
                    "none of the requested scopes are allowed by the trust agreement".into(),
                );
            }
        };

        if !self.breakers.should_allow(target) {
            return ExchangeResult::failure(
                &req,
                audit_id,
                "temporarily_unavailable",
                format!("circuit open toward {target}"),
            );
        }

        let Some(endpoint) = self.endpoint_for(target) else {
            return ExchangeResult::failure(
                &req,
                audit_id,
                "invalid_grant",
                format!("no endpoint for target instance {target}"),
            );
        };

        let body = serde_json::json!({
            "grant_type": "urn:ietf:params:oauth:grant-type:token-exchange",
            "subject_token": req.subject_token,
            "subject_token_type": req.subject_token_type,
            "audience": target.as_str(),
            "scope": scopes.join(" "),
        });
        let response = self
            .post_json(join_url(&endpoint, "token"), target, &request_id, &body)
            .await;

        match response {
            Ok(body) => {
                if let Some(event) = self.breakers.record_success(target) {
                    debug!("breaker for {target}: {event:?}");
                }
                ExchangeResult {
                    success: true,
                    access_token: body
                        .get("access_token")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    expires_in: body.get("expires_in").and_then(Value::as_u64),
                    scopes,
                    origin_instance: req.origin_instance,
                    target_instance: req.target_instance,
                    audit_id,
                    error: None,
                    error_description: None,
                }
            }
            Err(err) => {
                if let Some(event) = self.breakers.record_failure(target) {
                    warn!("breaker for {target}: {event:?}");
                }
                ExchangeResult::failure(&req, audit_id, "temporarily_unavailable", err.to_string())
            }
        }
    }

    //--- Federation JWTs

    /// Mint the short-lived service JWT carried on outbound federation
    /// calls.
    pub fn mint_federation_jwt(&self, audience: InstanceCode) -> Result<String, JwtError> {
        let now = Timestamp::now();
        let claims = FederationClaims {
            iss: self.local.to_string(),
            sub: format!("{}-federation-service", self.local),
            aud: audience.to_string(),
            realm: self.local.to_string(),
            iat: now.as_second(),
            exp: (now + FEDERATION_JWT_TTL).as_second(),
            federation_version: "1.0".into(),
            capabilities: vec!["introspect".into(), "exchange".into(), "resources".into()],
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|err| JwtError(err.to_string()))
    }

    /// Verify an inbound federation JWT against the shared secret.
    pub fn verify_federation_jwt(&self, token: &str) -> Result<FederationClaims, JwtError> {
        let mut validation = Validation::default();
        validation.set_audience(&[self.local.as_str()]);
        jsonwebtoken::decode::<FederationClaims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| JwtError(err.to_string()))
    }

    //--- Internals

    fn cached_introspection(&self, key: &str) -> Option<IntrospectionResult> {
        let caches = self.caches.lock().unwrap();
        let entry = caches.introspection.get(key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        let mut result = entry.result.clone();
        result.trust_verified = true;
        Some(result)
    }

    fn cache_introspection(&self, key: String, result: &IntrospectionResult) {
        let mut caches = self.caches.lock().unwrap();
        // Drop stale entries opportunistically; the cache stays small.
        let now = Instant::now();
        caches.introspection.retain(|_, e| e.expires > now);
        caches.introspection.insert(
            key,
            CachedIntrospection {
                result: result.clone(),
                expires: now + INTROSPECTION_CACHE_TTL,
            },
        );
    }

    /// Attempt to settle a JWT-format token locally against the origin's
    /// JWKS.  `None` means "cannot decide here, introspect remotely".
    async fn try_local_verify(
        &self,
        token: &str,
        origin: InstanceCode,
    ) -> Option<Result<Value, String>> {
        // Opaque tokens are not decidable locally.
        let header = jsonwebtoken::decode_header(token).ok()?;
        let kid = header.kid?;

        let jwks = self.fetch_jwks(origin).await?;
        let jwk = jwks.find(&kid)?;
        let key = DecodingKey::from_jwk(jwk).ok()?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        match jsonwebtoken::decode::<Value>(token, &key, &validation) {
            Ok(data) => Some(Ok(data.claims)),
            Err(err) => Some(Err(format!("token signature rejected: {err}"))),
        }
    }

    /// The origin's JWKS, from cache or the wire.
    async fn fetch_jwks(&self, origin: InstanceCode) -> Option<jsonwebtoken::jwk::JwkSet> {
        {
            let caches = self.caches.lock().unwrap();
            if let Some(entry) = caches.jwks.get(&origin) {
                if entry.expires > Instant::now() {
                    return Some(entry.keys.clone());
                }
            }
        }

        if !self.breakers.should_allow(origin) {
            return None;
        }
        let endpoint = self.endpoint_for(origin)?;
        let url = join_url(&endpoint, ".well-known/jwks.json");

        let _permit = tokio::time::timeout(self.timeout, self.limiter.clone().acquire_owned())
            .await
            .ok()?
            .ok()?;
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let response = match response {
            Ok(response) => {
                self.breakers.record_success(origin);
                response
            }
            Err(err) => {
                self.breakers.record_failure(origin);
                debug!("fetching JWKS for {origin} failed: {err}");
                return None;
            }
        };

        let ttl = cache_control_ttl(response.headers()).unwrap_or(JWKS_CACHE_TTL);
        let keys: jsonwebtoken::jwk::JwkSet = response.json().await.ok()?;

        let mut caches = self.caches.lock().unwrap();
        caches.jwks.insert(
            origin,
            CachedJwks {
                keys: keys.clone(),
                expires: Instant::now() + ttl,
            },
        );
        Some(keys)
    }

    /// Where an instance's federation API lives: an approved spoke's API
    /// URL, or a configured peer hub endpoint.
    fn endpoint_for(&self, code: InstanceCode) -> Option<Url> {
        if let Some(spoke) = self.spokes.find_by_code(code) {
            if spoke.status == SpokeStatus::Approved {
                return Some(spoke.api_url.clone());
            }
        }
        self.peers
            .iter()
            .find(|p| p.code == code)
            .map(|p| p.endpoint.clone())
    }

    /// POST a JSON body under the outbound concurrency cap and deadline.
    async fn post_json(
        &self,
        url: Url,
        audience: InstanceCode,
        request_id: &str,
        body: &Value,
    ) -> Result<Value, OutboundError> {
        let permit = tokio::time::timeout(self.timeout, self.limiter.clone().acquire_owned())
            .await
            .map_err(|_| OutboundError::Timeout)?
            .expect("the limiter is never closed");

        let jwt = self
            .mint_federation_jwt(audience)
            .map_err(|err| OutboundError::Internal(err.to_string()))?;

        let result = self
            .client
            .post(url)
            .bearer_auth(jwt)
            .header("X-Correlation-ID", request_id)
            .header("X-Origin-Realm", self.local.as_str())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await;
        drop(permit);

        let response = result.map_err(|err| {
            if err.is_timeout() {
                OutboundError::Timeout
            } else {
                OutboundError::Network(err.to_string())
            }
        })?;
        let response = response
            .error_for_status()
            .map_err(|err| OutboundError::Network(err.to_string()))?;
        response
            .json()
            .await
            .map_err(|err| OutboundError::Network(err.to_string()))
    }
}

/// Filter requested scopes down to the edge's allowance.
///
/// An empty request means "everything the edge allows".  A non-empty
/// request whose intersection is empty is an error rather than a silent
/// downgrade to nothing.
fn filter_scopes(requested: &[String], allowed: &BTreeSet<String>) -> Result<Vec<String>, ()> {
    if requested.is_empty() {
        return Ok(allowed.iter().cloned().collect());
    }
    let granted: Vec<String> = requested
        .iter()
        .filter(|s| allowed.contains(*s))
        .cloned()
        .collect();
    if granted.is_empty() {
        return Err(());
    }
    Ok(granted)
}

/// The introspection cache key: `sha256(token) || origin`.
fn introspection_cache_key(token: &str, origin: InstanceCode) -> String {
    let hash = hex_encode(digest::digest(&digest::SHA256, token.as_bytes()).as_ref());
    format!("{hash}:{origin}")
}

/// The max-age of a response, if declared.
fn cache_control_ttl(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
    value.split(',').find_map(|directive| {
        let secs: u64 = directive.trim().strip_prefix("max-age=")?.parse().ok()?;
        Some(Duration::from_secs(secs))
    })
}

//----------- Errors -----------------------------------------------------------

/// An error minting or verifying a federation JWT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JwtError(pub String);

impl std::error::Error for JwtError {}

impl std::fmt::Display for JwtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "federation JWT error: {}", self.0)
    }
}

/// A typed outbound call failure.
#[derive(Clone, Debug, PartialEq, Eq)]
enum OutboundError {
    /// The deadline expired, in the queue or on the wire.
    Timeout,

    /// The network or the peer misbehaved.
    Network(String),

    /// A local precondition failed.
    Internal(String),
}

impl std::fmt::Display for OutboundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("deadline exceeded"),
            Self::Network(err) => write!(f, "network error: {err}"),
            Self::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::clearance::Clearance;
    use crate::breaker::BreakerConfig;
    use crate::trust::{DataIsolation, TrustEdge, TrustLevel};
    use std::time::Duration;

    fn code(s: &str) -> InstanceCode {
        s.parse().unwrap()
    }

    fn engine_with_trust(edges: &[(&str, &str)]) -> ExchangeEngine {
        let trust = Arc::new(TrustRegistry::new());
        for (source, target) in edges {
            trust
                .upsert(TrustEdge {
                    source: code(source),
                    target: code(target),
                    trust_level: TrustLevel::Bilateral,
                    max_classification: Clearance::Secret,
                    allowed_scopes: BTreeSet::from([
                        "policy:base".to_owned(),
                        "policy:fvey".to_owned(),
                    ]),
                    data_isolation: DataIsolation::Filtered,
                    enabled: true,
                    valid_from: None,
                    valid_to: None,
                })
                .unwrap();
        }
        let federation = FederationConfig {
            jwt_secret: "test-secret".into(),
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        ExchangeEngine::new(
            code("HUB"),
            &federation,
            trust,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(SpokeRegistry::new(Duration::from_secs(30))),
        )
    }

    #[tokio::test]
    async fn self_introspection_is_rejected() {
        let engine = engine_with_trust(&[]);
        let result = engine.introspect("tok", "USA", "usa", "req-1").await;
        assert!(!result.active);
        assert!(!result.trust_verified);
        assert_eq!(
            result.error.as_deref(),
            Some("self-introspection is not permitted")
        );
    }

    #[tokio::test]
    async fn unknown_instances_are_rejected() {
        let engine = engine_with_trust(&[]);
        for (origin, requesting) in [("UNKNOWN", "USA"), ("USA", "UNKNOWN"), ("ATLANTIS", "USA")] {
            let result = engine.introspect("tok", origin, requesting, "req-2").await;
            assert!(!result.active);
            assert!(!result.trust_verified);
        }
    }

    #[tokio::test]
    async fn introspection_requires_trust() {
        let engine = engine_with_trust(&[]);
        let result = engine.introspect("tok", "USA", "FRA", "req-3").await;
        assert!(!result.active);
        assert!(!result.trust_verified);
        assert_eq!(result.error.as_deref(), Some("No bilateral trust"));
    }

    #[tokio::test]
    async fn exchange_without_trust_is_invalid_grant() {
        let engine = engine_with_trust(&[]);
        let result = engine
            .exchange(ExchangeRequest {
                subject_token: "tok".into(),
                subject_token_type: default_token_type(),
                origin_instance: "USA".into(),
                target_instance: "UNKNOWN".into(),
                requested_scopes: Vec::new(),
                request_id: None,
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("invalid_grant"));
        assert!(result
            .error_description
            .as_deref()
            .unwrap()
            .contains("No bilateral trust"));
        assert_eq!(result.origin_instance, "USA");
        assert_eq!(result.target_instance, "UNKNOWN");
        // The audit id is a well-formed UUID even on failure.
        uuid::Uuid::parse_str(&result.audit_id).unwrap();
    }

    #[tokio::test]
    async fn exchange_with_trust_but_dead_origin_shapes_the_failure() {
        // Trust exists in both directions, but no endpoint is configured
        // for the origin, so introspection cannot succeed.
        let engine = engine_with_trust(&[("USA", "FRA"), ("FRA", "USA")]);
        let result = engine
            .exchange(ExchangeRequest {
                subject_token: "tok".into(),
                subject_token_type: default_token_type(),
                origin_instance: "USA".into(),
                target_instance: "FRA".into(),
                requested_scopes: Vec::new(),
                request_id: Some("req-4".into()),
            })
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("invalid_grant"));
        uuid::Uuid::parse_str(&result.audit_id).unwrap();
    }

    #[test]
    fn scope_filtering() {
        let allowed = BTreeSet::from(["policy:base".to_owned(), "policy:fvey".to_owned()]);

        // Empty request: everything allowed.
        assert_eq!(
            filter_scopes(&[], &allowed).unwrap(),
            vec!["policy:base".to_owned(), "policy:fvey".to_owned()]
        );

        // Intersection.
        assert_eq!(
            filter_scopes(
                &["policy:fvey".to_owned(), "policy:usa".to_owned()],
                &allowed
            )
            .unwrap(),
            vec!["policy:fvey".to_owned()]
        );

        // Non-empty request, empty intersection: an error.
        assert!(filter_scopes(&["policy:usa".to_owned()], &allowed).is_err());
    }

    #[test]
    fn federation_jwts_round_trip() {
        let engine = engine_with_trust(&[]);
        let token = engine.mint_federation_jwt(code("HUB")).unwrap();
        let claims = engine.verify_federation_jwt(&token).unwrap();

        assert_eq!(claims.iss, "HUB");
        assert_eq!(claims.sub, "HUB-federation-service");
        assert_eq!(claims.realm, "HUB");
        // Short-lived: five minutes or less.
        assert!(claims.exp - claims.iat <= 300);
    }

    #[test]
    fn introspection_cache_keys_bind_token_and_origin() {
        let a = introspection_cache_key("tok", code("USA"));
        let b = introspection_cache_key("tok", code("FRA"));
        let c = introspection_cache_key("tok2", code("USA"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(":USA"));
    }

    #[test]
    fn url_joining_tolerates_trailing_slashes() {
        let base: Url = "https://hub.example/api/".parse().unwrap();
        assert_eq!(
            join_url(&base, "introspect").as_str(),
            "https://hub.example/api/introspect"
        );
        let base: Url = "https://hub.example".parse().unwrap();
        assert_eq!(
            join_url(&base, ".well-known/jwks.json").as_str(),
            "https://hub.example/.well-known/jwks.json"
        );
    }
}
