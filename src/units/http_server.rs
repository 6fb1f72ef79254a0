//! The HTTP API unit.
//!
//! "HS" serves two surfaces from one listener: the admin API (spoke
//! registry, bundles, policy data; authentication is handled in front of
//! the hub) and the peer-facing federation API (`/introspect`, `/token`,
//! `/federation/resources`, JWKS).  Every response is wrapped in the
//! `{success, data?, error?, message?, correlationId}` envelope, and the
//! correlation id is carried into every downstream call.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use jiff::Timestamp;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::api::{
    ApiResponse, BundleBuild, BundleScopes, CurrentBundle, ErrorKind, FederationPush,
    FederationPushOutcome, FederationPushResult, FederationResources, InlineDataPublish,
    IntrospectRequest, IntrospectResponse, SpokeApprove, SpokeList, SpokeRegister,
    SpokeRegisterResult, SpokeTokenResult, StatusChange,
};
use crate::center::{self, Center};
use crate::exchange::ExchangeRequest;
use crate::federation::ConflictResolution;
use crate::manager::{ApplicationCommand, Terminated};
use crate::spoke::{
    ApproveError, HeartbeatStats, RegisterError, RevokeError, SuspendError, TokenError,
};

const HTTP_UNIT_NAME: &str = "HS";

pub struct HttpServer {
    pub center: Arc<Center>,
}

struct HttpServerState {
    center: Arc<Center>,
}

impl HttpServer {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) -> Result<(), Terminated> {
        let sock = TcpListener::bind(self.center.config.listen_addr)
            .await
            .map_err(|e| {
                error!("[{HTTP_UNIT_NAME}]: {e}");
                Terminated
            })?;

        tokio::task::spawn(async move {
            loop {
                let cmd = cmd_rx.recv().await;
                let Some(cmd) = cmd else {
                    return Result::<(), Terminated>::Err(Terminated);
                };
                debug!("[{HTTP_UNIT_NAME}] Received command: {cmd:?}");
                if matches!(cmd, ApplicationCommand::Terminate) {
                    return Err(Terminated);
                }
            }
        });

        let state = Arc::new(HttpServerState {
            center: self.center,
        });

        let app = Router::new()
            // Admin: spoke registry.
            .route("/spokes", post(Self::spoke_register))
            .route("/spokes", get(Self::spoke_list))
            .route("/spokes/pending", get(Self::spoke_list_pending))
            .route("/spokes/unhealthy", get(Self::spoke_list_unhealthy))
            .route("/spokes/{id}/approve", post(Self::spoke_approve))
            .route("/spokes/{id}/suspend", post(Self::spoke_suspend))
            .route("/spokes/{id}/revoke", post(Self::spoke_revoke))
            .route("/spokes/{id}/token", post(Self::spoke_token))
            .route("/spokes/{id}/heartbeat", post(Self::spoke_heartbeat))
            // Admin: bundles.
            .route("/bundles/build", post(Self::bundle_build))
            .route("/bundles/publish", post(Self::bundle_publish))
            .route("/bundles/build-and-publish", post(Self::bundle_build_and_publish))
            .route("/bundles/current", get(Self::bundle_current))
            .route("/bundles/scopes", get(Self::bundle_scopes))
            // Admin: policy data.
            .route("/policy-data", get(Self::policy_data))
            .route("/data/publish", post(Self::data_publish))
            .route("/refresh", post(Self::refresh))
            // Admin: bilateral trust.
            .route("/trust", get(Self::trust_list))
            .route("/trust", post(Self::trust_upsert))
            .route("/trust/{source}/{target}", delete(Self::trust_remove))
            // Admin: clearance equivalency.
            .route("/clearance", get(Self::clearance_list))
            .route("/clearance/{country}", post(Self::clearance_replace))
            // Admin: circuit breakers.
            .route("/breakers/{target}/force-open", post(Self::breaker_force_open))
            .route("/breakers/{target}/force-close", post(Self::breaker_force_close))
            .route("/breakers/{target}/maintenance", post(Self::breaker_enter_maintenance))
            .route("/breakers/{target}/maintenance/exit", post(Self::breaker_exit_maintenance))
            // Admin: federation sync log.
            .route("/federation/sync-log", get(Self::federation_sync_log))
            // Admin: attribute normalization.
            .route("/attributes/normalize", post(Self::normalize_attributes))
            // Peer-facing federation surface.
            .route("/introspect", post(Self::introspect))
            .route("/token", post(Self::token_exchange))
            .route("/federation/resources", post(Self::federation_push))
            .route("/federation/resources", get(Self::federation_pull))
            .route("/.well-known/jwks.json", get(Self::jwks))
            // Observability.
            .route("/metrics", get(Self::metrics))
            .route("/health", get(Self::health))
            .with_state(state);

        let _ = ready_tx.send(());
        info!("[{HTTP_UNIT_NAME}] Listening");

        axum::serve(sock, app).await.map_err(|e| {
            error!("[{HTTP_UNIT_NAME}]: {e}");
            Terminated
        })
    }

    //--- Spoke registry

    async fn spoke_register(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(req): Json<SpokeRegister>,
    ) -> (StatusCode, Json<ApiResponse<SpokeRegisterResult>>) {
        let correlation_id = correlation_id(&headers);
        match center::register_spoke(&state.center, req) {
            Ok((spoke, warnings)) => {
                (
                    StatusCode::CREATED,
                    Json(ApiResponse::ok(
                        SpokeRegisterResult { spoke, warnings },
                        correlation_id,
                    )),
                )
            }
            Err(err) => {
                let kind = match &err {
                    RegisterError::DuplicateInstanceCode(_) => ErrorKind::Conflict,
                    RegisterError::InvalidCertificate(_) => ErrorKind::InvalidInput,
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
        }
    }

    async fn spoke_list(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<SpokeList>> {
        let correlation_id = correlation_id(&headers);
        Json(ApiResponse::ok(
            SpokeList {
                spokes: state.center.spokes.all(),
            },
            correlation_id,
        ))
    }

    async fn spoke_list_pending(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<SpokeList>> {
        let correlation_id = correlation_id(&headers);
        Json(ApiResponse::ok(
            SpokeList {
                spokes: state
                    .center
                    .spokes
                    .with_status(crate::spoke::SpokeStatus::Pending),
            },
            correlation_id,
        ))
    }

    async fn spoke_list_unhealthy(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<SpokeList>> {
        let correlation_id = correlation_id(&headers);
        Json(ApiResponse::ok(
            SpokeList {
                spokes: state.center.spokes.unhealthy(),
            },
            correlation_id,
        ))
    }

    async fn spoke_approve(
        State(state): State<Arc<HttpServerState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(req): Json<SpokeApprove>,
    ) -> (StatusCode, Json<ApiResponse<crate::spoke::SpokeRecord>>) {
        let correlation_id = correlation_id(&headers);
        let approver = req.approver.clone();
        match center::approve_spoke(&state.center, &id.as_str().into(), &approver, req.into()) {
            Ok(record) => (
                StatusCode::OK,
                Json(ApiResponse::ok(record, correlation_id)),
            ),
            Err(err) => {
                let kind = match &err {
                    ApproveError::NotFound => ErrorKind::NotFound,
                    ApproveError::AlreadyApproved | ApproveError::NotPending(_) => {
                        ErrorKind::Conflict
                    }
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
        }
    }

    async fn spoke_suspend(
        State(state): State<Arc<HttpServerState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(req): Json<StatusChange>,
    ) -> (StatusCode, Json<ApiResponse<crate::spoke::SpokeRecord>>) {
        let correlation_id = correlation_id(&headers);
        match center::suspend_spoke(&state.center, &id.as_str().into(), &req.reason) {
            Ok(record) => (
                StatusCode::OK,
                Json(ApiResponse::ok(record, correlation_id)),
            ),
            Err(err) => {
                let kind = match &err {
                    SuspendError::NotFound => ErrorKind::NotFound,
                    SuspendError::NotApproved(_) => ErrorKind::Conflict,
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
        }
    }

    async fn spoke_revoke(
        State(state): State<Arc<HttpServerState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(req): Json<StatusChange>,
    ) -> (StatusCode, Json<ApiResponse<crate::spoke::SpokeRecord>>) {
        let correlation_id = correlation_id(&headers);
        match center::revoke_spoke(&state.center, &id.as_str().into(), &req.reason) {
            Ok(record) => (
                StatusCode::OK,
                Json(ApiResponse::ok(record, correlation_id)),
            ),
            Err(err) => {
                let kind = match &err {
                    RevokeError::NotFound => ErrorKind::NotFound,
                    RevokeError::AlreadyRevoked => ErrorKind::Conflict,
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
        }
    }

    async fn spoke_token(
        State(state): State<Arc<HttpServerState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<ApiResponse<SpokeTokenResult>>) {
        let correlation_id = correlation_id(&headers);
        match state.center.spokes.generate_token(&id.as_str().into()) {
            Ok(token) => (
                StatusCode::CREATED,
                Json(ApiResponse::ok(
                    SpokeTokenResult {
                        token: token.token.to_string(),
                        expires_at: token.expires_at,
                        scopes: token.scopes,
                    },
                    correlation_id,
                )),
            ),
            Err(err) => {
                let kind = match &err {
                    TokenError::NotFound => ErrorKind::NotFound,
                    TokenError::NotApproved(_) => ErrorKind::Unauthorized,
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
        }
    }

    async fn spoke_heartbeat(
        State(state): State<Arc<HttpServerState>>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(stats): Json<HeartbeatStats>,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let correlation_id = correlation_id(&headers);
        match center::record_heartbeat(&state.center, &id.as_str().into(), stats) {
            Ok(()) => (StatusCode::OK, Json(ApiResponse::ok((), correlation_id))),
            Err(err) => (
                status_for(ErrorKind::NotFound),
                Json(ApiResponse::err(
                    ErrorKind::NotFound,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    //--- Bundles

    async fn bundle_build(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(options): Json<BundleBuild>,
    ) -> (StatusCode, Json<ApiResponse<crate::bundle::BundlePointer>>) {
        let correlation_id = correlation_id(&headers);
        let center = state.center.clone();
        let result =
            tokio::task::spawn_blocking(move || center::build_bundle(&center, &options)).await;

        match result {
            Ok(Ok(pointer)) => (
                StatusCode::CREATED,
                Json(ApiResponse::ok(pointer, correlation_id)),
            ),
            Ok(Err(err)) => {
                let kind = match &err {
                    crate::bundle::BuildError::MissingSigningKey => ErrorKind::Fatal,
                    crate::bundle::BuildError::Io(..) => ErrorKind::TransientIo,
                };
                (
                    status_for(kind),
                    Json(ApiResponse::err(kind, err.to_string(), correlation_id)),
                )
            }
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err(
                    ErrorKind::Fatal,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    async fn bundle_publish(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<String>> {
        let correlation_id = correlation_id(&headers);
        let _ = state
            .center
            .app_cmd_tx
            .send(("PB".into(), ApplicationCommand::PublishBundle));
        Json(ApiResponse::ok("submitted".into(), correlation_id))
    }

    async fn bundle_build_and_publish(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(options): Json<BundleBuild>,
    ) -> Json<ApiResponse<String>> {
        let correlation_id = correlation_id(&headers);
        let _ = state.center.app_cmd_tx.send((
            "PB".into(),
            ApplicationCommand::BuildAndPublish {
                options,
                reason: format!("admin request {correlation_id}"),
            },
        ));
        Json(ApiResponse::ok("submitted".into(), correlation_id))
    }

    async fn bundle_current(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<CurrentBundle>> {
        let correlation_id = correlation_id(&headers);
        let bundle = state
            .center
            .current_bundle
            .load_full()
            .map(|p| (*p).clone());
        Json(ApiResponse::ok(CurrentBundle { bundle }, correlation_id))
    }

    async fn bundle_scopes(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<ApiResponse<BundleScopes>>) {
        let correlation_id = correlation_id(&headers);
        match state.center.builder.available_scopes() {
            Ok(scopes) => (
                StatusCode::OK,
                Json(ApiResponse::ok(BundleScopes { scopes }, correlation_id)),
            ),
            Err(err) => (
                status_for(ErrorKind::TransientIo),
                Json(ApiResponse::err(
                    ErrorKind::TransientIo,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    //--- Policy data

    async fn policy_data(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<Value>> {
        let correlation_id = correlation_id(&headers);
        let issuers = state.center.trusted_issuers.load();
        let data = serde_json::json!({
            "trustedIssuers": issuers.issuers,
            "federationMatrix": state.center.trust.edges(),
            "clearanceEquivalency": state.center.clearance.snapshot(),
        });
        Json(ApiResponse::ok(data, correlation_id))
    }

    async fn data_publish(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(req): Json<InlineDataPublish>,
    ) -> Json<ApiResponse<String>> {
        let correlation_id = correlation_id(&headers);
        let _ = state.center.app_cmd_tx.send((
            "PB".into(),
            ApplicationCommand::PublishInlineData {
                path: req.path,
                data: req.data,
                reason: req.reason,
            },
        ));
        Json(ApiResponse::ok("submitted".into(), correlation_id))
    }

    async fn refresh(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<String>> {
        let correlation_id = correlation_id(&headers);
        let _ = state
            .center
            .app_cmd_tx
            .send(("PB".into(), ApplicationCommand::TriggerRefresh));
        Json(ApiResponse::ok("submitted".into(), correlation_id))
    }

    //--- Bilateral trust

    async fn trust_list(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<Vec<crate::trust::TrustEdge>>> {
        let correlation_id = correlation_id(&headers);
        Json(ApiResponse::ok(state.center.trust.edges(), correlation_id))
    }

    async fn trust_upsert(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(edge): Json<crate::trust::TrustEdge>,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let correlation_id = correlation_id(&headers);
        match center::upsert_trust_edge(&state.center, edge) {
            Ok(()) => (StatusCode::OK, Json(ApiResponse::ok((), correlation_id))),
            Err(err) => (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    async fn trust_remove(
        State(state): State<Arc<HttpServerState>>,
        Path((source, target)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let correlation_id = correlation_id(&headers);
        let (Ok(source), Ok(target)) = (source.parse(), target.parse()) else {
            return (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    "instance codes are three ASCII letters",
                    correlation_id,
                )),
            );
        };
        if center::remove_trust_edge(&state.center, source, target) {
            (StatusCode::OK, Json(ApiResponse::ok((), correlation_id)))
        } else {
            (
                status_for(ErrorKind::NotFound),
                Json(ApiResponse::err(
                    ErrorKind::NotFound,
                    "no such trust edge",
                    correlation_id,
                )),
            )
        }
    }

    //--- Clearance equivalency

    async fn clearance_list(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<Value>> {
        let correlation_id = correlation_id(&headers);
        let snapshot = serde_json::to_value(state.center.clearance.snapshot())
            .expect("the clearance snapshot serializes");
        Json(ApiResponse::ok(snapshot, correlation_id))
    }

    async fn clearance_replace(
        State(state): State<Arc<HttpServerState>>,
        Path(country): Path<String>,
        headers: HeaderMap,
        Json(entries): Json<
            std::collections::BTreeMap<
                crate::attrs::clearance::Clearance,
                crate::attrs::clearance::EquivalencyEntry,
            >,
        >,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let correlation_id = correlation_id(&headers);
        let Ok(country) = country.parse() else {
            return (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    "not an ISO-3166-1 alpha-3 country code",
                    correlation_id,
                )),
            );
        };
        match center::replace_clearance_vocabulary(&state.center, country, entries) {
            Ok(()) => (StatusCode::OK, Json(ApiResponse::ok((), correlation_id))),
            Err(err) => (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    //--- Circuit breakers

    async fn breaker_force_open(
        State(state): State<Arc<HttpServerState>>,
        Path(target): Path<String>,
        headers: HeaderMap,
        Json(req): Json<StatusChange>,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        Self::breaker_op(state, target, headers, move |center, target| {
            let event = center.breakers.force_open(target, &req.reason);
            info!("[{HTTP_UNIT_NAME}] Breaker for {target}: {event:?}");
            crate::center::Change::CircuitOpened(target)
        })
    }

    async fn breaker_force_close(
        State(state): State<Arc<HttpServerState>>,
        Path(target): Path<String>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        Self::breaker_op(state, target, headers, |center, target| {
            let event = center.breakers.force_close(target);
            info!("[{HTTP_UNIT_NAME}] Breaker for {target}: {event:?}");
            crate::center::Change::CircuitClosed(target)
        })
    }

    async fn breaker_enter_maintenance(
        State(state): State<Arc<HttpServerState>>,
        Path(target): Path<String>,
        headers: HeaderMap,
        Json(req): Json<StatusChange>,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        Self::breaker_op(state, target, headers, move |center, target| {
            let event = center.breakers.enter_maintenance(target, &req.reason);
            info!("[{HTTP_UNIT_NAME}] Breaker for {target}: {event:?}");
            crate::center::Change::MaintenanceEntered(target)
        })
    }

    async fn breaker_exit_maintenance(
        State(state): State<Arc<HttpServerState>>,
        Path(target): Path<String>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        Self::breaker_op(state, target, headers, |center, target| {
            if let Some(event) = center.breakers.exit_maintenance(target) {
                info!("[{HTTP_UNIT_NAME}] Breaker for {target}: {event:?}");
            }
            crate::center::Change::MaintenanceExited(target)
        })
    }

    /// Shared shape of the manual breaker overrides.
    fn breaker_op(
        state: Arc<HttpServerState>,
        target: String,
        headers: HeaderMap,
        op: impl FnOnce(&Arc<Center>, crate::trust::InstanceCode) -> crate::center::Change,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        let correlation_id = correlation_id(&headers);
        let Ok(target) = target.parse() else {
            return (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    "instance codes are three ASCII letters",
                    correlation_id,
                )),
            );
        };
        let change = op(&state.center, target);
        let _ = state
            .center
            .update_tx
            .send(crate::manager::Update::Changed(change));
        (StatusCode::OK, Json(ApiResponse::ok((), correlation_id)))
    }

    //--- Federation sync log

    async fn federation_sync_log(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
    ) -> Json<ApiResponse<Vec<crate::federation::SyncResult>>> {
        let correlation_id = correlation_id(&headers);
        Json(ApiResponse::ok(
            state.center.resources.sync_log(),
            correlation_id,
        ))
    }

    //--- Attribute normalization

    async fn normalize_attributes(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<ApiResponse<crate::attrs::SubjectAttributes>>) {
        let correlation_id = correlation_id(&headers);
        let alias = body
            .get("idpAlias")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let claims = body.get("claims").cloned().unwrap_or(Value::Null);

        match state.center.normalizer.normalize(&alias, &claims) {
            Ok(attrs) => (
                StatusCode::OK,
                Json(ApiResponse::ok(attrs, correlation_id)),
            ),
            Err(err) => (
                status_for(ErrorKind::InvalidInput),
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    err.to_string(),
                    correlation_id,
                )),
            ),
        }
    }

    //--- Peer-facing federation surface

    /// RFC 7662 introspection of locally-issued spoke tokens.
    async fn introspect(
        State(state): State<Arc<HttpServerState>>,
        Json(req): Json<IntrospectRequest>,
    ) -> Json<IntrospectResponse> {
        let validation = state.center.spokes.validate_token(&req.token);
        state.center.metrics.record_authorization(validation.valid);

        if !validation.valid {
            // Per RFC 7662, an unknown or expired token is simply inactive.
            return Json(IntrospectResponse {
                active: false,
                sub: None,
                scope: None,
                exp: None,
                iat: None,
            });
        }

        let (exp, iat) = state
            .center
            .spokes
            .token(&req.token)
            .map(|t| (t.expires_at.as_second(), t.issued_at.as_second()))
            .unzip();

        Json(IntrospectResponse {
            active: true,
            sub: validation.spoke.map(|id| id.to_string()),
            scope: Some(
                validation
                    .scopes
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            exp,
            iat,
        })
    }

    /// RFC 8693 token exchange.
    async fn token_exchange(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(mut req): Json<ExchangeRequest>,
    ) -> Json<crate::exchange::ExchangeResult> {
        if req.request_id.is_none() {
            req.request_id = Some(correlation_id(&headers));
        }
        let result = state.center.exchange.exchange(req).await;
        state.center.metrics.record_authorization(result.success);
        Json(result)
    }

    async fn federation_push(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Json(push): Json<FederationPush>,
    ) -> (StatusCode, Json<ApiResponse<FederationPushResult>>) {
        let correlation_id = push.correlation_id.clone();

        let Some(peer) = Self::verified_peer(&state, &headers, &correlation_id) else {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::err(
                    ErrorKind::Unauthorized,
                    "a valid federation token is required",
                    correlation_id,
                )),
            );
        };

        let local = state.center.config.instance_code;
        let count = push.resources.len();
        // Remember which resources arrived so per-resource outcomes can be
        // derived from the conflict records.
        let ids: Vec<String> = push.resources.iter().map(|r| r.resource_id.clone()).collect();
        let outcome =
            state
                .center
                .resources
                .apply_inbound(local, peer, push.resources, Timestamp::now());

        let results = ids
            .into_iter()
            .map(|resource_id| {
                let status = outcome
                    .conflicts
                    .iter()
                    .find(|c| c.resource_id == resource_id)
                    .map(|c| match c.resolution {
                        ConflictResolution::LocalWins => "conflicted",
                        ConflictResolution::RemoteWins => "updated",
                    })
                    .unwrap_or("synced");
                FederationPushOutcome {
                    resource_id,
                    status: status.to_owned(),
                }
            })
            .collect();

        info!(
            "[{HTTP_UNIT_NAME}] Federation push from {peer}: {count} resources, \
             {} synced, {} updated, {} conflicted",
            outcome.synced, outcome.updated, outcome.conflicted
        );
        (
            StatusCode::OK,
            Json(ApiResponse::ok(
                FederationPushResult { results },
                correlation_id,
            )),
        )
    }

    async fn federation_pull(
        State(state): State<Arc<HttpServerState>>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> (StatusCode, Json<ApiResponse<FederationResources>>) {
        let correlation_id = correlation_id(&headers);

        let Some(_peer) = Self::verified_peer(&state, &headers, &correlation_id) else {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::err(
                    ErrorKind::Unauthorized,
                    "a valid federation token is required",
                    correlation_id,
                )),
            );
        };

        let Some(releasable_to) = params
            .get("releasableTo")
            .and_then(|c| c.parse().ok())
        else {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::err(
                    ErrorKind::InvalidInput,
                    "releasableTo must be an alpha-3 realm code",
                    correlation_id,
                )),
            );
        };
        let exclude_origin = params.get("excludeOrigin").and_then(|c| c.parse().ok());

        let resources = state
            .center
            .resources
            .releasable_to(releasable_to, exclude_origin);
        (
            StatusCode::OK,
            Json(ApiResponse::ok(
                FederationResources { resources },
                correlation_id,
            )),
        )
    }

    /// Verify the federation bearer token and return the calling realm.
    fn verified_peer(
        state: &Arc<HttpServerState>,
        headers: &HeaderMap,
        correlation_id: &str,
    ) -> Option<crate::trust::InstanceCode> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;
        match state.center.exchange.verify_federation_jwt(token) {
            Ok(claims) => claims.realm.parse().ok(),
            Err(err) => {
                warn!("[{HTTP_UNIT_NAME}] Rejected federation token ({correlation_id}): {err}");
                None
            }
        }
    }

    async fn jwks(State(_state): State<Arc<HttpServerState>>) -> Json<Value> {
        // Federation JWTs are HMAC-signed against the shared federation
        // secret; there are no public keys to advertise.  The document
        // exists so peers can probe the endpoint uniformly.
        Json(serde_json::json!({ "keys": [] }))
    }

    //--- Observability

    async fn metrics(State(state): State<Arc<HttpServerState>>) -> Result<String, StatusCode> {
        state
            .center
            .metrics
            .assemble(&state.center)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    async fn health(State(state): State<Arc<HttpServerState>>) -> Json<Value> {
        let report = state.center.metrics.health_report();
        let modes: Vec<Value> = state
            .center
            .breakers
            .states()
            .into_iter()
            .map(|(target, circuit)| {
                serde_json::json!({
                    "target": target,
                    "circuit": circuit,
                    "mode": state.center.breakers.mode(target),
                })
            })
            .collect();
        Json(serde_json::json!({
            "status": report.status,
            "score": report.overall,
            "hostname": hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "instance": state.center.config.instance_code,
            "components": {
                "authorization": report.authorization,
                "connectivity": report.connectivity,
                "policySync": report.policy_sync,
            },
            "targets": modes,
        }))
    }
}

/// The request's correlation id, minting one if the caller did not send it.
fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Map an error kind to its HTTP status.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransientIo => StatusCode::BAD_GATEWAY,
        ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
