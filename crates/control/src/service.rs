//! The control RPC surface.
//!
//! One process-wide service instance with explicit start/stop; the
//! token issuer, verification key, session registry, telemetry, and
//! store handle are all injected. Every mutation commits in the store
//! before the derived delta is broadcast.

use crate::auth;
use crate::error::ControlError;
use crate::session::SessionRegistry;
use crate::telemetry::Telemetry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use trellis_core::config::ControlConfig;
use trellis_proto::control_server::Control;
use trellis_proto::{
    Account, AccountServices, AddLabelLinkRequest, Capability, CentralActivity, ConfigRequest,
    ConfigResponse, CreateTokenRequest, HubDisconnectRequest, HubFrame, HubInfo, LabelLink,
    LabelLinks, ListOfHubs, NetworkLocation, Noop, RegisterRequest, RemoveLabelLinkRequest,
    ServiceRequest, ServiceResponse, ServiceRoute, ServiceTokenRequest, ServiceTokenResponse,
    TokenResponse, TokenRole, id_bytes, parse_id, spec_string,
};
use trellis_registry::repos::NewService;
use trellis_registry::{ActivityReader, RegistryStore, RouteAdded};
use trellis_token::{TokenIssuer, TokenSpec};
use uuid::Uuid;

/// TLS bundle handed to hubs in ConfigResponse.
#[derive(Clone, Default)]
pub struct HubTls {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Stored form of a hub's network locations.
#[derive(Serialize, Deserialize)]
struct StoredLocation {
    addresses: Vec<String>,
    name: String,
}

fn encode_locations(locations: &[NetworkLocation]) -> serde_json::Result<String> {
    let stored: Vec<StoredLocation> = locations
        .iter()
        .map(|l| StoredLocation {
            addresses: l.addresses.clone(),
            name: l.name.clone(),
        })
        .collect();
    serde_json::to_string(&stored)
}

fn decode_locations(raw: &str) -> serde_json::Result<Vec<NetworkLocation>> {
    let stored: Vec<StoredLocation> = serde_json::from_str(raw)?;
    Ok(stored
        .into_iter()
        .map(|l| NetworkLocation {
            addresses: l.addresses,
            name: l.name,
        })
        .collect())
}

/// Canonical label strings from the store, back into wire form.
fn labels_from_store(labels: &[String]) -> trellis_proto::LabelSet {
    let parts: Vec<&str> = labels.iter().map(String::as_str).collect();
    match trellis_core::LabelSet::parse(&parts) {
        Ok(set) => trellis_proto::LabelSet::from_core(&set),
        Err(err) => {
            tracing::error!(error = %err, "stored labels failed to parse");
            trellis_proto::LabelSet::default()
        }
    }
}

fn route_to_account_services(route: RouteAdded) -> AccountServices {
    AccountServices {
        account: Some(Account::new(route.account_id, route.namespace)),
        services: route
            .services
            .into_iter()
            .map(|s| ServiceRoute {
                hub: id_bytes(s.hub_id),
                id: id_bytes(s.service_id),
                r#type: s.service_type,
                labels: Some(labels_from_store(&s.labels)),
            })
            .collect(),
    }
}

/// The control-plane service.
pub struct ControlService {
    config: Arc<ControlConfig>,
    store: Arc<dyn RegistryStore>,
    issuer: TokenIssuer,
    verify_key: [u8; 32],
    sessions: SessionRegistry,
    telemetry: Arc<Telemetry>,
    hub_tls: HubTls,
}

impl ControlService {
    pub fn new(
        config: Arc<ControlConfig>,
        store: Arc<dyn RegistryStore>,
        issuer: TokenIssuer,
        verify_key: [u8; 32],
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            config,
            store,
            issuer,
            verify_key,
            sessions: SessionRegistry::new(),
            telemetry,
            hub_tls: HubTls::default(),
        }
    }

    /// Install the TLS bundle served to hubs.
    pub fn set_hub_tls(&mut self, cert: Vec<u8>, key: Vec<u8>) {
        self.hub_tls = HubTls { cert, key };
    }

    /// A handle onto the session registry (it is shared state).
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Tail an activity reader and fan each batch out to every
    /// connected hub. Routing mutations on other replicas reach our
    /// hubs through this path.
    pub fn spawn_activity_pump(&self, mut reader: ActivityReader) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            while let Some(batch) = reader.next_batch().await {
                tracing::info!(entries = batch.len(), "detected routing activity");
                let activity = CentralActivity {
                    account_services: batch.into_iter().map(route_to_account_services).collect(),
                    new_label_links: None,
                };
                sessions.broadcast(&activity).await;
            }
            tracing::info!("activity reader terminated");
        })
    }

    /// Re-materialize routing for every affected account.
    async fn rematerialize(&self, accounts: &[Uuid]) -> Result<(), ControlError> {
        for account in accounts {
            self.store.update_account_routing(*account).await?;
        }
        Ok(())
    }

    /// An immediately closed response stream, for sessions that never
    /// completed registration.
    fn closed_stream() -> ReceiverStream<Result<CentralActivity, Status>> {
        let (_tx, rx) = mpsc::channel(1);
        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl Control for ControlService {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<TokenResponse>, Status> {
        auth::check_shared(request.metadata(), &self.config.auth.register_token)?;
        let req = request.into_inner();

        trellis_core::namespace::validate(&req.namespace).map_err(ControlError::from)?;

        self.store
            .create_management_client(Uuid::new_v4(), &req.namespace)
            .await
            .map_err(ControlError::from)?;

        let token = self
            .issuer
            .sign(TokenSpec::manage(req.namespace.as_str()))
            .await
            .map_err(ControlError::Upstream)?;

        tracing::info!(namespace = %req.namespace, "management client registered");
        Ok(Response::new(TokenResponse { token }))
    }

    async fn issue_hub_token(
        &self,
        request: Request<Noop>,
    ) -> Result<Response<TokenResponse>, Status> {
        auth::check_shared(request.metadata(), &self.config.auth.register_token)?;

        let token = self
            .issuer
            .sign(TokenSpec::hub())
            .await
            .map_err(ControlError::Upstream)?;
        Ok(Response::new(TokenResponse { token }))
    }

    async fn fetch_config(
        &self,
        request: Request<ConfigRequest>,
    ) -> Result<Response<ConfigResponse>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let stable = parse_id(&req.stable_id).map_err(ControlError::from)?;
        let instance = parse_id(&req.instance_id).map_err(ControlError::from)?;

        tracing::info!(hub = %stable, "fetching configuration");

        let locations = encode_locations(&req.locations).map_err(ControlError::from)?;
        let checkin = self
            .store
            .checkin_hub(stable, instance, &locations)
            .await
            .map_err(ControlError::from)?;

        if let Some(prev) = checkin.rotated_instance {
            tracing::info!(hub = %stable, prev = %prev, new = %instance, "hub instance rotated");
            self.rematerialize(&checkin.affected_accounts).await?;
        }

        Ok(Response::new(ConfigResponse {
            tls_cert: self.hub_tls.cert.clone(),
            tls_key: self.hub_tls.key.clone(),
            token_pub: self.verify_key.to_vec(),
            s3_access_key: self.config.object_store.access_key.clone(),
            s3_secret_key: self.config.object_store.secret_key.clone(),
            s3_bucket: self.config.object_store.bucket.clone(),
        }))
    }

    async fn add_service(
        &self,
        request: Request<ServiceRequest>,
    ) -> Result<Response<ServiceResponse>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let account = req
            .account
            .clone()
            .ok_or_else(|| ControlError::InvalidRequest("missing account".into()))?;
        let account_id = account.key().map_err(ControlError::from)?;
        let hub_id = parse_id(&req.hub).map_err(ControlError::from)?;
        let service_id = parse_id(&req.id).map_err(ControlError::from)?;
        let labels = req
            .labels
            .clone()
            .unwrap_or_default()
            .to_core()
            .map_err(ControlError::from)?;

        self.store
            .add_service(&NewService {
                service_id,
                hub_id,
                account_id,
                account_namespace: account.namespace.clone(),
                service_type: req.r#type.clone(),
                labels: labels.as_strings(),
            })
            .await
            .map_err(ControlError::from)?;

        // Committed; connected hubs can see the route now.
        self.sessions
            .broadcast(&CentralActivity {
                account_services: vec![AccountServices {
                    account: Some(account),
                    services: vec![ServiceRoute {
                        hub: req.hub,
                        id: req.id,
                        r#type: req.r#type,
                        labels: req.labels,
                    }],
                }],
                new_label_links: None,
            })
            .await;

        self.store
            .update_account_routing(account_id)
            .await
            .map_err(ControlError::from)?;

        Ok(Response::new(ServiceResponse {}))
    }

    async fn remove_service(
        &self,
        request: Request<ServiceRequest>,
    ) -> Result<Response<ServiceResponse>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let service_id = parse_id(&req.id).map_err(ControlError::from)?;
        self.store
            .remove_service(service_id)
            .await
            .map_err(ControlError::from)?;

        if let Some(account) = req.account {
            let account_id = account.key().map_err(ControlError::from)?;

            // Push the account's remaining routes; consumers apply the
            // set idempotently.
            let remaining = self
                .store
                .services_for_account(account_id)
                .await
                .map_err(ControlError::from)?;
            self.sessions
                .broadcast(&CentralActivity {
                    account_services: vec![AccountServices {
                        account: Some(account),
                        services: remaining
                            .into_iter()
                            .map(|s| ServiceRoute {
                                hub: id_bytes(s.hub_id),
                                id: id_bytes(s.service_id),
                                r#type: s.service_type,
                                labels: Some(labels_from_store(&s.labels)),
                            })
                            .collect(),
                    }],
                    new_label_links: None,
                })
                .await;

            self.store
                .update_account_routing(account_id)
                .await
                .map_err(ControlError::from)?;
        }

        Ok(Response::new(ServiceResponse {}))
    }

    async fn hub_disconnect(
        &self,
        request: Request<HubDisconnectRequest>,
    ) -> Result<Response<Noop>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let stable = parse_id(&req.stable_id).map_err(ControlError::from)?;
        let instance = parse_id(&req.instance_id).map_err(ControlError::from)?;

        // Best-effort cleanup: attempt every step and report everything
        // that failed as one composite error.
        let mut errors: Vec<ControlError> = Vec::new();

        tracing::info!(hub = %stable, "removing hub services");
        match self.store.remove_hub_services(instance).await {
            Ok(accounts) => {
                if let Err(err) = self.rematerialize(&accounts).await {
                    errors.push(err);
                }
            }
            Err(err) => errors.push(err.into()),
        }

        tracing::info!(hub = %stable, "removing hub");
        if let Err(err) = self.store.delete_hub(stable).await {
            errors.push(err.into());
        }

        if errors.is_empty() {
            Ok(Response::new(Noop {}))
        } else {
            tracing::warn!(hub = %stable, errors = errors.len(), "hub cleanup incomplete");
            Err(ControlError::Aggregate(errors).into())
        }
    }

    async fn add_label_link(
        &self,
        request: Request<AddLabelLinkRequest>,
    ) -> Result<Response<Noop>, Status> {
        let caller = auth::check_mgmt(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let mut account = req
            .account
            .ok_or_else(|| ControlError::InvalidRequest("missing account".into()))?;
        if account.namespace.is_empty() {
            account.namespace = caller.namespace().to_string();
        }
        if !caller.allow_account(&account.namespace) {
            return Err(ControlError::InvalidRequest("invalid namespace requested".into()).into());
        }

        let account_id = account.key().map_err(ControlError::from)?;
        let labels = req
            .labels
            .unwrap_or_default()
            .to_core()
            .map_err(ControlError::from)?;
        let target = req
            .target
            .unwrap_or_default()
            .to_core()
            .map_err(ControlError::from)?;

        self.store
            .upsert_account(account_id, &account.namespace)
            .await
            .map_err(ControlError::from)?;
        self.store
            .add_label_link(account_id, &labels.flatten(), &target.flatten())
            .await
            .map_err(ControlError::from)?;

        self.sessions
            .broadcast(&CentralActivity {
                account_services: Vec::new(),
                new_label_links: Some(LabelLinks {
                    label_links: vec![LabelLink {
                        account: Some(account),
                        labels: Some(trellis_proto::LabelSet::from_core(&labels)),
                        target: Some(trellis_proto::LabelSet::from_core(&target)),
                    }],
                }),
            })
            .await;

        Ok(Response::new(Noop {}))
    }

    async fn remove_label_link(
        &self,
        request: Request<RemoveLabelLinkRequest>,
    ) -> Result<Response<Noop>, Status> {
        let caller = auth::check_mgmt(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let account = req
            .account
            .ok_or_else(|| ControlError::InvalidRequest("missing account".into()))?;
        if !caller.allow_account(&account.namespace) {
            return Err(ControlError::InvalidRequest("invalid namespace requested".into()).into());
        }

        let account_id = account.key().map_err(ControlError::from)?;
        let labels = req
            .labels
            .unwrap_or_default()
            .to_core()
            .map_err(ControlError::from)?;

        self.store
            .remove_label_link(account_id, &labels.flatten())
            .await
            .map_err(ControlError::from)?;

        Ok(Response::new(Noop {}))
    }

    async fn create_token(
        &self,
        request: Request<CreateTokenRequest>,
    ) -> Result<Response<TokenResponse>, Status> {
        let caller = auth::check_mgmt(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let account = req
            .account
            .ok_or_else(|| ControlError::InvalidRequest("missing account".into()))?;
        if !caller.allow_account(&account.namespace) {
            return Err(ControlError::InvalidRequest("invalid namespace requested".into()).into());
        }

        // A delegate may only carry ACCESS grants inside the caller's
        // namespace.
        for capability in &req.capabilities {
            if capability.capability() == Capability::Access
                && !caller.allow_account(&capability.value)
            {
                return Err(ControlError::InvalidRequest(
                    "invalid namespace requested in access capability".into(),
                )
                .into());
            }
        }

        let account_id = account.key().map_err(ControlError::from)?;
        self.store
            .upsert_account(account_id, &account.namespace)
            .await
            .map_err(ControlError::from)?;

        let token = self
            .issuer
            .sign(TokenSpec {
                role: TokenRole::Manage,
                account_id: Some(account_id),
                namespace: Some(account.namespace),
                capabilities: req.capabilities,
                valid_duration: (req.valid_duration_secs > 0)
                    .then(|| Duration::seconds(req.valid_duration_secs)),
            })
            .await
            .map_err(ControlError::Upstream)?;

        Ok(Response::new(TokenResponse { token }))
    }

    async fn all_hubs(&self, _request: Request<Noop>) -> Result<Response<ListOfHubs>, Status> {
        let hubs = self.store.all_hubs().await.map_err(ControlError::from)?;

        let mut out = Vec::with_capacity(hubs.len());
        for hub in hubs {
            let locations =
                decode_locations(&hub.connection_info).map_err(ControlError::from)?;
            out.push(HubInfo {
                id: id_bytes(hub.instance_id),
                locations,
            });
        }

        Ok(Response::new(ListOfHubs { hubs: out }))
    }

    async fn request_service_token(
        &self,
        request: Request<ServiceTokenRequest>,
    ) -> Result<Response<ServiceTokenResponse>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let req = request.into_inner();

        let token = self
            .issuer
            .sign(TokenSpec {
                role: TokenRole::Service,
                account_id: Some(Uuid::nil()),
                namespace: Some(req.namespace.clone()),
                capabilities: vec![
                    trellis_proto::TokenCapability {
                        capability: Capability::Access as i32,
                        value: req.namespace,
                    },
                    trellis_proto::TokenCapability {
                        capability: Capability::Connect as i32,
                        value: String::new(),
                    },
                ],
                valid_duration: None,
            })
            .await
            .map_err(ControlError::Upstream)?;

        Ok(Response::new(ServiceTokenResponse { token }))
    }

    type StreamActivityStream = ReceiverStream<Result<CentralActivity, Status>>;

    async fn stream_activity(
        &self,
        request: Request<Streaming<HubFrame>>,
    ) -> Result<Response<Self::StreamActivityStream>, Status> {
        auth::check_hub(request.metadata(), &self.verify_key)?;
        let mut inbound = request.into_inner();

        // The first inbound frame must carry the hub registration;
        // anything else closes the session cleanly with no error.
        let registration = inbound.message().await?.and_then(|frame| frame.hub_reg);
        let Some(registration) = registration else {
            return Ok(Response::new(Self::closed_stream()));
        };
        let Ok(key) = spec_string(&registration.hub) else {
            return Ok(Response::new(Self::closed_stream()));
        };

        // Install the session record before the sender begins.
        let (session, mut xmit_rx) = self.sessions.register(key);
        tracing::info!(hub = %session.key, "hub session opened");

        // Receiver: drain inbound flow batches into telemetry. Any
        // inbound error or end-of-stream cancels the session.
        let telemetry = self.telemetry.clone();
        let receiver_session = session.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = receiver_session.cancel.cancelled() => return,
                    message = inbound.message() => match message {
                        Ok(Some(frame)) => {
                            telemetry.process_flows(&receiver_session, &frame.flow);
                        }
                        Ok(None) => {
                            receiver_session.cancel.cancel();
                            return;
                        }
                        Err(err) => {
                            tracing::debug!(hub = %receiver_session.key, error = %err, "hub stream receive error");
                            receiver_session.cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });

        // Sender: forward the outbound queue into the response stream.
        // Every exit path deregisters the session and then drains the
        // queue so a broadcaster holding a reference from before the
        // removal cannot block on it.
        let (response_tx, response_rx) = mpsc::channel(1);
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    delta = xmit_rx.recv() => match delta {
                        Some(delta) => {
                            if response_tx.send(delta).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            session.cancel.cancel();
            sessions.deregister(&session);
            while xmit_rx.try_recv().is_ok() {}
            tracing::info!(hub = %session.key, "hub session closed");
        });

        Ok(Response::new(ReceiverStream::new(response_rx)))
    }
}
