//! Common test utilities: an in-process control server over loopback
//! gRPC, backed by the in-memory registry and an in-process signing key.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::Request;
use tonic::transport::Channel;
use trellis_control::{ControlService, SessionRegistry, Telemetry};
use trellis_core::config::ControlConfig;
use trellis_proto::control_client::ControlClient;
use trellis_proto::control_server::ControlServer;
use trellis_proto::{CentralActivity, HubFrame, HubRegistration, Noop, RegisterRequest, id_bytes};
use trellis_registry::{MemoryRegistry, RegistryStore};
use trellis_token::{KeySigner, LocalKeySigner, TokenIssuer};
use uuid::Uuid;

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: String,
    pub store: Arc<MemoryRegistry>,
    pub sessions: SessionRegistry,
    pub telemetry: Arc<Telemetry>,
    pub public_key: [u8; 32],
    pub register_token: String,
}

#[allow(dead_code)]
impl TestServer {
    /// Spawn a control server on a loopback listener.
    pub async fn spawn() -> Self {
        trellis_control::metrics::register_metrics();

        let config = Arc::new(ControlConfig::for_testing());
        let store = Arc::new(MemoryRegistry::new());
        let signer = Arc::new(LocalKeySigner::generate());
        let public_key = signer.public_key("test").await.unwrap();
        let issuer = TokenIssuer::new(signer, "test");
        let telemetry = Arc::new(Telemetry::new(64));

        let service = ControlService::new(
            config.clone(),
            store.clone() as Arc<dyn RegistryStore>,
            issuer,
            public_key,
            telemetry.clone(),
        );
        let sessions = service.sessions();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(ControlServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        Self {
            addr,
            store,
            sessions,
            telemetry,
            public_key,
            register_token: config.auth.register_token.clone(),
        }
    }

    pub async fn client(&self) -> ControlClient<Channel> {
        ControlClient::connect(self.addr.clone()).await.unwrap()
    }

    /// Mint a HUB token through the RPC surface.
    pub async fn hub_token(&self) -> String {
        let mut client = self.client().await;
        client
            .issue_hub_token(authed(Noop {}, &self.register_token))
            .await
            .unwrap()
            .into_inner()
            .token
    }

    /// Register a management client and return its MANAGE token.
    pub async fn manage_token(&self, namespace: &str) -> String {
        let mut client = self.client().await;
        client
            .register(authed(
                RegisterRequest {
                    namespace: namespace.to_string(),
                },
                &self.register_token,
            ))
            .await
            .unwrap()
            .into_inner()
            .token
    }
}

/// Attach a bearer token to a request.
pub fn authed<T>(message: T, token: &str) -> Request<T> {
    let mut request = Request::new(message);
    request
        .metadata_mut()
        .insert("authorization", token.parse().unwrap());
    request
}

/// A streaming hub session under test.
#[allow(dead_code)]
pub struct StreamingHub {
    pub hub_id: Uuid,
    pub key: String,
    pub frames: mpsc::Sender<HubFrame>,
    pub deltas: tonic::Streaming<CentralActivity>,
}

#[allow(dead_code)]
impl StreamingHub {
    /// Open a session, send the registration frame, and wait until the
    /// server has installed the session record.
    pub async fn open(server: &TestServer, hub_token: &str) -> Self {
        let hub_id = Uuid::new_v4();
        let key = hub_id.hyphenated().to_string();

        let (frames, rx) = mpsc::channel(16);
        frames
            .send(HubFrame {
                hub_reg: Some(HubRegistration {
                    hub: id_bytes(hub_id),
                }),
                flow: Vec::new(),
            })
            .await
            .unwrap();

        let mut client = server.client().await;
        let deltas = client
            .stream_activity(authed(ReceiverStream::new(rx), hub_token))
            .await
            .unwrap()
            .into_inner();

        wait_for(|| server.sessions.counters(&key).is_some()).await;

        Self {
            hub_id,
            key,
            frames,
            deltas,
        }
    }

    /// The next delta pushed to this hub.
    pub async fn next_delta(&mut self) -> CentralActivity {
        tokio::time::timeout(Duration::from_secs(5), self.deltas.message())
            .await
            .expect("timed out waiting for delta")
            .unwrap()
            .expect("stream closed while waiting for delta")
    }
}

/// Poll until a condition holds.
#[allow(dead_code)]
pub async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}
