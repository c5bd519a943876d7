//! Trellis control-plane binary.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use time::Duration;
use tonic::transport::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_control::flowtop::DEFAULT_FLOW_TOP_SIZE;
use trellis_control::{ControlService, Telemetry};
use trellis_core::config::{ControlConfig, SigningBackend};
use trellis_proto::control_server::ControlServer;
use trellis_registry::lock::LeaseLock;
use trellis_registry::{ActivityReader, PostgresRegistry, RegistryStore};
use trellis_token::{KeySigner, LocalKeySigner, TokenIssuer, VaultTransitSigner};

/// Trellis - control plane for a multi-tenant edge fabric
#[derive(Parser, Debug)]
#[command(name = "trellisd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TRELLIS_CONFIG",
        default_value = "config/control.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Trellis control plane v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide or
    // override everything).
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: ControlConfig = figment
        .merge(Env::prefixed("TRELLIS_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    let config = Arc::new(config);

    trellis_control::metrics::register_metrics();

    // Registry store.
    let registry = PostgresRegistry::connect(
        &config.registry.url,
        config.registry.max_connections,
        config.registry.statement_timeout_ms,
    )
    .await
    .context("failed to connect to registry store")?;
    let pool = registry.pool().clone();
    let store: Arc<dyn RegistryStore> = Arc::new(registry);

    // Serialize schema provisioning across replicas with a leased lock.
    provision_schema(store.as_ref(), &pool, &config).await?;
    tracing::info!("registry store ready");

    // Signing backend; the public half is fetched once and used locally
    // for verification.
    let signer = build_signer(&config).await?;
    let verify_key = signer
        .public_key(&config.signing.key_id)
        .await
        .context("failed to fetch token public key")?;
    tracing::info!(
        pubkey = %STANDARD.encode(verify_key),
        "signing backend configured"
    );
    let issuer = TokenIssuer::new(signer, config.signing.key_id.clone());

    let telemetry = Arc::new(Telemetry::new(DEFAULT_FLOW_TOP_SIZE));
    let mut service = ControlService::new(
        config.clone(),
        store.clone(),
        issuer,
        verify_key,
        telemetry.clone(),
    );

    if let Some(tls) = &config.hub_tls {
        let cert = tokio::fs::read(&tls.cert_file)
            .await
            .with_context(|| format!("failed to read {}", tls.cert_file.display()))?;
        let key = tokio::fs::read(&tls.key_file)
            .await
            .with_context(|| format!("failed to read {}", tls.key_file.display()))?;
        service.set_hub_tls(cert, key);
        tracing::info!(domain = %tls.domain, "hub TLS bundle loaded");
    }

    // Tail the activity feed so mutations on other replicas reach our
    // hubs.
    let reader = ActivityReader::connect(&config.registry.url)
        .await
        .context("failed to start activity reader")?;
    let _pump = service.spawn_activity_pump(reader);
    tracing::info!("activity reader started");

    // Ops HTTP surface.
    let ops_addr: SocketAddr = config
        .server
        .ops_bind
        .parse()
        .context("invalid ops bind address")?;
    let ops = trellis_control::ops::ops_router(
        trellis_control::ops::OpsState {
            store: store.clone(),
            telemetry: telemetry.clone(),
            ops_token: config.auth.ops_token.clone(),
        },
        config.server.metrics_enabled,
    );
    let ops_listener = tokio::net::TcpListener::bind(ops_addr)
        .await
        .with_context(|| format!("failed to bind ops listener on {ops_addr}"))?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(ops_listener, ops).await {
            tracing::error!(error = %err, "ops listener failed");
        }
    });
    tracing::info!(addr = %ops_addr, "ops listener started");

    // gRPC surface.
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!(addr = %addr, "control plane listening");

    Server::builder()
        .add_service(ControlServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("grpc server failed")?;

    Ok(())
}

/// Run schema setup under the provisioning lease so concurrent replicas
/// do not race each other.
async fn provision_schema(
    store: &dyn RegistryStore,
    pool: &sqlx::PgPool,
    config: &ControlConfig,
) -> Result<()> {
    let lock = LeaseLock::new(pool.clone(), config.lock.table.clone());
    lock.create_table().await.context("failed to create lock table")?;

    let ttl = Duration::seconds(config.lock.ttl_secs as i64);
    let handle = loop {
        match lock.acquire("schema-provisioning", ttl).await? {
            Some(handle) => break handle,
            None => {
                tracing::info!("waiting for schema provisioning lease");
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
        }
    };

    let result = store.migrate().await;
    lock.release(handle).await?;
    result.context("schema migration failed")?;
    Ok(())
}

/// Build the signing backend from configuration.
async fn build_signer(config: &ControlConfig) -> Result<Arc<dyn KeySigner>> {
    match &config.signing.backend {
        SigningBackend::Vault {
            addr,
            mount,
            token_env,
        } => {
            let token = std::env::var(token_env)
                .with_context(|| format!("vault token env var not set: {token_env}"))?;
            tracing::info!(addr = %addr, mount = %mount, "using Vault transit signing");
            Ok(Arc::new(VaultTransitSigner::new(
                addr.clone(),
                mount.clone(),
                token,
            )))
        }
        SigningBackend::File { path } => {
            let seed = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read key file: {}", path.display()))?;
            let signer =
                LocalKeySigner::from_seed_base64(&seed).context("failed to parse signing key")?;
            tracing::info!(path = %path.display(), "loaded signing key from file");
            Ok(Arc::new(signer))
        }
        SigningBackend::Ephemeral => {
            tracing::warn!("generating ephemeral signing key (not suitable for production)");
            Ok(Arc::new(LocalKeySigner::generate()))
        }
    }
}
