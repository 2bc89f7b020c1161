//! Example MCP server: in-memory broker, in-memory session store, the
//! protocol engine and the Streamable HTTP transport wired together.

mod features;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meshmcp_broker::MemoryBroker;
use meshmcp_server::{EngineConfig, MemorySessionStore, ProtocolEngine, ServerTransport};
use meshmcp_transport_streamable::{HttpServerConfig, StreamableConfig, StreamableHttpTransport};

use features::{EchoToolFeature, InitializeFeature};

#[derive(Debug, Parser)]
#[command(name = "mcp-example-server", about = "Broker-routed MCP example server")]
struct Args {
    /// Listen port
    #[arg(long, default_value_t = 8080, env = "MCP_PORT")]
    port: u16,

    /// Listen host
    #[arg(long, default_value = "0.0.0.0", env = "MCP_HOST")]
    host: String,

    /// MCP endpoint path
    #[arg(long, default_value = "/mcp")]
    endpoint: String,

    /// JSON-mode response wait ceiling in milliseconds
    #[arg(long, default_value_t = 30_000)]
    response_timeout_ms: u64,

    /// Seconds of inactivity before a session expires
    #[arg(long, default_value_t = 1800)]
    session_idle_secs: u64,

    /// Log filter (tracing EnvFilter syntax)
    #[arg(long, default_value = "info", env = "MCP_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .init();

    let broker = Arc::new(MemoryBroker::default());
    let store = Arc::new(MemorySessionStore::new(Some(Duration::from_secs(
        args.session_idle_secs,
    ))));

    let transport = StreamableHttpTransport::with_session_store(
        broker,
        StreamableConfig::new()
            .with_response_timeout(Duration::from_millis(args.response_timeout_ms)),
        HttpServerConfig::new(args.port)
            .with_host(args.host.clone())
            .with_endpoint(args.endpoint.clone()),
        store.clone(),
    );

    let engine = ProtocolEngine::new(EngineConfig::default());
    engine
        .connect(Arc::new(transport.clone()) as Arc<dyn ServerTransport>)
        .await?;

    engine.add_feature(
        &InitializeFeature::new("mcp-example-server", env!("CARGO_PKG_VERSION")).with_on_ready(
            Arc::new(|session_id| {
                info!(session = session_id, "client completed initialization");
            }),
        ),
    )?;
    engine.add_feature(&EchoToolFeature)?;

    // Sweep idle sessions in the background
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let expired = sweep_store.cleanup_expired();
            if expired > 0 {
                info!(expired, "expired idle sessions");
            }
        }
    });

    // Ctrl-C drains the engine, which disconnects the transport and stops
    // the HTTP server
    let shutdown_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("ctrl-c handler unavailable");
            return;
        }
        info!("shutting down");
        shutdown_engine.close().await;
    });

    transport.serve().await?;
    Ok(())
}
