//! aegis — self-hardening prompt firewall for LLM backends.
//! membrane → intent → forward, with background red-team hardening.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aegis::config::{self, HardeningConfig, IntentConfig, MembraneConfig, PipelineConfig};
use aegis::hardening::HardeningLoop;
use aegis::membrane::Membrane;
use aegis::pipeline::Pipeline;
use aegis::providers::http::HttpStack;
use aegis::providers::offline;
use aegis::providers::{EmbeddingProvider, Forwarder, JudgeProvider, VariationGenerator};
use aegis::AppState;

#[derive(Parser)]
#[command(name = "aegis", version, about = "Self-hardening prompt firewall for LLM backends")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3941", env = "AEGIS_PORT")]
    port: u16,

    /// Antibody store path
    #[arg(short, long, default_value = "antibodies.json", env = "AEGIS_STORE")]
    store: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let membrane_cfg = MembraneConfig {
        match_threshold: config::env_or("AEGIS_MATCH_THRESHOLD", config::DEFAULT_MATCH_THRESHOLD),
        ..Default::default()
    };
    let intent_cfg = IntentConfig {
        block_threshold: config::env_or("AEGIS_BLOCK_THRESHOLD", config::DEFAULT_BLOCK_THRESHOLD),
        ambiguous_threshold: config::env_or(
            "AEGIS_AMBIGUOUS_THRESHOLD",
            config::DEFAULT_AMBIGUOUS_THRESHOLD,
        ),
    };
    let hardening_cfg = HardeningConfig::default();
    let pipeline_cfg = PipelineConfig {
        skip_threshold: config::env_or("AEGIS_SKIP_THRESHOLD", config::DEFAULT_SKIP_THRESHOLD),
    };

    // Bad thresholds abort here; nothing re-validates mid-request.
    if let Err(e) = config::validate(&membrane_cfg, &intent_cfg, &hardening_cfg, &pipeline_cfg) {
        error!(error = %e, "refusing to start");
        std::process::exit(1);
    }

    // Provider family is chosen exactly once; components never branch on it.
    let (embedder, judge, red_team, forwarder, providers_status): (
        Arc<dyn EmbeddingProvider>,
        Arc<dyn JudgeProvider>,
        Arc<dyn VariationGenerator>,
        Arc<dyn Forwarder>,
        &str,
    ) = match HttpStack::from_env() {
        Some(stack) => (
            Arc::new(stack.embedder),
            Arc::new(stack.judge),
            Arc::new(stack.red_team),
            Arc::new(stack.forwarder),
            "http",
        ),
        None => (
            Arc::new(offline::HashEmbedder::new(membrane_cfg.embed_dim)),
            Arc::new(offline::HeuristicJudge::default()),
            Arc::new(offline::RedTeamVariants),
            Arc::new(offline::CannedForwarder),
            "offline",
        ),
    };

    let membrane = Arc::new(Membrane::open(&args.store, embedder, membrane_cfg).await);
    let hardening = HardeningLoop::spawn(membrane.clone(), red_team, hardening_cfg);
    let pipeline = Arc::new(Pipeline::new(
        membrane.clone(),
        hardening.clone(),
        forwarder,
        pipeline_cfg,
    ));

    let api_key = std::env::var("AEGIS_API_KEY").ok();
    let auth_status = if api_key.is_some() { "enabled" } else { "disabled" };

    let state = AppState {
        pipeline,
        membrane: membrane.clone(),
        hardening,
        judge,
        intent_cfg,
        conversations: Default::default(),
        api_key,
        started_at: Instant::now(),
    };
    let app = aegis::api::router(state);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        store = %args.store,
        antibodies = membrane.antibody_count(),
        providers = providers_status,
        auth = auth_status,
        "aegis starting"
    );

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
}
