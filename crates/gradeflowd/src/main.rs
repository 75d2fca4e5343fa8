//! Gradeflow daemon
//!
//! Subscribes to `grading.submission.started`, grades every request through
//! the configured plugins and serves the sandbox callback webhook.
//!
//! Every flag can also be set through the environment variable named in
//! `--help`. The state store is configured through the `SURREALDB_*`
//! variables.

mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use gradeflow_core::bundler::BundlerConfig;
use gradeflow_core::metrics::METRICS;
use gradeflow_core::telemetry::init_tracing;
use gradeflow_core::{
    AiGrader, AmqpTransport, Bundler, Dispatcher, EventTransport, ExecutionControls,
    GoJudgeClient, GradingService, HttpActionCaller, HttpBlobStore, HttpGradingModel, Plugin,
    PluginKind, PluginRegistry, RemotePlugin, ResultEmitter, RetryPolicy, SandboxMachine,
    SandboxSettings, ServiceBusTransport, ServiceSettings, TestRunnerPlugin, UnknownCallbackPolicy,
};
use gradeflow_state::{KvStore, SurrealKvStore};
use tracing::{info, warn, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    Amqp,
    ServiceBus,
}

#[derive(Parser)]
#[command(name = "gradeflowd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Grading orchestration daemon", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "GRADEFLOW_JSON_LOGS")]
    json: bool,

    /// Message broker binding
    #[arg(long, env = "GRADEFLOW_TRANSPORT", value_enum, default_value = "amqp")]
    transport: TransportKind,

    /// AMQP URI or Service Bus connection string
    #[arg(long, env = "GRADEFLOW_BROKER_URL")]
    broker_url: String,

    /// Subscriber group; instances sharing it share the work
    #[arg(long, env = "GRADEFLOW_SUBSCRIBER_GROUP", default_value = "gradeflow")]
    subscriber_group: String,

    /// Address of the HTTP server
    #[arg(long, env = "GRADEFLOW_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// URL the sandbox service uses to reach this server
    #[arg(long, env = "GRADEFLOW_PUBLIC_URL", default_value = "http://localhost:8080")]
    public_url: String,

    /// Sandbox service URL; the test-runner plugin is unavailable without it
    #[arg(long, env = "GRADEFLOW_GO_JUDGE_URL")]
    go_judge_url: Option<String>,

    /// Directory the sandbox service stores initialized attempts in
    #[arg(long, env = "GRADEFLOW_STORE_DIR", default_value = "/dev/shm/go-judge")]
    store_dir: PathBuf,

    /// Root for temporary download directories (default: system temp dir)
    #[arg(long, env = "GRADEFLOW_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Blob service endpoint, e.g. https://account.blob.core.windows.net
    #[arg(long, env = "GRADEFLOW_BLOB_ENDPOINT")]
    blob_endpoint: String,

    /// Blob container holding submissions
    #[arg(long, env = "GRADEFLOW_BLOB_CONTAINER", default_value = "submissions-store")]
    blob_container: String,

    /// SAS token appended to blob requests
    #[arg(long, env = "GRADEFLOW_BLOB_SAS")]
    blob_sas: Option<String>,

    /// Grading model endpoint; the ai plugin is unavailable without it
    #[arg(long, env = "GRADEFLOW_MODEL_URL")]
    model_url: Option<String>,

    /// Base URL of the remote plugin service (static-analysis, type-coverage)
    #[arg(long, env = "GRADEFLOW_PLUGIN_SERVICE_URL")]
    plugin_service_url: Option<String>,

    /// Comma-separated plugin ids to enable, replacing the defaults
    #[arg(long, env = "GRADEFLOW_ENABLED_PLUGINS", value_delimiter = ',')]
    enabled_plugins: Option<Vec<String>>,

    /// Handling of callbacks for unknown attempts: drop or reject
    #[arg(long, env = "GRADEFLOW_UNKNOWN_CALLBACK", default_value = "drop")]
    unknown_callback: UnknownCallbackPolicy,

    /// Publish a criterion failure event before the aggregate event
    #[arg(long, env = "GRADEFLOW_EARLY_FAILURE_EVENTS", default_value_t = true, action = ArgAction::Set)]
    early_failure_events: bool,

    /// Publish attempts per event, including the first
    #[arg(long, env = "GRADEFLOW_PUBLISH_ATTEMPTS", default_value_t = 3)]
    publish_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let kv: Arc<dyn KvStore> = Arc::new(
        SurrealKvStore::from_env()
            .await
            .context("Failed to connect to the state store")?,
    );
    let transport = connect_transport(&cli).await?;
    let emitter = Arc::new(ResultEmitter::new(
        Arc::clone(&transport),
        RetryPolicy {
            max_attempts: cli.publish_attempts,
            ..RetryPolicy::default()
        },
    ));

    let temp_root = cli.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let store = Arc::new(HttpBlobStore::new(
        &cli.blob_endpoint,
        &cli.blob_container,
        cli.blob_sas.clone(),
    ));

    let machine = cli.go_judge_url.as_deref().map(|judge_url| {
        let client = GoJudgeClient::new(judge_url, &cli.public_url, ExecutionControls::default());
        Arc::new(SandboxMachine::new(
            Arc::clone(&kv),
            Arc::new(client),
            Arc::clone(&emitter),
            SandboxSettings {
                store_dir: cli.store_dir.clone(),
                unknown_callback: cli.unknown_callback,
                ..SandboxSettings::default()
            },
        ))
    });

    let mut registry = PluginRegistry::new();
    if let Some(model_url) = cli.model_url.as_deref() {
        let bundler = Bundler::new(
            Arc::clone(&kv),
            store.clone(),
            BundlerConfig {
                temp_root: temp_root.clone(),
                ..BundlerConfig::default()
            },
        );
        registry = registry.with_plugin(Plugin::Ai(AiGrader::new(
            Arc::new(bundler),
            Arc::new(HttpGradingModel::new(model_url)),
        )));
    }
    if let Some(machine) = &machine {
        registry = registry.with_plugin(Plugin::TestRunner(TestRunnerPlugin::new(
            Arc::clone(machine),
            store.clone(),
            temp_root.clone(),
        )));
    }
    if let Some(base) = cli.plugin_service_url.as_deref() {
        let caller = Arc::new(HttpActionCaller::new(base));
        registry = registry
            .with_plugin(Plugin::StaticAnalysis(RemotePlugin::new(
                PluginKind::StaticAnalysis,
                caller.clone(),
            )))
            .with_plugin(Plugin::TypeCoverage(RemotePlugin::new(
                PluginKind::TypeCoverage,
                caller,
            )));
    }
    if let Some(ids) = &cli.enabled_plugins {
        registry.enable_only(&parse_plugin_ids(ids)?);
    }
    let registry = Arc::new(registry);
    for plugin in registry.list() {
        info!(plugin = plugin.id, enabled = plugin.enabled, "plugin registered");
    }

    let service = Arc::new(GradingService::new(
        Dispatcher::new(Arc::clone(&registry)),
        emitter,
        ServiceSettings {
            early_failure_events: cli.early_failure_events,
        },
    ));
    service
        .subscribe(transport.as_ref())
        .await
        .context("Failed to subscribe to grading requests")?;

    let app = routes::router(routes::AppState { registry, machine });
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!(listen = %cli.listen, group = %cli.subscriber_group, "gradeflowd started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    if let Err(e) = transport.close().await {
        warn!(error = %e, "failed to close transport");
    }
    METRICS.flush();
    info!("gradeflowd stopped");
    Ok(())
}

/// Connect the configured broker binding. Startup aborts when the broker is
/// unreachable.
async fn connect_transport(cli: &Cli) -> Result<Arc<dyn EventTransport>> {
    let transport: Arc<dyn EventTransport> = match cli.transport {
        TransportKind::Amqp => Arc::new(
            AmqpTransport::connect(&cli.broker_url, &cli.subscriber_group)
                .await
                .context("Failed to connect to the AMQP broker")?,
        ),
        TransportKind::ServiceBus => Arc::new(
            ServiceBusTransport::connect(&cli.broker_url, &cli.subscriber_group)
                .await
                .context("Failed to connect to Service Bus")?,
        ),
    };
    Ok(transport)
}

fn parse_plugin_ids(ids: &[String]) -> Result<Vec<PluginKind>> {
    ids.iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(|id| PluginKind::from_id(id).with_context(|| format!("Unknown plugin id: {id}")))
        .collect()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
