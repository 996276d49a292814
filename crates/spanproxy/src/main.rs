mod telemetry;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use spanproxy_core::config::Config;
use spanproxy_ingest::http::{HttpOptions, router};
use spanproxy_ingest::mirror::{Mirror, MirrorConfig};
use spanproxy_ingest::server::run_ingest_server;
use spanproxy_ingest::sink::{CompositeSink, HoneycombConfig, HoneycombSink, Sink, StdoutSink};
use spanproxy_ingest::zipkin::{DecodeFn, decode_json_v1, decode_json_v2, decode_thrift};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::telemetry::{LogFormat, init_cli_tracing, init_run_tracing, shutdown_tracing};

/// Upper bound on waiting for background senders after the server stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "spanproxy")]
#[command(about = "Zipkin span ingestion proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Accept Zipkin spans over HTTP and forward them to the configured sinks")]
    Run(RunArgs),
    #[command(about = "Decode a captured span payload and print normalized spans")]
    Decode {
        #[arg(long, value_enum)]
        format: DecodeFormat,
        file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(long)]
    listen_addr: Option<String>,
    #[arg(short = 'k', long)]
    write_key: Option<String>,
    #[arg(short = 'd', long)]
    dataset: Option<String>,
    #[arg(long)]
    api_host: Option<String>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long = "drop-field")]
    drop_fields: Vec<String>,
    #[arg(long, help = "Print every decoded span to stdout as a JSON line")]
    debug: bool,
    #[arg(long, help = "Copy every accepted payload to this Zipkin-compatible URL")]
    downstream: Option<String>,
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,
}

impl RunArgs {
    /// Flags win over the file and environment layers.
    fn apply(self, cfg: &mut Config) {
        if let Some(v) = self.listen_addr {
            cfg.listen_addr = v;
        }
        if let Some(v) = self.write_key {
            cfg.write_key = Some(v);
        }
        if let Some(v) = self.dataset {
            cfg.dataset = v;
        }
        if let Some(v) = self.api_host {
            cfg.api_host = v;
        }
        if let Some(v) = self.sample_rate {
            cfg.sample_rate = v;
        }
        if !self.drop_fields.is_empty() {
            cfg.drop_fields = self.drop_fields;
        }
        if self.debug {
            cfg.debug = true;
        }
        if let Some(v) = self.downstream.filter(|d| !d.is_empty()) {
            cfg.downstream = Some(v);
        }
        if !self.allowed_origins.is_empty() {
            cfg.allowed_origins = self.allowed_origins;
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DecodeFormat {
    Thrift,
    JsonV1,
    JsonV2,
}

impl DecodeFormat {
    fn decoder(self) -> DecodeFn {
        match self {
            Self::Thrift => decode_thrift,
            Self::JsonV1 => decode_json_v1,
            Self::JsonV2 => decode_json_v2,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_run_tracing(LogFormat::from_env());
            let result = run_server(args).await;
            shutdown_tracing();
            result
        }
        Commands::Decode { format, file } => {
            init_cli_tracing();
            decode_file(format, &file)
        }
    }
}

async fn run_server(args: RunArgs) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    args.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.listen_addr))?;

    let mut background: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    let mut sinks = CompositeSink::new();
    if cfg.honeycomb_enabled() {
        let (sink, handle) =
            HoneycombSink::start(honeycomb_config(&cfg)).context("start honeycomb sink")?;
        sinks.add(sink);
        background.push(("honeycomb", handle));
    }
    if cfg.debug {
        sinks.add(StdoutSink::new());
    }

    let mirror = match cfg.downstream.as_deref() {
        Some(url) => {
            let (mirror, handle) = Mirror::start(MirrorConfig {
                downstream_url: url.to_string(),
                buffer_size: cfg.mirror_buffer_size,
                max_concurrency: cfg.mirror_concurrency,
                timeout: cfg.mirror_timeout,
            })
            .context("start downstream mirror")?;
            background.push(("mirror", handle));
            Some(mirror)
        }
        None => None,
    };

    eprintln!("spanproxy run");
    eprintln!("  listen: {addr}");
    eprintln!(
        "  honeycomb: {}",
        if cfg.honeycomb_enabled() {
            format!("{} (dataset {})", cfg.api_host, cfg.dataset)
        } else {
            "off".to_string()
        }
    );
    eprintln!("  debug output: {}", if cfg.debug { "on" } else { "off" });
    eprintln!(
        "  downstream: {}",
        cfg.downstream.as_deref().unwrap_or("off")
    );

    let app = router(
        Arc::new(sinks) as Arc<dyn Sink>,
        mirror,
        HttpOptions::from(&cfg),
    );
    run_ingest_server(addr, app, shutdown_signal()).await?;

    drain(background).await;
    Ok(())
}

fn honeycomb_config(cfg: &Config) -> HoneycombConfig {
    HoneycombConfig {
        api_host: cfg.api_host.clone(),
        write_key: cfg.write_key.clone().unwrap_or_default(),
        dataset: cfg.dataset.clone(),
        sample_rate: cfg.sample_rate,
        drop_fields: cfg.drop_fields.clone(),
        batch_size: cfg.batch_size,
        flush_interval: Duration::from_millis(cfg.batch_flush_ms),
        timeout: cfg.send_timeout,
        ..HoneycombConfig::default()
    }
}

/// Waits for background senders to flush. They stop on their own once the
/// router, and with it every sink and mirror handle, has been dropped.
async fn drain(background: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, handle) in background {
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(task = name, error = %err, "background task failed"),
            Err(_) => warn!(task = name, "background task did not drain in time"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c, shutting down");
}

fn decode_file(format: DecodeFormat, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let spans = (format.decoder())(&raw)
        .with_context(|| format!("decode {} as {format:?}", file.display()))?;
    StdoutSink::new().send(&spans)?;
    Ok(())
}
