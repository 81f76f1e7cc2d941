mod config;
mod elapsed;
mod error;
mod grpc;
mod http_rpc;
mod output;
mod precheck;
mod probe;
mod probe_engine;
mod probe_result;
mod reporter;
mod websocket;

use anyhow::Result;
use clap::Parser;
use clap::builder::BoolishValueParser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use config::{Commitment, Config, ConfigLayer, EndpointLayer, ProbeLayer, TestLayer};
use output::{ConsoleReporter, JsonReporter};
use precheck::HttpPrecheck;
use probe_engine::{LiveTransports, ProbeEngine};

#[derive(Parser, Debug)]
#[command(name = "rpcprobe", version)]
#[command(about = "Measures how long Solana gRPC, WebSocket and HTTP RPC endpoints keep delivering data")]
struct Args {
    /// Optional TOML config file; environment and flags override it
    #[arg(short, long, env = "RPCPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Yellowstone gRPC endpoint
    #[arg(long, env = "GRPC_URL")]
    grpc_url: Option<String>,

    /// x-token sent with gRPC requests
    #[arg(long, env = "GRPC_API_KEY", hide_env_values = true)]
    grpc_token: Option<String>,

    /// WebSocket JSON-RPC endpoint
    #[arg(long, env = "WS_URL")]
    ws_url: Option<String>,

    /// HTTP JSON-RPC endpoint
    #[arg(long, env = "HTTP_URL")]
    http_url: Option<String>,

    /// Duration of each probe in seconds
    #[arg(long, env = "TEST_DURATION")]
    duration: Option<u64>,

    /// Countdown between probes in seconds
    #[arg(long, env = "TEST_INTERVAL")]
    interval: Option<u64>,

    /// Comma separated accounts to watch
    #[arg(long, env = "TEST_ACCOUNTS", value_delimiter = ',')]
    accounts: Option<Vec<String>>,

    #[arg(long, env = "COMMITMENT", value_enum)]
    commitment: Option<Commitment>,

    /// Per-request timeout of polling probes in seconds
    #[arg(long, env = "REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Check endpoints for maintenance before probing
    #[arg(long, env = "PRECHECK", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    precheck: Option<bool>,

    /// Body marker identifying a maintenance page
    #[arg(long, env = "MAINTENANCE_MARKER")]
    maintenance_marker: Option<String>,

    /// Run all probes at once instead of one after another
    #[arg(long, env = "PARALLEL", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    parallel: Option<bool>,

    /// Log full error chains instead of one-line messages
    #[arg(long, env = "VERBOSE_ERRORS", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    verbose_errors: Option<bool>,

    #[arg(long, env = "TEST_GRPC_STREAM", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    grpc_stream: Option<bool>,

    #[arg(long, env = "TEST_GRPC_CALLS", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    grpc_calls: Option<bool>,

    #[arg(long, env = "TEST_WEBSOCKET_STREAM", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    websocket_stream: Option<bool>,

    #[arg(long, env = "TEST_HTTP_CALLS", value_parser = BoolishValueParser::new(), num_args = 0..=1, default_missing_value = "true")]
    http_calls: Option<bool>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Also print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Print an example config file and exit
    #[arg(long)]
    print_default_config: bool,
}

impl Args {
    fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            endpoints: EndpointLayer {
                grpc_url: self.grpc_url.clone(),
                grpc_token: self.grpc_token.clone(),
                ws_url: self.ws_url.clone(),
                http_url: self.http_url.clone(),
            },
            test: TestLayer {
                duration: self.duration,
                interval: self.interval,
                accounts: self.accounts.clone(),
                commitment: self.commitment,
                request_timeout: self.request_timeout,
                precheck: self.precheck,
                maintenance_marker: self.maintenance_marker.clone(),
                parallel: self.parallel,
                verbose_errors: self.verbose_errors,
            },
            probes: ProbeLayer {
                enabled: None,
                grpc_stream: self.grpc_stream,
                grpc_calls: self.grpc_calls,
                websocket_stream: self.websocket_stream,
                http_calls: self.http_calls,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", ConfigLayer::generate_default_toml()?);
        return Ok(());
    }

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    if args.no_color {
        colored::control::set_override(false);
    }

    let config = match Config::load(args.config.as_deref(), args.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", format!("{:#}", e).red());
            std::process::exit(1);
        }
    };

    info!("rpcprobe starting...");
    info!(
        "Probing {} for {} account(s)",
        config
            .probes
            .kinds()
            .iter()
            .map(|kind| kind.label())
            .collect::<Vec<_>>()
            .join(", "),
        config.accounts.len()
    );

    let health = Arc::new(HttpPrecheck::new(config.maintenance_marker.clone())?);
    let mut engine = ProbeEngine::new(config, Arc::new(LiveTransports), health);
    engine.register_reporter(Box::new(ConsoleReporter::new(!args.no_color)));
    if args.json {
        engine.register_reporter(Box::new(JsonReporter));
    }

    engine.run().await?;
    Ok(())
}
