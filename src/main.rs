use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use takstream_client::{ConnectOptions, Connection, Signal, StreamEvent};
use takstream_core::{LogFormat, ServerEntry, StreamConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// takstream - stream Cursor on Target from TAK servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/takstream.yaml", env = "TAKSTREAM_CONFIG")]
    config: PathBuf,

    /// Only connect to the server with this name
    #[arg(short, long)]
    server: Option<String>,

    /// Log level or filter directive; overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Log one JSON object per line
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = StreamConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;

    init_tracing(&args, &config);

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    config.validate().context("Invalid configuration")?;

    let servers: Vec<&ServerEntry> = match &args.server {
        Some(name) => match config.get_server(name) {
            Some(server) => vec![server],
            None => bail!("No server named '{}' in {:?}", name, args.config),
        },
        None => config.servers.iter().collect(),
    };

    let mut connections = Vec::new();
    for server in servers {
        match open(server).await {
            Ok(connection) => connections.push(connection),
            Err(e) => error!(server = %server.name, error = %format!("{:#}", e), "Failed to connect"),
        }
    }

    if connections.is_empty() {
        bail!("No server could be reached");
    }

    info!(connections = connections.len(), "Streaming, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for connection in &connections {
        let metrics = connection.metrics();
        info!(
            connection_id = %connection.id(),
            messages_received = metrics.messages_received,
            messages_sent = metrics.messages_sent,
            decode_errors = metrics.decode_errors,
            "Closing connection"
        );
        connection.destroy();
    }

    Ok(())
}

fn init_tracing(args: &Args, config: &StreamConfig) {
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.json_logs || config.logging.format == LogFormat::Json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open(server: &ServerEntry) -> Result<Connection> {
    let auth = server
        .load_auth()
        .with_context(|| format!("Failed to load credentials for {}", server.name))?;

    let connection = Connection::new(&server.url, auth, ConnectOptions::from_server_entry(server))?;

    connection.on(Signal::SecureConnect, {
        let id = connection.id().clone();
        move |_| info!(connection_id = %id, "TLS session established")
    });
    connection.on(Signal::Ping, {
        let id = connection.id().clone();
        move |_| info!(connection_id = %id, "Server answered ping")
    });
    connection.on(Signal::Cot, {
        let id = connection.id().clone();
        move |event| {
            if let StreamEvent::Cot(cot) = event {
                info!(
                    connection_id = %id,
                    uid = %cot.uid,
                    cot_type = %cot.event_type,
                    callsign = cot.callsign().unwrap_or("-"),
                    "CoT received"
                );
            }
        }
    });
    connection.on(Signal::Timeout, {
        let id = connection.id().clone();
        move |_| warn!(connection_id = %id, "Connection idle")
    });
    connection.on(Signal::Error, {
        let id = connection.id().clone();
        move |event| {
            if let StreamEvent::Error(e) = event {
                error!(connection_id = %id, error = %e, "Stream error");
            }
        }
    });
    connection.on(Signal::End, {
        let id = connection.id().clone();
        move |_| warn!(connection_id = %id, "Server closed the stream")
    });

    connection
        .start()
        .await
        .with_context(|| format!("Failed to connect to {}", server.url))?;

    Ok(connection)
}
