use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peerlink::client::SignalingClient;
use peerlink::config::{AppConfig, ConfigStore};
use peerlink::events::{EventBus, StatusLog};
use peerlink::webrtc::{NativeEngineFactory, Topology};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// peerlink command line arguments
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(version, about = "WebRTC data channel over a WebSocket signaling server", long_about = None)]
struct CliArgs {
    /// Signaling server URL (overrides config file)
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Path to TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Negotiation topology (loopback, relay)
    #[arg(short = 't', long, value_name = "TOPOLOGY")]
    topology: Option<Topology>,

    /// Wait for the remote peer's offer instead of negotiating on connect
    #[arg(long)]
    passive: bool,

    /// Connect to the signaling server at startup
    #[arg(long)]
    connect: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// One line typed on stdin
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Connect,
    Disconnect,
    Ping,
    Negotiate,
    Send(String),
    SendBinary(String),
    Status,
    Log,
    Url(String),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "connect" => Command::Connect,
            "disconnect" => Command::Disconnect,
            "ping" => Command::Ping,
            "negotiate" => Command::Negotiate,
            "send" => Command::Send(rest.to_string()),
            "sendbin" => Command::SendBinary(rest.to_string()),
            "status" => Command::Status,
            "log" => Command::Log,
            "url" if rest.is_empty() => return Err("usage: url <ws://host:port>".to_string()),
            "url" => Command::Url(rest.to_string()),
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => return Err(format!("unknown command '{}', try 'help'", other)),
        };
        Ok(Some(command))
    }
}

const HELP: &str = "\
commands:
  connect            connect to the signaling server
  disconnect         close the signaling connection
  ping               send the liveness probe
  negotiate          start a negotiation now
  send <text>        send text on the data channel
  sendbin <text>     send the UTF-8 bytes of <text> as a binary message
  status             print connection and session state
  log                print the status log
  url <ws://...>     change the signaling server URL (next connect)
  quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting peerlink v{}", env!("CARGO_PKG_VERSION"));

    let store = match &args.config {
        Some(path) => ConfigStore::open(path).await?,
        None => ConfigStore::new(AppConfig::default()),
    };
    store.override_with(|config| {
        if let Some(url) = &args.url {
            config.signaling.url = url.clone();
        }
        if let Some(topology) = args.topology {
            config.webrtc.topology = topology;
        }
        if args.passive {
            config.signaling.negotiate_on_open = false;
        }
    });

    let config = store.get();
    tracing::info!(
        "Signaling server {}, topology {}",
        config.signaling.url,
        config.webrtc.topology
    );

    let bus = Arc::new(EventBus::new());
    let status_log = Arc::new(StatusLog::new());
    let log_task = {
        let mut events = bus.subscribe();
        let status_log = status_log.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => status_log.apply(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Status log lagged, {} events missed", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let factory = Arc::new(NativeEngineFactory::new(config.webrtc.clone()));
    let (client, client_task) = SignalingClient::start(store.clone(), factory, bus.clone());

    if args.connect {
        // Failure is already reported on the status log
        let _ = client.connect().await;
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = command_loop(&client, &store, &status_log) => {
            if let Err(e) = result {
                tracing::error!("Command input failed: {}", e);
            }
        }
    }

    client.shutdown().await;
    let _ = client_task.await;
    log_task.abort();

    tracing::info!("peerlink stopped");
    Ok(())
}

async fn command_loop(
    client: &Arc<SignalingClient>,
    store: &ConfigStore,
    status_log: &StatusLog,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        // Outcomes of client operations are reported on the status log
        match command {
            Command::Connect => {
                let _ = client.connect().await;
            }
            Command::Disconnect => {
                let _ = client.disconnect().await;
            }
            Command::Ping => {
                let _ = client.ping();
            }
            Command::Negotiate => client.negotiate().await,
            Command::Send(text) => {
                let _ = client.send_text(&text).await;
            }
            Command::SendBinary(text) => {
                let _ = client.send_binary(&text).await;
            }
            Command::Status => {
                println!("{}", status_log.signal());
                println!("{}", serde_json::to_string_pretty(&client.status().await)?);
            }
            Command::Log => print!("{}", status_log.text()),
            Command::Url(url) => {
                let new_url = url.clone();
                // The client reports the change on the status log
                if let Err(e) = store
                    .update("signaling.url", move |c| c.signaling.url = new_url)
                    .await
                {
                    println!("Failed to set signaling URL to {}: {}", url, e);
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => break,
        }
    }
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "peerlink=error,webrtc=error",
        LogLevel::Warn => "peerlink=warn,webrtc=warn",
        LogLevel::Info => "peerlink=info,webrtc=warn",
        LogLevel::Verbose => "peerlink=debug,webrtc=warn",
        LogLevel::Debug => "peerlink=debug,webrtc=info",
        LogLevel::Trace => "peerlink=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // stdout belongs to the command prompt
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
