//! mqmx - loopback demonstration
//!
//! Usage:
//!   mqmx [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -u, --url <URL>        Connection URL (default: service:mqmx:memory:///local)
//!   --restart-broker       Restart the broker mid-run to show re-subscription
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Starts an in-memory broker, serves a sample registry on it and drives
//! that registry through a client connector.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqmx::config::{Config, ServiceUrl};
use mqmx::registry::sample::{Counter, Emitter};
use mqmx::registry::{Attribute, LocalRegistry, Notification, NotificationListener, ObjectName};
use mqmx::{ConnectorClient, ConnectorServer, MemoryBroker, MemoryProvider, Metrics};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// mqmx - remote resource management over message queues
#[derive(Parser, Debug)]
#[command(name = "mqmx")]
#[command(author = "mqmx Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Loopback demonstration of management over a message queue")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connection URL
    #[arg(short, long)]
    url: Option<String>,

    /// Stop and restart the broker after subscribing
    #[arg(long)]
    restart_broker: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    let url = args.url.unwrap_or(file_config.connector.url.clone());
    let restart_broker = args.restart_broker || file_config.demo.restart_broker;
    let settle = file_config.demo.settle;
    let initial = file_config.connector.initial_environment();

    // The transport URI names the in-memory broker
    let broker_name = ServiceUrl::parse(&url)?.transport_uri().to_string();
    let mut broker = MemoryBroker::new(broker_name.clone());
    if let Some(credentials) = &initial.credentials {
        broker = broker.with_credentials(credentials.username.clone(), credentials.password.clone());
    }
    let provider = Arc::new(MemoryProvider::new().with_broker(broker.clone()));

    // Sample registry
    let registry = LocalRegistry::new("mqmx");
    let counter_name = ObjectName::parse("mqmx:type=Counter,name=requests")?;
    let emitter_name = ObjectName::parse("mqmx:type=Emitter,name=events")?;
    registry.register(counter_name.clone(), Arc::new(Counter::new("requests")))?;
    let emitter = Arc::new(Emitter::new(emitter_name.clone()));
    registry.register(emitter_name.clone(), emitter.clone())?;

    info!("Starting mqmx loopback demo");
    info!("  URL: {}", url);
    info!("  Broker: {}", broker_name);
    info!("  Restart broker: {}", restart_broker);

    let server_metrics = Arc::new(Metrics::new());
    let server = ConnectorServer::new(&url, initial.clone(), provider.clone(), Arc::new(registry))?
        .with_metrics(server_metrics.clone());
    server.start().await?;

    let client_metrics = Arc::new(Metrics::new());
    let client = ConnectorClient::new(&url, initial, provider)?.with_metrics(client_metrics.clone());
    client.connect().await?;
    info!("Connection id: {}", client.connection_id()?);
    let remote = client.resource_server().await?;

    println!("resources: {}", remote.resource_count().await?);
    println!("domains: {:?}", remote.domains().await?);
    println!("names: {:?}", remote.query_names(None).await?);

    remote
        .set_attribute(&counter_name, Attribute::new("Count", 10))
        .await?;
    let total = remote
        .invoke(&counter_name, "add", vec![json!(5)], vec!["long".into()])
        .await?;
    println!("Count after add(5): {}", total);

    let received = Arc::new(AtomicUsize::new(0));
    let seen = received.clone();
    let listener: Arc<dyn NotificationListener> =
        Arc::new(move |n: &Notification, _handback: Option<&Value>| {
            seen.fetch_add(1, Ordering::SeqCst);
            println!("notification #{} {}: {}", n.sequence, n.kind, n.message);
        });
    remote
        .add_notification_listener(&emitter_name, listener.clone(), None, None)
        .await?;

    remote
        .invoke(&emitter_name, "emit", vec![json!("hello")], vec![])
        .await?;
    // Not forwarded: the source cannot be serialized
    remote
        .invoke(&emitter_name, "emitOpaque", vec![json!("hidden")], vec![])
        .await?;

    if restart_broker {
        info!("Restarting broker '{}'", broker_name);
        broker.stop();
        tokio::time::sleep(settle).await;
        broker.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        while emitter.listener_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if emitter.listener_count() == 0 {
            warn!("Listener was not re-subscribed in time");
        }
        remote
            .invoke(&emitter_name, "emit", vec![json!("after restart")], vec![])
            .await?;
    }

    tokio::time::sleep(settle).await;
    println!(
        "notifications received: {}",
        received.load(Ordering::SeqCst)
    );

    remote
        .remove_notification_listener(&emitter_name, &listener)
        .await?;
    client.close().await?;
    server.stop().await?;

    println!("# client metrics");
    print!("{}", client_metrics.encode());
    println!("# server metrics");
    print!("{}", server_metrics.encode());

    Ok(())
}
