//! neo-bacnet
//!
//! Command-line BACnet/IP client: discover devices, read and write
//! properties, and listen for change-of-value notifications.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use neo_bacnet::types::MAX_INSTANCE;
use neo_bacnet::{
    Client, ClientConfig, NotificationFilter, ObjectId, PropertyId, PropertyValue, RemoteDeviceEntry,
};

/// Neo BACnet/IP client
#[derive(Parser, Debug)]
#[command(name = "neo-bacnet")]
#[command(about = "BACnet/IP discovery, read/write and COV client", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local interface to bind (overrides the configuration)
    #[arg(long)]
    interface: Option<String>,

    /// UDP port (overrides the configuration)
    #[arg(long)]
    port: Option<u16>,

    /// Broadcast address (overrides the configuration)
    #[arg(long)]
    broadcast: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast Who-Is and print the devices that answer
    Discover {
        /// Collection window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        /// Lowest device instance to ask for
        #[arg(long, requires = "high")]
        low: Option<u32>,

        /// Highest device instance to ask for
        #[arg(long, requires = "low")]
        high: Option<u32>,
    },

    /// Read one or more properties of an object
    Read {
        #[command(flatten)]
        target: Target,

        /// Properties to read (name or number)
        #[arg(short, long, num_args = 1.., default_value = "present-value")]
        property: Vec<PropertyId>,
    },

    /// Write a property of an object
    Write {
        #[command(flatten)]
        target: Target,

        /// Property to write (name or number)
        #[arg(short, long, default_value = "present-value")]
        property: PropertyId,

        /// Application type of the value
        #[arg(short = 't', long = "type", value_enum, default_value = "real")]
        kind: ValueKind,

        /// Value to write ("null" relinquishes a commanded value)
        value: String,

        /// Command priority (1-16)
        #[arg(long)]
        priority: Option<u8>,
    },

    /// Subscribe to change-of-value notifications and print them until interrupted
    Listen {
        #[command(flatten)]
        target: Target,

        /// Subscriber process identifier
        #[arg(long, default_value = "1")]
        process_id: u32,

        /// Subscription lifetime in seconds (omit for indefinite)
        #[arg(long)]
        lifetime: Option<u32>,
    },
}

#[derive(ClapArgs, Debug)]
struct Target {
    /// Device instance number
    #[arg(short, long)]
    device: u32,

    /// Object identifier, e.g. analog-input:3
    #[arg(short, long)]
    object: ObjectId,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ValueKind {
    Null,
    Boolean,
    Unsigned,
    Signed,
    Real,
    Double,
    Enumerated,
    String,
}

#[derive(Serialize)]
struct Reading {
    property: PropertyId,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<PropertyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("neo_bacnet=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(broadcast) = args.broadcast {
        config.broadcast = Some(broadcast);
    }

    info!("Starting neo-bacnet v{}", env!("CARGO_PKG_VERSION"));
    let client = Client::bootstrap(config).await?;

    let result = run(&client, args.command).await;
    client.shutdown();
    result
}

async fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::Discover { window_ms, low, high } => {
            let window = window_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| client.config().discovery_window());
            let devices = match (low, high) {
                (Some(low), Some(high)) => client.discover_range(window, low, high).await?,
                _ => client.discover(window).await?,
            };
            info!("Discovered {} device(s)", devices.len());
            print_json(&devices)
        }

        Command::Read { target, property } => {
            locate(client, target.device).await?;
            let reads = property
                .iter()
                .map(|p| client.read_property(target.device, target.object, *p).into_future());
            let results = join_all(reads).await;

            let readings: Vec<Reading> = property
                .into_iter()
                .zip(results)
                .map(|(property, result)| match result {
                    Ok(value) => Reading {
                        property,
                        value: Some(value),
                        error: None,
                    },
                    Err(e) => Reading {
                        property,
                        value: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();
            print_json(&readings)
        }

        Command::Write {
            target,
            property,
            kind,
            value,
            priority,
        } => {
            let value = parse_value(kind, &value)?;
            locate(client, target.device).await?;
            client
                .write_property(target.device, target.object, property, value.clone(), priority)
                .await?;
            info!("Wrote {} {} = {}", target.object, property, value);
            Ok(())
        }

        Command::Listen {
            target,
            process_id,
            lifetime,
        } => {
            locate(client, target.device).await?;
            let (_id, mut notifications) =
                client.listen(NotificationFilter::object(target.device, target.object));
            client
                .subscribe_cov(target.device, target.object, process_id, lifetime)
                .await?;
            info!("Subscribed to {} on device {}", target.object, target.device);

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    notification = notifications.recv() => {
                        let Some(notification) = notification else { break };
                        print_json(&notification)?;
                    }
                }
            }

            if let Err(e) = client
                .unsubscribe_cov(target.device, target.object, process_id)
                .await
            {
                warn!("Failed to cancel COV subscription: {}", e);
            }
            Ok(())
        }
    }
}

/// Find `instance` with a directed Who-Is
async fn locate(client: &Client, instance: u32) -> Result<RemoteDeviceEntry> {
    if instance >= MAX_INSTANCE {
        bail!("Device instance {} out of range", instance);
    }
    let window = client.config().discovery_window();
    let found = client.discover_range(window, instance, instance).await?;
    found
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Device {} did not answer Who-Is", instance))
}

fn parse_value(kind: ValueKind, raw: &str) -> Result<PropertyValue> {
    if raw.eq_ignore_ascii_case("null") {
        return Ok(PropertyValue::Null);
    }
    let value = match kind {
        ValueKind::Null => PropertyValue::Null,
        ValueKind::Boolean => PropertyValue::Boolean(match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "on" | "active" => true,
            "false" | "0" | "off" | "inactive" => false,
            other => bail!("Invalid boolean: {}", other),
        }),
        ValueKind::Unsigned => PropertyValue::Unsigned(raw.parse()?),
        ValueKind::Signed => PropertyValue::Signed(raw.parse()?),
        ValueKind::Real => PropertyValue::Real(raw.parse()?),
        ValueKind::Double => PropertyValue::Double(raw.parse()?),
        ValueKind::Enumerated => PropertyValue::Enumerated(raw.parse()?),
        ValueKind::String => PropertyValue::CharacterString(raw.to_string()),
    };
    Ok(value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
