use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use stockfeed::aggregate::{CounterSnapshot, InventoryStats};
use stockfeed::{
    Connection, ConnectionState, CounterAggregator, DeliveryPolicy, FeedConfig,
    InventoryAggregator, InventorySnapshot, MessageBus, QuantityPolicy, ReconnectPolicy,
};

#[derive(Parser)]
#[command(name = "stockfeed", version, about = "Order and inventory stream aggregator")]
struct Cli {
    /// JSON configuration file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Listener failure handling: isolate | fail-fast
    #[arg(long, global = true)]
    delivery: Option<DeliveryPolicy>,

    /// Quantity validation: strict | legacy
    #[arg(long, global = true)]
    quantity: Option<QuantityPolicy>,

    /// Behaviour after a disconnect: never | backoff
    #[arg(long, global = true)]
    reconnect: Option<ReconnectPolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the stream and print aggregates periodically
    Watch {
        /// Overrides TOPICS_WEBSOCKET_ENDPOINT
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long = "interval-ms", default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long)]
        json: bool,
        /// CPU core to pin the process to
        #[arg(long)]
        core_id: Option<usize>,
    },
    /// Feed newline-separated frames from a file and print the result
    Replay {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config =
        FeedConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(delivery) = cli.delivery {
        config.delivery = delivery;
    }
    if let Some(quantity) = cli.quantity {
        config.quantity = quantity;
    }
    if let Some(reconnect) = cli.reconnect {
        config.reconnect = reconnect;
    }

    match cli.command {
        Commands::Watch {
            endpoint,
            interval_ms,
            json,
            core_id,
        } => {
            if let Some(endpoint) = endpoint {
                config.endpoint = endpoint;
            }
            config.validate()?;
            if let Some(core_id) = core_id {
                pin_to_core(core_id)?;
            }
            watch(&config, Duration::from_millis(interval_ms.max(1)), json).await
        }
        Commands::Replay { file, json } => {
            config.validate()?;
            replay(&config, &file, json)
        }
    }
}

fn pin_to_core(core_id: usize) -> Result<()> {
    let core_ids = core_affinity::get_core_ids().context("Failed to get core IDs")?;
    if core_id >= core_ids.len() {
        anyhow::bail!("Core ID {} out of range ({} cores available)", core_id, core_ids.len());
    }
    info!("Pinning process to core {}", core_id);
    core_affinity::set_for_current(core_ids[core_id]);
    Ok(())
}

struct Aggregates {
    counters: CounterAggregator,
    inventory: InventoryAggregator,
}

impl Aggregates {
    fn attach(bus: &MessageBus, config: &FeedConfig) -> Self {
        let mut counters = CounterAggregator::new(bus);
        for prefix in &config.counted_topics {
            counters.register(prefix.as_str());
        }
        let inventory = InventoryAggregator::attach(bus, config.quantity);
        Self {
            counters,
            inventory,
        }
    }
}

async fn watch(config: &FeedConfig, interval: Duration, json: bool) -> Result<()> {
    info!("Starting stockfeed watch");
    info!("Endpoint: {}", config.endpoint);
    info!(
        "Delivery: {}, quantity: {}, reconnect: {:?}",
        config.delivery, config.quantity, config.reconnect
    );

    let bus = MessageBus::new(config.delivery);
    let aggregates = Aggregates::attach(&bus, config);
    let connection = Connection::connect(&bus, config).context("Failed to open connection")?;

    let mut out = io::BufWriter::new(io::stdout());
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                let state = connection.state();
                print_report(&mut out, Some(&state), &aggregates, json)?;
                if connection.is_finished() {
                    break;
                }
            }
        }
    }

    connection.close().await;
    print_report(&mut out, None, &aggregates, json)?;
    Ok(())
}

fn replay(config: &FeedConfig, path: &Path, json: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let bus = MessageBus::new(config.delivery);
    let aggregates = Aggregates::attach(&bus, config);

    let mut frames = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line.context("Failed to read frame")?;
        let frame = line.trim_end_matches('\r');
        if frame.is_empty() {
            continue;
        }
        if let Err(err) = bus.deliver(frame) {
            error!("frame {frame:?}: {err}");
        }
        frames += 1;
    }
    info!("Replayed {} frames from {}", frames, path.display());

    let mut out = io::BufWriter::new(io::stdout());
    print_report(&mut out, None, &aggregates, json)
}

fn print_report<W: Write>(
    out: &mut W,
    state: Option<&ConnectionState>,
    aggregates: &Aggregates,
    json: bool,
) -> Result<()> {
    let counters = aggregates.counters.snapshot();
    let inventory = aggregates.inventory.snapshot();
    let stats = aggregates.inventory.stats();
    if json {
        let report = serde_json::json!({
            "state": state.map(ToString::to_string),
            "counters": counters,
            "inventory": inventory,
            "stats": stats,
        });
        serde_json::to_writer(&mut *out, &report)?;
        writeln!(out)?;
    } else {
        write_text(out, state, &counters, &inventory, stats)?;
    }
    out.flush()?;
    Ok(())
}

fn write_text<W: Write>(
    out: &mut W,
    state: Option<&ConnectionState>,
    counters: &[CounterSnapshot],
    inventory: &InventorySnapshot,
    stats: InventoryStats,
) -> io::Result<()> {
    if let Some(state) = state {
        writeln!(out, "state: {state}")?;
    }
    for counter in counters {
        writeln!(out, "{:<12} {:>8}", counter.prefix, counter.count)?;
    }
    writeln!(
        out,
        "{:<16} {:>10} {:>10} {:>10}",
        "sku", "stock", "reserved", "available"
    )?;
    for entry in &inventory.entries {
        writeln!(
            out,
            "{:<16} {:>10} {:>10} {:>10}",
            entry.sku.to_string(),
            entry.record.stock_level,
            entry.record.reserved_stock,
            entry.record.available_stock
        )?;
    }
    writeln!(
        out,
        "frames applied={} ignored={} rejected={}",
        stats.applied, stats.ignored, stats.rejected
    )?;
    writeln!(out)
}
