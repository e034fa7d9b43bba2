//! AMT Receiver - multicast over an AMT tunnel
//!
//! Joins one channel through an AMT relay and writes the received UDP
//! payloads to stdout, a file, or a UDP destination.

use amt::{Gateway, SinkId};
use amt_cli::{
    display_compact_stats, display_interface_stats, CliConfig, OutputTarget, StreamSink,
};
use anyhow::Context;
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "amt-receive")]
#[command(about = "Receive multicast through an AMT relay", long_about = None)]
struct Args {
    /// Relay discovery address
    #[arg(short, long)]
    relay: Option<IpAddr>,

    /// Multicast group
    #[arg(short, long)]
    group: Option<IpAddr>,

    /// Source address (source-specific multicast)
    #[arg(short, long)]
    source: Option<IpAddr>,

    /// Destination UDP port of the stream
    #[arg(short, long)]
    port: Option<u16>,

    /// Output ('-' for stdout, a file path, or 'udp://host:port')
    #[arg(short, long)]
    output: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Statistics interval in seconds (0 disables)
    #[arg(long)]
    stats_interval: Option<u64>,

    /// Print a statistics table instead of a progress line
    #[arg(long)]
    table: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Channel to join after merging the file and the flags
struct Plan {
    group: IpAddr,
    source: Option<IpAddr>,
    port: u16,
    config: CliConfig,
}

impl Args {
    /// File values overridden by command-line flags
    fn merge(&self, mut config: CliConfig) -> anyhow::Result<(IpAddr, Plan)> {
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(interval) = self.stats_interval {
            config.stats_interval_secs = interval;
        }

        let relay = self
            .relay
            .or(config.relay.as_ref().map(|r| r.address))
            .context("no relay given (use --relay or [relay] in the config file)")?;
        let file_channel = config.channel.clone();
        let group = self
            .group
            .or(file_channel.as_ref().map(|c| c.group))
            .context("no group given (use --group or [channel] in the config file)")?;
        let source = self
            .source
            .or(file_channel.as_ref().and_then(|c| c.source));
        let port = self
            .port
            .or(file_channel.as_ref().map(|c| c.port))
            .context("no port given (use --port or [channel] in the config file)")?;

        Ok((
            relay,
            Plan {
                group,
                source,
                port,
                config,
            },
        ))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; payloads may go to stdout
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let file_config = match &args.config {
        Some(path) => CliConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => CliConfig::default(),
    };
    let (relay, channel) = args.merge(file_config)?;
    let config = channel.config;

    let target: OutputTarget = config.output.parse().map_err(anyhow::Error::msg)?;
    let writer = target
        .open()
        .with_context(|| format!("failed to open output {}", target))?;
    let sink = Arc::new(StreamSink::new(writer));

    tracing::info!("AMT receiver starting...");
    tracing::info!("Relay: {}", relay);
    tracing::info!("Output target: {}", target);

    let gateway = Gateway::new(config.gateway_config())?;
    let subscription = gateway.subscribe(
        relay,
        sink.clone(),
        channel.group,
        channel.source,
        channel.port,
    )?;
    tracing::info!(
        "Joined {}{}:{}",
        channel
            .source
            .map(|s| format!("{} -> ", s))
            .unwrap_or_default(),
        channel.group,
        channel.port
    );

    run(&subscription, &sink, &config, args.table);

    subscription
        .unsubscribe()
        .context("failed to leave channel")?;
    if let Err(e) = sink.flush() {
        tracing::debug!("Final flush failed: {}", e);
    }
    tracing::info!("Output closed, exiting");
    Ok(())
}

/// Report statistics until the output goes away
fn run(subscription: &amt::Subscription, sink: &StreamSink, config: &CliConfig, table: bool) {
    let start = Instant::now();
    let interval = config.stats_interval();
    let tick = Duration::from_millis(200);
    let mut next_report = start + interval;
    let name = subscription.interface().key().to_string();
    let sink_id: SinkId = subscription.sink();

    while !sink.is_closed() {
        thread::sleep(tick);
        if let Err(e) = sink.flush() {
            tracing::warn!("Flushing {} failed: {}", sink_id, e);
        }

        if interval.is_zero() || Instant::now() < next_report {
            continue;
        }
        next_report += interval;

        let stats = subscription.interface().stats();
        if table {
            display_interface_stats(&name, &stats);
        } else {
            display_compact_stats(&stats, sink.stats(), start.elapsed());
        }
    }
}
