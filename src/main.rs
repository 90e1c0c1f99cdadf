use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use neigh_watch::config::{self, Backoff, PollerConfig, Privilege};
use neigh_watch::hotspot::{self, AlwaysActive, HotspotController, InterfaceHotspot};
use neigh_watch::parse::{StateFilter, SubnetFilter};
use neigh_watch::server::{self, AppState};
use neigh_watch::source::SystemReader;
use neigh_watch::{DeviceSet, NeighborPoller};

/// neigh-watch — list the devices attached to a local hotspot by polling the neighbor table.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "neigh-watch",
    version,
    about = "List the devices attached to a local hotspot by polling the kernel neighbor table.",
    long_about = None
)]
struct Cli {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Polling period in milliseconds.
    #[arg(long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Accepted subnet, as a prefix (192.168.) or CIDR (172.16.0.0/12). Repeatable.
    #[arg(long = "subnet")]
    subnets: Vec<String>,

    /// Only accept `ip neigh` lines carrying one of these states (e.g. REACHABLE). Repeatable.
    #[arg(long = "state")]
    states: Vec<String>,

    /// Whether to read sources through `su -c`.
    #[arg(long, value_enum)]
    privilege: Option<PrivilegeArg>,

    /// Neighbor cache file.
    #[arg(long = "arp-path")]
    arp_path: Option<PathBuf>,

    /// Bound on each external command or file read, in milliseconds.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Back off exponentially on failed cycles, up to this many milliseconds.
    #[arg(long = "backoff-max-ms")]
    backoff_max_ms: Option<u64>,

    /// Hotspot interface (e.g. wlan0, ap0). Polling only runs while it has an address in an accepted subnet.
    #[arg(long)]
    interface: Option<String>,

    /// Write each snapshot as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the JSON device API on this address (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Run a single cycle, print it and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrivilegeArg {
    Never,
    Auto,
    Always,
}

impl From<PrivilegeArg> for Privilege {
    fn from(p: PrivilegeArg) -> Self {
        match p {
            PrivilegeArg::Never => Privilege::Never,
            PrivilegeArg::Auto => Privilege::Auto,
            PrivilegeArg::Always => Privilege::Always,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let cfg = build_config(&cli)?;
    info!(
        interval_ms = cfg.interval_ms,
        subnets = ?Vec::<String>::from(cfg.subnets.clone()),
        privilege = ?cfg.privilege,
        "configuration loaded"
    );

    match hotspot::hotspot_address(cli.interface.as_deref(), &cfg.subnets) {
        Ok(Some(ip)) => println!("Hotspot address: {ip}"),
        Ok(None) => println!("Hotspot address: <none found>"),
        Err(e) => warn!(error = %e, "failed to list interface addresses"),
    }

    let poller = NeighborPoller::build(cfg, Arc::new(SystemReader)).await;

    if cli.once {
        let set = poller.poll_once().await;
        print_device_table(&set);
        if let Some(kind) = poller.state().last_error {
            eprintln!("Warning: no neighbor source could be read ({kind:?})");
        }
        if let Some(path) = cli.output.as_deref() {
            write_devices_json(path, &set)?;
            println!("Wrote JSON snapshot to {}", path.display());
        }
        return Ok(());
    }

    let output = cli.output.clone();
    poller.subscribe(move |set| {
        print_device_table(&set);
        if let Some(path) = output.as_deref() {
            if let Err(e) = write_devices_json(path, &set) {
                warn!(error = %e, path = %path.display(), "failed to write JSON snapshot");
            }
        }
    });

    if let Some(bind) = cli.serve.clone() {
        let state = AppState::attach(&poller);
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                warn!(error = %e, "HTTP server error");
            }
        });
    }

    let gate: Box<dyn HotspotController> = match cli.interface.clone() {
        Some(iface) => {
            let hotspot = InterfaceHotspot::new(iface, poller.config().subnets.clone());
            info!(interface = hotspot.interface(), "gating device polling on hotspot interface");
            Box::new(hotspot)
        }
        None => Box::new(AlwaysActive),
    };

    println!("Press Ctrl+C to stop...");
    run_gated(&poller, gate.as_ref()).await;
    poller.shutdown().await;
    info!("exiting");
    Ok(())
}

/// Start the poller while the hotspot is active and stop it when it goes away, until Ctrl+C.
async fn run_gated(poller: &NeighborPoller, gate: &dyn HotspotController) {
    let interval = poller.config().interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let active = gate.is_active();
                if active && !poller.is_running() {
                    info!("hotspot active, starting device polling");
                    poller.start(interval);
                } else if !active && poller.is_running() {
                    info!("hotspot inactive, stopping device polling");
                    poller.stop();
                }
            }
        }
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set logger: {e}"))?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<PollerConfig> {
    let mut cfg = match cli.config.as_deref() {
        Some(path) => config::load_config_from_path(path)?,
        None => PollerConfig::default(),
    };
    if let Some(ms) = cli.interval_ms {
        cfg.interval_ms = ms;
    }
    if !cli.subnets.is_empty() {
        cfg.subnets = SubnetFilter::parse(&cli.subnets).context("invalid --subnet")?;
    }
    if !cli.states.is_empty() {
        cfg.state_filter = StateFilter::States(cli.states.clone());
    }
    if let Some(p) = cli.privilege {
        cfg.privilege = p.into();
    }
    if let Some(path) = cli.arp_path.clone() {
        cfg.arp_path = path;
    }
    if let Some(ms) = cli.timeout_ms {
        cfg.source_timeout_ms = ms;
    }
    if let Some(max_ms) = cli.backoff_max_ms {
        cfg.backoff = Backoff::Exponential { max_ms };
    }
    cfg.validate()?;
    Ok(cfg)
}

fn print_device_table(set: &DeviceSet) {
    let mut ip_w = "ip".len();
    for d in set.devices() {
        ip_w = ip_w.max(d.ip().to_string().len());
    }
    let mac_w = 17usize;

    println!(
        "\nDevices: {} (source: {}, at {})",
        set.len(),
        set.source(),
        set.captured_at()
    );
    println!("{:<ip_w$}  {:<mac_w$}", "ip", "mac", ip_w = ip_w, mac_w = mac_w);
    println!("{:-<ip_w$}  {:-<mac_w$}", "", "", ip_w = ip_w, mac_w = mac_w);
    for d in set.devices() {
        println!(
            "{:<ip_w$}  {:<mac_w$}",
            d.ip().to_string(),
            d.mac().unwrap_or("-"),
            ip_w = ip_w,
            mac_w = mac_w
        );
    }
}

fn write_devices_json(path: &Path, set: &DeviceSet) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, set)?;
    Ok(())
}
