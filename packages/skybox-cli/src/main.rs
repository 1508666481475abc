//! Skybox CLI - LAN discovery and provisioning of adb-enabled set-top boxes
//!
//! This binary provides a thin front-end over `skybox-core` that can:
//! - Sweep the local /24 for boxes with the adb port open
//! - Validate IP, MAC, serial and PPPoE account input
//! - Write MAC/serial/PPPoE settings to a box and reboot or reset it

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use skybox_core::config::{self, AgentConfig};
use skybox_core::device::{
    DeviceController, ProvisionMode, ProvisionRequest, ProvisionStep, Provisioner, StepCallback,
};
use skybox_core::persistence;
use skybox_core::scanner::arp::SystemArp;
use skybox_core::scanner::{self, EventCallback, NetworkScanner, ScanEvent, ScanOutcome, ScanReport};
use skybox_core::validate::{self, MacAddress};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "skybox")]
#[command(author = "Skybox Maintainers")]
#[command(version)]
#[command(about = "Find set-top boxes with adb enabled on the LAN and provision them")]
#[command(long_about = "
Skybox finds set-top boxes that expose adb over TCP on the local network
and writes their MAC, serial number and PPPoE account through the adb tool.

Quick start:
  1. Find boxes:        skybox scan
  2. Provision one:     skybox provision --ip 192.168.1.50 --mac A0B1C2D3E4F5 --account 07551234567
  3. Check settings:    skybox config
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sweep the local /24 for hosts with the adb port open
    Scan {
        /// First host octet to probe
        #[arg(long)]
        start: Option<u8>,

        /// Last host octet to probe
        #[arg(long)]
        end: Option<u8>,

        /// Per-host timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Sweep the /24 of this address instead of auto-detecting it
        #[arg(long)]
        local_ip: Option<Ipv4Addr>,
    },

    /// Check whether a single host accepts connections on the adb port
    Probe {
        ip: String,

        #[arg(long)]
        port: Option<u16>,

        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Check operator input without touching any device
    Validate {
        #[command(subcommand)]
        what: ValidateCommand,
    },

    /// Write MAC, serial and PPPoE account to a box
    Provision {
        #[arg(long)]
        ip: String,

        #[arg(long)]
        mac: String,

        /// 11 digit PPPoE account
        #[arg(long)]
        account: String,

        /// Factory-reset a box that already has an account, then dial it in again
        #[arg(long)]
        factory_reset: bool,
    },

    /// Reboot a box
    Reboot { ip: String },

    /// Factory-reset a box
    Reset { ip: String },

    /// Stop the local adb server
    KillServer,

    /// Show the devices found by the last scan
    Devices {
        /// Forget the saved scan instead of showing it
        #[arg(long)]
        clear: bool,
    },

    /// Show configuration paths and settings
    Config,
}

#[derive(Subcommand)]
pub enum ValidateCommand {
    /// Dotted-quad IPv4 address
    Ip { value: String },
    /// MAC address (AABBCCDDEEFF, AA:BB:CC:DD:EE:FF or AA-BB-CC-DD-EE-FF)
    Mac { value: String },
    /// PPPoE account
    Account { value: String },
    /// Serial number built from a serial head and a MAC
    Serial {
        mac: String,

        /// Serial head (defaults to the configured one)
        #[arg(long)]
        head: Option<String>,
    },
}

#[derive(Serialize)]
struct Validation {
    kind: &'static str,
    value: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("skybox={},skybox_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .init();

    let config = config::load_config();

    match &cli.command {
        Commands::Scan {
            start,
            end,
            timeout_ms,
            local_ip,
        } => cmd_scan(&cli, &config, *start, *end, *timeout_ms, *local_ip).await,
        Commands::Probe {
            ip,
            port,
            timeout_ms,
        } => cmd_probe(&cli, &config, ip, *port, *timeout_ms).await,
        Commands::Validate { what } => cmd_validate(&cli, &config, what),
        Commands::Provision {
            ip,
            mac,
            account,
            factory_reset,
        } => {
            let mode = if *factory_reset {
                ProvisionMode::FactoryReset
            } else {
                ProvisionMode::Standard
            };
            let request = ProvisionRequest {
                ip: ip.trim().to_string(),
                mac: mac.trim().to_string(),
                account: account.trim().to_string(),
                mode,
            };
            cmd_provision(&cli, &config, request).await
        }
        Commands::Reboot { ip } => cmd_reboot(&cli, &config, ip).await,
        Commands::Reset { ip } => cmd_reset(&cli, &config, ip).await,
        Commands::KillServer => cmd_kill_server(&cli, &config).await,
        Commands::Devices { clear } => cmd_devices(&cli, *clear),
        Commands::Config => cmd_config(&cli, &config),
    }
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr> {
    let ip = ip.trim();
    if !validate::is_valid_ipv4(ip) {
        bail!("Invalid IP address: {:?}", ip);
    }
    ip.parse().with_context(|| format!("Invalid IP address: {:?}", ip))
}

async fn cmd_scan(
    cli: &Cli,
    config: &AgentConfig,
    start: Option<u8>,
    end: Option<u8>,
    timeout_ms: Option<u64>,
    local_ip: Option<Ipv4Addr>,
) -> Result<()> {
    let mut options = config.scan_options();
    if let Some(ms) = timeout_ms {
        options.probe_timeout = Duration::from_millis(ms);
    }
    if local_ip.is_some() {
        options.local_ip = local_ip;
    }
    let start = start.unwrap_or(config.scan.start_octet);
    let end = end.unwrap_or(config.scan.end_octet);

    // Found devices are printed as they arrive in text mode
    let format = cli.format;
    let on_event: EventCallback = Arc::new(move |event| match (format, event) {
        (OutputFormat::Text, ScanEvent::Started { subnet, candidates }) => {
            println!("Scanning {} ({} addresses)... Press Ctrl+C to stop.", subnet, candidates);
        }
        (OutputFormat::Text, ScanEvent::DeviceFound(device)) => {
            println!(
                "  {:21} {:>8}",
                device.address().to_string(),
                format!("{:.1}ms", device.latency_ms())
            );
        }
        (_, ScanEvent::Warning(warning)) => eprintln!("Warning: {}", warning),
        _ => {}
    });

    let scanner = NetworkScanner::new(options);
    let Some(handle) = scanner.start_scan(start, end, Some(on_event)) else {
        bail!("A scan is already running");
    };

    let cancel = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping scan");
            cancel.cancel();
        }
    });

    let report = handle.wait().await?;
    interrupt.abort();

    if report.outcome != ScanOutcome::SubnetUnresolvable {
        if let Err(e) = persistence::save_last_scan(&report) {
            tracing::warn!("Failed to save scan result: {:#}", e);
        }
    }

    match cli.format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

fn print_report(report: &ScanReport) {
    println!();
    match report.outcome {
        ScanOutcome::SubnetUnresolvable => {
            println!("Could not determine the local subnet.");
            println!("Connect to the LAN, or pass --local-ip / set scan.local_ip in the config file.");
            return;
        }
        ScanOutcome::Cancelled => println!(
            "Scan cancelled: {} of {} addresses probed.",
            report.probed, report.candidates
        ),
        ScanOutcome::DeadlineExceeded => println!(
            "Scan deadline reached: {} of {} addresses probed.",
            report.probed, report.candidates
        ),
        ScanOutcome::Completed => {}
    }

    let subnet = report.subnet.as_deref().unwrap_or("-");
    if report.devices.is_empty() {
        println!("No devices with adb open found in {}.", subnet);
        println!("Check that the boxes are powered on and have network debugging enabled.");
        return;
    }

    println!(
        "Found {} device(s) in {} ({:.1}s):",
        report.devices.len(),
        subnet,
        report.elapsed_secs
    );
    for device in &report.devices {
        println!("  {}", device.address());
    }
}

async fn cmd_probe(
    cli: &Cli,
    config: &AgentConfig,
    ip: &str,
    port: Option<u16>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let ip = parse_ip(ip)?;
    let port = port.unwrap_or(config.adb.port);
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.adb.connect_timeout);

    let result = scanner::probe(ip, port, timeout).await;

    match cli.format {
        OutputFormat::Text => {
            if result.reachable() {
                println!("{} is reachable ({:.1}ms)", result.address(), result.latency_ms());
            } else {
                let reason = result
                    .error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("{} is not reachable: {}", result.address(), reason);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
    }

    Ok(())
}

fn cmd_validate(cli: &Cli, config: &AgentConfig, what: &ValidateCommand) -> Result<()> {
    let check = match what {
        ValidateCommand::Ip { value } => {
            let value = value.trim();
            Validation {
                kind: "ip",
                value: value.to_string(),
                valid: validate::is_valid_ipv4(value),
                normalized: None,
            }
        }
        ValidateCommand::Mac { value } => {
            let value = value.trim();
            let mac = value.parse::<MacAddress>().ok();
            Validation {
                kind: "mac",
                value: value.to_string(),
                valid: mac.is_some(),
                normalized: mac.map(|m| m.colon()),
            }
        }
        ValidateCommand::Account { value } => {
            let value = value.trim();
            Validation {
                kind: "account",
                value: value.to_string(),
                valid: validate::is_valid_account(value),
                normalized: None,
            }
        }
        ValidateCommand::Serial { mac, head } => {
            let mac = mac.trim();
            let head = head
                .as_deref()
                .map(str::trim)
                .unwrap_or(&config.provision.sn_head);
            let valid = validate::is_valid_serial(head, mac);
            let normalized = valid
                .then(|| mac.parse::<MacAddress>().ok())
                .flatten()
                .map(|m| format!("{}{}", head, m.plain()));
            Validation {
                kind: "serial",
                value: mac.to_string(),
                valid,
                normalized,
            }
        }
    };

    match cli.format {
        OutputFormat::Text => {
            let verdict = if check.valid { "valid" } else { "invalid" };
            match &check.normalized {
                Some(normalized) => println!("{} {:?} is {} ({})", check.kind, check.value, verdict, normalized),
                None => println!("{} {:?} is {}", check.kind, check.value, verdict),
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&check)?),
    }

    if !check.valid {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_provision(cli: &Cli, config: &AgentConfig, request: ProvisionRequest) -> Result<()> {
    let controller = Arc::new(DeviceController::from_config(config));
    let provisioner = Provisioner::new(controller, Arc::new(SystemArp), config.adb.port);

    let on_step: Option<StepCallback> = match cli.format {
        OutputFormat::Text => Some(Box::new(|step: &ProvisionStep| println!("  - {}", step))),
        OutputFormat::Json => None,
    };

    if let OutputFormat::Text = cli.format {
        println!("Provisioning {}...", request.ip);
    }

    let report = provisioner.provision(&request, on_step.as_ref()).await?;

    match cli.format {
        OutputFormat::Text => println!("Done. Box is at {}.", report.target),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

async fn cmd_reboot(cli: &Cli, config: &AgentConfig, ip: &str) -> Result<()> {
    let target = SocketAddrV4::new(parse_ip(ip)?, config.adb.port);
    let controller = DeviceController::from_config(config);
    let session = controller.session(target).await;

    if !session.is_online().await? {
        bail!("Cannot reach adb on {}", target);
    }
    let ok = session.reboot().await?;
    print_action(cli, "reboot", target, ok);
    if !ok {
        bail!("{} rejected the reboot", target);
    }
    Ok(())
}

async fn cmd_reset(cli: &Cli, config: &AgentConfig, ip: &str) -> Result<()> {
    let target = SocketAddrV4::new(parse_ip(ip)?, config.adb.port);
    let controller = DeviceController::from_config(config);
    let session = controller.session(target).await;

    if !session.is_online().await? {
        bail!("Cannot reach adb on {}", target);
    }
    let ok = session.factory_reset().await?;
    print_action(cli, "factory_reset", target, ok);
    if !ok {
        bail!("{} rejected the factory reset", target);
    }
    Ok(())
}

fn print_action(cli: &Cli, action: &str, target: SocketAddrV4, ok: bool) {
    match cli.format {
        OutputFormat::Text => {
            if ok {
                println!("{}: {} issued", target, action.replace('_', " "));
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "target": target.to_string(),
                    "action": action,
                    "ok": ok,
                })
            );
        }
    }
}

async fn cmd_kill_server(cli: &Cli, config: &AgentConfig) -> Result<()> {
    let controller = DeviceController::from_config(config);
    let stopped = controller.kill_server().await?;

    match cli.format {
        OutputFormat::Text => {
            if stopped {
                println!("adb server stopped");
            } else {
                println!("adb kill-server reported failure (server may not be running)");
            }
        }
        OutputFormat::Json => println!("{}", serde_json::json!({ "stopped": stopped })),
    }

    Ok(())
}

fn cmd_devices(cli: &Cli, clear: bool) -> Result<()> {
    if clear {
        persistence::clear_last_scan()?;
        match cli.format {
            OutputFormat::Text => println!("Saved scan cleared."),
            OutputFormat::Json => println!("{}", serde_json::json!({ "cleared": true })),
        }
        return Ok(());
    }

    let Some(last) = persistence::load_last_scan()? else {
        match cli.format {
            OutputFormat::Text => println!("No scan recorded yet. Run 'skybox scan' first."),
            OutputFormat::Json => println!("{}", serde_json::json!({ "last_scan": null })),
        }
        return Ok(());
    };

    match cli.format {
        OutputFormat::Text => {
            let when = last.finished_at.with_timezone(&chrono::Local);
            println!(
                "Last scan: {} ({})",
                when.format("%Y-%m-%d %H:%M:%S"),
                last.report.subnet.as_deref().unwrap_or("-")
            );
            if last.report.devices.is_empty() {
                println!("No devices were found.");
            }
            for device in &last.report.devices {
                println!("  {}", device.address());
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&last)?),
    }

    Ok(())
}

fn cmd_config(cli: &Cli, config: &AgentConfig) -> Result<()> {
    let config_path = config::get_config_file_path_string();
    let state_path = persistence::get_state_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "-".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("Loaded from:      {}", config.source);
            println!("Last scan file:   {}", state_path);
            println!("adb binary:       {}", config.adb.binary);
            println!("adb port:         {}", config.adb.port);
            println!(
                "Probe timeout:    {}ms (bulk), {}ms (single)",
                config.scan.probe_timeout.as_millis(),
                config.adb.connect_timeout.as_millis()
            );
            println!(
                "Scan range:       .{} - .{}",
                config.scan.start_octet, config.scan.end_octet
            );
            println!("Serial head:      {}", config.provision.sn_head);
            println!();
            println!("Environment variables:");
            println!("  SKYBOX_ADB    - Override the adb binary");
            println!("  SKYBOX_CONFIG - Override the config file location");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "state_file": state_path,
                    "source": format!("{}", config.source),
                    "effective": config,
                })
            );
        }
    }

    Ok(())
}
