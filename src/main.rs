use atrouter::config;
use atrouter::dataplane::Router;
use atrouter::port::{EtherTalkPort, EtherTalkSeed, LocalTalkSeed, LtoudpPort, Port, TashTalkPort};
use atrouter::protocol::{NetworkRange, ZoneName};
use atrouter::telemetry::{init_logging, LogConfig, MetricsRegistry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "atrouter")]
#[command(about = "A userspace AppleTalk internet router")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Validate config.toml without starting
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Some(Commands::Validate { config }) => cmd_validate(&config),
        Some(Commands::Run { config }) => load_and_run(&config),
        None => load_and_run(&PathBuf::from("config.toml")),
    };
    if let Err(e) = outcome {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_and_run(path: &PathBuf) -> Result<(), String> {
    let cfg =
        config::load(path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("configuration is invalid".to_string());
    }
    cmd_run(cfg)
}

fn cmd_validate(path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", path.display());
    let cfg = config::load(path).map_err(|e| format!("failed to parse config: {}", e))?;
    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        Err("validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_run(cfg: config::Config) -> Result<(), String> {
    init_logging(Some(&LogConfig {
        level: cfg.logging.level.clone(),
        format: cfg.logging.format.clone(),
    }));

    let ports = build_ports(&cfg)?;
    let metrics = Arc::new(MetricsRegistry::new());
    let router = Router::new(cfg.router.name.clone(), ports, metrics);

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("failed to create runtime: {}", e))?;
    rt.block_on(async move {
        router.start().map_err(|e| format!("failed to start: {}", e))?;
        info!("{} running, Ctrl-C stops", router.short_str());
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("failed to wait for Ctrl-C: {}", e))?;
        info!("{} stopping...", router.short_str());
        router.stop().await;
        Ok(())
    })
}

fn localtalk_seed(
    label: &str,
    seed_network: Option<u16>,
    seed_zone: &Option<String>,
) -> Result<Option<LocalTalkSeed>, String> {
    match (seed_network, seed_zone) {
        (Some(network), Some(zone)) => {
            let zone_name = ZoneName::new(zone.as_bytes())
                .map_err(|e| format!("{}: {}", label, e))?;
            Ok(Some(LocalTalkSeed { network, zone_name }))
        }
        _ => Ok(None),
    }
}

fn build_ports(cfg: &config::Config) -> Result<Vec<Arc<dyn Port>>, String> {
    let mut ports: Vec<Arc<dyn Port>> = Vec::new();

    for port_cfg in &cfg.ports.ltoudp {
        let address = port_cfg
            .interface
            .parse()
            .map_err(|_| format!("invalid interface address {}", port_cfg.interface))?;
        let seed = localtalk_seed("ltoudp", port_cfg.seed_network, &port_cfg.seed_zone)?;
        ports.push(LtoudpPort::new(address, seed));
    }

    for port_cfg in &cfg.ports.tashtalk {
        let seed = localtalk_seed(&port_cfg.device, port_cfg.seed_network, &port_cfg.seed_zone)?;
        ports.push(TashTalkPort::new(port_cfg.device.clone(), seed));
    }

    for port_cfg in &cfg.ports.ethertalk {
        let seed = match (port_cfg.seed_network_min, port_cfg.seed_network_max) {
            (Some(first), Some(last)) => {
                let mut zone_names = Vec::with_capacity(port_cfg.seed_zones.len());
                for zone in &port_cfg.seed_zones {
                    zone_names.push(
                        ZoneName::new(zone.as_bytes())
                            .map_err(|e| format!("{}: {}", port_cfg.interface, e))?,
                    );
                }
                Some(EtherTalkSeed {
                    range: NetworkRange::new(first, last),
                    zone_names,
                })
            }
            _ => None,
        };
        ports.push(EtherTalkPort::with_checksum_options(
            port_cfg.interface.clone(),
            seed,
            port_cfg.verify_checksums,
            port_cfg.calculate_checksums,
        ));
    }

    Ok(ports)
}
