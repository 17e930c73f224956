use clap::{Parser, Subcommand};
use natbox::config;
use natbox::nat::Nat;
use natbox::telemetry::init_logging;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// How often `run` logs NAT statistics and the table
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "natbox")]
#[command(about = "NAT subsystem of a software router")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the NAT engine until interrupted
    Run {
        /// Path to nat.toml
        #[arg(short, long, default_value = "nat.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate nat.toml
    Validate {
        /// Path to nat.toml
        #[arg(short, long, default_value = "nat.toml")]
        config: PathBuf,
    },
    /// Print nat.toml with every default filled in
    Show {
        /// Path to nat.toml
        #[arg(short, long, default_value = "nat.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config { action } => {
            // Diagnostics go to stdout; RUST_LOG still applies
            init_logging(None);
            match action {
                ConfigAction::Validate { config } => cmd_config_validate(&config),
                ConfigAction::Show { config } => cmd_config_show(&config),
            }
        }
        Commands::Run { config } => cmd_run(&config),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_run(config_path: &PathBuf) -> Result<(), String> {
    use tokio::runtime::Runtime;
    use tracing::{debug, warn};

    let cfg = config::load(config_path).map_err(|e| format!("Failed to load config: {}", e))?;

    // Initialize logging from config (RUST_LOG env var takes priority)
    init_logging(Some(&cfg.logging));
    info!("Loaded {}", config_path.display());

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        validation.print_diagnostics();
        return Err("Validation failed".to_string());
    }

    let nat = Nat::new(&cfg.nat).map_err(|e| format!("Failed to start NAT: {}", e))?;

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async {
        let mut stats_timer = tokio::time::interval(STATS_INTERVAL);

        info!("NAT running on {}, press Ctrl-C to stop", cfg.nat.external_ip);

        loop {
            tokio::select! {
                _ = stats_timer.tick() => {
                    for (name, value) in nat.metrics().export() {
                        debug!("{} {}", name, value);
                    }
                    match nat.drain_expired_syns() {
                        Ok(expired) => {
                            for syn in expired {
                                debug!(
                                    "Port unreachable owed to {} for port {}",
                                    syn.peer, syn.external_port
                                );
                            }
                        }
                        Err(e) => return Err(format!("NAT stopped: {}", e)),
                    }
                    if let Err(e) = nat.log_table() {
                        return Err(format!("NAT stopped: {}", e));
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                    }
                    info!("Shutting down...");
                    return Ok(());
                }
            }
        }
    })?;

    nat.shutdown();
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}

fn cmd_config_show(config_path: &PathBuf) -> Result<(), String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let resolved =
        config::render_resolved(&cfg).map_err(|e| format!("Failed to render config: {}", e))?;

    println!(
        "# Resolved by natbox from {}\n\n{}",
        config_path.display(),
        resolved
    );
    Ok(())
}
