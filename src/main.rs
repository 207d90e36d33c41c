use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use genguard::app::GenguardApp;
use genguard::config::Settings;
use genguard::error::LifecycleResult;
use genguard::monitor::IntervalTrigger;
use genguard::observability::ObservabilityGuard;

#[derive(Parser, Debug)]
#[command(name = "genguard")]
#[command(about = "Verified, atomically activated, integrity-monitored artifact generations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and print warnings.
    Doctor,
    /// Verify, stage and activate a signed bundle.
    Update {
        bundle: PathBuf,
        #[arg(long)]
        token: Option<String>,
        /// Stage the bundle without activating it.
        #[arg(long, default_value_t = false)]
        stage_only: bool,
    },
    /// Activate an already staged generation.
    Activate {
        version: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Swap the rollback target back in, quarantining the active generation.
    Rollback {
        #[arg(long, default_value = "operator requested rollback")]
        reason: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Promote a retained rollback target or staged generation.
    Recover {
        #[arg(long = "to")]
        to: String,
        #[arg(long)]
        token: Option<String>,
    },
    /// Verify a bundle, or the active generation in place when no bundle is given.
    Verify {
        #[arg(long)]
        bundle: Option<PathBuf>,
    },
    /// Show pointer, generations in service, quarantine, ledger and lock state.
    Status,
    /// List every known generation.
    Generations,
    /// Inspect the event ledger.
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Run the integrity monitor until interrupted.
    Monitor {
        /// Run a single cycle and exit.
        #[arg(long, default_value_t = false)]
        once: bool,
        /// Override the configured cycle interval.
        #[arg(long, value_parser = parse_positive_u64)]
        interval_secs: Option<u64>,
    },
    /// Monitor quarantine state.
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommands,
    },
    /// Activation lock inspection and recovery.
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerCommands {
    /// Print the most recent entries.
    Show {
        #[arg(long, default_value_t = 50, value_parser = parse_positive_usize)]
        limit: usize,
    },
    /// Recompute the hash chain from the first entry.
    Verify,
}

#[derive(Subcommand, Debug)]
enum QuarantineCommands {
    Status,
    /// Acknowledge a detected violation and resume automatic rollback.
    Clear {
        #[arg(long, default_value_t = false)]
        confirm: bool,
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LockCommands {
    Status,
    ForceUnlock {
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!(
            "{{\"event\":\"command_failed\",\"kind\":\"{}\",\"exit_code\":{},\"message\":{}}}",
            err.kind(),
            err.exit_code(),
            serde_json::to_string(&format!("{:#}", err))
                .unwrap_or_else(|_| "\"<encode-error>\"".to_string())
        );
        std::process::exit(err.exit_code());
    }
}

fn run(cli: Cli) -> LifecycleResult<()> {
    let settings = Settings::load()?;
    let _observability = ObservabilityGuard::init(settings.otlp_endpoint.as_deref());
    let command = cli.command.unwrap_or(Commands::Doctor);

    // Doctor must work even when the configured keys are unusable.
    if let Commands::Doctor = command {
        print_doctor(&settings);
        return Ok(());
    }
    let app = GenguardApp::new(settings)?;

    match command {
        Commands::Doctor => print_doctor(app.settings()),
        Commands::Update {
            bundle,
            token,
            stage_only,
        } => {
            println!("{}", app.update_json(&bundle, token.as_deref(), stage_only)?);
        }
        Commands::Activate { version, token } => {
            println!("{}", app.activate_json(&version, token.as_deref())?);
        }
        Commands::Rollback { reason, token } => {
            println!("{}", app.rollback_json(&reason, token.as_deref())?);
        }
        Commands::Recover { to, token } => {
            println!("{}", app.recover_json(&to, token.as_deref())?);
        }
        Commands::Verify { bundle } => match bundle {
            Some(bundle) => println!("{}", app.verify_bundle_json(&bundle)?),
            None => println!("{}", app.verify_active_json()?),
        },
        Commands::Status => println!("{}", app.status_json()?),
        Commands::Generations => println!("{}", app.generations_json()?),
        Commands::Ledger { command } => match command {
            LedgerCommands::Show { limit } => println!("{}", app.ledger_show_json(limit)?),
            LedgerCommands::Verify => println!("{}", app.ledger_verify_json()?),
        },
        Commands::Monitor {
            once,
            interval_secs,
        } => {
            if once {
                println!("{}", app.monitor_once_json()?);
                return Ok(());
            }
            let interval = interval_secs.unwrap_or(app.settings().monitor.interval_secs);
            let shutdown = Arc::new(AtomicBool::new(false));
            let signal_flag = Arc::clone(&shutdown);
            ctrlc::set_handler(move || {
                signal_flag.store(true, Ordering::SeqCst);
                eprintln!(
                    "{{\"event\":\"monitor_signal\",\"signal\":\"interrupt\",\"action\":\"graceful_stop\"}}"
                );
            })
            .context("failed to register Ctrl+C handler for monitor")?;
            let mut trigger = IntervalTrigger::new(Duration::from_secs(interval), shutdown);
            let summary = app.run_monitor(&mut trigger);
            println!(
                "{}",
                serde_json::to_string_pretty(&summary)
                    .context("failed to encode monitor summary")?
            );
        }
        Commands::Quarantine { command } => match command {
            QuarantineCommands::Status => println!("{}", app.quarantine_status_json()?),
            QuarantineCommands::Clear { confirm, token } => {
                println!("{}", app.quarantine_clear_json(confirm, token.as_deref())?)
            }
        },
        Commands::Lock { command } => match command {
            LockCommands::Status => println!("{}", app.lock_status_json()?),
            LockCommands::ForceUnlock { confirm } => {
                println!("{}", app.force_unlock_json(confirm)?)
            }
        },
    }

    Ok(())
}

fn print_doctor(settings: &Settings) {
    let report = settings.doctor_report();
    println!("genguard doctor");
    println!("state_dir: {}", report.state_dir.display());
    println!(
        "trusted_key_ids: {}",
        if report.trusted_key_ids.is_empty() {
            "<none>".to_string()
        } else {
            report.trusted_key_ids.join(",")
        }
    );
    println!("ledger_signing_enabled: {}", report.ledger_signing_enabled);
    println!("monitor_interval_secs: {}", report.monitor_interval_secs);
    println!("rollback_clean_cycles: {}", report.rollback_clean_cycles);
    println!("retention_mode: {}", report.retention_mode.as_str());
    println!(
        "reload_command_configured: {}",
        report.reload_command_configured
    );
    if report.warnings.is_empty() {
        println!("status: ok");
    } else {
        println!("status: warning");
        for warning in report.warnings {
            println!("- {}", warning);
        }
    }
}

fn parse_positive_usize(value: &str) -> std::result::Result<usize, String> {
    let parsed = value
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("invalid positive integer: {value}"))?;
    if parsed == 0 {
        return Err("value must be >= 1".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> std::result::Result<u64, String> {
    let parsed = value
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid positive integer: {value}"))?;
    if parsed == 0 {
        return Err("value must be >= 1".to_string());
    }
    Ok(parsed)
}
