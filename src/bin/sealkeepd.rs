use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use sealkeep::adapters::ProcessExit;
use sealkeep::model::{FactorSet, LogLevel};
use sealkeep::{HardwareMode, VaultConfig, VaultCoordinator};

#[derive(Parser, Debug)]
#[command(name = "sealkeepd")]
#[command(about = "Hardware-rooted signing vault with audit log and failsafe", version)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,

    /// TOML config file; built-in defaults are used when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use the software hardware root (development only)
    #[arg(long, global = true)]
    pub emulated_hardware: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the vault and read control commands from stdin
    ///
    /// One command per line: heartbeat, arm <factors>, disarm <factors>,
    /// trigger <factors>, rotate, verify-log, status, shutdown.
    /// Factors are comma separated, e.g. `arm pin,hardware-token`.
    Run,

    /// Sign data provided via stdin, print the bound signature as hex
    Sign,

    /// Verify the audit log on disk without starting the vault
    VerifyLog,

    /// Print the active public key as hex
    PublicKey,
}

/// A line read from stdin while running
#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Heartbeat,
    Arm(FactorSet),
    Disarm(FactorSet),
    Trigger(FactorSet),
    Rotate,
    VerifyLog,
    Status,
    Shutdown,
}

impl ControlCommand {
    fn parse(line: &str) -> anyhow::Result<Self> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or_default();
        let factors = || -> anyhow::Result<FactorSet> {
            let list = line.trim_start().strip_prefix(verb).unwrap_or_default();
            let factors = FactorSet::parse_list(list)?;
            if factors.is_empty() {
                anyhow::bail!("'{verb}' needs a comma-separated factor list");
            }
            Ok(factors)
        };

        Ok(match verb {
            "heartbeat" => ControlCommand::Heartbeat,
            "arm" => ControlCommand::Arm(factors()?),
            "disarm" => ControlCommand::Disarm(factors()?),
            "trigger" => ControlCommand::Trigger(factors()?),
            "rotate" => ControlCommand::Rotate,
            "verify-log" => ControlCommand::VerifyLog,
            "status" => ControlCommand::Status,
            "shutdown" => ControlCommand::Shutdown,
            other => anyhow::bail!("unknown command '{other}'"),
        })
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<VaultConfig> {
    match path {
        Some(path) => VaultConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(VaultConfig::default()),
    }
}

fn start(config: VaultConfig, emulated_hardware: bool) -> anyhow::Result<VaultCoordinator> {
    let mode = if emulated_hardware {
        HardwareMode::Emulated
    } else {
        HardwareMode::Absent
    };
    sealkeep::open_vault(config, mode, Arc::new(ProcessExit)).context("failed to start vault")
}

fn execute(vault: &VaultCoordinator, command: ControlCommand) -> anyhow::Result<String> {
    Ok(match command {
        ControlCommand::Heartbeat => {
            vault.heartbeat()?;
            "ok".to_string()
        }
        ControlCommand::Arm(factors) => format!("ok {}", vault.arm(&factors)?),
        ControlCommand::Disarm(factors) => format!("ok {}", vault.disarm(&factors)?),
        ControlCommand::Trigger(factors) => {
            vault.trigger_explicit(&factors)?;
            "ok triggered".to_string()
        }
        ControlCommand::Rotate => {
            let key = vault.rotate_keys()?;
            format!("ok {}", key.public_key.to_hex())
        }
        ControlCommand::VerifyLog => {
            if vault.verify_log()? {
                "ok intact".to_string()
            } else {
                "failed: audit log integrity check failed".to_string()
            }
        }
        ControlCommand::Status => {
            let status = vault.status();
            let key = status
                .active_key
                .map_or_else(|| "none".to_string(), |k| k.public_key.to_hex());
            format!(
                "ok failsafe={} key={} hardware={} log_entries={}",
                status.failsafe.state, key, status.hardware, status.log_head.next_sequence_no
            )
        }
        ControlCommand::Shutdown => {
            vault.shutdown("shutdown requested on control channel");
            "ok".to_string()
        }
    })
}

fn run(vault: VaultCoordinator) -> anyhow::Result<()> {
    let vault = Arc::new(vault);
    let _background = vault
        .spawn_background()
        .context("failed to start background tasks")?;
    if let Some(key) = vault.active_key() {
        info!("Vault running with key {}", key.public_key.to_hex());
    }

    let mut stdout = io::stdout();
    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read control channel")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match ControlCommand::parse(&line).and_then(|c| execute(&vault, c)) {
            Ok(reply) => reply,
            Err(e) => {
                error!("{:#}", e);
                format!("error: {e:#}")
            }
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }

    close_channel(&vault);
    Ok(())
}

/// Record the closed control channel, then shut down regardless
fn close_channel(vault: &VaultCoordinator) {
    if let Err(e) = vault.append(LogLevel::Warning, "control channel closed") {
        error!("Could not record closed control channel: {}", e);
    }
    vault.shutdown("control channel closed");
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .with_writer(io::stderr)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run => {
            let vault = start(config, cli.emulated_hardware)?;
            run(vault)?;
        }
        Commands::Sign => {
            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data)?;

            let vault = start(config, cli.emulated_hardware)?;
            let signature = vault.sign(&data).context("failed to sign")?;
            let mut stdout = io::stdout();
            writeln!(stdout, "{}", hex::encode(signature))?;
            stdout.flush()?;
            vault.shutdown("sign command complete");
        }
        Commands::VerifyLog => {
            let report = sealkeep::verify_log_files(&config).context("failed to read audit log")?;
            println!(
                "{} entries ({} signed): {}",
                report.entries,
                report.signed,
                if report.intact { "intact" } else { "TAMPERED" }
            );
            if !report.intact {
                std::process::exit(1);
            }
        }
        Commands::PublicKey => match sealkeep::read_public_key(&config)? {
            Some(key) => println!("{}", key.to_hex()),
            None => {
                error!("No signing key has been generated yet");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use sealkeep::adapters::{
        EntropyPool, KeyStoreShredder, MemoryKeyStore, MemoryLogStore, SystemClock,
    };
    use sealkeep::error::{KeyError, StorageError};
    use sealkeep::model::{AuthFactor, LogEntry};
    use sealkeep::ports::{LogStore, Terminator};
    use sealkeep::{Collaborators, VaultError, VaultResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_cli_version_parameter() {
        let mut cmd = Command::cargo_bin("sealkeepd").unwrap();
        let assert = cmd.arg("--version").assert();
        assert.success();
    }

    #[test]
    fn test_parse_control_commands() {
        assert_eq!(
            ControlCommand::parse("heartbeat").unwrap(),
            ControlCommand::Heartbeat
        );
        assert_eq!(
            ControlCommand::parse("  arm pin, hardware-token ").unwrap(),
            ControlCommand::Arm(FactorSet::from([AuthFactor::Pin, AuthFactor::HardwareToken]))
        );
        assert_eq!(
            ControlCommand::parse("trigger pin,hardware-token,remote-operator").unwrap(),
            ControlCommand::Trigger(FactorSet::from([
                AuthFactor::Pin,
                AuthFactor::HardwareToken,
                AuthFactor::RemoteOperator,
            ]))
        );
        assert_eq!(
            ControlCommand::parse("shutdown").unwrap(),
            ControlCommand::Shutdown
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ControlCommand::parse("arm").is_err());
        assert!(ControlCommand::parse("arm retina").is_err());
        assert!(ControlCommand::parse("reboot").is_err());
    }

    #[derive(Clone, Default)]
    struct RefusingLog {
        inner: MemoryLogStore,
        refusing: Arc<AtomicBool>,
    }

    impl LogStore for RefusingLog {
        fn append(&self, entry: &LogEntry) -> VaultResult<()> {
            if self.refusing.load(Ordering::SeqCst) {
                return Err(VaultError::Storage(StorageError::Io {
                    path: PathBuf::from("audit.jsonl"),
                    source: io::Error::other("disk full"),
                }));
            }
            self.inner.append(entry)
        }

        fn load_all(&self) -> VaultResult<Vec<LogEntry>> {
            self.inner.load_all()
        }
    }

    #[derive(Default)]
    struct ExitCodes(Mutex<Vec<i32>>);

    impl Terminator for ExitCodes {
        fn terminate(&self, code: i32) {
            self.0.lock().unwrap().push(code);
        }
    }

    #[test]
    fn test_closed_channel_shuts_down_when_log_refuses() {
        let log = RefusingLog::default();
        let exits = Arc::new(ExitCodes::default());
        let key_store = Arc::new(MemoryKeyStore::new());
        let mut config = VaultConfig::default();
        config.keys.metadata_kdf_iterations = 1_000;

        let vault = VaultCoordinator::start(
            config,
            Collaborators {
                key_store: key_store.clone(),
                log_store: Arc::new(log.clone()),
                entropy: EntropyPool::system_default(),
                hardware_root: None,
                destructive: Arc::new(KeyStoreShredder::new(key_store)),
                terminator: exits.clone(),
                clock: Arc::new(SystemClock),
            },
        )
        .unwrap();

        log.refusing.store(true, Ordering::SeqCst);
        close_channel(&vault);

        assert!(vault.status().shut_down);
        assert_eq!(*exits.0.lock().unwrap(), vec![0]);
        assert!(matches!(
            vault.sign(b"after"),
            Err(VaultError::Key(KeyError::Wiped))
        ));
    }

    #[test]
    fn test_cli_public_key_before_first_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("sealkeep.toml");
        std::fs::write(
            &config,
            format!(
                "[storage]\nkey_dir = {:?}\nlog_path = {:?}\n",
                dir.path().join("keys"),
                dir.path().join("audit.jsonl")
            ),
        )
        .unwrap();

        let mut cmd = Command::cargo_bin("sealkeepd").unwrap();
        cmd.arg("--config").arg(&config).arg("public-key").assert().failure();
    }
}
