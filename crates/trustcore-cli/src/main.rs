//! Trust core command line tool.
//!
//! # Usage
//!
//! ```bash
//! # New random backup recovery key
//! trustcore recovery-key generate
//!
//! # Check a key someone wrote down
//! trustcore recovery-key check "EsTc LW2K PGiF wKEA ..."
//!
//! # Key for an existing passphrase backup
//! trustcore passphrase "correct horse" --salt 3f1c... --iterations 1048576
//!
//! # Two simulated devices: verify, share a room key, back up, restore
//! trustcore simulate --seed 7
//! ```

mod error;
mod simulate;

use std::io::{self, Write};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use trustcore_core::{
    Environment, RecoveryKey, RustCryptoPrimitives, SystemEnv,
    backup::{PassphraseInfo, derive_key_from_passphrase, derive_key_with_info},
    config::DEFAULT_PASSPHRASE_ITERATIONS,
};

use crate::error::CliError;

/// Trust core tools
#[derive(Parser, Debug)]
#[command(name = "trustcore")]
#[command(about = "Recovery keys and an end-to-end walkthrough of the trust core")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or validate backup recovery keys
    RecoveryKey {
        #[command(subcommand)]
        action: RecoveryKeyAction,
    },

    /// Derive a backup recovery key from a passphrase
    Passphrase {
        /// Passphrase to derive from
        passphrase: String,

        /// Salt of an existing backup; a fresh one is generated if omitted
        #[arg(long)]
        salt: Option<String>,

        /// PBKDF2 iterations; raised to the minimum for a fresh salt
        #[arg(long, default_value_t = DEFAULT_PASSPHRASE_ITERATIONS)]
        iterations: u32,
    },

    /// Run simulated devices through verification, key sharing, backup and
    /// restore
    Simulate {
        /// Seed for keys and network behavior
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

#[derive(Subcommand, Debug)]
enum RecoveryKeyAction {
    /// Print a new random recovery key
    Generate,

    /// Check that a recovery key is well formed
    Check {
        /// Key as written down; spaces are ignored
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let mut out = io::stdout();
    run(args.command, &mut out).await?;
    Ok(())
}

async fn run(command: Command, out: &mut impl Write) -> Result<(), CliError> {
    match command {
        Command::RecoveryKey { action: RecoveryKeyAction::Generate } => {
            let key = RecoveryKey::from_bytes(SystemEnv::new().random_key());
            writeln!(out, "{}", key.encode())?;
        },
        Command::RecoveryKey { action: RecoveryKeyAction::Check { key } } => {
            RecoveryKey::decode(&key).ok_or(CliError::InvalidRecoveryKey)?;
            writeln!(out, "valid")?;
        },
        Command::Passphrase { passphrase, salt, iterations } => {
            let crypto = RustCryptoPrimitives::new();
            let (key, info) = match salt {
                Some(salt) => {
                    let info = PassphraseInfo { salt, iterations };
                    (derive_key_with_info(&crypto, &passphrase, &info)?, info)
                },
                None => {
                    let material = derive_key_from_passphrase(&SystemEnv::new(), &crypto, &passphrase, iterations)?;
                    (material.key, material.info)
                },
            };
            writeln!(out, "recovery key: {}", key.encode())?;
            writeln!(out, "salt: {}", info.salt)?;
            writeln!(out, "iterations: {}", info.iterations)?;
        },
        Command::Simulate { seed } => simulate::run(seed, out).await?,
    }
    Ok(())
}
