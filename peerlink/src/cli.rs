//! Parses the command line arguments and runs the demo.
//!
//! Basic usage with logging written to `./logs`:
//!
//! ```cargo run -- --log```

use crate::demo::{self, DemoOptions};
use anyhow::Context;
use clap::Parser;
use peerlink_core::{resolver::ResolverConfig, session::SessionConfig, stream::DEFAULT_PROTOCOL};
use std::{
    fs::{create_dir_all, OpenOptions},
    sync::Arc,
    time::Duration,
};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stores the different command line arguments.
#[derive(Debug, Parser)]
#[command(version, about = "Runs two peers and a relay on a simulated overlay")]
pub struct Args {
    /// Logging flag. Writes JSON logs to ./logs instead of stderr.
    #[arg(short, long)]
    pub log: bool,
    /// The application protocol the peers talk over.
    #[arg(short, long, default_value = DEFAULT_PROTOCOL)]
    pub protocol: String,
    /// How many times to look for a dialable address.
    #[arg(long, default_value_t = ResolverConfig::DEFAULT_ATTEMPTS)]
    pub attempts: u32,
    /// Milliseconds between two looks for a dialable address.
    #[arg(long, default_value_t = 10)]
    pub delay_ms: u64,
    /// How many chunks to stream from one peer to the other.
    #[arg(short, long, default_value_t = 5)]
    pub iterations: usize,
    /// Milliseconds between two chunks.
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,
    /// Milliseconds the relay takes to publish a circuit address.
    #[arg(long, default_value_t = 20)]
    pub publish_delay_ms: u64,
}

impl Args {
    /// The demo settings these arguments describe.
    pub fn options(&self) -> DemoOptions {
        DemoOptions {
            session: SessionConfig {
                protocol: self.protocol.clone(),
                resolver: ResolverConfig {
                    max_attempts: self.attempts,
                    attempt_delay: Duration::from_millis(self.delay_ms),
                },
                ..Default::default()
            },
            iterations: self.iterations,
            interval: Duration::from_millis(self.interval_ms),
            publish_delay: Duration::from_millis(self.publish_delay_ms),
        }
    }
}

/// Parses the command line, sets up logging and runs the demo.
pub async fn initialize_from_arguments() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.log {
        initialize_logging()?;
    } else {
        initialize_console_logging()?;
    }
    let report = demo::run(args.options()).await?;
    println!("{report}");
    Ok(())
}

/// Sends every event to a JSON log file in ./logs. Only should be called once.
pub fn initialize_logging() -> anyhow::Result<()> {
    let main_path = "./logs";
    create_dir_all(main_path).context("Failed to create the log directory")?;
    let file_path = format!(
        "{}/debug-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&file_path)
        .with_context(|| format!("Failed to open {file_path}"))?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(tracing::Level::DEBUG)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Prints human readable events to stderr, filtered by `RUST_LOG`.
pub fn initialize_console_logging() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
