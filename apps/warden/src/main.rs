//! # Warden - Audited Risk Register
//!
//! The main binary for Warden.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │          apps/warden (THE BINARY)         │
//! │                                           │
//! │   ┌──────────┐        ┌──────────────┐    │
//! │   │   CLI    │        │ warden.toml  │    │
//! │   │  (clap)  │        │   (toml)     │    │
//! │   └────┬─────┘        └──────┬───────┘    │
//! │        └──────────┬──────────┘            │
//! │                   ▼                       │
//! │           ┌───────────────┐               │
//! │           │  warden-core  │               │
//! │           │  (THE LOGIC)  │               │
//! │           └───────────────┘               │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! warden init
//! warden --actor alice risk add "Vendor breach" --severity high
//! warden risk list --min-severity medium
//! warden --json-mode risk show 1
//! ```

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden::cli::{self, Cli};
use warden::config::{LogFormat, WardenConfig};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = Cli::parse();

    let config = match WardenConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    // WARDEN_LOG_FORMAT wins over the config file.
    let log_format = std::env::var("WARDEN_LOG_FORMAT")
        .map(|v| LogFormat::from_env_value(&v))
        .unwrap_or(config.log_format);
    init_tracing(log_format);

    if !cli.quiet && !cli.json_mode {
        eprintln!("warden v{}", env!("CARGO_PKG_VERSION"));
    }

    let json_mode = cli.json_mode;
    match cli::execute(cli, config) {
        Ok(report) => {
            if json_mode {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).unwrap_or_default()
                );
            } else {
                print!("{}", cli::render_text(&report));
            }
        }
        Err(e) => {
            tracing::error!("Error: {}", e);
            if json_mode {
                let output = serde_json::json!({ "error": e.to_string() });
                println!("{}", output);
            }
            std::process::exit(1);
        }
    }
}

/// Install the global subscriber. `RUST_LOG` filters, default `warden=info`.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warden=info,warden_core=info".into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
