//! # Warden CLI Module
//!
//! This module implements the CLI interface for Warden.
//!
//! ## Available Commands
//!
//! - `init` - Initialize a new register database
//! - `status` - Show register counts
//! - `risk add|list|show|transition|delete` - Manage risks
//! - `finding add|resolve` - Manage findings raised against risks
//! - `category add|list` - Manage risk categories
//!
//! Every command returns a JSON report. `--json-mode` prints it as is;
//! otherwise it is rendered as indented text.

mod commands;

use crate::config::{DEFAULT_CONFIG_FILE, WardenConfig};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use warden_core::WardenError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Warden - audited risk register
///
/// Every write records who made it and when. Concurrent edits of the same
/// record are detected, never silently merged.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Path to the register database (overrides the config file)
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Principal recorded on writes (overrides the config file)
    #[arg(short = 'a', long, global = true)]
    pub actor: Option<String>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty register
    Init {
        /// Replace an existing database
        #[arg(short, long)]
        force: bool,
    },

    /// Show register counts
    Status,

    /// Manage risks
    Risk {
        #[command(subcommand)]
        action: RiskCommand,
    },

    /// Manage findings
    Finding {
        #[command(subcommand)]
        action: FindingCommand,
    },

    /// Manage risk categories
    Category {
        #[command(subcommand)]
        action: CategoryCommand,
    },
}

/// Risk subcommands.
#[derive(Subcommand, Debug)]
pub enum RiskCommand {
    /// Record a new risk
    Add {
        /// Short description
        title: String,

        /// Severity (low, medium, high, critical)
        #[arg(short, long, default_value = "low")]
        severity: String,

        /// Owner (defaults to the acting principal)
        #[arg(short, long)]
        owner: Option<String>,

        /// Category id
        #[arg(long)]
        category: Option<u64>,
    },

    /// List live risks, most severe first
    List {
        /// Only risks in this status
        #[arg(long)]
        status: Option<String>,

        /// Only risks at or above this severity
        #[arg(long)]
        min_severity: Option<String>,

        /// Only risks owned by this principal
        #[arg(long)]
        owner: Option<String>,

        /// Page number (1-based)
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Page size
        #[arg(long, default_value = "25")]
        page_size: usize,
    },

    /// Show one risk with its findings
    Show {
        /// Risk id
        id: u64,
    },

    /// Move a risk along its lifecycle
    Transition {
        /// Risk id
        id: u64,

        /// Target status (identified, assessed, mitigating, accepted, closed)
        status: String,
    },

    /// Delete a risk (tombstone unless --hard)
    Delete {
        /// Risk id
        id: u64,

        /// Remove the row instead of tombstoning it
        #[arg(long)]
        hard: bool,
    },
}

/// Finding subcommands.
#[derive(Subcommand, Debug)]
pub enum FindingCommand {
    /// Raise a finding against a risk
    Add {
        /// Owning risk id
        risk: u64,

        /// Short description
        title: String,

        /// Severity (low, medium, high, critical)
        #[arg(short, long, default_value = "low")]
        severity: String,
    },

    /// Mark a finding resolved
    Resolve {
        /// Finding id
        id: u64,
    },
}

/// Category subcommands.
#[derive(Subcommand, Debug)]
pub enum CategoryCommand {
    /// Create a category
    Add {
        /// Short unique code
        code: String,

        /// Display label
        label: String,
    },

    /// List categories by code
    List,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments and the loaded config file.
pub fn execute(cli: Cli, config: WardenConfig) -> Result<Value, WardenError> {
    let config = config.with_overrides(cli.database, cli.actor);
    config.validate()?;

    let command = match cli.command {
        Some(Commands::Init { force }) => return cmd_init(&config, force),
        Some(command) => command,
        // No subcommand - show status by default
        None => Commands::Status,
    };

    let session = open_session(&config)?;
    let actor = config.actor.as_str();
    match command {
        Commands::Init { .. } | Commands::Status => cmd_status(&session, &config),
        Commands::Risk { action } => match action {
            RiskCommand::Add {
                title,
                severity,
                owner,
                category,
            } => cmd_risk_add(&session, actor, &title, &severity, owner, category),
            RiskCommand::List {
                status,
                min_severity,
                owner,
                page,
                page_size,
            } => cmd_risk_list(&session, status, min_severity, owner, page, page_size),
            RiskCommand::Show { id } => cmd_risk_show(&session, id),
            RiskCommand::Transition { id, status } => {
                cmd_risk_transition(&session, actor, id, &status)
            }
            RiskCommand::Delete { id, hard } => cmd_risk_delete(&session, actor, id, hard),
        },
        Commands::Finding { action } => match action {
            FindingCommand::Add {
                risk,
                title,
                severity,
            } => cmd_finding_add(&session, actor, risk, &title, &severity),
            FindingCommand::Resolve { id } => cmd_finding_resolve(&session, actor, id),
        },
        Commands::Category { action } => match action {
            CategoryCommand::Add { code, label } => cmd_category_add(&session, &code, &label),
            CategoryCommand::List => cmd_category_list(&session),
        },
    }
}

// =============================================================================
// OUTPUT
// =============================================================================

/// Render a report as indented `key: value` text.
#[must_use]
pub fn render_text(report: &Value) -> String {
    let mut out = String::new();
    render_into(&mut out, report, 0);
    out
}

fn render_into(out: &mut String, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                match value {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{}{}:\n", indent, key));
                        render_into(out, value, depth + 1);
                    }
                    scalar => out.push_str(&format!("{}{}: {}\n", indent, key, scalar_text(scalar))),
                }
            }
        }
        Value::Array(items) if items.is_empty() => out.push_str(&format!("{}(none)\n", indent)),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        out.push_str(&format!("{}- [{}]\n", indent, i + 1));
                        render_into(out, item, depth + 1);
                    }
                    scalar => out.push_str(&format!("{}- {}\n", indent, scalar_text(scalar))),
                }
            }
        }
        scalar => out.push_str(&format!("{}{}\n", indent, scalar_text(scalar))),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
