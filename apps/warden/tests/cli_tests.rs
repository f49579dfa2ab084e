//! Integration tests for the Warden CLI commands.
//!
//! Drives `cli::execute` with parsed arguments against a redb register in
//! a temporary directory and inspects the JSON reports.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use warden::cli::{Cli, execute};
use warden::config::WardenConfig;
use warden_core::WardenError;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

struct Register {
    _dir: TempDir,
    database: PathBuf,
}

impl Register {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("register.redb");
        let register = Self {
            _dir: dir,
            database,
        };
        register.run(&["init"]).unwrap();
        register
    }

    fn path(&self) -> &Path {
        &self.database
    }

    fn run(&self, args: &[&str]) -> Result<Value, WardenError> {
        self.run_as("tester", args)
    }

    fn run_as(&self, actor: &str, args: &[&str]) -> Result<Value, WardenError> {
        let database = self.database.to_string_lossy().to_string();
        let mut argv = vec!["warden", "--quiet", "--database", database.as_str(), "--actor", actor];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        execute(cli, WardenConfig::default())
    }
}

// =============================================================================
// INIT / STATUS
// =============================================================================

#[test]
fn init_refuses_to_overwrite_without_force() {
    let register = Register::new();
    assert!(register.path().exists());

    let err = register.run(&["init"]).unwrap_err();
    assert!(matches!(err, WardenError::InvalidState(_)));

    register.run(&["risk", "add", "Keep me?"]).unwrap();
    register.run(&["init", "--force"]).unwrap();
    let status = register.run(&["status"]).unwrap();
    assert_eq!(status["risks"], 0);
}

#[test]
fn status_is_the_default_command() {
    let register = Register::new();
    let status = register.run(&[]).unwrap();
    assert_eq!(status["risks"], 0);
    assert_eq!(status["actor"], "tester");
    assert_eq!(status["risks_by_status"]["identified"], 0);
}

// =============================================================================
// RISK COMMANDS
// =============================================================================

#[test]
fn risk_add_stamps_the_actor() {
    let register = Register::new();
    let risk = register
        .run_as("alice", &["risk", "add", "Vendor breach", "--severity", "high"])
        .unwrap();

    assert_eq!(risk["id"], 1);
    assert_eq!(risk["severity"], "High");
    assert_eq!(risk["owner"], "alice");
    assert_eq!(risk["audit"]["created_by"], "alice");
    assert_eq!(risk["audit"]["updated_by"], "alice");
}

#[test]
fn risk_add_rejects_unknown_category_atomically() {
    let register = Register::new();
    let err = register
        .run(&["risk", "add", "Orphan", "--category", "7"])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));
    assert_eq!(register.run(&["status"]).unwrap()["risks"], 0);
}

#[test]
fn risk_list_filters_and_pages() {
    let register = Register::new();
    for (title, severity) in [
        ("Flood", "low"),
        ("Fire", "critical"),
        ("Theft", "medium"),
        ("Outage", "high"),
    ] {
        register
            .run(&["risk", "add", title, "--severity", severity])
            .unwrap();
    }

    let page = register
        .run(&["risk", "list", "--min-severity", "medium", "--page-size", "2"])
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["total_pages"], 2);
    assert_eq!(page["has_next"], true);
    assert_eq!(page["items"][0]["title"], "Fire");
    assert_eq!(page["items"][1]["title"], "Outage");

    let second = register
        .run(&["risk", "list", "--min-severity", "medium", "--page-size", "2", "--page", "2"])
        .unwrap();
    assert_eq!(second["items"][0]["title"], "Theft");
    assert_eq!(second["has_next"], false);

    let err = register.run(&["risk", "list", "--page", "0"]).unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));
}

#[test]
fn risk_transition_follows_lifecycle() {
    let register = Register::new();
    register.run(&["risk", "add", "Phishing"]).unwrap();

    let risk = register
        .run_as("bob", &["risk", "transition", "1", "assessed"])
        .unwrap();
    assert_eq!(risk["status"], "Assessed");
    assert_eq!(risk["audit"]["created_by"], "tester");
    assert_eq!(risk["audit"]["updated_by"], "bob");

    let err = register
        .run(&["risk", "transition", "1", "identified"])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidState(_)));

    let err = register
        .run(&["risk", "transition", "9", "closed"])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));
}

#[test]
fn soft_delete_hides_and_hard_delete_removes() {
    let register = Register::new();
    register.run(&["risk", "add", "Old"]).unwrap();
    register.run(&["risk", "add", "Older"]).unwrap();

    let soft = register.run(&["risk", "delete", "1"]).unwrap();
    assert_eq!(soft["deleted"], true);
    assert_eq!(soft["mode"], "soft");
    assert!(register.run(&["risk", "show", "1"]).is_err());

    let again = register.run(&["risk", "delete", "1"]).unwrap();
    assert_eq!(again["deleted"], false);

    let status = register.run(&["status"]).unwrap();
    assert_eq!(status["risks"], 1);
    assert_eq!(status["tombstoned_risks"], 1);

    let hard = register.run(&["risk", "delete", "2", "--hard"]).unwrap();
    assert_eq!(hard["deleted"], true);
    let gone = register.run(&["risk", "delete", "2", "--hard"]).unwrap();
    assert_eq!(gone["deleted"], false);
}

// =============================================================================
// FINDING / CATEGORY COMMANDS
// =============================================================================

#[test]
fn findings_show_under_their_risk() {
    let register = Register::new();
    register.run(&["risk", "add", "Supplier"]).unwrap();
    register
        .run(&["finding", "add", "1", "No contract", "--severity", "high"])
        .unwrap();
    register.run(&["finding", "add", "1", "No audit"]).unwrap();

    let shown = register.run(&["risk", "show", "1"]).unwrap();
    assert_eq!(shown["risk"]["title"], "Supplier");
    assert_eq!(shown["findings"].as_array().unwrap().len(), 2);

    let resolved = register.run(&["finding", "resolve", "1"]).unwrap();
    assert_eq!(resolved["status"], "Resolved");
    let err = register.run(&["finding", "resolve", "1"]).unwrap_err();
    assert!(matches!(err, WardenError::InvalidState(_)));

    assert_eq!(register.run(&["status"]).unwrap()["open_findings"], 1);

    let err = register
        .run(&["finding", "add", "42", "Dangling"])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));
}

#[test]
fn categories_have_unique_codes() {
    let register = Register::new();
    register.run(&["category", "add", "ops", "Operations"]).unwrap();
    register.run(&["category", "add", "FIN", "Finance"]).unwrap();

    let err = register
        .run(&["category", "add", "OPS", "Again"])
        .unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));

    let list = register.run(&["category", "list"]).unwrap();
    let codes: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["FIN", "OPS"]);

    let risk = register
        .run(&["risk", "add", "Payroll error", "--category", "2"])
        .unwrap();
    assert_eq!(risk["category_id"], 2);
}
