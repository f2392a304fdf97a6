//! Integration tests for CLI argument handling
//!
//! Runs the binary against a throwaway store directory.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Helper to run the CLI with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_gasprices"))
        .args(args)
        .env_remove("GASPRICES_STORE_DIR")
        .env_remove("GASPRICES_FEED_URL")
        .env_remove("GASPRICES_BACKGROUND_DATA")
        .output()
        .expect("Failed to execute gasprices")
}

/// Runs the CLI against the store in `dir`
fn run_with_store(dir: &Path, args: &[&str]) -> std::process::Output {
    let dir = dir.to_str().expect("Temp path should be UTF-8");
    let mut full = vec!["--store-dir", dir];
    full.extend_from_slice(args);
    run_cli(&full)
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = stdout(&output);
    assert!(stdout.contains("gasprices"), "Help should mention gasprices");
    assert!(stdout.contains("refresh"), "Help should mention refresh");
    assert!(stdout.contains("next-refresh"), "Help should mention next-refresh");
    assert!(stdout.contains("widget"), "Help should mention widget");
}

#[test]
fn test_next_refresh_before_first_window() {
    let output = run_cli(&["next-refresh", "--at", "2024-06-10T16:59:00"]);
    assert!(output.status.success());
    assert!(
        stdout(&output).contains("2024-06-10T17:00:00"),
        "Unexpected next refresh: {}",
        stdout(&output)
    );
}

#[test]
fn test_next_refresh_after_last_window_rolls_to_midnight() {
    let output = run_cli(&["next-refresh", "--at", "2024-06-10T21:00:00"]);
    assert!(output.status.success());
    assert!(
        stdout(&output).contains("2024-06-11T00:00:00"),
        "Unexpected next refresh: {}",
        stdout(&output)
    );
}

#[test]
fn test_next_refresh_rejects_invalid_time() {
    let output = run_cli(&["next-refresh", "--at", "tomorrow evening"]);
    assert!(!output.status.success(), "Expected invalid time to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Invalid local time"),
        "Should print error message about the time: {}",
        stderr
    );
}

#[test]
fn test_refresh_without_background_data_is_skipped() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_with_store(temp_dir.path(), &["refresh", "--background-data", "false"]);
    assert!(output.status.success());
    let refresh_out = stdout(&output);
    assert!(refresh_out.contains("Status: skipped"), "Got: {}", refresh_out);
    assert!(refresh_out.contains("Next refresh:"));

    let output = run_with_store(temp_dir.path(), &["show"]);
    assert!(output.status.success());
    let show_out = stdout(&output);
    assert!(show_out.contains("Last updated: never"), "Got: {}", show_out);
    assert!(show_out.contains("(skipped)"), "Got: {}", show_out);
    assert!(show_out.contains("No gas price data cached yet"));
}

#[test]
fn test_refresh_with_unreachable_feed_reports_fetch_failure() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_with_store(
        temp_dir.path(),
        &["--feed-url", "http://127.0.0.1:1/feed", "--fetch-timeout-secs", "5", "refresh"],
    );

    assert!(output.status.success(), "A failed fetch is not a failed command");
    assert!(stdout(&output).contains("Status: fetch failed"), "Got: {}", stdout(&output));
}

#[test]
fn test_non_http_feed_url_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_with_store(temp_dir.path(), &["--feed-url", "ftp://example.com/feed", "refresh"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid feed URL"));
}

#[test]
fn test_widget_set_list_clear() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_with_store(temp_dir.path(), &["widget", "list"]);
    assert!(stdout(&output).contains("No widgets configured"));

    let output = run_with_store(temp_dir.path(), &["widget", "set", "3", "5", "Toronto"]);
    assert!(output.status.success());
    run_with_store(temp_dir.path(), &["widget", "set", "4", "7", "Ottawa"]);

    let listed = stdout(&run_with_store(temp_dir.path(), &["widget", "list"]));
    assert!(listed.contains("Widget 3: Toronto (city 5)"), "Got: {}", listed);
    assert!(listed.contains("Widget 4: Ottawa (city 7)"), "Got: {}", listed);

    let output = run_with_store(temp_dir.path(), &["widget", "clear", "3"]);
    assert!(output.status.success());

    let listed = stdout(&run_with_store(temp_dir.path(), &["widget", "list"]));
    assert!(!listed.contains("Widget 3"));
    assert!(listed.contains("Widget 4: Ottawa (city 7)"));
}

#[test]
fn test_select_city_shows_in_metadata() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_with_store(temp_dir.path(), &["select-city", "42"]);
    assert!(output.status.success());

    let shown = stdout(&run_with_store(temp_dir.path(), &["show"]));
    assert!(shown.contains("Selected city: 42"), "Got: {}", shown);
}

#[test]
fn test_show_unknown_city() {
    let temp_dir = TempDir::new().unwrap();
    let shown = stdout(&run_with_store(temp_dir.path(), &["show", "--city", "9"]));
    assert!(shown.contains("No data for city 9"), "Got: {}", shown);
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use clap::Parser;
    use gasprices::cli::{Cli, Command};

    #[test]
    fn test_cli_show_without_city() {
        let cli = Cli::parse_from(["gasprices", "show"]);
        assert_eq!(cli.command, Command::Show { city: None });
    }

    #[test]
    fn test_cli_store_dir_flag() {
        let cli = Cli::parse_from(["gasprices", "--store-dir", "/tmp/prices", "show"]);
        assert_eq!(cli.store_dir, Some(std::path::PathBuf::from("/tmp/prices")));
    }

    #[test]
    fn test_cli_background_data_requires_value() {
        let result = Cli::try_parse_from(["gasprices", "--background-data", "maybe", "refresh"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_select_city_requires_id() {
        let result = Cli::try_parse_from(["gasprices", "select-city"]);
        assert!(result.is_err());
    }
}
