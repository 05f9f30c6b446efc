//! Integration tests for CLI argument handling
//!
//! Tests argument validation of the binary and request building from flags.

use std::process::Command;

/// Helper to run the CLI with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_metafetch"))
        .args(args)
        .output()
        .expect("Failed to execute metafetch")
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("metafetch"), "Help should mention metafetch");
    assert!(stdout.contains("--disable-cache"), "Help should mention cache switches");
    assert!(stdout.contains("--proxy-url"), "Help should mention --proxy-url");
}

#[test]
fn test_invalid_api_prints_error_and_exits() {
    let cache_dir = tempfile::tempdir().unwrap();
    let output = run_cli(&[
        "--cache-dir",
        cache_dir.path().to_str().unwrap(),
        "imdb",
        "title/tt0137523",
    ]);
    assert!(!output.status.success(), "Expected invalid API to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("imdb"),
        "Should print error message about the invalid API: {}",
        stderr
    );
}

#[test]
fn test_malformed_param_exits_with_error() {
    let cache_dir = tempfile::tempdir().unwrap();
    let output = run_cli(&[
        "--cache-dir",
        cache_dir.path().to_str().unwrap(),
        "tmdb",
        "movie/550",
        "-p",
        "language",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("language"), "stderr: {}", stderr);
}

#[test]
fn test_missing_path_is_rejected() {
    let output = run_cli(&["tmdb"]);
    assert!(!output.status.success());
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use std::time::Duration;

    use clap::Parser;
    use metafetch::api::ApiIdent;
    use metafetch::cli::{parse_header, parse_param, Cli, CliError};

    #[test]
    fn test_cli_trakt_request_with_headers() {
        let cli = Cli::parse_from([
            "metafetch",
            "trakt",
            "movies/trending",
            "-H",
            "trakt-api-version:2",
            "-H",
            "trakt-api-key: abc",
            "--refresh",
            "--timeout",
            "5",
        ]);
        let request = cli.requests().unwrap().remove(0);

        assert_eq!(request.api, ApiIdent::Trakt);
        assert_eq!(
            request.headers.get("trakt-api-version"),
            Some(&vec!["2".to_string()])
        );
        assert_eq!(request.headers.get("trakt-api-key"), Some(&vec!["abc".to_string()]));
        assert!(request.force_refresh);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_cli_data_sets_payload() {
        let cli = Cli::parse_from(["metafetch", "trakt", "sync/history", "--data", "{}"]);
        let request = cli.requests().unwrap().remove(0);
        assert_eq!(request.payload.as_deref(), Some(b"{}".as_slice()));
        assert!(request.method.is_none());
    }

    #[test]
    fn test_cli_invalid_method() {
        let cli = Cli::parse_from(["metafetch", "tmdb", "movie/550", "--method", "GE T"]);
        assert!(matches!(cli.requests(), Err(CliError::InvalidMethod(_))));
    }

    #[test]
    fn test_cli_cache_dir_and_registry_flags() {
        let cli = Cli::parse_from([
            "metafetch",
            "--cache-dir",
            "/tmp/metafetch",
            "--registry",
            "apis.json",
            "fanart",
            "movies/550",
        ]);
        let settings = cli.settings();
        assert_eq!(
            settings.cache_dir.as_deref(),
            Some(std::path::Path::new("/tmp/metafetch"))
        );
        assert_eq!(
            settings.registry.as_deref(),
            Some(std::path::Path::new("apis.json"))
        );
    }

    #[test]
    fn test_parse_param_and_header_errors() {
        assert!(matches!(parse_param("x"), Err(CliError::InvalidParam(_))));
        assert!(matches!(parse_header("x"), Err(CliError::InvalidHeader(_))));
    }
}
