use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use interop_runs_cache::{DayCache, RunCache};
use interop_runs_core::QuerySignature;
use serde_json::{json, Value};
use time::macros::date;
use time::Date;

const UNREACHABLE_CATALOG: &str = "http://127.0.0.1:9/api/runs";

fn run_cli<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_interop-runs"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute interop-runs binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_cli(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "interop-runs command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

fn signature() -> QuerySignature {
    QuerySignature {
        products: vec!["firefox".to_string(), "chrome".to_string()],
        channel: "experimental".to_string(),
        aligned: true,
        max_per_day: None,
    }
}

fn raw_run(run_id: u64, product: &str, revision: &str, time_start: &str) -> Value {
    json!({
        "id": run_id,
        "browser_name": product,
        "browser_version": "120.0",
        "os_name": "linux",
        "os_version": "22.04",
        "revision": &revision[..revision.len().min(10)],
        "full_revision_hash": revision,
        "results_url": format!("https://storage.example/{run_id}-summary.json.gz"),
        "created_at": time_start,
        "time_start": time_start,
        "time_end": time_start,
        "raw_results_url": format!("https://storage.example/{run_id}-report.json"),
        "labels": ["master", "experimental"]
    })
}

/// Writes a cache holding 2023-01-01 and 2023-01-02 for the default signature.
fn seed_cache(dir: &Path) -> RunCache {
    let store = RunCache::new(dir, &signature());
    let mut cache = DayCache::new();
    cache.set(
        date!(2023 - 01 - 01),
        vec![
            raw_run(1, "firefox", "aaaa1111", "2023-01-01T03:00:00Z"),
            raw_run(2, "chrome", "aaaa1111", "2023-01-01T05:00:00Z"),
        ],
    );
    cache.set(date!(2023 - 01 - 02), vec![raw_run(3, "firefox", "bbbb2222", "2023-01-02T01:00:00Z")]);
    cache
        .save(store.path())
        .unwrap_or_else(|err| panic!("failed to seed cache {}: {err}", store.path().display()));
    store
}

fn fetch_args<'a>(dir: &'a Path, from: &'a str, to: &'a str) -> Vec<&'a str> {
    vec![
        "--cache-dir",
        path_str(dir),
        "fetch",
        "--product",
        "firefox",
        "--product",
        "chrome",
        "--from",
        from,
        "--to",
        to,
        "--base-url",
        UNREACHABLE_CATALOG,
        "--timeout-secs",
        "2",
    ]
}

fn revisions(payload: &Value) -> Vec<String> {
    payload["revisions"]
        .as_array()
        .unwrap_or_else(|| panic!("missing revisions array in payload: {payload}"))
        .iter()
        .map(|group| group["revision"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn fetch_serves_historical_days_from_cache() {
    let dir = temp_dir();
    seed_cache(dir.path());

    let payload = run_json(fetch_args(dir.path(), "2023-01-01", "2023-01-03"));

    assert_eq!(payload["contract_version"], "cli.v1");
    assert_eq!(payload["stats"], json!({"cached_days": 2, "fetched_days": 0, "runs": 3}));
    assert_eq!(revisions(&payload), vec!["aaaa1111", "bbbb2222"]);
    let first = &payload["revisions"][0];
    assert_eq!(first["earliest_start"], "2023-01-01T03:00:00Z");
    assert_eq!(first["runs"].as_array().map(Vec::len), Some(2));
    assert_eq!(first["runs"][0]["browser_name"], "firefox");
}

#[test]
fn fetch_narrows_to_aligned_and_selected_revisions() {
    let dir = temp_dir();
    seed_cache(dir.path());

    let mut aligned = fetch_args(dir.path(), "2023-01-01", "2023-01-03");
    aligned.push("--aligned-only");
    assert_eq!(revisions(&run_json(aligned)), vec!["aaaa1111"]);

    let mut selected = fetch_args(dir.path(), "2023-01-01", "2023-01-03");
    selected.extend(["--revision", "bbbb2222", "--by-date"]);
    let payload = run_json(selected);
    assert_eq!(revisions(&payload), vec!["bbbb2222"]);
    assert_eq!(payload["by_date"], json!({"2023-01-02": ["bbbb2222"]}));
}

#[test]
fn unreachable_catalog_fails_and_keeps_cached_days() {
    let dir = temp_dir();
    let store = seed_cache(dir.path());

    let output = run_cli(fetch_args(dir.path(), "2023-01-01", "2023-01-04"));
    assert!(!output.status.success(), "fetching 2023-01-03 must fail without a catalog");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to fetch runs"), "stderr was:\n{stderr}");

    let cache = DayCache::load(store.path());
    let days: [Date; 2] = [date!(2023 - 01 - 01), date!(2023 - 01 - 02)];
    assert!(days.iter().all(|day| cache.contains(*day)));
    assert!(!cache.contains(date!(2023 - 01 - 03)));
}

#[test]
fn cache_command_reports_days_without_fetching() {
    let dir = temp_dir();
    let store = seed_cache(dir.path());

    let payload = run_json([
        "--cache-dir",
        path_str(dir.path()),
        "cache",
        "--product",
        "firefox",
        "--product",
        "chrome",
    ]);

    assert_eq!(payload["cache_path"], path_str(store.path()));
    assert_eq!(payload["exists"], true);
    assert_eq!(payload["day_count"], 2);
    assert_eq!(payload["days"], json!({"2023-01-01": 2, "2023-01-02": 1}));
    assert_eq!(
        payload["signature"],
        "products:firefox-chrome-channel:experimental-aligned:true-max_per_day:none"
    );
}

#[test]
fn cache_command_on_other_signature_is_empty() {
    let dir = temp_dir();
    seed_cache(dir.path());

    let payload = run_json([
        "--cache-dir",
        path_str(dir.path()),
        "cache",
        "--product",
        "chrome",
        "--product",
        "firefox",
    ]);
    assert_eq!(payload["exists"], false);
    assert_eq!(payload["day_count"], 0);
}

#[test]
fn invalid_configuration_is_rejected_before_io() {
    let dir = temp_dir();

    let mut unknown_product = fetch_args(dir.path(), "2023-01-01", "2023-01-03");
    unknown_product[4] = "netscape";
    let output = run_cli(unknown_product);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported product `netscape`"));

    let output = run_cli(fetch_args(dir.path(), "2023-01-03", "2023-01-01"));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("is empty"));

    let output = run_cli(fetch_args(dir.path(), "2023-13-01", "2023-01-01"));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid --from"));

    assert_eq!(
        std::fs::read_dir(dir.path()).map(Iterator::count).unwrap_or_default(),
        0,
        "no cache file may be written for a rejected configuration"
    );
}
