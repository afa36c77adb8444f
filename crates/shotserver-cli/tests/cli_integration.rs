use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_shots<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_shots"))
        .args(args)
        .env_remove("SHOTSERVER_DB")
        .env_remove("SHOTSERVER_POLL_WINDOW_SECS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute shots binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_shots(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "shots command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn pointer_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_catalog(dir: &Path) -> PathBuf {
    let path = dir.join("catalog.json");
    let catalog = serde_json::json!({
        "platforms": [
            {"id": 1, "name": "Linux", "position": 1},
            {"id": 2, "name": "Windows", "position": 2}
        ],
        "operating_systems": [
            {"id": 1, "platform_id": 1, "name": "Ubuntu", "version": "7.04",
             "codename": "Feisty Fawn", "maker": "Canonical"},
            {"id": 2, "platform_id": 2, "name": "Windows", "version": "XP",
             "codename": "", "maker": "Microsoft"}
        ],
        "browser_groups": [{"id": 1, "name": "Firefox"}],
        "feature_versions": [{"id": 1, "feature": "javascript", "version": "1.8"}],
        "factories": [
            {"id": 1, "name": "linux-1", "operating_system_id": 1, "last_poll": null},
            {"id": 2, "name": "windows-1", "operating_system_id": 2, "last_poll": null}
        ],
        "browsers": [
            {"id": 1, "factory_id": 1, "browser_group_id": 1, "version": "3.0", "javascript_id": 1},
            {"id": 2, "factory_id": 2, "browser_group_id": 1, "version": "2.0"}
        ],
        "screen_sizes": [
            {"factory_id": 1, "width": 1280, "height": 1024},
            {"factory_id": 2, "width": 800, "height": 600}
        ],
        "color_depths": [{"factory_id": 1, "bits_per_pixel": 24}],
        "websites": [
            {"id": 1, "url": "http://example.org/"},
            {"id": 2, "url": "http://example.com/"}
        ]
    });
    fs::write(&path, catalog.to_string())
        .unwrap_or_else(|err| panic!("failed to write catalog {}: {err}", path.display()));
    path
}

fn seeded_db(prefix: &str) -> (PathBuf, PathBuf) {
    let dir = unique_temp_dir(prefix);
    let db = dir.join("shotserver.sqlite3");
    let catalog = write_catalog(&dir);
    let imported =
        run_json(["--db", path_str(&db), "catalog", "import", "--in", path_str(&catalog)]);
    assert!(as_i64(&imported, "imported_rows") > 0);
    (dir, db)
}

fn add_screenshot(db: &Path, hashkey: &str, website: &str, factory: &str, browser: &str) -> Value {
    run_json([
        "--db",
        path_str(db),
        "screenshot",
        "add",
        "--hashkey",
        hashkey,
        "--website",
        website,
        "--factory",
        factory,
        "--browser",
        browser,
        "--width",
        "1024",
        "--height",
        "768",
        "--uploaded",
        "2007-03-09T14:05:07Z",
    ])
}

#[test]
fn migrate_dry_run_then_apply() {
    let dir = unique_temp_dir("shots-cli-migrate");
    let db = dir.join("shotserver.sqlite3");

    let planned = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(planned.get("dry_run").and_then(Value::as_bool), Some(true));
    assert_eq!(planned.get("would_apply_versions"), Some(&serde_json::json!([1])));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 1);

    let status = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(status.get("up_to_date").and_then(Value::as_bool), Some(true));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn recent_show_and_navigate_follow_latest_per_website() {
    let (dir, db) = seeded_db("shots-cli-browse");
    add_screenshot(&db, "aa01", "1", "1", "1");
    add_screenshot(&db, "bb02", "2", "1", "1");
    add_screenshot(&db, "cc03", "1", "2", "2");
    add_screenshot(&db, "dd04", "1", "1", "1");

    let recent = run_json(["--db", path_str(&db), "screenshot", "recent"]);
    assert_eq!(as_i64(&recent, "limit"), 60);
    let hashkeys = recent
        .get("screenshots")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| pointer_str(item, "/screenshot/hashkey").to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    assert_eq!(hashkeys, vec!["dd04".to_string(), "bb02".to_string()]);

    let capped = run_json(["--db", path_str(&db), "screenshot", "recent", "--recent-limit", "1"]);
    assert_eq!(capped.get("screenshots").and_then(Value::as_array).map(Vec::len), Some(1));

    let page = run_json(["--db", path_str(&db), "screenshot", "show", "--hashkey", "dd04"]);
    assert_eq!(pointer_str(&page, "/navigation/0/label"), "3 out of 3 screenshots");
    assert_eq!(pointer_str(&page, "/navigation/1/label"), "2 out of 2 on Linux");
    assert_eq!(pointer_str(&page, "/links/absolute_url"), "/screenshots/dd04/");
    assert_eq!(pointer_str(&page, "/png_filename"), "070309-140507-firefox-3.0-ubuntu-7.04-dd04.png");

    let scoped = run_json([
        "--db",
        path_str(&db),
        "screenshot",
        "navigate",
        "--hashkey",
        "aa01",
        "--scope",
        "platform",
    ]);
    assert_eq!(pointer_str(&scoped, "/summary/links/next/hashkey"), "dd04");
    assert_eq!(scoped.pointer("/summary/links/first"), Some(&Value::Null));

    let rows = run_json(["--db", path_str(&db), "screenshot", "navigate", "--hashkey", "bb02"]);
    assert_eq!(rows.get("rows").and_then(Value::as_array).map(Vec::len), Some(1));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn problem_reports_resolve_and_fail_loudly() {
    let (dir, db) = seeded_db("shots-cli-problems");
    add_screenshot(&db, "aa01", "1", "1", "1");

    let report = run_json([
        "--db",
        path_str(&db),
        "problem",
        "add",
        "--hashkey",
        "aa01",
        "--code",
        "201",
        "--ip",
        "192.0.2.10",
    ]);
    let id = as_i64(&report, "id").to_string();

    let explained = run_json(["--db", path_str(&db), "problem", "explain", "--id", &id]);
    assert_eq!(as_str(&explained, "explicit"), "Javascript is not 1.8.");
    assert_eq!(as_str(&explained, "generic"), "This is not the requested Javascript version.");

    let flash = run_shots([
        "--db",
        path_str(&db),
        "problem",
        "add",
        "--hashkey",
        "aa01",
        "--code",
        "203",
        "--ip",
        "192.0.2.10",
    ]);
    assert!(!flash.status.success());
    let stderr = String::from_utf8_lossy(&flash.stderr);
    assert!(stderr.contains("validation error"), "unexpected stderr: {stderr}");

    let listed = run_json(["--db", path_str(&db), "problem", "list", "--hashkey", "aa01"]);
    assert_eq!(listed.get("problems").and_then(Value::as_array).map(Vec::len), Some(1));

    let page = run_json(["--db", path_str(&db), "screenshot", "show", "--hashkey", "aa01"]);
    assert_eq!(pointer_str(&page, "/problems/0/explicit"), "Javascript is not 1.8.");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn choices_track_polling_factories() {
    let (dir, db) = seeded_db("shots-cli-choices");

    let negative =
        run_shots(["--db", path_str(&db), "--poll-window-secs", "-5", "choices", "screen-sizes"]);
    assert!(!negative.status.success());

    let idle = run_json(["--db", path_str(&db), "choices", "screen-sizes"]);
    assert_eq!(idle.get("choices").and_then(Value::as_array).map(Vec::len), Some(1));

    run_json(["--db", path_str(&db), "catalog", "poll", "--factory", "1"]);
    let sizes = run_json(["--db", path_str(&db), "choices", "screen-sizes"]);
    assert_eq!(pointer_str(&sizes, "/choices/1/label"), "1280 pixels wide");

    let javascript =
        run_json(["--db", path_str(&db), "choices", "features", "--feature", "javascript"]);
    assert_eq!(pointer_str(&javascript, "/choices/0/value"), "dontcare");
    assert_eq!(pointer_str(&javascript, "/choices/1/value"), "1.8");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn delete_and_unknown_hashkey() {
    let (dir, db) = seeded_db("shots-cli-delete");
    add_screenshot(&db, "aa01", "1", "1", "1");
    add_screenshot(&db, "bb02", "1", "1", "1");

    let deleted = run_json(["--db", path_str(&db), "screenshot", "delete", "--hashkey", "bb02"]);
    assert_eq!(deleted.get("deleted").and_then(Value::as_bool), Some(true));

    let recent = run_json(["--db", path_str(&db), "screenshot", "recent"]);
    assert_eq!(pointer_str(&recent, "/screenshots/0/screenshot/hashkey"), "aa01");

    let output = run_shots(["--db", path_str(&db), "screenshot", "show", "--hashkey", "bb02"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));

    let _ = fs::remove_dir_all(&dir);
}
