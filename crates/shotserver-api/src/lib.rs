use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use shotserver_core::{
    check_problem_code, generic_message, generic_problem_template, navigation_summary, resolve_message,
    screenshot_navigation, BrowserId, Choice, FactoryId, Feature, NavigationRow, NavigationScope,
    NavigationSummary, NewProblemReport, NewScreenshot, ProblemReport, ProblemReportId,
    Screenshot, ScreenshotContext, ScreenshotQueries, ShotError, WebsiteId,
    RECENT_SCREENSHOTS_LIMIT,
};
use shotserver_store_sqlite::{
    read_catalog_file, ImportSummary, IntegrityReport, SchemaStatus, SqliteQueries, SqliteStore,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Factories that polled within this window count as active.
pub const DEFAULT_POLL_WINDOW: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddScreenshotRequest {
    pub hashkey: String,
    pub website_id: WebsiteId,
    pub factory_id: FactoryId,
    pub browser_id: BrowserId,
    pub width: u32,
    pub height: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub uploaded: Option<OffsetDateTime>,
}

/// A problem report against the screenshot identified by `hashkey`.
///
/// Without `message`, the generic text for `code` is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportProblemRequest {
    pub hashkey: String,
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    pub ip: IpAddr,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub reported: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenshotLinks {
    pub absolute_url: String,
    pub png_url: String,
    pub large_url: String,
}

impl ScreenshotLinks {
    fn of(screenshot: &Screenshot) -> Self {
        Self {
            absolute_url: screenshot.absolute_url(),
            png_url: screenshot.png_url(shotserver_core::PngSize::Original),
            large_url: screenshot.large_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentScreenshot {
    pub screenshot: Screenshot,
    pub links: ScreenshotLinks,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExplainedProblem {
    pub report: ProblemReport,
    pub generic: String,
    pub explicit: String,
}

/// Everything the screenshot detail page shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenshotPage {
    pub context: ScreenshotContext,
    pub links: ScreenshotLinks,
    pub png_filename: String,
    pub navigation: Vec<NavigationRow>,
    pub problems: Vec<ExplainedProblem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopedNavigation {
    pub hashkey: String,
    pub scope: NavigationScope,
    pub summary: Option<NavigationSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub hashkey: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    ScreenSizes,
    ColorDepths,
    Feature(Feature),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChoiceList {
    pub kind: ChoiceKind,
    pub active_factories: Vec<FactoryId>,
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone)]
pub struct ShotserverApi {
    db_path: PathBuf,
    poll_window: Duration,
}

impl ShotserverApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, poll_window: DEFAULT_POLL_WINDOW }
    }

    #[must_use]
    pub fn with_poll_window(mut self, poll_window: Duration) -> Self {
        self.poll_window = poll_window;
        self
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Load reference data from a catalog JSON file.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable or a row is rejected.
    pub fn import_catalog(&self, path: &Path) -> Result<ImportSummary> {
        let catalog = read_catalog_file(path)?;
        let mut store = self.open_store()?;
        store.import_catalog(&catalog)
    }

    /// # Errors
    /// Returns an error when the factory does not exist.
    pub fn record_poll(&self, factory_id: FactoryId, at: Option<OffsetDateTime>) -> Result<()> {
        let mut store = self.open_store()?;
        store.record_poll(factory_id, at.unwrap_or_else(OffsetDateTime::now_utc))
    }

    /// Store one uploaded screenshot.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_screenshot(&self, input: AddScreenshotRequest) -> Result<Screenshot> {
        let mut store = self.open_store()?;
        let uploaded = input.uploaded.unwrap_or_else(OffsetDateTime::now_utc);
        store.add_screenshot(
            &NewScreenshot {
                hashkey: input.hashkey,
                website_id: input.website_id,
                factory_id: input.factory_id,
                browser_id: input.browser_id,
                width: input.width,
                height: input.height,
            },
            uploaded,
        )
    }

    /// File a problem report against a screenshot.
    ///
    /// # Errors
    /// Returns an error when the screenshot does not exist, no message is given for a code
    /// without a standard text, or the code names an attribute the screenshot's browser lacks.
    pub fn report_problem(&self, input: ReportProblemRequest) -> Result<ProblemReport> {
        let mut store = self.open_store()?;
        let context = require_context(&store.queries(), &input.hashkey)?;
        check_problem_code(input.code, &context)?;
        let message = match input.message {
            Some(message) => message,
            None => generic_problem_template(input.code)
                .map(str::to_string)
                .ok_or_else(|| {
                    anyhow!(ShotError::Validation(format!(
                        "problem code {} needs a message",
                        input.code
                    )))
                })?,
        };

        let report = store.add_problem_report(
            &NewProblemReport {
                screenshot_id: context.screenshot.id,
                code: input.code,
                message,
                ip: input.ip,
            },
            input.reported.unwrap_or_else(OffsetDateTime::now_utc),
        )?;
        info!(problem_report_id = %report.id, code = report.code, "filed problem report");
        Ok(report)
    }

    /// Newest screenshot of each website, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn recent(&self, limit: Option<usize>) -> Result<Vec<RecentScreenshot>> {
        let store = self.open_store()?;
        let limit = limit.unwrap_or(RECENT_SCREENSHOTS_LIMIT);
        let latest = store.queries().latest_per_group(limit)?;
        Ok(latest
            .into_iter()
            .map(|screenshot| RecentScreenshot { links: ScreenshotLinks::of(&screenshot), screenshot })
            .collect())
    }

    /// Assemble the detail page of one screenshot from a single read snapshot.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown hashkey, or an integrity error
    /// when a stored problem report cannot be explained.
    pub fn screenshot_page(&self, hashkey: &str) -> Result<ScreenshotPage> {
        let store = self.open_store()?;
        store.read_snapshot(|queries| {
            let context = require_context(queries, hashkey)?;
            let navigation = screenshot_navigation(queries, &context)?;
            let problems = queries
                .problem_reports_for(context.screenshot.id)?
                .into_iter()
                .map(|report| explain(report, &context))
                .collect::<Result<Vec<_>>>()?;

            debug!(hashkey, rows = navigation.len(), problems = problems.len(), "built screenshot page");
            Ok(ScreenshotPage {
                links: ScreenshotLinks::of(&context.screenshot),
                png_filename: context.png_filename(),
                navigation,
                problems,
                context,
            })
        })
    }

    /// Navigation rows shown on a screenshot page.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown hashkey.
    pub fn navigation(&self, hashkey: &str) -> Result<Vec<NavigationRow>> {
        let store = self.open_store()?;
        store.read_snapshot(|queries| {
            let context = require_context(queries, hashkey)?;
            screenshot_navigation(queries, &context)
        })
    }

    /// Rank and links within one scope, without the page's omission rules.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown hashkey.
    pub fn navigate(&self, hashkey: &str, scope: NavigationScope) -> Result<ScopedNavigation> {
        let store = self.open_store()?;
        let summary = store.read_snapshot(|queries| {
            let context = require_context(queries, hashkey)?;
            let filter = scope.filter_for(&context.keys());
            navigation_summary(queries, context.screenshot.id, &filter, 1, None)
        })?;
        Ok(ScopedNavigation { hashkey: hashkey.to_string(), scope, summary })
    }

    /// Generic and explicit text of one problem report.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown report, or a
    /// [`ShotError::Integrity`] error when the explicit text cannot be built.
    pub fn explain_problem(&self, id: ProblemReportId) -> Result<ExplainedProblem> {
        let store = self.open_store()?;
        store.read_snapshot(|queries| {
            let report = queries
                .problem_report(id)?
                .ok_or_else(|| anyhow!(ShotError::NotFound(format!("problem report {id}"))))?;
            let context = queries.screenshot_context(report.screenshot_id)?.ok_or_else(|| {
                anyhow!(ShotError::Integrity(format!(
                    "problem report {id} refers to missing screenshot {}",
                    report.screenshot_id
                )))
            })?;
            explain(report, &context)
        })
    }

    /// Problem reports of one screenshot, newest first.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown hashkey.
    pub fn problems(&self, hashkey: &str) -> Result<Vec<ProblemReport>> {
        let store = self.open_store()?;
        store.read_snapshot(|queries| {
            let screenshot = require_screenshot(queries, hashkey)?;
            queries.problem_reports_for(screenshot.id)
        })
    }

    /// Selection choices offered by factories that polled recently.
    ///
    /// # Errors
    /// Returns a [`ShotError::Validation`] error when the poll window reaches past the
    /// representable time range, or an error when the queries fail.
    pub fn choices(&self, kind: ChoiceKind) -> Result<ChoiceList> {
        let cutoff = OffsetDateTime::now_utc().checked_sub(self.poll_window).ok_or_else(|| {
            anyhow!(ShotError::Validation(format!(
                "poll window of {} seconds is out of range",
                self.poll_window.whole_seconds()
            )))
        })?;
        let store = self.open_store()?;
        store.read_snapshot(|queries| {
            let active_factories = queries
                .active_factories(cutoff)?
                .into_iter()
                .map(|factory| factory.id)
                .collect::<Vec<_>>();
            let choices = match kind {
                ChoiceKind::ScreenSizes => queries.screen_size_choices(&active_factories)?,
                ChoiceKind::ColorDepths => queries.color_depth_choices(&active_factories)?,
                ChoiceKind::Feature(feature) => {
                    queries.feature_choices(feature, &active_factories)?
                }
            };
            Ok(ChoiceList { kind, active_factories, choices })
        })
    }

    /// Delete a screenshot together with its problem reports.
    ///
    /// # Errors
    /// Returns a [`ShotError::NotFound`] error for an unknown hashkey.
    pub fn delete_screenshot(&self, hashkey: &str) -> Result<DeleteResult> {
        let mut store = self.open_store()?;
        let screenshot = require_screenshot(&store.queries(), hashkey)?;
        let deleted = store.delete_screenshot(screenshot.id)?;
        Ok(DeleteResult { hashkey: hashkey.to_string(), deleted })
    }
}

/// The [`ShotError`] carried by an API error, if any.
#[must_use]
pub fn shot_error(err: &anyhow::Error) -> Option<&ShotError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ShotError>())
}

fn require_screenshot(queries: &SqliteQueries<'_>, hashkey: &str) -> Result<Screenshot> {
    queries
        .screenshot_by_hashkey(hashkey)?
        .ok_or_else(|| anyhow!(ShotError::NotFound(format!("screenshot {hashkey}"))))
}

fn require_context(queries: &SqliteQueries<'_>, hashkey: &str) -> Result<ScreenshotContext> {
    let screenshot = require_screenshot(queries, hashkey)?;
    queries
        .screenshot_context(screenshot.id)?
        .ok_or_else(|| anyhow!(ShotError::NotFound(format!("screenshot {hashkey}"))))
}

fn explain(report: ProblemReport, context: &ScreenshotContext) -> Result<ExplainedProblem> {
    let explicit = resolve_message(&report, context)?;
    Ok(ExplainedProblem { generic: generic_message(&report), explicit, report })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;

    fn unique_temp_path(extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shotserver-api-{}.{extension}", ulid::Ulid::new()))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn seeded_api() -> Result<(ShotserverApi, PathBuf)> {
        let db_path = unique_temp_path("sqlite3");
        let catalog_path = unique_temp_path("json");
        let catalog = json!({
            "platforms": [{"id": 1, "name": "Linux", "position": 1}],
            "operating_systems": [{
                "id": 1, "platform_id": 1, "name": "Ubuntu", "version": "7.04",
                "codename": "Feisty Fawn", "maker": "Canonical"
            }],
            "browser_groups": [{"id": 1, "name": "Firefox"}, {"id": 2, "name": "Opera"}],
            "feature_versions": [{"id": 1, "feature": "java", "version": "1.6"}],
            "factories": [{"id": 1, "name": "linux-1", "operating_system_id": 1, "last_poll": null}],
            "browsers": [
                {"id": 1, "factory_id": 1, "browser_group_id": 1, "version": "3.0"},
                {"id": 2, "factory_id": 1, "browser_group_id": 2, "version": "9.2", "java_id": 1}
            ],
            "screen_sizes": [{"factory_id": 1, "width": 1024, "height": 768}],
            "color_depths": [{"factory_id": 1, "bits_per_pixel": 24}],
            "websites": [
                {"id": 1, "url": "http://example.org/"},
                {"id": 2, "url": "http://example.com/"}
            ]
        });
        fs::write(&catalog_path, serde_json::to_vec(&catalog)?)?;

        let api = ShotserverApi::new(db_path.clone());
        api.import_catalog(&catalog_path)?;
        fs::remove_file(&catalog_path)?;
        Ok((api, db_path))
    }

    fn upload(api: &ShotserverApi, hashkey: &str, website: i64, browser: i64) -> Result<Screenshot> {
        api.add_screenshot(AddScreenshotRequest {
            hashkey: hashkey.to_string(),
            website_id: WebsiteId(website),
            factory_id: FactoryId(1),
            browser_id: BrowserId(browser),
            width: 1024,
            height: 768,
            uploaded: Some(fixture_time()),
        })
    }

    #[test]
    fn migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_path("sqlite3");
        let api = ShotserverApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn recent_lists_newest_screenshot_per_website() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        upload(&api, "aa01", 1, 1)?;
        upload(&api, "bb02", 2, 1)?;
        upload(&api, "cc03", 1, 2)?;

        let recent = api.recent(None)?;
        let hashkeys = recent.iter().map(|item| item.screenshot.hashkey.as_str()).collect::<Vec<_>>();
        assert_eq!(hashkeys, vec!["cc03", "bb02"]);
        assert_eq!(recent[0].links.absolute_url, "/screenshots/cc03/");
        assert_eq!(recent[0].links.large_url, "/png/512/cc/cc03.png");
        assert_eq!(api.recent(Some(1))?.len(), 1);

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn screenshot_page_collects_navigation_and_problems() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        upload(&api, "aa01", 1, 1)?;
        upload(&api, "bb02", 1, 2)?;
        upload(&api, "cc03", 1, 1)?;

        api.report_problem(ReportProblemRequest {
            hashkey: "cc03".to_string(),
            code: 101,
            message: None,
            ip: IpAddr::from([10, 0, 0, 1]),
            reported: Some(fixture_time()),
        })?;

        let page = api.screenshot_page("cc03")?;
        let labels = page.navigation.iter().map(|row| row.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, vec!["3 out of 3 screenshots", "2 out of 2 with Firefox"]);
        assert_eq!(page.problems.len(), 1);
        assert_eq!(page.problems[0].generic, "This is not the requested browser.");
        assert_eq!(page.problems[0].explicit, "This is not Firefox 3.0.");
        assert!(page.png_filename.ends_with("-firefox-3.0-ubuntu-7.04-cc03.png"));

        let scoped = api.navigate("aa01", NavigationScope::BrowserGroup)?;
        let Some(summary) = scoped.summary else {
            panic!("expected browser group navigation");
        };
        assert_eq!((summary.index, summary.total), (1, 2));
        assert_eq!(summary.links.first, None);
        assert_eq!(summary.links.next.map(|s| s.hashkey), Some("cc03".to_string()));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn report_problem_rejects_codes_the_browser_cannot_explain() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        upload(&api, "aa01", 1, 1)?;
        upload(&api, "bb02", 1, 2)?;

        let err = match api.report_problem(ReportProblemRequest {
            hashkey: "aa01".to_string(),
            code: 202,
            message: None,
            ip: IpAddr::from([10, 0, 0, 1]),
            reported: None,
        }) {
            Ok(report) => panic!("expected validation error, got {report:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::Validation(_))));
        assert!(api.problems("aa01")?.is_empty());

        let page = api.screenshot_page("aa01")?;
        assert!(page.problems.is_empty());
        assert_eq!(page.navigation[0].label, "1 out of 2 screenshots");

        let java = api.report_problem(ReportProblemRequest {
            hashkey: "bb02".to_string(),
            code: 202,
            message: None,
            ip: IpAddr::from([10, 0, 0, 1]),
            reported: None,
        })?;
        assert_eq!(api.explain_problem(java.id)?.explicit, "Java is not 1.6.");

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn explain_problem_surfaces_integrity_errors() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        let screenshot = upload(&api, "aa01", 1, 1)?;

        // Rows written by other tools skip the write-time check.
        let mut store = SqliteStore::open(&db_path)?;
        let report = store.add_problem_report(
            &NewProblemReport {
                screenshot_id: screenshot.id,
                code: 202,
                message: "This is not the requested Java version.".to_string(),
                ip: IpAddr::from([10, 0, 0, 1]),
            },
            fixture_time(),
        )?;
        drop(store);

        let err = match api.explain_problem(report.id) {
            Ok(explained) => panic!("expected integrity error, got {explained:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::Integrity(_))));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn unknown_hashkey_is_not_found() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        let err = match api.screenshot_page("missing") {
            Ok(page) => panic!("expected not found, got {page:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::NotFound(_))));

        let err = match api.delete_screenshot("missing") {
            Ok(result) => panic!("expected not found, got {result:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::NotFound(_))));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn report_problem_requires_message_for_free_text_codes() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        upload(&api, "aa01", 1, 1)?;

        let err = match api.report_problem(ReportProblemRequest {
            hashkey: "aa01".to_string(),
            code: 999,
            message: None,
            ip: IpAddr::from([10, 0, 0, 1]),
            reported: None,
        }) {
            Ok(report) => panic!("expected validation error, got {report:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::Validation(_))));

        let report = api.report_problem(ReportProblemRequest {
            hashkey: "aa01".to_string(),
            code: 999,
            message: Some("Fonts are missing.".to_string()),
            ip: IpAddr::from([10, 0, 0, 1]),
            reported: None,
        })?;
        assert_eq!(api.explain_problem(report.id)?.explicit, "Fonts are missing.");

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn choices_only_include_recently_polling_factories() -> Result<()> {
        let (api, db_path) = seeded_api()?;

        let idle = api.choices(ChoiceKind::ScreenSizes)?;
        assert!(idle.active_factories.is_empty());
        assert_eq!(idle.choices.len(), 1);

        api.record_poll(FactoryId(1), None)?;
        let sizes = api.choices(ChoiceKind::ScreenSizes)?;
        assert_eq!(sizes.active_factories, vec![FactoryId(1)]);
        assert_eq!(sizes.choices[1].label, "1024 pixels wide");

        let java = api.choices(ChoiceKind::Feature(Feature::Java))?;
        let values = java.choices.iter().map(|choice| choice.value.as_str()).collect::<Vec<_>>();
        assert_eq!(values, vec!["dontcare", "1.6"]);

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn choices_reject_poll_window_beyond_time_range() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        let api = api.with_poll_window(Duration::seconds(i64::MAX / 2));

        let err = match api.choices(ChoiceKind::ColorDepths) {
            Ok(list) => panic!("expected validation error, got {list:?}"),
            Err(err) => err,
        };
        assert!(matches!(shot_error(&err), Some(ShotError::Validation(_))));

        let _ = fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn delete_screenshot_removes_it_from_recent() -> Result<()> {
        let (api, db_path) = seeded_api()?;
        upload(&api, "aa01", 1, 1)?;
        upload(&api, "bb02", 1, 1)?;

        assert!(api.delete_screenshot("bb02")?.deleted);
        let recent = api.recent(None)?;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].screenshot.hashkey, "aa01");

        let _ = fs::remove_file(&db_path);
        Ok(())
    }
}
