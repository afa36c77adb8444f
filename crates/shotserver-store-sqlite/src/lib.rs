use std::collections::BTreeSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{named_params, params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use shotserver_core::{
    color_depth_choices, feature_choices, screen_size_choices, Browser, BrowserDescriptor,
    BrowserGroup, BrowserGroupId, BrowserId, Choice, ColorDepth, Factory, FactoryId, Feature,
    FeatureVersion, FeatureVersionId, NavigationFilter, NewProblemReport, NewScreenshot,
    OperatingSystem, OperatingSystemId, Platform, PlatformId, ProblemReport, ProblemReportId,
    ScreenSize, Screenshot, ScreenshotContext, ScreenshotId, ScreenshotQueries, ShotError,
    Website, WebsiteId,
};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS platforms (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE CHECK (length(name) BETWEEN 1 AND 30),
  position INTEGER
);

CREATE TABLE IF NOT EXISTS operating_systems (
  id INTEGER PRIMARY KEY,
  platform_id INTEGER NOT NULL,
  name TEXT NOT NULL CHECK (length(name) BETWEEN 1 AND 30),
  version TEXT NOT NULL DEFAULT '',
  codename TEXT NOT NULL DEFAULT '',
  maker TEXT NOT NULL DEFAULT '',
  FOREIGN KEY (platform_id) REFERENCES platforms(id)
);

CREATE TABLE IF NOT EXISTS browser_groups (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE CHECK (length(name) >= 1)
);

CREATE TABLE IF NOT EXISTS feature_versions (
  id INTEGER PRIMARY KEY,
  feature TEXT NOT NULL CHECK (feature IN ('javascript','java','flash')),
  version TEXT NOT NULL CHECK (length(version) >= 1),
  UNIQUE(feature, version)
);

CREATE TABLE IF NOT EXISTS factories (
  id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE CHECK (length(name) >= 1),
  operating_system_id INTEGER NOT NULL,
  last_poll TEXT,
  FOREIGN KEY (operating_system_id) REFERENCES operating_systems(id)
);

CREATE TABLE IF NOT EXISTS browsers (
  id INTEGER PRIMARY KEY,
  factory_id INTEGER NOT NULL,
  browser_group_id INTEGER NOT NULL,
  version TEXT NOT NULL,
  javascript_id INTEGER,
  java_id INTEGER,
  flash_id INTEGER,
  FOREIGN KEY (factory_id) REFERENCES factories(id),
  FOREIGN KEY (browser_group_id) REFERENCES browser_groups(id),
  FOREIGN KEY (javascript_id) REFERENCES feature_versions(id),
  FOREIGN KEY (java_id) REFERENCES feature_versions(id),
  FOREIGN KEY (flash_id) REFERENCES feature_versions(id)
);

CREATE TABLE IF NOT EXISTS screen_sizes (
  factory_id INTEGER NOT NULL,
  width INTEGER NOT NULL CHECK (width > 0),
  height INTEGER NOT NULL CHECK (height > 0),
  PRIMARY KEY (factory_id, width, height),
  FOREIGN KEY (factory_id) REFERENCES factories(id)
);

CREATE TABLE IF NOT EXISTS color_depths (
  factory_id INTEGER NOT NULL,
  bits_per_pixel INTEGER NOT NULL CHECK (bits_per_pixel > 0),
  PRIMARY KEY (factory_id, bits_per_pixel),
  FOREIGN KEY (factory_id) REFERENCES factories(id)
);

CREATE TABLE IF NOT EXISTS websites (
  id INTEGER PRIMARY KEY,
  url TEXT NOT NULL UNIQUE CHECK (length(url) >= 1)
);

CREATE TABLE IF NOT EXISTS screenshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hashkey TEXT NOT NULL UNIQUE CHECK (length(hashkey) BETWEEN 1 AND 32),
  website_id INTEGER NOT NULL,
  factory_id INTEGER NOT NULL,
  browser_id INTEGER NOT NULL,
  width INTEGER NOT NULL CHECK (width > 0),
  height INTEGER NOT NULL CHECK (height > 0),
  uploaded TEXT NOT NULL,
  FOREIGN KEY (website_id) REFERENCES websites(id),
  FOREIGN KEY (factory_id) REFERENCES factories(id),
  FOREIGN KEY (browser_id) REFERENCES browsers(id)
);

CREATE TABLE IF NOT EXISTS problem_reports (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  screenshot_id INTEGER NOT NULL,
  code INTEGER NOT NULL,
  message TEXT NOT NULL CHECK (length(message) BETWEEN 1 AND 200),
  reported TEXT NOT NULL,
  ip TEXT NOT NULL,
  FOREIGN KEY (screenshot_id) REFERENCES screenshots(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_screenshots_website_id ON screenshots(website_id, id);
CREATE INDEX IF NOT EXISTS idx_screenshots_browser_id ON screenshots(browser_id);
CREATE INDEX IF NOT EXISTS idx_screenshots_factory_id ON screenshots(factory_id);
CREATE INDEX IF NOT EXISTS idx_browsers_factory_id ON browsers(factory_id);
CREATE INDEX IF NOT EXISTS idx_problem_reports_screenshot_id ON problem_reports(screenshot_id);
";

const SCREENSHOT_COLUMNS: &str = "s.id AS id, s.hashkey AS hashkey, s.website_id AS website_id,
    s.factory_id AS factory_id, s.browser_id AS browser_id, s.width AS width,
    s.height AS height, s.uploaded AS uploaded";

// Every navigation query shares this join and filter; unset filters are bound as NULL.
const FILTERED_SCREENSHOTS: &str = "FROM screenshots AS s
    JOIN browsers AS b ON b.id = s.browser_id
    JOIN factories AS f ON f.id = s.factory_id
    JOIN operating_systems AS o ON o.id = f.operating_system_id
    WHERE (:website_id IS NULL OR s.website_id = :website_id)
      AND (:browser_group_id IS NULL OR b.browser_group_id = :browser_group_id)
      AND (:platform_id IS NULL OR o.platform_id = :platform_id)";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Reference data describing the rendering farm and the monitored websites.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    #[serde(default)]
    pub platforms: Vec<Platform>,
    #[serde(default)]
    pub operating_systems: Vec<OperatingSystem>,
    #[serde(default)]
    pub browser_groups: Vec<BrowserGroup>,
    #[serde(default)]
    pub feature_versions: Vec<FeatureVersion>,
    #[serde(default)]
    pub factories: Vec<Factory>,
    #[serde(default)]
    pub browsers: Vec<Browser>,
    #[serde(default)]
    pub screen_sizes: Vec<ScreenSize>,
    #[serde(default)]
    pub color_depths: Vec<ColorDepth>,
    #[serde(default)]
    pub websites: Vec<Website>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_rows: usize,
    pub skipped_existing_rows: usize,
}

impl ImportSummary {
    fn count(&mut self, inserted: bool) {
        if inserted {
            self.imported_rows += 1;
        } else {
            self.skipped_existing_rows += 1;
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed screenshot store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            info!(version = 1, "applied schema migration");
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Insert reference data; rows whose identifier already exists are skipped.
    ///
    /// # Errors
    /// Returns an error when a row violates schema constraints, a browser references a
    /// feature version of the wrong kind, or the transaction fails.
    pub fn import_catalog(&mut self, catalog: &Catalog) -> Result<ImportSummary> {
        let tx = self.conn.transaction().context("failed to start catalog transaction")?;
        let mut summary = ImportSummary::default();

        for platform in &catalog.platforms {
            let inserted = !row_exists(&tx, "platforms", platform.id.0)?
                && tx
                    .execute(
                        "INSERT INTO platforms(id, name, position) VALUES (?1, ?2, ?3)",
                        params![platform.id.0, platform.name, platform.position],
                    )
                    .with_context(|| format!("failed to insert platform {}", platform.id))?
                    == 1;
            summary.count(inserted);
        }

        for os in &catalog.operating_systems {
            let inserted = !row_exists(&tx, "operating_systems", os.id.0)?
                && tx
                    .execute(
                        "INSERT INTO operating_systems(id, platform_id, name, version, codename, maker)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            os.id.0,
                            os.platform_id.0,
                            os.name,
                            os.version,
                            os.codename,
                            os.maker
                        ],
                    )
                    .with_context(|| format!("failed to insert operating system {}", os.id))?
                    == 1;
            summary.count(inserted);
        }

        for group in &catalog.browser_groups {
            let inserted = !row_exists(&tx, "browser_groups", group.id.0)?
                && tx
                    .execute(
                        "INSERT INTO browser_groups(id, name) VALUES (?1, ?2)",
                        params![group.id.0, group.name],
                    )
                    .with_context(|| format!("failed to insert browser group {}", group.id))?
                    == 1;
            summary.count(inserted);
        }

        for feature_version in &catalog.feature_versions {
            let inserted = !row_exists(&tx, "feature_versions", feature_version.id.0)?
                && tx
                    .execute(
                        "INSERT INTO feature_versions(id, feature, version) VALUES (?1, ?2, ?3)",
                        params![
                            feature_version.id.0,
                            feature_version.feature.as_str(),
                            feature_version.version
                        ],
                    )
                    .with_context(|| {
                        format!("failed to insert feature version {}", feature_version.id)
                    })?
                    == 1;
            summary.count(inserted);
        }

        for factory in &catalog.factories {
            let last_poll = factory.last_poll.map(rfc3339).transpose()?;
            let inserted = !row_exists(&tx, "factories", factory.id.0)?
                && tx
                    .execute(
                        "INSERT INTO factories(id, name, operating_system_id, last_poll)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            factory.id.0,
                            factory.name,
                            factory.operating_system_id.0,
                            last_poll
                        ],
                    )
                    .with_context(|| format!("failed to insert factory {}", factory.id))?
                    == 1;
            summary.count(inserted);
        }

        for browser in &catalog.browsers {
            for feature in Feature::ALL {
                if let Some(feature_id) = browser.feature_id(feature) {
                    ensure_feature_kind(&tx, feature_id, feature)?;
                }
            }
            let inserted = !row_exists(&tx, "browsers", browser.id.0)?
                && tx
                    .execute(
                        "INSERT INTO browsers(
                            id, factory_id, browser_group_id, version, javascript_id, java_id, flash_id
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            browser.id.0,
                            browser.factory_id.0,
                            browser.browser_group_id.0,
                            browser.version,
                            browser.javascript_id.map(|id| id.0),
                            browser.java_id.map(|id| id.0),
                            browser.flash_id.map(|id| id.0),
                        ],
                    )
                    .with_context(|| format!("failed to insert browser {}", browser.id))?
                    == 1;
            summary.count(inserted);
        }

        for size in &catalog.screen_sizes {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO screen_sizes(factory_id, width, height) VALUES (?1, ?2, ?3)",
                    params![size.factory_id.0, size.width, size.height],
                )
                .with_context(|| format!("failed to insert screen size for {}", size.factory_id))?
                == 1;
            summary.count(inserted);
        }

        for depth in &catalog.color_depths {
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO color_depths(factory_id, bits_per_pixel) VALUES (?1, ?2)",
                    params![depth.factory_id.0, depth.bits_per_pixel],
                )
                .with_context(|| format!("failed to insert color depth for {}", depth.factory_id))?
                == 1;
            summary.count(inserted);
        }

        for website in &catalog.websites {
            let inserted = !row_exists(&tx, "websites", website.id.0)?
                && tx
                    .execute(
                        "INSERT INTO websites(id, url) VALUES (?1, ?2)",
                        params![website.id.0, website.url],
                    )
                    .with_context(|| format!("failed to insert website {}", website.id))?
                    == 1;
            summary.count(inserted);
        }

        tx.commit().context("failed to commit catalog transaction")?;
        info!(
            imported = summary.imported_rows,
            skipped = summary.skipped_existing_rows,
            "imported catalog"
        );
        Ok(summary)
    }

    /// Record that a factory asked for work at `at`.
    ///
    /// # Errors
    /// Returns an error when the factory does not exist or the update fails.
    pub fn record_poll(&mut self, factory_id: FactoryId, at: OffsetDateTime) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE factories SET last_poll = ?1 WHERE id = ?2",
                params![rfc3339(at)?, factory_id.0],
            )
            .context("failed to record factory poll")?;
        if updated == 0 {
            return Err(anyhow!(ShotError::NotFound(format!("factory {factory_id}"))));
        }
        Ok(())
    }

    /// Persist one uploaded screenshot; the store assigns its identifier.
    ///
    /// # Errors
    /// Returns an error when validation fails, a reference does not resolve, the browser does
    /// not belong to the factory, or the insert fails.
    pub fn add_screenshot(
        &mut self,
        screenshot: &NewScreenshot,
        uploaded: OffsetDateTime,
    ) -> Result<Screenshot> {
        screenshot
            .validate()
            .map_err(|err| anyhow::Error::new(err).context("screenshot validation failed"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        if !row_exists(&tx, "websites", screenshot.website_id.0)? {
            return Err(anyhow!(ShotError::Validation(format!(
                "website does not exist: {}",
                screenshot.website_id
            ))));
        }
        let taken = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM screenshots WHERE hashkey = ?1)",
                params![screenshot.hashkey],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to look up screenshot hashkey")?;
        if taken != 0 {
            return Err(anyhow!(ShotError::Validation(format!(
                "hashkey is already taken: {}",
                screenshot.hashkey
            ))));
        }
        let browser_factory = tx
            .query_row(
                "SELECT factory_id FROM browsers WHERE id = ?1",
                params![screenshot.browser_id.0],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to look up screenshot browser")?
            .ok_or_else(|| {
                anyhow!(ShotError::Validation(format!(
                    "browser does not exist: {}",
                    screenshot.browser_id
                )))
            })?;
        if browser_factory != screenshot.factory_id.0 {
            return Err(anyhow!(ShotError::Validation(format!(
                "browser {} is installed on factory {browser_factory}, not {}",
                screenshot.browser_id, screenshot.factory_id
            ))));
        }

        tx.execute(
            "INSERT INTO screenshots(hashkey, website_id, factory_id, browser_id, width, height, uploaded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                screenshot.hashkey,
                screenshot.website_id.0,
                screenshot.factory_id.0,
                screenshot.browser_id.0,
                screenshot.width,
                screenshot.height,
                rfc3339(uploaded)?,
            ],
        )
        .context("failed to insert screenshot")?;
        let id = ScreenshotId(tx.last_insert_rowid());
        tx.commit().context("failed to commit screenshot transaction")?;

        debug!(screenshot_id = %id, hashkey = %screenshot.hashkey, "stored screenshot");
        Ok(Screenshot {
            id,
            hashkey: screenshot.hashkey.clone(),
            website_id: screenshot.website_id,
            factory_id: screenshot.factory_id,
            browser_id: screenshot.browser_id,
            width: screenshot.width,
            height: screenshot.height,
            uploaded: to_utc(uploaded),
        })
    }

    /// Delete a screenshot and its problem reports. Returns whether a row was removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_screenshot(&mut self, id: ScreenshotId) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let deleted = tx
            .execute("DELETE FROM screenshots WHERE id = ?1", params![id.0])
            .context("failed to delete screenshot")?;
        tx.commit().context("failed to commit delete transaction")?;
        if deleted > 0 {
            info!(screenshot_id = %id, "deleted screenshot");
        }
        Ok(deleted > 0)
    }

    /// Persist one problem report against an existing screenshot.
    ///
    /// # Errors
    /// Returns an error when validation fails or the screenshot does not exist.
    pub fn add_problem_report(
        &mut self,
        report: &NewProblemReport,
        reported: OffsetDateTime,
    ) -> Result<ProblemReport> {
        report
            .validate()
            .map_err(|err| anyhow::Error::new(err).context("problem report validation failed"))?;

        let tx = self.conn.transaction().context("failed to start transaction")?;
        if !row_exists(&tx, "screenshots", report.screenshot_id.0)? {
            return Err(anyhow!(ShotError::NotFound(format!(
                "screenshot {}",
                report.screenshot_id
            ))));
        }
        tx.execute(
            "INSERT INTO problem_reports(screenshot_id, code, message, reported, ip)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report.screenshot_id.0,
                report.code,
                report.message,
                rfc3339(reported)?,
                report.ip.to_string(),
            ],
        )
        .context("failed to insert problem report")?;
        let id = ProblemReportId(tx.last_insert_rowid());
        tx.commit().context("failed to commit problem report transaction")?;

        Ok(ProblemReport {
            id,
            screenshot_id: report.screenshot_id,
            code: report.code,
            message: report.message.clone(),
            reported: to_utc(reported),
            ip: report.ip,
        })
    }

    /// Queries bound to this connection, outside any explicit transaction.
    #[must_use]
    pub fn queries(&self) -> SqliteQueries<'_> {
        SqliteQueries { conn: &self.conn }
    }

    /// Run several reads against one consistent snapshot.
    ///
    /// # Errors
    /// Returns an error when the read transaction cannot be opened, or the closure fails.
    pub fn read_snapshot<T>(&self, read: impl FnOnce(&SqliteQueries<'_>) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction().context("failed to start read transaction")?;
        let value = read(&SqliteQueries { conn: &tx })?;
        tx.commit().context("failed to finish read transaction")?;
        Ok(value)
    }

    /// Run quick-check, foreign-key-check, and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let quick_check_ok = quick_check_message == "ok";
        if !quick_check_ok || !foreign_key_violations.is_empty() {
            warn!(
                quick_check = %quick_check_message,
                foreign_key_violations = foreign_key_violations.len(),
                "integrity check found problems"
            );
        }
        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

/// SQL implementation of [`ScreenshotQueries`] plus the lookups screenshot pages need.
pub struct SqliteQueries<'c> {
    conn: &'c Connection,
}

impl SqliteQueries<'_> {
    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn screenshot(&self, id: ScreenshotId) -> Result<Option<Screenshot>> {
        let sql = format!("SELECT {SCREENSHOT_COLUMNS} FROM screenshots AS s WHERE s.id = :id");
        self.conn
            .query_row(&sql, named_params! { ":id": id.0 }, |row| Ok(screenshot_from_row(row)))
            .optional()
            .context("failed to load screenshot")?
            .transpose()
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn screenshot_by_hashkey(&self, hashkey: &str) -> Result<Option<Screenshot>> {
        let sql =
            format!("SELECT {SCREENSHOT_COLUMNS} FROM screenshots AS s WHERE s.hashkey = :hashkey");
        self.conn
            .query_row(&sql, named_params! { ":hashkey": hashkey }, |row| {
                Ok(screenshot_from_row(row))
            })
            .optional()
            .context("failed to load screenshot by hashkey")?
            .transpose()
    }

    /// Load a screenshot together with its website, browser, operating system and platform.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or a row cannot be decoded.
    pub fn screenshot_context(&self, id: ScreenshotId) -> Result<Option<ScreenshotContext>> {
        let sql = format!(
            "SELECT {SCREENSHOT_COLUMNS},
                w.url AS website_url,
                b.factory_id AS browser_factory_id,
                b.version AS browser_version,
                g.id AS browser_group_id,
                g.name AS browser_group_name,
                js.version AS javascript,
                jv.version AS java,
                fl.version AS flash,
                o.id AS operating_system_id,
                o.platform_id AS platform_id,
                o.name AS operating_system_name,
                o.version AS operating_system_version,
                o.codename AS codename,
                o.maker AS maker,
                p.name AS platform_name,
                p.position AS platform_position
             FROM screenshots AS s
             JOIN websites AS w ON w.id = s.website_id
             JOIN browsers AS b ON b.id = s.browser_id
             JOIN browser_groups AS g ON g.id = b.browser_group_id
             LEFT JOIN feature_versions AS js ON js.id = b.javascript_id
             LEFT JOIN feature_versions AS jv ON jv.id = b.java_id
             LEFT JOIN feature_versions AS fl ON fl.id = b.flash_id
             JOIN factories AS f ON f.id = s.factory_id
             JOIN operating_systems AS o ON o.id = f.operating_system_id
             JOIN platforms AS p ON p.id = o.platform_id
             WHERE s.id = :id"
        );

        self.conn
            .query_row(&sql, named_params! { ":id": id.0 }, |row| Ok(context_from_row(row)))
            .optional()
            .context("failed to load screenshot context")?
            .transpose()
    }

    /// # Errors
    /// Returns an error when the lookup fails or the row cannot be decoded.
    pub fn problem_report(&self, id: ProblemReportId) -> Result<Option<ProblemReport>> {
        self.conn
            .query_row(
                "SELECT id, screenshot_id, code, message, reported, ip
                 FROM problem_reports WHERE id = :id",
                named_params! { ":id": id.0 },
                |row| Ok(problem_report_from_row(row)),
            )
            .optional()
            .context("failed to load problem report")?
            .transpose()
    }

    /// Problem reports filed against one screenshot, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn problem_reports_for(&self, screenshot_id: ScreenshotId) -> Result<Vec<ProblemReport>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, screenshot_id, code, message, reported, ip
             FROM problem_reports
             WHERE screenshot_id = :screenshot_id
             ORDER BY reported DESC, id DESC",
        )?;
        let rows = stmt.query_map(named_params! { ":screenshot_id": screenshot_id.0 }, |row| {
            Ok(problem_report_from_row(row))
        })?;

        let mut reports = Vec::new();
        for row in rows {
            reports.push(row??);
        }
        Ok(reports)
    }

    /// Factories that polled for work after `cutoff`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or a timestamp is malformed.
    pub fn active_factories(&self, cutoff: OffsetDateTime) -> Result<Vec<Factory>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, operating_system_id, last_poll
             FROM factories
             WHERE last_poll IS NOT NULL
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>("id")?,
                row.get::<_, String>("name")?,
                row.get::<_, i64>("operating_system_id")?,
                row.get::<_, String>("last_poll")?,
            ))
        })?;

        let mut factories = Vec::new();
        for row in rows {
            let (id, name, operating_system_id, last_poll) = row?;
            let last_poll = parse_rfc3339(&last_poll)?;
            if last_poll > cutoff {
                factories.push(Factory {
                    id: FactoryId(id),
                    name,
                    operating_system_id: OperatingSystemId(operating_system_id),
                    last_poll: Some(last_poll),
                });
            }
        }
        debug!(cutoff = %cutoff, active = factories.len(), "resolved active factories");
        Ok(factories)
    }

    /// Screen widths supported by any of `factories`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn screen_size_choices(&self, factories: &[FactoryId]) -> Result<Vec<Choice>> {
        let widths = self.distinct_for_factories(
            "SELECT DISTINCT width FROM screen_sizes WHERE factory_id IN ({ids}) ORDER BY width",
            factories,
        )?;
        Ok(screen_size_choices(widths))
    }

    /// Color depths supported by any of `factories`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn color_depth_choices(&self, factories: &[FactoryId]) -> Result<Vec<Choice>> {
        let depths = self.distinct_for_factories(
            "SELECT DISTINCT bits_per_pixel FROM color_depths
             WHERE factory_id IN ({ids}) ORDER BY bits_per_pixel",
            factories,
        )?;
        Ok(color_depth_choices(depths))
    }

    /// Versions of `feature` installed on at least one browser of `factories`.
    ///
    /// "enabled" is offered when any browser has a version other than "disabled".
    ///
    /// # Errors
    /// Returns an error when the queries fail.
    pub fn feature_choices(&self, feature: Feature, factories: &[FactoryId]) -> Result<Vec<Choice>> {
        let mut stmt = self.conn.prepare(
            "SELECT version FROM feature_versions WHERE feature = :feature ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(named_params! { ":feature": feature.as_str() }, |row| {
                row.get::<_, String>("version")
            })?;
        let mut versions = Vec::new();
        for row in rows {
            versions.push(row?);
        }

        let installed = self.installed_feature_versions(feature, factories)?;
        let any_enabled = installed.iter().any(|version| version != "disabled");
        let offered = versions
            .iter()
            .filter(|version| match version.as_str() {
                "enabled" => any_enabled,
                other => installed.contains(other),
            })
            .map(String::as_str);
        Ok(feature_choices(offered))
    }

    fn installed_feature_versions(
        &self,
        feature: Feature,
        factories: &[FactoryId],
    ) -> Result<BTreeSet<String>> {
        if factories.is_empty() {
            return Ok(BTreeSet::new());
        }
        let column = match feature {
            Feature::Javascript => "javascript_id",
            Feature::Java => "java_id",
            Feature::Flash => "flash_id",
        };
        let sql = format!(
            "SELECT DISTINCT fv.version AS version
             FROM browsers AS b
             JOIN feature_versions AS fv ON fv.id = b.{column}
             WHERE b.factory_id IN ({})",
            placeholders(factories.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(factories.iter().map(|id| id.0)), |row| {
            row.get::<_, String>("version")
        })?;

        let mut versions = BTreeSet::new();
        for row in rows {
            versions.insert(row?);
        }
        Ok(versions)
    }

    fn distinct_for_factories(&self, template: &str, factories: &[FactoryId]) -> Result<Vec<u32>> {
        if factories.is_empty() {
            return Ok(Vec::new());
        }
        let sql = template.replace("{ids}", &placeholders(factories.len()));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(factories.iter().map(|id| id.0)), |row| {
                row.get::<_, u32>(0)
            })?;

        let mut values = Vec::new();
        for row in rows {
            values.push(row?);
        }
        Ok(values)
    }

    fn one_filtered(
        &self,
        condition: &str,
        order: &str,
        reference: Option<ScreenshotId>,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>> {
        let sql = format!(
            "SELECT {SCREENSHOT_COLUMNS} {FILTERED_SCREENSHOTS} {condition} ORDER BY s.id {order} LIMIT 1"
        );
        let (website_id, browser_group_id, platform_id) = filter_params(filter);
        let row = match reference {
            Some(reference) => self.conn.query_row(
                &sql,
                named_params! {
                    ":website_id": website_id,
                    ":browser_group_id": browser_group_id,
                    ":platform_id": platform_id,
                    ":reference": reference.0,
                },
                |row| Ok(screenshot_from_row(row)),
            ),
            None => self.conn.query_row(
                &sql,
                named_params! {
                    ":website_id": website_id,
                    ":browser_group_id": browser_group_id,
                    ":platform_id": platform_id,
                },
                |row| Ok(screenshot_from_row(row)),
            ),
        };
        row.optional().context("failed to run navigation query")?.transpose()
    }

    fn count_filtered(
        &self,
        reference: Option<ScreenshotId>,
        filter: &NavigationFilter,
    ) -> Result<u64> {
        let (website_id, browser_group_id, platform_id) = filter_params(filter);
        let count = match reference {
            Some(reference) => self.conn.query_row(
                &format!("SELECT COUNT(*) {FILTERED_SCREENSHOTS} AND s.id < :reference"),
                named_params! {
                    ":website_id": website_id,
                    ":browser_group_id": browser_group_id,
                    ":platform_id": platform_id,
                    ":reference": reference.0,
                },
                |row| row.get::<_, i64>(0),
            ),
            None => self.conn.query_row(
                &format!("SELECT COUNT(*) {FILTERED_SCREENSHOTS}"),
                named_params! {
                    ":website_id": website_id,
                    ":browser_group_id": browser_group_id,
                    ":platform_id": platform_id,
                },
                |row| row.get::<_, i64>(0),
            ),
        }
        .context("failed to count screenshots")?;
        u64::try_from(count).context("negative screenshot count")
    }
}

impl ScreenshotQueries for SqliteQueries<'_> {
    type Error = anyhow::Error;

    fn latest_per_group(&self, max_results: usize) -> Result<Vec<Screenshot>> {
        let limit = i64::try_from(max_results).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {SCREENSHOT_COLUMNS}
             FROM screenshots AS s
             JOIN (
               SELECT MAX(id) AS maximum
               FROM screenshots
               GROUP BY website_id
               ORDER BY maximum DESC
               LIMIT :limit
             ) AS latest ON latest.maximum = s.id
             ORDER BY s.id DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(named_params! { ":limit": limit }, |row| {
            Ok(screenshot_from_row(row))
        })?;

        let mut screenshots = Vec::new();
        for row in rows {
            screenshots.push(row??);
        }
        debug!(limit, returned = screenshots.len(), "loaded latest screenshot per website");
        Ok(screenshots)
    }

    fn first(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>> {
        self.one_filtered("", "ASC", None, filter)
    }

    fn previous(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>> {
        self.one_filtered("AND s.id < :reference", "DESC", Some(reference), filter)
    }

    fn next(&self, reference: ScreenshotId, filter: &NavigationFilter) -> Result<Option<Screenshot>> {
        self.one_filtered("AND s.id > :reference", "ASC", Some(reference), filter)
    }

    fn last(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>> {
        self.one_filtered("", "DESC", None, filter)
    }

    fn count(&self, filter: &NavigationFilter) -> Result<u64> {
        self.count_filtered(None, filter)
    }

    fn count_before(&self, reference: ScreenshotId, filter: &NavigationFilter) -> Result<u64> {
        self.count_filtered(Some(reference), filter)
    }
}

/// Read a catalog JSON document from disk.
///
/// # Errors
/// Returns an error when the file cannot be read or is not a valid catalog.
pub fn read_catalog_file(path: &Path) -> Result<Catalog> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read catalog file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse catalog JSON {}", path.display()))
}

fn filter_params(filter: &NavigationFilter) -> (Option<i64>, Option<i64>, Option<i64>) {
    (
        filter.website_id.map(|id| id.0),
        filter.browser_group_id.map(|id| id.0),
        filter.platform_id.map(|id| id.0),
    )
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

// Row decoding returns `anyhow::Result` nested inside the rusqlite result so timestamp and
// address parse failures keep their context.
fn screenshot_from_row(row: &Row<'_>) -> Result<Screenshot> {
    Ok(Screenshot {
        id: ScreenshotId(row.get("id")?),
        hashkey: row.get("hashkey")?,
        website_id: WebsiteId(row.get("website_id")?),
        factory_id: FactoryId(row.get("factory_id")?),
        browser_id: BrowserId(row.get("browser_id")?),
        width: row.get("width")?,
        height: row.get("height")?,
        uploaded: parse_rfc3339(&row.get::<_, String>("uploaded")?)?,
    })
}

fn context_from_row(row: &Row<'_>) -> Result<ScreenshotContext> {
    let screenshot = screenshot_from_row(row)?;
    let platform_id = PlatformId(row.get("platform_id")?);
    Ok(ScreenshotContext {
        website: Website { id: screenshot.website_id, url: row.get("website_url")? },
        browser: BrowserDescriptor {
            id: screenshot.browser_id,
            factory_id: FactoryId(row.get("browser_factory_id")?),
            browser_group: BrowserGroup {
                id: BrowserGroupId(row.get("browser_group_id")?),
                name: row.get("browser_group_name")?,
            },
            version: row.get("browser_version")?,
            javascript: row.get("javascript")?,
            java: row.get("java")?,
            flash: row.get("flash")?,
        },
        operating_system: OperatingSystem {
            id: OperatingSystemId(row.get("operating_system_id")?),
            platform_id,
            name: row.get("operating_system_name")?,
            version: row.get("operating_system_version")?,
            codename: row.get("codename")?,
            maker: row.get("maker")?,
        },
        platform: Platform {
            id: platform_id,
            name: row.get("platform_name")?,
            position: row.get("platform_position")?,
        },
        screenshot,
    })
}

fn problem_report_from_row(row: &Row<'_>) -> Result<ProblemReport> {
    let ip_raw: String = row.get("ip")?;
    Ok(ProblemReport {
        id: ProblemReportId(row.get("id")?),
        screenshot_id: ScreenshotId(row.get("screenshot_id")?),
        code: row.get("code")?,
        message: row.get("message")?,
        reported: parse_rfc3339(&row.get::<_, String>("reported")?)?,
        ip: IpAddr::from_str(&ip_raw).with_context(|| format!("invalid IP address: {ip_raw}"))?,
    })
}

fn ensure_feature_kind(
    conn: &Connection,
    feature_id: FeatureVersionId,
    expected: Feature,
) -> Result<()> {
    let actual = conn
        .query_row(
            "SELECT feature FROM feature_versions WHERE id = ?1",
            params![feature_id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to look up feature version")?
        .ok_or_else(|| anyhow!("feature version does not exist: {feature_id}"))?;
    if actual != expected.as_str() {
        return Err(anyhow!(
            "feature version {feature_id} is a {actual} version, expected {}",
            expected.as_str()
        ));
    }
    Ok(())
}

fn row_exists(conn: &Connection, table: &str, id: i64) -> Result<bool> {
    let exists = conn
        .query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"), params![id], |row| {
            row.get::<_, i64>(0)
        })
        .with_context(|| format!("failed to check if {table} row {id} exists"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_utc(value: OffsetDateTime) -> OffsetDateTime {
    value.to_offset(UtcOffset::UTC)
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    to_utc(value)
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
