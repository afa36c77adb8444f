use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use shotserver_api::{
    AddScreenshotRequest, ChoiceKind, ReportProblemRequest, ShotserverApi,
};
use shotserver_core::{
    BrowserId, FactoryId, Feature, NavigationScope, ProblemReportId, WebsiteId,
    RECENT_SCREENSHOTS_LIMIT,
};
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "shots")]
#[command(about = "Screenshot server read model CLI")]
struct Cli {
    #[arg(long, env = "SHOTSERVER_DB", default_value = "./shotserver.sqlite3")]
    db: PathBuf,

    /// Factories that polled within this many seconds count as active.
    #[arg(long, env = "SHOTSERVER_POLL_WINDOW_SECS", default_value_t = 600)]
    poll_window_secs: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Screenshot {
        #[command(subcommand)]
        command: Box<ScreenshotCommand>,
    },
    Problem {
        #[command(subcommand)]
        command: Box<ProblemCommand>,
    },
    Choices {
        #[command(subcommand)]
        command: Box<ChoicesCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Import(CatalogImportArgs),
    /// Record that a factory asked for work.
    Poll(CatalogPollArgs),
}

#[derive(Debug, Args)]
struct CatalogImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct CatalogPollArgs {
    #[arg(long)]
    factory: i64,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ScreenshotCommand {
    Add(ScreenshotAddArgs),
    Recent(ScreenshotRecentArgs),
    Show(HashkeyArgs),
    Navigate(ScreenshotNavigateArgs),
    Delete(HashkeyArgs),
}

#[derive(Debug, Args)]
struct ScreenshotAddArgs {
    #[arg(long)]
    hashkey: String,
    #[arg(long)]
    website: i64,
    #[arg(long)]
    factory: i64,
    #[arg(long)]
    browser: i64,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long)]
    uploaded: Option<String>,
}

#[derive(Debug, Args)]
struct ScreenshotRecentArgs {
    #[arg(long = "recent-limit", alias = "limit", default_value_t = RECENT_SCREENSHOTS_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct HashkeyArgs {
    #[arg(long)]
    hashkey: String,
}

#[derive(Debug, Args)]
struct ScreenshotNavigateArgs {
    #[arg(long)]
    hashkey: String,
    /// Without a scope, print the rows the detail page shows.
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,
}

#[derive(Debug, Subcommand)]
enum ProblemCommand {
    Add(ProblemAddArgs),
    Explain(ProblemExplainArgs),
    List(HashkeyArgs),
}

#[derive(Debug, Args)]
struct ProblemAddArgs {
    #[arg(long)]
    hashkey: String,
    #[arg(long)]
    code: i64,
    #[arg(long)]
    message: Option<String>,
    #[arg(long)]
    ip: IpAddr,
    #[arg(long)]
    reported: Option<String>,
}

#[derive(Debug, Args)]
struct ProblemExplainArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum ChoicesCommand {
    ScreenSizes,
    ColorDepths,
    Features(ChoicesFeatureArgs),
}

#[derive(Debug, Args)]
struct ChoicesFeatureArgs {
    #[arg(long, value_enum)]
    feature: FeatureArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Website,
    BrowserGroup,
    Platform,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FeatureArg {
    Javascript,
    Java,
    Flash,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T, what: &str) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening screenshot database");
    let api = ShotserverApi::new(cli.db)
        .with_poll_window(time::Duration::seconds(i64::from(cli.poll_window_secs)));
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Catalog { command } => run_catalog(*command, &api),
        Command::Screenshot { command } => run_screenshot(*command, &api),
        Command::Problem { command } => run_problem(*command, &api),
        Command::Choices { command } => run_choices(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &ShotserverApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?, "migration result"),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?, "integrity report"),
    }
}

fn run_catalog(command: CatalogCommand, api: &ShotserverApi) -> Result<()> {
    match command {
        CatalogCommand::Import(args) => {
            let summary = api.import_catalog(&args.input)?;
            emit_json(serde_json::json!({
                "input": args.input.display().to_string(),
                "imported_rows": summary.imported_rows,
                "skipped_existing_rows": summary.skipped_existing_rows
            }))
        }
        CatalogCommand::Poll(args) => {
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            api.record_poll(FactoryId(args.factory), Some(at))?;
            emit_json(serde_json::json!({
                "factory_id": args.factory,
                "last_poll": format_rfc3339(at)?
            }))
        }
    }
}

fn run_screenshot(command: ScreenshotCommand, api: &ShotserverApi) -> Result<()> {
    match command {
        ScreenshotCommand::Add(args) => {
            let screenshot = api.add_screenshot(AddScreenshotRequest {
                hashkey: args.hashkey,
                website_id: WebsiteId(args.website),
                factory_id: FactoryId(args.factory),
                browser_id: BrowserId(args.browser),
                width: args.width,
                height: args.height,
                uploaded: Some(parse_optional_rfc3339(args.uploaded.as_deref())?),
            })?;
            emit(&screenshot, "screenshot")
        }
        ScreenshotCommand::Recent(args) => {
            let screenshots = api.recent(Some(args.limit))?;
            emit_json(serde_json::json!({
                "limit": args.limit,
                "screenshots": screenshots
            }))
        }
        ScreenshotCommand::Show(args) => emit(&api.screenshot_page(&args.hashkey)?, "screenshot page"),
        ScreenshotCommand::Navigate(args) => match args.scope {
            Some(scope) => emit(&api.navigate(&args.hashkey, scope.into_scope())?, "navigation"),
            None => {
                let rows = api.navigation(&args.hashkey)?;
                emit_json(serde_json::json!({ "hashkey": args.hashkey, "rows": rows }))
            }
        },
        ScreenshotCommand::Delete(args) => emit(&api.delete_screenshot(&args.hashkey)?, "delete result"),
    }
}

fn run_problem(command: ProblemCommand, api: &ShotserverApi) -> Result<()> {
    match command {
        ProblemCommand::Add(args) => {
            let report = api.report_problem(ReportProblemRequest {
                hashkey: args.hashkey,
                code: args.code,
                message: args.message,
                ip: args.ip,
                reported: Some(parse_optional_rfc3339(args.reported.as_deref())?),
            })?;
            emit(&report, "problem report")
        }
        ProblemCommand::Explain(args) => {
            emit(&api.explain_problem(ProblemReportId(args.id))?, "problem explanation")
        }
        ProblemCommand::List(args) => {
            let problems = api.problems(&args.hashkey)?;
            emit_json(serde_json::json!({ "hashkey": args.hashkey, "problems": problems }))
        }
    }
}

fn run_choices(command: ChoicesCommand, api: &ShotserverApi) -> Result<()> {
    let kind = match command {
        ChoicesCommand::ScreenSizes => ChoiceKind::ScreenSizes,
        ChoicesCommand::ColorDepths => ChoiceKind::ColorDepths,
        ChoicesCommand::Features(args) => ChoiceKind::Feature(args.feature.into_feature()),
    };
    emit(&api.choices(kind)?, "choices")
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

impl ScopeArg {
    fn into_scope(self) -> NavigationScope {
        match self {
            Self::Website => NavigationScope::Website,
            Self::BrowserGroup => NavigationScope::BrowserGroup,
            Self::Platform => NavigationScope::Platform,
        }
    }
}

impl FeatureArg {
    fn into_feature(self) -> Feature {
        match self {
            Self::Javascript => Feature::Javascript,
            Self::Java => Feature::Java,
            Self::Flash => Feature::Flash,
        }
    }
}
