use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Default cap for the "recent screenshots" feed.
pub const RECENT_SCREENSHOTS_LIMIT: usize = 60;

/// Choice value meaning "no preference" in selection forms.
pub const DONT_CARE: &str = "dontcare";

pub const HASHKEY_MAX_LEN: usize = 32;
pub const PROBLEM_MESSAGE_MAX_LEN: usize = 200;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ShotError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("not found: {0}")]
    NotFound(String),
}

macro_rules! integer_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(ScreenshotId);
integer_id!(WebsiteId);
integer_id!(FactoryId);
integer_id!(BrowserId);
integer_id!(BrowserGroupId);
integer_id!(PlatformId);
integer_id!(OperatingSystemId);
integer_id!(FeatureVersionId);
integer_id!(ProblemReportId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Javascript,
    Java,
    Flash,
}

impl Feature {
    pub const ALL: [Self; 3] = [Self::Javascript, Self::Java, Self::Flash];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Javascript => "javascript",
            Self::Java => "java",
            Self::Flash => "flash",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "javascript" => Some(Self::Javascript),
            "java" => Some(Self::Java),
            "flash" => Some(Self::Flash),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Platform {
    pub id: PlatformId,
    pub name: String,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OperatingSystem {
    pub id: OperatingSystemId,
    pub platform_id: PlatformId,
    pub name: String,
    pub version: String,
    pub codename: String,
    pub maker: String,
}

impl OperatingSystem {
    /// Name and version without the codename, e.g. "Ubuntu 7.04".
    #[must_use]
    pub fn short_name(&self) -> String {
        join_non_empty(&[&self.name, &self.version])
    }
}

impl Display for OperatingSystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let short = self.short_name();
        if self.codename.trim().is_empty() {
            write!(f, "{short}")
        } else {
            write!(f, "{short} ({})", self.codename)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BrowserGroup {
    pub id: BrowserGroupId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FeatureVersion {
    pub id: FeatureVersionId,
    pub feature: Feature,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Factory {
    pub id: FactoryId,
    pub name: String,
    pub operating_system_id: OperatingSystemId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Browser {
    pub id: BrowserId,
    pub factory_id: FactoryId,
    pub browser_group_id: BrowserGroupId,
    pub version: String,
    #[serde(default)]
    pub javascript_id: Option<FeatureVersionId>,
    #[serde(default)]
    pub java_id: Option<FeatureVersionId>,
    #[serde(default)]
    pub flash_id: Option<FeatureVersionId>,
}

impl Browser {
    #[must_use]
    pub fn feature_id(&self, feature: Feature) -> Option<FeatureVersionId> {
        match feature {
            Feature::Javascript => self.javascript_id,
            Feature::Java => self.java_id,
            Feature::Flash => self.flash_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScreenSize {
    pub factory_id: FactoryId,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColorDepth {
    pub factory_id: FactoryId,
    pub bits_per_pixel: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Website {
    pub id: WebsiteId,
    pub url: String,
}

/// A browser installation resolved together with its group and feature versions.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BrowserDescriptor {
    pub id: BrowserId,
    pub factory_id: FactoryId,
    pub browser_group: BrowserGroup,
    pub version: String,
    pub javascript: Option<String>,
    pub java: Option<String>,
    pub flash: Option<String>,
}

impl BrowserDescriptor {
    #[must_use]
    pub fn feature(&self, feature: Feature) -> Option<&str> {
        match feature {
            Feature::Javascript => self.javascript.as_deref(),
            Feature::Java => self.java.as_deref(),
            Feature::Flash => self.flash.as_deref(),
        }
    }
}

impl Display for BrowserDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", join_non_empty(&[&self.browser_group.name, &self.version]))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PngSize {
    Original,
    Width(u32),
}

impl Display for PngSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Original => write!(f, "original"),
            Self::Width(width) => write!(f, "{width}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Screenshot {
    pub id: ScreenshotId,
    pub hashkey: String,
    pub website_id: WebsiteId,
    pub factory_id: FactoryId,
    pub browser_id: BrowserId,
    pub width: u32,
    pub height: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded: OffsetDateTime,
}

impl Screenshot {
    #[must_use]
    pub fn absolute_url(&self) -> String {
        format!("/screenshots/{}/", self.hashkey)
    }

    /// Image URL for one stored size; files are sharded by the first two hashkey characters.
    #[must_use]
    pub fn png_url(&self, size: PngSize) -> String {
        let shard = self.hashkey.get(..2).unwrap_or(&self.hashkey);
        format!("/png/{size}/{shard}/{}.png", self.hashkey)
    }

    #[must_use]
    pub fn large_url(&self) -> String {
        self.png_url(PngSize::Width(512))
    }

    /// Height of a preview scaled to `width`, keeping the aspect ratio.
    #[must_use]
    pub fn scaled_height(&self, width: u32) -> u32 {
        if self.width == 0 {
            return 0;
        }
        let scaled = u64::from(self.height) * u64::from(width) / u64::from(self.width);
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewScreenshot {
    pub hashkey: String,
    pub website_id: WebsiteId,
    pub factory_id: FactoryId,
    pub browser_id: BrowserId,
    pub width: u32,
    pub height: u32,
}

impl NewScreenshot {
    /// # Errors
    /// Returns [`ShotError::Validation`] for a malformed hashkey or empty dimensions.
    pub fn validate(&self) -> Result<(), ShotError> {
        validate_hashkey(&self.hashkey)?;
        if self.width == 0 || self.height == 0 {
            return Err(ShotError::Validation(
                "screenshot width and height MUST be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Hashkeys are slugs of at most 32 characters.
///
/// # Errors
/// Returns [`ShotError::Validation`] when the hashkey is empty, too long, or not a slug.
pub fn validate_hashkey(hashkey: &str) -> Result<(), ShotError> {
    if hashkey.is_empty() || hashkey.len() > HASHKEY_MAX_LEN {
        return Err(ShotError::Validation(format!(
            "hashkey MUST be 1..={HASHKEY_MAX_LEN} characters"
        )));
    }
    if !hashkey.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ShotError::Validation(format!("hashkey is not a slug: {hashkey}")));
    }
    Ok(())
}

/// User-friendly file name for a screenshot inside a download archive.
#[must_use]
pub fn png_filename(
    uploaded: OffsetDateTime,
    browser: &str,
    operating_system: &str,
    hashkey: &str,
) -> String {
    let stamp = format!(
        "{:02}{:02}{:02}-{:02}{:02}{:02}",
        uploaded.year().rem_euclid(100),
        u8::from(uploaded.month()),
        uploaded.day(),
        uploaded.hour(),
        uploaded.minute(),
        uploaded.second(),
    );
    let joined = [stamp.as_str(), browser, operating_system, hashkey].join(" ");
    format!("{}.png", joined.to_lowercase().replace(' ', "-"))
}

/// A screenshot with the associations needed to describe it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScreenshotContext {
    pub screenshot: Screenshot,
    pub website: Website,
    pub browser: BrowserDescriptor,
    pub operating_system: OperatingSystem,
    pub platform: Platform,
}

impl ScreenshotContext {
    #[must_use]
    pub fn keys(&self) -> ScreenshotKeys {
        ScreenshotKeys {
            id: self.screenshot.id,
            website_id: self.screenshot.website_id,
            browser_group_id: self.browser.browser_group.id,
            platform_id: self.platform.id,
        }
    }

    #[must_use]
    pub fn png_filename(&self) -> String {
        png_filename(
            self.screenshot.uploaded,
            &self.browser.to_string(),
            &self.operating_system.short_name(),
            &self.screenshot.hashkey,
        )
    }
}

// ---------------------------------------------------------------------------
// Problem reports

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProblemReport {
    pub id: ProblemReportId,
    pub screenshot_id: ScreenshotId,
    pub code: i64,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reported: OffsetDateTime,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewProblemReport {
    pub screenshot_id: ScreenshotId,
    pub code: i64,
    pub message: String,
    pub ip: IpAddr,
}

impl NewProblemReport {
    /// # Errors
    /// Returns [`ShotError::Validation`] when the message is empty or too long.
    pub fn validate(&self) -> Result<(), ShotError> {
        if self.message.trim().is_empty() {
            return Err(ShotError::Validation("problem message MUST be provided".to_string()));
        }
        if self.message.chars().count() > PROBLEM_MESSAGE_MAX_LEN {
            return Err(ShotError::Validation(format!(
                "problem message MUST be at most {PROBLEM_MESSAGE_MAX_LEN} characters"
            )));
        }
        Ok(())
    }
}

#[must_use]
pub fn generic_problem_template(code: i64) -> Option<&'static str> {
    match code {
        101 => Some("This is not the requested browser."),
        102 => Some("This is not the requested operating system."),
        201 => Some("This is not the requested Javascript version."),
        202 => Some("This is not the requested Java version."),
        203 => Some("This is not the requested Flash version."),
        204 => Some("A language pack needs to be installed."),
        601 => Some("There is a dialog box in front of the browser window."),
        602 => Some("The browser window is not maximized."),
        603 => Some("The page is not finished loading."),
        _ => None,
    }
}

#[must_use]
pub fn explicit_problem_template(code: i64) -> Option<&'static str> {
    match code {
        101 => Some("This is not %(browser)s."),
        102 => Some("This is not %(operating_system)s."),
        201 => Some("Javascript is not %(javascript)s."),
        202 => Some("Java is not %(java)s."),
        203 => Some("Flash is not %(flash)s."),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Placeholder {
    Browser,
    OperatingSystem,
    Feature(Feature),
}

impl Placeholder {
    const ALL: [Self; 5] = [
        Self::Browser,
        Self::OperatingSystem,
        Self::Feature(Feature::Javascript),
        Self::Feature(Feature::Java),
        Self::Feature(Feature::Flash),
    ];

    fn token(self) -> &'static str {
        match self {
            Self::Browser => "%(browser)s",
            Self::OperatingSystem => "%(operating_system)s",
            Self::Feature(Feature::Javascript) => "%(javascript)s",
            Self::Feature(Feature::Java) => "%(java)s",
            Self::Feature(Feature::Flash) => "%(flash)s",
        }
    }

    fn resolve(self, context: &ScreenshotContext) -> Result<String, ShotError> {
        match self {
            Self::Browser => Ok(context.browser.to_string()),
            Self::OperatingSystem => Ok(context.operating_system.to_string()),
            Self::Feature(feature) => {
                context.browser.feature(feature).map(str::to_string).ok_or_else(|| {
                    ShotError::Integrity(format!(
                        "browser {} has no {} version",
                        context.browser.id,
                        feature.as_str()
                    ))
                })
            }
        }
    }
}

/// Generic message for a report, e.g. "This is not the requested browser."
#[must_use]
pub fn generic_message(report: &ProblemReport) -> String {
    generic_problem_template(report.code)
        .map_or_else(|| report.message.clone(), str::to_string)
}

/// Explicit message for a report, e.g. "This is not Firefox 3.0."
///
/// Placeholders are resolved only when the template contains them.
///
/// # Errors
/// Returns [`ShotError::Integrity`] when `context` describes a different screenshot or a
/// placeholder refers to an attribute the screenshot's browser does not have.
pub fn resolve_message(
    report: &ProblemReport,
    context: &ScreenshotContext,
) -> Result<String, ShotError> {
    let Some(template) = explicit_problem_template(report.code) else {
        return Ok(generic_message(report));
    };

    if report.screenshot_id != context.screenshot.id {
        return Err(ShotError::Integrity(format!(
            "problem report {} belongs to screenshot {}, not {}",
            report.id, report.screenshot_id, context.screenshot.id
        )));
    }

    fill_template(template, context)
}

/// Check that the explicit text of `code` can be built for the screenshot in `context`.
///
/// # Errors
/// Returns [`ShotError::Validation`] when the explicit template refers to an attribute the
/// screenshot's browser does not have.
pub fn check_problem_code(code: i64, context: &ScreenshotContext) -> Result<(), ShotError> {
    let Some(template) = explicit_problem_template(code) else {
        return Ok(());
    };
    fill_template(template, context).map(drop).map_err(|err| match err {
        ShotError::Integrity(reason) => ShotError::Validation(format!(
            "problem code {code} does not apply to screenshot {}: {reason}",
            context.screenshot.hashkey
        )),
        other => other,
    })
}

fn fill_template(template: &str, context: &ScreenshotContext) -> Result<String, ShotError> {
    let mut message = template.to_string();
    for placeholder in Placeholder::ALL {
        if message.contains(placeholder.token()) {
            let value = placeholder.resolve(context)?;
            message = message.replace(placeholder.token(), &value);
        }
    }
    Ok(message)
}

// ---------------------------------------------------------------------------
// Latest per group and navigation

/// The attributes navigation filters compare against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScreenshotKeys {
    pub id: ScreenshotId,
    pub website_id: WebsiteId,
    pub browser_group_id: BrowserGroupId,
    pub platform_id: PlatformId,
}

/// Conjunction of equality filters; an unset field matches everything.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavigationFilter {
    pub website_id: Option<WebsiteId>,
    pub browser_group_id: Option<BrowserGroupId>,
    pub platform_id: Option<PlatformId>,
}

impl NavigationFilter {
    #[must_use]
    pub fn website(website_id: WebsiteId) -> Self {
        Self { website_id: Some(website_id), ..Self::default() }
    }

    #[must_use]
    pub fn with_browser_group(mut self, browser_group_id: BrowserGroupId) -> Self {
        self.browser_group_id = Some(browser_group_id);
        self
    }

    #[must_use]
    pub fn with_platform(mut self, platform_id: PlatformId) -> Self {
        self.platform_id = Some(platform_id);
        self
    }

    #[must_use]
    pub fn matches(&self, keys: &ScreenshotKeys) -> bool {
        self.website_id.map_or(true, |id| id == keys.website_id)
            && self.browser_group_id.map_or(true, |id| id == keys.browser_group_id)
            && self.platform_id.map_or(true, |id| id == keys.platform_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NavigationScope {
    Website,
    BrowserGroup,
    Platform,
}

impl NavigationScope {
    pub const ALL: [Self; 3] = [Self::Website, Self::BrowserGroup, Self::Platform];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Website => "website",
            Self::BrowserGroup => "browser_group",
            Self::Platform => "platform",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "website" => Some(Self::Website),
            "browser_group" => Some(Self::BrowserGroup),
            "platform" => Some(Self::Platform),
            _ => None,
        }
    }

    #[must_use]
    pub fn filter_for(self, keys: &ScreenshotKeys) -> NavigationFilter {
        let filter = NavigationFilter::website(keys.website_id);
        match self {
            Self::Website => filter,
            Self::BrowserGroup => filter.with_browser_group(keys.browser_group_id),
            Self::Platform => filter.with_platform(keys.platform_id),
        }
    }

    #[must_use]
    pub fn min_count(self) -> u64 {
        match self {
            Self::Website => 1,
            Self::BrowserGroup | Self::Platform => 2,
        }
    }

    #[must_use]
    pub fn title(self, context: &ScreenshotContext) -> String {
        match self {
            Self::Website => "screenshots".to_string(),
            Self::BrowserGroup => format!("with {}", context.browser.browser_group.name),
            Self::Platform => format!("on {}", context.platform.name),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavigationLinks {
    pub first: Option<Screenshot>,
    pub previous: Option<Screenshot>,
    pub next: Option<Screenshot>,
    pub last: Option<Screenshot>,
}

impl NavigationLinks {
    /// Build links relative to `reference`; a link that points back at it is dropped.
    #[must_use]
    pub fn new(
        reference: ScreenshotId,
        first: Option<Screenshot>,
        previous: Option<Screenshot>,
        next: Option<Screenshot>,
        last: Option<Screenshot>,
    ) -> Self {
        Self {
            first: not_reference(reference, first),
            previous: not_reference(reference, previous),
            next: not_reference(reference, next),
            last: not_reference(reference, last),
        }
    }
}

fn not_reference(reference: ScreenshotId, candidate: Option<Screenshot>) -> Option<Screenshot> {
    candidate.filter(|screenshot| screenshot.id != reference)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavigationSummary {
    /// 1-based rank of the reference among the matches, by identifier.
    pub index: u64,
    pub total: u64,
    pub links: NavigationLinks,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NavigationRow {
    pub scope: NavigationScope,
    pub title: String,
    pub label: String,
    pub summary: NavigationSummary,
}

/// Read queries a screenshot store must answer. Identifier order stands in for time order.
pub trait ScreenshotQueries {
    type Error;

    /// The newest screenshot of each website, newest first, at most `max_results`.
    ///
    /// # Errors
    /// Propagates storage failures.
    fn latest_per_group(&self, max_results: usize) -> Result<Vec<Screenshot>, Self::Error>;

    /// # Errors
    /// Propagates storage failures.
    fn first(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>, Self::Error>;

    /// # Errors
    /// Propagates storage failures.
    fn previous(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>, Self::Error>;

    /// # Errors
    /// Propagates storage failures.
    fn next(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>, Self::Error>;

    /// # Errors
    /// Propagates storage failures.
    fn last(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>, Self::Error>;

    /// # Errors
    /// Propagates storage failures.
    fn count(&self, filter: &NavigationFilter) -> Result<u64, Self::Error>;

    /// Number of matches with an identifier strictly below `reference`.
    ///
    /// # Errors
    /// Propagates storage failures.
    fn count_before(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<u64, Self::Error>;
}

/// First, previous, next and last matches around `reference`.
///
/// # Errors
/// Propagates errors from `queries`.
pub fn navigation_links<Q: ScreenshotQueries + ?Sized>(
    queries: &Q,
    reference: ScreenshotId,
    filter: &NavigationFilter,
) -> Result<NavigationLinks, Q::Error> {
    Ok(NavigationLinks::new(
        reference,
        queries.first(filter)?,
        queries.previous(reference, filter)?,
        queries.next(reference, filter)?,
        queries.last(filter)?,
    ))
}

/// Rank, total and links for `reference` within `filter`.
///
/// Returns `None` when fewer than `min_count` screenshots match, or when the total equals
/// `already`, the count of a broader view showing the same set.
///
/// # Errors
/// Propagates errors from `queries`.
pub fn navigation_summary<Q: ScreenshotQueries + ?Sized>(
    queries: &Q,
    reference: ScreenshotId,
    filter: &NavigationFilter,
    min_count: u64,
    already: Option<u64>,
) -> Result<Option<NavigationSummary>, Q::Error> {
    let total = queries.count(filter)?;
    if total < min_count || already == Some(total) {
        return Ok(None);
    }

    let index = queries.count_before(reference, filter)? + 1;
    let links = navigation_links(queries, reference, filter)?;
    Ok(Some(NavigationSummary { index, total, links }))
}

/// Navigation rows for a screenshot page: same website, then same browser group, then
/// same platform. Narrower rows that match exactly the website's set are omitted.
///
/// # Errors
/// Propagates errors from `queries`.
pub fn screenshot_navigation<Q: ScreenshotQueries + ?Sized>(
    queries: &Q,
    context: &ScreenshotContext,
) -> Result<Vec<NavigationRow>, Q::Error> {
    let keys = context.keys();
    let website_total = queries.count(&NavigationScope::Website.filter_for(&keys))?;

    let mut rows = Vec::new();
    for scope in NavigationScope::ALL {
        let already = match scope {
            NavigationScope::Website => None,
            NavigationScope::BrowserGroup | NavigationScope::Platform => Some(website_total),
        };
        let summary = navigation_summary(
            queries,
            keys.id,
            &scope.filter_for(&keys),
            scope.min_count(),
            already,
        )?;
        if let Some(summary) = summary {
            let title = scope.title(context);
            let label = format!("{} out of {} {title}", summary.index, summary.total);
            rows.push(NavigationRow { scope, title, label, summary });
        }
    }
    Ok(rows)
}

/// Pick the highest-identifier screenshot of every website, newest first, capped.
#[must_use]
pub fn latest_per_group(screenshots: &[Screenshot], max_results: usize) -> Vec<Screenshot> {
    let mut latest: BTreeMap<WebsiteId, &Screenshot> = BTreeMap::new();
    for screenshot in screenshots {
        latest
            .entry(screenshot.website_id)
            .and_modify(|current| {
                if screenshot.id > current.id {
                    *current = screenshot;
                }
            })
            .or_insert(screenshot);
    }

    let mut selected = latest.into_values().cloned().collect::<Vec<_>>();
    selected.sort_by(|a, b| b.id.cmp(&a.id));
    selected.truncate(max_results);
    selected
}

/// A screenshot with the keys navigation filters need.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IndexedScreenshot {
    pub screenshot: Screenshot,
    pub browser_group_id: BrowserGroupId,
    pub platform_id: PlatformId,
}

impl IndexedScreenshot {
    #[must_use]
    pub fn keys(&self) -> ScreenshotKeys {
        ScreenshotKeys {
            id: self.screenshot.id,
            website_id: self.screenshot.website_id,
            browser_group_id: self.browser_group_id,
            platform_id: self.platform_id,
        }
    }
}

/// In-memory [`ScreenshotQueries`] over a materialized snapshot.
#[derive(Debug, Clone, Default)]
pub struct ScreenshotIndex {
    entries: Vec<IndexedScreenshot>,
}

impl ScreenshotIndex {
    #[must_use]
    pub fn new(mut entries: Vec<IndexedScreenshot>) -> Self {
        entries.sort_by_key(|entry| entry.screenshot.id);
        entries.dedup_by_key(|entry| entry.screenshot.id);
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matching<'a>(
        &'a self,
        filter: &'a NavigationFilter,
    ) -> impl DoubleEndedIterator<Item = &'a IndexedScreenshot> + 'a {
        self.entries.iter().filter(move |entry| filter.matches(&entry.keys()))
    }
}

impl ScreenshotQueries for ScreenshotIndex {
    type Error = Infallible;

    fn latest_per_group(&self, max_results: usize) -> Result<Vec<Screenshot>, Self::Error> {
        let screenshots =
            self.entries.iter().map(|entry| entry.screenshot.clone()).collect::<Vec<_>>();
        Ok(latest_per_group(&screenshots, max_results))
    }

    fn first(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>, Self::Error> {
        Ok(self.matching(filter).next().map(|entry| entry.screenshot.clone()))
    }

    fn previous(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>, Self::Error> {
        Ok(self
            .matching(filter)
            .rev()
            .find(|entry| entry.screenshot.id < reference)
            .map(|entry| entry.screenshot.clone()))
    }

    fn next(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<Option<Screenshot>, Self::Error> {
        Ok(self
            .matching(filter)
            .find(|entry| entry.screenshot.id > reference)
            .map(|entry| entry.screenshot.clone()))
    }

    fn last(&self, filter: &NavigationFilter) -> Result<Option<Screenshot>, Self::Error> {
        Ok(self.matching(filter).next_back().map(|entry| entry.screenshot.clone()))
    }

    fn count(&self, filter: &NavigationFilter) -> Result<u64, Self::Error> {
        Ok(u64::try_from(self.matching(filter).count()).unwrap_or(u64::MAX))
    }

    fn count_before(
        &self,
        reference: ScreenshotId,
        filter: &NavigationFilter,
    ) -> Result<u64, Self::Error> {
        let before = self.matching(filter).filter(|entry| entry.screenshot.id < reference).count();
        Ok(u64::try_from(before).unwrap_or(u64::MAX))
    }
}

// ---------------------------------------------------------------------------
// Selection choices

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    #[must_use]
    pub fn dont_care() -> Self {
        Self { value: DONT_CARE.to_string(), label: "Don't care".to_string() }
    }
}

/// Screen width choices; consecutive duplicate widths collapse into one entry.
#[must_use]
pub fn screen_size_choices(widths: impl IntoIterator<Item = u32>) -> Vec<Choice> {
    let mut choices = vec![Choice::dont_care()];
    let mut previous = None;
    for width in widths {
        if previous != Some(width) {
            choices.push(Choice {
                value: width.to_string(),
                label: format!("{width} pixels wide"),
            });
            previous = Some(width);
        }
    }
    choices
}

#[must_use]
pub fn color_depth_choices(depths: impl IntoIterator<Item = u32>) -> Vec<Choice> {
    let mut choices = vec![Choice::dont_care()];
    let mut previous = None;
    for depth in depths {
        if previous != Some(depth) {
            choices.push(Choice {
                value: depth.to_string(),
                label: format!("{depth} bits per pixel"),
            });
            previous = Some(depth);
        }
    }
    choices
}

#[must_use]
pub fn feature_choices<'a>(versions: impl IntoIterator<Item = &'a str>) -> Vec<Choice> {
    let mut choices = vec![Choice::dont_care()];
    choices.extend(versions.into_iter().map(|version| Choice {
        value: version.to_string(),
        label: version.to_string(),
    }));
    choices
}

fn join_non_empty(parts: &[&str]) -> String {
    parts.iter().map(|part| part.trim()).filter(|part| !part.is_empty()).collect::<Vec<_>>().join(" ")
}
