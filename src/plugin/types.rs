//! Source type definitions
//!
//! Identity and metadata of script sources plus the domain objects every
//! source, native or scripted, hands to the host.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a source
pub type SourceId = i64;

/// Derive the id of a script source from its defining data
///
/// The same name, language and base URL always produce the same id, so
/// state keyed by id (filters, health, rate buckets) survives a reinstall.
pub fn derive_source_id(name: &str, lang: &str, base_url: &str) -> SourceId {
    let digest = Sha256::digest(format!("{}/{}/{}", name, lang, base_url).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes) & i64::MAX
}

/// Per-source override of the default rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub capacity: i32,
    pub refill_interval_ms: i64,
}

/// Metadata declared by a script source package
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceMetadata {
    pub version: String,
    pub icon_url: Option<String>,
    /// Route requests through the challenge-solving client
    pub requires_bypass: bool,
    /// Extra domains the script may request besides its base URL host
    pub allowed_domains: Vec<String>,
    pub rate_limit: Option<RateLimitSpec>,
}

/// A script-defined source, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct UserSource {
    pub id: SourceId,
    pub name: String,
    pub lang: String,
    pub script: String,
    pub base_url: String,
    pub metadata: SourceMetadata,
}

impl UserSource {
    pub fn new(
        name: impl Into<String>,
        lang: impl Into<String>,
        base_url: impl Into<String>,
        script: impl Into<String>,
        metadata: SourceMetadata,
    ) -> Self {
        let name = name.into();
        let lang = lang.into();
        let base_url = base_url.into();
        Self {
            id: derive_source_id(&name, &lang, &base_url),
            name,
            lang,
            script: script.into(),
            base_url,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MangaStatus {
    #[default]
    Unknown,
    Ongoing,
    Completed,
    Licensed,
    PublishingFinished,
    Cancelled,
    OnHiatus,
}

impl MangaStatus {
    /// Numeric codes used by source scripts
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => MangaStatus::Ongoing,
            2 => MangaStatus::Completed,
            3 => MangaStatus::Licensed,
            4 => MangaStatus::PublishingFinished,
            5 => MangaStatus::Cancelled,
            6 => MangaStatus::OnHiatus,
            _ => MangaStatus::Unknown,
        }
    }

    /// Free-form status labels as scraped from sites
    pub fn from_label(label: &str) -> Self {
        let label: String = label
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match label.as_str() {
            "ongoing" | "publishing" | "releasing" => MangaStatus::Ongoing,
            "completed" | "complete" | "finished" | "ended" => MangaStatus::Completed,
            "licensed" => MangaStatus::Licensed,
            "publishingfinished" => MangaStatus::PublishingFinished,
            "cancelled" | "canceled" | "dropped" => MangaStatus::Cancelled,
            "onhiatus" | "hiatus" | "paused" => MangaStatus::OnHiatus,
            _ => MangaStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manga {
    pub key: String,
    pub title: String,
    pub author: Option<String>,
    pub artist: Option<String>,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub genres: Vec<String>,
    pub status: MangaStatus,
}

impl Manga {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub key: String,
    pub name: String,
    /// Chapter number, -1 when unknown
    pub number: f32,
    /// Upload time in epoch millis, 0 when unknown
    pub date_upload: i64,
    pub scanlator: Option<String>,
}

impl Chapter {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            number: -1.0,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Page {
    Image { url: String, referer: Option<String> },
    Text { text: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub mangas: Vec<Manga>,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Listing {
    pub name: String,
}

impl Listing {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    #[default]
    Ignored,
    Included,
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSelection {
    pub index: usize,
    pub ascending: bool,
}

/// Search facet declared by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterDefinition {
    Title {
        name: String,
    },
    Text {
        key: String,
        name: String,
        default: String,
    },
    Select {
        key: String,
        name: String,
        options: Vec<String>,
        default: usize,
    },
    Check {
        key: String,
        name: String,
        default: Option<bool>,
    },
    TriState {
        key: String,
        name: String,
        default: TriState,
    },
    Group {
        name: String,
        filters: Vec<FilterDefinition>,
    },
    Sort {
        key: String,
        name: String,
        options: Vec<String>,
        default: Option<SortSelection>,
    },
}

impl FilterDefinition {
    pub fn name(&self) -> &str {
        match self {
            FilterDefinition::Title { name }
            | FilterDefinition::Text { name, .. }
            | FilterDefinition::Select { name, .. }
            | FilterDefinition::Check { name, .. }
            | FilterDefinition::TriState { name, .. }
            | FilterDefinition::Group { name, .. }
            | FilterDefinition::Sort { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    /// Label with no user input
    Note,
    Text { value: String, hint: String },
    Select { options: Vec<String>, value: usize },
    /// Fetch from a user-supplied URL or parse user-supplied HTML
    Fetchers { url: String, html: String },
}

/// Extra per-operation parameter declared by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// Value selected for one filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    String(String),
    List(Vec<String>),
    IncludeExclude {
        included: Vec<String>,
        excluded: Vec<String>,
    },
}

/// Filter selections keyed by filter id
pub type FilterMap = BTreeMap<String, FilterValue>;

impl fmt::Display for MangaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MangaStatus::Unknown => "unknown",
            MangaStatus::Ongoing => "ongoing",
            MangaStatus::Completed => "completed",
            MangaStatus::Licensed => "licensed",
            MangaStatus::PublishingFinished => "publishing finished",
            MangaStatus::Cancelled => "cancelled",
            MangaStatus::OnHiatus => "on hiatus",
        };
        write!(f, "{}", label)
    }
}
