use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::download::DownloadSettings;
use crate::filter::{FilterCriteria, FormatRule};
use crate::retry::RetryConfig;
use crate::types::MediaKind;

/// Environment variable holding the source bearer token. Takes precedence
/// over `source.token` in the config file.
pub const TOKEN_ENV: &str = "CHAT_EXPORT_TOKEN";

const DEFAULT_PAGINATION_LIMIT: usize = 100;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_EXPORT_FILE: &str = "messages_export.jsonl";
const DEFAULT_STATE_FILE: &str = "export_state.json";

/// Chat to export: a numeric id (negative for groups and channels) or a
/// public username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatId {
    Id(i64),
    Username(String),
}

impl ChatId {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            anyhow::bail!("chat_id cannot be empty");
        }
        if let Ok(id) = raw.parse::<i64>() {
            return Self::from_id(id);
        }
        let name = raw.strip_prefix('@').unwrap_or(raw);
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("Invalid chat_id '{}': expected a numeric id or @username", raw);
        }
        Ok(Self::Username(name.to_string()))
    }

    fn from_id(id: i64) -> anyhow::Result<Self> {
        if id == 0 {
            anyhow::bail!("chat_id cannot be zero");
        }
        Ok(Self::Id(id))
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "{name}"),
        }
    }
}

/// Connection settings for the message source.
#[derive(Clone)]
pub struct SourceSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for SourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Validated configuration, fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct Config {
    pub chat: ChatId,
    pub source: SourceSettings,
    pub criteria: FilterCriteria,
    pub download: DownloadSettings,
    /// Set when `export_messages` is on.
    pub export_file: Option<PathBuf>,
    pub state_file: PathBuf,
    pub pagination_limit: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawChatId {
    Number(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SourceSection {
    base_url: Option<String>,
    token: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrySection {
    max_attempts: Option<u32>,
    delay_secs: Option<u64>,
}

/// On-disk shape of `config.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    chat_id: Option<RawChatId>,
    source: SourceSection,
    media_types: Option<Vec<MediaKind>>,
    file_formats: HashMap<MediaKind, Vec<String>>,
    start_date: Option<String>,
    end_date: Option<String>,
    max_messages: Option<usize>,
    download_directory: Option<String>,
    export_messages: bool,
    export_messages_file: Option<String>,
    state_file: Option<String>,
    pagination_limit: Option<usize>,
    retry: RetrySection,
    download_timeout_secs: Option<u64>,
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Relative paths in the config file are taken relative to the directory
/// holding it.
fn resolve_path(raw: &str, base: &Path) -> PathBuf {
    let expanded = expand_tilde(raw.trim());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Read and validate the YAML config at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))?;
        let config_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let env_token = std::env::var(TOKEN_ENV).ok();
        Self::from_yaml(&text, config_dir, env_token)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub(crate) fn from_yaml(
        text: &str,
        config_dir: &Path,
        env_token: Option<String>,
    ) -> anyhow::Result<Self> {
        let raw: FileConfig = if text.trim().is_empty() {
            FileConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };

        let chat = match raw.chat_id {
            Some(RawChatId::Number(id)) => ChatId::from_id(id)?,
            Some(RawChatId::Text(s)) => ChatId::parse(&s)?,
            None => anyhow::bail!("chat_id is required"),
        };

        let base_url = non_blank(raw.source.base_url)
            .ok_or_else(|| anyhow::anyhow!("source.base_url is required"))?;
        let source = SourceSettings {
            base_url,
            token: non_blank(env_token).or_else(|| non_blank(raw.source.token)),
            request_timeout: Duration::from_secs(
                raw.source
                    .request_timeout_secs
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        };

        let start_date = non_blank(raw.start_date)
            .as_deref()
            .map(parse_date_or_interval)
            .transpose()?;
        let end_date = non_blank(raw.end_date)
            .as_deref()
            .map(parse_date_or_interval)
            .transpose()?;
        if let (Some(start), Some(end)) = (start_date, end_date) {
            if start > end {
                anyhow::bail!("start_date ({}) is after end_date ({})", start, end);
            }
        }

        let media_types = match raw.media_types {
            Some(kinds) if !kinds.is_empty() => kinds.into_iter().collect(),
            Some(_) => anyhow::bail!("media_types cannot be empty"),
            None => MediaKind::ALL.into_iter().collect(),
        };
        let file_formats = raw
            .file_formats
            .into_iter()
            .map(|(kind, formats)| (kind, FormatRule::from_list(formats.as_slice())))
            .collect();

        let criteria = FilterCriteria {
            media_types,
            file_formats,
            start_date,
            end_date,
            max_messages: raw.max_messages,
            export_messages: raw.export_messages,
        };

        let max_attempts = raw.retry.max_attempts.unwrap_or(3);
        if max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        let directory = non_blank(raw.download_directory)
            .map(|d| resolve_path(&d, config_dir))
            .unwrap_or_else(|| config_dir.join("downloads"));
        let download = DownloadSettings {
            directory: directory.clone(),
            retry: RetryConfig {
                max_attempts,
                delay_secs: raw.retry.delay_secs.unwrap_or(5),
            },
            timeout: Duration::from_secs(
                raw.download_timeout_secs
                    .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
        };

        let export_file = raw.export_messages.then(|| {
            non_blank(raw.export_messages_file)
                .map(|f| resolve_path(&f, &directory))
                .unwrap_or_else(|| directory.join(DEFAULT_EXPORT_FILE))
        });
        let state_file = non_blank(raw.state_file)
            .map(|f| resolve_path(&f, config_dir))
            .unwrap_or_else(|| config_dir.join(DEFAULT_STATE_FILE));

        let pagination_limit = raw.pagination_limit.unwrap_or(DEFAULT_PAGINATION_LIMIT);
        if pagination_limit == 0 {
            anyhow::bail!("pagination_limit must be at least 1");
        }

        Ok(Self {
            chat,
            source,
            criteria,
            download,
            export_file,
            state_file,
            pagination_limit,
        })
    }
}

/// Parse a config date into a UTC timestamp.
///
/// Accepted forms:
/// - Relative interval: `"20d"` (20 days before now)
/// - ISO date: `"2025-01-02"` (midnight UTC)
/// - ISO datetime: `"2025-01-02T14:30:00"` (UTC)
/// - RFC 3339 with offset: `"2025-01-02T14:30:00+02:00"`
pub(crate) fn parse_date_or_interval(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            if days < 0 {
                anyhow::bail!("Interval '{}' cannot be negative", s);
            }
            return Ok(Utc::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive_dt.and_utc());
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.and_utc());
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)",
        s
    )
}
