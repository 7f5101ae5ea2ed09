use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_SOURCE_TEMPLATES: [&str; 2] = [
    "https://rsshub.app/wechat/mp/{wechat_id}",
    "https://rsshub.rssforever.com/wechat/mp/{wechat_id}",
];
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_WECHAT2RSS_INDEX_URL: &str = "https://wechat2rss.xlab.app/list/all/";

const APP_DIR: &str = "wechat-agent";

/// Immutable process configuration. Built once; re-reading after env changes
/// is an explicit `Settings::new_from_env` call.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: String,
    pub ai_provider: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_chat_model: String,
    pub openai_embed_model: String,
    pub deepseek_api_key: Option<String>,
    pub deepseek_base_url: String,
    pub deepseek_chat_model: String,
    pub deepseek_embed_model: String,
    pub source_templates: Vec<String>,
    pub http_timeout_seconds: u64,
    pub max_concurrency: usize,
    pub default_view_mode: String,
    pub wechat2rss_index_url: String,
    pub article_fetch_timeout_seconds: u64,
    pub summary_source_char_limit: usize,
    pub midnight_shift_days: i64,
    pub sync_overlap_seconds: i64,
    pub incremental_sync_enabled: bool,
    pub source_max_candidates: usize,
    pub source_retry_backoff_ms: u64,
    pub source_circuit_fail_threshold: i64,
    pub source_cooldown_minutes: i64,
    pub discovery_v2_enabled: bool,
    pub session_provider: String,
    pub session_backend: String,
    pub coverage_sla_target: f64,
}

impl Settings {
    pub fn new_from_env() -> Result<Self> {
        // Prefer a local .env for development; fill missing values from the
        // per-user config file.
        let _ = dotenvy::dotenv();
        let _ = dotenvy::from_path(default_env_file());

        let default_mode = env::var("DEFAULT_VIEW_MODE")
            .unwrap_or_else(|_| "source".to_string())
            .trim()
            .to_ascii_lowercase();
        let default_view_mode = match default_mode.as_str() {
            "source" | "time" | "recommend" => default_mode,
            _ => "source".to_string(),
        };

        Ok(Self {
            db_url: env::var("WECHAT_AGENT_DB_URL")
                .unwrap_or_else(|_| "sqlite:///data/wechat_agent.db".to_string()),
            ai_provider: env::var("AI_PROVIDER").unwrap_or_else(|_| "auto".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|v| !v.is_empty()),
            openai_base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_chat_model: env::var("OPENAI_CHAT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_embed_model: env::var("OPENAI_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            deepseek_api_key: env::var("DEEPSEEK_API_KEY").ok().filter(|v| !v.is_empty()),
            deepseek_base_url: env::var("DEEPSEEK_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_DEEPSEEK_BASE_URL.to_string()),
            deepseek_chat_model: env::var("DEEPSEEK_CHAT_MODEL")
                .unwrap_or_else(|_| "deepseek-chat".to_string()),
            deepseek_embed_model: env::var("DEEPSEEK_EMBED_MODEL").unwrap_or_default(),
            source_templates: parse_source_templates(env::var("SOURCE_TEMPLATES").ok().as_deref()),
            http_timeout_seconds: to_positive(env::var("HTTP_TIMEOUT_SECONDS").ok(), 15),
            max_concurrency: to_positive(env::var("MAX_CONCURRENCY").ok(), 5) as usize,
            default_view_mode,
            wechat2rss_index_url: env::var("WECHAT2RSS_INDEX_URL")
                .unwrap_or_else(|_| DEFAULT_WECHAT2RSS_INDEX_URL.to_string()),
            article_fetch_timeout_seconds: to_positive(
                env::var("ARTICLE_FETCH_TIMEOUT_SECONDS").ok(),
                15,
            ),
            summary_source_char_limit: to_positive(env::var("SUMMARY_SOURCE_CHAR_LIMIT").ok(), 6000)
                as usize,
            midnight_shift_days: to_positive(env::var("MIDNIGHT_SHIFT_DAYS").ok(), 2) as i64,
            sync_overlap_seconds: to_positive(env::var("SYNC_OVERLAP_SECONDS").ok(), 120) as i64,
            incremental_sync_enabled: to_bool(env::var("INCREMENTAL_SYNC_ENABLED").ok(), true),
            source_max_candidates: to_positive(env::var("SOURCE_MAX_CANDIDATES").ok(), 3) as usize,
            source_retry_backoff_ms: to_positive(env::var("SOURCE_RETRY_BACKOFF_MS").ok(), 800),
            source_circuit_fail_threshold: to_positive(
                env::var("SOURCE_CIRCUIT_FAIL_THRESHOLD").ok(),
                3,
            ) as i64,
            source_cooldown_minutes: to_positive(env::var("SOURCE_COOLDOWN_MINUTES").ok(), 30)
                as i64,
            discovery_v2_enabled: to_bool(env::var("DISCOVERY_V2_ENABLED").ok(), false),
            session_provider: env::var("SESSION_PROVIDER").unwrap_or_else(|_| "weread".to_string()),
            session_backend: env::var("SESSION_BACKEND").unwrap_or_else(|_| "auto".to_string()),
            coverage_sla_target: env::var("COVERAGE_SLA_TARGET")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v.clamp(0.0, 1.0))
                .unwrap_or(0.0),
        })
    }

    // Test helper
    pub fn new_for_test(db_url: String) -> Self {
        Self {
            db_url,
            ai_provider: "auto".to_string(),
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_chat_model: "gpt-4o-mini".to_string(),
            openai_embed_model: "text-embedding-3-small".to_string(),
            deepseek_api_key: None,
            deepseek_base_url: DEFAULT_DEEPSEEK_BASE_URL.to_string(),
            deepseek_chat_model: "deepseek-chat".to_string(),
            deepseek_embed_model: String::new(),
            source_templates: DEFAULT_SOURCE_TEMPLATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            http_timeout_seconds: 15,
            max_concurrency: 5,
            default_view_mode: "source".to_string(),
            wechat2rss_index_url: DEFAULT_WECHAT2RSS_INDEX_URL.to_string(),
            article_fetch_timeout_seconds: 15,
            summary_source_char_limit: 6000,
            midnight_shift_days: 2,
            sync_overlap_seconds: 120,
            incremental_sync_enabled: true,
            source_max_candidates: 3,
            source_retry_backoff_ms: 800,
            source_circuit_fail_threshold: 3,
            source_cooldown_minutes: 30,
            discovery_v2_enabled: false,
            session_provider: "weread".to_string(),
            session_backend: "file".to_string(),
            coverage_sla_target: 0.0,
        }
    }

    /// `auto` resolves to the first provider whose key is configured.
    pub fn resolved_ai_provider(&self) -> &'static str {
        match self.ai_provider.trim().to_ascii_lowercase().as_str() {
            "openai" => "openai",
            "deepseek" => "deepseek",
            _ => {
                if self.openai_api_key.is_some() {
                    "openai"
                } else if self.deepseek_api_key.is_some() {
                    "deepseek"
                } else {
                    "none"
                }
            }
        }
    }

    pub fn resolved_api_key(&self) -> Option<&str> {
        match self.resolved_ai_provider() {
            "openai" => self.openai_api_key.as_deref(),
            "deepseek" => self.deepseek_api_key.as_deref(),
            _ => None,
        }
    }

    pub fn resolved_base_url(&self) -> Option<&str> {
        match self.resolved_ai_provider() {
            "openai" => Some(self.openai_base_url.as_str()),
            "deepseek" => Some(self.deepseek_base_url.as_str()),
            _ => None,
        }
    }

    pub fn resolved_chat_model(&self) -> &str {
        match self.resolved_ai_provider() {
            "openai" => self.openai_chat_model.as_str(),
            "deepseek" => self.deepseek_chat_model.as_str(),
            _ => "fallback",
        }
    }

    pub fn resolved_embed_model(&self) -> Option<&str> {
        let model = match self.resolved_ai_provider() {
            "openai" => self.openai_embed_model.trim(),
            "deepseek" => self.deepseek_embed_model.trim(),
            _ => "",
        };
        if model.is_empty() { None } else { Some(model) }
    }
}

fn parse_source_templates(raw: Option<&str>) -> Vec<String> {
    let defaults = || {
        DEFAULT_SOURCE_TEMPLATES
            .iter()
            .map(|s| s.to_string())
            .collect()
    };
    let Some(raw) = raw else {
        return defaults();
    };
    let templates: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty() && t.contains("{wechat_id}"))
        .map(str::to_string)
        .collect();
    if templates.is_empty() {
        return defaults();
    }
    templates
}

fn to_positive(raw: Option<String>, default: u64) -> u64 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(default)
}

fn to_bool(raw: Option<String>, default: bool) -> bool {
    let Some(raw) = raw else { return default };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Resolution order: custom path -> $XDG_CONFIG_HOME -> ~/.config.
pub fn default_env_file() -> PathBuf {
    if let Ok(custom) = env::var("WECHAT_AGENT_ENV_FILE") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if !trimmed.is_empty() {
            return Path::new(trimmed).join(APP_DIR).join(".env");
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
        .join(".env")
}

static ENV_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=(.*)$").unwrap());

/// Parse `KEY=VALUE` lines; surrounding single or double quotes are stripped,
/// `#` lines and non-assignments are ignored.
pub fn read_env_values(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    if !path.exists() {
        return Ok(values);
    }
    let content = std::fs::read_to_string(path)?;
    for line in content.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        let Some(captures) = ENV_LINE_RE.captures(line) else {
            continue;
        };
        let key = captures[1].to_string();
        let mut value = captures[2].trim().to_string();
        let bytes = value.as_bytes();
        if bytes.len() >= 2
            && bytes[0] == bytes[bytes.len() - 1]
            && (bytes[0] == b'"' || bytes[0] == b'\'')
        {
            value = value[1..value.len() - 1].to_string();
        }
        values.insert(key, value);
    }
    Ok(values)
}

fn serialize_env_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let needs_quotes =
        value.chars().any(char::is_whitespace) || value.contains(['"', '\'', '#']);
    if needs_quotes {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

/// Rewrite known keys in place, preserve everything else, and append new keys
/// under a generated header. Re-applying the same updates yields a
/// byte-identical file.
pub fn upsert_env_values(path: &Path, updates: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let raw_lines: Vec<String> = if path.exists() {
        std::fs::read_to_string(path)?
            .lines()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut pending = updates.clone();
    let mut out_lines: Vec<String> = Vec::with_capacity(raw_lines.len() + pending.len());

    for line in &raw_lines {
        let Some(captures) = ENV_LINE_RE.captures(line) else {
            out_lines.push(line.clone());
            continue;
        };
        let key = &captures[1];
        match pending.remove(key) {
            Some(value) => out_lines.push(format!("{key}={}", serialize_env_value(&value))),
            None => out_lines.push(line.clone()),
        }
    }

    if raw_lines.is_empty() {
        out_lines.push("# WeChat Agent configuration".to_string());
    }

    if !pending.is_empty() {
        if out_lines.last().is_some_and(|l| !l.trim().is_empty()) {
            out_lines.push(String::new());
        }
        for (key, value) in &pending {
            out_lines.push(format!("{key}={}", serialize_env_value(value)));
        }
    }

    let mut content = out_lines.join("\n");
    let trimmed_len = content.trim_end().len();
    content.truncate(trimmed_len);
    content.push('\n');
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_templates_filters_invalid_entries() {
        let parsed = parse_source_templates(Some(
            "https://a.example/{wechat_id}, not-a-template ,https://b.example/{wechat_id}",
        ));
        assert_eq!(
            parsed,
            vec![
                "https://a.example/{wechat_id}".to_string(),
                "https://b.example/{wechat_id}".to_string(),
            ]
        );

        let fallback = parse_source_templates(Some("no placeholder at all"));
        assert_eq!(fallback.len(), DEFAULT_SOURCE_TEMPLATES.len());
    }

    #[test]
    fn test_to_bool_recognized_values() {
        assert!(to_bool(Some("YES".into()), false));
        assert!(!to_bool(Some("off".into()), true));
        assert!(to_bool(Some("maybe".into()), true));
        assert!(!to_bool(None, false));
    }

    #[test]
    fn test_ai_provider_resolution_order() {
        let mut settings = Settings::new_for_test("sqlite::memory:".to_string());
        assert_eq!(settings.resolved_ai_provider(), "none");
        assert_eq!(settings.resolved_chat_model(), "fallback");

        settings.deepseek_api_key = Some("sk-d".to_string());
        assert_eq!(settings.resolved_ai_provider(), "deepseek");

        settings.openai_api_key = Some("sk-o".to_string());
        assert_eq!(settings.resolved_ai_provider(), "openai");
        assert_eq!(settings.resolved_embed_model(), Some("text-embedding-3-small"));
    }

    #[test]
    fn test_env_upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# kept comment\nOPENAI_API_KEY=old\nUNRELATED=stay\n",
        )
        .unwrap();

        let mut updates = BTreeMap::new();
        updates.insert("OPENAI_API_KEY".to_string(), "sk-new".to_string());
        updates.insert("AI_PROVIDER".to_string(), "openai".to_string());

        upsert_env_values(&path, &updates).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("# kept comment"));
        assert!(first.contains("OPENAI_API_KEY=sk-new"));
        assert!(first.contains("UNRELATED=stay"));
        assert!(first.contains("AI_PROVIDER=openai"));

        upsert_env_values(&path, &updates).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_env_values_strip_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=\"quoted value\"\nB='single'\nC=bare\n").unwrap();
        let values = read_env_values(&path).unwrap();
        assert_eq!(values["A"], "quoted value");
        assert_eq!(values["B"], "single");
        assert_eq!(values["C"], "bare");
    }
}
