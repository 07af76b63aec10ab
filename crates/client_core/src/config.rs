use std::{collections::HashMap, fs, time::Duration};

const SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub request_timeout: Duration,
    pub cache_database_url: String,
    pub live_path: String,
    pub reconnect_delay: Duration,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".into(),
            request_timeout: Duration::from_secs(10),
            cache_database_url: "sqlite://./data/chat-cache.db".into(),
            live_path: "/ws".into(),
            reconnect_delay: Duration::from_secs(2),
            event_buffer: 1024,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file_overrides(&mut settings, &raw);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(raw) else {
        return;
    };
    let text = |key: &str| -> Option<String> {
        match file_cfg.get(key)? {
            toml::Value::String(v) => Some(v.clone()),
            toml::Value::Integer(v) => Some(v.to_string()),
            _ => None,
        }
    };

    if let Some(v) = text("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = text("cache_database_url") {
        settings.cache_database_url = v;
    }
    if let Some(v) = text("live_path") {
        settings.live_path = v;
    }
    if let Some(v) = text("request_timeout_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = text("reconnect_delay_ms").and_then(|v| v.parse::<u64>().ok()) {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = text("event_buffer").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = v.max(16);
    }
}

pub(crate) fn apply_env_overrides(
    settings: &mut ClientSettings,
    var: impl Fn(&str) -> Option<String>,
) {
    let first = |keys: [&str; 2]| keys.iter().rev().find_map(|&key| var(key));

    if let Some(v) = first(["CHAT_SERVER_URL", "APP__SERVER_URL"]) {
        settings.server_url = v;
    }
    if let Some(v) = first(["CHAT_CACHE_DATABASE_URL", "APP__CACHE_DATABASE_URL"]) {
        settings.cache_database_url = v;
    }
    if let Some(v) = first(["CHAT_LIVE_PATH", "APP__LIVE_PATH"]) {
        settings.live_path = v;
    }
    if let Some(v) = first(["CHAT_REQUEST_TIMEOUT_MS", "APP__REQUEST_TIMEOUT_MS"])
        .and_then(|v| v.parse::<u64>().ok())
    {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = first(["CHAT_RECONNECT_DELAY_MS", "APP__RECONNECT_DELAY_MS"])
        .and_then(|v| v.parse::<u64>().ok())
    {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = first(["CHAT_EVENT_BUFFER", "APP__EVENT_BUFFER"])
        .and_then(|v| v.parse::<usize>().ok())
    {
        settings.event_buffer = v.max(16);
    }
}

/// Normalises a cache location into a sqlite URL.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
