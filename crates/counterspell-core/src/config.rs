use anyhow::Result;
use std::collections::HashMap;

use crate::store::Store;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Defaults for new tasks
    pub model: String,
    pub backend: String,

    // Provider credentials / endpoints
    pub anthropic_api_key: String,
    pub anthropic_auth_token: String,
    pub anthropic_base_url: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub github_token: String,

    // Subprocess backends
    pub claude_bin: String,
    pub codex_bin: String,

    // Orchestration tuning
    pub max_concurrent_tasks: usize,
    /// Upper bound on a single stream turn; exceeding it cancels the turn.
    pub turn_timeout_s: u64,
    pub shutdown_grace_s: u64,
    /// Event-bus subscribers that have not drained for this long are reaped.
    pub subscriber_stall_s: u64,
    pub fetch_retries: u32,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(key: &str, dotenv: &HashMap<String, String>, default: u32) -> u32 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3141),
            model: get_str("MODEL", &dotenv, "anthropic/claude-sonnet-4-5"),
            backend: get_str("BACKEND", &dotenv, "claude-code"),
            anthropic_api_key: get_str("ANTHROPIC_API_KEY", &dotenv, ""),
            anthropic_auth_token: get_str("ANTHROPIC_AUTH_TOKEN", &dotenv, ""),
            anthropic_base_url: get_str("ANTHROPIC_BASE_URL", &dotenv, ""),
            openai_api_key: get_str("OPENAI_API_KEY", &dotenv, ""),
            openai_base_url: get_str("OPENAI_BASE_URL", &dotenv, ""),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            claude_bin: get_str("CLAUDE_BIN", &dotenv, "claude"),
            codex_bin: get_str("CODEX_BIN", &dotenv, "codex"),
            max_concurrent_tasks: get_usize("MAX_CONCURRENT_TASKS", &dotenv, 4),
            turn_timeout_s: get_u64("TURN_TIMEOUT_S", &dotenv, 1800),
            shutdown_grace_s: get_u64("SHUTDOWN_GRACE_S", &dotenv, 15),
            subscriber_stall_s: get_u64("SUBSCRIBER_STALL_S", &dotenv, 30),
            fetch_retries: get_u32("FETCH_RETRIES", &dotenv, 3),
        })
    }

    /// Seed settings rows from env on first run; DB values win afterwards.
    pub fn seed_settings(&self, store: &Store) -> crate::error::Result<()> {
        store.seed_setting("anthropic_api_key", &self.anthropic_api_key)?;
        store.seed_setting("anthropic_auth_token", &self.anthropic_auth_token)?;
        store.seed_setting("anthropic_base_url", &self.anthropic_base_url)?;
        store.seed_setting("openai_api_key", &self.openai_api_key)?;
        store.seed_setting("openai_base_url", &self.openai_base_url)?;
        store.seed_setting("default_backend", &self.backend)?;
        store.seed_setting("default_model", &self.model)?;
        Ok(())
    }
}
