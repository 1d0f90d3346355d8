use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::timeouts::TimeoutPolicy;
use tracing::warn;

pub const SETTINGS_FILE: &str = "coordinator.toml";
pub const MAX_TIMEOUT_SECS: u64 = 86_400;
pub const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub surface_url: String,
    pub connect_timeout_secs: u64,
    pub transaction_timeout_secs: u64,
    pub contract_view_timeout_secs: u64,
    pub contract_call_timeout_secs: u64,
    pub balance_timeout_secs: u64,
    pub sign_message_timeout_secs: u64,
    pub disconnect_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let timeouts = TimeoutPolicy::default();
        Self {
            database_url: MEMORY_DATABASE_URL.into(),
            surface_url: "wallet://approval/popup.html".into(),
            connect_timeout_secs: timeouts.connect.as_secs(),
            transaction_timeout_secs: timeouts.transaction.as_secs(),
            contract_view_timeout_secs: timeouts.contract_view.as_secs(),
            contract_call_timeout_secs: timeouts.contract_call.as_secs(),
            balance_timeout_secs: timeouts.balance.as_secs(),
            sign_message_timeout_secs: timeouts.sign_message.as_secs(),
            disconnect_timeout_secs: timeouts.disconnect.as_secs(),
        }
    }
}

impl Settings {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            connect: Duration::from_secs(self.connect_timeout_secs),
            transaction: Duration::from_secs(self.transaction_timeout_secs),
            contract_view: Duration::from_secs(self.contract_view_timeout_secs),
            contract_call: Duration::from_secs(self.contract_call_timeout_secs),
            balance: Duration::from_secs(self.balance_timeout_secs),
            sign_message: Duration::from_secs(self.sign_message_timeout_secs),
            disconnect: Duration::from_secs(self.disconnect_timeout_secs),
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "database_url" => self.database_url = normalize_database_url(value),
            "surface_url" => self.surface_url = value.to_string(),
            _ => {
                let Some(slot) = self.timeout_slot(key) else {
                    return;
                };
                match value.parse::<u64>() {
                    Ok(parsed) if parsed <= MAX_TIMEOUT_SECS => *slot = parsed,
                    Ok(_) => warn!(key, value, max = MAX_TIMEOUT_SECS, "config: ignoring timeout above the maximum"),
                    Err(_) => warn!(key, value, "config: ignoring non-numeric timeout"),
                }
            }
        }
    }

    fn timeout_slot(&mut self, key: &str) -> Option<&mut u64> {
        Some(match key {
            "connect_timeout_secs" => &mut self.connect_timeout_secs,
            "transaction_timeout_secs" => &mut self.transaction_timeout_secs,
            "contract_view_timeout_secs" => &mut self.contract_view_timeout_secs,
            "contract_call_timeout_secs" => &mut self.contract_call_timeout_secs,
            "balance_timeout_secs" => &mut self.balance_timeout_secs,
            "sign_message_timeout_secs" => &mut self.sign_message_timeout_secs,
            "disconnect_timeout_secs" => &mut self.disconnect_timeout_secs,
            _ => return None,
        })
    }
}

const KEYS: [&str; 9] = [
    "database_url",
    "surface_url",
    "connect_timeout_secs",
    "transaction_timeout_secs",
    "contract_view_timeout_secs",
    "contract_call_timeout_secs",
    "balance_timeout_secs",
    "sign_message_timeout_secs",
    "disconnect_timeout_secs",
];

/// Defaults, then `coordinator.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text.clone(),
                        toml::Value::Integer(number) => number.to_string(),
                        other => {
                            warn!(key = %key, value = %other, "config: ignoring unsupported value");
                            continue;
                        }
                    };
                    settings.apply(key, &value);
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "config: ignoring unreadable settings file"),
        }
    }

    for key in KEYS {
        if let Some(value) = env(&format!("APP__{}", key.to_ascii_uppercase())) {
            settings.apply(key, &value);
        }
    }

    settings
}

/// The store is SQLite only: `memory`, plain file paths and `sqlite:` URLs in either
/// form all map onto a `sqlite://` URL or the in-memory database.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw = raw_database_url.trim();

    if raw.is_empty() || raw == "memory" || raw == ":memory:" {
        return MEMORY_DATABASE_URL.to_string();
    }
    if raw.starts_with(MEMORY_DATABASE_URL) {
        return raw.to_string();
    }

    let path = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw);
    format!("sqlite://{}", path.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
