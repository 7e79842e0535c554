use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

/// Relay options editable at runtime. Loaded into a snapshot and re-read by
/// the sync task, so changes take effect without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub retry_times: u32,
    /// Tokens reserved when the client leaves `max_tokens` unset.
    pub pre_consumed_quota: i64,
    /// Quota units per 1 USD of fixed price.
    pub quota_per_unit: f64,
    pub stop_on_sensitive_enabled: bool,
    pub check_sensitive_enabled: bool,
    pub check_sensitive_on_prompt_enabled: bool,
    pub check_sensitive_on_completion_enabled: bool,
    pub sensitive_words: Vec<String>,
    pub log_consume_enabled: bool,
    pub automatic_disable_channel_enabled: bool,
    pub automatic_enable_channel_enabled: bool,
    /// Channel tests slower than this disable the channel.
    pub channel_disable_threshold_seconds: f64,
    pub model_ratio: HashMap<String, f64>,
    pub model_price: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

fn default_sensitive_words() -> Vec<String> {
    vec!["test_sensitive".to_string()]
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_times: 0,
            pre_consumed_quota: 500,
            quota_per_unit: 500_000.0,
            stop_on_sensitive_enabled: true,
            check_sensitive_enabled: false,
            check_sensitive_on_prompt_enabled: true,
            check_sensitive_on_completion_enabled: true,
            sensitive_words: default_sensitive_words(),
            log_consume_enabled: true,
            automatic_disable_channel_enabled: false,
            automatic_enable_channel_enabled: false,
            channel_disable_threshold_seconds: 5.0,
            model_ratio: HashMap::new(),
            model_price: HashMap::new(),
            completion_ratio: HashMap::new(),
            group_ratio: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl RelaySettings {
    pub fn check_prompt(&self) -> bool {
        self.check_sensitive_enabled && self.check_sensitive_on_prompt_enabled
    }

    pub fn check_completion(&self) -> bool {
        self.check_sensitive_enabled && self.check_sensitive_on_completion_enabled
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Sqlite>,
}

impl SettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS options (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.ensure_defaults().await?;
        Ok(store)
    }

    async fn ensure_defaults(&self) -> Result<(), String> {
        let defaults = RelaySettings::default();
        let words = serde_json::to_string(&defaults.sensitive_words).map_err(|e| e.to_string())?;
        let pairs = [
            ("retry_times", defaults.retry_times.to_string()),
            ("pre_consumed_quota", defaults.pre_consumed_quota.to_string()),
            ("quota_per_unit", defaults.quota_per_unit.to_string()),
            (
                "stop_on_sensitive_enabled",
                defaults.stop_on_sensitive_enabled.to_string(),
            ),
            (
                "check_sensitive_enabled",
                defaults.check_sensitive_enabled.to_string(),
            ),
            (
                "check_sensitive_on_prompt_enabled",
                defaults.check_sensitive_on_prompt_enabled.to_string(),
            ),
            (
                "check_sensitive_on_completion_enabled",
                defaults.check_sensitive_on_completion_enabled.to_string(),
            ),
            ("sensitive_words", words),
            ("log_consume_enabled", defaults.log_consume_enabled.to_string()),
            (
                "automatic_disable_channel_enabled",
                defaults.automatic_disable_channel_enabled.to_string(),
            ),
            (
                "automatic_enable_channel_enabled",
                defaults.automatic_enable_channel_enabled.to_string(),
            ),
            (
                "channel_disable_threshold_seconds",
                defaults.channel_disable_threshold_seconds.to_string(),
            ),
            ("model_ratio", "{}".to_string()),
            ("model_price", "{}".to_string()),
            ("completion_ratio", "{}".to_string()),
            ("group_ratio", "{}".to_string()),
        ];
        for (key, value) in pairs {
            self.seed(key, &value).await?;
        }
        Ok(())
    }

    async fn seed(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO options (key, value, updated_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT value FROM options WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(row.map(|r| r.try_get("value").unwrap_or_default()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO options (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get_all(&self) -> Result<RelaySettings, String> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM options")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut settings = RelaySettings::default();
        let mut latest_update = DateTime::<Utc>::MIN_UTC;

        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            let updated_at_str: String = row.try_get("updated_at").map_err(|e| e.to_string())?;

            if let Ok(updated_at) = DateTime::parse_from_rfc3339(&updated_at_str) {
                let updated_at = updated_at.with_timezone(&Utc);
                if updated_at > latest_update {
                    latest_update = updated_at;
                }
            }

            match key.as_str() {
                "retry_times" => settings.retry_times = value.parse().unwrap_or(0),
                "pre_consumed_quota" => settings.pre_consumed_quota = value.parse().unwrap_or(500),
                "quota_per_unit" => settings.quota_per_unit = value.parse().unwrap_or(500_000.0),
                "stop_on_sensitive_enabled" => {
                    settings.stop_on_sensitive_enabled = value.parse().unwrap_or(true)
                }
                "check_sensitive_enabled" => {
                    settings.check_sensitive_enabled = value.parse().unwrap_or(false)
                }
                "check_sensitive_on_prompt_enabled" => {
                    settings.check_sensitive_on_prompt_enabled = value.parse().unwrap_or(true)
                }
                "check_sensitive_on_completion_enabled" => {
                    settings.check_sensitive_on_completion_enabled = value.parse().unwrap_or(true)
                }
                "sensitive_words" => {
                    settings.sensitive_words = parse_word_list(&value);
                }
                "log_consume_enabled" => {
                    settings.log_consume_enabled = value.parse().unwrap_or(true)
                }
                "automatic_disable_channel_enabled" => {
                    settings.automatic_disable_channel_enabled = value.parse().unwrap_or(false)
                }
                "automatic_enable_channel_enabled" => {
                    settings.automatic_enable_channel_enabled = value.parse().unwrap_or(false)
                }
                "channel_disable_threshold_seconds" => {
                    settings.channel_disable_threshold_seconds = value.parse().unwrap_or(5.0)
                }
                "model_ratio" => settings.model_ratio = parse_ratio_map(&key, &value),
                "model_price" => settings.model_price = parse_ratio_map(&key, &value),
                "completion_ratio" => settings.completion_ratio = parse_ratio_map(&key, &value),
                "group_ratio" => settings.group_ratio = parse_ratio_map(&key, &value),
                _ => {}
            }
        }

        if latest_update > DateTime::<Utc>::MIN_UTC {
            settings.updated_at = latest_update;
        }
        Ok(settings)
    }
}

/// Accepts either a JSON array or one phrase per line.
fn parse_word_list(value: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(value) {
        return list;
    }
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_ratio_map(key: &str, value: &str) -> HashMap<String, f64> {
    match serde_json::from_str(value) {
        Ok(map) => map,
        Err(err) => {
            tracing::warn!(setting = key, "ignoring malformed ratio table: {err}");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_list_accepts_json_or_lines() {
        assert_eq!(parse_word_list(r#"["a","b"]"#), vec!["a", "b"]);
        assert_eq!(parse_word_list("a\n\n b \n"), vec!["a", "b"]);
    }

    #[test]
    fn malformed_ratio_map_is_empty() {
        assert!(parse_ratio_map("model_ratio", "not json").is_empty());
        assert_eq!(
            parse_ratio_map("model_ratio", r#"{"gpt-4": 15}"#).get("gpt-4"),
            Some(&15.0)
        );
    }

    #[test]
    fn sensitive_checks_require_master_switch() {
        let mut settings = RelaySettings::default();
        assert!(!settings.check_prompt());
        settings.check_sensitive_enabled = true;
        assert!(settings.check_prompt());
        settings.check_sensitive_on_completion_enabled = false;
        assert!(!settings.check_completion());
    }
}
