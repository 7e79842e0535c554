use crate::config::ChannelType;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl std::str::FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "manually_disabled" => Ok(Self::ManuallyDisabled),
            "auto_disabled" => Ok(Self::AutoDisabled),
            other => Err(format!("unknown channel status: {other}")),
        }
    }
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::ManuallyDisabled => "manually_disabled",
            Self::AutoDisabled => "auto_disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub organization: Option<String>,
    pub api_version: Option<String>,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    /// Client model name to upstream model name.
    pub model_mapping: HashMap<String, String>,
    pub status: ChannelStatus,
    pub auto_ban: bool,
    pub priority: i64,
    pub weight: i64,
    pub used_quota: i64,
    pub response_time_ms: i64,
    pub test_time: Option<DateTime<Utc>>,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn base_url_or_default(&self) -> &str {
        if self.base_url.trim().is_empty() {
            self.channel_type.default_base_url()
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default = "default_auto_ban")]
    pub auto_ban: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_auto_ban() -> bool {
    true
}

fn default_weight() -> i64 {
    1
}

#[derive(Clone)]
pub struct ChannelStore {
    pool: Pool<Sqlite>,
}

impl ChannelStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                base_url TEXT NOT NULL DEFAULT '',
                api_key TEXT NOT NULL,
                organization TEXT,
                api_version TEXT,
                models TEXT NOT NULL DEFAULT '[]',
                groups TEXT NOT NULL DEFAULT '["default"]',
                model_mapping TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'enabled',
                auto_ban INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                weight INTEGER NOT NULL DEFAULT 1,
                used_quota INTEGER NOT NULL DEFAULT 0,
                response_time_ms INTEGER NOT NULL DEFAULT 0,
                test_time TEXT,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }

    pub async fn create_channel(&self, input: NewChannel) -> Result<Channel, String> {
        let channel = Channel {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            channel_type: input.channel_type,
            base_url: input.base_url,
            api_key: input.api_key,
            organization: input.organization.filter(|v| !v.trim().is_empty()),
            api_version: input.api_version.filter(|v| !v.trim().is_empty()),
            models: input.models,
            groups: input.groups,
            model_mapping: input.model_mapping,
            status: ChannelStatus::Enabled,
            auto_ban: input.auto_ban,
            priority: input.priority,
            weight: input.weight,
            used_quota: 0,
            response_time_ms: 0,
            test_time: None,
        };
        sqlx::query(
            r#"INSERT INTO channels (id, name, channel_type, base_url, api_key, organization,
                   api_version, models, groups, model_mapping, status, auto_ban, priority, weight,
                   created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(channel.channel_type.as_str())
        .bind(&channel.base_url)
        .bind(&channel.api_key)
        .bind(&channel.organization)
        .bind(&channel.api_version)
        .bind(serde_json::to_string(&channel.models).map_err(|e| e.to_string())?)
        .bind(serde_json::to_string(&channel.groups).map_err(|e| e.to_string())?)
        .bind(serde_json::to_string(&channel.model_mapping).map_err(|e| e.to_string())?)
        .bind(channel.status.as_str())
        .bind(if channel.auto_ban { 1 } else { 0 })
        .bind(channel.priority)
        .bind(channel.weight)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(channel)
    }

    pub async fn get_channel(&self, id: &str) -> Result<Option<Channel>, String> {
        let row = sqlx::query("SELECT * FROM channels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| row_to_channel(&r)).transpose()
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>, String> {
        let rows = sqlx::query("SELECT * FROM channels ORDER BY priority DESC, created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_channel).collect()
    }

    pub async fn update_status(&self, id: &str, status: ChannelStatus) -> Result<(), String> {
        sqlx::query("UPDATE channels SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn add_used_quota(&self, id: &str, quota: i64) -> Result<(), String> {
        sqlx::query("UPDATE channels SET used_quota = used_quota + ? WHERE id = ?")
            .bind(quota)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn record_test(&self, id: &str, response_time_ms: i64) -> Result<(), String> {
        sqlx::query("UPDATE channels SET response_time_ms = ?, test_time = ? WHERE id = ?")
            .bind(response_time_ms)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_channel(row: &sqlx::sqlite::SqliteRow) -> Result<Channel, String> {
    let channel_type: String = row.try_get("channel_type").map_err(|e| e.to_string())?;
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let models: String = row.try_get("models").unwrap_or_else(|_| "[]".to_string());
    let groups: String = row
        .try_get("groups")
        .unwrap_or_else(|_| "[\"default\"]".to_string());
    let mapping: String = row
        .try_get("model_mapping")
        .unwrap_or_else(|_| "{}".to_string());
    let test_time: Option<String> = row.try_get("test_time").unwrap_or(None);
    Ok(Channel {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        channel_type: ChannelType::parse(&channel_type),
        base_url: row.try_get("base_url").unwrap_or_default(),
        api_key: row.try_get("api_key").map_err(|e| e.to_string())?,
        organization: row.try_get("organization").unwrap_or(None),
        api_version: row.try_get("api_version").unwrap_or(None),
        models: serde_json::from_str(&models).unwrap_or_default(),
        groups: serde_json::from_str(&groups).unwrap_or_default(),
        model_mapping: serde_json::from_str(&mapping).unwrap_or_default(),
        status: status.parse().unwrap_or(ChannelStatus::ManuallyDisabled),
        auto_ban: row.try_get::<i32, _>("auto_ban").unwrap_or(1) == 1,
        priority: row.try_get("priority").unwrap_or(0),
        weight: row.try_get("weight").unwrap_or(1),
        used_quota: row.try_get("used_quota").unwrap_or(0),
        response_time_ms: row.try_get("response_time_ms").unwrap_or(0),
        test_time: test_time
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

/// Routing view of the enabled channels. Requests read a snapshot; refreshes
/// and disables swap in a new one.
pub struct ChannelPool {
    enabled: ArcSwap<Vec<Arc<Channel>>>,
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPool {
    pub fn new() -> Self {
        Self {
            enabled: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub async fn refresh(&self, store: &ChannelStore) -> Result<usize, String> {
        let channels: Vec<Arc<Channel>> = store
            .list_channels()
            .await?
            .into_iter()
            .filter(Channel::is_enabled)
            .map(Arc::new)
            .collect();
        let count = channels.len();
        self.enabled.store(Arc::new(channels));
        Ok(count)
    }

    /// Picks a channel for `model` in `group`, skipping `exclude`. Only the
    /// highest priority tier is considered; ties are broken by weight.
    pub fn select(
        &self,
        group: &str,
        model: &str,
        exclude: &HashSet<String>,
    ) -> Option<Arc<Channel>> {
        let snapshot = self.enabled.load();
        let candidates: Vec<Arc<Channel>> = snapshot
            .iter()
            .filter(|c| c.serves(group, model) && !exclude.contains(&c.id))
            .cloned()
            .collect();
        let top = candidates.iter().map(|c| c.priority).max()?;
        let tier: Vec<Arc<Channel>> = candidates
            .into_iter()
            .filter(|c| c.priority == top)
            .collect();
        weighted_shuffle_channels(tier).into_iter().next()
    }

    /// Drops a channel from routing immediately, ahead of the next refresh.
    pub fn remove(&self, channel_id: &str) {
        self.enabled.rcu(|current| {
            current
                .iter()
                .filter(|c| c.id != channel_id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let mut models: Vec<String> = self
            .enabled
            .load()
            .iter()
            .filter(|c| c.groups.iter().any(|g| g == group))
            .flat_map(|c| c.models.iter().cloned())
            .collect();
        models.sort();
        models.dedup();
        models
    }
}

fn weighted_shuffle_channels(mut channels: Vec<Arc<Channel>>) -> Vec<Arc<Channel>> {
    let mut ordered = Vec::with_capacity(channels.len());
    while !channels.is_empty() {
        let total_weight: u64 = channels.iter().map(|c| c.weight.max(1) as u64).sum();
        let target = random_u64(total_weight);
        let mut cumulative = 0u64;
        let mut chosen = 0usize;
        for (idx, channel) in channels.iter().enumerate() {
            cumulative += channel.weight.max(1) as u64;
            if target < cumulative {
                chosen = idx;
                break;
            }
        }
        ordered.push(channels.swap_remove(chosen));
    }
    ordered
}

fn random_u64(bound: u64) -> u64 {
    if bound <= 1 {
        return 0;
    }
    let seed = uuid::Uuid::new_v4().as_u128() as u64;
    seed % bound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str, priority: i64, models: &[&str], groups: &[&str]) -> Arc<Channel> {
        Arc::new(Channel {
            id: id.to_string(),
            name: id.to_string(),
            channel_type: ChannelType::OpenAi,
            base_url: String::new(),
            api_key: "k".to_string(),
            organization: None,
            api_version: None,
            models: models.iter().map(|s| s.to_string()).collect(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            model_mapping: HashMap::new(),
            status: ChannelStatus::Enabled,
            auto_ban: true,
            priority,
            weight: 1,
            used_quota: 0,
            response_time_ms: 0,
            test_time: None,
        })
    }

    fn pool(channels: Vec<Arc<Channel>>) -> ChannelPool {
        let pool = ChannelPool::new();
        pool.enabled.store(Arc::new(channels));
        pool
    }

    #[test]
    fn selects_highest_priority_tier() {
        let pool = pool(vec![
            channel("low", 0, &["gpt-4"], &["default"]),
            channel("high", 10, &["gpt-4"], &["default"]),
        ]);
        for _ in 0..20 {
            let picked = pool.select("default", "gpt-4", &HashSet::new()).unwrap();
            assert_eq!(picked.id, "high");
        }
    }

    #[test]
    fn excluded_channels_fall_through_to_next_tier() {
        let pool = pool(vec![
            channel("low", 0, &["gpt-4"], &["default"]),
            channel("high", 10, &["gpt-4"], &["default"]),
        ]);
        let exclude = HashSet::from(["high".to_string()]);
        assert_eq!(pool.select("default", "gpt-4", &exclude).unwrap().id, "low");
    }

    #[test]
    fn respects_group_and_model() {
        let pool = pool(vec![channel("vip", 0, &["gpt-4"], &["vip"])]);
        assert!(pool.select("default", "gpt-4", &HashSet::new()).is_none());
        assert!(pool.select("vip", "gpt-3.5-turbo", &HashSet::new()).is_none());
        assert!(pool.select("vip", "gpt-4", &HashSet::new()).is_some());
    }

    #[test]
    fn removed_channel_is_not_routed() {
        let pool = pool(vec![channel("a", 0, &["m"], &["default"])]);
        pool.remove("a");
        assert!(pool.select("default", "m", &HashSet::new()).is_none());
    }

    #[test]
    fn weighted_shuffle_keeps_every_channel() {
        let shuffled = weighted_shuffle_channels(vec![
            channel("a", 0, &[], &[]),
            channel("b", 0, &[], &[]),
            channel("c", 0, &[], &[]),
        ]);
        let mut ids: Vec<_> = shuffled.iter().map(|c| c.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn models_listed_once_per_group() {
        let pool = pool(vec![
            channel("a", 0, &["gpt-4", "gpt-3.5-turbo"], &["default"]),
            channel("b", 0, &["gpt-4"], &["default"]),
        ]);
        assert_eq!(pool.models_for_group("default"), vec!["gpt-3.5-turbo", "gpt-4"]);
    }

    #[test]
    fn status_names_parse_back() {
        for status in [
            ChannelStatus::Enabled,
            ChannelStatus::ManuallyDisabled,
            ChannelStatus::AutoDisabled,
        ] {
            assert_eq!(status.as_str().parse::<ChannelStatus>(), Ok(status));
        }
        assert!("retired".parse::<ChannelStatus>().is_err());
    }
}
