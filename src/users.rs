use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Caller-held key with its own spending limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub id: String,
    pub user_id: String,
    pub token_id: String,
    pub token_name: String,
    pub channel_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub content: String,
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InsertConsumeLog {
    pub user_id: String,
    pub token_id: String,
    pub token_name: String,
    pub channel_id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub content: String,
    pub use_time_seconds: i64,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingErrorKind {
    NotFound,
    InsufficientBalance,
    Disabled,
    Internal,
}

#[derive(Debug, Clone)]
pub struct BillingError {
    pub kind: BillingErrorKind,
    pub message: String,
}

impl BillingError {
    fn new(kind: BillingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(BillingErrorKind::Internal, err.to_string())
    }
}

pub fn hash_token_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn generate_token_key() -> String {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    format!("sk-{}{}", a, &b[..16])
}

#[derive(Clone)]
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                user_group TEXT NOT NULL DEFAULT 'default',
                quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                key_prefix TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                remain_quota INTEGER NOT NULL DEFAULT 0,
                unlimited_quota INTEGER NOT NULL DEFAULT 0,
                used_quota INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                accessed_at TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS consume_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                token_id TEXT NOT NULL,
                token_name TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                quota INTEGER NOT NULL DEFAULT 0,
                content TEXT NOT NULL DEFAULT '',
                use_time_seconds INTEGER NOT NULL DEFAULT 0,
                is_stream INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_consume_logs_user ON consume_logs(user_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_user(&self, username: &str, group: &str, quota: i64) -> Result<User, String> {
        let now = Utc::now();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            group: group.to_string(),
            quota,
            used_quota: 0,
            request_count: 0,
            enabled: true,
            created_at: now,
        };
        sqlx::query(
            r#"INSERT INTO users (id, username, user_group, quota, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.group)
        .bind(user.quota)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>, String> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| row_to_user(&r)).transpose()
    }

    pub async fn get_user_quota(&self, id: &str) -> Result<i64, String> {
        let row = sqlx::query("SELECT quota FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Err(format!("user {id} not found"));
        };
        row.try_get("quota").map_err(|e| e.to_string())
    }

    pub async fn list_user_quotas(&self, ids: &[String]) -> Result<Vec<(String, i64)>, String> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(200) {
            let mut builder =
                sqlx::QueryBuilder::<Sqlite>::new("SELECT id, quota FROM users WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            for row in rows {
                out.push((
                    row.try_get("id").map_err(|e| e.to_string())?,
                    row.try_get("quota").map_err(|e| e.to_string())?,
                ));
            }
        }
        Ok(out)
    }

    pub async fn set_user_quota(&self, id: &str, quota: i64) -> Result<(), String> {
        sqlx::query("UPDATE users SET quota = ?, updated_at = ? WHERE id = ?")
            .bind(quota)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Creates a token and returns it with the plain key, which is not
    /// stored.
    pub async fn create_token(
        &self,
        user_id: &str,
        name: &str,
        remain_quota: i64,
        unlimited_quota: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(Token, String), String> {
        let key = generate_token_key();
        let now = Utc::now();
        let token = Token {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            key_prefix: key[..12].to_string(),
            key_hash: hash_token_key(&key),
            remain_quota,
            unlimited_quota,
            used_quota: 0,
            enabled: true,
            created_at: now,
            expires_at,
        };
        sqlx::query(
            r#"INSERT INTO tokens (id, user_id, name, key_prefix, key_hash, remain_quota,
                   unlimited_quota, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&token.id)
        .bind(&token.user_id)
        .bind(&token.name)
        .bind(&token.key_prefix)
        .bind(&token.key_hash)
        .bind(token.remain_quota)
        .bind(if token.unlimited_quota { 1 } else { 0 })
        .bind(now.to_rfc3339())
        .bind(expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok((token, key))
    }

    pub async fn get_token(&self, id: &str) -> Result<Option<Token>, String> {
        let row = sqlx::query("SELECT * FROM tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.map(|r| row_to_token(&r)).transpose()
    }

    pub async fn set_token_enabled(&self, id: &str, enabled: bool) -> Result<(), String> {
        sqlx::query("UPDATE tokens SET enabled = ? WHERE id = ?")
            .bind(if enabled { 1 } else { 0 })
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Resolves a plain key to an enabled, unexpired token and its enabled
    /// owner.
    pub async fn validate_token(&self, key: &str) -> Result<Option<(Token, User)>, String> {
        if !key.starts_with("sk-") || key.len() < 12 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM tokens WHERE key_hash = ?")
            .bind(hash_token_key(key))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        let token = row_to_token(&row)?;
        if !token.enabled {
            return Ok(None);
        }
        if let Some(expires_at) = token.expires_at {
            if expires_at < Utc::now() {
                return Ok(None);
            }
        }
        if !token.unlimited_quota && token.remain_quota <= 0 {
            return Ok(None);
        }
        let user = match self.get_user(&token.user_id).await? {
            Some(u) if u.enabled => u,
            _ => return Ok(None),
        };

        sqlx::query("UPDATE tokens SET accessed_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(&token.id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Some((token, user)))
    }

    /// Withholds `amount` from both the token and its owner in one
    /// transaction. Nothing changes unless both have enough left.
    ///
    /// Every transaction here opens with a write, so sqlite takes the write
    /// lock up front and concurrent callers wait on the busy timeout instead
    /// of failing a read-to-write upgrade.
    pub async fn pre_consume_token_quota(
        &self,
        token_id: &str,
        user_id: &str,
        amount: i64,
    ) -> Result<(), BillingError> {
        if amount <= 0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(BillingError::internal)?;
        let updated = sqlx::query(
            r#"UPDATE tokens
               SET remain_quota = CASE WHEN unlimited_quota = 1 THEN remain_quota
                                       ELSE remain_quota - ? END,
                   used_quota = used_quota + ?
               WHERE id = ? AND enabled = 1 AND (unlimited_quota = 1 OR remain_quota >= ?)"#,
        )
        .bind(amount)
        .bind(amount)
        .bind(token_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(BillingError::internal)?;
        if updated.rows_affected() == 0 {
            let row = sqlx::query("SELECT enabled, remain_quota FROM tokens WHERE id = ?")
                .bind(token_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(BillingError::internal)?;
            return Err(match row {
                None => BillingError::new(BillingErrorKind::NotFound, "token not found"),
                Some(row) if row.try_get::<i32, _>("enabled").unwrap_or(0) != 1 => {
                    BillingError::new(BillingErrorKind::Disabled, "token is disabled")
                }
                Some(row) => {
                    let remain: i64 = row.try_get("remain_quota").unwrap_or(0);
                    BillingError::new(
                        BillingErrorKind::InsufficientBalance,
                        format!(
                            "token quota is not enough, token remain quota: {remain}, need: {amount}"
                        ),
                    )
                }
            });
        }

        let updated = sqlx::query(
            "UPDATE users SET quota = quota - ?, updated_at = ? WHERE id = ? AND quota >= ?",
        )
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(BillingError::internal)?;
        if updated.rows_affected() == 0 {
            return Err(BillingError::new(
                BillingErrorKind::InsufficientBalance,
                "user quota is not enough",
            ));
        }

        tx.commit().await.map_err(BillingError::internal)?;
        Ok(())
    }

    /// Applies a signed settlement delta to token and owner. Positive charges
    /// more, negative gives back. Balances saturate at zero; a charge that
    /// drains a balance is logged.
    pub async fn post_consume_token_quota(
        &self,
        token_id: &str,
        user_id: &str,
        delta: i64,
    ) -> Result<(), String> {
        if delta == 0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;

        let token = sqlx::query(
            r#"UPDATE tokens
               SET remain_quota = CASE WHEN unlimited_quota = 1 THEN remain_quota
                                       ELSE MAX(remain_quota - ?, 0) END,
                   used_quota = MAX(used_quota + ?, 0)
               WHERE id = ?
               RETURNING remain_quota, unlimited_quota"#,
        )
        .bind(delta)
        .bind(delta)
        .bind(token_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
        let Some(token) = token else {
            return Err(format!("token {token_id} not found"));
        };
        let unlimited = token.try_get::<i32, _>("unlimited_quota").unwrap_or(0) == 1;
        let remain: i64 = token.try_get("remain_quota").map_err(|e| e.to_string())?;
        if delta > 0 && !unlimited && remain == 0 {
            tracing::warn!(token_id, delta, "token quota exhausted during settlement");
        }

        let user = sqlx::query(
            r#"UPDATE users SET quota = MAX(quota - ?, 0), updated_at = ?
               WHERE id = ?
               RETURNING quota"#,
        )
        .bind(delta)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
        let Some(user) = user else {
            return Err(format!("user {user_id} not found"));
        };
        let quota: i64 = user.try_get("quota").map_err(|e| e.to_string())?;
        if delta > 0 && quota == 0 {
            tracing::warn!(user_id, delta, "user quota exhausted during settlement");
        }

        tx.commit().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn add_user_usage(&self, user_id: &str, quota: i64, requests: i64) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE users SET used_quota = used_quota + ?, request_count = request_count + ?
               WHERE id = ?"#,
        )
        .bind(quota)
        .bind(requests)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn insert_consume_log(&self, log: InsertConsumeLog) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO consume_logs (id, user_id, token_id, token_name, channel_id, model,
                   prompt_tokens, completion_tokens, quota, content, use_time_seconds, is_stream,
                   created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&log.user_id)
        .bind(&log.token_id)
        .bind(&log.token_name)
        .bind(&log.channel_id)
        .bind(&log.model)
        .bind(log.prompt_tokens)
        .bind(log.completion_tokens)
        .bind(log.quota)
        .bind(&log.content)
        .bind(log.use_time_seconds)
        .bind(if log.is_stream { 1 } else { 0 })
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn list_consume_logs(&self, user_id: &str, limit: i64) -> Result<Vec<ConsumeLog>, String> {
        let rows = sqlx::query(
            "SELECT * FROM consume_logs WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_consume_log).collect()
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, String> {
    Ok(User {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        username: row.try_get("username").map_err(|e| e.to_string())?,
        group: row
            .try_get("user_group")
            .unwrap_or_else(|_| "default".to_string()),
        quota: row.try_get("quota").map_err(|e| e.to_string())?,
        used_quota: row.try_get("used_quota").unwrap_or(0),
        request_count: row.try_get("request_count").unwrap_or(0),
        enabled: row.try_get::<i32, _>("enabled").unwrap_or(1) == 1,
        created_at: parse_time(&row.try_get::<String, _>("created_at").map_err(|e| e.to_string())?)?,
    })
}

fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<Token, String> {
    let expires_at: Option<String> = row.try_get("expires_at").map_err(|e| e.to_string())?;
    Ok(Token {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
        key_hash: row.try_get("key_hash").map_err(|e| e.to_string())?,
        remain_quota: row.try_get("remain_quota").map_err(|e| e.to_string())?,
        unlimited_quota: row.try_get::<i32, _>("unlimited_quota").unwrap_or(0) == 1,
        used_quota: row.try_get("used_quota").unwrap_or(0),
        enabled: row.try_get::<i32, _>("enabled").unwrap_or(1) == 1,
        created_at: parse_time(&row.try_get::<String, _>("created_at").map_err(|e| e.to_string())?)?,
        expires_at: expires_at.as_deref().map(parse_time).transpose()?,
    })
}

fn row_to_consume_log(row: &sqlx::sqlite::SqliteRow) -> Result<ConsumeLog, String> {
    Ok(ConsumeLog {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        token_id: row.try_get("token_id").map_err(|e| e.to_string())?,
        token_name: row.try_get("token_name").map_err(|e| e.to_string())?,
        channel_id: row.try_get("channel_id").map_err(|e| e.to_string())?,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        prompt_tokens: row.try_get("prompt_tokens").unwrap_or(0),
        completion_tokens: row.try_get("completion_tokens").unwrap_or(0),
        quota: row.try_get("quota").unwrap_or(0),
        content: row.try_get("content").unwrap_or_default(),
        use_time_seconds: row.try_get("use_time_seconds").unwrap_or(0),
        is_stream: row.try_get::<i32, _>("is_stream").unwrap_or(0) == 1,
        created_at: parse_time(&row.try_get::<String, _>("created_at").map_err(|e| e.to_string())?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_stable_hex() {
        let hash = hash_token_key("sk-abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token_key("sk-abc"));
        assert_ne!(hash, hash_token_key("sk-abd"));
    }

    #[test]
    fn generated_keys_have_prefix() {
        let key = generate_token_key();
        assert!(key.starts_with("sk-"));
        assert_eq!(key.len(), 51);
    }
}
