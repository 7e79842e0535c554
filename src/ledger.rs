use crate::batch::BatchUpdater;
use crate::channels::ChannelStore;
use crate::error::RelayError;
use crate::pricing::{Pricing, billing_model_name};
use crate::relay::dto::Usage;
use crate::users::{BillingErrorKind, InsertConsumeLog, UserStore};
use dashmap::DashMap;
use std::sync::Arc;

/// A reservation is skipped when the account holds more than this many
/// times the requested amount.
pub const TRUST_MULTIPLIER: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("user quota is not enough")]
    InsufficientQuota,
    #[error("{0}")]
    InsufficientCredentialQuota(String),
    #[error("quota store error: {0}")]
    Store(String),
}

impl From<LedgerError> for RelayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientQuota => RelayError::InsufficientQuota,
            LedgerError::InsufficientCredentialQuota(msg) => {
                RelayError::InsufficientCredentialQuota(msg)
            }
            LedgerError::Store(msg) => RelayError::internal("quota_store_error", msg),
        }
    }
}

/// Who pays for a request.
#[derive(Debug, Clone)]
pub struct Payer {
    pub user_id: String,
    pub token_id: String,
    pub token_name: String,
    /// Token balance as of authentication.
    pub token_remain_quota: i64,
    pub token_unlimited: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub reserved: i64,
    /// Account balance seen when the reservation was decided.
    pub user_quota: i64,
    pub trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub quota: i64,
    pub quota_delta: i64,
    pub content: String,
}

/// Everything settlement needs to know about a finished request.
#[derive(Debug, Clone)]
pub struct SettleRequest<'a> {
    pub payer: &'a Payer,
    pub channel_id: &'a str,
    pub model: &'a str,
    pub pricing: &'a Pricing,
    pub usage: Usage,
    pub reservation: Reservation,
    pub sensitive_words: &'a [String],
    pub use_time_seconds: i64,
    pub is_stream: bool,
    pub log_consume: bool,
}

/// Cached account balances. All mutations are check-and-set under the
/// entry's shard lock.
#[derive(Default)]
pub struct QuotaCache {
    balances: DashMap<String, i64>,
}

impl QuotaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<i64> {
        self.balances.get(user_id).map(|v| *v)
    }

    pub async fn get_or_load(&self, users: &UserStore, user_id: &str) -> Result<i64, String> {
        if let Some(quota) = self.get(user_id) {
            return Ok(quota);
        }
        self.refresh(users, user_id).await
    }

    /// Takes `amount` if the cached balance covers it.
    pub fn try_decrease(&self, user_id: &str, amount: i64) -> bool {
        match self.balances.get_mut(user_id) {
            Some(mut balance) if *balance >= amount => {
                *balance -= amount;
                true
            }
            _ => false,
        }
    }

    pub fn increase(&self, user_id: &str, amount: i64) {
        if let Some(mut balance) = self.balances.get_mut(user_id) {
            *balance += amount;
        }
    }

    pub async fn refresh(&self, users: &UserStore, user_id: &str) -> Result<i64, String> {
        let quota = users.get_user_quota(user_id).await?;
        self.balances.insert(user_id.to_string(), quota);
        Ok(quota)
    }

    /// Reloads every cached balance from the store.
    pub async fn refresh_all(&self, users: &UserStore) -> Result<usize, String> {
        let ids: Vec<String> = self.balances.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let quotas = users.list_user_quotas(&ids).await?;
        let count = quotas.len();
        for (id, quota) in quotas {
            self.balances.insert(id, quota);
        }
        Ok(count)
    }
}

#[derive(Clone)]
pub struct Ledger {
    users: UserStore,
    channels: ChannelStore,
    cache: Arc<QuotaCache>,
    batch: Option<Arc<BatchUpdater>>,
}

impl Ledger {
    pub fn new(
        users: UserStore,
        channels: ChannelStore,
        cache: Arc<QuotaCache>,
        batch: Option<Arc<BatchUpdater>>,
    ) -> Self {
        Self {
            users,
            channels,
            cache,
            batch,
        }
    }

    pub fn cache(&self) -> &QuotaCache {
        &self.cache
    }

    /// Withholds `amount` before the upstream call. High-balance accounts
    /// skip the withholding and get `reserved == 0`.
    pub async fn reserve(&self, payer: &Payer, amount: i64) -> Result<Reservation, LedgerError> {
        let user_quota = self
            .cache
            .get_or_load(&self.users, &payer.user_id)
            .await
            .map_err(LedgerError::Store)?;
        if user_quota <= 0 || user_quota - amount < 0 {
            return Err(LedgerError::InsufficientQuota);
        }

        let headroom = amount.saturating_mul(TRUST_MULTIPLIER);
        if user_quota > headroom && (payer.token_unlimited || payer.token_remain_quota >= headroom)
        {
            tracing::info!(
                user_id = %payer.user_id,
                user_quota,
                amount,
                "user has enough quota, trusted and no need to pre-consume"
            );
            return Ok(Reservation {
                reserved: 0,
                user_quota,
                trusted: true,
            });
        }

        if amount > 0 {
            if !self.cache.try_decrease(&payer.user_id, amount) {
                return Err(LedgerError::InsufficientQuota);
            }
            if let Err(err) = self
                .users
                .pre_consume_token_quota(&payer.token_id, &payer.user_id, amount)
                .await
            {
                self.cache.increase(&payer.user_id, amount);
                return Err(match err.kind {
                    BillingErrorKind::InsufficientBalance | BillingErrorKind::Disabled => {
                        LedgerError::InsufficientCredentialQuota(err.message)
                    }
                    BillingErrorKind::NotFound | BillingErrorKind::Internal => {
                        LedgerError::Store(err.message)
                    }
                });
            }
        }

        Ok(Reservation {
            reserved: amount,
            user_quota,
            trusted: false,
        })
    }

    /// Gives a reservation back in full.
    pub async fn refund(&self, payer: &Payer, reserved: i64) -> Result<(), LedgerError> {
        if reserved == 0 {
            return Ok(());
        }
        self.users
            .post_consume_token_quota(&payer.token_id, &payer.user_id, -reserved)
            .await
            .map_err(LedgerError::Store)?;
        self.cache.increase(&payer.user_id, reserved);
        Ok(())
    }

    /// Fire-and-forget [`Ledger::refund`]. Failures are logged, not retried.
    pub fn spawn_refund(&self, payer: &Payer, reserved: i64) {
        if reserved == 0 {
            return;
        }
        let ledger = self.clone();
        let payer = payer.clone();
        tokio::spawn(async move {
            if let Err(err) = ledger.refund(&payer, reserved).await {
                tracing::error!(
                    user_id = %payer.user_id,
                    token_id = %payer.token_id,
                    reserved,
                    "failed to return pre-consumed quota: {err}"
                );
            }
        });
    }

    /// Computes the final charge and reconciles it against the reservation.
    /// Zero total usage charges nothing but still gives the reservation back.
    /// Store failures are logged; the consume log and usage counters are
    /// written regardless.
    pub async fn settle(&self, req: SettleRequest<'_>) -> Settlement {
        let payer = req.payer;
        let mut quota = req.pricing.charge(&req.usage);
        let mut content = req.pricing.describe();

        if req.usage.total_tokens == 0 {
            quota = 0;
            content.push_str(" (probable upstream timeout)");
            tracing::error!(
                user_id = %payer.user_id,
                channel_id = %req.channel_id,
                model = %req.model,
                reserved = req.reservation.reserved,
                "total tokens is 0, cannot consume quota"
            );
        } else if !req.sensitive_words.is_empty() {
            content.push_str(&format!(
                ", sensitive words: {}",
                req.sensitive_words.join(", ")
            ));
        }

        let quota_delta = quota - req.reservation.reserved;
        if let Err(err) = self
            .users
            .post_consume_token_quota(&payer.token_id, &payer.user_id, quota_delta)
            .await
        {
            tracing::error!(
                user_id = %payer.user_id,
                token_id = %payer.token_id,
                quota,
                quota_delta,
                "failed to reconcile quota: {err}"
            );
        }
        if let Err(err) = self.cache.refresh(&self.users, &payer.user_id).await {
            tracing::warn!(user_id = %payer.user_id, "failed to refresh user quota cache: {err}");
        }

        if req.usage.total_tokens != 0 {
            self.record_usage(&payer.user_id, req.channel_id, quota).await;
        }

        if req.log_consume {
            let log = InsertConsumeLog {
                user_id: payer.user_id.clone(),
                token_id: payer.token_id.clone(),
                token_name: payer.token_name.clone(),
                channel_id: req.channel_id.to_string(),
                model: billing_model_name(req.model),
                prompt_tokens: req.usage.prompt_tokens,
                completion_tokens: req.usage.completion_tokens,
                quota,
                content: content.clone(),
                use_time_seconds: req.use_time_seconds,
                is_stream: req.is_stream,
            };
            if let Err(err) = self.users.insert_consume_log(log).await {
                tracing::error!(user_id = %payer.user_id, "failed to record consume log: {err}");
            }
        }

        metrics::counter!("relay_quota_charged_total").increment(quota.max(0) as u64);
        tracing::debug!(
            user_id = %payer.user_id,
            channel_id = %req.channel_id,
            quota,
            quota_delta,
            "request settled"
        );

        Settlement {
            quota,
            quota_delta,
            content,
        }
    }

    async fn record_usage(&self, user_id: &str, channel_id: &str, quota: i64) {
        if let Some(batch) = &self.batch {
            batch.record_user_usage(user_id, quota);
            batch.record_channel_usage(channel_id, quota);
            return;
        }
        if let Err(err) = self.users.add_user_usage(user_id, quota, 1).await {
            tracing::error!(user_id, "failed to update user usage: {err}");
        }
        if let Err(err) = self.channels.add_used_quota(channel_id, quota).await {
            tracing::error!(channel_id, "failed to update channel used quota: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_decrease_is_checked() {
        let cache = QuotaCache::new();
        cache.balances.insert("u".into(), 100);
        assert!(cache.try_decrease("u", 60));
        assert!(!cache.try_decrease("u", 60));
        assert_eq!(cache.get("u"), Some(40));
        cache.increase("u", 60);
        assert_eq!(cache.get("u"), Some(100));
    }

    #[test]
    fn unknown_user_cannot_be_decreased() {
        let cache = QuotaCache::new();
        assert!(!cache.try_decrease("missing", 1));
    }

    #[test]
    fn ledger_errors_map_to_relay_errors() {
        let err: RelayError = LedgerError::InsufficientQuota.into();
        assert!(matches!(err, RelayError::InsufficientQuota));
        let err: RelayError = LedgerError::InsufficientCredentialQuota("x".into()).into();
        assert!(matches!(err, RelayError::InsufficientCredentialQuota(_)));
    }
}
