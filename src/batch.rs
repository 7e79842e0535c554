use crate::channels::ChannelStore;
use crate::users::UserStore;
use dashmap::DashMap;

/// Buffers usage counters in memory and writes them out in bulk.
///
/// Only counters go through here. Balances are always written immediately so
/// that reservations stay exact.
#[derive(Default)]
pub struct BatchUpdater {
    user_usage: DashMap<String, (i64, i64)>,
    channel_usage: DashMap<String, i64>,
}

impl BatchUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user_usage(&self, user_id: &str, quota: i64) {
        let mut entry = self.user_usage.entry(user_id.to_string()).or_insert((0, 0));
        entry.0 += quota;
        entry.1 += 1;
    }

    pub fn record_channel_usage(&self, channel_id: &str, quota: i64) {
        *self
            .channel_usage
            .entry(channel_id.to_string())
            .or_insert(0) += quota;
    }

    pub fn is_empty(&self) -> bool {
        self.user_usage.is_empty() && self.channel_usage.is_empty()
    }

    /// Drains every buffered counter into the stores. Entries that fail to
    /// write are put back for the next flush.
    pub async fn flush(&self, users: &UserStore, channels: &ChannelStore) -> usize {
        let mut written = 0;

        let user_ids: Vec<String> = self.user_usage.iter().map(|e| e.key().clone()).collect();
        for user_id in user_ids {
            let Some((_, (quota, requests))) = self.user_usage.remove(&user_id) else {
                continue;
            };
            match users.add_user_usage(&user_id, quota, requests).await {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::error!(user_id = %user_id, "failed to flush user usage: {err}");
                    let mut entry = self.user_usage.entry(user_id).or_insert((0, 0));
                    entry.0 += quota;
                    entry.1 += requests;
                }
            }
        }

        let channel_ids: Vec<String> =
            self.channel_usage.iter().map(|e| e.key().clone()).collect();
        for channel_id in channel_ids {
            let Some((_, quota)) = self.channel_usage.remove(&channel_id) else {
                continue;
            };
            match channels.add_used_quota(&channel_id, quota).await {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::error!(channel_id = %channel_id, "failed to flush channel usage: {err}");
                    *self.channel_usage.entry(channel_id).or_insert(0) += quota;
                }
            }
        }

        if written > 0 {
            tracing::debug!(written, "batch usage flushed");
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_key() {
        let batch = BatchUpdater::new();
        batch.record_user_usage("u1", 10);
        batch.record_user_usage("u1", 5);
        batch.record_channel_usage("c1", 7);
        batch.record_channel_usage("c1", 3);
        assert_eq!(*batch.user_usage.get("u1").unwrap(), (15, 2));
        assert_eq!(*batch.channel_usage.get("c1").unwrap(), 10);
        assert!(!batch.is_empty());
    }
}
