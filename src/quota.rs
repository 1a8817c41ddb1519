//! 每位用户的每日对话配额。
//! 检查与计数在同一临界区内完成，同一用户的并发请求不会超发。
use chrono::{FixedOffset, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

// 配额按北京时间（UTC+8）的自然日重置
const TZ_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone, Copy, PartialEq)]
struct DayCount {
    date: NaiveDate,
    count: u32,
}

/// 以用户为键的每日计数器。
/// 键对应的条目在首次访问时创建，进程存续期间不作回收（已知的内存增长权衡）。
pub struct DailyQuota {
    entries: Mutex<HashMap<String, Arc<Mutex<DayCount>>>>,
}

impl DailyQuota {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn today() -> NaiveDate {
        let tz = FixedOffset::east_opt(TZ_OFFSET_SECS).expect("offset should be valid");
        Utc::now().with_timezone(&tz).date_naive()
    }

    async fn entry(&self, key: &str, today: NaiveDate) -> Arc<Mutex<DayCount>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(key.to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(DayCount {
                    date: today,
                    count: 0,
                }))
            })
            .clone()
    }

    /// 检查并占用一次当日配额。返回是否放行以及占用后的计数。
    pub async fn check_and_increment(&self, key: &str, limit: u32) -> (bool, u32) {
        self.check_and_increment_on(key, limit, Self::today()).await
    }

    /// 当日剩余次数
    pub async fn remaining(&self, key: &str, limit: u32) -> u32 {
        self.remaining_on(key, limit, Self::today()).await
    }

    /// 当日已用与剩余次数。两个值在同一临界区内读出，
    /// 并发自增不会让二者加起来偏离限额。
    pub async fn usage(&self, key: &str, limit: u32) -> (u32, u32) {
        self.usage_on(key, limit, Self::today()).await
    }

    async fn check_and_increment_on(&self, key: &str, limit: u32, today: NaiveDate) -> (bool, u32) {
        let entry = self.entry(key, today).await;
        let mut day = entry.lock().await;
        // 日期翻转后计数归零
        if day.date != today {
            day.date = today;
            day.count = 0;
        }
        if day.count >= limit {
            return (false, day.count);
        }
        day.count += 1;
        (true, day.count)
    }

    async fn remaining_on(&self, key: &str, limit: u32, today: NaiveDate) -> u32 {
        limit.saturating_sub(self.used_on(key, today).await)
    }

    async fn usage_on(&self, key: &str, limit: u32, today: NaiveDate) -> (u32, u32) {
        let entry = self.entry(key, today).await;
        let day = entry.lock().await;
        let used = if day.date != today { 0 } else { day.count };
        (used, limit.saturating_sub(used))
    }

    async fn used_on(&self, key: &str, today: NaiveDate) -> u32 {
        let entry = self.entry(key, today).await;
        let day = entry.lock().await;
        if day.date != today {
            0
        } else {
            day.count
        }
    }
}

impl Default for DailyQuota {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn concurrent_increments_never_exceed_limit() {
        let quota = Arc::new(DailyQuota::new());
        let limit = 5u32;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let quota = quota.clone();
            handles.push(tokio::spawn(async move {
                quota.check_and_increment("user-a", limit).await
            }));
        }
        let mut granted_counts = Vec::new();
        for h in handles {
            let (allowed, count) = h.await.unwrap();
            if allowed {
                granted_counts.push(count);
            }
        }
        granted_counts.sort_unstable();
        assert_eq!(granted_counts, vec![1, 2, 3, 4, 5]);
        assert_eq!(quota.remaining("user-a", limit).await, 0);
    }

    #[tokio::test]
    async fn usage_pair_stays_consistent_under_concurrent_increments() {
        let quota = Arc::new(DailyQuota::new());
        let limit = 5u32;

        let mut writers = Vec::new();
        for _ in 0..limit {
            let quota = quota.clone();
            writers.push(tokio::spawn(async move {
                quota.check_and_increment("user-d", limit).await
            }));
        }
        let mut readers = Vec::new();
        for _ in 0..20 {
            let quota = quota.clone();
            readers.push(tokio::spawn(async move {
                quota.usage("user-d", limit).await
            }));
        }

        for h in writers {
            h.await.unwrap();
        }
        // 单临界区读出的快照，二者之和恒等于限额
        for h in readers {
            let (used, remaining) = h.await.unwrap();
            assert_eq!(used + remaining, limit);
        }
        assert_eq!(quota.usage("user-d", limit).await, (5, 0));
    }

    #[tokio::test]
    async fn usage_treats_stale_entry_as_fresh() {
        let quota = DailyQuota::new();
        let yesterday = DailyQuota::today() - Duration::days(1);
        for _ in 0..3 {
            quota.check_and_increment_on("user-e", 5, yesterday).await;
        }
        assert_eq!(quota.usage_on("user-e", 5, DailyQuota::today()).await, (0, 5));
    }

    #[tokio::test]
    async fn different_keys_do_not_interfere() {
        let quota = DailyQuota::new();
        assert_eq!(quota.check_and_increment("a", 1).await, (true, 1));
        assert_eq!(quota.check_and_increment("b", 1).await, (true, 1));
        assert_eq!(quota.check_and_increment("a", 1).await, (false, 1));
    }

    #[tokio::test]
    async fn stale_date_resets_count() {
        let quota = DailyQuota::new();
        let yesterday = DailyQuota::today() - Duration::days(1);
        let today = DailyQuota::today();

        for _ in 0..5 {
            quota.check_and_increment_on("user-b", 5, yesterday).await;
        }
        assert_eq!(
            quota.check_and_increment_on("user-b", 5, yesterday).await,
            (false, 5)
        );

        // 新的一天，旧计数作废
        assert_eq!(
            quota.check_and_increment_on("user-b", 5, today).await,
            (true, 1)
        );
        assert_eq!(quota.remaining_on("user-b", 5, today).await, 4);
    }

    #[tokio::test]
    async fn remaining_treats_stale_entry_as_fresh() {
        let quota = DailyQuota::new();
        let yesterday = DailyQuota::today() - Duration::days(1);
        quota.check_and_increment_on("user-c", 5, yesterday).await;
        assert_eq!(quota.remaining_on("user-c", 5, DailyQuota::today()).await, 5);
    }
}
