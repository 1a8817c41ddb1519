//! 按用户划分的互斥锁注册表与会话记录存储
use crate::core::ChatMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// 会话记录保留的最近问答对数量
const MAX_HISTORY_PAIRS: usize = 10;

/// 按用户粒度的互斥锁注册表。
/// 同一用户的锁对象在首次引用时创建，进程存续期间保持同一实例；
/// 不同用户之间互不阻塞。
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（必要时创建）某用户的互斥锁
    pub async fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for UserLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// 以用户为键的会话记录，按问答对组织，超出上限先淘汰最早的记录。
/// 读取-问答-写回的跨调用原子性由调用方持有UserLocks中对应的锁来保证，
/// 本结构只保证单次访问内部map的一致性。
pub struct ConversationStore {
    histories: Mutex<HashMap<String, VecDeque<(ChatMessage, ChatMessage)>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// 按时间顺序返回某用户的全部会话消息
    pub async fn history(&self, key: &str) -> Vec<ChatMessage> {
        let histories = self.histories.lock().await;
        match histories.get(key) {
            Some(pairs) => pairs
                .iter()
                .flat_map(|(user, assistant)| [user.clone(), assistant.clone()])
                .collect(),
            None => Vec::new(),
        }
    }

    /// 追加一组问答
    pub async fn append(&self, key: &str, user_msg: ChatMessage, assistant_msg: ChatMessage) {
        let mut histories = self.histories.lock().await;
        let pairs = histories.entry(key.to_owned()).or_default();
        pairs.push_back((user_msg, assistant_msg));
        while pairs.len() > MAX_HISTORY_PAIRS {
            pairs.pop_front();
        }
    }

    /// 清空某用户的会话记录
    pub async fn clear(&self, key: &str) {
        let mut histories = self.histories.lock().await;
        histories.remove(key);
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    fn pair(n: usize) -> (ChatMessage, ChatMessage) {
        (
            ChatMessage::new(Role::User, format!("q{n}")),
            ChatMessage::new(Role::Assistant, format!("a{n}")),
        )
    }

    #[tokio::test]
    async fn history_is_capped_with_fifo_eviction() {
        let store = ConversationStore::new();
        for n in 0..15 {
            let (user, assistant) = pair(n);
            store.append("u", user, assistant).await;
        }
        let history = store.history("u").await;
        assert_eq!(history.len(), MAX_HISTORY_PAIRS * 2);
        // 最早的5对已被淘汰，序列从第6对开始
        assert_eq!(history[0].content, "q5");
        assert_eq!(history[1].content, "a5");
        assert_eq!(history.last().unwrap().content, "a14");
    }

    #[tokio::test]
    async fn clear_removes_history() {
        let store = ConversationStore::new();
        let (user, assistant) = pair(0);
        store.append("u", user, assistant).await;
        store.clear("u").await;
        assert!(store.history("u").await.is_empty());
    }

    #[tokio::test]
    async fn same_key_returns_same_lock() {
        let locks = UserLocks::new();
        let a = locks.acquire("u").await;
        let b = locks.acquire("u").await;
        assert!(Arc::ptr_eq(&a, &b));
        let c = locks.acquire("v").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
