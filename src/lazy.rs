//! 并发安全的一次性延迟构造
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// 只构造一次的延迟容器。
/// 快路径无锁竞争地读取已发布的值；慢路径在初始化锁内二次检查后执行构造。
/// 构造失败不会发布任何值，后续调用会重新尝试构造。
pub struct Lazy<T> {
    slot: RwLock<Option<Arc<T>>>,
    init_lock: Mutex<()>,
}

impl<T> Lazy<T> {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
            init_lock: Mutex::new(()),
        }
    }

    /// 返回已构造的值，必要时执行一次构造。
    /// 任意并发首次调用下构造闭包至多运行一次，所有调用方得到同一实例。
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let slot = self.slot.read().await;
            if let Some(value) = slot.as_ref() {
                return Ok(value.clone());
            }
        }

        let _guard = self.init_lock.lock().await;

        // 排队期间可能已有任务完成构造
        {
            let slot = self.slot.read().await;
            if let Some(value) = slot.as_ref() {
                return Ok(value.clone());
            }
        }

        let value = Arc::new(init().await?);
        *self.slot.write().await = Some(value.clone());
        Ok(value)
    }
}

impl<T> Default for Lazy<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_first_calls_construct_once() {
        let lazy = Arc::new(Lazy::<u32>::new());
        let constructions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lazy = lazy.clone();
            let constructions = constructions.clone();
            handles.push(tokio::spawn(async move {
                lazy.get_or_try_init(|| async {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, ()>(42)
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(*h.await.unwrap(), 42);
        }
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let lazy = Lazy::<u32>::new();
        let attempts = AtomicUsize::new(0);

        let first = lazy
            .get_or_try_init(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<u32, &str>("boom")
            })
            .await;
        assert!(first.is_err());

        let second = lazy
            .get_or_try_init(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(7)
            })
            .await;
        assert_eq!(*second.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
