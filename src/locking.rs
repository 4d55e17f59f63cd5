//! 内存文件名锁：串行化同名固件的上传。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

/// Manages asynchronous mutexes keyed by firmware filename.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    /// 创建新的锁管理器实例。
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取文件名锁，超时返回 Err。
    pub async fn lock_name_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, ()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // 清理无人持有的锁，避免表随文件名无限增长
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lock_on_same_name_times_out() {
        let manager = LockManager::new();
        let _guard = manager
            .lock_name_with_timeout("fw.bin", Duration::from_millis(50))
            .await
            .expect("first lock");
        let second = manager
            .lock_name_with_timeout("fw.bin", Duration::from_millis(50))
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn different_names_do_not_block() {
        let manager = LockManager::new();
        let _a = manager
            .lock_name_with_timeout("a.bin", Duration::from_millis(50))
            .await
            .expect("lock a");
        let b = manager
            .lock_name_with_timeout("b.bin", Duration::from_millis(50))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn lock_is_reusable_after_release() {
        let manager = LockManager::new();
        let guard = manager
            .lock_name_with_timeout("fw.bin", Duration::from_millis(50))
            .await
            .expect("first lock");
        drop(guard);
        let again = manager
            .lock_name_with_timeout("fw.bin", Duration::from_millis(50))
            .await;
        assert!(again.is_ok());
    }
}
