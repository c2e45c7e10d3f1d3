//! SSH 连接池
//!
//! 每个 (user, host) 复用一个会话。池是显式构造的实例，
//! 由入口进程持有，并在所有退出路径上调用 `close_all`。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::client::Connector;
use super::session::RemoteSession;
use crate::config::HostTarget;
use crate::error::SyncResult;

/// 连接池键
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user: String,
    pub host: String,
}

impl SessionKey {
    pub fn new(host: &str, user: &str) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// 每个键一个槽位，同一键的并发获取只拨号一次
type Slot = Arc<OnceCell<Arc<RemoteSession>>>;

/// 会话池
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    /// 返回缓存会话前先执行空命令
    probe: bool,
    sessions: Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, probe: bool) -> Self {
        Self {
            connector,
            probe,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 获取（或建立）目标机器的会话
    pub async fn acquire(&self, target: &HostTarget) -> SyncResult<Arc<RemoteSession>> {
        let key = SessionKey::new(&target.host, &target.user);

        let slot = self.slot(&key).await;
        if let Some(session) = slot.get() {
            if self.is_alive(session).await {
                debug!(key = %key, "Reusing pooled SSH session");
                return Ok(session.clone());
            }
            warn!(key = %key, "Pooled SSH session is stale, redialing");
            self.evict(&key, &slot).await;
            session.close().await;
            return self.dial(&key, target, &self.slot(&key).await).await;
        }

        self.dial(&key, target, &slot).await
    }

    /// 移除并关闭某个会话
    pub async fn invalidate(&self, host: &str, user: &str) {
        let key = SessionKey::new(host, user);
        let removed = self.sessions.lock().await.remove(&key);
        if let Some(session) = removed.as_ref().and_then(|slot| slot.get()) {
            debug!(key = %key, "Invalidating pooled SSH session");
            session.close().await;
        }
    }

    /// 关闭并清空全部会话
    pub async fn close_all(&self) {
        let drained: Vec<(SessionKey, Slot)> = self.sessions.lock().await.drain().collect();
        for (key, slot) in drained {
            if let Some(session) = slot.get() {
                debug!(key = %key, "Closing SSH session");
                session.close().await;
            }
        }
        info!("SSH session pool closed");
    }

    /// 当前缓存的会话数量
    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, key: &SessionKey) -> Slot {
        self.sessions
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn dial(
        &self,
        key: &SessionKey,
        target: &HostTarget,
        slot: &Slot,
    ) -> SyncResult<Arc<RemoteSession>> {
        let session = slot
            .get_or_try_init(|| async {
                info!(key = %key, "Opening SSH session");
                let transport = self.connector.connect(target).await?;
                Ok::<_, crate::error::SyncError>(Arc::new(RemoteSession::new(
                    transport,
                    &target.host,
                    &target.user,
                )))
            })
            .await;

        match session {
            Ok(session) => Ok(session.clone()),
            Err(e) => {
                // 失败的槽位不保留，下次重新拨号
                self.evict(key, slot).await;
                Err(e)
            }
        }
    }

    /// 仅当槽位仍是同一个时才移除
    async fn evict(&self, key: &SessionKey, slot: &Slot) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            sessions.remove(key);
        }
    }

    async fn is_alive(&self, session: &RemoteSession) -> bool {
        if session.is_closed() {
            return false;
        }
        if self.probe {
            return session.execute("true").await.is_ok();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostRole;
    use crate::error::SyncError;
    use crate::services::ssh::mock::MockConnector;
    use std::path::PathBuf;

    fn target(host: &str, user: &str) -> HostTarget {
        HostTarget {
            role: HostRole::Server,
            host: host.to_string(),
            user: user.to_string(),
            ssh_key: PathBuf::from("/tmp/id_ed25519"),
            strict_host_key: false,
        }
    }

    fn pool(probe: bool) -> (Arc<MockConnector>, SessionPool) {
        let connector = Arc::new(MockConnector::new());
        let pool = SessionPool::new(connector.clone(), probe);
        (connector, pool)
    }

    #[test]
    fn test_session_key_display() {
        assert_eq!(SessionKey::new("vps.example.com", "root").to_string(), "root@vps.example.com");
    }

    #[tokio::test]
    async fn test_acquire_reuses_session() {
        let (connector, pool) = pool(false);
        let t = target("vps.example.com", "root");

        let a = pool.acquire(&t).await.unwrap();
        let b = pool.acquire(&t).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.dials(), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_users_get_distinct_sessions() {
        let (connector, pool) = pool(false);

        let a = pool.acquire(&target("vps.example.com", "root")).await.unwrap();
        let b = pool.acquire(&target("vps.example.com", "deploy")).await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_dials_once() {
        let (connector, pool) = pool(false);
        let t = target("vps.example.com", "root");

        let (a, b) = tokio::join!(pool.acquire(&t), pool.acquire(&t));

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn test_close_all_forces_fresh_dial() {
        let (connector, pool) = pool(false);
        let t = target("vps.example.com", "root");

        let a = pool.acquire(&t).await.unwrap();
        pool.close_all().await;

        assert!(pool.is_empty().await);
        assert!(a.is_closed());

        let b = pool.acquire(&t).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_closes_and_removes() {
        let (connector, pool) = pool(false);
        let t = target("home.lan", "root");

        let a = pool.acquire(&t).await.unwrap();
        pool.invalidate("home.lan", "root").await;
        assert!(a.is_closed());

        pool.acquire(&t).await.unwrap();
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_closed_session_is_redialed() {
        let (connector, pool) = pool(false);
        let t = target("vps.example.com", "root");

        let a = pool.acquire(&t).await.unwrap();
        connector
            .transport_for("vps.example.com")
            .unwrap()
            .set_closed(true);

        let b = pool.acquire(&t).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!b.is_closed());
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_probe_failure_triggers_redial() {
        let (connector, pool) = pool(true);
        let t = target("vps.example.com", "root");

        pool.acquire(&t).await.unwrap();
        connector
            .transport_for("vps.example.com")
            .unwrap()
            .on_exit("true", 255, "", "broken pipe");

        pool.acquire(&t).await.unwrap();
        assert_eq!(connector.dials(), 2);

        // 新连接探测正常，继续复用
        pool.acquire(&t).await.unwrap();
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_connection_error_propagates_and_is_not_cached() {
        let (connector, pool) = pool(false);
        connector.fail_host("down.example.com");
        let t = target("down.example.com", "root");

        let err = pool.acquire(&t).await.err().unwrap();
        assert!(matches!(err, SyncError::Connection { .. }));
        assert!(pool.is_empty().await);

        pool.acquire(&t).await.err().unwrap();
        assert_eq!(connector.dials(), 2);
    }
}
