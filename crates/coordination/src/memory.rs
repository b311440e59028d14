//! 内存协调后端
//!
//! 单进程实现，语义与生产后端对齐：临时节点随句柄释放自动删除并
//! 产生 Removed 事件，互斥锁为命名异步锁。测试与单机嵌入部署使用。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use flowmaster_errors::MasterResult;

use crate::registry::{ChildEvent, CoordRegistry, EphemeralHandle, LockGuard};

#[derive(Debug, Clone)]
struct NodeEntry {
    data: String,
    ephemeral: bool,
    generation: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Inner {
    nodes: Mutex<BTreeMap<String, NodeEntry>>,
    watchers: Mutex<Vec<Watcher>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: Mutex<u64>,
}

impl Inner {
    fn next_generation(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        *generation
    }

    fn notify(&self, event: ChildEvent) {
        let path = match &event {
            ChildEvent::Added { path, .. }
            | ChildEvent::Removed { path, .. }
            | ChildEvent::Updated { path, .. } => path.clone(),
        };
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|watcher| {
            if !path.starts_with(&format!("{}/", watcher.prefix)) {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(event.clone()).is_ok()
        });
    }

    fn remove_if_generation(&self, path: &str, generation: u64) {
        let removed = {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get(path) {
                Some(entry) if entry.ephemeral && entry.generation == generation => {
                    nodes.remove(path)
                }
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.notify(ChildEvent::Removed {
                path: path.to_string(),
                data: entry.data,
            });
        }
    }
}

/// 内存协调存储
#[derive(Clone, Default)]
pub struct InMemoryCoordRegistry {
    inner: Arc<Inner>,
}

impl InMemoryCoordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟会话丢失：按路径强制删除临时节点并投递 Removed 事件
    ///
    /// 测试用，生产后端由会话超时触发同样的行为。
    pub fn expire_ephemeral(&self, path: &str) -> bool {
        let removed = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            match nodes.get(path) {
                Some(entry) if entry.ephemeral => nodes.remove(path),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                self.inner.notify(ChildEvent::Removed {
                    path: path.to_string(),
                    data: entry.data,
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CoordRegistry for InMemoryCoordRegistry {
    async fn create_parents(&self, paths: &[String]) -> MasterResult<()> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        for path in paths {
            nodes.entry(path.clone()).or_insert_with(|| NodeEntry {
                data: String::new(),
                ephemeral: false,
                generation: 0,
            });
        }
        Ok(())
    }

    async fn register_ephemeral(&self, path: &str, data: &str) -> MasterResult<EphemeralHandle> {
        let generation = self.inner.next_generation();
        let existed = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            nodes
                .insert(
                    path.to_string(),
                    NodeEntry {
                        data: data.to_string(),
                        ephemeral: true,
                        generation,
                    },
                )
                .is_some()
        };
        let event = if existed {
            ChildEvent::Updated {
                path: path.to_string(),
                data: data.to_string(),
            }
        } else {
            ChildEvent::Added {
                path: path.to_string(),
                data: data.to_string(),
            }
        };
        self.inner.notify(event);

        let inner = Arc::clone(&self.inner);
        let release_path = path.to_string();
        Ok(EphemeralHandle::new(
            path.to_string(),
            Box::new(move || inner.remove_if_generation(&release_path, generation)),
        ))
    }

    async fn update_data(&self, path: &str, data: &str) -> MasterResult<()> {
        let updated = {
            let mut nodes = self.inner.nodes.lock().unwrap();
            match nodes.get_mut(path) {
                Some(entry) => {
                    entry.data = data.to_string();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.inner.notify(ChildEvent::Updated {
                path: path.to_string(),
                data: data.to_string(),
            });
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> MasterResult<bool> {
        let nodes = self.inner.nodes.lock().unwrap();
        if nodes.contains_key(path) {
            return Ok(true);
        }
        // 中间层级没有显式节点，按前缀视为存在
        let dir_prefix = format!("{path}/");
        Ok(nodes.keys().any(|p| p.starts_with(&dir_prefix)))
    }

    async fn get_data(&self, path: &str) -> MasterResult<Option<String>> {
        let nodes = self.inner.nodes.lock().unwrap();
        Ok(nodes.get(path).map(|entry| entry.data.clone()))
    }

    async fn list_children(&self, parent: &str) -> MasterResult<Vec<String>> {
        let prefix = format!("{}/", parent.trim_end_matches('/'));
        let nodes = self.inner.nodes.lock().unwrap();
        let mut children: Vec<String> = nodes
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn watch_children(
        &self,
        parent: &str,
    ) -> MasterResult<mpsc::UnboundedReceiver<ChildEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watchers = self.inner.watchers.lock().unwrap();
        watchers.push(Watcher {
            prefix: parent.trim_end_matches('/').to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn record_dead_server(&self, path: &str) -> MasterResult<()> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes.insert(
            path.to_string(),
            NodeEntry {
                data: String::new(),
                ephemeral: false,
                generation: 0,
            },
        );
        Ok(())
    }

    async fn is_dead_server(&self, path: &str) -> MasterResult<bool> {
        let nodes = self.inner.nodes.lock().unwrap();
        Ok(nodes.contains_key(path))
    }

    async fn acquire_lock(&self, path: &str) -> MasterResult<LockGuard> {
        let lock = {
            let mut locks = self.inner.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(path.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let lease = lock.lock_owned().await;
        Ok(LockGuard::new(Box::new(lease)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = InMemoryCoordRegistry::new();
        let _m1 = registry
            .register_ephemeral("/ns/masters/10.0.0.1:5678", "hb1")
            .await
            .unwrap();
        let _m2 = registry
            .register_ephemeral("/ns/masters/10.0.0.2:5678", "hb2")
            .await
            .unwrap();

        let children = registry.list_children("/ns/masters").await.unwrap();
        assert_eq!(children, vec!["10.0.0.1:5678", "10.0.0.2:5678"]);
        assert!(registry.exists("/ns/masters/10.0.0.1:5678").await.unwrap());
        assert_eq!(
            registry
                .get_data("/ns/masters/10.0.0.1:5678")
                .await
                .unwrap(),
            Some("hb1".to_string())
        );
    }

    #[tokio::test]
    async fn test_nested_children_grouped() {
        let registry = InMemoryCoordRegistry::new();
        let _w1 = registry
            .register_ephemeral("/ns/workers/default/10.0.0.3:1234", "hb")
            .await
            .unwrap();
        let _w2 = registry
            .register_ephemeral("/ns/workers/gpu/10.0.0.4:1234", "hb")
            .await
            .unwrap();

        let groups = registry.list_children("/ns/workers").await.unwrap();
        assert_eq!(groups, vec!["default", "gpu"]);
        let workers = registry.list_children("/ns/workers/default").await.unwrap();
        assert_eq!(workers, vec!["10.0.0.3:1234"]);
        // 中间层级按前缀视为存在
        assert!(registry.exists("/ns/workers/default").await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_emits_removed_event() {
        let registry = InMemoryCoordRegistry::new();
        let mut rx = registry.watch_children("/ns/masters").await.unwrap();

        let handle = registry
            .register_ephemeral("/ns/masters/10.0.0.1:5678", "hb")
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            ChildEvent::Added { path, .. } => {
                assert_eq!(path, "/ns/masters/10.0.0.1:5678")
            }
            other => panic!("期望 Added 事件，得到 {other:?}"),
        }

        drop(handle);
        match rx.recv().await.unwrap() {
            ChildEvent::Removed { path, data } => {
                assert_eq!(path, "/ns/masters/10.0.0.1:5678");
                assert_eq!(data, "hb");
            }
            other => panic!("期望 Removed 事件，得到 {other:?}"),
        }
        assert!(!registry.exists("/ns/masters/10.0.0.1:5678").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_new_registration() {
        let registry = InMemoryCoordRegistry::new();
        let old = registry
            .register_ephemeral("/ns/masters/m1", "gen1")
            .await
            .unwrap();
        // 同路径重新注册（会话闪断后的新世代）
        let _new = registry
            .register_ephemeral("/ns/masters/m1", "gen2")
            .await
            .unwrap();

        drop(old);
        assert!(registry.exists("/ns/masters/m1").await.unwrap());
        assert_eq!(
            registry.get_data("/ns/masters/m1").await.unwrap(),
            Some("gen2".to_string())
        );
    }

    #[tokio::test]
    async fn test_expire_ephemeral() {
        let registry = InMemoryCoordRegistry::new();
        let mut rx = registry.watch_children("/ns/workers").await.unwrap();
        let handle = registry
            .register_ephemeral("/ns/workers/default/w1", "hb")
            .await
            .unwrap();
        let _ = rx.recv().await;

        assert!(registry.expire_ephemeral("/ns/workers/default/w1"));
        match rx.recv().await.unwrap() {
            ChildEvent::Removed { path, .. } => assert_eq!(path, "/ns/workers/default/w1"),
            other => panic!("期望 Removed 事件，得到 {other:?}"),
        }
        // 过期后句柄释放是无操作
        drop(handle);
        assert!(!registry.expire_ephemeral("/ns/workers/default/w1"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let registry = InMemoryCoordRegistry::new();
        let guard = registry.acquire_lock("/ns/lock/failover/master").await.unwrap();

        let registry2 = registry.clone();
        let contender = tokio::spawn(async move {
            registry2
                .acquire_lock("/ns/lock/failover/master")
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("锁释放后应当获得")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_server_marker() {
        let registry = InMemoryCoordRegistry::new();
        let marker = "/ns/dead-servers/worker_10.0.0.3:1234";
        assert!(!registry.is_dead_server(marker).await.unwrap());
        registry.record_dead_server(marker).await.unwrap();
        assert!(registry.is_dead_server(marker).await.unwrap());
    }
}
