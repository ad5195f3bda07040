//! 在线用户注册表
//!
//! 用户名 -> 连接句柄。整张表由一把互斥锁保护，所有操作（包括 O(n) 的
//! 列表扫描）彼此串行；这是整个服务端唯一的全局瓶颈。持锁期间不做任何 IO，
//! 调用方拿到 `Arc` 句柄后释放锁再发送。

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// 用户名已被占用
    #[error("username {0} already registered")]
    Duplicate(String),
}

/// 在线用户注册表
pub struct Registry<H> {
    clients: Mutex<HashMap<String, Arc<H>>>,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// 用户名未被占用时登记，否则返回 `Duplicate`
    pub async fn try_register(&self, username: &str, handle: Arc<H>) -> Result<(), RegistryError> {
        let mut clients = self.clients.lock().await;
        if clients.contains_key(username) {
            return Err(RegistryError::Duplicate(username.to_string()));
        }
        clients.insert(username.to_string(), handle);
        Ok(())
    }

    pub async fn lookup(&self, username: &str) -> Option<Arc<H>> {
        self.clients.lock().await.get(username).cloned()
    }

    pub async fn remove(&self, username: &str) -> Option<Arc<H>> {
        self.clients.lock().await.remove(username)
    }

    /// 除 `excluding` 外的所有在线用户，顺序不保证
    pub async fn list_others(&self, excluding: &str) -> Vec<String> {
        self.clients
            .lock()
            .await
            .keys()
            .filter(|name| name.as_str() != excluding)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.clients.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}
