//! 行广播器（Broadcast Hub）
//!
//! 维护观察者注册表，把新行按顺序扇出给所有已订阅的观察者。
//! 注册（register）和订阅（subscribe）分开：连接建立后先注册拿到
//! 发送通道，backfill 发完再订阅实时行——同一连接的消息都经过
//! 它自己的有界通道，顺序天然保持，backfill 一定先于任何 NewLine。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::Push;

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道
pub type MessageSender = mpsc::Sender<String>;

/// 行广播器
pub struct Broadcaster {
    /// 连接通道：ConnId → 发送通道
    senders: RwLock<HashMap<ConnId, MessageSender>>,
    /// 已订阅实时行的连接
    subscribed: RwLock<HashSet<ConnId>>,
    /// 下一个连接 ID
    next_conn_id: RwLock<ConnId>,
}

impl Broadcaster {
    /// 创建新的广播器
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册新连接，返回连接 ID（此时尚未订阅实时行）
    pub fn register(&self, sender: MessageSender) -> ConnId {
        let mut next_id = self.next_conn_id.write();
        let conn_id = *next_id;
        *next_id += 1;

        self.senders.write().insert(conn_id, sender);

        tracing::debug!("📡 Connection registered: conn_id={}", conn_id);
        conn_id
    }

    /// 订阅实时行（backfill 发送完成后调用）
    pub fn subscribe(&self, conn_id: ConnId) {
        if self.senders.read().contains_key(&conn_id) {
            self.subscribed.write().insert(conn_id);
            tracing::debug!("📡 Subscribed to live lines: conn_id={}", conn_id);
        }
    }

    /// 注销连接（幂等，重复调用无副作用）
    pub fn unregister(&self, conn_id: ConnId) {
        let removed = self.senders.write().remove(&conn_id).is_some();
        self.subscribed.write().remove(&conn_id);
        if removed {
            tracing::debug!("📡 Connection unregistered: conn_id={}", conn_id);
        }
    }

    /// 广播新行给所有已订阅的观察者（非阻塞）
    ///
    /// 发布时对订阅集合做快照，发布期间的 join/leave 不受影响。
    /// 某个观察者的出站队列满了说明它已经跟不上，直接注销，
    /// 不能让一个慢观察者拖住其他人的交付。
    pub fn publish(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }

        // 快照当前订阅者
        let targets: Vec<(ConnId, MessageSender)> = {
            let subscribed = self.subscribed.read();
            let senders = self.senders.read();
            subscribed
                .iter()
                .filter_map(|conn_id| senders.get(conn_id).map(|s| (*conn_id, s.clone())))
                .collect()
        };

        if targets.is_empty() {
            tracing::trace!("📡 No subscribers, {} lines dropped", lines.len());
            return;
        }

        // 每行序列化一次，所有观察者复用
        let mut messages = Vec::with_capacity(lines.len());
        for line in lines {
            let push = Push::NewLine { line: line.clone() };
            match serde_json::to_string(&push) {
                Ok(json) => messages.push(format!("{}\n", json)),
                Err(e) => {
                    tracing::error!("Failed to serialize line push: {}", e);
                    return;
                }
            }
        }

        tracing::debug!(
            "📡 Broadcasting {} lines to {} observers",
            messages.len(),
            targets.len()
        );

        let mut stalled: Vec<ConnId> = Vec::new();
        'observers: for (conn_id, sender) in targets {
            for msg in &messages {
                if let Err(e) = sender.try_send(msg.clone()) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            tracing::warn!(
                                "📡 Observer queue full, disconnecting: conn_id={}",
                                conn_id
                            );
                            stalled.push(conn_id);
                        }
                        mpsc::error::TrySendError::Closed(_) => {
                            tracing::debug!("📡 Channel closed: conn_id={}", conn_id);
                            stalled.push(conn_id);
                        }
                    }
                    continue 'observers;
                }
            }
        }

        for conn_id in stalled {
            self.unregister(conn_id);
        }
    }

    /// 发送消息到指定连接
    pub async fn send_to(&self, conn_id: ConnId, message: String) -> bool {
        // 先 clone sender 再发送，避免持锁跨 await
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.send(message).await.is_ok()
        } else {
            false
        }
    }

    /// 尝试发送消息到指定连接（非阻塞）
    pub fn try_send_to(&self, conn_id: ConnId, message: String) -> bool {
        let sender = {
            let senders = self.senders.read();
            senders.get(&conn_id).cloned()
        };

        if let Some(sender) = sender {
            sender.try_send(message).is_ok()
        } else {
            false
        }
    }

    /// 获取当前连接数
    pub fn connection_count(&self) -> usize {
        self.senders.read().len()
    }

    /// 检查是否有活跃连接
    pub fn has_connections(&self) -> bool {
        !self.senders.read().is_empty()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            next_conn_id: RwLock::new(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_publish_only_reaches_subscribed() {
        let broadcaster = Broadcaster::new();

        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, mut rx2) = mpsc::channel(10);

        let conn1 = broadcaster.register(tx1);
        let _conn2 = broadcaster.register(tx2);

        // 只有 conn1 完成了 join 流程
        broadcaster.subscribe(conn1);

        broadcaster.publish(&lines(&["hello"]));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_publish_preserves_line_order() {
        let broadcaster = Broadcaster::new();

        let (tx, mut rx) = mpsc::channel(10);
        let conn = broadcaster.register(tx);
        broadcaster.subscribe(conn);

        broadcaster.publish(&lines(&["A", "B", "C"]));

        for expected in ["A", "B", "C"] {
            let msg = rx.try_recv().unwrap();
            let push: Push = serde_json::from_str(msg.trim()).unwrap();
            match push {
                Push::NewLine { line } => assert_eq!(line, expected),
                _ => panic!("Expected NewLine"),
            }
        }
    }

    #[test]
    fn test_full_queue_disconnects_observer() {
        let broadcaster = Broadcaster::new();

        // 容量 1 的通道，第二行放不进去
        let (tx, _rx) = mpsc::channel(1);
        let conn = broadcaster.register(tx);
        broadcaster.subscribe(conn);

        broadcaster.publish(&lines(&["first", "second"]));

        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let broadcaster = Broadcaster::new();

        let (tx, _rx) = mpsc::channel(10);
        let conn = broadcaster.register(tx);
        assert_eq!(broadcaster.connection_count(), 1);

        broadcaster.unregister(conn);
        broadcaster.unregister(conn);
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[test]
    fn test_connection_count() {
        let broadcaster = Broadcaster::new();
        assert!(!broadcaster.has_connections());

        let (tx1, _rx1) = mpsc::channel(10);
        let conn1 = broadcaster.register(tx1);
        let (tx2, _rx2) = mpsc::channel(10);
        let _conn2 = broadcaster.register(tx2);
        assert_eq!(broadcaster.connection_count(), 2);

        broadcaster.unregister(conn1);
        assert_eq!(broadcaster.connection_count(), 1);
        assert!(broadcaster.has_connections());
    }
}
