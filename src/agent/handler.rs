//! 请求处理器
//!
//! 处理来自观察者的各类请求。join 的副作用（backfill + 订阅）
//! 不在这里执行——它必须排在握手响应之后入队，由 server 驱动。

use std::sync::Arc;

use super::broadcaster::{Broadcaster, ConnId};
use super::watcher::TailWatcher;
use crate::protocol::{QueryType, Request, Response};

/// Agent 版本号（跟随 crate 版本）
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 请求处理器
pub struct Handler {
    /// 广播器
    broadcaster: Arc<Broadcaster>,
    /// 文件监听器
    watcher: Arc<TailWatcher>,
}

impl Handler {
    /// 创建处理器
    pub fn new(broadcaster: Arc<Broadcaster>, watcher: Arc<TailWatcher>) -> Self {
        Self {
            broadcaster,
            watcher,
        }
    }

    /// 处理请求
    pub fn handle(&self, conn_id: ConnId, request: Request) -> Response {
        match request {
            Request::Handshake { component, version } => {
                tracing::info!(
                    "🤝 Observer joined: conn_id={}, component={}, version={}",
                    conn_id,
                    component,
                    version
                );
                Response::HandshakeOk {
                    agent_version: AGENT_VERSION.to_string(),
                }
            }

            Request::Heartbeat => Response::Ok,

            Request::Query { query_type } => self.handle_query(query_type),
        }
    }

    /// 处理查询
    fn handle_query(&self, query_type: QueryType) -> Response {
        match query_type {
            QueryType::Status => {
                let status = serde_json::json!({
                    "agent_version": AGENT_VERSION,
                    "connections": self.broadcaster.connection_count(),
                    "file": self.watcher.target().display().to_string(),
                    "offset": self.watcher.offset(),
                });
                Response::QueryResult { data: status }
            }
            QueryType::ConnectionCount => {
                let count = self.broadcaster.connection_count();
                Response::QueryResult {
                    data: serde_json::json!({ "count": count }),
                }
            }
        }
    }
}
