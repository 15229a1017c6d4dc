//! logtail - 日志实时跟踪库
//!
//! 跟踪单个持续增长的日志文件，把新追加的行实时推送给所有连接的
//! 观察者；观察者首次接入时收到最近 N 行的 backfill 快照。
//!
//! # 核心功能
//!
//! - **增量读取**: 基于 offset 的 delta read，只读新追加的字节
//! - **回填提取**: 大文件从末尾倒序分块读取最后 N 行，内存有界
//! - **文件监听**: 防抖的变更通知，单消费任务串行处理
//! - **行广播**: 有界出站队列的多观察者扇出，慢观察者不拖累别人
//!
//! # Feature Flags
//!
//! - `agent`: 文件监听 + 事件推送服务
//! - `client`: 观察者客户端（供组件使用）
//!
//! # 架构
//!
//! 变更通知 → 增量读取拆行 → 广播给观察者。offset 由唯一的消费
//! 任务独占，只在行成功分发后推进；读取失败时同一字节区间会在
//! 下次通知重试（at-least-once，不丢数据）。

pub mod backfill;
pub mod error;
pub mod protocol;
pub mod tail;

#[cfg(feature = "agent")]
pub mod agent;

#[cfg(feature = "client")]
pub mod client;

// Re-exports
pub use backfill::{last_n_lines, last_n_lines_to, CHUNK_SIZE, SMALL_FILE_THRESHOLD};
pub use error::{Error, Result};
pub use protocol::{Push, QueryType, Request, Response};
pub use tail::{read_delta, Delta, TailState};

#[cfg(feature = "agent")]
pub use agent::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};

#[cfg(feature = "client")]
pub use client::{connect, ClientConfig, ObserverClient};
