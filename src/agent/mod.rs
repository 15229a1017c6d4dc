//! Agent 模块 - 文件监听 + 增量读取 + 行广播
//!
//! Agent 负责：
//! - 监听目标日志文件的变更
//! - 增量读取新追加的字节并拆分成行
//! - 新观察者接入时发送最近 N 行的 backfill 快照
//! - 把新行实时推送给所有已订阅的观察者

mod broadcaster;
mod handler;
mod server;
mod watcher;

pub use broadcaster::{Broadcaster, ConnId, MessageSender};
pub use handler::AGENT_VERSION;
pub use server::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
pub use watcher::TailWatcher;
