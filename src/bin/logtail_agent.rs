//! logtail-agent - 日志跟踪 Agent
//!
//! 负责：
//! - 监听目标日志文件变更
//! - 增量读取 + 拆行
//! - backfill 快照 + 实时行推送

use std::sync::Arc;

use anyhow::Result;
use logtail::agent::{cleanup_stale_agent, is_agent_running, Agent, AgentConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("logtail=debug".parse()?))
        .init();

    tracing::info!("🚀 logtail-agent v{}", env!("CARGO_PKG_VERSION"));

    // 目标文件：命令行参数优先，其次环境变量 LOGTAIL_FILE
    let mut config = AgentConfig::from_env();
    if let Some(path) = std::env::args().nth(1) {
        config.target_path = path.into();
    }

    // 检查是否已有 Agent 运行
    if is_agent_running(&config) {
        tracing::error!("❌ Agent is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_agent(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    // 创建并运行 Agent
    let agent = Arc::new(Agent::new(config)?);
    agent.run().await?;

    tracing::info!("👋 logtail-agent exiting");
    Ok(())
}
