//! Agent 服务器
//!
//! Unix Socket 服务，处理观察者连接：握手 → backfill 快照 → 实时行推送

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use super::broadcaster::{Broadcaster, ConnId};
use super::handler::Handler;
use super::watcher::TailWatcher;
use crate::backfill::last_n_lines_to;
use crate::protocol::{Push, Request, Response};

/// 每个观察者的出站队列容量
const OBSERVER_QUEUE_CAPACITY: usize = 100;

/// Agent 配置
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// 数据目录（默认 ~/.logtail，存放 socket 和 PID 文件）
    pub data_dir: PathBuf,
    /// 被 tail 的目标文件
    pub target_path: PathBuf,
    /// backfill 行数
    pub backfill_count: usize,
    /// 变更通知防抖间隔（毫秒）
    pub debounce_ms: u64,
}

impl AgentConfig {
    /// 创建指定目标文件的配置
    pub fn new<P: Into<PathBuf>>(target: P) -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".logtail");

        Self {
            data_dir,
            target_path: target.into(),
            backfill_count: 10,
            debounce_ms: 200,
        }
    }

    /// 从环境变量创建配置
    ///
    /// - `LOGTAIL_FILE`: 目标文件路径（默认 ./test.txt）
    /// - `LOGTAIL_DIR`: 数据目录覆盖
    pub fn from_env() -> Self {
        let target = std::env::var("LOGTAIL_FILE").unwrap_or_else(|_| "./test.txt".to_string());
        let mut config = Self::new(target);

        if let Ok(dir) = std::env::var("LOGTAIL_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("agent.pid")
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Agent 服务
pub struct Agent {
    config: AgentConfig,
    broadcaster: Arc<Broadcaster>,
    watcher: Arc<TailWatcher>,
    handler: Handler,
}

impl Agent {
    /// 创建 Agent
    pub fn new(config: AgentConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        let broadcaster = Broadcaster::new();
        let watcher = TailWatcher::new(
            config.target_path.clone(),
            Duration::from_millis(config.debounce_ms),
            broadcaster.clone(),
        );
        let handler = Handler::new(broadcaster.clone(), watcher.clone());

        Ok(Self {
            config,
            broadcaster,
            watcher,
            handler,
        })
    }

    /// 运行 Agent
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!(
            "🚀 Agent 启动: socket={:?}, tailing={:?}",
            socket_path,
            self.config.target_path
        );

        // 启动文件监听
        self.watcher.clone().start().await?;

        // 接受连接
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let agent = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = agent.handle_connection(stream).await {
                                    tracing::error!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::channel::<String>(OBSERVER_QUEUE_CAPACITY);

        let conn_id = self.broadcaster.register(tx);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 发送任务：连接通道里的消息按序写出
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut joined = false;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // 连接关闭
                    break;
                }
                Ok(_) => {
                    let request: Request = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("解析请求失败: {}", e);
                            let response = Response::Error {
                                code: 400,
                                message: format!("Invalid JSON: {}", e),
                            };
                            let resp_json = serde_json::to_string(&response)?;
                            self.broadcaster
                                .try_send_to(conn_id, format!("{}\n", resp_json));
                            continue;
                        }
                    };

                    let is_handshake = matches!(request, Request::Handshake { .. });
                    let response = self.handler.handle(conn_id, request);
                    let resp_json = serde_json::to_string(&response)?;

                    if !self
                        .broadcaster
                        .send_to(conn_id, format!("{}\n", resp_json))
                        .await
                    {
                        break;
                    }

                    // 握手响应入队之后执行 join：backfill 快照 + 订阅实时行。
                    // 重复握手不重发 backfill（恰好一次）。
                    if is_handshake && !joined {
                        joined = true;
                        self.join_observer(conn_id).await;
                    }
                }
                Err(e) => {
                    tracing::error!("读取失败: {}", e);
                    break;
                }
            }
        }

        self.broadcaster.unregister(conn_id);
        write_handle.abort();
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        Ok(())
    }

    /// join：发送 backfill 快照，然后订阅实时行
    ///
    /// 快照以监听器当前已发布的 offset 为上界：还停在防抖窗口里、
    /// 尚未 publish 的追加内容不进快照，只会以 NewLine 到达——
    /// 同一行绝不会重复交付。订阅发生在快照之后，offset 快照与
    /// 订阅之间发布的行对该观察者丢失（允许漏、不允许重）。
    ///
    /// 快照读取失败降级为空快照——观察者仍然收到恰好一次 Backfill，
    /// 后续实时行不受影响。
    async fn join_observer(&self, conn_id: ConnId) {
        let path = self.config.target_path.clone();
        let count = self.config.backfill_count;
        let published = self.watcher.offset();

        let snapshot =
            tokio::task::spawn_blocking(move || last_n_lines_to(&path, count, published)).await;
        let lines = match snapshot {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                tracing::warn!("读取 backfill 失败: {}", e);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("spawn_blocking failed: {}", e);
                Vec::new()
            }
        };

        tracing::debug!(
            "📜 Backfill: conn_id={}, {} lines",
            conn_id,
            lines.len()
        );

        let push = Push::Backfill { lines };
        match serde_json::to_string(&push) {
            Ok(json) => {
                if !self.broadcaster.send_to(conn_id, format!("{}\n", json)).await {
                    tracing::debug!("Backfill 发送失败（连接已关闭）: conn_id={}", conn_id);
                    return;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize backfill: {}", e);
                return;
            }
        }

        self.broadcaster.subscribe(conn_id);
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 清理资源
    fn cleanup(&self) {
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            let _ = fs::remove_file(&socket_path);
        }

        let pid_path = self.config.pid_path();
        if pid_path.exists() {
            let _ = fs::remove_file(&pid_path);
        }

        tracing::info!("🧹 Agent 清理完成");
    }
}

/// 检查 Agent 是否正在运行
pub fn is_agent_running(config: &AgentConfig) -> bool {
    let pid_path = config.pid_path();
    if !pid_path.exists() {
        return false;
    }

    let pid_str = match fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // 检查进程是否存在
    unsafe { libc::kill(pid, 0) == 0 }
}

/// 清理残留的 Agent 状态
pub fn cleanup_stale_agent(config: &AgentConfig) -> Result<()> {
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
        tracing::debug!("🧹 删除残留 socket: {:?}", socket_path);
    }

    if pid_path.exists() {
        fs::remove_file(&pid_path)?;
        tracing::debug!("🧹 删除残留 PID 文件: {:?}", pid_path);
    }

    Ok(())
}
