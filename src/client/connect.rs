//! 观察者客户端连接逻辑
//!
//! 连接流程：重试连接 socket → 握手 → 启动读取任务。
//! 握手之后收到的第一条推送一定是 Backfill 快照，之后是实时的
//! NewLine 流（按文件顺序）。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::protocol::{Push, Request, Response};

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 数据目录（默认 ~/.logtail，与 Agent 一致）
    pub data_dir: PathBuf,
    /// 组件名称
    pub component: String,
    /// 组件版本
    pub version: String,
    /// 连接重试次数
    pub connect_retries: u32,
    /// 重试间隔（毫秒）
    pub retry_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".logtail");

        Self {
            data_dir,
            component: "unknown".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            connect_retries: 3,
            retry_interval_ms: 500,
        }
    }
}

impl ClientConfig {
    /// 创建新的配置
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            ..Default::default()
        }
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("agent.sock")
    }
}

/// 观察者客户端
pub struct ObserverClient {
    #[allow(dead_code)]
    config: ClientConfig,
    /// 写入端
    writer: OwnedWriteHalf,
    /// 推送接收通道
    push_rx: mpsc::Receiver<String>,
}

impl ObserverClient {
    /// 发送请求并等待响应
    ///
    /// 注意：响应和推送共用一个通道，这里简化处理——请求应在
    /// 推送流安静时发出（如心跳），否则下一条消息可能是 NewLine。
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let request_json = serde_json::to_string(request)?;
        self.writer
            .write_all(format!("{}\n", request_json).as_bytes())
            .await?;

        let response_line = self
            .push_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))?;

        let response: Response = serde_json::from_str(&response_line)?;
        Ok(response)
    }

    /// 心跳（保持连接）
    pub async fn heartbeat(&mut self) -> Result<()> {
        match self.request(&Request::Heartbeat).await? {
            Response::Ok => Ok(()),
            Response::Error { code, message } => {
                Err(anyhow::anyhow!("Heartbeat failed: {} (code={})", message, code))
            }
            _ => Err(anyhow::anyhow!("Unexpected response")),
        }
    }

    /// 接收下一条推送（Backfill 或 NewLine）
    pub async fn recv_push(&mut self) -> Option<Push> {
        let line = self.push_rx.recv().await?;
        serde_json::from_str(&line).ok()
    }

    /// 获取推送接收器（用于 select!）
    pub fn push_receiver(&mut self) -> &mut mpsc::Receiver<String> {
        &mut self.push_rx
    }
}

/// 连接 Agent（带重试）
pub async fn connect(config: ClientConfig) -> Result<ObserverClient> {
    let socket_path = config.socket_path();

    let mut last_err = None;
    for attempt in 1..=config.connect_retries {
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                tracing::debug!("连接 Agent 成功 (attempt={})", attempt);
                return finish_connect(config, stream).await;
            }
            Err(e) => {
                tracing::debug!("连接 Agent 失败 (attempt={}): {}", attempt, e);
                last_err = Some(e);
                if attempt < config.connect_retries {
                    sleep(Duration::from_millis(config.retry_interval_ms)).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "连接 Agent 失败 ({:?}): {:?}",
        socket_path,
        last_err
    ))
}

/// 完成连接（握手 + 启动读取任务）
async fn finish_connect(config: ClientConfig, stream: UnixStream) -> Result<ObserverClient> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 发送握手
    let handshake = Request::Handshake {
        component: config.component.clone(),
        version: config.version.clone(),
    };
    let handshake_json = serde_json::to_string(&handshake)?;
    writer
        .write_all(format!("{}\n", handshake_json).as_bytes())
        .await
        .context("发送握手失败")?;

    // 读取握手响应
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Response = serde_json::from_str(&line)?;
    match response {
        Response::HandshakeOk { agent_version } => {
            tracing::info!("握手成功: agent_version={}", agent_version);
        }
        Response::Error { code, message } => {
            return Err(anyhow::anyhow!("握手失败: {} (code={})", message, code));
        }
        _ => {
            return Err(anyhow::anyhow!("握手响应异常"));
        }
    }

    // 之后的所有消息（backfill + 实时行 + 响应）进入推送通道
    let (push_tx, push_rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // 连接关闭
                Ok(_) => {
                    if push_tx.send(line.trim().to_string()).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    Ok(ObserverClient {
        config,
        writer,
        push_rx,
    })
}
