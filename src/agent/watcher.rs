//! 文件监听器（Change Watcher）
//!
//! 监听目标日志文件的变更通知，驱动增量读取并把新行交给广播器。
//!
//! 并发约束：所有变更通知经同一个 mpsc 通道进入唯一的消费任务，
//! `TailState` 由该任务独占——同一文件绝不会有两次并发的增量读取，
//! offset 不变量因此成立。通知可能合并也可能重复，`read_delta`
//! 对没有新字节的通知返回空结果，天然幂等。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use tokio::sync::mpsc;

use super::broadcaster::Broadcaster;
use crate::tail::{read_delta, TailState};

/// 文件监听器
pub struct TailWatcher {
    /// 被 tail 的目标文件
    target: PathBuf,
    /// 防抖间隔
    debounce: Duration,
    /// 广播器
    broadcaster: Arc<Broadcaster>,
    /// offset 镜像，仅供状态查询读取；写入只发生在消费任务中
    offset: AtomicU64,
}

impl TailWatcher {
    /// 创建文件监听器
    pub fn new(target: PathBuf, debounce: Duration, broadcaster: Arc<Broadcaster>) -> Arc<Self> {
        Arc::new(Self {
            target,
            debounce,
            broadcaster,
            offset: AtomicU64::new(0),
        })
    }

    /// 目标文件路径
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// 当前读取 offset
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// 启动文件监听
    ///
    /// 监听目标文件所在目录而不是文件本身——目标文件此刻可能还
    /// 不存在（由别的进程稍后创建），目录监听两种情况都覆盖。
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(100);

        let tx_clone = tx.clone();
        let mut debouncer = new_debouncer(
            self.debounce,
            move |res: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                if let Ok(events) = res {
                    for event in events {
                        if event.kind == DebouncedEventKind::Any {
                            let _ = tx_clone.blocking_send(event.path);
                        }
                    }
                }
            },
        )?;

        let watch_dir = self
            .target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        match debouncer.watcher().watch(&watch_dir, RecursiveMode::NonRecursive) {
            Ok(_) => {
                tracing::info!("👁️ Watching {:?} for changes to {:?}", watch_dir, self.target);
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to watch directory {:?}: {}", watch_dir, e);
            }
        }

        // offset 初始化为文件当前大小（不存在视为 0），历史内容走 backfill
        let mut state = TailState::new(&self.target);
        self.offset.store(state.offset(), Ordering::Relaxed);
        tracing::info!(
            "🔄 Tail started: {:?} (offset={})",
            self.target,
            state.offset()
        );

        // 唯一的消费任务，独占 TailState
        let watcher = self.clone();
        tokio::spawn(async move {
            // 保持 debouncer 存活
            let _debouncer = debouncer;

            while let Some(path) = rx.recv().await {
                if watcher.is_target(&path) {
                    watcher.handle_change(&mut state).await;
                }
            }
        });

        Ok(())
    }

    /// 目录里其他文件的事件（socket、pid 文件等）一律忽略
    fn is_target(&self, path: &Path) -> bool {
        if path == self.target {
            return true;
        }
        // 事件路径可能是规范化后的形式
        match (path.canonicalize(), self.target.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// 处理一次变更通知
    ///
    /// offset 只在行成功交给广播器之后推进；读取失败时保持不变，
    /// 同一字节区间下次通知重试（at-least-once，不丢数据）。
    async fn handle_change(&self, state: &mut TailState) {
        let from = state.offset();

        // 截断/替换检测：文件变小视为不连续点，从新大小继续
        match std::fs::metadata(&self.target) {
            Ok(meta) => {
                let size = meta.len();
                if size < from {
                    tracing::warn!(
                        "✂️ File truncated or replaced ({} -> {} bytes), resetting offset",
                        from,
                        size
                    );
                    state.reset(size);
                    self.offset.store(size, Ordering::Relaxed);
                    return;
                }
            }
            Err(e) => {
                // 文件消失（监听与读取之间被删除）：不是致命错误
                tracing::debug!("File not readable, keeping offset {}: {}", from, e);
                return;
            }
        }

        // 同步文件 IO 放到 blocking 线程池
        let path = self.target.clone();
        let delta = match tokio::task::spawn_blocking(move || read_delta(&path, from)).await {
            Ok(Ok(delta)) => delta,
            Ok(Err(e)) => {
                tracing::error!("Failed to read delta at offset {}: {}", from, e);
                return;
            }
            Err(e) => {
                tracing::error!("spawn_blocking failed: {}", e);
                return;
            }
        };

        if !delta.lines.is_empty() {
            tracing::debug!("📝 {} new lines from {:?}", delta.lines.len(), self.target);
            self.broadcaster.publish(&delta.lines);
        }

        if delta.new_offset != from {
            state.advance(delta.new_offset);
            self.offset.store(delta.new_offset, Ordering::Relaxed);
        }
    }
}
