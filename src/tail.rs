//! 增量读取（Tail Reader）
//!
//! 维护目标文件的读取 offset，每次变更通知只读取新追加的字节区间
//! `[from_offset, size)` 并拆分成行。offset 的推进由调用方负责：
//! 只有在行成功分发之后才写回 `TailState`，读取失败时 offset 不前进，
//! 下次通知会重试同一字节区间（at-least-once）。

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Tail 状态：目标文件路径 + 最后读取到的字节 offset
///
/// 由单个消费任务独占持有（见 `agent::watcher`），不在此处加锁。
#[derive(Debug)]
pub struct TailState {
    path: PathBuf,
    last_offset: u64,
}

impl TailState {
    /// 创建状态，offset 初始化为文件当前大小（文件不存在视为 0）
    ///
    /// 启动时只 tail 之后写入的内容，历史内容通过 backfill 提供。
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let last_offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, last_offset }
    }

    /// 目标文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 当前 offset
    pub fn offset(&self) -> u64 {
        self.last_offset
    }

    /// 推进 offset（成功分发后调用）
    pub fn advance(&mut self, offset: u64) {
        debug_assert!(offset >= self.last_offset);
        self.last_offset = offset;
    }

    /// 重置 offset（文件被截断/替换时调用）
    pub fn reset(&mut self, offset: u64) {
        self.last_offset = offset;
    }
}

/// 一次增量读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// 新增的行（按文件顺序，已过滤纯空白行）
    pub lines: Vec<String>,
    /// 本次读取后的 offset，下次 `read_delta` 从这里继续
    pub new_offset: u64,
}

impl Delta {
    fn empty(offset: u64) -> Self {
        Self {
            lines: Vec::new(),
            new_offset: offset,
        }
    }
}

/// 读取 `[from_offset, 文件当前大小)` 区间并拆分成行
///
/// - 文件大小 ≤ `from_offset` 时返回空结果，offset 不变
///   （覆盖重复通知和截断的边界情况）
/// - 末尾未以换行符结尾的行也会立即返回（低延迟优先于完整性）
/// - 纯空白行被过滤掉
/// - 不修改任何状态，文件打不开/读不了时返回 `Error::Io`
pub fn read_delta(path: &Path, from_offset: u64) -> Result<Delta> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    if size <= from_offset {
        return Ok(Delta::empty(from_offset));
    }

    file.seek(SeekFrom::Start(from_offset))?;

    // take 限制在读取时刻的文件大小，之后追加的内容留给下次通知
    let mut buf = Vec::with_capacity((size - from_offset) as usize);
    let n = file.take(size - from_offset).read_to_end(&mut buf)?;

    let lines = split_lines(&buf);
    Ok(Delta {
        lines,
        new_offset: from_offset + n as u64,
    })
}

/// 按 '\n' 拆分并过滤纯空白行，行内容保持原样（不做 trim）
fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
