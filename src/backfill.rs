//! 回填提取（Backfill Extractor）
//!
//! 新观察者接入时需要最近 N 行作为快照。小文件整体读取即可；
//! 大文件从末尾按固定大小的块向前读，避免把整个文件载入内存。
//! 两条路径对同一内容必须产出完全相同的结果（差异只在 IO 策略）。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;

/// 小文件阈值：低于 1 MiB 直接整体读取
pub const SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;

/// 大文件倒序读取的块大小
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 返回文件最后 `n` 个非空白行，按文件顺序（最旧在前）
///
/// 文件不存在或为空时返回空序列，读取失败返回 `Error::Io`。
/// 结果不缓存，每次调用按需计算。
pub fn last_n_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    last_n_lines_impl(path, n, u64::MAX, SMALL_FILE_THRESHOLD, CHUNK_SIZE)
}

/// 同 `last_n_lines`，但只考虑 `[0, end_offset)` 字节区间
///
/// 供 join 流程使用：快照以已发布的 offset 为界。offset 之后的字节
/// （比如还停在防抖窗口里的一次追加）只会以 NewLine 的形式到达，
/// 同一行不会既出现在 backfill 里又被实时推送一次。
pub fn last_n_lines_to(path: &Path, n: usize, end_offset: u64) -> Result<Vec<String>> {
    last_n_lines_impl(path, n, end_offset, SMALL_FILE_THRESHOLD, CHUNK_SIZE)
}

/// 实际实现，上界/阈值/块大小可注入（测试用小块强制走倒序路径）
fn last_n_lines_impl(
    path: &Path,
    n: usize,
    end_offset: u64,
    small_file_threshold: u64,
    chunk_size: usize,
) -> Result<Vec<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let size = file.metadata()?.len().min(end_offset);
    if size == 0 || n == 0 {
        return Ok(Vec::new());
    }

    if size < small_file_threshold {
        last_lines_small(&mut file, size, n)
    } else {
        last_lines_chunked(&mut file, size, n, chunk_size)
    }
}

/// 小文件路径：整体读取后取最后 n 个非空白行
fn last_lines_small(file: &mut File, size: u64, n: usize) -> Result<Vec<String>> {
    let mut buf = Vec::with_capacity(size as usize);
    file.take(size).read_to_end(&mut buf)?;

    let mut lines: Vec<String> = String::from_utf8_lossy(&buf)
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect();

    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}

/// 大文件路径：从末尾按块向前读
///
/// 每个块的第一个片段可能是被块边界截断的行，作为 carry 字节保留，
/// 与前一个块（文件中更早的字节）拼接后再拆分——跨边界的行既不丢失
/// 也不重复。按字节拼接再解码，跨块的多字节 UTF-8 字符也不会被破坏。
/// 累计到至少 n 个非空白行或到达文件开头即停止。
fn last_lines_chunked(file: &mut File, size: u64, n: usize, chunk_size: usize) -> Result<Vec<String>> {
    // 固定大小的缓冲区，每轮复用
    let mut buf = vec![0u8; chunk_size];
    let mut pos = size;
    let mut carry: Vec<u8> = Vec::new();
    let mut collected: VecDeque<String> = VecDeque::new();
    let mut non_blank = 0usize;

    while pos > 0 {
        let read_size = chunk_size.min(pos as usize);
        pos -= read_size as u64;

        file.seek(SeekFrom::Start(pos))?;
        let chunk = &mut buf[..read_size];
        file.read_exact(chunk)?;

        // 本块字节 + 上一轮留下的片段
        let mut combined = Vec::with_capacity(read_size + carry.len());
        combined.extend_from_slice(chunk);
        combined.append(&mut carry);

        let mut parts = combined.split(|&b| b == b'\n');
        // split 至少产出一个元素
        let first = parts.next().unwrap_or(&[]);
        let complete: Vec<&[u8]> = parts.collect();

        // 完整的行按文件顺序插到结果前部
        for part in complete.iter().rev() {
            let line = String::from_utf8_lossy(part).into_owned();
            if !line.trim().is_empty() {
                non_blank += 1;
            }
            collected.push_front(line);
        }

        if pos == 0 {
            // 到达文件开头，第一个片段就是完整的首行
            let line = String::from_utf8_lossy(first).into_owned();
            if !line.trim().is_empty() {
                non_blank += 1;
            }
            collected.push_front(line);
        } else {
            // 片段属于更早的行，留到下一轮拼接
            carry = first.to_vec();
        }

        // 已有足够的非空白行，更早的内容不再需要
        if non_blank >= n {
            break;
        }
    }

    let mut lines: Vec<String> = collected
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();

    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    Ok(lines)
}
