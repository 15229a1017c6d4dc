//! 观察者协议定义
//!
//! 通信方式：Unix Socket + JSONL（每条消息一行 JSON + '\n'）
//!
//! 观察者视角的消息顺序：握手 → `HandshakeOk` → `Backfill`（恰好一次）
//! → 零或多条 `NewLine`（按文件顺序）。

use serde::{Deserialize, Serialize};

/// 请求类型（Observer → Agent）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手（即 join：回复后立即收到 backfill 并订阅后续行）
    Handshake {
        /// 组件名称（用于日志和诊断）
        component: String,
        /// 组件版本
        version: String,
    },

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询
    Query {
        /// 查询类型
        query_type: QueryType,
    },
}

/// 响应类型（Agent → Observer）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Agent 版本
        agent_version: String,
    },

    /// 查询结果
    QueryResult { data: serde_json::Value },
}

/// 推送消息（Agent → Observer）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Push {
    /// 回填快照：最近 N 行，按文件顺序（最旧在前），join 后恰好发送一次
    Backfill { lines: Vec<String> },

    /// 新增的一行
    NewLine { line: String },
}

/// 查询类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query")]
pub enum QueryType {
    /// 获取 Agent 状态（版本、连接数、目标文件、当前 offset）
    Status,
    /// 获取连接数
    ConnectionCount,
}
