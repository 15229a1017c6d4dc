//! 观察者客户端模块
//!
//! 提供连接 Agent 并消费行推送的客户端功能

mod connect;

pub use connect::{connect, ClientConfig, ObserverClient};
