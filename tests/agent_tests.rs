//! Agent 集成测试
//!
//! 通过真实的 Unix Socket 验证观察者协议：握手 → backfill → 实时行

#[cfg(feature = "agent")]
mod tests {
    use logtail::agent::{Agent, AgentConfig};
    use logtail::protocol::{Push, Request, Response};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::{sleep, timeout};

    /// 创建测试配置（数据目录和日志目录分开，避免 socket 文件的
    /// 变更事件混进日志目录的监听）
    fn test_config() -> AgentConfig {
        let dir = tempdir().unwrap().into_path();
        let log_dir = dir.join("logs");
        std::fs::create_dir_all(&log_dir).unwrap();

        AgentConfig {
            data_dir: dir.join("data"),
            target_path: log_dir.join("app.log"),
            backfill_count: 10,
            debounce_ms: 50,
        }
    }

    /// 启动 Agent 并等待 socket 就绪
    async fn start_agent(config: &AgentConfig) -> tokio::task::JoinHandle<()> {
        let agent = Arc::new(Agent::new(config.clone()).unwrap());
        let handle = tokio::spawn(async move {
            agent.run().await.unwrap();
        });
        sleep(Duration::from_millis(300)).await;
        handle
    }

    /// 连接并完成握手，返回读写两端（握手响应已消费）
    async fn connect_observer(config: &AgentConfig) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(config.socket_path()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let handshake = Request::Handshake {
            component: "test".to_string(),
            version: "1.0.0".to_string(),
        };
        writer
            .write_all(format!("{}\n", serde_json::to_string(&handshake).unwrap()).as_bytes())
            .await
            .unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, Response::HandshakeOk { .. }));

        (reader, writer)
    }

    /// 读取下一条推送（5 秒超时）
    async fn next_push(reader: &mut BufReader<OwnedReadHalf>) -> Push {
        let mut line = String::new();
        timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("timed out waiting for push")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// 断言在给定时间内没有更多推送
    async fn assert_no_push(reader: &mut BufReader<OwnedReadHalf>, wait_ms: u64) {
        let mut line = String::new();
        let result = timeout(Duration::from_millis(wait_ms), reader.read_line(&mut line)).await;
        assert!(result.is_err(), "unexpected push: {}", line.trim());
    }

    fn append(config: &AgentConfig, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.target_path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_backfill_for_missing_file_is_empty() {
        let config = test_config();
        let handle = start_agent(&config).await;

        // 目标文件还不存在：backfill 为空，连接不报错
        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => assert!(lines.is_empty()),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_backfill_existing_content() {
        let config = test_config();
        std::fs::write(&config.target_path, "hello\nworld\n").unwrap();
        let handle = start_agent(&config).await;

        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => assert_eq!(lines, vec!["hello", "world"]),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_live_lines_arrive_in_order() {
        let config = test_config();
        std::fs::write(&config.target_path, "").unwrap();
        let handle = start_agent(&config).await;

        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => assert!(lines.is_empty()),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        append(&config, "A\nB\nC\n");

        for expected in ["A", "B", "C"] {
            match next_push(&mut reader).await {
                Push::NewLine { line } => assert_eq!(line, expected),
                other => panic!("Expected NewLine, got {:?}", other),
            }
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_late_observer_gets_backfill_without_duplicates() {
        let config = test_config();
        std::fs::write(&config.target_path, "").unwrap();
        let handle = start_agent(&config).await;

        // 第一个观察者全程在线
        let (mut reader1, _writer1) = connect_observer(&config).await;
        match next_push(&mut reader1).await {
            Push::Backfill { lines } => assert!(lines.is_empty()),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        append(&config, "hello\nworld\n");

        for expected in ["hello", "world"] {
            match next_push(&mut reader1).await {
                Push::NewLine { line } => assert_eq!(line, expected),
                other => panic!("Expected NewLine, got {:?}", other),
            }
        }

        // 第二个观察者事后接入：只收到 backfill，不重复收 NewLine
        let (mut reader2, _writer2) = connect_observer(&config).await;
        match next_push(&mut reader2).await {
            Push::Backfill { lines } => assert_eq!(lines, vec!["hello", "world"]),
            other => panic!("Expected Backfill, got {:?}", other),
        }
        assert_no_push(&mut reader2, 300).await;

        // 之后的新行两个观察者都收到
        append(&config, "again\n");
        for reader in [&mut reader1, &mut reader2] {
            match next_push(reader).await {
                Push::NewLine { line } => assert_eq!(line, "again"),
                other => panic!("Expected NewLine, got {:?}", other),
            }
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_join_during_pending_append_not_duplicated() {
        // 防抖窗口拉长，让追加在观察者接入时还没被 publish
        let mut config = test_config();
        config.debounce_ms = 1500;
        std::fs::write(&config.target_path, "").unwrap();
        let handle = start_agent(&config).await;

        append(&config, "dup\n");
        sleep(Duration::from_millis(200)).await;

        // 快照以已发布的 offset 为上界：窗口里的行不进 backfill
        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => {
                assert!(lines.is_empty(), "unpublished line leaked into backfill: {:?}", lines)
            }
            other => panic!("Expected Backfill, got {:?}", other),
        }

        // 该行只以 NewLine 的形式到达一次
        match next_push(&mut reader).await {
            Push::NewLine { line } => assert_eq!(line, "dup"),
            other => panic!("Expected NewLine, got {:?}", other),
        }
        assert_no_push(&mut reader, 300).await;

        handle.abort();
    }

    #[tokio::test]
    async fn test_truncation_resets_offset_and_resumes() {
        let config = test_config();
        std::fs::write(&config.target_path, "one\ntwo\n").unwrap();
        let handle = start_agent(&config).await;

        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => assert_eq!(lines, vec!["one", "two"]),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        // 截断：文件变小是不连续点，offset 重置到新大小，不广播任何行
        std::fs::write(&config.target_path, "").unwrap();
        assert_no_push(&mut reader, 500).await;

        // 截断之后追加的行照常交付，没有负长度误读也没有旧内容重放
        append(&config, "fresh\n");
        match next_push(&mut reader).await {
            Push::NewLine { line } => assert_eq!(line, "fresh"),
            other => panic!("Expected NewLine, got {:?}", other),
        }
        assert_no_push(&mut reader, 300).await;

        handle.abort();
    }

    #[tokio::test]
    async fn test_partial_line_delivered_immediately() {
        let config = test_config();
        std::fs::write(&config.target_path, "").unwrap();
        let handle = start_agent(&config).await;

        let (mut reader, _writer) = connect_observer(&config).await;
        match next_push(&mut reader).await {
            Push::Backfill { lines } => assert!(lines.is_empty()),
            other => panic!("Expected Backfill, got {:?}", other),
        }

        // 未以换行符结尾的行立即交付（低延迟优先）
        append(&config, "partial");
        match next_push(&mut reader).await {
            Push::NewLine { line } => assert_eq!(line, "partial"),
            other => panic!("Expected NewLine, got {:?}", other),
        }

        // 收到第一段后再追加，保证两次独立的增量读取；
        // 边界字节不丢不重
        append(&config, "-line\nmore\n");
        match next_push(&mut reader).await {
            Push::NewLine { line } => assert_eq!(line, "-line"),
            other => panic!("Expected NewLine, got {:?}", other),
        }
        match next_push(&mut reader).await {
            Push::NewLine { line } => assert_eq!(line, "more"),
            other => panic!("Expected NewLine, got {:?}", other),
        }

        handle.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_and_invalid_json() {
        let config = test_config();
        let handle = start_agent(&config).await;

        let stream = UnixStream::connect(config.socket_path()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // 非法 JSON → 400 错误，连接保持
        writer.write_all(b"not json\n").await.unwrap();
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, Response::Error { code: 400, .. }));

        // 心跳正常应答
        line.clear();
        writer
            .write_all(format!("{}\n", serde_json::to_string(&Request::Heartbeat).unwrap()).as_bytes())
            .await
            .unwrap();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, Response::Ok));

        handle.abort();
    }
}
