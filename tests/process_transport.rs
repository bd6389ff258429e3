//! Bridge against a real child process speaking newline-delimited JSON-RPC
#![cfg(unix)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use toolbridge::config::{BridgeConfig, InMemoryConfigStore, ServerConfig};
use toolbridge::ToolBridge;

const TOOL_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo "tool server starting" >&2
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"1"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      echo "not json"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}},{"name":"quit","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *'"name":"quit"'*)
      exit 3
      ;;
    *'"method":"tools/call"'*)
      text=$(printf '%s\n' "$line" | sed -n 's/.*"text":"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$text"
      ;;
  esac
done
"#;

fn tool_server() -> (TempDir, ServerConfig) {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("server.sh");
    std::fs::write(&script, TOOL_SERVER).unwrap();
    let config = ServerConfig::stdio(
        "alice",
        "sh",
        "sh",
        vec![script.to_string_lossy().into_owned()],
    );
    (dir, config)
}

fn bridge(settings: BridgeConfig, config: ServerConfig) -> ToolBridge {
    let store = Arc::new(InMemoryConfigStore::with_servers([config]));
    ToolBridge::new(settings, store).unwrap()
}

fn settings() -> BridgeConfig {
    BridgeConfig {
        shutdown_grace: Duration::from_millis(500),
        ..BridgeConfig::default()
    }
}

#[tokio::test]
async fn echo_through_child_process() {
    let (_dir, config) = tool_server();
    let bridge = bridge(settings(), config);

    let tools: Vec<String> = bridge
        .list_tools("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.namespaced_name)
        .collect();
    assert_eq!(tools, vec!["sh__echo", "sh__quit", "sh__close_session"]);

    let output = bridge
        .invoke("alice", "sh__echo", json!({ "text": "hello" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.text, "hello");
    assert!(!output.is_error);

    let sessions = bridge.live_sessions("alice").await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].transport, "stdio");

    bridge.shutdown().await;
    assert!(bridge.live_sessions("alice").await.is_empty());
}

#[tokio::test]
async fn exited_process_is_restarted() {
    let (_dir, config) = tool_server();
    let bridge = bridge(settings(), config);

    let output = bridge.invoke("alice", "sh__quit", json!({})).await.unwrap().unwrap();
    assert!(output.is_error);
    assert!(output.text.contains("exit code 3"), "{}", output.text);

    let output = bridge
        .invoke("alice", "sh__echo", json!({ "text": "back" }))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.text, "back");
    bridge.shutdown().await;
}

#[tokio::test]
async fn idle_process_is_stopped() {
    let (_dir, config) = tool_server();
    let bridge = bridge(
        BridgeConfig {
            idle_timeout: Duration::from_millis(300),
            ..settings()
        },
        config,
    );

    bridge
        .invoke("alice", "sh__echo", json!({ "text": "x" }))
        .await
        .unwrap();
    assert_eq!(bridge.live_sessions("alice").await.len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(bridge.live_sessions("alice").await.is_empty());
}
