//! Shared helpers: a test server on an ephemeral loopback port, `/bin/sh`
//! backed tools, and a small JSON WebSocket client.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use desktop_agent::AppState;
use desktop_agent_common::{AgentServerConfig, ArgTemplate, ToolDefinition, ToolFamily, ToolRegistry};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(15);

// ── Tools ────────────────────────────────────────────────────────────────────

/// A tool running `sh -c <script>` with the target as `$0`.
pub fn sh_tool(name: &'static str, script: &'static str, family: ToolFamily) -> ToolDefinition {
    let args: &'static [ArgTemplate] = Box::leak(
        vec![
            ArgTemplate::Literal("-c"),
            ArgTemplate::Literal(script),
            ArgTemplate::Target,
        ]
        .into_boxed_slice(),
    );
    ToolDefinition {
        name,
        executable: "/bin/sh",
        fixed_args: args,
        description: "test tool",
        family,
    }
}

/// Tools used across the integration suites. `stubborn` is the only
/// deep-scan tool so its timeout can be set independently.
pub fn test_tools() -> Vec<ToolDefinition> {
    vec![
        sh_tool("greeter", "echo \"scanning $0\"; echo done", ToolFamily::Recon),
        sh_tool("sleeper", "echo started; sleep 30", ToolFamily::Recon),
        sh_tool("pid", "echo $$; sleep 30", ToolFamily::Recon),
        sh_tool("steady", "echo working; sleep 1; echo finished", ToolFamily::Recon),
        sh_tool(
            "chatty",
            "i=0; while [ $i -lt 50 ]; do echo 0123456789; i=$((i+1)); done",
            ToolFamily::Recon,
        ),
        sh_tool(
            "stubborn",
            "trap '' TERM; echo started; while true; do sleep 1; done",
            ToolFamily::DeepScan,
        ),
        ToolDefinition {
            name: "missing",
            executable: "/nonexistent/desktop-agent-tool",
            ..sh_tool("missing", "true", ToolFamily::Recon)
        },
    ]
}

pub fn test_config() -> AgentServerConfig {
    AgentServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        rate_limit_requests: 1000,
        recon_timeout_secs: 60,
        deep_scan_timeout_secs: 1,
        grace_period_secs: 1,
        ..AgentServerConfig::default()
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
}

impl TestServer {
    pub async fn start(config: AgentServerConfig) -> Self {
        Self::with_tools(config, test_tools()).await
    }

    pub async fn with_tools(config: AgentServerConfig, tools: Vec<ToolDefinition>) -> Self {
        let registry = ToolRegistry::new(tools).expect("test registry");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(AppState::new(config, registry));
        tokio::spawn(desktop_agent::serve(
            listener,
            Arc::clone(&state),
            std::future::pending(),
        ));
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Connect and consume the welcome event.
    pub async fn client(&self) -> Client {
        let (client, welcome) = self.client_with_welcome().await;
        assert_eq!(welcome["type"], "welcome");
        client
    }

    pub async fn client_with_welcome(&self) -> (Client, Value) {
        let mut client = Client::connect(&self.url()).await;
        let welcome = client.recv().await;
        (client, welcome)
    }

    /// Wait until the server has released every connection.
    pub async fn wait_for_no_connections(&self) {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while self.state.connection_count().await > 0 {
            assert!(Instant::now() < deadline, "connections never released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        Self { ws }
    }

    pub async fn send(&mut self, message: Value) {
        self.send_text(&message.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.expect("send");
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::binary(bytes)).await.expect("send");
    }

    pub async fn execute(&mut self, tool: &str, target: &str) {
        self.send(serde_json::json!({"type": "execute_tool", "tool": tool, "target": target}))
            .await;
    }

    /// Next JSON event, skipping control frames.
    pub async fn recv(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for an event")
                .expect("stream ended")
                .expect("websocket error");
            match frame {
                Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json"),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Collect events until one of type `kind` arrives; returns the events
    /// before it and the matching event.
    pub async fn recv_until(&mut self, kind: &str) -> (Vec<Value>, Value) {
        let mut seen = Vec::new();
        loop {
            let event = self.recv().await;
            if event["type"] == kind {
                return (seen, event);
            }
            seen.push(event);
        }
    }

    /// The close frame the server ends the connection with.
    pub async fn recv_close(&mut self) -> Option<CloseFrame> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match frame {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => panic!("expected close, got {other:?}"),
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ── Processes ────────────────────────────────────────────────────────────────

/// True once `pid` no longer exists or is a zombie awaiting its reaper.
pub async fn wait_until_gone(pid: i32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        let gone = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| matches!(rest.trim_start().chars().next(), Some('Z' | 'X'))),
        };
        if gone {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
