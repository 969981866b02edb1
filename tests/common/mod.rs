//! Shared helpers for the integration tests: servers on ephemeral ports and a
//! minimal client speaking the text protocol over raw TCP.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use meshmq::config::Config;
use meshmq::Server;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

/// Configuration for a clustered test server with fast reconnects
pub fn cluster_config(id: &str, routes: &[SocketAddr]) -> Config {
    let routes: Vec<String> = routes.iter().map(|addr| format!("\"{}\"", addr)).collect();
    Config::parse(&format!(
        r#"
[server]
id = "{id}"
name = "{name}"
bind = "127.0.0.1:0"

[cluster]
enabled = true
listen = "127.0.0.1:0"
routes = [{routes}]
connect_retry_initial = "20ms"
connect_retry_max = "200ms"
"#,
        id = id,
        name = id.to_lowercase(),
        routes = routes.join(", ")
    ))
    .expect("valid test config")
}

/// Start a standalone server
pub async fn start_standalone(id: &str) -> Arc<Server> {
    let config = Config::parse(&format!(
        "[server]\nid = \"{}\"\nbind = \"127.0.0.1:0\"\n",
        id
    ))
    .expect("valid test config");
    let server = Server::new(config, None).expect("server");
    server.start().await.expect("start");
    server
}

/// Start a clustered server soliciting `routes`
pub async fn start_clustered(id: &str, routes: &[SocketAddr]) -> Arc<Server> {
    let server = Server::new(cluster_config(id, routes), None).expect("server");
    server.start().await.expect("start");
    server
}

pub fn cluster_addr(server: &Server) -> SocketAddr {
    server.cluster_addr().expect("cluster listener bound")
}

/// Poll `condition` until it holds or [`WAIT`] passes
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Wait until `server` has exactly `n` routes
pub async fn wait_routes(server: &Server, n: usize) -> bool {
    wait_for(|| server.routes_snapshot().len() == n).await
}

/// Wait until `server` holds exactly `n` subscriptions
pub async fn wait_subscriptions(server: &Server, n: usize) -> bool {
    wait_for(|| server.subscription_count() == n).await
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub subject: String,
    pub sid: String,
    pub reply: Option<String>,
    pub payload: String,
}

/// Something the server sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(String),
    Msg(Msg),
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Raw-TCP client for the text protocol
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    /// Messages read while waiting for something else
    pending: VecDeque<Msg>,
    pub info: String,
}

impl TestClient {
    /// Connect, read `INFO` and send `CONNECT` with `options`
    pub async fn connect_with(addr: SocketAddr, options: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut client = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            pending: VecDeque::new(),
            info: String::new(),
        };
        match client.read_op().await {
            Some(ServerOp::Info(info)) => client.info = info,
            other => panic!("expected INFO, got {:?}", other),
        }
        client.send(&format!("CONNECT {}\r\n", options)).await;
        client
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_with(addr, r#"{"verbose":false}"#).await
    }

    pub async fn send(&mut self, data: &str) {
        self.stream
            .write_all(data.as_bytes())
            .await
            .expect("write");
    }

    pub async fn sub(&mut self, subject: &str, sid: &str) {
        self.send(&format!("SUB {} {}\r\n", subject, sid)).await;
    }

    pub async fn qsub(&mut self, subject: &str, queue: &str, sid: &str) {
        self.send(&format!("SUB {} {} {}\r\n", subject, queue, sid))
            .await;
    }

    pub async fn unsub(&mut self, sid: &str) {
        self.send(&format!("UNSUB {}\r\n", sid)).await;
    }

    pub async fn publish(&mut self, subject: &str, payload: &str) {
        self.send(&format!("PUB {} {}\r\n{}\r\n", subject, payload.len(), payload))
            .await;
    }

    pub async fn publish_with_reply(&mut self, subject: &str, reply: &str, payload: &str) {
        self.send(&format!(
            "PUB {} {} {}\r\n{}\r\n",
            subject,
            reply,
            payload.len(),
            payload
        ))
        .await;
    }

    /// Round-trip a `PING`, so everything sent before has been processed
    pub async fn flush(&mut self) {
        self.send("PING\r\n").await;
        loop {
            match self.read_op().await {
                Some(ServerOp::Pong) => return,
                Some(ServerOp::Msg(msg)) => self.pending.push_back(msg),
                Some(ServerOp::Ping) => self.send("PONG\r\n").await,
                Some(ServerOp::Ok) => {}
                other => panic!("expected PONG, got {:?}", other),
            }
        }
    }

    /// Next delivered message, failing the test after [`WAIT`]
    pub async fn next_msg(&mut self) -> Msg {
        match timeout(WAIT, self.recv_msg()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => panic!("connection closed while waiting for MSG"),
            Err(_) => panic!("timed out waiting for MSG"),
        }
    }

    /// Collect messages until none arrives for `quiet`
    pub async fn drain_msgs(&mut self, quiet: Duration) -> Vec<Msg> {
        let mut msgs: Vec<Msg> = self.pending.drain(..).collect();
        while let Ok(Some(msg)) = timeout(quiet, self.recv_msg()).await {
            msgs.push(msg);
        }
        msgs
    }

    async fn recv_msg(&mut self) -> Option<Msg> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(msg);
        }
        loop {
            match self.read_op().await? {
                ServerOp::Msg(msg) => return Some(msg),
                ServerOp::Ping => self.send("PONG\r\n").await,
                _ => {}
            }
        }
    }

    /// Read the next server operation; `None` once the server closed
    pub async fn read_op(&mut self) -> Option<ServerOp> {
        let line = self.read_line().await?;
        if let Some(info) = line.strip_prefix("INFO ") {
            return Some(ServerOp::Info(info.to_string()));
        }
        if let Some(err) = line.strip_prefix("-ERR ") {
            return Some(ServerOp::Err(err.trim_matches('\'').to_string()));
        }
        match line.as_str() {
            "PING" => return Some(ServerOp::Ping),
            "PONG" => return Some(ServerOp::Pong),
            "+OK" => return Some(ServerOp::Ok),
            _ => {}
        }

        let args: Vec<&str> = line.split_ascii_whitespace().collect();
        let (subject, sid, reply, size) = match args.as_slice() {
            ["MSG", subject, sid, size] => (*subject, *sid, None, *size),
            ["MSG", subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
            _ => panic!("unexpected line from server: {:?}", line),
        };
        let size: usize = size.parse().expect("payload size");
        let payload = self.read_exact(size + 2).await?;
        Some(ServerOp::Msg(Msg {
            subject: subject.to_string(),
            sid: sid.to_string(),
            reply,
            payload: String::from_utf8_lossy(&payload[..size]).into_owned(),
        }))
    }

    async fn fill(&mut self) -> Option<()> {
        match self.stream.read_buf(&mut self.buf).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(()),
        }
    }

    async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                return Some(
                    String::from_utf8_lossy(&line)
                        .trim_end_matches(['\r', '\n'])
                        .to_string(),
                );
            }
            self.fill().await?;
        }
    }

    async fn read_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        while self.buf.len() < n {
            self.fill().await?;
        }
        let data = self.buf[..n].to_vec();
        self.buf.advance(n);
        Some(data)
    }

    /// True once the server has closed the connection
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => {
                    self.buf.clear();
                    continue;
                }
                Err(_) => return false,
            }
        }
    }
}
