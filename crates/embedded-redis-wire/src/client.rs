//! Single-connection admin client.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::{Frame, Result, WireError, parse_frame};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Parsed `CLUSTER INFO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    fields: HashMap<String, String>,
}

impl ClusterInfo {
    /// Parses the `key:value` lines of a `CLUSTER INFO` reply.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self { fields }
    }

    /// Returns a raw field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Returns the `cluster_state` field (`ok` or `fail`).
    pub fn state(&self) -> Option<&str> {
        self.get("cluster_state")
    }

    /// Returns `true` when the node reports `cluster_state:ok`.
    pub fn is_ok(&self) -> bool {
        self.state() == Some("ok")
    }

    /// Returns `cluster_known_nodes`, if present.
    pub fn known_nodes(&self) -> Option<usize> {
        self.get("cluster_known_nodes")?.parse().ok()
    }
}

/// Admin connection to one Redis node.
pub struct AdminClient {
    stream: TcpStream,
    buf: BytesMut,
    peer: String,
}

impl AdminClient {
    /// Connects with the default two-second timeout.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_timeout(host, port, DEFAULT_CONNECT_TIMEOUT).await
    }

    /// Connects, failing with [`WireError::ConnectTimeout`] after `timeout`.
    pub async fn connect_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer.as_str()))
            .await
            .map_err(|_| WireError::ConnectTimeout(peer.clone()))??;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            peer,
        })
    }

    /// Returns the `host:port` this client talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a command and returns its reply. Error replies become
    /// [`WireError::Server`].
    pub async fn command<I, S>(&mut self, parts: I) -> Result<Frame>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let frame = Frame::command(parts);
        let mut out = BytesMut::new();
        frame.serialize(&mut out);
        trace!(peer = %self.peer, bytes = out.len(), "sending command");
        self.stream.write_all(&out).await?;

        match self.read_frame().await? {
            Frame::Error(msg) => Err(WireError::Server(msg)),
            reply => Ok(reply),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = parse_frame(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(WireError::ConnectionClosed(self.peer.clone()));
            }
        }
    }

    async fn expect_ok<I, S>(&mut self, name: &str, parts: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let reply = self.command(parts).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(WireError::UnexpectedReply {
                command: name.to_string(),
                reply: format!("{reply:?}"),
            })
        }
    }

    async fn text<I, S>(&mut self, name: &str, parts: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let reply = self.command(parts).await?;
        reply.as_text().ok_or_else(|| WireError::UnexpectedReply {
            command: name.to_string(),
            reply: format!("{reply:?}"),
        })
    }

    /// `AUTH <password>`.
    pub async fn auth(&mut self, password: &str) -> Result<()> {
        self.expect_ok("AUTH", ["AUTH", password]).await
    }

    /// `PING`, expecting `PONG`.
    pub async fn ping(&mut self) -> Result<()> {
        let reply = self.text("PING", ["PING"]).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(WireError::UnexpectedReply {
                command: "PING".to_string(),
                reply,
            })
        }
    }

    /// `CLUSTER MEET <host> <port>`.
    pub async fn cluster_meet(&mut self, host: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        self.expect_ok("CLUSTER MEET", ["CLUSTER", "MEET", host, port.as_str()])
            .await
    }

    /// `CLUSTER ADDSLOTS <slot>...`.
    pub async fn cluster_add_slots(&mut self, slots: &[u16]) -> Result<()> {
        let mut parts = vec!["CLUSTER".to_string(), "ADDSLOTS".to_string()];
        parts.extend(slots.iter().map(u16::to_string));
        self.expect_ok("CLUSTER ADDSLOTS", parts).await
    }

    /// `CLUSTER REPLICATE <node-id>`.
    pub async fn cluster_replicate(&mut self, node_id: &str) -> Result<()> {
        self.expect_ok("CLUSTER REPLICATE", ["CLUSTER", "REPLICATE", node_id])
            .await
    }

    /// `CLUSTER NODES`, raw text.
    pub async fn cluster_nodes(&mut self) -> Result<String> {
        self.text("CLUSTER NODES", ["CLUSTER", "NODES"]).await
    }

    /// Returns this node's id: the first field of the `myself` line in
    /// `CLUSTER NODES`. Works on servers that predate `CLUSTER MYID`.
    pub async fn cluster_myid(&mut self) -> Result<String> {
        let nodes = self.cluster_nodes().await?;
        own_node_id(&nodes).ok_or_else(|| WireError::UnexpectedReply {
            command: "CLUSTER NODES".to_string(),
            reply: nodes.clone(),
        })
    }

    /// `CLUSTER INFO`, parsed.
    pub async fn cluster_info(&mut self) -> Result<ClusterInfo> {
        let text = self.text("CLUSTER INFO", ["CLUSTER", "INFO"]).await?;
        Ok(ClusterInfo::parse(&text))
    }
}

/// Extracts the id of the `myself` entry from `CLUSTER NODES` output.
pub fn own_node_id(nodes: &str) -> Option<String> {
    nodes.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let id = fields.next()?;
        let _addr = fields.next()?;
        let flags = fields.next()?;
        flags
            .split(',')
            .any(|f| f == "myself")
            .then(|| id.to_string())
    })
}
