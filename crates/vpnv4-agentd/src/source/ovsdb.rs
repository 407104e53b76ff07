//! Minimal OVSDB JSON-RPC client for the OVN Northbound database
//!
//! Each poll opens a connection, issues one `transact` with a `select` on
//! `Logical_Switch_Port` and decodes the `addresses` and `external_ids`
//! columns. OVSDB frames are back-to-back JSON values with no delimiter, so
//! the reader parses incrementally until a complete value is buffered.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, instrument};
use vpnv4_common::{AgentError, AgentResult};

use super::registry::{PortRecord, RegistryClient};

const DATABASE: &str = "OVN_Northbound";
const TABLE: &str = "Logical_Switch_Port";

/// Where the database listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `tcp:<host>:<port>` or `unix:<path>`
    pub fn parse(connection: &str) -> AgentResult<Self> {
        if let Some(addr) = connection.strip_prefix("tcp:") {
            if addr.is_empty() {
                return Err(AgentError::invalid_config("connection", "missing tcp address"));
            }
            Ok(Endpoint::Tcp(addr.to_string()))
        } else if let Some(path) = connection.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(AgentError::invalid_config("connection", "missing socket path"));
            }
            Ok(Endpoint::Unix(PathBuf::from(path)))
        } else {
            Err(AgentError::invalid_config(
                "connection",
                format!("unsupported endpoint '{}'", connection),
            ))
        }
    }
}

/// OVSDB client listing logical switch ports
#[derive(Debug)]
pub struct OvsdbClient {
    connection: String,
    timeout: Duration,
    next_id: u64,
}

impl OvsdbClient {
    pub fn new(connection: impl Into<String>, timeout: Duration) -> Self {
        Self {
            connection: connection.into(),
            timeout,
            next_id: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> AgentError {
        AgentError::source(format!("ovn:{}", self.connection), message)
    }

    #[instrument(skip(self), fields(connection = %self.connection))]
    async fn query(&mut self) -> AgentResult<Vec<PortRecord>> {
        self.next_id += 1;
        let request = select_request(self.next_id);

        let response = match Endpoint::parse(&self.connection)? {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(&addr)
                    .await
                    .map_err(|e| self.error(format!("connect {}: {}", addr, e)))?;
                transact(stream, &request, self.next_id).await
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(&path)
                    .await
                    .map_err(|e| self.error(format!("connect {}: {}", path.display(), e)))?;
                transact(stream, &request, self.next_id).await
            }
        }
        .map_err(|e| self.error(e))?;

        let ports = decode_select(&response).map_err(|e| self.error(e))?;
        debug!(count = ports.len(), "Fetched logical switch ports");
        Ok(ports)
    }
}

#[async_trait]
impl RegistryClient for OvsdbClient {
    async fn list_ports(&mut self) -> AgentResult<Vec<PortRecord>> {
        let timeout = self.timeout;
        let outcome = tokio::time::timeout(timeout, self.query()).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                operation: format!("ovsdb select on {}", self.connection),
                timeout,
            }),
        }
    }
}

/// `transact` request selecting the columns the agent needs
pub fn select_request(id: u64) -> Value {
    json!({
        "method": "transact",
        "params": [
            DATABASE,
            {
                "op": "select",
                "table": TABLE,
                "where": [],
                "columns": ["addresses", "external_ids"],
            }
        ],
        "id": id,
    })
}

/// Send `request` and wait for the reply carrying `id`.
///
/// Server `echo` requests received meanwhile are answered.
async fn transact<S>(mut stream: S, request: &Value, id: u64) -> Result<Value, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(&mut stream, request).await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        while let Some((message, consumed)) = next_message(&buf)? {
            buf.drain(..consumed);
            if message.get("method").and_then(Value::as_str) == Some("echo") {
                let reply = json!({
                    "result": message.get("params").cloned().unwrap_or(Value::Array(vec![])),
                    "error": null,
                    "id": message.get("id").cloned().unwrap_or(Value::Null),
                });
                write_message(&mut stream, &reply).await?;
                continue;
            }
            if message.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(message);
            }
        }

        let n = stream.read(&mut chunk).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Err("connection closed before reply".to_string());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn write_message<S>(stream: &mut S, message: &Value) -> Result<(), String>
where
    S: AsyncWrite + Unpin,
{
    let bytes = serde_json::to_vec(message).map_err(|e| e.to_string())?;
    stream.write_all(&bytes).await.map_err(|e| e.to_string())?;
    stream.flush().await.map_err(|e| e.to_string())
}

/// Parse the first complete JSON value in `buf`, with the bytes it used
fn next_message(buf: &[u8]) -> Result<Option<(Value, usize)>, String> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(Some((value, stream.byte_offset()))),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(format!("malformed reply: {}", e)),
        None => Ok(None),
    }
}

/// Decode the rows of a `select` reply
pub fn decode_select(response: &Value) -> Result<Vec<PortRecord>, String> {
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        return Err(format!("transact failed: {}", error));
    }
    let first = response
        .get("result")
        .and_then(Value::as_array)
        .and_then(|ops| ops.first())
        .ok_or_else(|| "reply has no result".to_string())?;
    if let Some(error) = first.get("error").filter(|e| !e.is_null()) {
        return Err(format!("select failed: {}", error));
    }
    let rows = first
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| "select reply has no rows".to_string())?;

    Ok(rows
        .iter()
        .map(|row| PortRecord {
            addresses: row.get("addresses").map(decode_set).unwrap_or_default(),
            external_ids: row.get("external_ids").map(decode_map).unwrap_or_default(),
        })
        .collect())
}

/// OVSDB set of strings: a bare atom or `["set", [atoms...]]`
fn decode_set(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(pair) if pair.len() == 2 && pair[0] == "set" => pair[1]
            .as_array()
            .map(|atoms| {
                atoms
                    .iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// OVSDB string map: `["map", [[key, value]...]]`
fn decode_map(value: &Value) -> BTreeMap<String, String> {
    let Some(pair) = value.as_array() else {
        return BTreeMap::new();
    };
    if pair.len() != 2 || pair[0] != "map" {
        return BTreeMap::new();
    }
    pair[1]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let kv = entry.as_array()?;
                    Some((kv.first()?.as_str()?.to_string(), kv.get(1)?.as_str()?.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}
