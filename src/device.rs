//! Miner device client and reading codec.
//!
//! Speaks the cgminer-style TCP command protocol: a fresh connection per
//! query, one JSON request, one NUL-padded JSON response. The response
//! carries a `STATUS` array (whose first element timestamps the reading)
//! and a `DEVS` array of per-unit metrics that the pipeline passes through
//! untouched.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default deadline for a whole query (connect, write, read).
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a device response. Responses are small JSON documents;
/// anything past this is a misbehaving device, not a bigger reading.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Errors from the device transport.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Connection, write, or read failure.
    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The query deadline elapsed before the device closed the response.
    #[error("device query timed out after {0:?}")]
    Timeout(Duration),

    /// The device kept sending past the response cap.
    #[error("device response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// Failed to encode the command request.
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Errors from decoding a device payload into a [`Reading`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// Payload is not the expected JSON document.
    #[error("malformed device payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed but its `STATUS` array is empty, so there is no
    /// event timestamp to stamp the reading with.
    #[error("device payload has an empty STATUS array")]
    EmptyStatus,
}

#[derive(Debug, Serialize)]
struct MinerCommand<'a> {
    command: &'a str,
    parameter: &'a str,
}

/// One element of the device's `STATUS` array.
///
/// Only `When` is interpreted; everything else rides along so the spooled
/// reading keeps the full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Device-reported event time, epoch seconds.
    #[serde(rename = "When")]
    pub when: i64,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// One timestamped snapshot of device telemetry.
///
/// Immutable once decoded: `device_name` and `when` are fixed before the
/// reading is first persisted. Serialized field names match the device
/// payload (`STATUS`, `DEVS`, `When`) so the spooled file is the upload
/// body, verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    /// Local identifier from configuration, never device-reported.
    #[serde(rename = "deviceName", default)]
    pub device_name: String,

    /// Event time in epoch seconds, taken from `STATUS[0].When`.
    #[serde(default)]
    pub when: i64,

    /// Device status array, passed through.
    #[serde(rename = "STATUS", default)]
    pub status: Vec<StatusEntry>,

    /// Per-unit metric objects, open schema, passed through.
    #[serde(rename = "DEVS", default)]
    pub devs: Vec<serde_json::Value>,
}

impl Reading {
    /// Decode a raw device response and stamp it with the local device
    /// name and the event time from the first status element.
    ///
    /// # Errors
    /// `ParseError::Json` for a malformed payload, `ParseError::EmptyStatus`
    /// when there is no status element to take the event time from.
    pub fn decode(raw: &str, device_name: &str) -> Result<Self, ParseError> {
        let mut reading: Self = serde_json::from_str(raw)?;
        let first = reading.status.first().ok_or(ParseError::EmptyStatus)?;
        reading.when = first.when;
        reading.device_name = device_name.to_string();
        Ok(reading)
    }

    /// Deterministic spool entry name: `{deviceName}_{eventTimeSeconds}`.
    ///
    /// Two readings with identical identity collide on disk by overwrite,
    /// which is the intended second-granularity dedup.
    pub fn entry_name(&self) -> String {
        format!("{}_{}", self.device_name, self.when)
    }
}

/// Client for the miner's TCP command socket.
///
/// Opens a new connection for every call; no pooling, no retries. Failures
/// are returned to the caller, never absorbed here.
#[derive(Debug, Clone)]
pub struct MinerClient {
    addr: String,
    query_timeout: Duration,
}

impl MinerClient {
    /// Create a client for `host:port` with the default query deadline.
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host.as_ref(), port),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Set the whole-query deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Send one command and return the response text with trailing NUL
    /// padding trimmed.
    ///
    /// The deadline covers connect, write, and read-to-EOF as a whole;
    /// hitting it is an explicit [`DeviceError::Timeout`] rather than a
    /// silent short read.
    pub async fn query(&self, command: &str, parameter: &str) -> Result<String, DeviceError> {
        let request = serde_json::to_vec(&MinerCommand { command, parameter })
            .map_err(DeviceError::Encode)?;

        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.write_all(&request).await?;

            let mut raw = Vec::new();
            (&mut stream)
                .take((MAX_RESPONSE_BYTES + 1) as u64)
                .read_to_end(&mut raw)
                .await?;
            Ok::<_, DeviceError>(raw)
        };

        let raw = match timeout(self.query_timeout, exchange).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(DeviceError::Timeout(self.query_timeout)),
        };

        if raw.len() > MAX_RESPONSE_BYTES {
            return Err(DeviceError::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }

        let text = String::from_utf8_lossy(&raw);
        Ok(text.trim_end_matches('\0').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use tokio::net::TcpListener;

    const PAYLOAD: &str = r#"{"STATUS":[{"STATUS":"S","When":1000,"Msg":"1 GPU(s)"}],"DEVS":[{"GPU":0,"Temperature":66.0,"Accepted":42}]}"#;

    #[test]
    fn test_command_encoding() {
        let bytes = serde_json::to_vec(&MinerCommand {
            command: "devs",
            parameter: "",
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"command":"devs","parameter":""}"#
        );
    }

    #[test]
    fn test_decode_stamps_identity() {
        let reading = Reading::decode(PAYLOAD, "rig1").unwrap();
        assert_eq!(reading.device_name, "rig1");
        assert_eq!(reading.when, 1000);
        assert_eq!(reading.entry_name(), "rig1_1000");
        assert_eq!(reading.devs.len(), 1);
    }

    #[test]
    fn test_decode_overrides_device_reported_name() {
        let raw = r#"{"deviceName":"liar","STATUS":[{"When":5}],"DEVS":[]}"#;
        let reading = Reading::decode(raw, "rig1").unwrap();
        assert_eq!(reading.device_name, "rig1");
        assert_eq!(reading.when, 5);
    }

    #[test]
    fn test_decode_rejects_empty_status() {
        let raw = r#"{"STATUS":[],"DEVS":[{"GPU":0}]}"#;
        let err = Reading::decode(raw, "rig1").unwrap_err();
        assert!(matches!(err, ParseError::EmptyStatus));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let err = Reading::decode("not json at all", "rig1").unwrap_err();
        assert!(matches!(err, ParseError::Json(_)));
    }

    #[test]
    fn test_status_passthrough_survives_roundtrip() {
        let reading = Reading::decode(PAYLOAD, "rig1").unwrap();
        let serialized = serde_json::to_string(&reading).unwrap();
        let value: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(value["deviceName"], "rig1");
        assert_eq!(value["when"], 1000);
        assert_eq!(value["STATUS"][0]["Msg"], "1 GPU(s)");
        assert_eq!(value["DEVS"][0]["Temperature"], 66.0);
    }

    // =========================================================================
    // Integration tests against a scripted local listener
    // =========================================================================

    /// Accept one connection, consume the request, reply with `response`.
    async fn scripted_device(response: Vec<u8>) -> Option<std::net::SocketAddr> {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                // Some sandboxed environments disallow binding; skip the test.
                return None;
            }
            Err(e) => panic!("Failed to bind test listener: {e}"),
        };
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut request = vec![0u8; 256];
                let _ = stream.read(&mut request).await;
                let _ = stream.write_all(&response).await;
            }
        });

        Some(addr)
    }

    #[tokio::test]
    async fn test_query_trims_nul_padding() {
        let mut padded = PAYLOAD.as_bytes().to_vec();
        padded.resize(4096, 0);
        let Some(addr) = scripted_device(padded).await else {
            return;
        };

        let client = MinerClient::new(addr.ip().to_string(), addr.port());
        let response = client.query("devs", "").await.unwrap();
        assert_eq!(response, PAYLOAD);
    }

    #[tokio::test]
    async fn test_query_timeout_is_explicit() {
        // Listener that accepts but never responds.
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return,
            Err(e) => panic!("Failed to bind test listener: {e}"),
        };
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client = MinerClient::new(addr.ip().to_string(), addr.port())
            .with_timeout(Duration::from_millis(100));
        let err = client.query("devs", "").await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_query_connection_refused() {
        // Port very likely unused.
        let client = MinerClient::new("127.0.0.1", 59998);
        let err = client.query("devs", "").await.unwrap_err();
        assert!(matches!(err, DeviceError::Io(_) | DeviceError::Timeout(_)));
    }
}
