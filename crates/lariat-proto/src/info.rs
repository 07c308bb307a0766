//! The `INFO` payload sent by the server on connect (and occasionally
//! mid-connection, e.g. when entering lame duck mode).

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

/// Server-advertised identity and limits.
///
/// Unknown fields are ignored so that newer servers remain connectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Largest publish payload the server will accept, in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Whether the server understands `HPUB`/`HMSG`.
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub client_ip: String,
    /// Server is shutting down gracefully and will stop accepting work.
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
}

impl Default for ServerInfo {
    fn default() -> Self {
        ServerInfo {
            server_id: String::new(),
            server_name: String::new(),
            version: String::new(),
            proto: 1,
            host: String::new(),
            port: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
            headers: true,
            client_id: 0,
            client_ip: String::new(),
            lame_duck_mode: false,
        }
    }
}
