use serde::Deserialize;
use std::fmt;

use crate::protocol::Protocol;

pub const DEVICE_ID_LEN: usize = 20;
pub const LOCAL_KEY_LEN: usize = 16;

/// Tuya local-API TCP port.
pub const TUYA_PORT: u16 = 6668;

const POLL_INTERVALS: &[u64] = &[0, 30, 60, 120];

/// On-disk configuration shape; validated into [`Config`].
#[derive(Deserialize)]
struct RawConfig {
    device_ip: String,
    #[serde(default = "default_port")]
    device_port: u16,
    device_id: String,
    local_key: String,
    #[serde(default = "default_protocol")]
    protocol: u32,
    #[serde(default)]
    poll_interval_sec: u64,
    #[serde(default = "default_true")]
    auto_reconnect: bool,
    #[serde(default)]
    use_heartbeat: bool,
    bridge: Option<BridgeConfig>,
}

fn default_port() -> u16 {
    TUYA_PORT
}

fn default_protocol() -> u32 {
    33
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub token: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:8998".to_owned()
}

/// Validated device binding plus runtime knobs. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub device_ip: String,
    pub device_port: u16,
    pub device_id: String,
    pub local_key: [u8; LOCAL_KEY_LEN],
    pub protocol: Protocol,
    pub poll_interval_sec: u64,
    pub auto_reconnect: bool,
    pub use_heartbeat: bool,
    pub bridge: Option<BridgeConfig>,
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound(String),
    ParseError(String),
    InvalidLocalKey(usize),
    InvalidDeviceId(usize),
    InvalidProtocol(u32),
    InvalidPollInterval(u64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {msg}"),
            ConfigError::InvalidLocalKey(len) => {
                write!(f, "local_key must be exactly {LOCAL_KEY_LEN} bytes, got {len}")
            }
            ConfigError::InvalidDeviceId(len) => {
                write!(f, "device_id must be exactly {DEVICE_ID_LEN} characters, got {len}")
            }
            ConfigError::InvalidProtocol(v) => {
                write!(f, "protocol must be 31, 33 or 34, got {v}")
            }
            ConfigError::InvalidPollInterval(v) => {
                write!(f, "poll_interval_sec must be one of 0, 30, 60 or 120, got {v}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.to_owned()))?;

    let raw: RawConfig =
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    validate(raw)
}

fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    if raw.device_id.len() != DEVICE_ID_LEN {
        return Err(ConfigError::InvalidDeviceId(raw.device_id.len()));
    }

    let local_key = decode_local_key(&raw.local_key)?;

    let protocol =
        Protocol::from_number(raw.protocol).ok_or(ConfigError::InvalidProtocol(raw.protocol))?;

    if !POLL_INTERVALS.contains(&raw.poll_interval_sec) {
        return Err(ConfigError::InvalidPollInterval(raw.poll_interval_sec));
    }

    Ok(Config {
        device_ip: raw.device_ip,
        device_port: raw.device_port,
        device_id: raw.device_id,
        local_key,
        protocol,
        poll_interval_sec: raw.poll_interval_sec,
        auto_reconnect: raw.auto_reconnect,
        use_heartbeat: raw.use_heartbeat,
        bridge: raw.bridge,
    })
}

/// Keys arrive via copy-paste from vendor tooling which HTML-escapes
/// them; undo the common entities before taking the UTF-8 bytes.
pub fn decode_local_key(raw: &str) -> Result<[u8; LOCAL_KEY_LEN], ConfigError> {
    let decoded = raw
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");

    let bytes = decoded.as_bytes();
    if bytes.len() != LOCAL_KEY_LEN {
        return Err(ConfigError::InvalidLocalKey(bytes.len()));
    }

    let mut key = [0u8; LOCAL_KEY_LEN];
    key.copy_from_slice(bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).expect("test TOML is well-formed");
        validate(raw)
    }

    const BASE: &str = r#"
device_ip = "192.168.1.40"
device_id = "bf1234567890abcdef12"
local_key = "1234567890abcdef"
"#;

    #[test]
    fn defaults_apply() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.device_port, TUYA_PORT);
        assert_eq!(config.protocol, Protocol::V33);
        assert_eq!(config.poll_interval_sec, 0);
        assert!(config.auto_reconnect);
        assert!(!config.use_heartbeat);
        assert!(config.bridge.is_none());
    }

    #[test]
    fn local_key_entity_decoding() {
        let key = decode_local_key("&lt;abcdefgh&gt;hijkl&amp;").unwrap();
        assert_eq!(&key, b"<abcdefgh>hijkl&");
    }

    #[test]
    fn local_key_length_enforced_after_decoding() {
        // "&lt;" collapses to one byte; the raw string is longer than 16
        assert!(decode_local_key("&lt;&lt;&lt;&lt;").is_err());
        assert!(matches!(
            decode_local_key("short"),
            Err(ConfigError::InvalidLocalKey(5))
        ));
    }

    #[test]
    fn rejects_bad_protocol() {
        let contents = format!("{BASE}protocol = 35\n");
        assert!(matches!(
            parse(&contents),
            Err(ConfigError::InvalidProtocol(35))
        ));
    }

    #[test]
    fn rejects_bad_poll_interval() {
        let contents = format!("{BASE}poll_interval_sec = 45\n");
        assert!(matches!(
            parse(&contents),
            Err(ConfigError::InvalidPollInterval(45))
        ));
    }

    #[test]
    fn rejects_bad_device_id() {
        let contents = BASE.replace("bf1234567890abcdef12", "tooshort");
        assert!(matches!(
            parse(&contents),
            Err(ConfigError::InvalidDeviceId(8))
        ));
    }

    #[test]
    fn accepts_explicit_protocols() {
        for (n, p) in [(31, Protocol::V31), (33, Protocol::V33), (34, Protocol::V34)] {
            let contents = format!("{BASE}protocol = {n}\n");
            assert_eq!(parse(&contents).unwrap().protocol, p);
        }
    }

    #[test]
    fn bridge_section_parses() {
        let contents = format!("{BASE}\n[bridge]\nlisten = \"0.0.0.0:9000\"\ntoken = \"s3cret\"\n");
        let config = parse(&contents).unwrap();
        let bridge = config.bridge.unwrap();
        assert_eq!(bridge.listen, "0.0.0.0:9000");
        assert_eq!(bridge.token.as_deref(), Some("s3cret"));
    }
}
