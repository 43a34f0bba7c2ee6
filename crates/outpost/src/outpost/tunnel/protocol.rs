use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outpost::tunnel::listener::BindError;

/// Handshake document sent by the agent as its first line.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("configuration is not a JSON object")]
    ConfigNotObject,
    #[error("metadata is not a JSON object")]
    MetadataNotObject,
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker-assigned session configuration: `{"bind": [{"protocol": .., "port": ..}]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub bind: Vec<BindEntry>,
}

/// One requested listener. Fields are kept loose so a bad entry fails on its own
/// instead of rejecting the whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindEntry {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: Option<i64>,
}

impl BindEntry {
    pub fn target(&self) -> Result<(Protocol, u16), BindError> {
        let protocol = Protocol::parse(&self.protocol)
            .ok_or_else(|| BindError::UnknownProtocol(self.protocol.clone()))?;
        let port = self.port.ok_or(BindError::MissingPort)?;
        let port = u16::try_from(port).map_err(|_| BindError::PortOutOfRange(port))?;
        Ok((protocol, port))
    }
}

impl fmt::Display for BindEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}/{}", self.protocol, p),
            None => write!(f, "{}/?", self.protocol),
        }
    }
}

pub fn parse_configuration(line: &[u8]) -> Result<Configuration, ProtocolError> {
    let v: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(line))?;
    if !v.is_object() {
        return Err(ProtocolError::ConfigNotObject);
    }
    Ok(serde_json::from_value(v)?)
}

pub fn parse_metadata(data: &[u8]) -> Result<Metadata, ProtocolError> {
    match serde_json::from_slice::<serde_json::Value>(data)? {
        serde_json::Value::Object(m) => Ok(m),
        _ => Err(ProtocolError::MetadataNotObject),
    }
}

/// Single-line JSON for the handshake.
pub fn encode_metadata(meta: &Metadata) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(meta)?)
}

/// `<protocol> <port> <base64(payload)>`, without the line delimiter.
pub fn encode_data_frame(protocol: Protocol, port: u16, payload: &[u8]) -> String {
    format!("{} {} {}", protocol, port, BASE64.encode(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_matches_wire_format() {
        assert_eq!(
            encode_data_frame(Protocol::Tcp, 8080, b"hello"),
            "tcp 8080 aGVsbG8="
        );
        assert_eq!(encode_data_frame(Protocol::Udp, 53, b""), "udp 53 ");
    }

    #[test]
    fn configuration_parses_bind_list() {
        let cfg = parse_configuration(
            br#"{"bind":[{"protocol":"tcp","port":8080},{"protocol":"UDP","port":53}],"extra":1}"#,
        )
        .unwrap();
        assert_eq!(cfg.bind.len(), 2);
        assert_eq!(cfg.bind[0].target().unwrap(), (Protocol::Tcp, 8080));
        assert_eq!(cfg.bind[1].target().unwrap(), (Protocol::Udp, 53));
    }

    #[test]
    fn configuration_without_bind_is_empty() {
        let cfg = parse_configuration(b"{}").unwrap();
        assert!(cfg.bind.is_empty());
    }

    #[test]
    fn configuration_must_be_an_object() {
        assert!(matches!(
            parse_configuration(b"[1,2]"),
            Err(ProtocolError::ConfigNotObject)
        ));
        assert!(matches!(
            parse_configuration(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn bad_entries_fail_individually() {
        let cfg = parse_configuration(
            br#"{"bind":[{"protocol":"sctp","port":1},{"protocol":"tcp"},{"protocol":"udp","port":70000},{"port":5}]}"#,
        )
        .unwrap();
        assert!(matches!(
            cfg.bind[0].target(),
            Err(BindError::UnknownProtocol(p)) if p == "sctp"
        ));
        assert!(matches!(cfg.bind[1].target(), Err(BindError::MissingPort)));
        assert!(matches!(
            cfg.bind[2].target(),
            Err(BindError::PortOutOfRange(70000))
        ));
        assert!(matches!(
            cfg.bind[3].target(),
            Err(BindError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn metadata_roundtrips_on_one_line() {
        let meta = parse_metadata(b"{\n  \"id\": \"agent-1\",\n  \"tags\": [\"a\", \"b\"]\n}").unwrap();
        let line = encode_metadata(&meta).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(parse_metadata(line.as_bytes()).unwrap(), meta);

        assert_eq!(encode_metadata(&Metadata::new()).unwrap(), "{}");
        assert!(matches!(
            parse_metadata(b"\"just a string\""),
            Err(ProtocolError::MetadataNotObject)
        ));
    }
}
