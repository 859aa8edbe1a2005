//! Request and reply shapes of the administrative surface

use serde::{Deserialize, Serialize};
use tunnelbay_proto::{CodecError, TunnelTarget};

/// What a caller asks for when opening a tunnel.
///
/// Serialized as `{"id": 42, "proto": "tcp", "host": "10.0.0.5", "port": 22}`
/// or `{"id": 42, "proto": "serial", "ser_name": "/dev/ttyUSB0", "rate": 115200}`.
/// Two requests with equal options share one tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Hardware id of the agent
    pub id: u64,
    #[serde(flatten)]
    pub target: TargetOptions,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum TargetOptions {
    Tcp {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: u16,
    },
    Serial {
        #[serde(default)]
        ser_name: String,
        #[serde(default)]
        rate: u32,
    },
}

impl TunnelOptions {
    pub fn tcp(hw_id: u64, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: hw_id,
            target: TargetOptions::Tcp {
                host: host.into(),
                port,
            },
            ssl: false,
        }
    }

    pub fn serial(hw_id: u64, ser_name: impl Into<String>, rate: u32) -> Self {
        Self {
            id: hw_id,
            target: TargetOptions::Serial {
                ser_name: ser_name.into(),
                rate,
            },
            ssl: false,
        }
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Validated wire target
    pub fn tunnel_target(&self) -> Result<TunnelTarget, CodecError> {
        match &self.target {
            TargetOptions::Tcp { host, port } => {
                TunnelTarget::from_parts(Some(host.as_str()), Some(*port), None, None)
            }
            TargetOptions::Serial { ser_name, rate } => {
                TunnelTarget::from_parts(None, None, Some(ser_name.as_str()), Some(*rate))
            }
        }
    }
}

/// Where a customer connects, and the tunnel id to close it with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    /// Customer-facing port
    pub port: u16,
    /// Tunnel id (the communicate port)
    pub id: u16,
}

/// Terse result handed back to administrative callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OpenTunnelReply {
    Ok { port: u16, id: u16 },
    Error,
}

impl<E> From<Result<TunnelInfo, E>> for OpenTunnelReply {
    fn from(result: Result<TunnelInfo, E>) -> Self {
        match result {
            Ok(info) => OpenTunnelReply::Ok {
                port: info.port,
                id: info.id,
            },
            Err(_) => OpenTunnelReply::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_options() {
        let options: TunnelOptions =
            serde_json::from_str(r#"{"id": 42, "proto": "tcp", "host": "10.0.0.5", "port": 22}"#)
                .unwrap();
        assert_eq!(options, TunnelOptions::tcp(42, "10.0.0.5", 22));
        assert_eq!(
            options.tunnel_target().unwrap(),
            TunnelTarget::tcp("10.0.0.5", 22).unwrap()
        );
    }

    #[test]
    fn test_parse_serial_options() {
        let options: TunnelOptions = serde_json::from_str(
            r#"{"id": 7, "proto": "serial", "ser_name": "/dev/ttyUSB0", "rate": 115200, "ssl": true}"#,
        )
        .unwrap();
        assert_eq!(
            options,
            TunnelOptions::serial(7, "/dev/ttyUSB0", 115_200).with_ssl(true)
        );
    }

    #[test]
    fn test_incomplete_target_is_rejected() {
        let options = TunnelOptions::tcp(42, "", 22);
        assert!(matches!(
            options.tunnel_target(),
            Err(CodecError::InvalidParameters)
        ));

        let options: TunnelOptions =
            serde_json::from_str(r#"{"id": 42, "proto": "serial", "ser_name": "com3"}"#).unwrap();
        assert!(matches!(
            options.tunnel_target(),
            Err(CodecError::InvalidParameters)
        ));
    }

    #[test]
    fn test_reply_shapes() {
        let ok: OpenTunnelReply = Ok::<_, ()>(TunnelInfo { port: 3456, id: 3001 }).into();
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"status":"ok","port":3456,"id":3001}"#
        );

        let err: OpenTunnelReply = Err::<TunnelInfo, _>("timeout").into();
        assert_eq!(serde_json::to_string(&err).unwrap(), r#"{"status":"error"}"#);
    }
}
