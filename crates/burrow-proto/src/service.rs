//! Service descriptors declared by a publisher at handshake time

use serde::{Deserialize, Serialize};

/// Socket type of a published service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Tcp,
    Udp4,
    Udp6,
}

impl SocketKind {
    pub fn is_udp(&self) -> bool {
        matches!(self, SocketKind::Udp4 | SocketKind::Udp6)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketKind::Tcp => "tcp",
            SocketKind::Udp4 => "udp4",
            SocketKind::Udp6 => "udp6",
        }
    }
}

/// One hidden-port to public-port mapping declared by a publisher
///
/// The whole set is replaced atomically on every Handshake/Services message;
/// individual descriptors are immutable for the lifetime of the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub socket_type: SocketKind,
    pub hidden_port: u16,
    pub public_port: u16,
    /// Host the hidden service lives on, from the publisher's point of view.
    /// Defaults to "localhost" when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_host: Option<String>,
}

impl ServiceInfo {
    pub fn tcp(hidden_port: u16, public_port: u16) -> Self {
        Self {
            name: None,
            socket_type: SocketKind::Tcp,
            hidden_port,
            public_port,
            hidden_host: None,
        }
    }

    pub fn hidden_host(&self) -> &str {
        self.hidden_host.as_deref().unwrap_or("localhost")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_kind_wire_names() {
        assert_eq!(serde_json::to_string(&SocketKind::Tcp).unwrap(), "\"tcp\"");
        assert_eq!(
            serde_json::to_string(&SocketKind::Udp4).unwrap(),
            "\"udp4\""
        );
        assert_eq!(
            serde_json::to_string(&SocketKind::Udp6).unwrap(),
            "\"udp6\""
        );
    }

    #[test]
    fn test_service_info_camel_case() {
        let service = ServiceInfo::tcp(8080, 9000);
        let json = serde_json::to_string(&service).unwrap();
        assert!(json.contains("\"hiddenPort\":8080"));
        assert!(json.contains("\"publicPort\":9000"));
        assert!(!json.contains("name"));
        assert!(!json.contains("hiddenHost"));
    }

    #[test]
    fn test_service_info_default_hidden_host() {
        let service: ServiceInfo = serde_json::from_str(
            r#"{"socketType":"tcp","hiddenPort":22,"publicPort":2222}"#,
        )
        .unwrap();
        assert_eq!(service.hidden_host(), "localhost");

        let service: ServiceInfo = serde_json::from_str(
            r#"{"socketType":"tcp","hiddenPort":22,"publicPort":2222,"hiddenHost":"10.0.0.2"}"#,
        )
        .unwrap();
        assert_eq!(service.hidden_host(), "10.0.0.2");
    }
}
