//! Connection methods.
//!
//! A method is one concrete way a peer may reach a listener, advertised in
//! inbound replies and attempted in order by the connecting side. The set is
//! closed; strings we do not recognize survive as [`ConnectMethod::Unknown`]
//! so that chaining over a method list never breaks on a newer peer.

use std::fmt;

/// `host:port`, where the host is an IP literal or a resolvable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = value.rsplit_once(':')?;
        Some(Self {
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMethod {
    /// Direct TCP to the given endpoint, then the splice line.
    Tcp(HostPort),
    /// The same handshake over the reliable pseudo-TCP transport.
    Ptcp(HostPort),
    /// Pseudo-TCP, but the recipient is asked to send the first packet so
    /// NATs that refuse unsolicited inbound traffic will bind the port.
    Rptcp(HostPort),
    /// A virtual channel over the already-open control connection.
    Virtual,
    /// A method string this node does not understand, kept verbatim.
    Unknown(String),
}

impl ConnectMethod {
    /// Whether this method still makes sense when advertised through an
    /// intermediary. A virtual channel is bound to one control connection
    /// and is meaningless anywhere else.
    pub fn relayable(&self) -> bool {
        !matches!(self, Self::Virtual)
    }

    /// Parse a single method string. Never fails: unrecognized input is
    /// preserved for diagnostics and fails at attempt time instead.
    pub fn parse(value: &str) -> Self {
        let (name, rest) = match value.split_once('@') {
            Some((name, rest)) => (name, rest),
            None => (value, ""),
        };

        let endpoint = HostPort::parse(rest);
        match (name, endpoint) {
            ("virtual", _) => Self::Virtual,
            ("tcp", Some(hp)) => Self::Tcp(hp),
            ("ptcp", Some(hp)) => Self::Ptcp(hp),
            ("rptcp", Some(hp)) => Self::Rptcp(hp),
            _ => Self::Unknown(value.to_string()),
        }
    }

    /// Parse a comma-separated method list.
    pub fn parse_list(value: &str) -> Vec<Self> {
        if value.is_empty() {
            return Vec::new();
        }

        value
            .split(',')
            .map(|item| Self::parse(item.trim()))
            .collect()
    }

    pub fn format_list(methods: &[Self]) -> String {
        methods
            .iter()
            .map(Self::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(hp) => write!(f, "tcp@{}", hp),
            Self::Ptcp(hp) => write!(f, "ptcp@{}", hp),
            Self::Rptcp(hp) => write!(f, "rptcp@{}", hp),
            Self::Virtual => write!(f, "virtual"),
            Self::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_forms_round_trip() {
        let list = "tcp@18.38.12.4:3827, ptcp@10.0.0.2:9, rptcp@10.0.0.2:10, virtual";
        let methods = ConnectMethod::parse_list(list);

        assert_eq!(methods.len(), 4);
        assert_eq!(methods[0], ConnectMethod::Tcp(HostPort::new("18.38.12.4", 3827)));
        assert_eq!(methods[3], ConnectMethod::Virtual);
        assert_eq!(ConnectMethod::format_list(&methods), list);
    }

    #[test]
    fn unknown_methods_are_preserved_verbatim() {
        let methods = ConnectMethod::parse_list("quantum@1.2.3.4:5, virtual");
        assert_eq!(
            methods[0],
            ConnectMethod::Unknown("quantum@1.2.3.4:5".to_string())
        );
        assert!(methods[0].relayable());
        assert_eq!(methods[0].to_string(), "quantum@1.2.3.4:5");
    }

    #[test]
    fn only_virtual_is_unrelayable() {
        assert!(ConnectMethod::Tcp(HostPort::new("h", 1)).relayable());
        assert!(ConnectMethod::Rptcp(HostPort::new("h", 1)).relayable());
        assert!(!ConnectMethod::Virtual.relayable());
    }

    #[test]
    fn ipv6_hosts_split_on_the_last_colon() {
        let hp = HostPort::parse("::1:8788").unwrap();
        assert_eq!(hp.host, "::1");
        assert_eq!(hp.port, 8788);
    }
}
