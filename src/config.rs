use clap::Parser;
use serde::Deserialize;
use std::{collections::HashMap, fs::read_to_string, net::IpAddr, path::PathBuf};

#[derive(Deserialize, Debug)]
pub struct Node {
    /// overlay domains served by this node
    ///
    /// every domain listed here gets a self-signed authority certificate in
    /// the certificate store at startup, and this node will answer SECURE,
    /// IDENTIFY and SIGN for it.
    #[serde(default)]
    pub domains: Vec<String>,

    /// bind address
    ///
    /// the address every listener binds on. the overlay control listener
    /// and the splice listener share it.
    #[serde(default = "Node::bind")]
    pub bind: IpAddr,

    /// overlay control port
    ///
    /// the request/response command protocol between overlay nodes is
    /// served here. peers assume 8788 unless told otherwise.
    #[serde(default = "Node::port")]
    pub port: u16,

    /// inbound splice port
    ///
    /// direct tcp connection methods advertised in inbound replies point
    /// at this port. disabled when absent, which limits establishment to
    /// virtual channels.
    pub splice_port: Option<u16>,

    /// public address
    ///
    /// the externally reachable address advertised to peers. when absent
    /// it is discovered by asking the first peer we connect to.
    pub public_ip: Option<IpAddr>,

    /// certificate directory
    ///
    /// learned peer certificates land under public/, our private
    /// identities under private/.
    #[serde(default = "Node::certs")]
    pub certs: PathBuf,
}

impl Node {
    fn bind() -> IpAddr {
        "0.0.0.0".parse().unwrap()
    }

    fn port() -> u16 {
        service::OVERLAY_PORT
    }

    fn certs() -> PathBuf {
        "./certs".into()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            bind: Self::bind(),
            port: Self::port(),
            splice_port: None,
            public_ip: None,
            certs: Self::certs(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,

    /// static user secrets
    ///
    /// maps `user@domain` to the shared secret accepted when that user
    /// asks this node to sign a certificate request.
    #[serde(default)]
    pub auth: HashMap<String, String>,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> anyhow::Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn empty_input_yields_the_defaults() {
        let config: Config = serde_json5::from_str("{}").unwrap();
        assert_eq!(config.node.port, service::OVERLAY_PORT);
        assert!(config.node.domains.is_empty());
        assert!(config.auth.is_empty());
    }

    #[test]
    fn sections_are_independent() {
        let config: Config = serde_json5::from_str(
            r#"{
                node: { domains: ["example.com"], port: 9000 },
                auth: { "bob@example.com": "sekrit" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.node.domains, ["example.com"]);
        assert_eq!(config.node.port, 9000);
        assert_eq!(
            config.auth.get("bob@example.com").map(String::as_str),
            Some("sekrit")
        );
    }
}
