//! Typed views over the command frames.
//!
//! The codec knows nothing about the overlay; every command's argument
//! names, encodings and reply shapes are pinned down here so the connection
//! layer can deal in structs instead of header strings.

use crate::{
    address::Address,
    error::{Error, Result},
    identity::Certificate,
    methods::{ConnectMethod, HostPort},
};

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use codec::{Frame, Headers, decode_blob, encode_blob};

pub const CMD_SECURE: &str = "secure";
pub const CMD_IDENTIFY: &str = "identify";
pub const CMD_LISTEN: &str = "listen";
pub const CMD_INBOUND: &str = "inbound";
pub const CMD_OUTBOUND: &str = "outbound";
pub const CMD_VIRTUAL: &str = "virtual";
pub const CMD_BIND_UDP: &str = "bind-udp";
pub const CMD_SOURCE_IP: &str = "source-ip";
pub const CMD_SIGN: &str = "sign";
pub const CMD_WRITE: &str = "write";
pub const CMD_CLOSE: &str = "close";

fn require<'a>(frame: &'a Frame, key: &str) -> Result<&'a str> {
    frame
        .headers
        .get(key)
        .ok_or_else(|| Error::Codec(format!("missing {} header", key)))
}

fn address(value: &str) -> Address {
    Address::parse_str(value)
}

fn host_port(value: &str) -> Result<HostPort> {
    HostPort::parse(value).ok_or_else(|| Error::Codec(format!("bad host:port: {}", value)))
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

// SECURE

pub struct SecureArgs {
    pub from: Address,
    pub to: Address,
    pub authorize: bool,
}

pub fn secure(from: &Address, to: &Address, authorize: bool) -> Frame {
    let mut frame = Frame::request(CMD_SECURE)
        .with_header("To", to.to_string())
        .with_header("Authorize", if authorize { "True" } else { "False" });
    if !from.is_anonymous() {
        frame = frame.with_header("From", from.to_string());
    }

    frame
}

pub fn parse_secure(frame: &Frame) -> Result<SecureArgs> {
    Ok(SecureArgs {
        from: frame
            .headers
            .get("From")
            .map(address)
            .unwrap_or_else(Address::anonymous),
        to: address(require(frame, "To")?),
        authorize: require(frame, "Authorize")? == "True",
    })
}

// IDENTIFY

pub fn identify(subject: &Address) -> Frame {
    Frame::request(CMD_IDENTIFY).with_header("Subject", subject.to_string())
}

pub fn parse_identify(frame: &Frame) -> Result<Address> {
    Ok(address(require(frame, "Subject")?))
}

pub fn certificate_answer(tag: u64, certificate: &Certificate) -> Frame {
    Frame::answer(tag).with_header("Certificate", encode_blob(certificate.der()))
}

pub fn parse_certificate(frame: &Frame) -> Result<Certificate> {
    Certificate::from_der(decode_blob(require(frame, "Certificate")?)?)
}

// LISTEN

pub struct ListenArgs {
    pub from: Address,
    pub protocols: Vec<String>,
    pub description: String,
}

pub fn listen(from: &Address, protocols: &[String], description: &str) -> Frame {
    Frame::request(CMD_LISTEN)
        .with_header("From", from.to_string())
        .with_header("Protocols", protocols.join(", "))
        .with_header("Description", description)
}

pub fn parse_listen(frame: &Frame) -> Result<ListenArgs> {
    let protocols = require(frame, "Protocols")?;
    Ok(ListenArgs {
        from: address(require(frame, "From")?),
        protocols: if protocols.is_empty() {
            Vec::new()
        } else {
            protocols.split(',').map(|p| p.trim().to_string()).collect()
        },
        description: frame.headers.get("Description").unwrap_or("").to_string(),
    })
}

// INBOUND

pub struct InboundArgs {
    pub from: Address,
    pub to: Address,
    pub protocol: String,
    pub udp_source: Option<HostPort>,
}

/// One entry of an inbound reply: a reserved channel id plus the ways the
/// listener can be reached before the reservation expires.
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub id: String,
    pub certificate: Option<Certificate>,
    pub methods: Vec<ConnectMethod>,
    pub expires: u64,
    pub description: String,
}

pub fn inbound(
    from: &Address,
    to: &Address,
    protocol: &str,
    udp_source: Option<&HostPort>,
) -> Frame {
    let mut frame = Frame::request(CMD_INBOUND)
        .with_header("From", from.to_string())
        .with_header("To", to.to_string())
        .with_header("Protocol", protocol);
    if let Some(source) = udp_source {
        frame = frame.with_header("Udp-Source", source.to_string());
    }

    frame
}

pub fn parse_inbound(frame: &Frame) -> Result<InboundArgs> {
    Ok(InboundArgs {
        from: address(require(frame, "From")?),
        to: address(require(frame, "To")?),
        protocol: require(frame, "Protocol")?.to_string(),
        udp_source: match frame.headers.get("Udp-Source") {
            Some(value) => Some(host_port(value)?),
            None => None,
        },
    })
}

pub fn listeners_answer(tag: u64, listeners: &[ListenerEntry]) -> Frame {
    let mut boxes = Vec::with_capacity(listeners.len());
    for entry in listeners {
        let mut nested = Headers::new();
        nested.set("Id", entry.id.clone());
        if let Some(certificate) = &entry.certificate {
            nested.set("Certificate", encode_blob(certificate.der()));
        }
        nested.set("Methods", ConnectMethod::format_list(&entry.methods));
        nested.set("Expires", entry.expires.to_string());
        nested.set("Description", entry.description.clone());
        boxes.push(nested);
    }

    let mut frame = Frame::answer(tag);
    frame.lists.push(("Listeners".to_string(), boxes));
    frame
}

pub fn parse_listeners(frame: &Frame) -> Result<Vec<ListenerEntry>> {
    let boxes = frame
        .list("Listeners")
        .ok_or_else(|| Error::Codec("missing Listeners list".to_string()))?;

    let mut listeners = Vec::with_capacity(boxes.len());
    for nested in boxes {
        listeners.push(ListenerEntry {
            id: nested
                .get("Id")
                .ok_or_else(|| Error::Codec("listener without an Id".to_string()))?
                .to_string(),
            certificate: match nested.get("Certificate") {
                Some(value) => Some(Certificate::from_der(decode_blob(value)?)?),
                None => None,
            },
            methods: ConnectMethod::parse_list(nested.get("Methods").unwrap_or("")),
            expires: nested
                .get("Expires")
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            description: nested.get("Description").unwrap_or("").to_string(),
        });
    }

    Ok(listeners)
}

// OUTBOUND

pub struct OutboundArgs {
    pub from: Address,
    pub to: Address,
    pub protocol: String,
    pub id: String,
    pub methods: Vec<ConnectMethod>,
}

pub fn outbound(
    from: &Address,
    to: &Address,
    protocol: &str,
    id: &str,
    methods: &[ConnectMethod],
) -> Frame {
    Frame::request(CMD_OUTBOUND)
        .with_header("From", from.to_string())
        .with_header("To", to.to_string())
        .with_header("Protocol", protocol)
        .with_header("Id", id)
        .with_header("Methods", ConnectMethod::format_list(methods))
}

pub fn parse_outbound(frame: &Frame) -> Result<OutboundArgs> {
    Ok(OutboundArgs {
        from: address(require(frame, "From")?),
        to: address(require(frame, "To")?),
        protocol: require(frame, "Protocol")?.to_string(),
        id: require(frame, "Id")?.to_string(),
        methods: ConnectMethod::parse_list(require(frame, "Methods")?),
    })
}

// VIRTUAL / WRITE / CLOSE

pub fn virtual_channel(id: &str) -> Frame {
    Frame::request(CMD_VIRTUAL).with_header("Id", id)
}

pub fn write(id: &str, body: Bytes) -> Frame {
    Frame::request(CMD_WRITE).with_header("Id", id).with_body(body)
}

pub fn close(id: &str) -> Frame {
    Frame::request(CMD_CLOSE).with_header("Id", id)
}

pub fn parse_channel_id(frame: &Frame) -> Result<String> {
    Ok(require(frame, "Id")?.to_string())
}

// BIND-UDP

pub struct BindUdpArgs {
    pub q2q_source: Address,
    pub q2q_destination: Address,
    pub protocol: String,
    pub udp_source: HostPort,
    pub udp_destination: HostPort,
}

pub fn bind_udp(args: &BindUdpArgs) -> Frame {
    Frame::request(CMD_BIND_UDP)
        .with_header("Q2Q-Source", args.q2q_source.to_string())
        .with_header("Q2Q-Destination", args.q2q_destination.to_string())
        .with_header("Protocol", args.protocol.clone())
        .with_header("Udp-Source", args.udp_source.to_string())
        .with_header("Udp-Destination", args.udp_destination.to_string())
}

pub fn parse_bind_udp(frame: &Frame) -> Result<BindUdpArgs> {
    Ok(BindUdpArgs {
        q2q_source: address(require(frame, "Q2Q-Source")?),
        q2q_destination: address(require(frame, "Q2Q-Destination")?),
        protocol: require(frame, "Protocol")?.to_string(),
        udp_source: host_port(require(frame, "Udp-Source")?)?,
        udp_destination: host_port(require(frame, "Udp-Destination")?)?,
    })
}

// SOURCE-IP

pub fn source_ip() -> Frame {
    Frame::request(CMD_SOURCE_IP)
}

pub fn ip_answer(tag: u64, ip: &str) -> Frame {
    Frame::answer(tag).with_header("Ip", ip)
}

pub fn parse_ip(frame: &Frame) -> Result<String> {
    Ok(require(frame, "Ip")?.to_string())
}

// SIGN

pub struct SignArgs {
    pub certificate_request: Vec<u8>,
    pub password: Vec<u8>,
}

pub fn sign(certificate_request: &[u8], password: &[u8]) -> Frame {
    Frame::request(CMD_SIGN)
        .with_header("Certificate-Request", encode_blob(certificate_request))
        .with_header("Password", encode_blob(password))
}

pub fn parse_sign(frame: &Frame) -> Result<SignArgs> {
    Ok(SignArgs {
        certificate_request: decode_blob(require(frame, "Certificate-Request")?)?,
        password: decode_blob(require(frame, "Password")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_omits_an_anonymous_from() {
        let frame = secure(&Address::anonymous(), &Address::domain("example.com"), false);
        assert_eq!(frame.headers.get("From"), None);

        let args = parse_secure(&frame).unwrap();
        assert!(args.from.is_anonymous());
        assert!(!args.authorize);
    }

    #[test]
    fn listener_entries_survive_the_reply_encoding() {
        let entry = ListenerEntry {
            id: "alice@a->bob@b:7".to_string(),
            certificate: None,
            methods: vec![
                ConnectMethod::Tcp(HostPort::new("1.2.3.4", 5678)),
                ConnectMethod::Virtual,
            ],
            expires: 1234567,
            description: "at lab".to_string(),
        };

        let mut wire = bytes::BytesMut::new();
        listeners_answer(3, std::slice::from_ref(&entry))
            .encode(&mut wire)
            .unwrap();

        let mut reader = codec::FrameReader::default();
        reader.extend_from_slice(&wire);
        let parsed = parse_listeners(&reader.next_frame().unwrap().unwrap()).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, entry.id);
        assert_eq!(parsed[0].methods, entry.methods);
        assert_eq!(parsed[0].expires, 1234567);
        assert_eq!(parsed[0].description, "at lab");
    }
}
