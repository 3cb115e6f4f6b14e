use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use q2q_server_service::{
    Address, AppResolver, Error, FnHandler, ListenerEntry, MemoryCertStore, OverlayStream, Service,
    ServiceOptions, StreamHandler, store::CertStore, wire,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn echo_handler() -> Arc<dyn StreamHandler> {
    Arc::new(FnHandler(|mut stream: OverlayStream| async move {
        let mut buf = vec![0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            stream.write_all(&buf[..n]).await?;
        }
    }))
}

/// Serves `echo` for every user of the domain.
struct EchoResolver;

impl AppResolver for EchoResolver {
    fn resolve(
        &self,
        _from: &Address,
        _to: &Address,
        protocol: &str,
    ) -> Vec<(Arc<dyn StreamHandler>, String)> {
        if protocol == "echo" {
            vec![(echo_handler(), "echo service".to_string())]
        } else {
            Vec::new()
        }
    }
}

/// A domain server for `localhost` on an ephemeral port.
async fn start_domain_server(
    resolver: Option<Arc<dyn AppResolver>>,
    splice: bool,
) -> Result<(Service, Arc<MemoryCertStore>, u16)> {
    let store = Arc::new(MemoryCertStore::new());
    let serial = store.gen_serial("localhost");
    store.add_private(
        "localhost",
        q2q_server_service::PrivateIdentity::self_signed("localhost", serial)?,
    )?;

    let server = Service::new(ServiceOptions {
        store: store.clone(),
        resolver,
        bind: LOCALHOST,
        overlay_port: Some(0),
        splice_port: splice.then_some(0),
        ..ServiceOptions::default()
    });
    server.start().await?;

    let port = server.overlay_addr().expect("overlay bound").port();
    Ok((server, store, port))
}

/// A client-only service that assumes overlay servers live on `port`.
fn client_service(port: u16) -> (Service, Arc<MemoryCertStore>) {
    let store = Arc::new(MemoryCertStore::new());
    let client = Service::new(ServiceOptions {
        store: store.clone(),
        bind: LOCALHOST,
        overlay_port: None,
        connect_port: port,
        ..ServiceOptions::default()
    });

    (client, store)
}

async fn roundtrip(stream: &mut OverlayStream, payload: &[u8]) -> Result<Vec<u8>> {
    stream.write_all(payload).await?;

    let mut got = vec![0u8; payload.len()];
    stream.read_exact(&mut got).await?;
    Ok(got)
}

#[tokio::test]
async fn anonymous_virtual_channel_round_trip() -> Result<()> {
    let (server, _store, port) = start_domain_server(Some(Arc::new(EchoResolver)), false).await?;
    let (client, _) = client_service(port);

    let mut stream = client
        .connect_q2q(
            &Address::anonymous(),
            &Address::user("alice", "localhost"),
            "echo",
        )
        .await?;

    assert_eq!(stream.info.protocol, "echo");
    assert_eq!(roundtrip(&mut stream, b"PING").await?, b"PING");

    // Bytes keep their order across consecutive writes.
    stream.write_all(b"one ").await?;
    stream.write_all(b"two ").await?;
    stream.write_all(b"three").await?;
    let mut got = vec![0u8; 13];
    stream.read_exact(&mut got).await?;
    assert_eq!(&got, b"one two three");

    // The virtual exchange consumed the reservation.
    assert_eq!(server.pending_reservations(), 0);

    drop(stream);
    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn direct_tcp_splice_carries_the_protocol() -> Result<()> {
    let (server, _store, port) = start_domain_server(Some(Arc::new(EchoResolver)), true).await?;
    let (client, _) = client_service(port);

    // Keep only direct TCP so a fallback cannot mask a splice failure.
    let chooser = |mut listeners: Vec<ListenerEntry>| {
        for listener in &mut listeners {
            listener
                .methods
                .retain(|m| matches!(m, q2q_server_service::ConnectMethod::Tcp(_)));
        }
        listeners
    };

    let mut stream = client
        .connect_q2q_with(
            &Address::anonymous(),
            &Address::user("alice", "localhost"),
            "echo",
            Some(&chooser),
        )
        .await?;

    assert_eq!(roundtrip(&mut stream, b"HI").await?, b"HI");
    assert_eq!(server.pending_reservations(), 0);

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn certificate_signing_learning_and_cache_reuse() -> Result<()> {
    let (server, server_store, port) =
        start_domain_server(Some(Arc::new(EchoResolver)), false).await?;
    server_store.add_user("localhost", "alice", "sekrit");

    let (client, client_store) = client_service(port);
    let alice = Address::user("alice", "localhost");

    // A wrong secret is rejected before anything is signed.
    let refused = client
        .request_certificate_for_address(&alice, b"wrong")
        .await;
    assert!(matches!(refused, Err(Error::NoSuchUser)));

    client
        .request_certificate_for_address(&alice, b"sekrit")
        .await?;

    let identity = client_store
        .get_private("alice@localhost")
        .expect("signed identity stored");
    assert_eq!(identity.certificate().subject_common_name(), "alice@localhost");
    assert_eq!(identity.certificate().issuer_common_name(), "localhost");

    let authority = server_store
        .get_private("localhost")
        .expect("server authority");
    identity
        .certificate()
        .verify_signed_by(authority.certificate())?;

    // The first authorized connect learns the domain root over IDENTIFY.
    assert!(client_store.get_self_signed("localhost").is_none());
    let mut stream = client
        .connect_q2q(&alice, &Address::user("bob", "localhost"), "echo")
        .await?;
    assert_eq!(roundtrip(&mut stream, b"AUTHD").await?, b"AUTHD");
    assert_eq!(
        client_store.get_self_signed("localhost").as_ref(),
        Some(authority.certificate())
    );

    // Two lookups of the same secured route share one connection.
    let first = client
        .secure_connection_to(&alice, &Address::domain("localhost"), true)
        .await?;
    let second = client
        .secure_connection_to(&alice, &Address::domain("localhost"), true)
        .await?;
    assert!(Arc::ptr_eq(&first, &second));

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn relayed_listener_is_reachable_with_substituted_certificate() -> Result<()> {
    // D is the domain server; X registers a listener with it; Y asks D and
    // must end up spliced straight into X.
    let (domain_server, server_store, port) = start_domain_server(None, false).await?;
    server_store.add_user("localhost", "alice", "sekrit");

    let x_store = Arc::new(MemoryCertStore::new());
    let x = Service::new(ServiceOptions {
        store: x_store.clone(),
        bind: LOCALHOST,
        overlay_port: None,
        splice_port: Some(0),
        connect_port: port,
        ..ServiceOptions::default()
    });
    x.start().await?;

    let alice = Address::user("alice", "localhost");
    x.request_certificate_for_address(&alice, b"sekrit").await?;
    x.listen_q2q(&alice, vec![("echo".to_string(), echo_handler())], "at X")
        .await?;

    let (y, _) = client_service(port);
    let seen: Arc<Mutex<Vec<ListenerEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_chooser = seen.clone();
    let chooser = move |listeners: Vec<ListenerEntry>| {
        *seen_in_chooser.lock() = listeners.clone();
        listeners
    };

    let mut stream = y
        .connect_q2q_with(&Address::anonymous(), &alice, "echo", Some(&chooser))
        .await?;
    assert_eq!(roundtrip(&mut stream, b"VIA RELAY").await?, b"VIA RELAY");

    let entries = seen.lock().clone();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].description, "at X");

    // Only relayable methods survive, and the certificate is the one the
    // domain server verified for X, not whatever X advertised.
    assert!(
        entries[0]
            .methods
            .iter()
            .all(q2q_server_service::ConnectMethod::relayable)
    );
    let certificate = entries[0].certificate.as_ref().expect("substituted cert");
    assert_eq!(certificate.subject_common_name(), "alice@localhost");

    y.stop().await;
    x.stop().await;
    domain_server.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unclaimed_reservations_expire() -> Result<()> {
    let (server, _store, port) = start_domain_server(Some(Arc::new(EchoResolver)), false).await?;
    let (client, _) = client_service(port);

    let alice = Address::user("alice", "localhost");

    // Ask for candidates but attempt none of them.
    let reserved: Arc<Mutex<Vec<ListenerEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let reserved_in_chooser = reserved.clone();
    let chooser = move |listeners: Vec<ListenerEntry>| {
        *reserved_in_chooser.lock() = listeners;
        Vec::new()
    };
    let refused = client
        .connect_q2q_with(&Address::anonymous(), &alice, "echo", Some(&chooser))
        .await;
    assert!(matches!(refused, Err(Error::NoAttemptsMade)));

    let id = reserved.lock().first().expect("a listener was offered").id.clone();

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert_eq!(server.pending_reservations(), 0);

    // A late claim of the expired id fails.
    let conn = client
        .secure_connection_to(&Address::anonymous(), &Address::domain("localhost"), false)
        .await?;
    let late = conn.call(wire::virtual_channel(&id)).await;
    assert!(matches!(late, Err(Error::NotFound(_))));

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Speaks the frame protocol over an established channel, answering every
/// command by echoing its Text header back.
struct MessageResolver;

impl AppResolver for MessageResolver {
    fn resolve(
        &self,
        _from: &Address,
        _to: &Address,
        protocol: &str,
    ) -> Vec<(Arc<dyn StreamHandler>, String)> {
        if protocol != q2q_server_service::MESSAGE_PROTOCOL {
            return Vec::new();
        }

        let handler = Arc::new(FnHandler(|mut stream: OverlayStream| async move {
            let mut reader = q2q_server_service::codec::FrameReader::default();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }

                reader.extend_from_slice(&buf[..n]);
                while let Some(frame) = reader
                    .next_frame()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
                {
                    let Some(tag) = frame.tag() else { continue };
                    let text = frame.headers.get("Text").unwrap_or("").to_string();
                    let mut out = bytes::BytesMut::new();
                    q2q_server_service::Frame::answer(tag)
                        .with_header("Echoed", text)
                        .encode(&mut out)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                    stream.write_all(&out).await?;
                }
            }
        }));

        vec![(handler as Arc<dyn StreamHandler>, "message endpoint".to_string())]
    }
}

#[tokio::test]
async fn messages_ride_a_shared_cached_channel() -> Result<()> {
    let (server, server_store, port) =
        start_domain_server(Some(Arc::new(MessageResolver)), false).await?;
    server_store.add_user("localhost", "alice", "sekrit");

    let (client, _) = client_service(port);
    let alice = Address::user("alice", "localhost");
    let bob = Address::user("bob", "localhost");
    client
        .request_certificate_for_address(&alice, b"sekrit")
        .await?;

    let first = client
        .send_message(
            &alice,
            &bob,
            "chat",
            q2q_server_service::Frame::request("post").with_header("Text", "hello"),
        )
        .await?;
    assert_eq!(first.headers.get("Echoed"), Some("hello"));

    let second = client
        .send_message(
            &alice,
            &bob,
            "chat",
            q2q_server_service::Frame::request("post").with_header("Text", "again"),
        )
        .await?;
    assert_eq!(second.headers.get("Echoed"), Some("again"));

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_names_and_protocols_are_not_found() -> Result<()> {
    let (server, _store, port) = start_domain_server(Some(Arc::new(EchoResolver)), false).await?;
    let (client, _) = client_service(port);

    let refused = client
        .connect_q2q(
            &Address::anonymous(),
            &Address::user("alice", "localhost"),
            "no-such-protocol",
        )
        .await;
    assert!(matches!(refused, Err(Error::NotFound(_))));

    client.stop().await;
    server.stop().await;
    Ok(())
}
