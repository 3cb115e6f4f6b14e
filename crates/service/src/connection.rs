//! One physical overlay connection.
//!
//! A connection multiplexes two kinds of traffic over a single reliable
//! byte stream: named commands with correlated responses, and opaque
//! WRITE/CLOSE frames carrying virtual-channel bytes. A reader task owns
//! the transport; everything the rest of the process wants to send goes
//! through the outgoing queue, so frames hit the wire in a single order
//! and a mid-stream TLS upgrade can swap the transport out safely.

use crate::{
    ServiceInner,
    address::Address,
    channel::{self, ChannelEvent},
    dial::try_each,
    error::{Error, Result},
    identity::{Certificate, PrivateIdentity},
    methods::{ConnectMethod, HostPort},
    stream::{BoxStream, ChannelInfo, OverlayStream, Rewind},
    tls, wire,
};

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use codec::{Frame, FrameKind, FrameReader};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, lookup_host},
    sync::{mpsc, oneshot, watch},
};
use tokio_rustls::{TlsAcceptor, TlsConnector, rustls::pki_types::ServerName};

/// Depth of the outgoing frame queue shared by callers and channels.
const OUT_QUEUE: usize = 64;

/// Selects which listeners from an inbound reply to attempt. The default
/// takes the first.
pub type Chooser<'a> =
    Option<&'a (dyn Fn(Vec<wire::ListenerEntry>) -> Vec<wire::ListenerEntry> + Send + Sync)>;

pub struct Connection {
    service: Weak<ServiceInner>,
    out_tx: mpsc::Sender<Outgoing>,
    state: Mutex<ConnState>,
    closed_rx: watch::Receiver<bool>,
    /// Transport peer of the underlying stream, when it has one.
    pub(crate) physical_peer: Option<SocketAddr>,
    pub(crate) physical_local: Option<SocketAddr>,
    initiator: bool,
}

#[derive(Default)]
struct ConnState {
    /// True only after a mutually verified SECURE handshake.
    authorized: bool,
    /// Our address as reported by the peer via SOURCE-IP.
    public_ip: Option<IpAddr>,
    /// The certificate we presented when TLS started.
    host_certificate: Option<Certificate>,
    /// The TLS-verified certificate the peer presented.
    peer_certificate: Option<Certificate>,
    /// Live virtual channels by id.
    channels: HashMap<String, mpsc::Sender<ChannelEvent>>,
    /// Listener-registry keys this connection contributed.
    listening: Vec<(Address, String)>,
    /// Fired once when the connection is lost.
    observers: Vec<Box<dyn FnOnce() + Send>>,
    lost: bool,
}

pub(crate) enum Outgoing {
    Call { frame: Frame, reply: ReplyTo },
    Reply { frame: Frame, fatal: bool },
    Shutdown,
}

pub(crate) enum ReplyTo {
    /// Correlated, but nobody is waiting; failures are logged.
    Ignore,
    One(oneshot::Sender<Result<Frame>>),
    /// A SECURE in flight: the answer triggers the client half of the TLS
    /// upgrade before the caller is released.
    StartTls {
        sender: oneshot::Sender<Result<Frame>>,
        connector: TlsConnector,
        server_name: ServerName<'static>,
        host_certificate: Certificate,
        authorized: bool,
    },
}

impl Connection {
    /// Take ownership of `stream` and run the frame protocol over it.
    ///
    /// `probe` makes an initiating connection immediately ask the peer what
    /// our address looks like from over there.
    pub(crate) fn spawn(
        service: &Arc<ServiceInner>,
        stream: BoxStream,
        physical_peer: Option<SocketAddr>,
        physical_local: Option<SocketAddr>,
        initiator: bool,
        probe: bool,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUT_QUEUE);
        let (closed_tx, closed_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            service: Arc::downgrade(service),
            out_tx,
            state: Mutex::new(ConnState::default()),
            closed_rx,
            physical_peer,
            physical_local,
            initiator,
        });

        if let Some(local) = physical_local {
            service.seed_public_ip(local.ip());
        }

        if initiator && probe {
            // The probe is queued before spawn returns, so it is on the wire
            // ahead of any SECURE a caller issues next; a plaintext command
            // trailing the SECURE answer would poison the TLS handshake.
            let (tx, rx) = oneshot::channel();
            let queued = conn.out_tx.try_send(Outgoing::Call {
                frame: wire::source_ip(),
                reply: ReplyTo::One(tx),
            });

            if queued.is_ok() {
                let probing = conn.clone();
                tokio::spawn(async move {
                    match rx.await.map_err(|_| Error::ConnectionLost).and_then(|r| r) {
                        Ok(answer) => match wire::parse_ip(&answer)
                            .ok()
                            .and_then(|text| text.parse().ok())
                        {
                            Some(ip) => probing.record_public_ip(ip),
                            None => log::warn!("discarding unparseable source-ip answer"),
                        },
                        Err(e) => log::debug!("source-ip probe failed: err={}", e),
                    }
                });
            }
        }

        let actor = Actor {
            conn: conn.clone(),
            link: Link::Plain(stream),
            reader: FrameReader::default(),
            pending: HashMap::new(),
            next_tag: 1,
            out_rx,
            closed_tx,
        };
        tokio::spawn(actor.run());

        conn
    }

    pub(crate) fn service(&self) -> Result<Arc<ServiceInner>> {
        self.service.upgrade().ok_or(Error::ConnectionLost)
    }

    /// Send a command and await its correlated response.
    pub async fn call(&self, frame: Frame) -> Result<Frame> {
        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(Outgoing::Call {
                frame,
                reply: ReplyTo::One(tx),
            })
            .await
            .map_err(|_| Error::ConnectionLost)?;

        rx.await.map_err(|_| Error::ConnectionLost)?
    }

    /// Send a command whose acknowledgement nobody waits for.
    pub(crate) async fn send_uncorrelated(&self, frame: Frame) -> Result<()> {
        self.out_tx
            .send(Outgoing::Call {
                frame,
                reply: ReplyTo::Ignore,
            })
            .await
            .map_err(|_| Error::ConnectionLost)
    }

    /// Secure this connection as a channel between `from` (locally) and
    /// `to_domain` (remotely).
    ///
    /// With `authorize` the peer must present exactly `foreign_authority`,
    /// which the caller will have looked up or learned beforehand; without
    /// it the TLS layer encrypts but certifies nothing.
    pub async fn secure(
        &self,
        from: &Address,
        to_domain: &Address,
        identity: &PrivateIdentity,
        foreign_authority: Option<Certificate>,
        authorize: bool,
    ) -> Result<()> {
        if self.state.lock().host_certificate.is_some() {
            return Err(Error::Verify(
                "re-securing an already secured connection".to_string(),
            ));
        }

        let authorized = authorize && foreign_authority.is_some();
        let pinned = if authorized { foreign_authority } else { None };
        let config = tls::client_config(identity, pinned)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = tls::server_name(&to_domain.domain)?;

        let (tx, rx) = oneshot::channel();
        self.out_tx
            .send(Outgoing::Call {
                frame: wire::secure(from, to_domain, authorize),
                reply: ReplyTo::StartTls {
                    sender: tx,
                    connector,
                    server_name,
                    host_certificate: identity.certificate().clone(),
                    authorized,
                },
            })
            .await
            .map_err(|_| Error::ConnectionLost)?;

        rx.await.map_err(|_| Error::ConnectionLost)??;
        Ok(())
    }

    /// Issue an inbound request and try the advertised candidates, first
    /// success winning.
    pub async fn connect(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        protocol: &str,
        chooser: Chooser<'_>,
    ) -> Result<OverlayStream> {
        let service = self.service()?;

        let udp_source = match (&service.dispatcher, self.physical_peer) {
            (Some(dispatcher), Some(peer)) => {
                // Offset the port so the seed never lands on the peer's
                // live control port.
                let target = SocketAddr::new(peer.ip(), peer.port().wrapping_add(17));
                match dispatcher.seed_nat(target).await {
                    Ok(port) => Some(HostPort::new(self.determine_public_ip().to_string(), port)),
                    Err(e) => {
                        log::warn!("nat seed failed: target={}, err={}", target, e);
                        None
                    }
                }
            }
            _ => {
                log::debug!("dispatcher unavailable when connecting");
                None
            }
        };

        let answer = self
            .call(wire::inbound(from, to, protocol, udp_source.as_ref()))
            .await?;

        let mut listeners = wire::parse_listeners(&answer)?;
        match chooser {
            Some(choose) => listeners = choose(listeners),
            None => listeners.truncate(1),
        }

        if listeners.is_empty() {
            return Err(Error::NoAttemptsMade);
        }

        let mut failures = Vec::new();
        for listener in &listeners {
            match attempt_methods(self, &listener.methods, &listener.id, from, to, protocol).await
            {
                Ok(stream) => return Ok(stream),
                Err(Error::AttemptsFailed(mut reasons)) => failures.append(&mut reasons),
                Err(Error::NoAttemptsMade) => {}
                Err(other) => failures.push(other.to_string()),
            }
        }

        if failures.is_empty() {
            Err(Error::NoAttemptsMade)
        } else {
            Err(Error::AttemptsFailed(failures))
        }
    }

    /// Check that the certificates exchanged at TLS time allow this host to
    /// speak for `our` toward a peer speaking for `their`.
    ///
    /// This runs after cryptographic verification and checks only the X.509
    /// names against the application-level claims: the peer's certificate
    /// must be issued by the peer's own domain for the peer's name, or by
    /// our domain (a domain may speak for any of its users), or by our own
    /// address (cross-user signing). Anonymous peers are allowed on
    /// unauthorized connections precisely because they claim nothing.
    pub fn verify_certificate_allowed(&self, our: &Address, their: &Address) -> Result<()> {
        let state = self.state.lock();
        if !state.authorized {
            if their.domain.is_empty() {
                return Ok(());
            }

            return Err(Error::Verify(
                "no official negotiation has taken place".to_string(),
            ));
        }

        let peer_cert = state
            .peer_certificate
            .as_ref()
            .ok_or_else(|| Error::Verify("peer presented no certificate".to_string()))?;
        let our_cert = state
            .host_certificate
            .as_ref()
            .ok_or_else(|| Error::Verify("no local certificate in use".to_string()))?;

        let our_domain = our.domain_address();
        let their_domain = their.domain_address();

        // Sanity check: did we pick the right certificate on our end?
        if !our_domain.claimed_by(our_cert.issuer_common_name()) {
            return Err(Error::Verify(format!(
                "local domain mismatch claim: {} actual: {}",
                our_domain,
                our_cert.issuer_common_name()
            )));
        }

        let peer_issuer = peer_cert.issuer_common_name();
        let peer_subject = peer_cert.subject_common_name();

        let allowed = if their_domain.claimed_by(peer_issuer) {
            // Their domain issued their certificate; it must name them.
            their.claimed_by(peer_subject) || their_domain.claimed_by(peer_subject)
        } else {
            our_domain.claimed_by(peer_issuer) || our.claimed_by(peer_issuer)
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::Verify(format!(
                "us: {} them: {} they claim we are: {} they claim they are: {}",
                our_cert.subject_common_name(),
                peer_subject,
                our,
                their
            )))
        }
    }

    pub fn authorized(&self) -> bool {
        self.state.lock().authorized
    }

    /// Whether this end opened the physical connection.
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn peer_certificate(&self) -> Option<Certificate> {
        self.state.lock().peer_certificate.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    /// Run `observer` once when this connection goes away. A connection
    /// that is already lost runs it immediately.
    pub fn notify_on_lost(&self, observer: impl FnOnce() + Send + 'static) {
        let mut pending: Option<Box<dyn FnOnce() + Send>> = Some(Box::new(observer));
        {
            let mut state = self.state.lock();
            if !state.lost {
                if let Some(observer) = pending.take() {
                    state.observers.push(observer);
                }
            }
        }

        if let Some(observer) = pending {
            observer();
        }
    }

    /// Ask the reader task to wind the connection down.
    pub async fn close(&self) {
        let _ = self.out_tx.send(Outgoing::Shutdown).await;
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// The best guess at the address peers can reach us on: the configured
    /// service-wide address wins, then whatever this connection's peer
    /// reported, then the unconfirmed service address, then our own socket.
    pub(crate) fn determine_public_ip(&self) -> IpAddr {
        let mut reserve = None;
        if let Some(service) = self.service.upgrade() {
            let (ip, really_private) = service.public_ip();
            if let Some(ip) = ip {
                if !really_private {
                    return ip;
                }

                reserve = Some(ip);
            }
        }

        if let Some(ip) = self.state.lock().public_ip {
            return ip;
        }

        reserve.unwrap_or_else(|| self.private_ip())
    }

    pub(crate) fn private_ip(&self) -> IpAddr {
        self.physical_local
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    fn record_public_ip(&self, ip: IpAddr) {
        log::info!("remembering public ip: ip={}", ip);
        self.state.lock().public_ip = Some(ip);
        if let Some(service) = self.service.upgrade() {
            service.confirm_public_ip(ip);
        }
    }

    /// Returns false when the connection is already lost, in which case the
    /// sender was dropped and the channel never comes live.
    pub(crate) fn register_channel(&self, id: &str, events: mpsc::Sender<ChannelEvent>) -> bool {
        let mut state = self.state.lock();
        if state.lost {
            return false;
        }

        state.channels.insert(id.to_string(), events);
        true
    }

    pub(crate) fn unregister_channel(&self, id: &str) {
        self.state.lock().channels.remove(id);
    }

    pub(crate) fn channel_registered(&self, id: &str) -> bool {
        self.state.lock().channels.contains_key(id)
    }

    fn channel_sender(&self, id: &str) -> Option<mpsc::Sender<ChannelEvent>> {
        self.state.lock().channels.get(id).cloned()
    }

    fn remove_channel_sender(&self, id: &str) -> Option<mpsc::Sender<ChannelEvent>> {
        self.state.lock().channels.remove(id)
    }

    /// Loss cleanup: every virtual channel is told, every listener entry
    /// this connection contributed is removed, every observer fires once.
    pub(crate) fn handle_lost(&self) {
        let (channels, listening, observers) = {
            let mut state = self.state.lock();
            if state.lost {
                return;
            }

            state.lost = true;
            (
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.listening),
                std::mem::take(&mut state.observers),
            )
        };

        for (id, events) in channels {
            log::debug!("virtual channel lost with its connection: id={:?}", id);
            let _ = events.try_send(ChannelEvent::Closed);
        }

        if let Some(service) = self.service.upgrade() {
            for key in listening {
                service.remove_listening_client(&key, self as *const Connection);
            }
        }

        for observer in observers {
            observer();
        }
    }
}

/// Try each method in order against one listener entry.
pub(crate) async fn attempt_methods(
    conn: &Arc<Connection>,
    methods: &[ConnectMethod],
    id: &str,
    host: &Address,
    peer: &Address,
    protocol: &str,
) -> Result<OverlayStream> {
    try_each(methods.iter().cloned().map(|method| {
        let conn = conn.clone();
        move || async move { attempt_one(&conn, &method, id, host, peer, protocol).await }
    }))
    .await
}

async fn attempt_one(
    conn: &Arc<Connection>,
    method: &ConnectMethod,
    id: &str,
    host: &Address,
    peer: &Address,
    protocol: &str,
) -> Result<OverlayStream> {
    log::debug!("attempting connection method: method={}", method);

    let info = ChannelInfo {
        host: host.clone(),
        peer: peer.clone(),
        protocol: protocol.to_string(),
    };

    match method {
        ConnectMethod::Tcp(endpoint) => {
            let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
            if let Err(e) = stream.set_nodelay(true) {
                log::warn!("tcp socket set nodelay failed: err={}", e);
            }

            splice_client(Box::new(stream), id, info).await
        }
        ConnectMethod::Ptcp(endpoint) => {
            let dispatcher = conn
                .service()?
                .dispatcher
                .clone()
                .ok_or_else(|| Error::Connection("pseudo-tcp dispatcher unavailable".to_string()))?;
            let remote = resolve_endpoint(endpoint).await?;
            splice_client(dispatcher.connect(remote).await?, id, info).await
        }
        ConnectMethod::Rptcp(endpoint) => {
            let dispatcher = conn
                .service()?
                .dispatcher
                .clone()
                .ok_or_else(|| Error::Connection("pseudo-tcp dispatcher unavailable".to_string()))?;

            let remote = resolve_endpoint(endpoint).await?;
            let local_port = dispatcher.seed_nat(remote).await?;

            // The arguments are given from the perspective of the command's
            // recipient: we ask them to originate traffic from their
            // endpoint toward ours, binding their NAT outbound.
            conn.call(wire::bind_udp(&wire::BindUdpArgs {
                q2q_source: peer.clone(),
                q2q_destination: host.clone(),
                protocol: protocol.to_string(),
                udp_source: endpoint.clone(),
                udp_destination: HostPort::new(
                    conn.determine_public_ip().to_string(),
                    local_port,
                ),
            }))
            .await?;

            splice_client(dispatcher.connect(remote).await?, id, info).await
        }
        ConnectMethod::Virtual => {
            let stream = channel::open(conn.clone(), info, id.to_string());
            match conn.call(wire::virtual_channel(id)).await {
                Ok(_) => Ok(stream),
                Err(e) => {
                    conn.unregister_channel(id);
                    Err(e)
                }
            }
        }
        ConnectMethod::Unknown(raw) => Err(Error::Connection(format!(
            "unknown connection method: {}",
            raw
        ))),
    }
}

/// The direct-connect handshake: exactly one line naming the reservation,
/// then the stream belongs to the sub-protocol.
async fn splice_client(mut stream: BoxStream, id: &str, info: ChannelInfo) -> Result<OverlayStream> {
    stream
        .write_all(format!("Q2Q {}\r\n", id).as_bytes())
        .await?;

    Ok(OverlayStream::new(info, stream))
}

async fn resolve_endpoint(endpoint: &HostPort) -> Result<SocketAddr> {
    lookup_host((endpoint.host.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| Error::Connection(format!("unresolvable host: {}", endpoint.host)))
}

/// The transport under a connection, possibly upgraded mid-stream.
enum Link {
    Plain(BoxStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<Rewind<BoxStream>>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<Rewind<BoxStream>>>),
    Dead,
}

impl Link {
    fn peer_certificate(&self) -> Option<Certificate> {
        let certs = match self {
            Self::ClientTls(stream) => stream.get_ref().1.peer_certificates(),
            Self::ServerTls(stream) => stream.get_ref().1.peer_certificates(),
            _ => None,
        }?;

        certs
            .first()
            .and_then(|der| Certificate::from_der(der.to_vec()).ok())
    }
}

impl AsyncRead for Link {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Self::ClientTls(io) => Pin::new(io).poll_read(cx, buf),
            Self::ServerTls(io) => Pin::new(io).poll_read(cx, buf),
            Self::Dead => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Self::ClientTls(io) => Pin::new(io).poll_write(cx, buf),
            Self::ServerTls(io) => Pin::new(io).poll_write(cx, buf),
            Self::Dead => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_flush(cx),
            Self::ClientTls(io) => Pin::new(io).poll_flush(cx),
            Self::ServerTls(io) => Pin::new(io).poll_flush(cx),
            Self::Dead => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Self::ClientTls(io) => Pin::new(io).poll_shutdown(cx),
            Self::ServerTls(io) => Pin::new(io).poll_shutdown(cx),
            Self::Dead => Poll::Ready(Ok(())),
        }
    }
}

struct Actor {
    conn: Arc<Connection>,
    link: Link,
    reader: FrameReader,
    pending: HashMap<u64, ReplyTo>,
    next_tag: u64,
    out_rx: mpsc::Receiver<Outgoing>,
    closed_tx: watch::Sender<bool>,
}

impl Actor {
    async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            if !matches!(e, Error::ConnectionLost) {
                log::debug!(
                    "overlay connection ended: peer={:?}, err={}",
                    self.conn.physical_peer,
                    e
                );
            }
        }

        let _ = self.link.shutdown().await;
        self.conn.handle_lost();

        for (_, waiter) in self.pending.drain() {
            fail_waiter(waiter, Error::ConnectionLost);
        }

        let _ = self.closed_tx.send(true);
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            while let Some(frame) = self.reader.next_frame()? {
                if self.dispatch(frame).await? {
                    return Ok(());
                }
            }

            tokio::select! {
                out = self.out_rx.recv() => match out {
                    Some(out) => {
                        if self.handle_out(out).await? {
                            return Ok(());
                        }
                    }
                    // Every handle dropped: nobody can talk through this
                    // connection any more.
                    None => return Ok(()),
                },
                read = self.link.read_buf(self.reader.buffer_mut()) => {
                    if read? == 0 {
                        return Err(Error::ConnectionLost);
                    }
                }
            }
        }
    }

    async fn handle_out(&mut self, out: Outgoing) -> Result<bool> {
        match out {
            Outgoing::Call { mut frame, reply } => {
                let tag = self.next_tag;
                self.next_tag += 1;
                frame.set_tag(tag);

                if let Err(e) = self.write_frame(&frame).await {
                    fail_waiter(reply, e.clone());
                    return Err(e);
                }

                self.pending.insert(tag, reply);
                Ok(false)
            }
            Outgoing::Reply { frame, fatal } => {
                self.write_frame(&frame).await?;
                Ok(fatal)
            }
            Outgoing::Shutdown => Ok(true),
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<bool> {
        match frame.kind.clone() {
            FrameKind::Answer { tag } => {
                self.resolve(tag, Ok(frame)).await?;
                Ok(false)
            }
            FrameKind::Error {
                tag,
                code,
                description,
                fatal,
            } => {
                self.resolve(tag, Err(Error::from_remote(&code, &description)))
                    .await?;
                Ok(fatal)
            }
            FrameKind::Request { command, tag } => self.handle_request(&command, tag, frame).await,
        }
    }

    async fn resolve(&mut self, tag: u64, result: Result<Frame>) -> Result<()> {
        match self.pending.remove(&tag) {
            None => {
                log::warn!("uncorrelated response: tag={}", tag);
                Ok(())
            }
            Some(ReplyTo::Ignore) => {
                if let Err(e) = result {
                    log::debug!("uncorrelated command failed: tag={}, err={}", tag, e);
                }

                Ok(())
            }
            Some(ReplyTo::One(sender)) => {
                let _ = sender.send(result);
                Ok(())
            }
            Some(ReplyTo::StartTls {
                sender,
                connector,
                server_name,
                host_certificate,
                authorized,
            }) => match result {
                Ok(answer) => {
                    match self.upgrade_client(connector, server_name).await {
                        Ok(()) => {
                            let peer_certificate = self.link.peer_certificate();
                            {
                                let mut state = self.conn.state.lock();
                                state.authorized = authorized;
                                state.host_certificate = Some(host_certificate);
                                state.peer_certificate = peer_certificate;
                            }

                            let _ = sender.send(Ok(answer));
                            Ok(())
                        }
                        Err(e) => {
                            let _ = sender.send(Err(e.clone()));
                            Err(e)
                        }
                    }
                }
                Err(e) => {
                    let _ = sender.send(Err(e));
                    Ok(())
                }
            },
        }
    }

    async fn upgrade_client(
        &mut self,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let plain = self.take_plain()?;
        let leftover = self.reader.take_remaining();
        let stream = connector
            .connect(server_name, Rewind::new(leftover, plain))
            .await
            .map_err(|e| Error::Connection(format!("tls connect failed: {}", e)))?;

        self.link = Link::ClientTls(Box::new(stream));
        Ok(())
    }

    async fn upgrade_server(&mut self, acceptor: TlsAcceptor) -> Result<()> {
        let plain = self.take_plain()?;
        let leftover = self.reader.take_remaining();
        let stream = acceptor
            .accept(Rewind::new(leftover, plain))
            .await
            .map_err(|e| Error::Connection(format!("tls accept failed: {}", e)))?;

        self.link = Link::ServerTls(Box::new(stream));
        Ok(())
    }

    fn take_plain(&mut self) -> Result<BoxStream> {
        match std::mem::replace(&mut self.link, Link::Dead) {
            Link::Plain(io) => Ok(io),
            other => {
                self.link = other;
                Err(Error::Connection(
                    "connection is already encrypted".to_string(),
                ))
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf)?;
        self.link.write_all(&buf).await?;
        self.link.flush().await?;
        Ok(())
    }

    async fn handle_request(
        &mut self,
        command: &str,
        tag: Option<u64>,
        frame: Frame,
    ) -> Result<bool> {
        if command == wire::CMD_SECURE {
            return self.cmd_secure(tag, &frame).await;
        }

        let result = match command {
            wire::CMD_IDENTIFY => self.cmd_identify(tag, &frame),
            wire::CMD_SOURCE_IP => self.cmd_source_ip(tag),
            wire::CMD_LISTEN => self.cmd_listen(tag, &frame),
            wire::CMD_VIRTUAL => self.cmd_virtual(tag, &frame),
            wire::CMD_WRITE => self.cmd_write(tag, &frame).await,
            wire::CMD_CLOSE => self.cmd_close(tag, &frame).await,
            wire::CMD_INBOUND | wire::CMD_OUTBOUND | wire::CMD_BIND_UDP | wire::CMD_SIGN => {
                spawn_handler(self.conn.clone(), command.to_string(), tag, frame);
                Ok(None)
            }
            _ => Err(Error::Connection(format!("unknown command: {}", command))),
        };

        match result {
            Ok(Some(reply)) => {
                self.write_frame(&reply).await?;
                Ok(false)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                log::debug!("command failed: command={:?}, err={}", command, e);
                if let Some(tag) = tag {
                    self.write_frame(&Frame::error(tag, e.code(), &e.description(), e.is_fatal()))
                        .await?;
                }

                Ok(e.is_fatal())
            }
        }
    }

    /// Send an error reply (when the peer asked for one) and report whether
    /// the error must also take the connection down.
    async fn reply_error(&mut self, tag: Option<u64>, e: Error) -> Result<bool> {
        log::debug!("command refused: err={}", e);
        if let Some(tag) = tag {
            self.write_frame(&Frame::error(tag, e.code(), &e.description(), e.is_fatal()))
                .await?;
        }

        Ok(e.is_fatal())
    }

    /// SECURE is the one command the reader must handle in place: the
    /// answer has to be the last plaintext frame, and nothing may be read
    /// off the socket between flushing it and starting the handshake.
    async fn cmd_secure(&mut self, tag: Option<u64>, frame: &Frame) -> Result<bool> {
        if self.conn.state.lock().host_certificate.is_some() {
            // Re-securing an encrypted connection is a programming error on
            // the peer's side and unrecoverable.
            return self
                .reply_error(tag, Error::Verify("connection is already secure".to_string()))
                .await;
        }

        let args = match wire::parse_secure(frame) {
            Ok(args) => args,
            Err(e) => return self.reply_error(tag, e).await,
        };

        let service = self.conn.service()?;
        let to_domain = args.to.domain_address();
        let our = match service.store.get_private(&to_domain.to_string()) {
            Some(identity) => identity,
            None => {
                return self
                    .reply_error(tag, Error::NotFound(format!("no certificate for {}", to_domain)))
                    .await;
            }
        };

        // When the peer wants authorization we will check its client
        // certificate, which may require learning its domain's root first.
        let expected_issuer = if args.authorize && !args.from.is_anonymous() {
            let domain = args.from.domain_address();
            let known = service.store.get_self_signed(&domain.domain).or_else(|| {
                // A domain we are the authority for needs no lookup.
                service
                    .store
                    .get_private(&domain.domain)
                    .map(|identity| identity.certificate().clone())
            });

            match known {
                Some(cert) => Some(cert),
                None => match service.fetch_remote_certificate(&domain).await {
                    Ok(cert) => Some(cert),
                    Err(e) => {
                        log::warn!(
                            "could not learn peer domain certificate: domain={}, err={}",
                            domain,
                            e
                        );
                        None
                    }
                },
            }
        } else {
            None
        };

        let config = match tls::server_config(&our, service.store.clone(), expected_issuer) {
            Ok(config) => config,
            Err(e) => return self.reply_error(tag, e).await,
        };

        if let Some(tag) = tag {
            self.write_frame(&Frame::answer(tag)).await?;
        }

        self.upgrade_server(TlsAcceptor::from(Arc::new(config)))
            .await?;

        let peer_certificate = self.link.peer_certificate();
        {
            let mut state = self.conn.state.lock();
            state.authorized = args.authorize;
            state.host_certificate = Some(our.certificate().clone());
            state.peer_certificate = peer_certificate;
        }

        if args.authorize {
            if let Some(peer) = self.conn.physical_peer {
                service.cache_secured_peer(peer, &args.from, &to_domain, self.conn.clone());
            }
        }

        log::info!(
            "connection secured: from={}, to={}, authorize={}",
            args.from,
            args.to,
            args.authorize
        );
        Ok(false)
    }

    fn cmd_identify(&self, tag: Option<u64>, frame: &Frame) -> Result<Option<Frame>> {
        let subject = wire::parse_identify(frame)?;
        let service = self.conn.service()?;
        let identity = service
            .store
            .get_private(&subject.to_string())
            .ok_or_else(|| Error::NotFound(format!("no identity for {}", subject)))?;

        Ok(tag.map(|tag| wire::certificate_answer(tag, identity.certificate())))
    }

    fn cmd_source_ip(&self, tag: Option<u64>) -> Result<Option<Frame>> {
        let peer = self
            .conn
            .physical_peer
            .ok_or_else(|| Error::Connection("transport has no peer address".to_string()))?;

        Ok(tag.map(|tag| wire::ip_answer(tag, &peer.ip().to_string())))
    }

    fn cmd_listen(&self, tag: Option<u64>, frame: &Frame) -> Result<Option<Frame>> {
        let args = wire::parse_listen(frame)?;

        // The peer is a client-side representation of the user described
        // by From, talking to a server-side representation of the same.
        self.conn.verify_certificate_allowed(&args.from, &args.from)?;

        for name in &args.protocols {
            if name.starts_with('.') {
                return Err(Error::Verify(format!(
                    "internal protocols are for server-server use only: {}",
                    name
                )));
            }
        }

        let peer_certificate = self
            .conn
            .peer_certificate()
            .ok_or_else(|| Error::Verify("peer presented no certificate".to_string()))?;
        let service = self.conn.service()?;

        for name in args.protocols {
            let key = (args.from.clone(), name);
            log::info!(
                "listener registered: from={}, protocol={:?}, description={:?}",
                key.0,
                key.1,
                args.description
            );

            service.register_listening_client(
                key.clone(),
                self.conn.clone(),
                peer_certificate.clone(),
                args.description.clone(),
            );
            self.conn.state.lock().listening.push(key);
        }

        Ok(tag.map(Frame::answer))
    }

    fn cmd_virtual(&self, tag: Option<u64>, frame: &Frame) -> Result<Option<Frame>> {
        let id = wire::parse_channel_id(frame)?;
        let service = self.conn.service()?;
        let waiter = service
            .claim_reservation(&id)
            .ok_or_else(|| Error::NotFound(format!("unknown connection identifier: {}", id)))?;

        let info = ChannelInfo {
            host: waiter.to.clone(),
            peer: waiter.from.clone(),
            protocol: waiter.protocol.clone(),
        };
        let stream = channel::open(self.conn.clone(), info, id.clone());

        // The answer is flushed before the handler's first WRITE can move
        // through the outgoing queue.
        let handler = waiter.handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                log::warn!("virtual channel handler failed: id={:?}, err={}", id, e);
            }
        });

        Ok(tag.map(Frame::answer))
    }

    async fn cmd_write(&self, tag: Option<u64>, frame: &Frame) -> Result<Option<Frame>> {
        let id = wire::parse_channel_id(frame)?;
        let events = self
            .conn
            .channel_sender(&id)
            .ok_or_else(|| Error::NotFound(format!("no such channel: {}", id)))?;

        events
            .send(ChannelEvent::Data(frame.body.clone()))
            .await
            .map_err(|_| Error::NotFound(format!("channel is closing: {}", id)))?;

        Ok(tag.map(Frame::answer))
    }

    async fn cmd_close(&self, tag: Option<u64>, frame: &Frame) -> Result<Option<Frame>> {
        let id = wire::parse_channel_id(frame)?;
        let events = self
            .conn
            .remove_channel_sender(&id)
            .ok_or_else(|| Error::NotFound(format!("no such channel: {}", id)))?;

        let _ = events.send(ChannelEvent::Closed).await;
        Ok(tag.map(Frame::answer))
    }
}

fn fail_waiter(reply: ReplyTo, e: Error) {
    match reply {
        ReplyTo::Ignore => {}
        ReplyTo::One(sender) => {
            let _ = sender.send(Err(e));
        }
        ReplyTo::StartTls { sender, .. } => {
            let _ = sender.send(Err(e));
        }
    }
}

/// Commands that do real work run off the reader task so slow lookups and
/// relayed sub-requests never stall unrelated traffic on this connection.
fn spawn_handler(conn: Arc<Connection>, command: String, tag: Option<u64>, frame: Frame) {
    tokio::spawn(async move {
        let result = match command.as_str() {
            wire::CMD_INBOUND => handle_inbound(&conn, tag, &frame).await,
            wire::CMD_OUTBOUND => handle_outbound(&conn, tag, &frame).await,
            wire::CMD_BIND_UDP => handle_bind_udp(&conn, &frame)
                .await
                .map(|_| tag.map(Frame::answer)),
            wire::CMD_SIGN => handle_sign(&conn, tag, &frame).await,
            _ => return,
        };

        let out = match result {
            Ok(Some(reply)) => Outgoing::Reply {
                frame: reply,
                fatal: false,
            },
            Ok(None) => return,
            Err(e) => {
                log::debug!("command failed: command={:?}, err={}", command, e);
                match tag {
                    Some(tag) => Outgoing::Reply {
                        frame: Frame::error(tag, e.code(), &e.description(), e.is_fatal()),
                        fatal: e.is_fatal(),
                    },
                    None if e.is_fatal() => Outgoing::Shutdown,
                    None => return,
                }
            }
        };

        let _ = conn.out_tx.send(out).await;
    });
}

/// Serve an inbound request: reserve ids for every local factory, describe
/// how the asker can reach us, and merge in whatever connected listening
/// clients advertise for the same name.
async fn handle_inbound(
    conn: &Arc<Connection>,
    tag: Option<u64>,
    frame: &Frame,
) -> Result<Option<Frame>> {
    let args = wire::parse_inbound(frame)?;
    conn.verify_certificate_allowed(&args.to, &args.from)?;

    let service = conn.service()?;
    let factories = service.local_factories(&args.from, &args.to, &args.protocol);
    let clients = service.listening_clients_for(&args.to, &args.protocol);

    if factories.is_empty() && clients.is_empty() {
        return Err(Error::NotFound(format!(
            "nothing listens for {} speaking {:?}",
            args.to, args.protocol
        )));
    }

    let mut result = Vec::new();

    if !factories.is_empty() {
        let public_ip = conn.determine_public_ip();
        let private_ip = conn.private_ip();
        let mut methods = Vec::new();

        if let Some(port) = service.splice_port() {
            methods.push(ConnectMethod::Tcp(HostPort::new(public_ip.to_string(), port)));
            if public_ip != private_ip {
                methods.push(ConnectMethod::Tcp(HostPort::new(
                    private_ip.to_string(),
                    port,
                )));
            }
        }

        match (&args.udp_source, &service.dispatcher) {
            (None, _) => log::debug!("udp source absent on inbound"),
            (Some(source), None) => {
                log::debug!("udp source {} given, but dispatcher not running", source)
            }
            (Some(source), Some(dispatcher)) => match resolve_endpoint(source).await {
                Err(e) => log::warn!("unresolvable udp source: source={}, err={}", source, e),
                Ok(remote) => {
                    match dispatcher.seed_nat(remote).await {
                        Ok(udp_port) => {
                            if source.host == public_ip.to_string() && public_ip != private_ip {
                                // The asker is apparently behind the same
                                // NAT we are; hand it the LAN path first.
                                log::debug!(
                                    "remote matches our public ip, preferring internal: public={}, private={}",
                                    public_ip,
                                    private_ip
                                );
                                methods.push(ConnectMethod::Ptcp(HostPort::new(
                                    private_ip.to_string(),
                                    udp_port,
                                )));
                            }

                            methods.push(ConnectMethod::Ptcp(HostPort::new(
                                public_ip.to_string(),
                                udp_port,
                            )));
                        }
                        Err(e) => log::warn!("nat seed failed: source={}, err={}", source, e),
                    }

                    match dispatcher.bind_new_port().await {
                        Ok(reverse_port) => methods.push(ConnectMethod::Rptcp(HostPort::new(
                            public_ip.to_string(),
                            reverse_port,
                        ))),
                        Err(e) => log::warn!("reverse port bind failed: err={}", e),
                    }
                }
            },
        }

        methods.push(ConnectMethod::Virtual);
        log::debug!(
            "offering local methods: methods={:?}",
            ConnectMethod::format_list(&methods)
        );

        for (handler, description) in factories {
            let (expires, id) =
                service.map_listener(&args.to, &args.from, &args.protocol, handler, false);
            result.push(wire::ListenerEntry {
                id,
                certificate: None,
                methods: methods.clone(),
                expires,
                description,
            });
        }
    }

    // Ask every connected listening client for the same name, keep only the
    // methods that survive relaying, and replace each advertised
    // certificate with the one we actually verified for that client.
    for client in clients {
        log::debug!(
            "relaying inbound to listening client: description={:?}",
            client.description
        );

        let answer = client
            .connection
            .call(wire::inbound(
                &args.from,
                &args.to,
                &args.protocol,
                args.udp_source.as_ref(),
            ))
            .await;

        match answer.and_then(|answer| wire::parse_listeners(&answer)) {
            Ok(entries) => {
                for mut entry in entries {
                    entry.methods.retain(ConnectMethod::relayable);
                    if !entry.methods.is_empty() {
                        entry.certificate = Some(client.certificate.clone());
                        result.push(entry);
                    }
                }
            }
            Err(e) => log::warn!("listening client did not answer inbound: err={}", e),
        }
    }

    Ok(tag.map(|tag| wire::listeners_answer(tag, &result)))
}

/// Serve an outbound request: the asker already reserved `id` with us and
/// now presents the ways we may dial back toward it.
async fn handle_outbound(
    conn: &Arc<Connection>,
    tag: Option<u64>,
    frame: &Frame,
) -> Result<Option<Frame>> {
    let args = wire::parse_outbound(frame)?;
    conn.verify_certificate_allowed(&args.to, &args.from)?;

    let service = conn.service()?;
    let waiter = service
        .claim_reservation(&args.id)
        .ok_or_else(|| Error::NotFound(format!("unknown connection identifier: {}", args.id)))?;

    let stream = attempt_methods(
        conn,
        &args.methods,
        &args.id,
        &waiter.to,
        &waiter.from,
        &args.protocol,
    )
    .await?;

    let handler = waiter.handler.clone();
    let id = args.id.clone();
    tokio::spawn(async move {
        if let Err(e) = handler.handle(stream).await {
            log::warn!("outbound channel handler failed: id={:?}, err={}", id, e);
        }
    });

    Ok(tag.map(Frame::answer))
}

/// Serve a bind-udp request: seed the hole ourselves when the named
/// endpoint is ours, otherwise pass the request along to the listening
/// client it belongs to.
async fn handle_bind_udp(conn: &Arc<Connection>, frame: &Frame) -> Result<()> {
    let args = wire::parse_bind_udp(frame)?;

    // We are representing the source: they are the ones being told to
    // originate a packet.
    conn.verify_certificate_allowed(&args.q2q_source, &args.q2q_destination)?;

    let service = conn.service()?;
    let locally_served = !service
        .local_factories(&args.q2q_destination, &args.q2q_source, &args.protocol)
        .is_empty();

    if locally_served && args.udp_source.host == conn.determine_public_ip().to_string() {
        let dispatcher = service
            .dispatcher
            .clone()
            .ok_or_else(|| Error::Connection("pseudo-tcp dispatcher unavailable".to_string()))?;
        dispatcher
            .seed_nat(resolve_endpoint(&args.udp_destination).await?)
            .await?;
        return Ok(());
    }

    for client in service.listening_clients_for(&args.q2q_source, &args.protocol) {
        let peer_host = client
            .connection
            .physical_peer
            .map(|addr| addr.ip().to_string());
        if peer_host.as_deref() == Some(args.udp_source.host.as_str()) {
            client.connection.call(wire::bind_udp(&args)).await?;
            return Ok(());
        }
    }

    Err(Error::Connection(
        "unable to find appropriate UDP binder".to_string(),
    ))
}

/// Serve a sign request for a user located within a domain we hold the
/// authority certificate for.
async fn handle_sign(
    conn: &Arc<Connection>,
    tag: Option<u64>,
    frame: &Frame,
) -> Result<Option<Frame>> {
    let args = wire::parse_sign(frame)?;
    let subject = crate::identity::csr_subject(&args.certificate_request)?;
    let address = Address::parse_str(&subject);

    let user = match &address.resource {
        Some(user) => user.clone(),
        None => {
            return Err(Error::BadCertificateRequest(format!(
                "certificate requested with bad subject: {}",
                subject
            )));
        }
    };

    let service = conn.service()?;
    let authority = service
        .store
        .get_private(&address.domain)
        .ok_or_else(|| Error::NotFound(format!("not an authority for {}", address.domain)))?;

    let password = String::from_utf8(args.password)
        .map_err(|_| Error::NoSuchUser)?;
    service.store.check_user(&address.domain, &user, &password)?;

    let certificate =
        authority.sign_request(&args.certificate_request, service.store.gen_serial(&address.domain))?;
    log::info!(
        "signing certificate for user: subject={:?}, digest={}",
        subject,
        certificate.digest()
    );

    Ok(tag.map(|tag| wire::certificate_answer(tag, &certificate)))
}
