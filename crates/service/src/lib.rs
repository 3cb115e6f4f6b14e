//! ## Dial-by-name overlay core
//!
//! This crate connects two named endpoints (`user@domain`) over TLS,
//! picking transparently among direct TCP, pseudo-TCP over UDP for NAT
//! traversal, and virtual channels multiplexed over an already-established
//! control connection. The caller supplies a source identity, a destination
//! identity and a named sub-protocol; the core resolves, authenticates,
//! traverses NATs and yields a bidirectional byte stream.
//!
//! Trust is internal to the overlay: every domain is its own certificate
//! authority, user certificates are issued by their domain, and peer domain
//! roots are learned on first contact and pinned from then on.

pub mod address;
pub mod cache;
pub(crate) mod channel;
pub mod connection;
pub mod dial;
pub mod error;
pub mod identity;
pub mod methods;
pub mod ptcp;
pub(crate) mod splice;
pub mod store;
pub mod stream;
pub(crate) mod tls;
pub mod wire;

pub use self::{
    address::Address,
    connection::{Chooser, Connection},
    error::{Error, Result},
    identity::{Certificate, PrivateIdentity},
    methods::{ConnectMethod, HostPort},
    ptcp::PtcpDispatcher,
    store::{CertStore, DirCertStore, MemoryCertStore},
    stream::{ChannelInfo, OverlayStream},
    wire::ListenerEntry,
};

pub use codec;
pub use codec::{Frame, Headers};

use crate::cache::ConnectionCache;

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream, lookup_host},
    task::JoinHandle,
};

/// The well-known overlay control port.
pub const OVERLAY_PORT: u16 = 8788;

/// The sub-protocol carrying application messages.
pub const MESSAGE_PROTOCOL: &str = "q2q-message";

/// How long a server-side reservation waits to be claimed.
const RESERVATION_TTL_SECS: u64 = 120;

/// A server-side handler for one established channel.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, stream: OverlayStream) -> io::Result<()>;
}

/// Adapter so a plain async closure can serve as a [`StreamHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> StreamHandler for FnHandler<F>
where
    F: Fn(OverlayStream) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = io::Result<()>> + Send,
{
    async fn handle(&self, stream: OverlayStream) -> io::Result<()> {
        (self.0)(stream).await
    }
}

/// Dynamic lookup of server-side handlers, consulted alongside the
/// listeners registered through [`Service::listen_q2q`].
pub trait AppResolver: Send + Sync {
    fn resolve(
        &self,
        from: &Address,
        to: &Address,
        protocol: &str,
    ) -> Vec<(Arc<dyn StreamHandler>, String)>;
}

/// A pending expectation that a channel id will shortly be claimed by a
/// direct or virtual splice.
pub(crate) struct Reservation {
    pub(crate) from: Address,
    pub(crate) to: Address,
    pub(crate) protocol: String,
    pub(crate) handler: Arc<dyn StreamHandler>,
    pub(crate) is_client: bool,
    pub(crate) expires: u64,
    timer: JoinHandle<()>,
}

/// One LISTEN registration made by a connected client.
#[derive(Clone)]
pub(crate) struct ListeningClient {
    pub(crate) connection: Arc<Connection>,
    pub(crate) certificate: Certificate,
    pub(crate) description: String,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SecureKey {
    host: String,
    port: u16,
    from: Address,
    to_domain: String,
    authorize: bool,
}

type AppKey = (Address, Address, String);
type FactoryKey = (Address, String);

#[derive(Default)]
struct PublicIp {
    ip: Option<IpAddr>,
    /// Set while the only address we know is our own socket's; cleared the
    /// first time a peer confirms what we look like from outside.
    really_private: bool,
}

pub struct ServiceOptions {
    pub store: Arc<dyn CertStore>,
    pub resolver: Option<Arc<dyn AppResolver>>,
    pub dispatcher: Option<Arc<dyn PtcpDispatcher>>,
    /// Address the listeners bind on.
    pub bind: IpAddr,
    /// Port for the overlay control listener; `None` runs client-only.
    pub overlay_port: Option<u16>,
    /// Port for the inbound TCP splice listener.
    pub splice_port: Option<u16>,
    /// The port assumed when dialing foreign overlay servers.
    pub connect_port: u16,
    /// Externally reachable address, when the operator knows it.
    pub public_ip: Option<IpAddr>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            store: Arc::new(MemoryCertStore::new()),
            resolver: None,
            dispatcher: None,
            bind: IpAddr::from([0u8, 0, 0, 0]),
            overlay_port: Some(OVERLAY_PORT),
            splice_port: None,
            connect_port: OVERLAY_PORT,
            public_ip: None,
        }
    }
}

pub(crate) struct ServiceInner {
    pub(crate) store: Arc<dyn CertStore>,
    pub(crate) dispatcher: Option<Arc<dyn PtcpDispatcher>>,
    resolver: Option<Arc<dyn AppResolver>>,
    bind: IpAddr,
    overlay_port: Option<u16>,
    splice_port_wanted: Option<u16>,
    connect_port: u16,
    public_ip: Mutex<PublicIp>,
    overlay_addr: Mutex<Option<SocketAddr>>,
    splice_port: Mutex<Option<u16>>,
    local_factories: Mutex<HashMap<FactoryKey, Vec<(Arc<dyn StreamHandler>, String)>>>,
    listening_clients: Mutex<HashMap<FactoryKey, Vec<ListeningClient>>>,
    reservations: Mutex<HashMap<String, Reservation>>,
    next_channel_id: AtomicU64,
    secure_cache: ConnectionCache<SecureKey, Arc<Connection>>,
    app_cache: ConnectionCache<AppKey, Arc<Connection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The overlay service: listeners, registries, reservations, caches and
/// the certificate store, behind a cheaply clonable handle.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn new(options: ServiceOptions) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store: options.store,
                dispatcher: options.dispatcher,
                resolver: options.resolver,
                bind: options.bind,
                overlay_port: options.overlay_port,
                splice_port_wanted: options.splice_port,
                connect_port: options.connect_port,
                public_ip: Mutex::new(PublicIp {
                    ip: options.public_ip,
                    really_private: false,
                }),
                overlay_addr: Mutex::new(None),
                splice_port: Mutex::new(None),
                local_factories: Mutex::new(HashMap::new()),
                listening_clients: Mutex::new(HashMap::new()),
                reservations: Mutex::new(HashMap::new()),
                next_channel_id: AtomicU64::new(0),
                secure_cache: ConnectionCache::default(),
                app_cache: ConnectionCache::default(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn CertStore> {
        self.inner.store.clone()
    }

    /// Bind and start serving. Port zero binds an ephemeral port; the bound
    /// ports are readable afterwards through [`Service::overlay_addr`] and
    /// [`Service::splice_addr`].
    pub async fn start(&self) -> Result<()> {
        if let Some(port) = self.inner.overlay_port {
            let listener = TcpListener::bind((self.inner.bind, port)).await?;
            let local = listener.local_addr()?;
            *self.inner.overlay_addr.lock() = Some(local);
            log::info!("overlay server listening: addr={}", local);

            let inner = self.inner.clone();
            self.inner
                .tasks
                .lock()
                .push(tokio::spawn(overlay_accept(inner, listener)));
        }

        if let Some(port) = self.inner.splice_port_wanted {
            let listener = TcpListener::bind((self.inner.bind, port)).await?;
            let local = listener.local_addr()?;
            *self.inner.splice_port.lock() = Some(local.port());
            log::info!("splice listener listening: addr={}", local);

            let inner = self.inner.clone();
            self.inner
                .tasks
                .lock()
                .push(tokio::spawn(splice::run(inner, listener)));
        }

        Ok(())
    }

    /// Cancel every pending reservation, stop the listeners, close every
    /// cached connection and halt the dispatcher.
    pub async fn stop(&self) {
        for (id, reservation) in self.inner.reservations.lock().drain() {
            log::debug!("reservation cancelled: id={:?}", id);
            reservation.timer.abort();
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let mut connections = self.inner.secure_cache.drain();
        connections.extend(self.inner.app_cache.drain());
        for connection in connections {
            connection.close().await;
        }

        if let Some(dispatcher) = &self.inner.dispatcher {
            dispatcher.halt().await;
        }

        log::info!("overlay service stopped");
    }

    /// Register `protocols` under `from`: secure a connection to our own
    /// domain server, announce the listener there, and serve matching
    /// inbound splices locally until the connection is lost.
    pub async fn listen_q2q(
        &self,
        from: &Address,
        protocols: Vec<(String, Arc<dyn StreamHandler>)>,
        description: &str,
    ) -> Result<()> {
        let conn = self
            .inner
            .get_secure_connection(from, &from.domain_address(), true, None)
            .await?;

        let names: Vec<String> = protocols.iter().map(|(name, _)| name.clone()).collect();
        conn.call(wire::listen(from, &names, description)).await?;

        {
            let mut factories = self.inner.local_factories.lock();
            for (name, handler) in &protocols {
                factories
                    .entry((from.clone(), name.clone()))
                    .or_default()
                    .push((handler.clone(), description.to_string()));
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let from = from.clone();
        let description = description.to_string();
        conn.notify_on_lost(move || {
            if let Some(inner) = weak.upgrade() {
                let mut factories = inner.local_factories.lock();
                for (name, handler) in &protocols {
                    if let Some(entries) = factories.get_mut(&(from.clone(), name.clone())) {
                        entries.retain(|(known, desc)| {
                            !(Arc::ptr_eq(known, handler) && desc == &description)
                        });
                    }
                }
                log::info!("listener deregistered: from={}", from);
            }
        });

        Ok(())
    }

    /// Connect `from` to `to` speaking `protocol`, yielding the byte stream
    /// of whichever candidate method succeeded first.
    pub async fn connect_q2q(
        &self,
        from: &Address,
        to: &Address,
        protocol: &str,
    ) -> Result<OverlayStream> {
        self.connect_q2q_with(from, to, protocol, None).await
    }

    /// [`Service::connect_q2q`] with control over which advertised
    /// listeners are attempted.
    pub async fn connect_q2q_with(
        &self,
        from: &Address,
        to: &Address,
        protocol: &str,
        chooser: Chooser<'_>,
    ) -> Result<OverlayStream> {
        let conn = self
            .inner
            .get_secure_connection(from, to, true, None)
            .await?;

        conn.connect(from, to, protocol, chooser).await
    }

    /// Obtain a certificate for `address` signed by its domain, proving
    /// knowledge of `shared_secret`, and store it as our private identity
    /// for that address.
    pub async fn request_certificate_for_address(
        &self,
        address: &Address,
        shared_secret: &[u8],
    ) -> Result<()> {
        let subject = address.to_string();
        let (csr, key_der) = identity::certificate_request(&subject)?;

        // A worthless self-signed certificate carries the handshake until
        // the real one is issued.
        let placeholder = Arc::new(PrivateIdentity::throwaway(&subject)?);
        let conn = self
            .inner
            .get_secure_connection(address, &address.domain_address(), false, Some(placeholder))
            .await?;

        let answer = conn.call(wire::sign(&csr, shared_secret)).await?;
        let certificate = wire::parse_certificate(&answer)?;
        log::info!(
            "certificate issued: subject={:?}, digest={}",
            subject,
            certificate.digest()
        );

        self.inner
            .store
            .add_private(&subject, PrivateIdentity::from_parts(certificate, key_der))
    }

    /// Deliver one command frame to a peer over the shared application
    /// message channel, dialing it only if no live one is cached.
    pub async fn send_message(
        &self,
        from: &Address,
        to: &Address,
        namespace: &str,
        mut message: Frame,
    ) -> Result<Frame> {
        let inner = self.inner.clone();
        let key = (from.clone(), to.clone(), MESSAGE_PROTOCOL.to_string());
        let (from, to) = (from.clone(), to.clone());

        let conn = self
            .inner
            .app_cache
            .connect_cached(key, |conn| !conn.is_lost(), move || async move {
                let secured = inner
                    .get_secure_connection(&from, &to, true, None)
                    .await?;
                let stream = secured.connect(&from, &to, MESSAGE_PROTOCOL, None).await?;
                Ok(Connection::spawn(
                    &inner,
                    Box::new(stream),
                    None,
                    None,
                    true,
                    false,
                ))
            })
            .await?;

        message.headers.set("Namespace", namespace);
        conn.call(message).await
    }

    /// The secured control connection toward `to`'s domain, dialed or
    /// reused from the cache.
    pub async fn secure_connection_to(
        &self,
        from: &Address,
        to: &Address,
        authorize: bool,
    ) -> Result<Arc<Connection>> {
        self.inner
            .get_secure_connection(from, to, authorize, None)
            .await
    }

    pub fn overlay_addr(&self) -> Option<SocketAddr> {
        *self.inner.overlay_addr.lock()
    }

    pub fn splice_addr(&self) -> Option<u16> {
        *self.inner.splice_port.lock()
    }

    /// Live reservation count, for tests and introspection.
    pub fn pending_reservations(&self) -> usize {
        self.inner.reservations.lock().len()
    }
}

impl ServiceInner {
    pub(crate) fn public_ip(&self) -> (Option<IpAddr>, bool) {
        let state = self.public_ip.lock();
        (state.ip, state.really_private)
    }

    /// First sight of any local address: remember it, but flagged as
    /// really private until some peer confirms what we look like.
    pub(crate) fn seed_public_ip(&self, ip: IpAddr) {
        let mut state = self.public_ip.lock();
        if state.ip.is_none() {
            state.ip = Some(ip);
            state.really_private = true;
        }
    }

    pub(crate) fn confirm_public_ip(&self, ip: IpAddr) {
        let mut state = self.public_ip.lock();
        state.ip = Some(ip);
        state.really_private = false;
    }

    pub(crate) fn splice_port(&self) -> Option<u16> {
        *self.splice_port.lock()
    }

    pub(crate) fn local_factories(
        &self,
        from: &Address,
        to: &Address,
        protocol: &str,
    ) -> Vec<(Arc<dyn StreamHandler>, String)> {
        let mut result = self
            .local_factories
            .lock()
            .get(&(to.clone(), protocol.to_string()))
            .cloned()
            .unwrap_or_default();

        if let Some(resolver) = &self.resolver {
            result.extend(resolver.resolve(from, to, protocol));
        }

        result
    }

    pub(crate) fn listening_clients_for(
        &self,
        to: &Address,
        protocol: &str,
    ) -> Vec<ListeningClient> {
        self.listening_clients
            .lock()
            .get(&(to.clone(), protocol.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn register_listening_client(
        &self,
        key: FactoryKey,
        connection: Arc<Connection>,
        certificate: Certificate,
        description: String,
    ) {
        self.listening_clients
            .lock()
            .entry(key)
            .or_default()
            .push(ListeningClient {
                connection,
                certificate,
                description,
            });
    }

    pub(crate) fn remove_listening_client(&self, key: &FactoryKey, connection: *const Connection) {
        let mut clients = self.listening_clients.lock();
        if let Some(entries) = clients.get_mut(key) {
            entries.retain(|entry| Arc::as_ptr(&entry.connection) != connection);
            if entries.is_empty() {
                clients.remove(key);
            }
        }
    }

    /// Reserve a channel id for a factory, to be claimed by a direct or
    /// virtual splice within the expiry window.
    pub(crate) fn map_listener(
        self: &Arc<Self>,
        to: &Address,
        from: &Address,
        protocol: &str,
        handler: Arc<dyn StreamHandler>,
        is_client: bool,
    ) -> (u64, String) {
        let serial = self.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}->{}:{}", from, to, serial);
        let expires = wire::unix_now() + RESERVATION_TTL_SECS;

        // The timer holds only a weak handle so an abandoned service does
        // not outlive its last reservation.
        let weak = Arc::downgrade(self);
        let timed_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RESERVATION_TTL_SECS)).await;
            if let Some(inner) = weak.upgrade() {
                if inner.reservations.lock().remove(&timed_id).is_some() {
                    log::debug!("reservation expired: id={:?}", timed_id);
                }
            }
        });

        self.reservations.lock().insert(
            id.clone(),
            Reservation {
                from: from.clone(),
                to: to.clone(),
                protocol: protocol.to_string(),
                handler,
                is_client,
                expires,
                timer,
            },
        );

        (expires, id)
    }

    /// Take a reservation out of the table, cancelling its expiry.
    pub(crate) fn claim_reservation(&self, id: &str) -> Option<Reservation> {
        let reservation = self.reservations.lock().remove(id)?;
        reservation.timer.abort();
        log::debug!(
            "reservation claimed: id={:?}, client={}, expires={}",
            id,
            reservation.is_client,
            reservation.expires
        );
        Some(reservation)
    }

    /// A peer secured toward us; remember the connection the same way a
    /// locally dialed one would be cached. The port half of the key is the
    /// well-known one, since the peer has no reciprocal listener we know.
    pub(crate) fn cache_secured_peer(
        &self,
        peer: SocketAddr,
        from: &Address,
        to_domain: &Address,
        connection: Arc<Connection>,
    ) {
        self.secure_cache.cache_unrequested(
            SecureKey {
                host: peer.ip().to_string(),
                port: self.connect_port,
                from: from.clone(),
                to_domain: to_domain.domain.clone(),
                authorize: true,
            },
            connection,
        );
    }

    /// The whole conversation that learns a foreign domain's certificate
    /// for the first time: a fresh plain connection, IDENTIFY, validate,
    /// persist.
    pub(crate) async fn fetch_remote_certificate(
        self: &Arc<Self>,
        domain: &Address,
    ) -> Result<Certificate> {
        let (socket, target) = connect_first(&self.resolve_domain(domain).await?).await?;
        let local = socket.local_addr().ok();
        let conn = Connection::spawn(self, Box::new(socket), Some(target), local, true, false);

        let answer = conn.call(wire::identify(domain)).await;
        conn.close().await;

        let certificate = wire::parse_certificate(&answer?)?;
        if certificate.subject_common_name() != domain.to_string() {
            return Err(Error::Verify(format!(
                "{} claimed it was {} in identify response",
                certificate.subject_common_name(),
                domain
            )));
        }

        if certificate.issuer_common_name() != domain.to_string() {
            return Err(Error::Verify(format!(
                "self-signed {} claimed it was issued by {} in identify response",
                domain,
                certificate.issuer_common_name()
            )));
        }

        self.store
            .store_self_signed(&domain.domain, certificate.clone())?;
        log::info!(
            "learned domain certificate: domain={}, digest={}",
            domain,
            certificate.digest()
        );

        Ok(certificate)
    }

    async fn resolve_domain(&self, domain: &Address) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((domain.domain.as_str(), self.connect_port))
            .await?
            .collect();

        if addrs.is_empty() {
            return Err(Error::Connection(format!("unresolvable domain: {}", domain)));
        }

        Ok(addrs)
    }

    /// Dial or reuse the secure control connection between `from` and the
    /// domain half of `to`.
    pub(crate) async fn get_secure_connection(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        authorize: bool,
        identity_override: Option<Arc<PrivateIdentity>>,
    ) -> Result<Arc<Connection>> {
        let to_domain = to.domain_address();
        let addrs = self.resolve_domain(&to_domain).await?;
        let (identity, cache_from, authorize) =
            self.select_identity(from, &to_domain, identity_override, authorize)?;

        let key = SecureKey {
            host: addrs[0].ip().to_string(),
            port: addrs[0].port(),
            from: cache_from.clone(),
            to_domain: to_domain.domain.clone(),
            authorize,
        };

        let inner = self.clone();
        self.secure_cache
            .connect_cached(key, |conn| !conn.is_lost(), move || async move {
                let (socket, target) = connect_first(&addrs).await?;
                if let Err(e) = socket.set_nodelay(true) {
                    log::warn!("tcp socket set nodelay failed: err={}", e);
                }

                let local = socket.local_addr().ok();
                let conn =
                    Connection::spawn(&inner, Box::new(socket), Some(target), local, true, true);

                let foreign_authority = if authorize {
                    match inner.store.get_self_signed(&to_domain.domain) {
                        Some(certificate) => Some(certificate),
                        None => Some(inner.fetch_remote_certificate(&to_domain).await?),
                    }
                } else {
                    None
                };

                conn.secure(&cache_from, &to_domain, &identity, foreign_authority, authorize)
                    .await?;

                log::info!(
                    "secure connection established: from={}, to={}, authorize={}",
                    cache_from,
                    to_domain,
                    authorize
                );
                Ok(conn)
            })
            .await
    }

    /// Pick the private certificate to present: an explicit override, the
    /// anonymous identity, our authority for the caller's domain, the
    /// caller's own identity, or (a cluster speaking to itself) the target
    /// domain's authority.
    fn select_identity(
        &self,
        from: &Address,
        to_domain: &Address,
        identity_override: Option<Arc<PrivateIdentity>>,
        authorize: bool,
    ) -> Result<(Arc<PrivateIdentity>, Address, bool)> {
        if let Some(identity) = identity_override {
            log::debug!("using explicit private certificate: from={}", from);
            return Ok((identity, from.clone(), authorize));
        }

        if from.is_anonymous() {
            if from.resource.is_some() {
                return Err(Error::Verify(format!(
                    "no domain means anonymous: {}",
                    from
                )));
            }

            log::debug!("using anonymous certificate for anonymous user");
            return Ok((Arc::new(PrivateIdentity::anonymous()?), from.clone(), false));
        }

        let domain = from.domain_address();
        if let Some(identity) = self.store.get_private(&domain.to_string()) {
            log::debug!("domain on behalf of user: from={}", from);
            return Ok((identity, domain, authorize));
        }

        if let Some(identity) = self.store.get_private(&from.to_string()) {
            log::debug!("actual user: from={}", from);
            return Ok((identity, from.clone(), authorize));
        }

        if let Some(identity) = self.store.get_private(&to_domain.to_string()) {
            log::debug!("target domain certificate: from={}", from);
            return Ok((identity, to_domain.clone(), authorize));
        }

        Err(Error::Verify(format!(
            "we tried to secure a connection between {} and {}, \
             but we don't have any certificates that could be used",
            from, to_domain
        )))
    }
}

/// Dial the resolved addresses in order, first success winning.
async fn connect_first(addrs: &[SocketAddr]) -> Result<(TcpStream, SocketAddr)> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(socket) => return Ok((socket, *addr)),
            Err(e) => last = Some(e),
        }
    }

    Err(match last {
        Some(e) => e.into(),
        None => Error::Connection("no addresses to dial".to_string()),
    })
}

async fn overlay_accept(inner: Arc<ServiceInner>, listener: TcpListener) {
    let local_addr = listener.local_addr().ok();

    while let Ok((socket, addr)) = listener.accept().await {
        log::info!(
            "overlay socket accept: addr={:?}, interface={:?}",
            addr,
            local_addr
        );

        if let Err(e) = socket.set_nodelay(true) {
            log::error!("tcp socket set nodelay failed: addr={}, err={}", addr, e);
        }

        let local = socket.local_addr().ok();
        Connection::spawn(&inner, Box::new(socket), Some(addr), local, false, false);
    }

    log::error!("overlay server close: interface={:?}", local_addr);
}
