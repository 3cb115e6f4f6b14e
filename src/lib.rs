pub mod config;

use std::sync::Arc;

use anyhow::ensure;
use config::Config;
use service::{Address, CertStore, DirCertStore, PrivateIdentity, Service, ServiceOptions};

/// Build and start an overlay node from its configuration.
///
/// Integration tests use this instead of the binary: it wires the
/// directory-backed certificate store, mints authority certificates for
/// every configured domain that lacks one, seeds static user secrets, and
/// returns the running service.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<Service> {
    let store = Arc::new(DirCertStore::open(&config.node.certs)?);

    for domain in &config.node.domains {
        ensure!(
            !domain.contains('@'),
            "domains are bare names: {:?}",
            domain
        );

        if store.get_private(domain).is_none() {
            let serial = store.gen_serial(domain);
            store.add_private(domain, PrivateIdentity::self_signed(domain, serial)?)?;
            log::info!("minted authority certificate: domain={:?}", domain);
        }
    }

    for (subject, secret) in &config.auth {
        let address = Address::parse_str(subject);
        match &address.resource {
            Some(user) => store.add_user(&address.domain, user, secret),
            None => log::warn!("auth entry without a user part ignored: subject={:?}", subject),
        }
    }

    let overlay = Service::new(ServiceOptions {
        store: store.clone(),
        bind: config.node.bind,
        overlay_port: Some(config.node.port),
        splice_port: config.node.splice_port,
        public_ip: config.node.public_ip,
        ..ServiceOptions::default()
    });

    overlay.start().await?;
    Ok(overlay)
}
