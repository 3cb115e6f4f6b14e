use std::{collections::HashMap, net::IpAddr, sync::Arc};

use anyhow::Result;
use q2q_server::{
    config::{Config, Node},
    server_main,
};
use service::{Address, Error, MemoryCertStore, Service, ServiceOptions, store::CertStore};

fn test_config(certs: std::path::PathBuf) -> Config {
    Config {
        node: Node {
            domains: vec!["localhost".to_string()],
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            splice_port: None,
            public_ip: None,
            certs,
        },
        auth: HashMap::from([("carol@localhost".to_string(), "pw".to_string())]),
        ..Config::default()
    }
}

#[tokio::test]
async fn a_configured_node_signs_its_users() -> Result<()> {
    let certs = std::env::temp_dir().join(format!("q2q-node-{}", std::process::id()));
    let overlay = server_main(Arc::new(test_config(certs.clone()))).await?;
    let port = overlay.overlay_addr().expect("overlay bound").port();

    // The authority certificate was minted and persisted.
    assert!(certs.join("private").join("localhost.pem").is_file());

    let client_store = Arc::new(MemoryCertStore::new());
    let client = Service::new(ServiceOptions {
        store: client_store.clone(),
        bind: IpAddr::from([127u8, 0, 0, 1]),
        overlay_port: None,
        connect_port: port,
        ..ServiceOptions::default()
    });

    let carol = Address::user("carol", "localhost");
    client
        .request_certificate_for_address(&carol, b"pw")
        .await?;

    let identity = client_store
        .get_private("carol@localhost")
        .expect("issued identity");
    assert_eq!(identity.certificate().issuer_common_name(), "localhost");

    // Nothing serves any protocol on a bare node.
    let refused = client
        .connect_q2q(&Address::anonymous(), &carol, "echo")
        .await;
    assert!(matches!(refused, Err(Error::NotFound(_))));

    client.stop().await;
    overlay.stop().await;
    std::fs::remove_dir_all(&certs).ok();
    Ok(())
}
