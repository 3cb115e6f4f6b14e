//! Certificate storage.
//!
//! A store holds two sides: the local side maps subjects we can speak for to
//! private identities, the remote side maps domain names to self-signed
//! certificates we have learned from peers. Alongside both sits the shared
//! secret table consulted when signing certificate requests.

use crate::{
    error::{Error, Result},
    identity::{Certificate, PrivateIdentity},
};

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use ahash::{HashMap, HashMapExt};
use md5::{Digest, Md5};
use parking_lot::Mutex;

pub trait CertStore: Send + Sync {
    /// A learned self-signed certificate for `domain`, if any.
    fn get_self_signed(&self, domain: &str) -> Option<Certificate>;

    /// Persist a certificate learned from a peer.
    fn store_self_signed(&self, domain: &str, certificate: Certificate) -> Result<()>;

    /// The private identity this node holds for `subject`.
    fn get_private(&self, subject: &str) -> Option<Arc<PrivateIdentity>>;

    fn add_private(&self, subject: &str, identity: PrivateIdentity) -> Result<()>;

    fn add_user(&self, domain: &str, user: &str, secret: &str);

    fn check_user(&self, domain: &str, user: &str, secret: &str) -> Result<()>;

    /// Serial numbers are derived from the first 4 bytes of the MD5 of the
    /// name, interpreted as a big-endian signed int, absolute value.
    fn gen_serial(&self, name: &str) -> u64 {
        let mut hasher = Md5::new();
        hasher.update(name.as_bytes());
        let digest = hasher.finalize();
        let word = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        word.unsigned_abs() as u64
    }
}

/// In-memory store, the default for tests and transient nodes.
#[derive(Default)]
pub struct MemoryCertStore {
    remote: Mutex<HashMap<String, Certificate>>,
    local: Mutex<HashMap<String, Arc<PrivateIdentity>>>,
    users: Mutex<HashMap<(String, String), String>>,
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertStore for MemoryCertStore {
    fn get_self_signed(&self, domain: &str) -> Option<Certificate> {
        self.remote.lock().get(domain).cloned()
    }

    fn store_self_signed(&self, domain: &str, certificate: Certificate) -> Result<()> {
        self.remote.lock().insert(domain.to_string(), certificate);
        Ok(())
    }

    fn get_private(&self, subject: &str) -> Option<Arc<PrivateIdentity>> {
        self.local.lock().get(subject).cloned()
    }

    fn add_private(&self, subject: &str, identity: PrivateIdentity) -> Result<()> {
        self.local
            .lock()
            .insert(subject.to_string(), Arc::new(identity));
        Ok(())
    }

    fn add_user(&self, domain: &str, user: &str, secret: &str) {
        self.users
            .lock()
            .insert((domain.to_string(), user.to_string()), secret.to_string());
    }

    fn check_user(&self, domain: &str, user: &str, secret: &str) -> Result<()> {
        match self
            .users
            .lock()
            .get(&(domain.to_string(), user.to_string()))
        {
            Some(known) if known == secret => Ok(()),
            _ => Err(Error::NoSuchUser),
        }
    }
}

/// Directory-backed store.
///
/// Learned certificates live under `<root>/public/<domain>.pem`, private
/// identities under `<root>/private/<subject>.pem` as concatenated
/// certificate and key PEM blocks. The user/secret table is not persisted;
/// it is seeded from configuration at startup.
pub struct DirCertStore {
    public: PathBuf,
    private: PathBuf,
    users: Mutex<HashMap<(String, String), String>>,
}

impl DirCertStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let public = root.as_ref().join("public");
        let private = root.as_ref().join("private");
        fs::create_dir_all(&public)?;
        fs::create_dir_all(&private)?;

        Ok(Self {
            public,
            private,
            users: Mutex::new(HashMap::new()),
        })
    }

    fn read(dir: &Path, name: &str) -> Option<String> {
        match fs::read_to_string(dir.join(format!("{}.pem", name))) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("certificate store read failed: name={:?}, err={}", name, e);
                None
            }
        }
    }
}

impl CertStore for DirCertStore {
    fn get_self_signed(&self, domain: &str) -> Option<Certificate> {
        let pem = Self::read(&self.public, domain)?;
        Certificate::from_pem(&pem).ok()
    }

    fn store_self_signed(&self, domain: &str, certificate: Certificate) -> Result<()> {
        fs::write(
            self.public.join(format!("{}.pem", domain)),
            certificate.to_pem(),
        )?;
        Ok(())
    }

    fn get_private(&self, subject: &str) -> Option<Arc<PrivateIdentity>> {
        let pem = Self::read(&self.private, subject)?;
        PrivateIdentity::from_pem(&pem).ok().map(Arc::new)
    }

    fn add_private(&self, subject: &str, identity: PrivateIdentity) -> Result<()> {
        fs::write(
            self.private.join(format!("{}.pem", subject)),
            identity.to_pem(),
        )?;
        Ok(())
    }

    fn add_user(&self, domain: &str, user: &str, secret: &str) {
        self.users
            .lock()
            .insert((domain.to_string(), user.to_string()), secret.to_string());
    }

    fn check_user(&self, domain: &str, user: &str, secret: &str) -> Result<()> {
        match self
            .users
            .lock()
            .get(&(domain.to_string(), user.to_string()))
        {
            Some(known) if known == secret => Ok(()),
            _ => Err(Error::NoSuchUser),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_are_stable_and_positive() {
        let store = MemoryCertStore::new();
        let a = store.gen_serial("example.com");
        assert_eq!(a, store.gen_serial("example.com"));
        assert_ne!(a, store.gen_serial("other.org"));
    }

    #[test]
    fn unknown_users_are_rejected() {
        let store = MemoryCertStore::new();
        store.add_user("example.com", "bob", "sekrit");

        assert!(store.check_user("example.com", "bob", "sekrit").is_ok());
        assert!(matches!(
            store.check_user("example.com", "bob", "wrong"),
            Err(Error::NoSuchUser)
        ));
        assert!(matches!(
            store.check_user("example.com", "mallory", "sekrit"),
            Err(Error::NoSuchUser)
        ));
    }

    #[test]
    fn directory_store_round_trips_certificates() -> anyhow::Result<()> {
        let root = std::env::temp_dir().join(format!("q2q-store-{}", std::process::id()));
        let store = DirCertStore::open(&root)?;

        let identity = PrivateIdentity::self_signed("example.com", 7)?;
        let cert = identity.certificate().clone();
        store.add_private("example.com", identity)?;
        store.store_self_signed("other.org", cert.clone())?;

        assert_eq!(
            store
                .get_private("example.com")
                .expect("private identity")
                .certificate()
                .subject_common_name(),
            "example.com"
        );
        assert_eq!(store.get_self_signed("other.org"), Some(cert));
        assert_eq!(store.get_self_signed("missing.example"), None);

        fs::remove_dir_all(&root)?;
        Ok(())
    }
}
