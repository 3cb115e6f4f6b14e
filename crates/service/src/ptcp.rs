//! Pseudo-TCP dispatcher seam.
//!
//! The reliable-over-UDP transport is an external collaborator; the overlay
//! core only needs the three operations below plus shutdown. An
//! implementation is expected to hand back ordinary byte streams.

use crate::stream::BoxStream;

use std::{io, net::SocketAddr};

use async_trait::async_trait;

#[async_trait]
pub trait PtcpDispatcher: Send + Sync {
    /// Punch a NAT hole by sending a throwaway packet toward `remote`,
    /// returning the local UDP port now associated with it.
    async fn seed_nat(&self, remote: SocketAddr) -> io::Result<u16>;

    /// Bind a fresh local UDP port without sending anything.
    async fn bind_new_port(&self) -> io::Result<u16>;

    /// Establish a reliable stream to `remote`.
    async fn connect(&self, remote: SocketAddr) -> io::Result<BoxStream>;

    /// Tear down every underlying connection and port.
    async fn halt(&self);
}

pub mod testing {
    //! An in-memory dispatcher for exercising the candidate machinery
    //! without a UDP stack: seeded ports count up, connects are refused.

    use super::*;

    use std::sync::atomic::{AtomicU16, Ordering};

    #[derive(Default)]
    pub struct StubDispatcher {
        next_port: AtomicU16,
    }

    impl StubDispatcher {
        pub fn new() -> Self {
            Self {
                next_port: AtomicU16::new(40000),
            }
        }
    }

    #[async_trait]
    impl PtcpDispatcher for StubDispatcher {
        async fn seed_nat(&self, _remote: SocketAddr) -> io::Result<u16> {
            Ok(self.next_port.fetch_add(1, Ordering::SeqCst))
        }

        async fn bind_new_port(&self) -> io::Result<u16> {
            Ok(self.next_port.fetch_add(1, Ordering::SeqCst))
        }

        async fn connect(&self, remote: SocketAddr) -> io::Result<BoxStream> {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no pseudo-tcp stack: remote={}", remote),
            ))
        }

        async fn halt(&self) {}
    }
}
