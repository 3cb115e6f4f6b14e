//! The direct-connect splice listener.
//!
//! Peers that were handed a `tcp@` or `ptcp@` method dial this port and
//! write exactly one line, `Q2Q <id>\r\n`, naming a reservation made by an
//! earlier inbound exchange. Everything after the line belongs to the
//! reserved sub-protocol; a bad command word or an unknown id closes the
//! socket immediately.

use crate::{
    ServiceInner,
    stream::{ChannelInfo, OverlayStream, Rewind},
};

use std::{io, sync::Arc};

use bytes::{Buf, BytesMut};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};

/// A splice line longer than this is nobody's channel id.
const MAX_LINE: usize = 512;

pub(crate) async fn run(service: Arc<ServiceInner>, listener: TcpListener) {
    let local_addr = listener.local_addr().ok();

    while let Ok((socket, addr)) = listener.accept().await {
        log::debug!("splice socket accept: addr={:?}", addr);

        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(service, socket).await {
                log::debug!("splice handshake failed: addr={:?}, err={}", addr, e);
            }
        });
    }

    log::error!("splice listener close: interface={:?}", local_addr);
}

async fn serve(service: Arc<ServiceInner>, mut socket: TcpStream) -> io::Result<()> {
    let mut buf = BytesMut::new();
    let line_end = loop {
        if let Some(at) = buf.windows(2).position(|win| win == b"\r\n") {
            break at;
        }

        if buf.len() > MAX_LINE {
            return Err(refused("splice line too long"));
        }

        if socket.read_buf(&mut buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    };

    let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| refused("splice line not utf-8"))?;
    let (word, id) = line.split_once(' ').ok_or_else(|| refused("splice line without an id"))?;
    if word != "Q2Q" {
        return Err(refused("bad splice command word"));
    }

    let waiter = match service.claim_reservation(id) {
        Some(waiter) => waiter,
        None => return Err(refused("unknown connection identifier")),
    };

    let mut rest = buf;
    rest.advance(line_end + 2);

    let info = ChannelInfo {
        host: waiter.to.clone(),
        peer: waiter.from.clone(),
        protocol: waiter.protocol.clone(),
    };
    let stream = OverlayStream::new(info, Box::new(Rewind::new(rest.freeze(), socket)));

    if let Err(e) = waiter.handler.handle(stream).await {
        log::warn!("spliced channel handler failed: err={}", e);
    }

    Ok(())
}

fn refused(why: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, why.to_string())
}
