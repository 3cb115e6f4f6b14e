//! Virtual channels.
//!
//! A virtual channel presents an ordinary byte stream to the application
//! while framing its bytes as WRITE commands on the control connection that
//! owns it, and tearing down with CLOSE. Inbound WRITE/CLOSE frames are
//! demuxed by channel id into a per-channel event queue.
//!
//! Backpressure is layered: the connection's outgoing queue bounds every
//! channel writing through it, and each channel's event queue plus its
//! in-memory pipe bound that channel's inbound side independently.

use crate::{
    connection::Connection,
    stream::{ChannelInfo, OverlayStream},
    wire,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

/// Inbound frames queued toward one channel.
pub(crate) enum ChannelEvent {
    Data(Bytes),
    Closed,
}

/// Queue depth of inbound events per channel.
const EVENT_QUEUE: usize = 32;

/// Size of the in-memory pipe between the pumps and the application.
const PIPE_SIZE: usize = 64 * 1024;

/// Largest body of a single WRITE frame.
const WRITE_CHUNK: usize = 32 * 1024;

/// Open a channel under `id` on `conn` and hand back the application side.
///
/// The channel is live in the connection's demux map before this returns,
/// so a peer that writes immediately after its answer cannot race the
/// registration.
pub(crate) fn open(conn: Arc<Connection>, info: ChannelInfo, id: String) -> OverlayStream {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (app, pipe) = tokio::io::duplex(PIPE_SIZE);

    conn.register_channel(&id, events_tx);
    tokio::spawn(pump(conn, id, pipe, events_rx));

    OverlayStream::new(info, Box::new(app))
}

/// Shuttle bytes between the application pipe and the control connection
/// until either side lets go.
async fn pump(
    conn: Arc<Connection>,
    id: String,
    pipe: DuplexStream,
    events: mpsc::Receiver<ChannelEvent>,
) {
    let (mut from_app, to_app) = tokio::io::split(pipe);
    let mut closed = conn.closed_watch();

    let mut inbound = tokio::spawn(deliver(id.clone(), to_app, events));

    let mut buf = vec![0u8; WRITE_CHUNK];
    loop {
        tokio::select! {
            read = from_app.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    // The application is done writing; tell the peer, and
                    // only tear down locally once the ack (or a failure)
                    // comes back.
                    if conn.channel_registered(&id) {
                        let _ = conn.call(wire::close(&id)).await;
                    }
                    break;
                }
                Ok(n) => {
                    let frame = wire::write(&id, Bytes::copy_from_slice(&buf[..n]));
                    if conn.send_uncorrelated(frame).await.is_err() {
                        break;
                    }
                }
            },
            // The inbound side finishing means the peer closed the channel
            // or the connection is gone.
            _ = &mut inbound => break,
            _ = closed.changed() => break,
        }
    }

    conn.unregister_channel(&id);
    inbound.abort();
}

/// Write inbound channel events into the application pipe.
async fn deliver(
    id: String,
    mut to_app: tokio::io::WriteHalf<DuplexStream>,
    mut events: mpsc::Receiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(data) => {
                if to_app.write_all(&data).await.is_err() {
                    break;
                }
            }
            ChannelEvent::Closed => break,
        }
    }

    log::debug!("virtual channel inbound side done: id={:?}", id);
    let _ = to_app.shutdown().await;
}
