//! Stream (TCP) link.
//!
//! The read half belongs to the receive loop; the write half sits behind an
//! async mutex so whole frames from concurrent senders never interleave.
//! Releasing the link cancels any send still waiting on a peer that stopped
//! reading, so teardown never waits on the remote side.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use super::connection::{Connection, DropReason};
use crate::core::{NetError, NetResult};
use crate::transport::read_frame;

pub(crate) struct StreamLink {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Read half of an accepted socket, waiting for `start`.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Flips to `true` once on release.
    closed: watch::Sender<bool>,
}

impl StreamLink {
    pub(crate) fn idle() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            closed: watch::Sender::new(false),
        }
    }

    pub(crate) fn accepted(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            closed: watch::Sender::new(false),
        }
    }

    /// Connect to `peer` and keep the write half.
    pub(crate) async fn connect(&self, peer: SocketAddr) -> NetResult<OwnedReadHalf> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() {
            return Err(NetError::AlreadyConnected);
        }

        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        let (reader, write_half) = stream.into_split();
        *writer = Some(write_half);
        Ok(reader)
    }

    pub(crate) fn take_reader(&self) -> Option<OwnedReadHalf> {
        self.reader.lock().take()
    }

    /// Write one frame. Fails with `NotConnected` if the link is released
    /// while the write is queued or blocked.
    pub(crate) async fn send(&self, wire: &[u8]) -> NetResult<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(NetError::NotConnected);
        }

        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = wait_closed(&mut closed) => return Err(NetError::NotConnected),
        };
        let writer = writer.as_mut().ok_or(NetError::NotConnected)?;

        // An abandoned write leaves a partial frame; the link is closing anyway.
        tokio::select! {
            written = writer.write_all(wire) => written?,
            _ = wait_closed(&mut closed) => return Err(NetError::NotConnected),
        }
        Ok(())
    }

    pub(crate) async fn release(&self) {
        self.closed.send_replace(true);
        self.reader.lock().take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Best effort FIN; the socket closes on drop regardless.
            let _ = writer.shutdown().await;
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Read frames until the peer closes or sends something unparseable.
///
/// A bad length prefix leaves the byte stream unsynchronized, so any framing
/// error ends the connection.
pub(crate) async fn receive_loop(connection: Connection, mut reader: OwnedReadHalf) -> DropReason {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => return DropReason::Failed(e),
        };

        tracing::trace!(tag = frame.tag, len = frame.payload.len(), "frame received");
        if let Some(event) = connection.route(frame) {
            connection.publish(event).await;
        }
    }
}
