//! Relay packet connection
//!
//! A virtual UDP socket identified by a 16-bit connection id, multiplexed
//! with its siblings over one shared [`MuxConnection`].
//!
//! - Outbound: each datagram is framed as a [`Packet`] and sent either on a
//!   fresh unidirectional stream (`quic` mode) or as an unreliable datagram
//!   with fragmented-stream fallback (`native` mode).
//! - Inbound: framed packets are read from this socket's own input stream
//!   and fed through a [`Defragmenter`] until a whole datagram is available.
//! - Close: runs once, tells the peer to dissociate the connection id, then
//!   runs the owner's hooks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::common::{Address, Result};
use crate::config::{RelayConfig, UdpRelayMode};
use crate::error::Error;
use crate::metrics;
use crate::transport::{MuxConnection, RecvStream};

use super::command::Dissociate;
use super::defrag::{Defragmenter, DEFAULT_MAX_PENDING, DEFAULT_REASSEMBLY_TIMEOUT};
use super::packet::{Packet, MAX_PACKET_SIZE};

/// Read buffer growth step for the inbound stream
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Called after every write and once at close with the transport and the
/// operation's error, if any
pub type TransportHook = Arc<dyn Fn(&Arc<dyn MuxConnection>, Option<&Error>) + Send + Sync>;

/// Called once at the end of close
pub type CloseHook = Box<dyn FnOnce() + Send>;

/// Inbound side: the framed packet stream and its reassembly state
struct ReadHalf {
    reader: RecvStream,
    buf: BytesMut,
    defrag: Defragmenter,
}

impl ReadHalf {
    /// Read the next complete datagram.
    ///
    /// Cancel safe: bytes already read stay in `buf` and reassembly state
    /// stays in `defrag`, so a dropped call loses nothing.
    async fn next_datagram(&mut self) -> Result<Packet> {
        loop {
            let packet = self.next_packet().await?;
            trace!(
                "Relay read: conn {} packet {} fragment {}/{} ({} bytes)",
                packet.conn_id,
                packet.packet_id,
                packet.frag_index + 1,
                packet.frag_total,
                packet.size()
            );
            if let Some(packet) = self.defrag.feed(packet) {
                metrics::PACKETS_RECEIVED.inc();
                return Ok(packet);
            }
        }
    }

    async fn next_packet(&mut self) -> Result<Packet> {
        loop {
            if let Some(len) = Packet::frame_len(&self.buf)? {
                if self.buf.len() >= len {
                    let mut frame = self.buf.split_to(len).freeze();
                    return Packet::decode(&mut frame);
                }
            }

            if self.buf.capacity() - self.buf.len() < READ_BUFFER_SIZE / 4 {
                self.buf.reserve(READ_BUFFER_SIZE);
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Err(if self.buf.is_empty() {
                    Error::ConnectionClosed
                } else {
                    Error::TruncatedPacket
                });
            }
        }
    }
}

struct Inner {
    conn_id: u16,
    target: Option<String>,
    quic_conn: Arc<dyn MuxConnection>,
    read_half: tokio::sync::Mutex<Option<ReadHalf>>,

    udp_relay_mode: UdpRelayMode,
    max_udp_relay_packet_size: usize,

    write_closed: Option<Arc<AtomicBool>>,
    closed: AtomicBool,
    close_notify: Notify,
    close_result: watch::Sender<Option<Result<()>>>,

    rng: Mutex<StdRng>,
    read_deadline: Mutex<Option<Instant>>,

    on_transport_result: Option<TransportHook>,
    on_close: Mutex<Option<CloseHook>>,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_packet_id(&self) -> u16 {
        self.rng.lock().gen()
    }

    fn report(&self, err: Option<&Error>) {
        if let Some(hook) = &self.on_transport_result {
            hook(&self.quic_conn, err);
        }
    }

    /// Mark the socket closed and start teardown on its own task.
    ///
    /// Only the first call does anything. Teardown runs to completion even
    /// if every caller waiting on it is dropped.
    fn start_close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_notify.notify_waiters();

        let inner = self.clone();
        tokio::spawn(async move {
            let teardown = tokio::spawn({
                let inner = inner.clone();
                async move { inner.teardown().await }
            });
            let result = teardown
                .await
                .unwrap_or_else(|e| Err(Error::Transport(format!("close task failed: {}", e))));
            inner.close_result.send_replace(Some(result));
        });
    }

    async fn close(self: &Arc<Self>) -> Result<()> {
        self.start_close();

        let mut done = self.close_result.subscribe();
        let state = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        (*state).clone().unwrap_or(Err(Error::ConnectionClosed))
    }

    async fn teardown(&self) -> Result<()> {
        let read_half = self.read_half.lock().await.take();
        let result = match read_half {
            Some(read_half) => {
                if !read_half.defrag.is_empty() {
                    debug!(
                        "Relay close: conn {} dropping {} incomplete reassemblies",
                        self.conn_id,
                        read_half.defrag.len()
                    );
                }
                drop(read_half);
                self.send_dissociate().await
            }
            None => Ok(()),
        };

        if let Err(e) = &result {
            warn!("Relay close: conn {} dissociate failed: {}", self.conn_id, e);
        }

        self.report(result.as_ref().err());
        let on_close = self.on_close.lock().take();
        if let Some(on_close) = on_close {
            on_close();
        }

        debug!("Relay close: conn {} closed", self.conn_id);
        result
    }

    async fn send_dissociate(&self) -> Result<()> {
        self.write_uni_stream(Dissociate::new(self.conn_id).to_bytes())
            .await?;
        metrics::DISSOCIATES_SENT.inc();
        debug!("Relay close: dissociate sent for conn {}", self.conn_id);
        Ok(())
    }

    async fn write_uni_stream(&self, data: Bytes) -> Result<()> {
        let mut stream = self.quic_conn.open_uni_stream().await?;
        stream.write_all(&data).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn relay(&self, payload: &[u8], address: Address) -> Result<usize> {
        let packet = Packet::new(
            self.conn_id,
            self.next_packet_id(),
            address,
            Bytes::copy_from_slice(payload),
        );

        match self.udp_relay_mode {
            UdpRelayMode::Quic => {
                self.write_uni_stream(packet.to_bytes()?).await?;
            }
            UdpRelayMode::Native => {
                if payload.len() > self.max_udp_relay_packet_size {
                    self.frag_write(&packet, self.max_udp_relay_packet_size)
                        .await?;
                }

                match self.quic_conn.send_datagram(packet.to_bytes()?).await {
                    Ok(()) => {}
                    Err(Error::DatagramTooLarge { max }) => {
                        debug!(
                            "Relay write: conn {} datagram of {} bytes over transport limit {}, fragmenting",
                            self.conn_id,
                            packet.encoded_len(),
                            max
                        );
                        metrics::DATAGRAM_FALLBACKS.inc();
                        self.frag_write(&packet, max).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        metrics::PACKETS_SENT
            .with_label_values(&[self.udp_relay_mode.as_str()])
            .inc();
        metrics::BYTES_SENT.inc_by(payload.len() as u64);
        Ok(payload.len())
    }

    /// Send `packet` as fragments of at most `max_total_size` bytes, each on
    /// its own unidirectional stream
    async fn frag_write(&self, packet: &Packet, max_total_size: usize) -> Result<()> {
        let fragments = packet.fragments(self.next_packet_id(), max_total_size)?;
        trace!(
            "Relay write: conn {} sending {} bytes as {} fragments",
            self.conn_id,
            packet.size(),
            fragments.len()
        );

        for fragment in &fragments {
            self.write_uni_stream(fragment.to_bytes()?).await?;
            metrics::FRAGMENTS_SENT.inc();
        }
        Ok(())
    }
}

/// A virtual UDP socket over a shared multiplexed connection.
///
/// Cheap to clone; clones share the same socket. Writes may run
/// concurrently. Reads are serialized internally, so concurrent readers
/// take turns rather than interleave.
#[derive(Clone)]
pub struct RelayPacketConn {
    inner: Arc<Inner>,
}

impl RelayPacketConn {
    pub fn builder(conn_id: u16, quic_conn: Arc<dyn MuxConnection>) -> RelayPacketConnBuilder {
        RelayPacketConnBuilder::new(conn_id, quic_conn)
    }

    pub fn conn_id(&self) -> u16 {
        self.inner.conn_id
    }

    pub fn udp_relay_mode(&self) -> UdpRelayMode {
        self.inner.udp_relay_mode
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.inner.quic_conn.local_addr()
    }

    /// Send `payload` to `target` (`host:port`). Returns the payload length.
    pub async fn write_to(&self, payload: &[u8], target: &str) -> Result<usize> {
        self.check_writable(payload)?;

        let result = match Address::parse(target) {
            Ok(address) => self.inner.relay(payload, address).await,
            Err(e) => Err(e),
        };
        self.inner.report(result.as_ref().err());
        result
    }

    /// Like [`write_to`](Self::write_to) for an already parsed destination
    pub async fn write_to_addr(&self, payload: &[u8], target: &Address) -> Result<usize> {
        self.check_writable(payload)?;

        let result = self.inner.relay(payload, target.clone()).await;
        self.inner.report(result.as_ref().err());
        result
    }

    /// Stream-style write to the configured target
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        let target = self.inner.target.as_deref().unwrap_or_default();
        self.write_to(payload, target).await
    }

    fn check_writable(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(Error::MessageTooLarge(payload.len()));
        }
        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if let Some(write_closed) = &self.inner.write_closed {
            if write_closed.load(Ordering::Acquire) {
                debug!(
                    "Relay write: conn {} write side disabled, closing",
                    self.inner.conn_id
                );
                self.inner.start_close();
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Receive the next datagram without copying it.
    ///
    /// Returns the payload and the address it came from. Dropping the
    /// returned `Bytes` releases the buffer.
    pub async fn wait_read_from(&self) -> Result<(Bytes, Address)> {
        let closed = self.inner.close_notify.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();

        if self.inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let deadline = *self.inner.read_deadline.lock();
        let read = async {
            let mut guard = self.inner.read_half.lock().await;
            let read_half = guard.as_mut().ok_or(Error::ConnectionClosed)?;
            match deadline {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    tokio::time::timeout_at(deadline, read_half.next_datagram())
                        .await
                        .map_err(|_| Error::Timeout)?
                }
                None => read_half.next_datagram().await,
            }
        };

        let packet = tokio::select! {
            _ = &mut closed => return Err(Error::ConnectionClosed),
            result = read => result?,
        };

        let address = packet.address.unwrap_or_else(Address::unspecified);
        Ok((packet.data, address))
    }

    /// Receive the next datagram into `buf`, truncating it if `buf` is short
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let (data, address) = self.wait_read_from().await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, address))
    }

    /// Stream-style read, discarding the source address
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.read_from(buf).await?;
        Ok(n)
    }

    /// Bound every subsequent read; `None` clears the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        *self.inner.read_deadline.lock() = deadline;
        Ok(())
    }

    /// Write deadlines are not supported; accepted and ignored.
    pub fn set_write_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    /// Combined deadlines are not supported; accepted and ignored.
    pub fn set_deadline(&self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    /// Close the socket. Runs once; every call returns the first outcome.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    #[cfg(test)]
    async fn frag_write(&self, packet: &Packet, max_total_size: usize) -> Result<()> {
        self.inner.frag_write(packet, max_total_size).await
    }
}

/// Builder for [`RelayPacketConn`]
pub struct RelayPacketConnBuilder {
    conn_id: u16,
    quic_conn: Arc<dyn MuxConnection>,
    reader: Option<RecvStream>,
    target: Option<String>,
    udp_relay_mode: UdpRelayMode,
    max_udp_relay_packet_size: usize,
    reassembly_timeout: Duration,
    max_pending_reassemblies: usize,
    write_closed: Option<Arc<AtomicBool>>,
    rng: Option<StdRng>,
    on_transport_result: Option<TransportHook>,
    on_close: Option<CloseHook>,
}

impl RelayPacketConnBuilder {
    fn new(conn_id: u16, quic_conn: Arc<dyn MuxConnection>) -> Self {
        let defaults = RelayConfig::default();
        Self {
            conn_id,
            quic_conn,
            reader: None,
            target: None,
            udp_relay_mode: defaults.udp_relay_mode,
            max_udp_relay_packet_size: defaults.max_udp_relay_packet_size,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_pending_reassemblies: DEFAULT_MAX_PENDING,
            write_closed: None,
            rng: None,
            on_transport_result: None,
            on_close: None,
        }
    }

    /// Apply relay mode, sizes, target and reassembly limits from `config`
    pub fn with_config(mut self, config: &RelayConfig) -> Self {
        self.udp_relay_mode = config.udp_relay_mode;
        self.max_udp_relay_packet_size = config.max_udp_relay_packet_size;
        self.target = config.target.clone();
        self.reassembly_timeout = config.reassembly_timeout();
        self.max_pending_reassemblies = config.max_pending_reassemblies;
        self
    }

    /// Stream the peer writes this socket's packets to
    pub fn with_reader<R>(mut self, reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_relay_mode(mut self, mode: UdpRelayMode) -> Self {
        self.udp_relay_mode = mode;
        self
    }

    pub fn with_max_udp_relay_packet_size(mut self, size: usize) -> Self {
        self.max_udp_relay_packet_size = size;
        self
    }

    pub fn with_reassembly_limits(mut self, idle_timeout: Duration, max_pending: usize) -> Self {
        self.reassembly_timeout = idle_timeout;
        self.max_pending_reassemblies = max_pending;
        self
    }

    /// Flag the owner sets when the peer stops accepting writes
    pub fn with_write_closed(mut self, flag: Arc<AtomicBool>) -> Self {
        self.write_closed = Some(flag);
        self
    }

    /// Packet id source; defaults to an entropy-seeded generator
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn on_transport_result<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<dyn MuxConnection>, Option<&Error>) + Send + Sync + 'static,
    {
        self.on_transport_result = Some(Arc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> RelayPacketConn {
        let read_half = self.reader.map(|reader| ReadHalf {
            reader,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            defrag: Defragmenter::with_limits(
                self.reassembly_timeout,
                self.max_pending_reassemblies,
            ),
        });

        debug!(
            "Relay open: conn {} mode {} max packet {}",
            self.conn_id, self.udp_relay_mode, self.max_udp_relay_packet_size
        );

        RelayPacketConn {
            inner: Arc::new(Inner {
                conn_id: self.conn_id,
                target: self.target,
                quic_conn: self.quic_conn,
                read_half: tokio::sync::Mutex::new(read_half),
                udp_relay_mode: self.udp_relay_mode,
                max_udp_relay_packet_size: self.max_udp_relay_packet_size,
                write_closed: self.write_closed,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                close_result: watch::channel(None).0,
                rng: Mutex::new(self.rng.unwrap_or_else(StdRng::from_entropy)),
                read_deadline: Mutex::new(None),
                on_transport_result: self.on_transport_result,
                on_close: Mutex::new(self.on_close),
            }),
        }
    }
}
