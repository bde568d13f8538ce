//! In-memory multiplexed connection
//!
//! Records every finished unidirectional stream and every datagram instead
//! of sending them anywhere. Useful as a loopback and in tests.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::common::{Address, Result};
use crate::error::Error;

use super::{MuxConnection, SendStream};

#[derive(Default)]
struct MemoryState {
    opened: usize,
    streams: Vec<Bytes>,
    datagrams: Vec<Bytes>,
    fail_streams: bool,
}

/// Multiplexed connection that keeps everything it is asked to send
pub struct MemoryConnection {
    local: Address,
    max_datagram: Option<usize>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    /// Create a connection accepting datagrams up to `max_datagram` bytes
    /// (`None` rejects every datagram with a zero maximum)
    pub fn new(max_datagram: Option<usize>) -> Self {
        Self {
            local: Address::unspecified(),
            max_datagram,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn with_local_addr(mut self, local: Address) -> Self {
        self.local = local;
        self
    }

    /// Make every subsequent `open_uni_stream` fail
    pub fn set_fail_streams(&self, fail: bool) {
        self.state.lock().fail_streams = fail;
    }

    /// Number of unidirectional streams opened so far
    pub fn opened_streams(&self) -> usize {
        self.state.lock().opened
    }

    /// Contents of every stream that has been shut down, in finish order
    pub fn streams(&self) -> Vec<Bytes> {
        self.state.lock().streams.clone()
    }

    /// Every datagram accepted so far
    pub fn datagrams(&self) -> Vec<Bytes> {
        self.state.lock().datagrams.clone()
    }
}

#[async_trait]
impl MuxConnection for MemoryConnection {
    async fn open_uni_stream(&self) -> Result<SendStream> {
        let mut state = self.state.lock();
        if state.fail_streams {
            return Err(Error::Transport("stream limit reached".into()));
        }
        state.opened += 1;

        Ok(Box::new(MemorySendStream {
            buf: Vec::new(),
            finished: false,
            state: self.state.clone(),
        }))
    }

    async fn send_datagram(&self, data: Bytes) -> Result<()> {
        let max = self.max_datagram.unwrap_or(0);
        if data.len() > max {
            return Err(Error::DatagramTooLarge { max });
        }
        self.state.lock().datagrams.push(data);
        Ok(())
    }

    fn local_addr(&self) -> Result<Address> {
        Ok(self.local.clone())
    }
}

struct MemorySendStream {
    buf: Vec<u8>,
    finished: bool,
    state: Arc<Mutex<MemoryState>>,
}

impl AsyncWrite for MemorySendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream already finished",
            )));
        }
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.finished {
            self.finished = true;
            let data = Bytes::from(std::mem::take(&mut self.buf));
            self.state.lock().streams.push(data);
        }
        Poll::Ready(Ok(()))
    }
}
