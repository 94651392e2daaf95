//! One data-plane connection and its framed halves.
//!
//! A [`Link`] owns a single TLS (or TCP) stream. Many tasks may `send`
//! concurrently; the write half is guarded by a mutex held for exactly one
//! frame, so a frame is never interleaved with another sender's bytes.
//! Exactly one consumer may take the read half via [`Link::take_reader`].

use crate::transport::BoxedStream;
use futures::{SinkExt, StreamExt};
use portway_common::{AgentError, Result};
use portway_protocol::{Frame, FrameCodec, ProtocolError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default deadline for writing one frame.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Link {
    id: String,
    writer: Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    /// Present until the demultiplexer claims it.
    read_half: Mutex<Option<ReadHalf<BoxedStream>>>,
    healthy: AtomicBool,
    created_at: Instant,
    last_used: std::sync::Mutex<Instant>,
    write_timeout: Duration,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(stream: BoxedStream, write_timeout: Duration) -> Self {
        let (read_half, write_half) = split(stream);
        let now = Instant::now();
        Self {
            id: format!("link_{}", Uuid::new_v4().simple()),
            writer: Mutex::new(FramedWrite::new(write_half, FrameCodec::new())),
            read_half: Mutex::new(Some(read_half)),
            healthy: AtomicBool::new(true),
            created_at: now,
            last_used: std::sync::Mutex::new(now),
            write_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_used.lock() {
            *guard = Instant::now();
        }
    }

    /// Write one frame. Atomic with respect to other senders on this link:
    /// either the whole frame reaches the transport or the link is marked
    /// unhealthy and an error is returned.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.send(frame)).await {
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
            Ok(Err(e)) => {
                self.mark_unhealthy();
                Err(match e {
                    ProtocolError::Io(io) => AgentError::Io(io),
                    other => AgentError::Protocol(other),
                })
            }
            Err(_) => {
                self.mark_unhealthy();
                Err(AgentError::Timeout(format!(
                    "frame write on {} exceeded {:?}",
                    self.id, self.write_timeout
                )))
            }
        }
    }

    /// Claim the read half. Returns `None` if a reader was already taken.
    pub async fn take_reader(&self, read_timeout: Option<Duration>) -> Option<LinkReader> {
        let half = self.read_half.lock().await.take()?;
        Some(LinkReader {
            link_id: self.id.clone(),
            framed: FramedRead::new(half, FrameCodec::new()),
            read_timeout,
        })
    }

    /// Health probe for idle links: attempt a 1-byte read under `deadline`.
    /// A timeout means the peer is quiet and the link is healthy; EOF or any
    /// IO error marks it unhealthy. Links whose reader has been claimed are
    /// reported through their owner instead and probe as healthy here.
    pub async fn probe(&self, deadline: Duration) -> bool {
        let mut guard = self.read_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return self.is_healthy();
        };

        let mut byte = [0u8; 1];
        match timeout(deadline, half.read(&mut byte)).await {
            Err(_) => true,
            Ok(Ok(0)) => {
                debug!(link_id = %self.id, "probe saw EOF");
                self.mark_unhealthy();
                false
            }
            Ok(Ok(_)) => {
                // Data on an idle link is unexpected but not fatal.
                warn!(link_id = %self.id, "probe consumed an unexpected byte");
                true
            }
            Ok(Err(e)) => {
                debug!(link_id = %self.id, error = %e, "probe failed");
                self.mark_unhealthy();
                false
            }
        }
    }
}

/// The single consumer end of a link.
pub struct LinkReader {
    link_id: String,
    framed: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    read_timeout: Option<Duration>,
}

impl LinkReader {
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// Receive the next frame. `Ok(None)` means the peer half-closed.
    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        let next = match self.read_timeout {
            Some(deadline) => timeout(deadline, self.framed.next())
                .await
                .map_err(|_| AgentError::Timeout(format!("frame read on {}", self.link_id)))?,
            None => self.framed.next().await,
        };

        match next {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(ProtocolError::Io(e))) => Err(AgentError::Io(e)),
            Some(Err(e)) => Err(AgentError::Protocol(e)),
            None => Ok(None),
        }
    }
}
