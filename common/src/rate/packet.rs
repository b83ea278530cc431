use crate::bandwidth::TokenBucket;
use crate::error::{CommonError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::debug;

/// Datagram buffer with a declared capacity, usually the size of the pool slot it came from.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: BytesMut,
    capacity: usize,
}

impl PacketBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Wrap bytes handed over by another layer. The declared capacity is taken as given.
    pub fn from_parts(data: BytesMut, capacity: usize) -> Self {
        Self { data, capacity }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let need = self.data.len() + bytes.len();
        if need > self.capacity {
            return Err(CommonError::BufferOverflow {
                capacity: self.capacity,
                need,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }
}

/// Packet oriented connection, one datagram per call.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Append the next datagram to `buf` and return its source address.
    async fn read_packet(&self, buf: &mut PacketBuffer) -> Result<SocketAddr>;

    async fn write_packet(&self, buf: &PacketBuffer, destination: SocketAddr) -> Result<()>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn read_packet(&self, buf: &mut PacketBuffer) -> Result<SocketAddr> {
        let mut scratch = vec![0u8; buf.remaining()];
        let (n, source) = self.recv_from(&mut scratch).await?;
        buf.extend_from_slice(&scratch[..n])?;
        Ok(source)
    }

    async fn write_packet(&self, buf: &PacketBuffer, destination: SocketAddr) -> Result<()> {
        self.send_to(buf.as_slice(), destination).await?;
        Ok(())
    }
}

/// Packet connection paced by a shared [`TokenBucket`].
///
/// Reads are charged after the fact for the bytes actually received; writes are charged before
/// sending. A write whose buffer is over its declared capacity, or already full, fails without
/// touching the bucket.
pub struct RateLimitedPacketConn<C> {
    inner: C,
    bucket: Option<TokenBucket>,
}

impl<C> RateLimitedPacketConn<C> {
    pub fn new(inner: C, bucket: Option<TokenBucket>) -> Self {
        Self { inner, bucket }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn bucket(&self) -> Option<&TokenBucket> {
        self.bucket.as_ref()
    }
}

#[async_trait]
impl<C: PacketConn> PacketConn for RateLimitedPacketConn<C> {
    async fn read_packet(&self, buf: &mut PacketBuffer) -> Result<SocketAddr> {
        let before = buf.len();
        let source = self.inner.read_packet(buf).await?;
        if let Some(bucket) = &self.bucket {
            bucket.consume(buf.len().saturating_sub(before) as u64).await;
        }
        Ok(source)
    }

    async fn write_packet(&self, buf: &PacketBuffer, destination: SocketAddr) -> Result<()> {
        let need = buf.len();
        if need > buf.capacity() {
            debug!(
                "Dropped packet to {}: {} bytes over capacity {}",
                destination,
                need,
                buf.capacity()
            );
            return Err(CommonError::BufferOverflow {
                capacity: buf.capacity(),
                need,
            });
        }
        if buf.is_full() {
            debug!("Dropped packet to {}: buffer full", destination);
            return Err(CommonError::BufferFull {
                capacity: buf.capacity(),
                len: buf.len(),
            });
        }
        if let Some(bucket) = &self.bucket {
            bucket.consume(need as u64).await;
        }
        self.inner.write_packet(buf, destination).await
    }
}
