//! Connection-time entry point for the data path: run the admission check for a user and wrap
//! the accepted connection with the user's shared bucket.

use crate::error::Result;
use crate::limiter::{Admission, LimiterRegistry};
use common::{PacketConn, RateLimitedPacketConn, RateLimitedStream, user_key};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Returns `None` when the connection must be refused.
pub fn admit_stream<S>(
    registry: &LimiterRegistry,
    tag: &str,
    uuid: &str,
    source: IpAddr,
    stream: S,
) -> Result<Option<RateLimitedStream<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(match admit(registry, tag, uuid, source)? {
        Admission::Accepted(bucket) => Some(RateLimitedStream::new(stream, bucket)),
        Admission::Rejected => None,
    })
}

pub fn admit_packet<C: PacketConn>(
    registry: &LimiterRegistry,
    tag: &str,
    uuid: &str,
    source: IpAddr,
    conn: C,
) -> Result<Option<RateLimitedPacketConn<C>>> {
    Ok(match admit(registry, tag, uuid, source)? {
        Admission::Accepted(bucket) => Some(RateLimitedPacketConn::new(conn, bucket)),
        Admission::Rejected => None,
    })
}

fn admit(registry: &LimiterRegistry, tag: &str, uuid: &str, source: IpAddr) -> Result<Admission> {
    let key = user_key(tag, uuid);
    let admission = registry.check_limit(tag, &key, &source.to_string())?;
    if admission.is_rejected() {
        debug!("Refused connection of {} from {}", key, source);
    }
    Ok(admission)
}
