//! Rate limited I/O.
//!
//! Both wrappers take an `Option<TokenBucket>`; `None` passes traffic through untouched so an
//! unlimited user costs nothing on the data path.

mod packet;
mod stream;

pub use packet::{PacketBuffer, PacketConn, RateLimitedPacketConn};
pub use stream::RateLimitedStream;
