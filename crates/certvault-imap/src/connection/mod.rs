//! Connection management: stream types and wire framing.

mod framed;
mod stream;

pub use framed::FramedStream;
pub use stream::{ImapStream, connect_plain, connect_tls};
