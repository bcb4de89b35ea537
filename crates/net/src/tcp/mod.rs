mod connection;
mod framing;
mod transport;

pub use connection::TcpConnection;
pub use framing::{FrameReader, LENGTH_PREFIX, encode_frame};
pub use transport::TcpTransport;
