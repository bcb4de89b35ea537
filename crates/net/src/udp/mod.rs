mod connection;
mod reliable;
mod tracking;
mod transport;

pub use connection::UdpConnection;
pub use reliable::{OutgoingReliable, ReliableReceiver, ReliableSender, RetryExhausted};
pub use tracking::{ReceiveTracker, SENT_WINDOW_SIZE, SentKind, SentRecord, SentWindow};
pub use transport::UdpTransport;
