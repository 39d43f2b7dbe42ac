//! Network communication layer.

pub mod server;
pub mod transport;
pub mod wire;

pub use server::NetworkServer;
pub use transport::{TcpTransport, Transport, TransportConfig};
pub use wire::{Message, MessageBody};
