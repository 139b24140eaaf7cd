//! Blocking TCP/UDP bindings for `corewire-messaging`'s transmit contract.
//!
//! Smaller and less polished than `corewire-timer`/`corewire-messaging`: this
//! exists to prove the `Transmit` contract is real and exercisable over an
//! actual socket, not to be a production server framework.

mod tcp;
mod udp;

pub use tcp::{ConnHandle, ConnectionEvent, TcpClient, TcpServer};
pub use udp::{UdpClient, UdpServer};
