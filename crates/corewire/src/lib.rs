extern crate self as corewire;

pub use corewire_chunk as chunk;
pub use corewire_chunk::ChunkAssembler;
pub use corewire_messaging as messaging;
pub use corewire_messaging::{FramedMessaging, Message, MessagingConfig, Transmit, XmitError};
pub use corewire_net as net;
pub use corewire_net::{ConnHandle, ConnectionEvent, TcpClient, TcpServer, UdpClient, UdpServer};
pub use corewire_timer as timer;
pub use corewire_timer::{
    TimerHandle, TimerManager, TimerManagerConfig, TimerSnapshot, TimerState, INVALID_HANDLE,
};
pub use corewire_utils as utils;
pub use tracing;
