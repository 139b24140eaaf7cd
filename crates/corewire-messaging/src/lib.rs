//! Length-prefixed message framing over an abstract byte-stream transmit
//! primitive.
//!
//! Wire format, one frame:
//!
//! ```text
//! byte  0     : 0x02                (STX)
//! bytes 1..4  : body length, big-endian u32
//! bytes 5..   : body (length bytes, opaque)
//! last byte   : 0x03                (ETX)
//! ```
//!
//! [`FramedMessaging`] encodes outgoing messages through
//! [`Transmit::xmit`] with bounded retry on partial/would-block sends, and
//! decodes incoming byte chunks (of arbitrary, unrelated-to-frame-boundary
//! size) into a FIFO of whole messages via [`corewire_chunk::ChunkAssembler`].

mod message;
mod transmit;

use std::{collections::VecDeque, thread, time::Duration};

use corewire_chunk::ChunkAssembler;
pub use message::Message;
pub use transmit::{Transmit, XmitError};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const HEADER_SIZE: usize = 5;
pub const TRAILER_SIZE: usize = 1;

/// Retry budget for partial/would-block sends.
#[derive(Debug, Clone, Copy)]
pub struct MessagingConfig {
    pub send_retry: u32,
    pub send_retry_delay: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self { send_retry: 5, send_retry_delay: Duration::from_millis(10) }
    }
}

/// Encodes/decodes length-framed messages over a [`Transmit`] transport.
///
/// Not internally synchronized: `process_chunk` and `get_msg` are meant to
/// be driven by a single owning thread (typically a transport's read
/// handler), matching the contract of the transport collaborators this is
/// layered on.
pub struct FramedMessaging<T> {
    transmit: T,
    assembler: ChunkAssembler,
    queue: VecDeque<Message>,
    config: MessagingConfig,
}

impl<T: Transmit> FramedMessaging<T> {
    pub fn new(transmit: T) -> Self {
        Self::with_config(transmit, MessagingConfig::default())
    }

    pub fn with_config(transmit: T, config: MessagingConfig) -> Self {
        Self { transmit, assembler: ChunkAssembler::new(), queue: VecDeque::new(), config }
    }

    pub fn transmit_mut(&mut self) -> &mut T {
        &mut self.transmit
    }

    /// Sends `body` as one frame: header, body, trailer, each through a
    /// bounded retry loop. Returns `true` iff all three segments were fully
    /// transmitted. On failure the peer may have received a truncated
    /// frame; the receiver resynchronizes on the next bad STX rather than
    /// this side trying to undo a partial send.
    pub fn send_message(&mut self, body: &[u8]) -> bool {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = STX;
        header[1..HEADER_SIZE].copy_from_slice(&(body.len() as u32).to_be_bytes());
        let trailer = [ETX; TRAILER_SIZE];

        self.xmit_with_retry(&header) && self.xmit_with_retry(body) && self.xmit_with_retry(&trailer)
    }

    /// Transmits `buf` in full, retrying on `Ok(0)` (would-block) up to
    /// `config.send_retry` consecutive non-progress attempts. Any progress
    /// resets the retry counter: a slow but advancing transport must never
    /// hit the ceiling just because it's slow.
    fn xmit_with_retry(&mut self, buf: &[u8]) -> bool {
        let mut sent = 0usize;
        let mut retries = 0u32;

        while sent < buf.len() {
            match self.transmit.xmit(&buf[sent..]) {
                Err(_) => {
                    tracing::debug!("transmit failed, aborting send");
                    return false;
                }
                Ok(0) => {
                    retries += 1;
                    if retries >= self.config.send_retry {
                        tracing::debug!(retries, "xmit retry ceiling reached");
                        return false;
                    }
                    thread::sleep(self.config.send_retry_delay);
                }
                Ok(n) => {
                    sent += n;
                    retries = 0;
                }
            }
        }

        true
    }

    /// Appends `bytes` to the assembler, then extracts as many complete
    /// frames as are now present. Returns `true` iff at least one complete,
    /// validated frame was extracted during this call. Never blocks.
    pub fn process_chunk(&mut self, bytes: &[u8]) -> bool {
        self.assembler.append(bytes);
        let mut produced = false;

        loop {
            if self.assembler.size() < HEADER_SIZE {
                break;
            }

            let mut header = [0u8; HEADER_SIZE];
            self.assembler.peek(&mut header, 0);
            if header[0] != STX {
                // No in-stream resync is safe without an escape sequence:
                // clear everything buffered and wait for a fresh STX.
                tracing::warn!("bad start-of-message byte, clearing buffered input to resync");
                self.assembler.clear();
                break;
            }

            let msg_len =
                u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
            if self.assembler.size() < HEADER_SIZE + msg_len + TRAILER_SIZE {
                break;
            }

            self.assembler.trim(HEADER_SIZE);
            let mut body = vec![0u8; msg_len].into_boxed_slice();
            if msg_len > 0 {
                self.assembler.pop(&mut body);
            }

            let mut trailer = [0u8; TRAILER_SIZE];
            self.assembler.pop(&mut trailer);
            if trailer[0] != ETX {
                tracing::warn!("bad trailer byte, dropping frame");
                break;
            }

            self.queue.push_back(Message::new(body));
            produced = true;
        }

        produced
    }

    /// Length of the body of the next queued message; `0` if none, but also
    /// `0` for a genuinely empty-bodied message. Use
    /// [`Self::get_message_count`] to distinguish the two.
    pub fn get_msg_size(&self) -> u32 {
        self.queue.front().map_or(0, |m| m.len() as u32)
    }

    /// Removes and returns the head of the message queue.
    pub fn get_msg(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn get_message_count(&self) -> usize {
        self.queue.len()
    }
}
