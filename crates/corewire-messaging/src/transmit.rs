/// Hard, unrecoverable transport failure signalled by a [`Transmit`]
/// implementation (the "negative return" half of the original's `xmit`
/// contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transmit failed")]
pub struct XmitError;

/// The byte-stream transmit primitive [`crate::FramedMessaging`] sends
/// frames through.
///
/// This is the "virtual xmit hook": a small trait rather than a base class,
/// so any transport (TCP, UDP-with-reassembly, an in-memory pipe for tests)
/// can be the target of `send_message`.
///
/// - `Ok(n)` with `0 < n <= buf.len()`: `n` bytes were accepted. Fewer than
///   requested is fine; the caller retries with the remainder.
/// - `Ok(0)`: nothing was accepted right now, try again later (e.g. the
///   socket would block).
/// - `Err(_)`: the transport is unrecoverable; the caller must not retry.
pub trait Transmit {
    fn xmit(&mut self, buf: &[u8]) -> Result<usize, XmitError>;
}
