//! Cross-module scenarios from the framing contract: padded multi-message
//! delivery split across chunk boundaries that don't line up with frame
//! boundaries, and a corrupt-header resync that doesn't clobber the next
//! valid frame.

use corewire_messaging::{FramedMessaging, Transmit, XmitError, ETX, HEADER_SIZE, STX, TRAILER_SIZE};

#[derive(Default)]
struct MemTransmit {
    out: Vec<u8>,
}

impl Transmit for MemTransmit {
    fn xmit(&mut self, buf: &[u8]) -> Result<usize, XmitError> {
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }
}

fn encode(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);
    out.push(STX);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out.push(ETX);
    out
}

/// Two messages, fed in two chunks that split mid-frame rather than on a
/// frame boundary: after the first chunk only the first message should be
/// available, the second appears only once its trailing bytes arrive.
#[test]
fn two_messages_split_mid_frame() {
    let first = b"Hello world";
    let second_padded = {
        let mut body = b"I'm a traveler of both time and space".to_vec();
        body.resize(200, 0);
        body
    };

    let mut stream = encode(first);
    stream.extend(encode(&second_padded));

    let mut messaging = FramedMessaging::new(MemTransmit::default());

    let (chunk_a, chunk_b) = stream.split_at(220);
    assert!(messaging.process_chunk(chunk_a));
    assert_eq!(messaging.get_message_count(), 1);
    let msg1 = messaging.get_msg().unwrap();
    assert_eq!(msg1.body(), first);

    assert!(messaging.process_chunk(chunk_b));
    assert_eq!(messaging.get_message_count(), 1);
    let msg2 = messaging.get_msg().unwrap();
    assert_eq!(msg2.body(), second_padded.as_slice());
}

/// A corrupt STX in the first byte of a 220-byte chunk forces a full
/// resync: nothing is queued and the assembler is emptied, but a fresh,
/// well-formed frame arriving afterward still decodes normally.
#[test]
fn corrupt_leading_byte_forces_resync_then_recovers() {
    let mut padded = b"I'm a traveler of both time and space".to_vec();
    padded.resize(200, 0);
    let mut corrupt = encode(&padded);
    corrupt[0] = 0x00;

    let mut messaging = FramedMessaging::new(MemTransmit::default());
    assert!(!messaging.process_chunk(&corrupt));
    assert_eq!(messaging.get_message_count(), 0);

    let good = encode(b"recovered");
    assert!(messaging.process_chunk(&good));
    assert_eq!(messaging.get_message_count(), 1);
    assert_eq!(messaging.get_msg().unwrap().body(), b"recovered");
}

/// `send_message` through a transport that drops every 5000th write,
/// four bytes at a time, still lands a 1 MB body intact.
#[test]
fn large_body_survives_periodic_stall() {
    struct StallEvery5000 {
        out: Vec<u8>,
        calls: usize,
    }

    impl Transmit for StallEvery5000 {
        fn xmit(&mut self, buf: &[u8]) -> Result<usize, XmitError> {
            self.calls += 1;
            if self.calls % 5000 == 0 {
                return Ok(0);
            }
            let n = buf.len().min(4);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    let body = vec![0x42u8; 1_000_000];
    let mut messaging = FramedMessaging::with_config(
        StallEvery5000 { out: Vec::new(), calls: 0 },
        corewire_messaging::MessagingConfig {
            send_retry: 5,
            send_retry_delay: std::time::Duration::from_micros(1),
        },
    );

    assert!(messaging.send_message(&body));

    let sent = std::mem::take(&mut messaging.transmit_mut().out);
    let mut decoder = FramedMessaging::new(MemTransmit::default());
    assert!(decoder.process_chunk(&sent));
    assert_eq!(decoder.get_msg().unwrap().body(), body.as_slice());
}
