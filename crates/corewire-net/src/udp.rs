use std::{
    io,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Thin wrapper over a connected `UdpSocket`. Datagrams are not
/// length-framed: no assembler sits between send and receive, unlike the
/// TCP/Framed Messaging path.
pub struct UdpClient {
    socket: UdpSocket,
}

impl UdpClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(addr)?;
        Ok(Self { socket })
    }

    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data)
    }

    pub fn send_to<A: ToSocketAddrs>(&self, data: &[u8], addr: A) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }
}

type DatagramCallback = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

/// A callback-driven UDP listener: one receive-loop thread reads datagrams
/// and hands each one to the data callback whole, with the sender's address.
pub struct UdpServer {
    socket: UdpSocket,
    callback: Option<DatagramCallback>,
    recv_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl UdpServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self { socket, callback: None, recv_thread: None, shutdown: Arc::new(AtomicBool::new(false)) })
    }

    pub fn on_datagram<F>(&mut self, callback: F)
    where
        F: Fn(SocketAddr, &[u8]) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub fn start(&mut self) -> io::Result<()> {
        let socket = self.socket.try_clone()?;
        socket.set_read_timeout(Some(std::time::Duration::from_millis(200)))?;
        let callback = self.callback.clone();
        let shutdown = Arc::clone(&self.shutdown);

        let handle = thread::Builder::new().name("udp-server-recv".into()).spawn(move || {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            while !shutdown.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((n, peer)) => {
                        if let Some(cb) = &callback {
                            cb(peer, &buf[..n]);
                        }
                    }
                    Err(err)
                        if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                    Err(err) => {
                        tracing::error!(?err, "udp recv failed");
                        break;
                    }
                }
            }
        })?;

        self.recv_thread = Some(handle);
        Ok(())
    }

    pub fn send_to<A: ToSocketAddrs>(&self, data: &[u8], addr: A) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn datagram_delivery() {
        let mut server = UdpServer::bind("127.0.0.1:0").unwrap();
        let addr = server.socket.local_addr().unwrap();

        let (tx, rx) = mpsc::channel();
        server.on_datagram(move |_peer, bytes| {
            let _ = tx.send(bytes.to_vec());
        });
        server.start().unwrap();

        let client = UdpClient::connect(addr).unwrap();
        client.send(b"a single datagram").unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).expect("server should receive datagram");
        assert_eq!(received, b"a single datagram");

        server.stop();
    }
}
