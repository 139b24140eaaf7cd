use std::{
    collections::HashMap,
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use corewire_messaging::{Transmit, XmitError};

/// Opaque per-connection identifier handed to the server's callbacks.
pub type ConnHandle = u64;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A blocking TCP client. Implements [`Transmit`] so it can be plugged
/// directly into `corewire_messaging::FramedMessaging`.
///
/// `connect` is blocking (the original's socket model); once connected the
/// socket is switched to non-blocking so `xmit` can honor the
/// [`Transmit`] contract of mapping "would block" to `Ok(0)` instead of
/// stalling the caller's retry loop.
#[derive(Default)]
pub struct TcpClient {
    stream: Option<TcpStream>,
}

impl TcpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to `addr`, blocking until the connection completes or fails.
    pub fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> bool {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    tracing::warn!(?err, "failed to set client socket non-blocking");
                }
                self.stream = Some(stream);
                true
            }
            Err(err) => {
                tracing::warn!(?err, "tcp connect failed");
                false
            }
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Transmit for TcpClient {
    fn xmit(&mut self, buf: &[u8]) -> Result<usize, XmitError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(XmitError);
        };

        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                tracing::warn!(?err, "tcp client send failed");
                Err(XmitError)
            }
        }
    }
}

/// Connection lifecycle events delivered to a [`TcpServer`]'s connection
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

type ConnectionCallback = Arc<dyn Fn(ConnectionEvent, SocketAddr, ConnHandle) -> bool + Send + Sync>;
type DataCallback = Arc<dyn Fn(ConnHandle, &[u8]) + Send + Sync>;

struct Connection {
    stream: TcpStream,
    closed: Arc<AtomicBool>,
}

/// A callback-driven TCP server: an accept thread hands each new connection
/// its own blocking reader thread.
///
/// Rejecting a connection from the connection callback (returning `false`)
/// closes it immediately, before any data callback fires for it.
pub struct TcpServer {
    listener: TcpListener,
    connections: Arc<Mutex<HashMap<ConnHandle, Connection>>>,
    next_handle: Arc<AtomicU64>,
    connection_cb: Option<ConnectionCallback>,
    data_cb: Option<DataCallback>,
    accept_thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TcpServer {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(0)),
            connection_cb: None,
            data_cb: None,
            accept_thread: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn on_connection<F>(&mut self, callback: F)
    where
        F: Fn(ConnectionEvent, SocketAddr, ConnHandle) -> bool + Send + Sync + 'static,
    {
        self.connection_cb = Some(Arc::new(callback));
    }

    pub fn on_data<F>(&mut self, callback: F)
    where
        F: Fn(ConnHandle, &[u8]) + Send + Sync + 'static,
    {
        self.data_cb = Some(Arc::new(callback));
    }

    /// Spawns the accept thread. Each accepted connection gets its own
    /// reader thread that feeds received bytes to the data callback.
    pub fn start(&mut self) -> io::Result<()> {
        let listener = self.listener.try_clone()?;
        let connections = Arc::clone(&self.connections);
        let shutdown = Arc::clone(&self.shutdown);
        let connection_cb = self.connection_cb.clone();
        let data_cb = self.data_cb.clone();
        let next_handle = Arc::clone(&self.next_handle);

        let handle = thread::Builder::new().name("tcp-server-accept".into()).spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let handle = next_handle.fetch_add(1, Ordering::SeqCst);
                        accept_connection(
                            stream,
                            peer,
                            handle,
                            &connections,
                            &connection_cb,
                            &data_cb,
                        );
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(err) => {
                        tracing::error!(?err, "tcp accept failed");
                        break;
                    }
                }
            }
        })?;

        self.accept_thread = Some(handle);
        Ok(())
    }

    pub fn send_to_client(&self, handle: ConnHandle, data: &[u8]) -> bool {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(conn) = connections.get(&handle) else {
            tracing::warn!(handle, "send_to_client: unknown connection");
            return false;
        };
        match (&conn.stream).write_all(data) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(?err, handle, "send_to_client failed");
                false
            }
        }
    }

    /// Closes one connection. Its reader thread notices on its next read
    /// and exits; the connection callback fires with `Disconnected`.
    pub fn close_connection(&self, handle: ConnHandle) -> bool {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(conn) = connections.get(&handle) else {
            return false;
        };
        conn.closed.store(true, Ordering::SeqCst);
        let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        true
    }

    /// Stops accepting new connections and closes every open one. Reader
    /// threads are not joined (they are not tracked individually); they
    /// exit on their own once the shutdown writes reach them.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        for conn in connections.values() {
            conn.closed.store(true, Ordering::SeqCst);
            let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handle: ConnHandle,
    connections: &Arc<Mutex<HashMap<ConnHandle, Connection>>>,
    connection_cb: &Option<ConnectionCallback>,
    data_cb: &Option<DataCallback>,
) {
    if let Some(cb) = connection_cb {
        if !cb(ConnectionEvent::Connected, peer, handle) {
            tracing::debug!(handle, "connection rejected by callback");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
    }

    let closed = Arc::new(AtomicBool::new(false));
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(?err, "failed to clone accepted stream for reader thread");
            return;
        }
    };

    connections
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(handle, Connection { stream, closed: Arc::clone(&closed) });

    let connections = Arc::clone(connections);
    let connection_cb = connection_cb.clone();
    let data_cb = data_cb.clone();

    thread::spawn(move || {
        read_loop(reader_stream, peer, handle, &closed, &data_cb);
        connections.lock().unwrap_or_else(|e| e.into_inner()).remove(&handle);
        if let Some(cb) = &connection_cb {
            cb(ConnectionEvent::Disconnected, peer, handle);
        }
    });
}

fn read_loop(
    mut stream: TcpStream,
    _peer: SocketAddr,
    handle: ConnHandle,
    closed: &Arc<AtomicBool>,
    data_cb: &Option<DataCallback>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                if let Some(cb) = data_cb {
                    cb(handle, &buf[..n]);
                }
            }
            Err(err) => {
                tracing::debug!(?err, handle, "tcp read loop ending");
                return;
            }
        }
    }
}
