use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::tls::{TlsError, TlsSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SocketState {
    #[default]
    Disconnected,
    Connecting,
    TlsHandshaking,
    Connected,
}

impl SocketState {
    pub fn as_str(self) -> &'static str {
        match self {
            SocketState::Disconnected => "disconnected",
            SocketState::Connecting => "connecting",
            SocketState::TlsHandshaking => "tls-handshaking",
            SocketState::Connected => "connected",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TlsMode {
    #[default]
    None,
    Verify,
    NoVerify,
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("Socket is busy")]
    Busy,
    #[error("Socket is not connected")]
    NotConnected,
    #[error("Socket EOF")]
    Eof,
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Default)]
struct Shared {
    state: SocketState,
    last_error: String,
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    tls: Option<TlsSession>,
    remote: Option<SocketAddr>,
    outgoing: Vec<u8>,
}

impl Shared {
    fn fail(&mut self, err: &SocketError) {
        tracing::debug!(error = %err, "socket disconnected");
        self.last_error = err.to_string();
        self.disconnect();
    }

    fn disconnect(&mut self) {
        self.state = SocketState::Disconnected;
        self.stream = None;
        self.listener = None;
        self.tls = None;
        self.outgoing.clear();
    }

    fn flush(&mut self) -> Result<(), SocketError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(SocketError::NotConnected);
        };
        if let Some(tls) = self.tls.as_mut() {
            tls.pump_write(stream)?;
            return Ok(());
        }
        while !self.outgoing.is_empty() {
            match stream.write(&self.outgoing) {
                Ok(0) => return Err(SocketError::Eof),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Non-blocking TCP endpoint. Name resolution and connect run on a worker
/// thread that publishes its result into the shared state; every other call
/// is made from the owning thread and never blocks.
pub struct Socket {
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    tls_mode: TlsMode,
}

impl Default for Socket {
    fn default() -> Self {
        Socket::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Socket {
            shared: Arc::new(Mutex::new(Shared::default())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            tls_mode: TlsMode::None,
        }
    }

    fn from_accepted(stream: TcpStream, remote: SocketAddr) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let shared = Shared {
            state: SocketState::Connected,
            stream: Some(stream),
            remote: Some(remote),
            ..Shared::default()
        };
        Ok(Socket {
            shared: Arc::new(Mutex::new(shared)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            tls_mode: TlsMode::None,
        })
    }

    pub fn set_tls(&mut self, mode: TlsMode) {
        self.tls_mode = mode;
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    pub fn state(&self) -> SocketState {
        lock(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    pub fn last_error(&self) -> String {
        lock(&self.shared).last_error.clone()
    }

    pub fn remote_host(&self) -> String {
        lock(&self.shared)
            .remote
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    pub fn remote_port(&self) -> u16 {
        lock(&self.shared).remote.map(|a| a.port()).unwrap_or(0)
    }

    pub fn local_port(&self) -> Option<u16> {
        let sh = lock(&self.shared);
        if let Some(l) = sh.listener.as_ref() {
            return l.local_addr().ok().map(|a| a.port());
        }
        sh.stream
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }

    /// Starts an asynchronous resolve + connect. Fails with `Busy` unless the
    /// socket is disconnected.
    pub fn start_connect(&mut self, host: &str, port: u16) -> Result<(), SocketError> {
        self.start_worker(host.to_string(), port, false)
    }

    /// Starts an asynchronous bind on all interfaces.
    pub fn start_listen(&mut self, port: u16) -> Result<(), SocketError> {
        self.start_worker(String::new(), port, true)
    }

    fn start_worker(&mut self, host: String, port: u16, listen: bool) -> Result<(), SocketError> {
        if self.state() != SocketState::Disconnected {
            return Err(SocketError::Busy);
        }
        self.detach_worker();

        let shared = Arc::new(Mutex::new(Shared {
            state: SocketState::Connecting,
            ..Shared::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));
        self.shared = shared.clone();
        self.stop = stop.clone();

        let tls_mode = self.tls_mode;
        let spawned = std::thread::Builder::new()
            .name("deck-socket".to_string())
            .spawn(move || {
                if listen {
                    listen_worker(&shared, &stop, port)
                } else {
                    connect_worker(&shared, &stop, &host, port, tls_mode)
                }
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err = SocketError::Io(e);
                lock(&self.shared).fail(&err);
                Err(err)
            }
        }
    }

    /// Advances a pending TLS handshake; returns the resulting state.
    pub fn tls_handshake(&mut self) -> SocketState {
        let mut guard = lock(&self.shared);
        let sh = &mut *guard;
        if sh.state != SocketState::TlsHandshaking {
            return sh.state;
        }
        let result = match (sh.stream.as_mut(), sh.tls.as_mut()) {
            (Some(stream), Some(tls)) => tls
                .pump_write(stream)
                .and_then(|_| tls.pump_read(stream))
                .and_then(|_| tls.pump_write(stream))
                .map(|_| tls.is_handshaking()),
            _ => Err(TlsError::Closed),
        };
        match result {
            Ok(true) => {}
            Ok(false) => sh.state = SocketState::Connected,
            Err(e) => sh.fail(&SocketError::Tls(e)),
        }
        sh.state
    }

    /// Reads whatever is available. `Ok(0)` means nothing yet; an error
    /// means the socket has dropped to `Disconnected`.
    pub fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        let mut guard = lock(&self.shared);
        let sh = &mut *guard;
        match sh.state {
            SocketState::Connected => {}
            SocketState::Connecting | SocketState::TlsHandshaking => return Ok(0),
            SocketState::Disconnected => return Err(SocketError::NotConnected),
        }
        if let Err(e) = sh.flush() {
            sh.fail(&e);
            return Err(e);
        }

        let result = match (sh.stream.as_mut(), sh.tls.as_mut()) {
            (Some(stream), Some(tls)) => tls
                .pump_read(stream)
                .and_then(|_| tls.read_plain(buf))
                .map_err(SocketError::from),
            (Some(stream), None) => loop {
                match stream.read(buf) {
                    Ok(0) if !buf.is_empty() => break Err(SocketError::Eof),
                    Ok(n) => break Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(0),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break Err(SocketError::Io(e)),
                }
            },
            (None, _) => Err(SocketError::NotConnected),
        };
        if let Err(e) = &result {
            sh.fail(e);
        }
        result
    }

    /// Queues `data` and flushes as much as the kernel accepts.
    pub fn write(&mut self, data: &[u8]) -> Result<(), SocketError> {
        let mut guard = lock(&self.shared);
        let sh = &mut *guard;
        if sh.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        if let Some(tls) = sh.tls.as_mut() {
            if let Err(e) = tls.write_plain(data) {
                let err = SocketError::Tls(e);
                sh.fail(&err);
                return Err(err);
            }
        } else {
            sh.outgoing.extend_from_slice(data);
        }
        if let Err(e) = sh.flush() {
            sh.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !lock(&self.shared).outgoing.is_empty()
    }

    pub fn accept_nonblock(&mut self) -> Result<Option<Socket>, SocketError> {
        let accepted = {
            let sh = lock(&self.shared);
            let Some(listener) = sh.listener.as_ref() else {
                return Err(SocketError::NotConnected);
            };
            match listener.accept() {
                Ok(pair) => Some(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
                Err(e) => return Err(e.into()),
            }
        };
        match accepted {
            Some((stream, addr)) => Ok(Some(Socket::from_accepted(stream, addr)?)),
            None => Ok(None),
        }
    }

    /// Graceful close: TLS close_notify, flush, shutdown both halves.
    pub fn shutdown(&mut self) {
        let mut guard = lock(&self.shared);
        let sh = &mut *guard;
        if let (Some(stream), Some(tls)) = (sh.stream.as_mut(), sh.tls.as_mut()) {
            tls.close_notify();
            let _ = tls.pump_write(stream);
        } else {
            let _ = sh.flush();
        }
        if let Some(stream) = sh.stream.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        sh.disconnect();
    }

    /// Drops the connection immediately and detaches any running worker.
    pub fn close(&mut self) {
        self.detach_worker();
        lock(&self.shared).disconnect();
    }

    fn detach_worker(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.worker = None;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_worker(
    shared: &Mutex<Shared>,
    stop: &AtomicBool,
    host: &str,
    port: u16,
    tls_mode: TlsMode,
) {
    let result = resolve_and_connect(host, port);

    let mut sh = lock(shared);
    if stop.load(Ordering::SeqCst) {
        return;
    }
    let stream = match result {
        Ok(stream) => stream,
        Err(e) => return sh.fail(&e),
    };
    if let Err(e) = stream.set_nonblocking(true) {
        return sh.fail(&SocketError::Io(e));
    }
    let _ = stream.set_nodelay(true);
    sh.remote = stream.peer_addr().ok();

    match tls_mode {
        TlsMode::None => {
            sh.stream = Some(stream);
            sh.state = SocketState::Connected;
        }
        TlsMode::Verify | TlsMode::NoVerify => {
            match TlsSession::connect(host, tls_mode == TlsMode::Verify) {
                Ok(tls) => {
                    sh.stream = Some(stream);
                    sh.tls = Some(tls);
                    sh.state = SocketState::TlsHandshaking;
                }
                Err(e) => sh.fail(&SocketError::Tls(e)),
            }
        }
    }
    tracing::debug!(host, port, state = sh.state.as_str(), "socket connect finished");
}

fn resolve_and_connect(host: &str, port: u16) -> Result<TcpStream, SocketError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| SocketError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => SocketError::Io(e),
        None => SocketError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        },
    })
}

fn listen_worker(shared: &Mutex<Shared>, stop: &AtomicBool, port: u16) {
    let result = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .and_then(|l| l.set_nonblocking(true).map(|_| l));

    let mut sh = lock(shared);
    if stop.load(Ordering::SeqCst) {
        return;
    }
    match result {
        Ok(listener) => {
            sh.listener = Some(listener);
            sh.state = SocketState::Connected;
        }
        Err(e) => sh.fail(&SocketError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for(sock: &Socket, want: SocketState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if sock.state() == want {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn connect_write_read_and_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
        });

        let mut sock = Socket::new();
        sock.start_connect("127.0.0.1", port).unwrap();
        assert!(matches!(
            sock.start_connect("127.0.0.1", port),
            Err(SocketError::Busy)
        ));
        assert!(wait_for(&sock, SocketState::Connected));
        assert_eq!(sock.remote_port(), port);

        sock.write(b"ping").unwrap();
        let mut got = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 16];
        while got.len() < 4 && Instant::now() < deadline {
            let n = sock.read_nonblock(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ping");
        server.join().unwrap();

        let err = loop {
            match sock.read_nonblock(&mut buf) {
                Ok(_) if Instant::now() < deadline => continue,
                Ok(_) => panic!("expected eof"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, SocketError::Eof | SocketError::Io(_)));
        assert_eq!(sock.state(), SocketState::Disconnected);
        assert!(!sock.last_error().is_empty());
    }

    #[test]
    fn refused_connect_records_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut sock = Socket::new();
        sock.start_connect("127.0.0.1", port).unwrap();
        assert!(wait_for(&sock, SocketState::Disconnected));
        assert!(!sock.last_error().is_empty());
    }

    #[test]
    fn listen_and_accept() {
        let mut server = Socket::new();
        server.start_listen(0).unwrap();
        assert!(wait_for(&server, SocketState::Connected));
        let port = server.local_port().unwrap();
        assert!(server.accept_nonblock().unwrap().is_none());

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let accepted = loop {
            if let Some(s) = server.accept_nonblock().unwrap() {
                break s;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(accepted.is_connected());
        assert_eq!(accepted.remote_host(), "127.0.0.1");
    }

    #[test]
    fn close_is_idempotent() {
        let mut sock = Socket::new();
        sock.close();
        sock.close();
        sock.shutdown();
        assert_eq!(sock.state(), SocketState::Disconnected);
        assert!(sock.write(b"x").is_err());
    }
}
