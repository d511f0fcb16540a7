//! The reload listener: a loopback TCP server that receives reload requests.
use std::{
    io,
    mem::size_of,
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    config::{LISTEN_BACKLOG, REQUEST_READ_TIMEOUT},
    error::{HotReloadError, HotReloadErrorKind},
    wire::ReloadRequest,
};

/// Listens on loopback for reload requests and hands each one to a callback on a single
/// background thread. Requests are served strictly one at a time.
pub struct ReloadServer {
    port: u16,
    backlog: i32,
    read_timeout: Duration,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl ReloadServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            backlog: LISTEN_BACKLOG,
            read_timeout: REQUEST_READ_TIMEOUT,
            listener: None,
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            acceptor: None,
        }
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// How long a connection may stall before its request is dropped.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Create, configure and bind the listening socket.
    pub fn start(&mut self) -> Result<(), HotReloadError> {
        if self.acceptor.is_some() {
            return Err(HotReloadErrorKind::ServerAlreadyRunning.into());
        }
        let listener = bind_loopback(self.port, self.backlog)?;
        let addr = listener
            .local_addr()
            .map_err(|source| socket_failure("getsockname", source))?;
        info!("reload server listening on {}", addr);
        self.local_addr = Some(addr);
        self.listener = Some(listener);
        Ok(())
    }

    /// The address the server is bound to, once started. Useful when the port was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Spawn the acceptor thread. Each decoded request is passed to `callback`; malformed
    /// requests and accept failures are logged and the loop continues.
    pub fn run<F>(&mut self, callback: F) -> Result<(), HotReloadError>
    where
        F: FnMut(ReloadRequest) + Send + 'static,
    {
        if self.acceptor.is_some() {
            return Err(HotReloadErrorKind::ServerAlreadyRunning.into());
        }
        let listener = self
            .listener
            .take()
            .ok_or(HotReloadErrorKind::ServerNotStarted)?;
        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let read_timeout = self.read_timeout;
        let handle = std::thread::Builder::new()
            .name("hotreload-acceptor".to_string())
            .spawn(move || accept_loop(listener, running, read_timeout, callback))
            .map_err(|source| socket_failure("spawn", source))?;
        self.acceptor = Some(handle);
        Ok(())
    }

    /// Stop accepting, close the socket and join the acceptor thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.listener.take();
        let Some(handle) = self.acceptor.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        // The acceptor is parked in accept(); a throwaway connection wakes it up.
        if let Some(addr) = self.local_addr {
            let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()));
            if let Err(e) = TcpStream::connect(wake) {
                warn!("failed to wake reload acceptor: {}", e);
            }
        }
        if handle.join().is_err() {
            error!("reload acceptor thread panicked");
        }
        debug!("reload server stopped");
    }
}

impl Drop for ReloadServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop<F>(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
    mut callback: F,
) where
    F: FnMut(ReloadRequest),
{
    while running.load(Ordering::Acquire) {
        let (mut stream, peer) = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                error!("failed to accept reload connection: {}", e);
                continue;
            }
        };
        if !running.load(Ordering::Acquire) {
            break;
        }
        debug!("reload connection from {}", peer);
        // Bounds how long a silent peer can hold the acceptor.
        if let Err(e) = stream.set_read_timeout(Some(read_timeout)) {
            warn!("failed to set read timeout for {}: {}", peer, e);
            continue;
        }
        let request = match ReloadRequest::read_from(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping reload request from {}: {}", peer, e);
                continue;
            }
        };
        if catch_unwind(AssertUnwindSafe(|| callback(request))).is_err() {
            error!("reload request handler panicked");
        }
    }
    debug!("reload acceptor exiting");
}

fn socket_failure(op: &'static str, source: io::Error) -> HotReloadError {
    HotReloadErrorKind::SocketFailure { op, source }.into()
}

fn check(op: &'static str, ret: libc::c_int) -> Result<(), HotReloadError> {
    if ret < 0 {
        Err(socket_failure(op, io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Bind a TCP socket on 127.0.0.1 with address reuse and the given listen backlog.
fn bind_loopback(port: u16, backlog: i32) -> Result<TcpListener, HotReloadError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    check("socket", fd)?;
    // Safety: fd was just returned by socket() and is owned by nothing else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    check("setsockopt", unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;

    // Safety: sockaddr_in is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
    };
    #[cfg(target_vendor = "apple")]
    {
        addr.sin_len = size_of::<libc::sockaddr_in>() as u8;
    }
    check("bind", unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    check("listen", unsafe { libc::listen(fd.as_raw_fd(), backlog) })?;

    Ok(TcpListener::from(fd))
}
