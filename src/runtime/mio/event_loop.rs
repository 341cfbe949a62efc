//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! Each worker owns its listener (SO_REUSEPORT lets the kernel balance
//! accepts) and its connections. All workers share one device.

use crate::config::Config;
use crate::device::{EchoDevice, Session};
use crate::runtime::request::{process, ProcessResult};
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 16 * 1024;

/// Events processed per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Per-worker connection state for mio backend.
struct MioConnection {
    stream: TcpStream,
    /// Device session owned by this connection.
    session: Session,
    /// Unprocessed request bytes.
    read_buf: BytesMut,
    /// Response bytes not yet written.
    write_buf: BytesMut,
    /// Registered for writable events.
    writable: bool,
    /// Stop reading; close once `write_buf` drains.
    closing: bool,
}

/// Stop signal shared by every worker of one server.
///
/// Each worker registers a `Waker` for its poll, so `trigger` interrupts
/// workers blocked in `poll` as well as busy ones.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask every worker to drop its connections and return.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::Release);
        for waker in self.wakers().iter() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake worker");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn register(&self, waker: Waker) -> io::Result<()> {
        let mut wakers = self.wakers();
        // A trigger that ran before this worker registered must still reach it.
        if self.is_requested() {
            waker.wake()?;
        }
        wakers.push(waker);
        Ok(())
    }

    fn wakers(&self) -> MutexGuard<'_, Vec<Waker>> {
        self.wakers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run the mio-based server until `shutdown` fires or a worker fails.
///
/// A failing worker stops the others; the first error is returned.
pub fn run(config: &Config, device: Arc<EchoDevice>, shutdown: Arc<Shutdown>) -> io::Result<()> {
    let num_workers = if config.workers == 0 {
        num_cpus()
    } else {
        config.workers
    };

    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    info!(workers = num_workers, addr = %addr, "Starting mio runtime");

    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let config = config.clone();
        let device = Arc::clone(&device);
        let worker_shutdown = Arc::clone(&shutdown);

        let spawned = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || {
                let result = worker_loop(worker_id, addr, &config, device, &worker_shutdown);
                if let Err(ref e) = result {
                    error!(worker = worker_id, error = %e, "Worker failed");
                    worker_shutdown.trigger();
                }
                result
            });

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                shutdown.trigger();
                let _ = join_workers(handles);
                return Err(e);
            }
        }
    }

    join_workers(handles)?;
    info!("mio runtime stopped");
    Ok(())
}

/// Wait for every worker and keep the first failure.
fn join_workers(handles: Vec<JoinHandle<io::Result<()>>>) -> io::Result<()> {
    let mut first_error = None;

    for handle in handles {
        let result = handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("worker thread panicked")));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn worker_loop(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    device: Arc<EchoDevice>,
    shutdown: &Shutdown,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    // Create listener with SO_REUSEPORT for kernel load balancing
    let listener = create_listener_with_reuseport(addr)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    shutdown.register(Waker::new(poll.registry(), WAKER_TOKEN)?)?;

    let max_connections = config.max_connections;
    let max_request_size = config.max_request_size;
    let mut connections: Slab<MioConnection> = Slab::with_capacity(max_connections);

    info!(worker = worker_id, max_connections, "Worker started");

    while !shutdown.is_requested() {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {}
                LISTENER_TOKEN => {
                    accept_connections(
                        &listener,
                        &poll,
                        &mut connections,
                        &device,
                        max_connections,
                        worker_id,
                    )?;
                }
                Token(conn_id) => {
                    if let Err(e) = handle_connection_event(
                        conn_id,
                        event,
                        &poll,
                        &mut connections,
                        max_request_size,
                    ) {
                        debug!(conn_id, error = %e, "Connection error");
                        close_connection(&poll, &mut connections, conn_id);
                    }
                }
            }
        }
    }

    // Dropping the connections closes their sessions.
    info!(worker = worker_id, open = connections.len(), "Worker stopping");
    for mut conn in connections.drain() {
        let _ = poll.registry().deregister(&mut conn.stream);
    }
    Ok(())
}

fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut Slab<MioConnection>,
    device: &Arc<EchoDevice>,
    max_connections: usize,
    worker_id: usize,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= max_connections {
                    warn!(peer = %peer_addr, "Connection limit reached");
                    continue;
                }

                let session = device.open();
                let session_id = session.id();
                let entry = connections.vacant_entry();
                let conn_id = entry.key();
                let conn = entry.insert(MioConnection {
                    stream,
                    session,
                    read_buf: BytesMut::with_capacity(READ_CHUNK),
                    write_buf: BytesMut::new(),
                    writable: false,
                    closing: false,
                });

                poll.registry()
                    .register(&mut conn.stream, Token(conn_id), Interest::READABLE)?;

                debug!(
                    worker = worker_id,
                    conn_id,
                    session = session_id,
                    peer = %peer_addr,
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!("Accept error: {}", e);
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    conn_id: usize,
    event: &mio::event::Event,
    poll: &Poll,
    connections: &mut Slab<MioConnection>,
    max_request_size: usize,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return Ok(()),
    };

    if event.is_readable() && !conn.closing {
        handle_readable(conn, max_request_size)?;
    }

    flush(conn)?;

    if conn.write_buf.is_empty() {
        if conn.closing {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closing",
            ));
        }
        if conn.writable {
            poll.registry()
                .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
            conn.writable = false;
        }
    } else if !conn.writable {
        // Socket buffer full, wait for writable
        poll.registry().reregister(
            &mut conn.stream,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        conn.writable = true;
    }

    Ok(())
}

/// Drain the socket, processing complete requests as they arrive.
fn handle_readable(conn: &mut MioConnection, max_request_size: usize) -> io::Result<()> {
    loop {
        let start = conn.read_buf.len();
        conn.read_buf.resize(start + READ_CHUNK, 0);

        let result = conn.stream.read(&mut conn.read_buf[start..]);
        let n = match result {
            Ok(n) => n,
            Err(_) => 0,
        };
        conn.read_buf.truncate(start + n);

        match result {
            Ok(0) => {
                // EOF: answer what we have, then close
                conn.closing = true;
                process_buffered(conn, max_request_size);
                return Ok(());
            }
            Ok(_) => {
                process_buffered(conn, max_request_size);
                if conn.closing {
                    return Ok(());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn process_buffered(conn: &mut MioConnection, max_request_size: usize) {
    loop {
        match process(
            &conn.read_buf,
            &mut conn.write_buf,
            &mut conn.session,
            max_request_size,
        ) {
            ProcessResult::Response { consumed } => conn.read_buf.advance(consumed),
            ProcessResult::NeedData => return,
            ProcessResult::Close | ProcessResult::Quit => {
                conn.closing = true;
                conn.read_buf.clear();
                return;
            }
        }
    }
}

/// Write as much pending response data as the socket accepts.
fn flush(conn: &mut MioConnection) -> io::Result<()> {
    while !conn.write_buf.is_empty() {
        match conn.stream.write(&conn.write_buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.write_buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn close_connection(poll: &Poll, connections: &mut Slab<MioConnection>, conn_id: usize) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        debug!(conn_id, session = conn.session.id(), "Connection closed");
    }
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    #[test]
    fn test_reuseport_listener_binds() {
        let listener = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_worker_round_trip() {
        // Reserve a free port, then let the worker bind it with SO_REUSEPORT.
        let reserved = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let device = EchoDevice::attach(DeviceConfig::default()).unwrap();
        let config = Config {
            listen: addr.to_string(),
            workers: 1,
            ..Config::default()
        };

        let shutdown = Shutdown::new();
        let worker_device = Arc::clone(&device);
        let worker_shutdown = Arc::clone(&shutdown);
        let server = thread::spawn(move || run(&config, worker_device, worker_shutdown));

        let mut client = None;
        for _ in 0..50 {
            match StdTcpStream::connect(addr) {
                Ok(stream) => {
                    client = Some(stream);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut client = client.expect("worker never started listening");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        client
            .write_all(b"WRITE 4\r\nping\r\nSEEK 0\r\nREAD 255\r\nQUIT\r\n")
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"WROTE 4\r\nOFFSET 0\r\nDATA 5\r\nping\0\r\n");

        shutdown.trigger();
        server.join().unwrap().unwrap();
        device.detach().unwrap();
    }

    #[test]
    fn test_shutdown_drops_open_connections() {
        let device = EchoDevice::attach(DeviceConfig::default()).unwrap();
        let reserved = create_listener_with_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);
        let config = Config {
            listen: addr.to_string(),
            ..Config::default()
        };

        let shutdown = Shutdown::new();
        let worker_device = Arc::clone(&device);
        let worker_shutdown = Arc::clone(&shutdown);
        let worker = thread::spawn(move || {
            worker_loop(0, addr, &config, worker_device, &worker_shutdown)
        });

        let mut client = None;
        for _ in 0..50 {
            match StdTcpStream::connect(addr) {
                Ok(stream) => {
                    client = Some(stream);
                    break;
                }
                Err(_) => thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut client = client.expect("worker never started listening");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Wait until the connection holds a session.
        client.write_all(b"SEEK 0\r\n").unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"OFFSET 0\r\n");
        assert_eq!(device.stats().open_sessions, 1);

        shutdown.trigger();
        worker.join().unwrap().unwrap();

        assert_eq!(device.stats().open_sessions, 0);
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);
        device.detach().unwrap();
    }

    #[test]
    fn test_trigger_before_start_stops_worker() {
        let device = EchoDevice::attach(DeviceConfig::default()).unwrap();
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            workers: 2,
            ..Config::default()
        };

        let shutdown = Shutdown::new();
        shutdown.trigger();
        run(&config, Arc::clone(&device), shutdown).unwrap();
        device.detach().unwrap();
    }

    #[test]
    fn test_run_reports_bind_failure() {
        // A plain listener without SO_REUSEPORT keeps every worker out.
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = occupied.local_addr().unwrap();

        let device = EchoDevice::attach(DeviceConfig::default()).unwrap();
        let config = Config {
            listen: addr.to_string(),
            workers: 2,
            ..Config::default()
        };

        let result = run(&config, Arc::clone(&device), Shutdown::new());
        assert!(result.is_err());
        drop(occupied);
        device.detach().unwrap();
    }
}
