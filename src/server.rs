//! # Connection Listener and Event Loop
//!
//! The daemon listens on exactly one transport: a per-user Unix socket or a
//! TCP port, never both. Every accepted connection gets a reader thread
//! that does nothing but reframe the byte stream into complete lines and
//! push them down a channel; the acceptor thread does nothing but accept.
//! All daemon state lives with the single loop in [`run`], which also
//! derives the ≈500 ms housekeeping tick from its receive timeout. That
//! one-thread ownership is what makes the rest of the daemon lock-free.
//!
//! Failure to set the listener up is fatal with a distinct exit code per
//! failure class; the daemon cannot do anything without its socket.

use anyhow::Result;
use log::{debug, error, info, warn};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Transport, TICK_INTERVAL};
use crate::protocol::{ConnId, Daemon};

/// Exit code when the socket cannot be created.
pub const EXIT_SOCKET: i32 = 3;
/// Exit code when the socket cannot be bound.
pub const EXIT_BIND: i32 = 4;
/// Exit code when the socket cannot be listened on.
pub const EXIT_LISTEN: i32 = 5;

/// Everything the framing layer can tell the event loop.
pub enum Event {
    /// New connection; the writer is how replies reach it.
    Connected(ConnId, Box<dyn Write + Send>),
    /// One complete line, end-of-line characters stripped.
    Line(ConnId, String),
    /// The peer went away (or sent something unreadable).
    Disconnected(ConnId),
}

/// One listener type for both transports; the handshake decides what a
/// connection is for, not the listener.
pub enum ControlListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// Bind the control socket.
pub fn bind(transport: &Transport) -> io::Result<ControlListener> {
    match transport {
        Transport::Unix(path) => {
            // A socket file left over from an earlier run would fail the
            // bind; the instance lock already guarantees we own it.
            let _ = fs::remove_file(path);
            UnixListener::bind(path).map(ControlListener::Unix)
        }
        Transport::Tcp(port) => TcpListener::bind(("0.0.0.0", *port)).map(ControlListener::Tcp),
    }
}

/// Map a setup failure to its exit code class.
///
/// std fuses the create/bind/listen syscalls into one call, so the class
/// is recovered from the error kind.
pub fn setup_exit_code(e: &io::Error) -> i32 {
    match e.kind() {
        io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput => EXIT_BIND,
        io::ErrorKind::Unsupported | io::ErrorKind::OutOfMemory => EXIT_SOCKET,
        _ => EXIT_LISTEN,
    }
}

impl ControlListener {
    /// Short description of where we listen, for the startup log line.
    pub fn describe(&self) -> String {
        match self {
            ControlListener::Unix(listener) => {
                let path = listener
                    .local_addr()
                    .ok()
                    .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
                    .unwrap_or_default();
                format!("local socket {path}")
            }
            ControlListener::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("TCP port {}", addr.port()),
                Err(_) => "TCP".to_string(),
            },
        }
    }

    #[allow(clippy::type_complexity)]
    fn accept(&self) -> io::Result<(Box<dyn Read + Send>, Box<dyn Write + Send>, String)> {
        match self {
            ControlListener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                let writer = stream.try_clone()?;
                Ok((Box::new(stream), Box::new(writer), "local client".to_string()))
            }
            ControlListener::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                let writer = stream.try_clone()?;
                Ok((Box::new(stream), Box::new(writer), addr.to_string()))
            }
        }
    }
}

/// Drive the daemon until its player disconnects or a signal asks us to
/// stop. All state mutation happens on this thread.
pub fn run(listener: ControlListener, daemon: &mut Daemon) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    spawn_acceptor(listener, tx);
    install_signal_handlers();

    let mut last_tick = Instant::now();
    loop {
        if shutdown_requested() || daemon.should_exit() {
            break;
        }

        let wait = TICK_INTERVAL.saturating_sub(last_tick.elapsed());
        match rx.recv_timeout(wait) {
            Ok(event) => daemon.handle_event(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_tick.elapsed() >= TICK_INTERVAL {
            daemon.do_events();
            last_tick = Instant::now();
        }
    }

    info!("shutting down");
    Ok(())
}

fn spawn_acceptor(listener: ControlListener, tx: Sender<Event>) {
    thread::spawn(move || {
        let mut next_id: ConnId = 0;
        loop {
            match listener.accept() {
                Ok((reader, writer, peer)) => {
                    next_id += 1;
                    let id = next_id;
                    debug!("incoming connection {id} from {peer}");
                    if tx.send(Event::Connected(id, writer)).is_err() {
                        return;
                    }
                    let tx = tx.clone();
                    thread::spawn(move || reader_loop(id, reader, &tx));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    // A persistent accept failure must not busy-loop.
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });
}

/// Reframe an arbitrary byte stream into complete lines. Runs on its own
/// thread and never touches daemon state.
fn reader_loop(id: ConnId, stream: Box<dyn Read + Send>, tx: &Sender<Event>) {
    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = buf.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(Event::Line(id, line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                // Unreadable input counts as a disconnect.
                warn!("connection {id} read error: {e}");
                break;
            }
        }
    }
    let _ = tx.send(Event::Disconnected(id));
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Interrupt and terminate request an orderly stop; so does a pipe error,
/// since a half-dead peer socket gives the daemon nothing to work with.
fn install_signal_handlers() {
    let handler = request_shutdown as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, handler as libc::sighandler_t);
    }
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}
