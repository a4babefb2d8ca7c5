//! Edge-triggered readiness dispatch over the listening and client sockets.
//!
//! Shaped directly on this crate's earlier `mio`/`slab`-based listener: a `Slab` of live
//! sockets, a `Waker` for cross-thread wake-up, and an accept-until-`WouldBlock` loop. Per-fd
//! serialization (spec.md §9) follows the same resolution that listener used for its
//! connections: a worker is handed an fd once per readable edge, and the fd is only
//! `reregister`-ed — never re-armed early — once that worker reports back that it has drained
//! the socket to `WouldBlock`.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::buffer::ConnBuffer;
use crate::cache::Cache;
use crate::compressor;
use crate::connection::ConnectionTable;
use crate::logger::Logger;
use crate::net::socket;
use crate::rate_limiter::RateLimiter;
use crate::response_writer;
use crate::router::{self, Routed};
use crate::thread_pool::ThreadPool;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_EVENTS: usize = 32;

struct Completion {
    token: Token,
    closed: bool,
}

struct Slot {
    stream: Arc<Mutex<TcpStream>>,
    buffer: Mutex<ConnBuffer>,
}

/// Shared request-handling context, cloned (by `Arc`) into every dispatched task.
pub struct HandlerContext {
    pub static_root: std::path::PathBuf,
    pub cache: Arc<Cache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub connections: Arc<ConnectionTable>,
}

/// The event loop: owns the listening socket, the live-connection slab, and dispatches
/// readiness to the thread pool.
pub struct EventLoop {
    listener: TcpListener,
    poll: Poll,
    sockets: Slab<Arc<Slot>>,
    pool: Arc<ThreadPool>,
    context: Arc<HandlerContext>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    /// Binds the dual-stack listener on `port` and wires it to `pool`.
    pub fn new(port: u16, pool: Arc<ThreadPool>, context: Arc<HandlerContext>) -> std::io::Result<Self> {
        let mut listener = socket::bind_dual_stack(port)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            listener,
            poll,
            sockets: Slab::default(),
            pool,
            context,
            completions_tx,
            completions_rx,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a shareable flag that, when set, terminates [`Self::run`] between iterations.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// The address the listening socket is actually bound to (useful when `port` was `0`).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&mut self) -> std::io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let entry = self.sockets.vacant_entry();
                    let token = Token(entry.key());
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    self.context.connections.insert(token, addr.to_string());
                    entry.insert(Arc::new(Slot {
                        stream: Arc::new(Mutex::new(stream)),
                        buffer: Mutex::new(ConnBuffer::new()),
                    }));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    Logger::global().error(format!("accept failed: {e}"));
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token) {
        let Some(slot) = self.sockets.get(token.0).cloned() else {
            return;
        };

        let context = self.context.clone();
        let completions_tx = self.completions_tx.clone();
        let waker = self.waker.clone();

        let result = self.pool.enqueue(move || {
            let closed = handle_readable(token, &slot, &context);
            let _ = completions_tx.send(Completion { token, closed });
            let _ = waker.wake();
        });

        if result.is_err() {
            // Pool has been stopped; treat as closed so the fd is torn down promptly.
            let _ = self.completions_tx.send(Completion { token, closed: true });
            let _ = self.waker.wake();
        }
    }

    fn complete(&mut self, token: Token) {
        if let Some(slot) = self.sockets.get(token.0) {
            let mut stream = slot.stream.lock().unwrap();
            let _ = self.poll.registry().reregister(&mut *stream, token, Interest::READABLE);
        }
    }

    fn remove(&mut self, token: Token) {
        if let Some(slot) = self.sockets.try_remove(token.0) {
            let mut stream = slot.stream.lock().unwrap();
            let _ = self.poll.registry().deregister(&mut *stream);
        }
        self.context.connections.close(token);
    }

    /// Runs the loop until the stop flag is set. On `EINTR` from the readiness wait, continues.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while !self.stop.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    Logger::global().error(format!("poll failed: {e}"));
                    return;
                }
            }

            if events.is_empty() {
                Logger::global().info("Waiting for events...");
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => {
                        if let Err(e) = self.accept() {
                            Logger::global().error(format!("accept loop failed: {e}"));
                        }
                    }
                    WAKE_TOKEN => {
                        while let Ok(completion) = self.completions_rx.try_recv() {
                            if completion.closed {
                                self.remove(completion.token);
                            } else {
                                self.complete(completion.token);
                            }
                        }
                    }
                    token => self.dispatch(token),
                }
            }
        }
    }
}

/// Drains `slot`'s socket to `WouldBlock`, handling every complete request line found. Returns
/// `true` if the connection should be closed (EOF or hard error).
fn handle_readable(token: Token, slot: &Slot, context: &HandlerContext) -> bool {
    let mut stream = slot.stream.lock().unwrap();
    let mut buffer = slot.buffer.lock().unwrap();

    loop {
        let spare = buffer.spare_mut(64 * 1024);
        match stream.read(spare) {
            Ok(0) => {
                buffer.commit(64 * 1024, 0);
                return true;
            }
            Ok(n) => {
                buffer.commit(64 * 1024, n);
                context.connections.with(token, |info| info.add_bytes_received(n as u64));
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                buffer.commit(64 * 1024, 0);
                break;
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {
                buffer.commit(64 * 1024, 0);
                continue;
            }
            Err(_) => {
                buffer.commit(64 * 1024, 0);
                return true;
            }
        }

        while let Some(consumed) = try_handle_one_request(&mut stream, buffer.readable(), token, context) {
            buffer.mark_read(consumed);
        }
    }

    while let Some(consumed) = try_handle_one_request(&mut stream, buffer.readable(), token, context) {
        buffer.mark_read(consumed);
    }

    false
}

/// Looks for one complete `\r\n\r\n`-terminated request in `data`; if found, handles it and
/// returns the number of bytes consumed.
fn try_handle_one_request(
    stream: &mut TcpStream,
    data: &[u8],
    token: Token,
    context: &HandlerContext,
) -> Option<usize> {
    let text = std::str::from_utf8(data).ok()?;
    let header_end = text.find("\r\n\r\n")? + 4;
    let request = &text[..header_end];

    let path = router::extract_path(request).to_string();
    let is_asset = router::is_asset_request(&path);
    let accepts_gzip = request
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("accept-encoding:"))
        .map(|l| compressor::client_accepts_gzip(&l[l.find(':').map(|i| i + 1).unwrap_or(l.len())..]))
        .unwrap_or(false);

    let client_id = context
        .connections
        .with(token, |info| info.remote_addr().to_string())
        .unwrap_or_default();

    // Non-asset requests get a buffered "Processing request" line, flushed with the rest of
    // this connection's log buffer at close, in insertion order (spec.md §3/§4.9).
    if !is_asset {
        context.connections.with(token, |info| {
            if !info.logged() {
                info.buffer_log(format!("Processing request: {path}"));
                info.mark_logged();
            }
        });
    }

    if !context.rate_limiter.admit(&client_id) {
        let _ = response_writer::write_rate_limited(stream);
        if !is_asset {
            context
                .connections
                .with(token, |info| info.buffer_log(format!("Request completed: {path}")));
        }
        return Some(header_end);
    }

    match router::route(&context.static_root, &path, is_asset) {
        Routed::File { file_path, mime, .. } => {
            match response_writer::write_file_response(stream, &context.cache, &file_path, mime, accepts_gzip) {
                Ok(outcome) => {
                    context.connections.with(token, |info| info.add_bytes_sent(outcome.bytes_sent));
                }
                Err(e) => {
                    Logger::global().error(format!("response write failed: {e}"));
                }
            }
        }
        Routed::NotFound { body, content_type } => {
            match response_writer::write_not_found(stream, &body, content_type) {
                Ok(outcome) => {
                    context.connections.with(token, |info| info.add_bytes_sent(outcome.bytes_sent));
                }
                Err(e) => {
                    Logger::global().error(format!("404 write failed: {e}"));
                }
            }
        }
    }

    if !is_asset {
        context
            .connections
            .with(token, |info| info.buffer_log(format!("Request completed: {path}")));
    }

    Some(header_end)
}
