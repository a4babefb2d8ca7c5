//! Per-connection state and the table that owns it.

use std::collections::HashMap;
use std::time::Instant;

use mio::Token;
use parking_lot::Mutex;

use crate::logger::Logger;

/// Bookkeeping for one live client socket, from accept to close.
#[derive(Debug)]
pub struct ConnectionInfo {
    start: Instant,
    remote_addr: String,
    logged: bool,
    closure_logged: bool,
    bytes_received: u64,
    bytes_sent: u64,
    log_buffer: Vec<String>,
}

impl ConnectionInfo {
    fn new(remote_addr: String) -> Self {
        Self {
            start: Instant::now(),
            remote_addr,
            logged: false,
            closure_logged: false,
            bytes_received: 0,
            bytes_sent: 0,
            log_buffer: Vec::new(),
        }
    }

    /// The remote peer's address, used as the rate limiter's client identifier.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Appends a message to this connection's pending log buffer; flushed on close.
    pub fn buffer_log(&mut self, text: impl Into<String>) {
        self.log_buffer.push(text.into());
    }

    /// Records bytes read from the socket.
    pub fn add_bytes_received(&mut self, n: u64) {
        self.bytes_received += n;
    }

    /// Records bytes written to the socket. Per spec.md §4.8, the total wire bytes emitted for
    /// a response are added once, on success.
    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    /// Whether the first request on this connection has already been logged.
    pub fn logged(&self) -> bool {
        self.logged
    }

    /// Marks the first request on this connection as logged.
    pub fn mark_logged(&mut self) {
        self.logged = true;
    }
}

/// A mapping from socket token to connection state, guarded by one mutex.
#[derive(Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<Token, ConnectionInfo>>,
}

impl ConnectionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly accepted connection.
    pub fn insert(&self, token: Token, remote_addr: String) {
        self.connections
            .lock()
            .insert(token, ConnectionInfo::new(remote_addr));
    }

    /// Runs `f` against the connection's state under the table lock. No-op if `token` is
    /// unknown (e.g. already closed).
    pub fn with<R>(&self, token: Token, f: impl FnOnce(&mut ConnectionInfo) -> R) -> Option<R> {
        let mut guard = self.connections.lock();
        guard.get_mut(&token).map(f)
    }

    /// Removes and returns `token`'s state, idempotently logging its close summary exactly
    /// once. Returns `None` if `token` was already removed.
    pub fn close(&self, token: Token) -> Option<()> {
        let mut guard = self.connections.lock();
        let mut info = guard.remove(&token)?;

        if info.closure_logged {
            return Some(());
        }
        info.closure_logged = true;
        drop(guard);

        let duration = info.start.elapsed();
        for line in &info.log_buffer {
            Logger::global().info(line.clone());
        }
        Logger::global().info(format!(
            "Connection closed: {} duration={:.3}s received={}B sent={}B",
            info.remote_addr,
            duration.as_secs_f64(),
            info.bytes_received,
            info.bytes_sent
        ));

        Some(())
    }

    /// Number of currently tracked connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// True if no connections are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_close_round_trip() {
        let table = ConnectionTable::new();
        let token = Token(1);
        table.insert(token, "127.0.0.1:9000".to_string());
        assert_eq!(table.len(), 1);

        table.with(token, |info| {
            info.add_bytes_received(100);
            info.add_bytes_sent(200);
            info.buffer_log("Processing request: /index.html");
        });

        table.close(token);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let table = ConnectionTable::new();
        let token = Token(1);
        table.insert(token, "127.0.0.1:9000".to_string());
        table.close(token);
        // second close on an already-removed token is simply a no-op
        assert!(table.close(token).is_none());
    }

    #[test]
    fn with_on_unknown_token_is_a_noop() {
        let table = ConnectionTable::new();
        assert!(table.with(Token(42), |_| ()).is_none());
    }
}
