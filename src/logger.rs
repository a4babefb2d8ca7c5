//! Asynchronous batched logger.
//!
//! A single background thread owns both sinks (the append-only log file and the terminal).
//! Producers never block on I/O: they push onto a mutex-protected queue and signal a condition
//! variable. The drain thread wakes on that signal or a 1 second timeout, whichever comes
//! first, and moves up to 100 messages per pass.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use colored::Colorize;
use once_cell::sync::OnceCell;

const DRAIN_BATCH: usize = 100;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(5);
const WAITING_FOR_EVENTS: &str = "Waiting for events...";

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Routine informational message.
    Info,
    /// A request or operation completed successfully.
    Success,
    /// A recoverable problem occurred.
    Warning,
    /// An unrecoverable or notable failure occurred.
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A single queued log entry.
#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    client_id: Option<String>,
    text: String,
}

struct Shared {
    queue: Mutex<VecDeque<LogMessage>>,
    condvar: Condvar,
    stopping: AtomicBool,
    last_event_wait_log: Mutex<Option<DateTime<Utc>>>,
}

/// Process-wide asynchronous logger.
pub struct Logger {
    shared: Arc<Shared>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
}

static INSTANCE: OnceCell<Logger> = OnceCell::new();

impl Logger {
    fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
            last_event_wait_log: Mutex::new(None),
        });

        let drain_shared = shared.clone();
        let drain_thread = std::thread::spawn(move || drain_loop(drain_shared));

        Self {
            shared,
            drain_thread: Mutex::new(Some(drain_thread)),
        }
    }

    /// Returns the process-wide logger, starting its drain thread on first access.
    pub fn global() -> &'static Logger {
        INSTANCE.get_or_init(Logger::new)
    }

    /// Queues a message at the given level, optionally tagged with a client identifier.
    ///
    /// Best-effort: a full disk or closed stdout never propagates back to the caller.
    pub fn log(&self, level: LogLevel, client_id: Option<&str>, text: impl Into<String>) {
        let text = text.into();

        if text.eq_ignore_ascii_case(WAITING_FOR_EVENTS) {
            let now = Utc::now();
            let mut last = self.shared.last_event_wait_log.lock().unwrap();
            if let Some(prev) = *last {
                if now.signed_duration_since(prev).to_std().unwrap_or_default()
                    < EVENT_WAIT_LOG_INTERVAL
                {
                    return;
                }
            }
            *last = Some(now);
        }

        let message = LogMessage {
            timestamp: Utc::now(),
            level,
            client_id: client_id.map(str::to_owned),
            text,
        };

        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(message);
        self.shared.condvar.notify_one();
    }

    /// Convenience wrapper for [`LogLevel::Info`].
    pub fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, None, text);
    }

    /// Convenience wrapper for [`LogLevel::Success`].
    pub fn success(&self, text: impl Into<String>) {
        self.log(LogLevel::Success, None, text);
    }

    /// Convenience wrapper for [`LogLevel::Warning`].
    pub fn warning(&self, text: impl Into<String>) {
        self.log(LogLevel::Warning, None, text);
    }

    /// Convenience wrapper for [`LogLevel::Error`].
    pub fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, None, text);
    }

    /// Flips the stop flag, wakes the drain thread, and joins it after it finishes draining
    /// whatever remains in the queue.
    ///
    /// Must be called by the main thread only, after every producer thread has already joined,
    /// to avoid a teardown-order hazard where a worker logs into a closed queue.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.drain_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop(shared: Arc<Shared>) {
    let mut log_file = open_log_file();

    loop {
        let mut batch = Vec::with_capacity(DRAIN_BATCH);
        {
            let mut queue = shared.queue.lock().unwrap();
            if queue.is_empty() && !shared.stopping.load(Ordering::SeqCst) {
                let (guard, _timeout) = shared
                    .condvar
                    .wait_timeout(queue, DRAIN_TIMEOUT)
                    .unwrap();
                queue = guard;
            }
            while batch.len() < DRAIN_BATCH {
                match queue.pop_front() {
                    Some(msg) => batch.push(msg),
                    None => break,
                }
            }
        }

        for msg in &batch {
            write_message(log_file.as_mut(), msg);
        }

        if batch.is_empty() && shared.stopping.load(Ordering::SeqCst) {
            break;
        }
    }
}

fn open_log_file() -> Option<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open("pgs.log")
        .ok()
}

fn write_message(log_file: Option<&mut File>, msg: &LogMessage) {
    let timestamp = msg.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
    let client = msg
        .client_id
        .as_deref()
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default();
    let line = format!("[{timestamp}] [{}]{client} {}", msg.level.label(), msg.text);

    if let Some(file) = log_file {
        let _ = writeln!(file, "{line}");
        let _ = file.flush();
    }

    let colored_line = match msg.level {
        LogLevel::Error => line.red(),
        LogLevel::Warning => line.yellow(),
        LogLevel::Success => line.green(),
        LogLevel::Info => line.normal(),
    };
    println!("{colored_line}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wait_dedup_window_suppresses_rapid_repeats() {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
            last_event_wait_log: Mutex::new(None),
        });
        let logger = Logger {
            shared: shared.clone(),
            drain_thread: Mutex::new(None),
        };

        logger.log(LogLevel::Info, None, "Waiting for events...");
        logger.log(LogLevel::Info, None, "Waiting for events...");

        assert_eq!(shared.queue.lock().unwrap().len(), 1);
    }

    #[test]
    fn ordinary_messages_are_never_deduped() {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stopping: AtomicBool::new(false),
            last_event_wait_log: Mutex::new(None),
        });
        let logger = Logger {
            shared: shared.clone(),
            drain_thread: Mutex::new(None),
        };

        logger.log(LogLevel::Info, None, "Processing request: /index.html");
        logger.log(LogLevel::Info, None, "Processing request: /index.html");

        assert_eq!(shared.queue.lock().unwrap().len(), 2);
    }
}
