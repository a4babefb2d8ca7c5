//! Wires every component together and owns the server's lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cache::Cache;
use crate::config::Config;
use crate::connection::ConnectionTable;
use crate::listener::{EventLoop, HandlerContext};
use crate::logger::Logger;
use crate::rate_limiter::RateLimiter;
use crate::thread_pool::ThreadPool;

/// Owns the listener/event loop, thread pool, cache, rate limiter, and connection table for one
/// running server instance.
pub struct Server {
    event_loop_thread: Option<std::thread::JoinHandle<()>>,
    event_loop_stop: Arc<AtomicBool>,
    pool: Arc<ThreadPool>,
    local_addr: std::net::SocketAddr,
    cache: Arc<Cache>,
}

impl Server {
    /// Builds every component from `config` and binds the listener, but does not yet accept
    /// connections — call [`Self::run`] for that.
    pub fn new(config: Config) -> std::io::Result<Self> {
        let cache = Arc::new(Cache::new(config.cache_size_bytes, config.cache_max_age_seconds));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window_seconds,
        ));
        let connections = Arc::new(ConnectionTable::new());
        let pool = Arc::new(ThreadPool::new(config.thread_count));

        let context = Arc::new(HandlerContext {
            static_root: config.static_folder.clone(),
            cache: cache.clone(),
            rate_limiter,
            connections,
        });

        let mut event_loop = EventLoop::new(config.port, pool.clone(), context)?;
        let event_loop_stop = event_loop.stop_flag();
        let local_addr = event_loop.local_addr()?;

        let event_loop_thread = std::thread::spawn(move || event_loop.run());

        Logger::global().success(format!("Listening on port {}", config.port));

        Ok(Self {
            event_loop_thread: Some(event_loop_thread),
            event_loop_stop,
            pool,
            local_addr,
            cache,
        })
    }

    /// The address the listening socket is actually bound to (useful when `port` was `0`).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// A point-in-time snapshot of cache occupancy.
    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// Blocks the calling thread until `should_stop` reports true, then orchestrates shutdown:
    /// stop the event loop, drain the thread pool, join everything.
    pub fn run_until(self, should_stop: impl Fn() -> bool) {
        while !should_stop() {
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        self.stop();
    }

    /// Flips the stop flag, joins the event loop thread, and stops the thread pool.
    pub fn stop(mut self) {
        self.event_loop_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.event_loop_thread.take() {
            let _ = handle.join();
        }
        Arc::get_mut(&mut self.pool).map(ThreadPool::stop);
        Logger::global().info("Server stopped");
    }
}
