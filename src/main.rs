//! Entry point: loads configuration, installs signal handling, and runs the server until
//! `SIGINT`/`SIGTERM`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pgs::config;
use pgs::logger::Logger;
use pgs::server::Server;

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("pgs_conf.json"));

    let config = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            Logger::global().error(format!("{e}"));
            Logger::global().shutdown();
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handlers(running.clone());

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            Logger::global().error(format!("failed to start server: {e}"));
            Logger::global().shutdown();
            std::process::exit(1);
        }
    };

    server.run_until(|| !running.load(Ordering::SeqCst));
    Logger::global().shutdown();
}

static mut SHARED_RUNNING: Option<Arc<AtomicBool>> = None;

fn install_signal_handlers(running: Arc<AtomicBool>) {
    // Safety: this runs once at startup, before any other thread is spawned, so the write to
    // `SHARED_RUNNING` happens-before every read performed by the signal handler.
    unsafe {
        SHARED_RUNNING = Some(running);
    }

    extern "C" fn on_signal(_sig: libc::c_int) {
        // Safety: `SHARED_RUNNING` is written once at startup before any signal is unmasked.
        // Signal handlers may only call async-signal-safe functions; `Ordering::SeqCst` store on
        // an already-initialized `Arc`'s inner `AtomicBool` qualifies.
        unsafe {
            if let Some(flag) = SHARED_RUNNING.as_ref() {
                flag.store(false, Ordering::SeqCst);
            }
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}
