//! Raw-syscall surface for socket tuning and zero-copy file transfer.
//!
//! `mio` and `std::net` deliberately don't expose dual-stack binding, keepalive tuning,
//! `TCP_CORK`, `sendfile`, or `O_DIRECT`; this module reaches for `libc` directly, the crate
//! `mio` itself is built on.

use std::fs::{File, OpenOptions};
use std::io::{self, Error, ErrorKind};
use std::net::TcpListener as StdTcpListener;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use mio::net::TcpListener as MioTcpListener;

const LISTEN_BACKLOG: i32 = 42; // the ultimate answer

/// Opens a non-blocking, dual-stack (`V6ONLY=0`) IPv6 listener bound to `[::]:port`, with
/// `SO_REUSEADDR`/`SO_REUSEPORT` set, per spec.md §4.6.
pub fn bind_dual_stack(port: u16) -> io::Result<MioTcpListener> {
    // Safety: `socket` is called with constant, valid arguments; the returned fd is checked for
    // -1 before any further use.
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }

    let guard = FdGuard(fd);

    set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0)?;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;

    let addr: libc::sockaddr_in6 = unsafe {
        let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        addr.sin6_addr = libc::in6addr_any;
        addr
    };

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }

    let rc = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }

    set_nonblocking(fd)?;

    // `guard` has done its job keeping the fd closed on early return; hand ownership to the
    // std socket, then to mio.
    std::mem::forget(guard);
    let std_listener = unsafe { StdTcpListener::from_raw_fd(fd) };
    Ok(MioTcpListener::from_std(std_listener))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

struct FdGuard(RawFd);

impl Drop for FdGuard {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Uncorks `TCP_CORK` on drop, guaranteeing the guard runs on every exit path including
/// partial-write failures.
pub struct CorkGuard {
    fd: RawFd,
}

impl Drop for CorkGuard {
    fn drop(&mut self) {
        let _ = set_opt(self.fd, libc::IPPROTO_TCP, libc::TCP_CORK, 0);
    }
}

/// Applies the per-response socket tuning from spec.md §4.8: keepalive timers and `TCP_CORK`.
/// Returns a guard that uncorks the socket when dropped.
pub fn tune_connection(fd: RawFd) -> io::Result<CorkGuard> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 60)?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, 10)?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 3)?;
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_CORK, 1)?;
    Ok(CorkGuard { fd })
}

/// Opens `path`, using `O_DIRECT` when `size` exceeds the `O_DIRECT` threshold. Falls back to a
/// plain open if the filesystem rejects `O_DIRECT` with `EINVAL`. Always applies
/// `posix_fadvise(SEQUENTIAL)`.
pub fn open_for_read(path: &Path, size: u64, o_direct_threshold: u64) -> io::Result<File> {
    let file = if size > o_direct_threshold {
        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::InvalidInput || e.raw_os_error() == Some(libc::EINVAL) => {
                OpenOptions::new().read(true).open(path)?
            }
            Err(e) => return Err(e),
        }
    } else {
        OpenOptions::new().read(true).open(path)?
    };

    let _ = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL) };

    Ok(file)
}

/// Sends up to `count` bytes from `in_fd` to `out_fd` via the kernel `sendfile` path, advancing
/// `offset`. Returns `Ok(0)` on EOF. Transient errors (`EAGAIN`/`EWOULDBLOCK`) surface as
/// `io::ErrorKind::WouldBlock`; `EINVAL`/`ENOSYS` surface unchanged so the caller can fall back
/// to `mmap`.
pub fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
    let rc = unsafe { libc::sendfile(out_fd, in_fd, offset as *mut i64, count) };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    Ok(rc as usize)
}

/// A raw `mmap`ped region, attempted with `MAP_HUGETLB` and released via `munmap` on drop.
pub struct HugeMmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl HugeMmap {
    /// Attempts a huge-page mapping of `fd` covering `len` bytes starting at offset 0.
    pub fn map(fd: RawFd, len: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_HUGETLB,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        unsafe {
            libc::madvise(ptr, len, libc::MADV_SEQUENTIAL);
        }
        Ok(Self { ptr, len })
    }

    /// Borrows the mapped region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: `ptr` is a valid mapping of `len` readable bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for HugeMmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// Safety: the mapping is read-only and never mutated after creation.
unsafe impl Send for HugeMmap {}
unsafe impl Sync for HugeMmap {}
