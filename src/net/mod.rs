//! The raw-syscall surface `mio`/`std::net` don't expose.

pub mod socket;
