//! Page mapping utilities and executable-memory arenas for JITs.
mod arena;
mod vm;

pub use arena::CodeArena;
pub use vm::{Protection, Reservation, VmError};

#[cfg(unix)]
pub use vm::SharedMem;
