//! Kern subsystem - Core kernel primitives
//!
//! Based on Mach4 kern/ directory

pub mod lock;

pub use lock::{ReadGuard, RwLock, WriteGuard};
