//! Switchyard Store
//!
//! File-backed [`switchyard_core::Persistence`]. Everything lives under
//! one data directory; secrets are written owner-only.

mod storage;

pub use storage::DiskStorage;
