//! Error types for the few operations that can fail at the OS boundary.
//!
//! Everything else in this crate is infallible: invariant violations and
//! capacity exhaustion are fatal assertions, and an unresolvable binding is
//! a normal outcome reported by the resolver handshake.

use std::io;

use thiserror::Error;

/// Failure to map or protect a code region.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to map {capacity} bytes for code region `{name}`: {source}")]
    Map {
        name: &'static str,
        capacity: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to change protection of code region `{name}`: {source}")]
    Protect {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Failure while rewriting a smashable site.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to make page {page:#x} writable: {source}")]
    MakeWritable {
        page: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to restore execute permission on page {page:#x}: {source}")]
    MakeExecutable {
        page: usize,
        #[source]
        source: io::Error,
    },
}
