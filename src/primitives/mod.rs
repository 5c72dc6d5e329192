//! Low-level primitives for building the node storage engine.
//!
//! Includes the binary cursor and string encodings, and the backing-store
//! abstraction the directory reads and writes through.

/// Byte-level utilities and encoding/decoding.
///
/// Typed little-endian cursor with scoped out-of-band writes, plus the
/// narrow and wide string encodings used by the container.
pub mod bytes;

/// I/O abstractions and utilities.
///
/// Positioned access to the container file (or an in-memory image of it).
pub mod io;
