//! Compile-time configuration. The design excludes persistent or
//! hot-reloadable configuration, so every tunable here is a `const`,
//! the same way `original_source/include/config.h` keeps its knobs as
//! preprocessor defines.

/// Fixed capacity of the stream pool (one listen stream plus accepted pairs).
pub const POOL_SIZE: usize = 256;

/// `listen(2)` backlog for the entrance socket.
pub const LISTEN_BACKLOG: i32 = 4;

/// Reactor wait timeout per cycle, in milliseconds.
pub const POLL_TIMEOUT_MSEC: u64 = 16_000;

/// Maximum bytes moved per forwarding step.
pub const FORWARD_CHUNK_LEN: usize = 16_384;

/// Upper bound on one SOCKS5 handshake `recv`.
pub const HANDSHAKE_READ_MAX: usize = 2_048;

/// Capacity of each stream's embedded byte queue.
pub const QUEUE_CAPACITY: usize = 2_048;

/// Reject CONNECT targets resolving into 127.0.0.0/8.
pub const BLOCK_LOCALHOST_PORTS: bool = true;

/// Reject CONNECT targets whose port isn't 443.
pub const HTTPS_TRAFFIC_ONLY: bool = false;
