use core::result;

/// A fallible per-connection operation. Most of the core never needs
/// the error payload itself; the side effect (logging, abandonment)
/// happens at the call site, so the error type stays `()`.
pub type Result<T = (), E = ()> = result::Result<T, E>;
