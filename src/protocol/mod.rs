//! MySQL wire protocol support
//!
//! Only what the proxy's two handshakes need: packet framing, the
//! connection-phase packets, and the auth scramble math. Command-phase
//! traffic is never parsed; it is piped byte-for-byte.

pub mod mysql;
