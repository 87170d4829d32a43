//! MySQL connection-phase protocol
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase.html>

pub mod auth;
pub mod packets;
pub mod parser;
