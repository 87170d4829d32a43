//! MySQL connection-phase packet structures and protocol constants
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

/// MySQL Handshake V10 packet (server -> client)
#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    /// Protocol version (always 10)
    pub protocol_version: u8,
    /// Server version string (null-terminated on the wire)
    pub server_version: String,
    /// Connection ID
    pub connection_id: u32,
    /// First 8 bytes of the auth scramble
    pub auth_plugin_data_part_1: [u8; 8],
    /// Capability flags (lower 2 bytes)
    pub capability_flags_lower: u16,
    /// Character set
    pub character_set: u8,
    /// Status flags
    pub status_flags: u16,
    /// Capability flags (upper 2 bytes)
    pub capability_flags_upper: u16,
    /// Total auth plugin data length (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_data_length: u8,
    /// Remaining scramble bytes (if CLIENT_SECURE_CONNECTION)
    pub auth_plugin_data_part_2: Vec<u8>,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: String,
}

impl Default for HandshakeV10 {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            server_version: "8.0.36-rds-iam-proxy".to_string(),
            connection_id: 1,
            auth_plugin_data_part_1: [0u8; 8],
            capability_flags_lower: 0,
            character_set: 0x21,  // utf8_general_ci
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            capability_flags_upper: 0,
            auth_plugin_data_length: 21, // 8 + 12 + null terminator
            auth_plugin_data_part_2: vec![0u8; 12],
            auth_plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
        }
    }
}

impl HandshakeV10 {
    /// The full 20-byte scramble (part 1 + first 12 bytes of part 2)
    pub fn scramble(&self) -> Vec<u8> {
        let mut scramble = Vec::with_capacity(20);
        scramble.extend_from_slice(&self.auth_plugin_data_part_1);
        let part2_len = self.auth_plugin_data_part_2.len().min(12);
        scramble.extend_from_slice(&self.auth_plugin_data_part_2[..part2_len]);
        scramble
    }

    /// Combined 32-bit capability flags
    pub fn capability_flags(&self) -> u32 {
        (self.capability_flags_upper as u32) << 16 | self.capability_flags_lower as u32
    }

    /// Set combined 32-bit capability flags
    pub fn set_capability_flags(&mut self, flags: u32) {
        self.capability_flags_lower = (flags & 0xFFFF) as u16;
        self.capability_flags_upper = ((flags >> 16) & 0xFFFF) as u16;
    }
}

/// MySQL Handshake Response 41 packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse41 {
    /// Capability flags
    pub capability_flags: u32,
    /// Max packet size the client will send
    pub max_packet_size: u32,
    /// Character set
    pub character_set: u8,
    /// Username
    pub username: String,
    /// Auth response (scramble answer; encoding depends on capabilities)
    pub auth_response: Vec<u8>,
    /// Initial database (if CLIENT_CONNECT_WITH_DB)
    pub database: Option<String>,
    /// Auth plugin name (if CLIENT_PLUGIN_AUTH)
    pub auth_plugin_name: Option<String>,
}

impl Default for HandshakeResponse41 {
    fn default() -> Self {
        Self {
            capability_flags: 0,
            max_packet_size: 0x00FF_FFFF,
            character_set: 0x21, // utf8_general_ci
            username: String::new(),
            auth_response: Vec::new(),
            database: None,
            auth_plugin_name: None,
        }
    }
}

/// MySQL OK packet (server -> client)
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 0,
        }
    }
}

/// MySQL ERR packet (server -> client)
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    /// Five-character SQLSTATE
    pub sql_state: [u8; 5],
    pub error_message: String,
}

impl ErrPacket {
    /// New error packet with the generic HY000 SQL state
    pub fn new(error_code: u16, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            sql_state: *b"HY000",
            error_message: error_message.into(),
        }
    }

    /// Access denied (1045)
    pub fn access_denied(user: &str, host: &str) -> Self {
        Self::new(
            ER_ACCESS_DENIED_ERROR,
            format!(
                "Access denied for user '{}'@'{}' (using password: YES)",
                user, host
            ),
        )
    }
}

// ============================================================================
// Capability flags
// Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html
// ============================================================================

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
/// Generic compression; incompatible with raw byte forwarding
pub const CLIENT_COMPRESS: u32 = 0x0000_0020;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
/// Switch to TLS after the SSLRequest packet
pub const CLIENT_SSL: u32 = 0x0000_0800;
pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
/// 4.1-style length-prefixed auth response
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_MULTI_STATEMENTS: u32 = 0x0001_0000;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;
/// zstd compression; incompatible with raw byte forwarding
pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: u32 = 0x0400_0000;
/// Per-query attributes change COM_QUERY framing; incompatible with raw forwarding
pub const CLIENT_QUERY_ATTRIBUTES: u32 = 0x0800_0000;

/// Capabilities advertised to desktop clients in our greeting.
///
/// Deliberately conservative: no DEPRECATE_EOF, no session tracking, no
/// compression. Both handshakes must agree on command-phase framing because
/// the relay never re-frames packets.
pub const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_CONNECT_WITH_DB
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH;

/// Base capabilities offered when connecting to the backend.
pub const BACKEND_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_LONG_FLAG
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_STATEMENTS
    | CLIENT_MULTI_RESULTS
    | CLIENT_PS_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH;

/// Capabilities that would require command-phase awareness the byte pipe
/// does not have. Never negotiated on the backend session.
pub const FORWARDING_UNSAFE_CAPABILITIES: u32 =
    CLIENT_QUERY_ATTRIBUTES | CLIENT_COMPRESS | CLIENT_ZSTD_COMPRESSION_ALGORITHM;

// ============================================================================
// Status flags, commands, auth plugins, error codes
// ============================================================================

pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;

/// Close connection (COM_QUIT)
pub const COM_QUIT: u8 = 0x01;
/// Execute SQL (COM_QUERY)
pub const COM_QUERY: u8 = 0x03;
/// Liveness probe (COM_PING)
pub const COM_PING: u8 = 0x0e;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CLEAR_PASSWORD_PLUGIN: &str = "mysql_clear_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// First payload byte of an auth-switch request
pub const AUTH_SWITCH_REQUEST: u8 = 0xFE;
/// First payload byte of extra auth data (caching_sha2 rounds)
pub const AUTH_MORE_DATA: u8 = 0x01;
/// caching_sha2: server accepted the scramble from its cache
pub const CACHING_SHA2_FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2: server needs the cleartext password (only sent over TLS)
pub const CACHING_SHA2_FULL_AUTH_REQUIRED: u8 = 0x04;

/// "Too many connections" (reused for backend-unavailable responses)
pub const ER_CON_COUNT_ERROR: u16 = 1040;
/// "Access denied for user"
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
