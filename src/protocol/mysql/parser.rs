//! MySQL packet framing and connection-phase packet encoding/decoding
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::packets::*;
use crate::error::{ProxyError, Result};

// ============================================================================
// Framing
// ============================================================================

/// Read one MySQL packet; returns (sequence id, payload).
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    // 3 bytes little-endian length + 1 byte sequence id
    let payload_length = u32::from_le_bytes([header[0], header[1], header[2], 0]);
    let sequence_id = header[3];

    let mut payload = vec![0u8; payload_length as usize];
    reader.read_exact(&mut payload).await?;

    Ok((sequence_id, payload))
}

/// Write one MySQL packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    sequence_id: u8,
    payload: &[u8],
) -> Result<()> {
    let len = payload.len() as u32;
    let header = [
        (len & 0xFF) as u8,
        ((len >> 8) & 0xFF) as u8,
        ((len >> 16) & 0xFF) as u8,
        sequence_id,
    ];
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// HandshakeV10
// ============================================================================

/// Encode a HandshakeV10 payload.
pub fn build_handshake_v10(hs: &HandshakeV10) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.push(hs.protocol_version);
    payload.extend_from_slice(hs.server_version.as_bytes());
    payload.push(0);
    payload.extend_from_slice(&hs.connection_id.to_le_bytes());
    payload.extend_from_slice(&hs.auth_plugin_data_part_1);
    payload.push(0); // filler
    payload.extend_from_slice(&hs.capability_flags_lower.to_le_bytes());
    payload.push(hs.character_set);
    payload.extend_from_slice(&hs.status_flags.to_le_bytes());
    payload.extend_from_slice(&hs.capability_flags_upper.to_le_bytes());
    payload.push(hs.auth_plugin_data_length);
    payload.extend_from_slice(&[0u8; 10]); // reserved
    payload.extend_from_slice(&hs.auth_plugin_data_part_2);
    payload.push(0);
    payload.extend_from_slice(hs.auth_plugin_name.as_bytes());
    payload.push(0);
    payload
}

/// Decode a HandshakeV10 payload.
pub fn parse_handshake_v10(payload: &[u8]) -> Result<HandshakeV10> {
    let mut cur = Cursor::new(payload);

    let protocol_version = cur.u8()?;
    if protocol_version != 10 {
        return Err(ProxyError::Protocol(format!(
            "unsupported handshake protocol version {}",
            protocol_version
        )));
    }

    let server_version = cur.null_terminated_string()?;
    let connection_id = cur.u32_le()?;
    let mut auth_plugin_data_part_1 = [0u8; 8];
    auth_plugin_data_part_1.copy_from_slice(cur.bytes(8)?);
    cur.skip(1)?; // filler
    let capability_flags_lower = cur.u16_le()?;

    // Everything past this point is optional for ancient servers.
    let mut hs = HandshakeV10 {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data_part_1,
        capability_flags_lower,
        character_set: 0x21,
        status_flags: 0,
        capability_flags_upper: 0,
        auth_plugin_data_length: 0,
        auth_plugin_data_part_2: Vec::new(),
        auth_plugin_name: String::new(),
    };
    if cur.remaining() == 0 {
        return Ok(hs);
    }

    hs.character_set = cur.u8()?;
    hs.status_flags = cur.u16_le()?;
    hs.capability_flags_upper = cur.u16_le()?;
    hs.auth_plugin_data_length = cur.u8()?;
    cur.skip(10)?; // reserved

    if hs.capability_flags() & CLIENT_SECURE_CONNECTION != 0 {
        let part2_len = if hs.auth_plugin_data_length > 8 {
            (hs.auth_plugin_data_length - 8) as usize
        } else {
            13
        };
        let take = part2_len.min(cur.remaining());
        hs.auth_plugin_data_part_2 = cur.bytes(take)?.to_vec();
        if hs.auth_plugin_data_part_2.last() == Some(&0) {
            hs.auth_plugin_data_part_2.pop();
        }
    }

    if hs.capability_flags() & CLIENT_PLUGIN_AUTH != 0 && cur.remaining() > 0 {
        hs.auth_plugin_name = cur.null_terminated_string()?;
    }

    Ok(hs)
}

// ============================================================================
// HandshakeResponse41
// ============================================================================

/// Encode a HandshakeResponse41 payload.
pub fn build_handshake_response41(resp: &HandshakeResponse41) -> Vec<u8> {
    let mut payload = Vec::with_capacity(128);
    payload.extend_from_slice(&resp.capability_flags.to_le_bytes());
    payload.extend_from_slice(&resp.max_packet_size.to_le_bytes());
    payload.push(resp.character_set);
    payload.extend_from_slice(&[0u8; 23]); // reserved
    payload.extend_from_slice(resp.username.as_bytes());
    payload.push(0);

    if resp.capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        write_lenc_int(&mut payload, resp.auth_response.len() as u64);
        payload.extend_from_slice(&resp.auth_response);
    } else if resp.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        payload.push(resp.auth_response.len() as u8);
        payload.extend_from_slice(&resp.auth_response);
    } else {
        payload.extend_from_slice(&resp.auth_response);
        payload.push(0);
    }

    if resp.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
        if let Some(ref db) = resp.database {
            payload.extend_from_slice(db.as_bytes());
            payload.push(0);
        }
    }
    if resp.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
        if let Some(ref name) = resp.auth_plugin_name {
            payload.extend_from_slice(name.as_bytes());
            payload.push(0);
        }
    }
    payload
}

/// Encode the 32-byte SSLRequest packet (a HandshakeResponse41 cut off
/// before the username, with CLIENT_SSL set).
pub fn build_ssl_request(capability_flags: u32, character_set: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);
    payload.extend_from_slice(&(capability_flags | CLIENT_SSL).to_le_bytes());
    payload.extend_from_slice(&0x00FF_FFFFu32.to_le_bytes());
    payload.push(character_set);
    payload.extend_from_slice(&[0u8; 23]);
    payload
}

/// Decode a HandshakeResponse41 payload.
///
/// Trailing connect attributes (CLIENT_CONNECT_ATTRS) are ignored; the proxy
/// has no use for them.
pub fn parse_handshake_response41(payload: &[u8]) -> Result<HandshakeResponse41> {
    let mut cur = Cursor::new(payload);

    let capability_flags = cur.u32_le()?;
    let max_packet_size = cur.u32_le()?;
    let character_set = cur.u8()?;
    cur.skip(23)?; // reserved
    let username = cur.null_terminated_string()?;

    let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let len = cur.lenc_int()? as usize;
        cur.bytes(len)?.to_vec()
    } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
        let len = cur.u8()? as usize;
        cur.bytes(len)?.to_vec()
    } else {
        cur.null_terminated_string()?.into_bytes()
    };

    let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && cur.remaining() > 0 {
        Some(cur.null_terminated_string()?)
    } else {
        None
    };

    let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && cur.remaining() > 0 {
        Some(cur.null_terminated_string()?)
    } else {
        None
    };

    Ok(HandshakeResponse41 {
        capability_flags,
        max_packet_size,
        character_set,
        username,
        auth_response,
        database,
        auth_plugin_name,
    })
}

/// True when a 32-byte response is actually an SSLRequest.
pub fn is_ssl_request(payload: &[u8]) -> bool {
    payload.len() == 32
        && u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) & CLIENT_SSL != 0
}

// ============================================================================
// OK / ERR
// ============================================================================

/// Encode an OK packet payload (protocol 4.1 form).
pub fn build_ok_packet(ok: &OkPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16);
    payload.push(0x00);
    write_lenc_int(&mut payload, ok.affected_rows);
    write_lenc_int(&mut payload, ok.last_insert_id);
    payload.extend_from_slice(&ok.status_flags.to_le_bytes());
    payload.extend_from_slice(&ok.warnings.to_le_bytes());
    payload
}

/// Encode an ERR packet payload (protocol 4.1 form).
pub fn build_err_packet(err: &ErrPacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + err.error_message.len());
    payload.push(0xFF);
    payload.extend_from_slice(&err.error_code.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(&err.sql_state);
    payload.extend_from_slice(err.error_message.as_bytes());
    payload
}

/// Decode an ERR packet payload (protocol 4.1 form).
pub fn parse_err_packet(payload: &[u8]) -> Result<ErrPacket> {
    let mut cur = Cursor::new(payload);
    if cur.u8()? != 0xFF {
        return Err(ProxyError::Protocol("not an ERR packet".into()));
    }
    let error_code = cur.u16_le()?;
    let mut sql_state = *b"HY000";
    if cur.remaining() > 0 && payload[3] == b'#' {
        cur.skip(1)?;
        sql_state.copy_from_slice(cur.bytes(5)?);
    }
    let error_message = String::from_utf8_lossy(cur.rest()).to_string();
    Ok(ErrPacket {
        error_code,
        sql_state,
        error_message,
    })
}

/// True for OK packets (0x00 header, or 0xFE EOF-as-OK).
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] == 0x00 || payload[0] == 0xFE)
}

/// True for ERR packets.
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

// ============================================================================
// Cursor and length-encoded integers
// ============================================================================

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProxyError::Protocol("truncated packet".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn null_terminated_string(&mut self) -> Result<String> {
        let rest = self.rest();
        let null_pos = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ProxyError::Protocol("missing null terminator".into()))?;
        let s = String::from_utf8_lossy(&rest[..null_pos]).to_string();
        self.pos += null_pos + 1;
        Ok(s)
    }

    fn lenc_int(&mut self) -> Result<u64> {
        match self.u8()? {
            0xFB => Ok(0), // NULL marker, only meaningful in row data
            0xFC => Ok(self.u16_le()? as u64),
            0xFD => {
                let b = self.bytes(3)?;
                Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64)
            }
            0xFE => {
                let b = self.bytes(8)?;
                Ok(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))
            }
            0xFF => Err(ProxyError::Protocol(
                "invalid length-encoded int marker 0xFF".into(),
            )),
            n => Ok(n as u64),
        }
    }
}

/// Append a length-encoded integer.
pub fn write_lenc_int(buf: &mut Vec<u8>, value: u64) {
    if value < 251 {
        buf.push(value as u8);
    } else if value < 65536 {
        buf.push(0xFC);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value < 16_777_216 {
        buf.push(0xFD);
        buf.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
    } else {
        buf.push(0xFE);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Append a length-encoded string.
pub fn write_lenc_str(buf: &mut Vec<u8>, value: &str) {
    write_lenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_framing_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_packet(&mut a, 3, b"hello").await.unwrap();
        let (seq, payload) = read_packet(&mut b).await.unwrap();
        assert_eq!(seq, 3);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_handshake_v10_roundtrip() {
        let mut hs = HandshakeV10 {
            server_version: "8.0.32".to_string(),
            connection_id: 12345,
            auth_plugin_data_part_1: [1, 2, 3, 4, 5, 6, 7, 8],
            auth_plugin_data_part_2: vec![9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20],
            ..HandshakeV10::default()
        };
        hs.set_capability_flags(SERVER_CAPABILITIES);

        let parsed = parse_handshake_v10(&build_handshake_v10(&hs)).unwrap();
        assert_eq!(parsed.server_version, "8.0.32");
        assert_eq!(parsed.connection_id, 12345);
        assert_eq!(parsed.capability_flags(), SERVER_CAPABILITIES);
        assert_eq!(parsed.scramble(), hs.scramble());
        assert_eq!(parsed.auth_plugin_name, NATIVE_PASSWORD_PLUGIN);
    }

    #[test]
    fn test_handshake_response41_roundtrip() {
        let resp = HandshakeResponse41 {
            capability_flags: BACKEND_CAPABILITIES | CLIENT_CONNECT_WITH_DB,
            username: "app_rw".to_string(),
            auth_response: (1..=20).collect(),
            database: Some("orders".to_string()),
            auth_plugin_name: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
            ..HandshakeResponse41::default()
        };

        let parsed = parse_handshake_response41(&build_handshake_response41(&resp)).unwrap();
        assert_eq!(parsed.username, "app_rw");
        assert_eq!(parsed.auth_response.len(), 20);
        assert_eq!(parsed.database.as_deref(), Some("orders"));
        assert_eq!(parsed.auth_plugin_name.as_deref(), Some(NATIVE_PASSWORD_PLUGIN));
    }

    #[test]
    fn test_ssl_request_detected() {
        let payload = build_ssl_request(BACKEND_CAPABILITIES, 0x21);
        assert_eq!(payload.len(), 32);
        assert!(is_ssl_request(&payload));

        let plain = build_handshake_response41(&HandshakeResponse41 {
            capability_flags: BACKEND_CAPABILITIES,
            username: "u".into(),
            ..HandshakeResponse41::default()
        });
        assert!(!is_ssl_request(&plain));
    }

    #[test]
    fn test_err_packet_roundtrip() {
        let err = ErrPacket::new(1040, "backend unavailable");
        let parsed = parse_err_packet(&build_err_packet(&err)).unwrap();
        assert_eq!(parsed.error_code, 1040);
        assert_eq!(&parsed.sql_state, b"HY000");
        assert_eq!(parsed.error_message, "backend unavailable");
    }

    #[test]
    fn test_packet_type_detection() {
        assert!(is_ok_packet(&build_ok_packet(&OkPacket::default())));
        assert!(is_err_packet(&build_err_packet(&ErrPacket::new(1045, "no"))));
        assert!(!is_ok_packet(&[]));
        assert!(!is_err_packet(&[]));
    }

    #[test]
    fn test_lenc_int_roundtrip() {
        for value in [0u64, 5, 250, 251, 65535, 65536, 16_777_215, 16_777_216, u64::MAX] {
            let mut buf = Vec::new();
            write_lenc_int(&mut buf, value);
            let mut cur = Cursor::new(&buf);
            assert_eq!(cur.lenc_int().unwrap(), value, "value {}", value);
            assert_eq!(cur.remaining(), 0);
        }
    }

    #[test]
    fn test_lenc_int_rejects_err_marker() {
        let mut cur = Cursor::new(&[0xFF]);
        assert!(cur.lenc_int().is_err());
    }

    #[test]
    fn test_truncated_packet_rejected() {
        assert!(parse_handshake_response41(&[0x00, 0x02]).is_err());
        assert!(parse_handshake_v10(&[]).is_err());
    }
}
