//! Backend session establishment
//!
//! The factory resolves an IAM token from the cache, opens a TLS session to
//! the RDS endpoint, and completes the MySQL client handshake as the
//! configured database user with the token as its password.
//!
//! RDS IAM authentication ends in a `mysql_clear_password` auth switch: the
//! token goes over the (mandatory) TLS session verbatim. The factory also
//! answers `mysql_native_password` and `caching_sha2_password` exchanges so
//! that MySQL-compatible test backends and MariaDB endpoints work.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::stream::NetworkStream;
use crate::config::Profile;
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::auth::auth_response_for_plugin;
use crate::protocol::mysql::packets::*;
use crate::protocol::mysql::parser::*;
use crate::tls::BackendTlsConnector;
use crate::token::TokenCache;

/// A live, authenticated backend MySQL session.
///
/// Owned by the pool while idle, by exactly one proxy worker after borrow.
/// Single-use: it is never returned to the pool.
#[derive(Debug)]
pub struct BackendConn {
    stream: NetworkStream,
    peer_addr: SocketAddr,
}

impl BackendConn {
    pub fn new(stream: NetworkStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Lightweight liveness check: COM_PING, expect a non-ERR reply.
    pub async fn ping(&mut self) -> Result<()> {
        write_packet(&mut self.stream, 0, &[COM_PING]).await?;
        let (_, payload) = read_packet(&mut self.stream).await?;
        if is_err_packet(&payload) {
            let err = parse_err_packet(&payload)?;
            return Err(ProxyError::Connection(format!(
                "ping rejected: {}",
                err.error_message
            )));
        }
        Ok(())
    }

    /// Best-effort close. Dropping the session closes the socket anyway;
    /// this just gets the FIN out before drop.
    pub async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.stream.shutdown().await;
    }

    pub fn into_stream(self) -> NetworkStream {
        self.stream
    }
}

/// Anything that can produce a fresh backend session.
///
/// The pool and proxy depend on this seam; tests inject plain-TCP
/// connectors against in-process backends.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn new_conn(&self) -> Result<BackendConn>;
}

/// Production connector for one profile.
pub struct BackendFactory {
    profile: Profile,
    tokens: Arc<TokenCache>,
    tls: BackendTlsConnector,
    connect_timeout: Duration,
}

impl BackendFactory {
    /// Build the factory, reading and validating the TLS trust bundle.
    pub fn new(
        profile: Profile,
        tokens: Arc<TokenCache>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let tls = BackendTlsConnector::new(&profile.ca_bundle, &profile.rds_host)?;
        Ok(Self {
            profile,
            tokens,
            tls,
            connect_timeout,
        })
    }

    async fn open_session(&self, token: String) -> Result<BackendConn> {
        let addr = self.profile.backend_addr();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| ProxyError::Connection(format!("connect backend {}: {}", addr, e)))?;
        let peer_addr = tcp.peer_addr()?;

        let stream = establish_mysql_session(
            tcp,
            Some(&self.tls),
            &self.profile.rds_db_user,
            &token,
            self.profile.default_db.as_deref(),
        )
        .await?;
        if let Some(version) = stream.tls_version() {
            debug!(backend = %peer_addr, tls = version, "backend session established");
        }

        Ok(BackendConn::new(stream, peer_addr))
    }
}

#[async_trait]
impl BackendConnector for BackendFactory {
    async fn new_conn(&self) -> Result<BackendConn> {
        let token = self.tokens.get(&self.profile).await?;

        timeout(self.connect_timeout, self.open_session(token.value))
            .await
            .map_err(|_| {
                ProxyError::Timeout(format!(
                    "connect backend {}",
                    self.profile.backend_addr()
                ))
            })?
    }
}

/// Drive a MySQL client handshake over `tcp`, optionally upgrading to TLS
/// first, and return the stream positioned at the command phase.
///
/// Shared between the production factory (TLS) and test connectors (plain).
pub async fn establish_mysql_session(
    mut tcp: TcpStream,
    tls: Option<&BackendTlsConnector>,
    username: &str,
    password: &str,
    database: Option<&str>,
) -> Result<NetworkStream> {
    let (greeting_seq, payload) = read_packet(&mut tcp).await?;
    let greeting = parse_handshake_v10(&payload)?;
    debug!(
        server_version = %greeting.server_version,
        auth_plugin = %greeting.auth_plugin_name,
        tls = tls.is_some(),
        "backend greeting received"
    );

    let server_caps = greeting.capability_flags();
    let mut caps = (BACKEND_CAPABILITIES & server_caps)
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
    if database.is_some() {
        caps |= CLIENT_CONNECT_WITH_DB;
    }
    // Never negotiate framing the raw byte pipe cannot follow, whatever the
    // server offers.
    caps &= !FORWARDING_UNSAFE_CAPABILITIES;

    let mut stream = match tls {
        Some(connector) => {
            write_packet(
                &mut tcp,
                greeting_seq + 1,
                &build_ssl_request(caps, 0x21),
            )
            .await?;
            caps |= CLIENT_SSL;
            NetworkStream::tls(connector.connect(tcp).await?)
        }
        None => NetworkStream::tcp(tcp),
    };

    let scramble = greeting.scramble();
    let plugin = if greeting.auth_plugin_name.is_empty() {
        NATIVE_PASSWORD_PLUGIN
    } else {
        greeting.auth_plugin_name.as_str()
    };

    let response = HandshakeResponse41 {
        capability_flags: caps,
        username: username.to_string(),
        auth_response: auth_response_for_plugin(plugin, password, &scramble),
        database: database.map(str::to_string),
        auth_plugin_name: Some(plugin.to_string()),
        ..HandshakeResponse41::default()
    };
    let response_seq = if tls.is_some() {
        greeting_seq + 2
    } else {
        greeting_seq + 1
    };
    write_packet(&mut stream, response_seq, &build_handshake_response41(&response)).await?;

    drive_auth_exchange(&mut stream, password).await?;
    Ok(stream)
}

/// Consume server packets until authentication settles.
async fn drive_auth_exchange(stream: &mut NetworkStream, password: &str) -> Result<()> {
    loop {
        let (seq, payload) = read_packet(stream).await?;
        if payload.is_empty() {
            return Err(ProxyError::Protocol("empty auth packet".into()));
        }

        if is_err_packet(&payload) {
            let err = parse_err_packet(&payload)?;
            return Err(ProxyError::Auth(format!(
                "backend rejected credentials: {} ({})",
                err.error_message, err.error_code
            )));
        }

        // 0xFE with a body is an auth-switch request; check before the OK
        // test, which also matches bare 0xFE.
        if payload[0] == AUTH_SWITCH_REQUEST && payload.len() > 1 {
            let plugin_end = payload[1..]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(payload.len() - 1);
            let plugin = String::from_utf8_lossy(&payload[1..1 + plugin_end]).to_string();
            let mut plugin_data = &payload[(1 + plugin_end + 1).min(payload.len())..];
            if plugin_data.last() == Some(&0) {
                plugin_data = &plugin_data[..plugin_data.len() - 1];
            }
            debug!(plugin = %plugin, "backend requested auth switch");

            let answer = if plugin == CLEAR_PASSWORD_PLUGIN {
                // IAM tokens travel in the clear inside the TLS session.
                let mut bytes = password.as_bytes().to_vec();
                bytes.push(0);
                bytes
            } else {
                auth_response_for_plugin(&plugin, password, plugin_data)
            };
            write_packet(stream, seq + 1, &answer).await?;
            continue;
        }

        if payload[0] == AUTH_MORE_DATA && payload.len() > 1 {
            match payload[1] {
                CACHING_SHA2_FAST_AUTH_SUCCESS => continue, // OK packet follows
                CACHING_SHA2_FULL_AUTH_REQUIRED => {
                    let mut bytes = password.as_bytes().to_vec();
                    bytes.push(0);
                    write_packet(stream, seq + 1, &bytes).await?;
                    continue;
                }
                other => {
                    return Err(ProxyError::Auth(format!(
                        "unexpected auth continuation 0x{:02X}",
                        other
                    )));
                }
            }
        }

        if is_ok_packet(&payload) {
            debug!("backend authentication complete");
            return Ok(());
        }

        return Err(ProxyError::Protocol(format!(
            "unexpected auth packet header 0x{:02X}",
            payload[0]
        )));
    }
}
