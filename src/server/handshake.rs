//! Client-facing MySQL handshake
//!
//! The proxy greets desktop clients as a MySQL server and validates the
//! profile's static credentials. Clients answering with a plugin other than
//! `mysql_native_password` are auth-switched to it first.

use tokio::net::TcpStream;

use crate::config::Profile;
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::auth::{generate_scramble, verify_native_password};
use crate::protocol::mysql::packets::*;
use crate::protocol::mysql::parser::*;

/// Greet, authenticate, and confirm one client connection.
///
/// On success the stream is positioned at the start of the command phase.
/// On failure the client has been sent an ERR packet (where the protocol
/// allows one) and the error describes the rejection.
pub async fn authenticate_client(
    stream: &mut TcpStream,
    profile: &Profile,
    connection_id: u32,
) -> Result<()> {
    let scramble = generate_scramble();

    let mut greeting = HandshakeV10 {
        connection_id,
        ..HandshakeV10::default()
    };
    greeting.set_capability_flags(SERVER_CAPABILITIES);
    greeting.auth_plugin_data_part_1.copy_from_slice(&scramble[..8]);
    greeting.auth_plugin_data_part_2 = scramble[8..].to_vec();
    write_packet(stream, 0, &build_handshake_v10(&greeting)).await?;

    let (seq, payload) = read_packet(stream).await?;
    if is_ssl_request(&payload) {
        // Loopback-only listener; nothing to encrypt locally.
        let err = ErrPacket::new(
            ER_ACCESS_DENIED_ERROR,
            "SSL connections are not supported by this proxy",
        );
        write_packet(stream, seq + 1, &build_err_packet(&err)).await?;
        return Err(ProxyError::Auth("client requested SSL".into()));
    }
    let response = parse_handshake_response41(&payload)?;

    let client_host = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if response.username != profile.proxy_user {
        let err = ErrPacket::access_denied(&response.username, &client_host);
        write_packet(stream, seq + 1, &build_err_packet(&err)).await?;
        return Err(ProxyError::Auth(format!(
            "unknown proxy user {:?}",
            response.username
        )));
    }

    // If the client answered with a different plugin's scramble (MySQL 8
    // clients default to caching_sha2_password), switch it to native.
    let (auth_response, last_seq) = match response.auth_plugin_name.as_deref() {
        None | Some(NATIVE_PASSWORD_PLUGIN) | Some("") => (response.auth_response, seq),
        Some(_) => {
            let mut switch = Vec::with_capacity(44);
            switch.push(AUTH_SWITCH_REQUEST);
            switch.extend_from_slice(NATIVE_PASSWORD_PLUGIN.as_bytes());
            switch.push(0);
            switch.extend_from_slice(&scramble);
            switch.push(0);
            write_packet(stream, seq + 1, &switch).await?;

            let (switch_seq, switch_payload) = read_packet(stream).await?;
            (switch_payload, switch_seq)
        }
    };

    if !verify_native_password(&profile.proxy_password, &scramble, &auth_response) {
        let err = ErrPacket::access_denied(&response.username, &client_host);
        write_packet(stream, last_seq + 1, &build_err_packet(&err)).await?;
        return Err(ProxyError::Auth(format!(
            "bad password for proxy user {:?}",
            response.username
        )));
    }

    write_packet(stream, last_seq + 1, &build_ok_packet(&OkPacket::default())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::auth::native_password_response;
    use tokio::net::TcpListener;

    fn test_profile() -> Profile {
        Profile {
            name: "hs".into(),
            proxy_user: "local_user".into(),
            proxy_password: "local_pass".into(),
            rds_host: "db.example".into(),
            rds_region: "eu-west-1".into(),
            rds_db_user: "db_user".into(),
            ..Profile::default()
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    /// Drive the client half of the handshake with the given credentials.
    async fn client_login(stream: &mut TcpStream, user: &str, password: &str) -> Result<Vec<u8>> {
        let (_, payload) = read_packet(stream).await?;
        let greeting = parse_handshake_v10(&payload)?;
        assert_eq!(greeting.auth_plugin_name, NATIVE_PASSWORD_PLUGIN);

        let response = HandshakeResponse41 {
            capability_flags: BACKEND_CAPABILITIES,
            username: user.to_string(),
            auth_response: native_password_response(password, &greeting.scramble()),
            auth_plugin_name: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
            ..HandshakeResponse41::default()
        };
        write_packet(stream, 1, &build_handshake_response41(&response)).await?;

        let (_, reply) = read_packet(stream).await?;
        Ok(reply)
    }

    #[tokio::test]
    async fn test_valid_credentials_accepted() {
        let profile = test_profile();
        let (mut server, mut client) = tcp_pair().await;

        let server_task = async { authenticate_client(&mut server, &profile, 7).await };
        let client_task = client_login(&mut client, "local_user", "local_pass");
        let (server_res, reply) = tokio::join!(server_task, client_task);

        server_res.unwrap();
        assert!(is_ok_packet(&reply.unwrap()));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let profile = test_profile();
        let (mut server, mut client) = tcp_pair().await;

        let server_task = async { authenticate_client(&mut server, &profile, 7).await };
        let client_task = client_login(&mut client, "local_user", "wrong");
        let (server_res, reply) = tokio::join!(server_task, client_task);

        assert!(server_res.is_err());
        let reply = reply.unwrap();
        assert!(is_err_packet(&reply));
        let err = parse_err_packet(&reply).unwrap();
        assert_eq!(err.error_code, ER_ACCESS_DENIED_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_user_rejected() {
        let profile = test_profile();
        let (mut server, mut client) = tcp_pair().await;

        let server_task = async { authenticate_client(&mut server, &profile, 7).await };
        let client_task = client_login(&mut client, "intruder", "local_pass");
        let (server_res, reply) = tokio::join!(server_task, client_task);

        assert!(server_res.is_err());
        assert!(is_err_packet(&reply.unwrap()));
    }

    #[tokio::test]
    async fn test_auth_switch_for_non_native_client() {
        let profile = test_profile();
        let (mut server, mut client) = tcp_pair().await;

        let server_task = async { authenticate_client(&mut server, &profile, 7).await };
        let client_task = async {
            let (_, payload) = read_packet(&mut client).await.unwrap();
            let greeting = parse_handshake_v10(&payload).unwrap();

            // Answer with a caching_sha2 response; the proxy must switch us.
            let response = HandshakeResponse41 {
                capability_flags: BACKEND_CAPABILITIES,
                username: "local_user".to_string(),
                auth_response: vec![0xAA; 32],
                auth_plugin_name: Some(CACHING_SHA2_PLUGIN.to_string()),
                ..HandshakeResponse41::default()
            };
            write_packet(&mut client, 1, &build_handshake_response41(&response))
                .await
                .unwrap();

            let (seq, switch) = read_packet(&mut client).await.unwrap();
            assert_eq!(switch[0], AUTH_SWITCH_REQUEST);
            let plugin_end = switch[1..].iter().position(|&b| b == 0).unwrap();
            assert_eq!(&switch[1..1 + plugin_end], NATIVE_PASSWORD_PLUGIN.as_bytes());
            let scramble = &switch[1 + plugin_end + 1..switch.len() - 1];

            let answer = native_password_response("local_pass", scramble);
            write_packet(&mut client, seq + 1, &answer).await.unwrap();

            let (_, reply) = read_packet(&mut client).await.unwrap();
            reply
        };

        let (server_res, reply) = tokio::join!(server_task, client_task);
        server_res.unwrap();
        assert!(is_ok_packet(&reply));
    }
}
