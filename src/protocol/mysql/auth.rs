//! MySQL authentication scramble math
//!
//! `mysql_native_password` (SHA1) is what we speak to desktop clients and
//! offer to the backend first; `caching_sha2_password` (SHA256) covers
//! MySQL 8.0+ backends that ask for it.
//!
//! References:
//! - <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_authentication_methods_native_password_authentication.html>
//! - <https://dev.mysql.com/doc/dev/mysql-server/latest/page_caching_sha2_authentication_exchanges.html>

use rand::Rng;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::{Digest as Sha2Digest, Sha256};
use subtle::ConstantTimeEq;

use super::packets::{CACHING_SHA2_PLUGIN, NATIVE_PASSWORD_PLUGIN};

/// Generate a random 20-byte scramble.
///
/// Null bytes and 0xFF are avoided; some clients treat them as terminators
/// or markers inside the plugin data.
pub fn generate_scramble() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut scramble = [0u8; 20];
    for byte in scramble.iter_mut() {
        *byte = loop {
            let b: u8 = rng.gen();
            if b != 0 && b != 0xFF {
                break b;
            }
        };
    }
    scramble
}

/// Compute the `mysql_native_password` response:
/// `SHA1(password) XOR SHA1(scramble + SHA1(SHA1(password)))`.
///
/// Empty passwords produce an empty response, per protocol.
pub fn native_password_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    Sha1Digest::update(&mut hasher, scramble);
    Sha1Digest::update(&mut hasher, stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Verify a client's `mysql_native_password` response against the known
/// plaintext password, in constant time.
pub fn verify_native_password(password: &str, scramble: &[u8], response: &[u8]) -> bool {
    let expected = native_password_response(password, scramble);
    expected.ct_eq(response).into()
}

/// Compute the `caching_sha2_password` scramble response:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) || scramble)`.
pub fn caching_sha2_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    Sha2Digest::update(&mut hasher, stage2);
    Sha2Digest::update(&mut hasher, scramble);
    let scramble_hash = hasher.finalize();

    stage1
        .iter()
        .zip(scramble_hash.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Compute the scramble response for the plugin the server asked for.
///
/// Unknown plugins fall back to native; the server will either accept it or
/// send an auth-switch request we can answer.
pub fn auth_response_for_plugin(plugin_name: &str, password: &str, scramble: &[u8]) -> Vec<u8> {
    match plugin_name {
        NATIVE_PASSWORD_PLUGIN => native_password_response(password, scramble),
        CACHING_SHA2_PLUGIN => caching_sha2_response(password, scramble),
        unknown => {
            debug!(
                plugin = %unknown,
                "unknown auth plugin, answering with mysql_native_password"
            );
            native_password_response(password, scramble)
        }
    }
}
