use rand::Rng;
use std::fmt;

use crate::protocol::{encrypt_payload, hmac_sha256};

/// Nonce alphabet: ASCII alphanumerics minus the lookalikes O, o, l, 1.
const NONCE_CHARS: &[u8] = b"ABCDEFGHIJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz023456789";

pub const NONCE_LEN: usize = 16;

/// KEY_RESP plaintext: remote nonce followed by an HMAC of our nonce.
const KEY_RESP_LEN: usize = NONCE_LEN + 32;

#[derive(Debug)]
pub enum HandshakeError {
    Timeout,
    NonceMacMismatch,
    BadKeyResponse(usize),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Timeout => write!(f, "Key negotiation timed out"),
            HandshakeError::NonceMacMismatch => {
                write!(f, "Device HMAC over local nonce does not verify")
            }
            HandshakeError::BadKeyResponse(len) => {
                write!(f, "Key response payload is {len} bytes, expected {KEY_RESP_LEN}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Fresh per-session nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut rng = rand::thread_rng();
    let mut nonce = [0u8; NONCE_LEN];
    for b in nonce.iter_mut() {
        *b = NONCE_CHARS[rng.gen_range(0..NONCE_CHARS.len())];
    }
    nonce
}

/// KEY_START payload: the local nonce encrypted under the device key.
pub fn key_start_payload(local_key: &[u8; 16], local_nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    encrypt_payload(local_nonce, local_key)
}

/// Decode a KEY_RESP payload (already frame-decrypted): remote nonce plus
/// the device's HMAC over our nonce, which must verify.
pub fn parse_key_response(
    local_key: &[u8; 16],
    local_nonce: &[u8; NONCE_LEN],
    payload: &[u8],
) -> Result<[u8; NONCE_LEN], HandshakeError> {
    if payload.len() != KEY_RESP_LEN {
        return Err(HandshakeError::BadKeyResponse(payload.len()));
    }

    let mut remote_nonce = [0u8; NONCE_LEN];
    remote_nonce.copy_from_slice(&payload[..NONCE_LEN]);

    let expected = hmac_sha256(local_key, local_nonce);
    if expected != payload[NONCE_LEN..] {
        return Err(HandshakeError::NonceMacMismatch);
    }

    Ok(remote_nonce)
}

/// KEY_FINAL payload: HMAC over the remote nonce, encrypted under the
/// device key.
pub fn key_final_payload(local_key: &[u8; 16], remote_nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mac = hmac_sha256(local_key, remote_nonce);
    encrypt_payload(&mac, local_key)
}

/// Session key: AES-ECB of the XORed nonces under the device key, first
/// cipher block only.
pub fn derive_session_key(
    local_key: &[u8; 16],
    local_nonce: &[u8; NONCE_LEN],
    remote_nonce: &[u8; NONCE_LEN],
) -> [u8; 16] {
    let mut xored = [0u8; NONCE_LEN];
    for (i, b) in xored.iter_mut().enumerate() {
        *b = local_nonce[i] ^ remote_nonce[i];
    }
    let ciphertext = encrypt_payload(&xored, local_key);
    let mut key = [0u8; 16];
    key.copy_from_slice(&ciphertext[..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decrypt_payload;

    #[test]
    fn nonce_uses_safe_alphabet() {
        for _ in 0..32 {
            let nonce = generate_nonce();
            for b in nonce {
                assert!(NONCE_CHARS.contains(&b));
                assert!(![b'O', b'o', b'l', b'1'].contains(&b));
            }
        }
    }

    #[test]
    fn session_key_from_fixed_nonces() {
        // Known-vector check: zero key, ASCII local nonce, all-FF remote
        // nonce. The derived key must equal the first AES block of the
        // XORed nonces.
        let local_key = [0u8; 16];
        let local_nonce = *b"0123456789ABCDEF";
        let remote_nonce = [0xFFu8; NONCE_LEN];

        let key = derive_session_key(&local_key, &local_nonce, &remote_nonce);

        let mut xored = [0u8; 16];
        for i in 0..16 {
            xored[i] = local_nonce[i] ^ 0xFF;
        }
        let expected = encrypt_payload(&xored, &local_key);
        assert_eq!(key, expected[..16]);
    }

    #[test]
    fn key_response_roundtrip() {
        let local_key = *b"abcdefghij012345";
        let local_nonce = generate_nonce();
        let remote_nonce = *b"ZYXWVUTSRQPNMKJH";

        let mut payload = Vec::new();
        payload.extend_from_slice(&remote_nonce);
        payload.extend_from_slice(&hmac_sha256(&local_key, &local_nonce));

        let got = parse_key_response(&local_key, &local_nonce, &payload).unwrap();
        assert_eq!(got, remote_nonce);
    }

    #[test]
    fn key_response_rejects_bad_mac() {
        let local_key = *b"abcdefghij012345";
        let local_nonce = generate_nonce();

        let mut payload = vec![0u8; KEY_RESP_LEN];
        payload[..NONCE_LEN].copy_from_slice(b"ZYXWVUTSRQPNMKJH");

        assert!(matches!(
            parse_key_response(&local_key, &local_nonce, &payload),
            Err(HandshakeError::NonceMacMismatch)
        ));
    }

    #[test]
    fn key_response_rejects_short_payload() {
        let local_key = [7u8; 16];
        let local_nonce = generate_nonce();

        assert!(matches!(
            parse_key_response(&local_key, &local_nonce, &[0u8; 20]),
            Err(HandshakeError::BadKeyResponse(20))
        ));
    }

    #[test]
    fn key_start_payload_decrypts_to_nonce() {
        let local_key = *b"0000111122223333";
        let local_nonce = generate_nonce();

        let payload = key_start_payload(&local_key, &local_nonce);
        let plain = decrypt_payload(&payload, &local_key).unwrap();
        assert_eq!(plain, local_nonce);
    }
}
