//! SCRAM-SHA-256 (RFC 5802) client half, the only SASL mechanism this crate
//! speaks — no MD5, Kerberos, GSS, or SSPI. Channel
//! binding is never offered (`gs2-cbind-flag = n`).

use base64::engine::general_purpose::STANDARD as b64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{PgError, PgResult};

pub const MECHANISM: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

/// One authentication attempt's worth of SCRAM state. Drive it through
/// `client_first_message` -> `process_server_first` -> `verify_server_final`
/// in that order; it is not reusable across connections.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let client_nonce = generate_nonce();
        let client_first_bare = format!("n={},r={}", escape_name(username), client_nonce);
        ScramClient { password: password.to_string(), client_nonce, client_first_bare, server_signature: None }
    }

    /// The `SASLInitialResponse` payload: `gs2-header` + `client-first-message-bare`.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consumes the server's `AuthenticationSASLContinue` payload and
    /// returns the `SASLResponse` payload (`client-final-message`).
    pub fn process_server_first(&mut self, data: &[u8]) -> PgResult<Vec<u8>> {
        let server_first =
            std::str::from_utf8(data).map_err(|_| PgError::Auth("server-first-message is not valid utf-8".into()))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(v.to_string());
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }
        let nonce = nonce.ok_or_else(|| PgError::Auth("server-first-message missing nonce".into()))?;
        let salt = salt.ok_or_else(|| PgError::Auth("server-first-message missing salt".into()))?;
        let iterations = iterations.ok_or_else(|| PgError::Auth("server-first-message missing iteration count".into()))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(PgError::Auth("server nonce does not extend client nonce".into()));
        }
        let salt = b64.decode(salt.as_bytes()).map_err(|_| PgError::Auth("invalid salt encoding".into()))?;

        let salted_password = salt_password(self.password.as_bytes(), &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let client_final_without_proof = format!("c={},r={}", b64.encode("n,,"), nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, client_final_without_proof);

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut client_proof = client_key;
        for (b, s) in client_proof.iter_mut().zip(client_signature.iter()) {
            *b ^= s;
        }

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        Ok(format!("{},p={}", client_final_without_proof, b64.encode(client_proof)).into_bytes())
    }

    /// Verifies the server's `AuthenticationSASLFinal` payload against the
    /// signature computed in `process_server_first`. An `e=` error payload
    /// or a signature mismatch both fail closed.
    pub fn verify_server_final(&self, data: &[u8]) -> PgResult<()> {
        let text =
            std::str::from_utf8(data).map_err(|_| PgError::Auth("server-final-message is not valid utf-8".into()))?;
        if let Some(err) = text.strip_prefix("e=") {
            return Err(PgError::Auth(format!("server reported SASL error: {err}")));
        }
        let sig_b64 = text.strip_prefix("v=").ok_or_else(|| PgError::Auth("server-final-message missing verifier".into()))?;
        let sig = b64.decode(sig_b64.as_bytes()).map_err(|_| PgError::Auth("invalid server signature encoding".into()))?;
        let expected =
            self.server_signature.as_ref().ok_or_else(|| PgError::Auth("verify_server_final called out of order".into()))?;
        if &sig != expected {
            return Err(PgError::Auth("server signature mismatch".into()));
        }
        Ok(())
    }
}

fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn generate_nonce() -> String {
    let bytes: [u8; 20] = rand::rng().random();
    b64.encode(bytes)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn salt_password(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut output = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a full exchange against a hand-rolled server side built from
    /// the same primitives, checking the client accepts a correct final
    /// message and produces a verifiable proof.
    #[test]
    fn full_exchange_round_trips() {
        let username = "alice";
        let password = "s3cret";
        let salt = b"\x01\x02\x03\x04\x05\x06\x07\x08";
        let iterations = 4096u32;

        let mut client = ScramClient::new(username, password);
        let first = client.client_first_message();
        let first_str = std::str::from_utf8(&first).unwrap();
        assert!(first_str.starts_with("n,,n=alice,r="));
        let client_nonce = first_str.rsplit("r=").next().unwrap().to_string();

        let server_nonce = format!("{client_nonce}servercontribution");
        let server_first = format!("r={},s={},i={}", server_nonce, b64.encode(salt), iterations);

        let client_final = client.process_server_first(server_first.as_bytes()).unwrap();
        let client_final_str = std::str::from_utf8(&client_final).unwrap();
        assert!(client_final_str.contains(&format!("r={server_nonce}")));
        assert!(client_final_str.contains("p="));

        let salted_password = salt_password(password.as_bytes(), salt, iterations);
        let client_first_bare = format!("n=alice,r={client_nonce}");
        let client_final_without_proof = format!("c={},r={}", b64.encode("n,,"), server_nonce);
        let auth_message = format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", b64.encode(&server_signature));

        client.verify_server_final(server_final.as_bytes()).unwrap();
    }

    #[test]
    fn mismatched_nonce_is_rejected() {
        let mut client = ScramClient::new("alice", "s3cret");
        let bogus_first = format!("r=totally-different-nonce,s={},i=4096", b64.encode(b"salt"));
        assert!(client.process_server_first(bogus_first.as_bytes()).is_err());
    }

    #[test]
    fn server_error_payload_is_rejected() {
        let client = ScramClient::new("alice", "s3cret");
        assert!(client.verify_server_final(b"e=invalid-proof").is_err());
    }

    #[test]
    fn wrong_server_signature_is_rejected() {
        let mut client = ScramClient::new("alice", "s3cret");
        let first_str = std::str::from_utf8(&client.client_first_message()).unwrap().to_string();
        let client_nonce = first_str.rsplit("r=").next().unwrap().to_string();
        let server_nonce = format!("{client_nonce}x");
        let server_first = format!("r={},s={},i=4096", server_nonce, b64.encode(b"salt"));
        client.process_server_first(server_first.as_bytes()).unwrap();
        let bogus = format!("v={}", b64.encode(b"not-the-right-signature"));
        assert!(client.verify_server_final(bogus.as_bytes()).is_err());
    }
}
