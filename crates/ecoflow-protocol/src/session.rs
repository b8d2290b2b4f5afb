//! Transport security: key derivation and AES-128-CBC session crypto
//!
//! Two key strategies exist:
//!
//! - **ECDH**: ephemeral secp160r1 exchange yields a shared secret; its first
//!   16 bytes are the AES key and its MD5 the IV. A "key info" request then
//!   delivers `srand(16) ++ seed(2)`, from which the session key is derived
//!   with a fixed lookup table ([`gen_session_key`]). PKCS#7 padding.
//! - **Serial-derived**: key = MD5(serial), IV = MD5(reversed serial). Zero
//!   padding on encrypt, no unpadding on decrypt.

use crate::ecdh::{public_key_size, EphemeralKeyPair, PUBLIC_KEY_SIZE};
use crate::types::ProtocolError;
use aes::Aes128;
use cbc::cipher::block_padding::{NoPadding, Pkcs7, ZeroPadding};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Handshake command: send client public key
pub const CMD_PUBLIC_KEY: u8 = 0x01;
/// Handshake command: request key info (srand + seed)
pub const CMD_KEY_INFO: u8 = 0x02;

fn md5(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(data));
    out
}

/// How a device family establishes its session key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Ephemeral ECDH followed by table-based session key derivation
    Ecdh,
    /// Keys derived directly from the device serial number
    SerialDerived,
}

/// Block padding applied by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// PKCS#7 on both directions
    Pkcs7,
    /// Zero-pad on encrypt, leave padding in place on decrypt
    Zero,
}

/// Negotiated symmetric key material for one connection
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    key: [u8; 16],
    iv: [u8; 16],
    padding: Padding,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(key: [u8; 16], iv: [u8; 16], padding: Padding) -> Self {
        Self { key, iv, padding }
    }

    /// Keys for the simplified device family
    #[must_use]
    pub fn from_serial(serial: &str) -> Self {
        let reversed: String = serial.chars().rev().collect();
        Self::new(md5(serial.as_bytes()), md5(reversed.as_bytes()), Padding::Zero)
    }

    /// Keys derived from an ECDH shared secret
    #[allow(clippy::missing_errors_doc)]
    pub fn from_shared_secret(shared: &[u8]) -> Result<Self, ProtocolError> {
        if shared.len() < 16 {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "shared secret is {} bytes",
                shared.len()
            )));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(&shared[..16]);
        Ok(Self::new(key, md5(shared), Padding::Pkcs7))
    }

    /// Same IV and padding, new key
    #[must_use]
    pub fn rekey(&self, key: [u8; 16]) -> Self {
        Self::new(key, self.iv, self.padding)
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    /// Encrypt with a fresh CBC context
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new(&self.key.into(), &self.iv.into());
        match self.padding {
            Padding::Pkcs7 => cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            Padding::Zero => cipher.encrypt_padded_vec_mut::<ZeroPadding>(plaintext),
        }
    }

    /// Decrypt with a fresh CBC context
    #[allow(clippy::missing_errors_doc)]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let cipher = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        match self.padding {
            Padding::Pkcs7 => cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            Padding::Zero => cipher.decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        }
        .map_err(|e| ProtocolError::Cipher(e.to_string()))
    }
}

/// Fixed lookup table used by [`gen_session_key`]
///
/// The table ships with the vendor application and is loaded at runtime.
#[derive(Clone)]
pub struct KeyTable {
    data: Vec<u8>,
}

impl std::fmt::Debug for KeyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyTable({} bytes)", self.data.len())
    }
}

impl KeyTable {
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Table offset selected by a 2-byte seed
    #[must_use]
    pub fn offset(seed: [u8; 2]) -> usize {
        usize::from(seed[0]) * 0x10 + usize::from(seed[1].wrapping_sub(1)) * 0x100
    }

    /// Two little-endian 8-byte words at the seed offset
    #[allow(clippy::missing_errors_doc)]
    pub fn lookup(&self, seed: [u8; 2]) -> Result<[u64; 2], ProtocolError> {
        let offset = Self::offset(seed);
        let window = self
            .data
            .get(offset..offset + 16)
            .ok_or(ProtocolError::KeyTableTooShort {
                offset,
                len: self.data.len(),
            })?;
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&window[..8]);
        hi.copy_from_slice(&window[8..]);
        Ok([u64::from_le_bytes(lo), u64::from_le_bytes(hi)])
    }
}

/// Derive the 16-byte session key from `seed`, `srand` and the fixed table
///
/// Concatenates two table words with the two halves of `srand` (all as
/// little-endian u64) and hashes the 32 bytes with MD5.
#[allow(clippy::missing_errors_doc)]
pub fn gen_session_key(
    seed: [u8; 2],
    srand: &[u8; 16],
    table: &KeyTable,
) -> Result<[u8; 16], ProtocolError> {
    let [t0, t1] = table.lookup(seed)?;
    let mut s0 = [0u8; 8];
    let mut s1 = [0u8; 8];
    s0.copy_from_slice(&srand[..8]);
    s1.copy_from_slice(&srand[8..]);

    let mut data = [0u8; 32];
    for (chunk, word) in data
        .chunks_exact_mut(8)
        .zip([t0, t1, u64::from_le_bytes(s0), u64::from_le_bytes(s1)])
    {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    Ok(md5(&data))
}

/// Payload of the auto-authentication packet: uppercase hex of MD5(user_id ++ serial)
#[must_use]
pub fn auth_payload(user_id: &str, serial: &str) -> Vec<u8> {
    let digest = md5(format!("{user_id}{serial}").as_bytes());
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>()
        .into_bytes()
}

/// Client side of the ECDH handshake
#[derive(Debug)]
pub struct EcdhHandshake {
    key_pair: EphemeralKeyPair,
    shared: Option<Session>,
}

impl Default for EcdhHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl EcdhHandshake {
    /// Start a handshake with a freshly generated key pair
    #[must_use]
    pub fn new() -> Self {
        Self {
            key_pair: EphemeralKeyPair::generate(),
            shared: None,
        }
    }

    /// Command payload carrying our public key
    #[must_use]
    pub fn public_key_request(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + PUBLIC_KEY_SIZE);
        payload.push(CMD_PUBLIC_KEY);
        payload.push(0x00);
        payload.extend_from_slice(&self.key_pair.public_key());
        payload
    }

    /// Consume the device public key: `[type, status, curve, key...]`
    #[allow(clippy::missing_errors_doc)]
    pub fn handle_public_key_response(&mut self, payload: &[u8]) -> Result<&Session, ProtocolError> {
        if payload.len() < 3 {
            return Err(ProtocolError::FrameTooShort(payload.len()));
        }
        tracing::debug!(
            "Public key response: status={:#04X} curve={}",
            payload[1],
            payload[2]
        );

        let key_size = public_key_size(payload[2]);
        if key_size != PUBLIC_KEY_SIZE {
            return Err(ProtocolError::UnsupportedCurve(payload[2]));
        }
        let device_key = payload
            .get(3..3 + key_size)
            .ok_or(ProtocolError::FrameTooShort(payload.len()))?;

        let shared = self.key_pair.shared_secret(device_key)?;
        Ok(&*self.shared.insert(Session::from_shared_secret(&shared)?))
    }

    /// Command payload requesting key info
    #[must_use]
    pub fn key_info_request(&self) -> Vec<u8> {
        vec![CMD_KEY_INFO]
    }

    /// Decrypt key info and derive the session
    #[allow(clippy::missing_errors_doc)]
    pub fn handle_key_info_response(
        &self,
        payload: &[u8],
        table: &KeyTable,
    ) -> Result<Session, ProtocolError> {
        let shared = self.shared.as_ref().ok_or(ProtocolError::NoSession)?;
        match payload.first() {
            Some(&CMD_KEY_INFO) => {}
            Some(other) => {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "key info type {other:#04X}"
                )))
            }
            None => return Err(ProtocolError::FrameTooShort(0)),
        }

        let data = shared.decrypt(&payload[1..])?;
        if data.len() < 18 {
            return Err(ProtocolError::FrameTooShort(data.len()));
        }
        let mut srand = [0u8; 16];
        srand.copy_from_slice(&data[..16]);
        let seed = [data[16], data[17]];

        let key = gen_session_key(seed, &srand, table)?;
        Ok(shared.rekey(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KeyTable {
        KeyTable::from_bytes((0..0x11000u32).map(|i| (i * 7 + 3) as u8).collect())
    }

    #[test]
    fn test_gen_session_key_is_pure() {
        let table = table();
        let srand = [0x5Cu8; 16];
        let a = gen_session_key([0x12, 0x05], &srand, &table).unwrap();
        let b = gen_session_key([0x12, 0x05], &srand, &table).unwrap();
        assert_eq!(a, b);
        let c = gen_session_key([0x13, 0x05], &srand, &table).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_gen_session_key_matches_manual_derivation() {
        let table = table();
        let srand: [u8; 16] = core::array::from_fn(|i| i as u8);
        let seed = [0x02, 0x01];
        let offset = KeyTable::offset(seed);
        assert_eq!(offset, 0x20);

        let mut data = Vec::new();
        data.extend_from_slice(&table.data[offset..offset + 16]);
        data.extend_from_slice(&srand);
        assert_eq!(gen_session_key(seed, &srand, &table).unwrap(), md5(&data));
    }

    #[test]
    fn test_key_table_bounds() {
        let small = KeyTable::from_bytes(vec![0; 64]);
        assert!(matches!(
            gen_session_key([0xFF, 0xFF], &[0; 16], &small),
            Err(ProtocolError::KeyTableTooShort { .. })
        ));
    }

    #[test]
    fn test_pkcs7_session() {
        let session = Session::from_shared_secret(&[0xA5; 20]).unwrap();
        let ct = session.encrypt(b"hello world");
        assert_eq!(ct.len(), 16);
        assert_eq!(session.decrypt(&ct).unwrap(), b"hello world");
        let aligned = session.encrypt(&[0u8; 16]);
        assert_eq!(aligned.len(), 32);
    }

    #[test]
    fn test_serial_session_pads_with_zeros_and_keeps_them() {
        let session = Session::from_serial("R331ZEB4ZEAL0528");
        assert_eq!(session, Session::from_serial("R331ZEB4ZEAL0528"));
        let ct = session.encrypt(&[1, 2, 3]);
        assert_eq!(ct.len(), 16);
        let pt = session.decrypt(&ct).unwrap();
        assert_eq!(&pt[..3], &[1, 2, 3]);
        assert!(pt[3..].iter().all(|&b| b == 0));
        assert!(session.decrypt(&ct[..15]).is_err());
    }

    #[test]
    fn test_encrypt_is_stateless_between_calls() {
        let session = Session::from_serial("P231ZEB4ZE123456");
        assert_eq!(session.encrypt(b"same input"), session.encrypt(b"same input"));
    }

    #[test]
    fn test_auth_payload_is_uppercase_hex() {
        let payload = auth_payload("1234567890", "R331ZEB4ZEAL0528");
        assert_eq!(payload.len(), 32);
        assert!(payload
            .iter()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b)));
        let expected: String = md5(b"1234567890R331ZEB4ZEAL0528")
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        assert_eq!(payload, expected.into_bytes());
    }

    #[test]
    fn test_ecdh_handshake_against_simulated_device() {
        let table = table();
        let mut client = EcdhHandshake::new();
        let request = client.public_key_request();
        assert_eq!(&request[..2], &[CMD_PUBLIC_KEY, 0x00]);

        let device = EphemeralKeyPair::generate();
        let device_shared =
            Session::from_shared_secret(&device.shared_secret(&request[2..]).unwrap()).unwrap();

        let mut response = vec![CMD_PUBLIC_KEY, 0x00, 0x00];
        response.extend_from_slice(&device.public_key());
        let client_shared = client.handle_public_key_response(&response).unwrap().clone();
        assert_eq!(client_shared, device_shared);

        let srand = [0x42u8; 16];
        let mut info = srand.to_vec();
        info.extend_from_slice(&[0x03, 0x02]);
        let mut key_info = vec![CMD_KEY_INFO];
        key_info.extend(device_shared.encrypt(&info));

        let session = client.handle_key_info_response(&key_info, &table).unwrap();
        let expected = device_shared.rekey(gen_session_key([0x03, 0x02], &srand, &table).unwrap());
        assert_eq!(session, expected);
    }

    #[test]
    fn test_unsupported_curve() {
        let mut client = EcdhHandshake::new();
        let mut response = vec![CMD_PUBLIC_KEY, 0x00, 0x03];
        response.extend_from_slice(&[0u8; 64]);
        assert_eq!(
            client.handle_public_key_response(&response).unwrap_err(),
            ProtocolError::UnsupportedCurve(3)
        );
    }
}
