//! Ephemeral secp160r1 key agreement
//!
//! The devices only speak secp160r1, which has no dedicated curve crate, so
//! the group law is implemented here in affine coordinates over `BigUint`.
//! Keys are ephemeral and regenerated on every connect.

use crate::types::ProtocolError;
use num_bigint::{BigUint, RandBigInt};

/// Size of one field element in bytes
pub const COORD_SIZE: usize = 20;

/// Uncompressed public key size (x || y, no tag byte)
pub const PUBLIC_KEY_SIZE: usize = 2 * COORD_SIZE;

const P: [u8; 20] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x7F, 0xFF, 0xFF, 0xFF,
];
const A: [u8; 20] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x7F, 0xFF, 0xFF, 0xFC,
];
const B: [u8; 20] = [
    0x1C, 0x97, 0xBE, 0xFC, 0x54, 0xBD, 0x7A, 0x8B, 0x65, 0xAC, 0xF8, 0x9F, 0x81, 0xD4, 0xD4, 0xAD,
    0xC5, 0x65, 0xFA, 0x45,
];
const GX: [u8; 20] = [
    0x4A, 0x96, 0xB5, 0x68, 0x8E, 0xF5, 0x73, 0x28, 0x46, 0x64, 0x69, 0x89, 0x68, 0xC3, 0x8B, 0xB9,
    0x13, 0xCB, 0xFC, 0x82,
];
const GY: [u8; 20] = [
    0x23, 0xA6, 0x28, 0x55, 0x31, 0x68, 0x94, 0x7D, 0x59, 0xDC, 0xC9, 0x12, 0x04, 0x23, 0x51, 0x37,
    0x7A, 0xC5, 0xFB, 0x32,
];
const N: [u8; 21] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xF4, 0xC8, 0xF9, 0x27, 0xAE,
    0xD3, 0xCA, 0x75, 0x22, 0x57,
];

/// Public key length announced by the device for a curve identifier
#[must_use]
pub fn public_key_size(curve_id: u8) -> usize {
    match curve_id {
        1 => 52,
        2 => 56,
        3 | 4 => 64,
        _ => PUBLIC_KEY_SIZE,
    }
}

/// Affine point; `None` is the point at infinity
type Point = Option<(BigUint, BigUint)>;

struct Curve {
    p: BigUint,
    a: BigUint,
    b: BigUint,
    n: BigUint,
    g: (BigUint, BigUint),
}

impl Curve {
    fn secp160r1() -> Self {
        Self {
            p: BigUint::from_bytes_be(&P),
            a: BigUint::from_bytes_be(&A),
            b: BigUint::from_bytes_be(&B),
            n: BigUint::from_bytes_be(&N),
            g: (BigUint::from_bytes_be(&GX), BigUint::from_bytes_be(&GY)),
        }
    }

    fn sub(&self, x: &BigUint, y: &BigUint) -> BigUint {
        ((x + &self.p) - y) % &self.p
    }

    fn inv(&self, x: &BigUint) -> BigUint {
        x.modpow(&(&self.p - 2u32), &self.p)
    }

    fn contains(&self, x: &BigUint, y: &BigUint) -> bool {
        if x >= &self.p || y >= &self.p {
            return false;
        }
        let lhs = (y * y) % &self.p;
        let rhs = (x * x * x + &self.a * x + &self.b) % &self.p;
        lhs == rhs
    }

    fn double(&self, point: &Point) -> Point {
        let (x, y) = point.as_ref()?;
        if *y == BigUint::from(0u32) {
            return None;
        }
        let num = (BigUint::from(3u32) * x * x + &self.a) % &self.p;
        let den = self.inv(&((BigUint::from(2u32) * y) % &self.p));
        let lambda = (num * den) % &self.p;
        let x3 = self.sub(&((&lambda * &lambda) % &self.p), &((x * 2u32) % &self.p));
        let y3 = self.sub(&((&lambda * self.sub(x, &x3)) % &self.p), y);
        Some((x3, y3))
    }

    fn add(&self, lhs: &Point, rhs: &Point) -> Point {
        let Some((x1, y1)) = lhs else {
            return rhs.clone();
        };
        let Some((x2, y2)) = rhs else {
            return lhs.clone();
        };
        if x1 == x2 {
            if (y1 + y2) % &self.p == BigUint::from(0u32) {
                return None;
            }
            return self.double(lhs);
        }
        let lambda = (self.sub(y2, y1) * self.inv(&self.sub(x2, x1))) % &self.p;
        let x3 = self.sub(&self.sub(&((&lambda * &lambda) % &self.p), x1), x2);
        let y3 = self.sub(&((&lambda * self.sub(x1, &x3)) % &self.p), y1);
        Some((x3, y3))
    }

    fn mul(&self, k: &BigUint, point: &Point) -> Point {
        let mut acc: Point = None;
        for i in (0..k.bits()).rev() {
            acc = self.double(&acc);
            if k.bit(i) {
                acc = self.add(&acc, point);
            }
        }
        acc
    }
}

fn coord_bytes(value: &BigUint) -> [u8; COORD_SIZE] {
    let raw = value.to_bytes_be();
    let mut out = [0u8; COORD_SIZE];
    out[COORD_SIZE - raw.len()..].copy_from_slice(&raw);
    out
}

/// Ephemeral key pair for one handshake
pub struct EphemeralKeyPair {
    secret: BigUint,
    public: (BigUint, BigUint),
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl EphemeralKeyPair {
    /// Generate a fresh random key pair
    #[must_use]
    pub fn generate() -> Self {
        let curve = Curve::secp160r1();
        let secret = rand::thread_rng().gen_biguint_range(&BigUint::from(1u32), &curve.n);
        Self::from_secret(&curve, secret)
    }

    fn from_secret(curve: &Curve, secret: BigUint) -> Self {
        // The generator has prime order, so d*G is never infinity for 0 < d < n
        let public = curve
            .mul(&secret, &Some(curve.g.clone()))
            .unwrap_or_else(|| curve.g.clone());
        Self { secret, public }
    }

    /// Raw `x || y` public key
    #[must_use]
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out[..COORD_SIZE].copy_from_slice(&coord_bytes(&self.public.0));
        out[COORD_SIZE..].copy_from_slice(&coord_bytes(&self.public.1));
        out
    }

    /// Compute the shared secret (x coordinate) with a peer public key
    #[allow(clippy::missing_errors_doc)]
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; COORD_SIZE], ProtocolError> {
        if peer_public.len() != PUBLIC_KEY_SIZE {
            return Err(ProtocolError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_SIZE,
                peer_public.len()
            )));
        }
        let curve = Curve::secp160r1();
        let x = BigUint::from_bytes_be(&peer_public[..COORD_SIZE]);
        let y = BigUint::from_bytes_be(&peer_public[COORD_SIZE..]);
        if !curve.contains(&x, &y) {
            return Err(ProtocolError::InvalidPublicKey(
                "point is not on secp160r1".to_string(),
            ));
        }

        let (sx, _) = curve
            .mul(&self.secret, &Some((x, y)))
            .ok_or_else(|| ProtocolError::InvalidPublicKey("shared point at infinity".into()))?;
        Ok(coord_bytes(&sx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_is_on_curve_with_prime_order() {
        let curve = Curve::secp160r1();
        assert!(curve.contains(&curve.g.0, &curve.g.1));
        assert!(curve.mul(&curve.n, &Some(curve.g.clone())).is_none());
    }

    #[test]
    fn test_small_multiples_agree() {
        let curve = Curve::secp160r1();
        let g = Some(curve.g.clone());
        let two_g = curve.double(&g);
        let three_g = curve.add(&two_g, &g);
        assert_eq!(curve.mul(&BigUint::from(3u32), &g), three_g);
        let (x, y) = three_g.unwrap();
        assert!(curve.contains(&x, &y));
    }

    #[test]
    fn test_key_agreement() {
        let alice = EphemeralKeyPair::generate();
        let bob = EphemeralKeyPair::generate();
        let ab = alice.shared_secret(&bob.public_key()).unwrap();
        let ba = bob.shared_secret(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_rejects_invalid_peer_keys() {
        let pair = EphemeralKeyPair::generate();
        assert!(pair.shared_secret(&[0u8; 12]).is_err());

        let mut off_curve = pair.public_key();
        off_curve[PUBLIC_KEY_SIZE - 1] ^= 0x01;
        assert!(matches!(
            pair.shared_secret(&off_curve),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_curve_sizes() {
        assert_eq!(public_key_size(0), 40);
        assert_eq!(public_key_size(1), 52);
        assert_eq!(public_key_size(4), 64);
    }
}
