//! Hotkey addresses and signatures.
//!
//! Peers are identified by SS58 addresses: base58 over
//! `prefix || public_key || checksum`, where the checksum is the first two
//! bytes of BLAKE2b-512(`"SS58PRE" || prefix || public_key`). Signatures are
//! Ed25519 over the raw message bytes, carried as hex with an optional `0x`.

use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Address prefix of the network hotkeys.
pub const SS58_PREFIX: u16 = 42;

const SS58_CHECKSUM_PREFIX: &[u8] = b"SS58PRE";
const CHECKSUM_LEN: usize = 2;
const PUBLIC_KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// ASCII byte -> base58 digit (0xFF = invalid).
const BASE58_DECODE: [u8; 128] = {
    let mut table = [0xFFu8; 128];
    let mut i = 0;
    while i < 58 {
        table[BASE58_ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is not valid base58")]
    BadEncoding,
    #[error("address decodes to {0} bytes")]
    BadLength(usize),
    #[error("unsupported address prefix")]
    BadPrefix,
    #[error("address checksum mismatch")]
    BadChecksum,
}

fn encode_base58(bytes: &[u8]) -> String {
    let zeros = bytes.iter().take_while(|&&b| b == 0).count();
    // little-endian base-58 digits
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
    for &byte in &bytes[zeros..] {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat_n('1', zeros));
    out.extend(digits.iter().rev().map(|&d| BASE58_ALPHABET[d as usize] as char));
    out
}

fn decode_base58(s: &str) -> Option<Vec<u8>> {
    let zeros = s.bytes().take_while(|&c| c == b'1').count();
    // little-endian bytes
    let mut bytes: Vec<u8> = Vec::with_capacity(s.len());
    for c in s.bytes().skip(zeros) {
        if c >= 128 {
            return None;
        }
        let val = BASE58_DECODE[c as usize];
        if val == 0xFF {
            return None;
        }
        let mut carry = val as u32;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Some(out)
}

fn ss58_checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_CHECKSUM_PREFIX);
    hasher.update(body);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

fn encode_prefix(prefix: u16) -> Vec<u8> {
    match prefix {
        0..=63 => vec![prefix as u8],
        _ => {
            let prefix = prefix & 0b0011_1111_1111_1111;
            let first = ((prefix & 0b0000_0000_1111_1100) as u8) >> 2;
            let second = ((prefix >> 8) as u8) | (((prefix & 0b11) as u8) << 6);
            vec![first | 0b0100_0000, second]
        }
    }
}

/// Encode a 32-byte public key as an SS58 address.
pub fn encode_ss58(public_key: &[u8; PUBLIC_KEY_LEN], prefix: u16) -> String {
    let mut body = encode_prefix(prefix);
    body.extend_from_slice(public_key);
    let checksum = ss58_checksum(&body);
    body.extend_from_slice(&checksum);
    encode_base58(&body)
}

/// Decode an SS58 address into its prefix and public key.
pub fn decode_ss58(address: &str) -> Result<(u16, [u8; PUBLIC_KEY_LEN]), AddressError> {
    let data = decode_base58(address).ok_or(AddressError::BadEncoding)?;
    let (prefix_len, prefix) = match data.first() {
        Some(&b @ 0..=63) => (1, b as u16),
        Some(&b @ 64..=127) => {
            let second = *data.get(1).ok_or(AddressError::BadLength(data.len()))?;
            let lower = (b << 2) | (second >> 6);
            let upper = second & 0b0011_1111;
            (2, lower as u16 | ((upper as u16) << 8))
        }
        Some(_) => return Err(AddressError::BadPrefix),
        None => return Err(AddressError::BadLength(0)),
    };

    if data.len() != prefix_len + PUBLIC_KEY_LEN + CHECKSUM_LEN {
        return Err(AddressError::BadLength(data.len()));
    }

    let (body, checksum) = data.split_at(prefix_len + PUBLIC_KEY_LEN);
    if checksum != ss58_checksum(body).as_slice() {
        return Err(AddressError::BadChecksum);
    }

    let mut public_key = [0u8; PUBLIC_KEY_LEN];
    public_key.copy_from_slice(&body[prefix_len..]);
    Ok((prefix, public_key))
}

/// Decode a hex signature, with or without a `0x` prefix.
pub fn decode_signature(signature: &str) -> Option<[u8; SIGNATURE_LEN]> {
    let raw = signature.strip_prefix("0x").unwrap_or(signature);
    hex::decode(raw).ok()?.try_into().ok()
}

/// Verify `signature` over `message` against a raw public key.
pub fn verify_with_public_key(public_key: &[u8; PUBLIC_KEY_LEN], message: &[u8], signature: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Some(sig_bytes) = decode_signature(signature) else {
        return false;
    };
    verifying_key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

/// Verify `signature` over `message` against the key behind an SS58 address.
///
/// Malformed addresses and signatures are verification failures.
pub fn verify(address: &str, message: &[u8], signature: &str) -> bool {
    match decode_ss58(address) {
        Ok((_, public_key)) => verify_with_public_key(&public_key, message, signature),
        Err(_) => false,
    }
}

/// A hotkey able to sign receipts and handshake messages.
pub struct Hotkey {
    sk: SigningKey,
}

impl Hotkey {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { sk: SigningKey::from_bytes(&seed) }
    }

    pub fn from_hex(sk_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(sk_hex.strip_prefix("0x").unwrap_or(sk_hex))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("secret key must be 32 bytes, got {}", b.len()))?;
        Ok(Self::from_seed(seed))
    }

    /// `0x`-prefixed hex signature over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        format!("0x{}", hex::encode(self.sk.sign(message).to_bytes()))
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.sk.verifying_key().to_bytes()
    }

    pub fn ss58_address(&self) -> String {
        encode_ss58(&self.public_key(), SS58_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ss58_address_decodes_back_to_key() {
        let key = Hotkey::from_seed([7u8; 32]);
        let address = key.ss58_address();
        assert!(address.starts_with('5'), "prefix 42 addresses start with 5: {address}");
        assert_eq!(decode_ss58(&address), Ok((SS58_PREFIX, key.public_key())));
    }

    #[test]
    fn two_byte_prefix_is_supported() {
        let key = Hotkey::from_seed([3u8; 32]);
        let address = encode_ss58(&key.public_key(), 1284);
        assert_eq!(decode_ss58(&address), Ok((1284, key.public_key())));
    }

    #[test]
    fn known_address_decodes() {
        // Alice's well-known development key.
        let (prefix, key) = decode_ss58("5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY").unwrap();
        assert_eq!(prefix, 42);
        assert_eq!(
            hex::encode(key),
            "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d"
        );
    }

    #[test]
    fn corrupted_address_is_rejected() {
        let mut address = Hotkey::from_seed([7u8; 32]).ss58_address().into_bytes();
        let last = address.len() - 1;
        address[last] = if address[last] == b'a' { b'b' } else { b'a' };
        let address = String::from_utf8(address).unwrap();
        assert!(decode_ss58(&address).is_err());
        assert_eq!(decode_ss58("0OIl"), Err(AddressError::BadEncoding));
        assert!(decode_ss58("").is_err());
    }

    #[test]
    fn sign_and_verify() {
        let key = Hotkey::from_seed([9u8; 32]);
        let signature = key.sign(b"hello");
        assert!(verify(&key.ss58_address(), b"hello", &signature));
        assert!(verify(&key.ss58_address(), b"hello", signature.trim_start_matches("0x")));
        assert!(!verify(&key.ss58_address(), b"hullo", &signature));
    }

    #[test]
    fn wrong_key_fails() {
        let signer = Hotkey::from_seed([1u8; 32]);
        let other = Hotkey::from_seed([2u8; 32]);
        let signature = signer.sign(b"payload");
        assert!(!verify(&other.ss58_address(), b"payload", &signature));
    }

    #[test]
    fn malformed_inputs_never_panic() {
        let key = Hotkey::from_seed([9u8; 32]);
        assert!(!verify("not-an-address", b"m", &key.sign(b"m")));
        assert!(!verify(&key.ss58_address(), b"m", "0xzz"));
        assert!(!verify(&key.ss58_address(), b"m", "0x1234"));
        assert!(!verify(&key.ss58_address(), b"m", ""));
    }

    #[test]
    fn hotkey_from_hex_roundtrips_seed() {
        let seed_hex = "0x".to_string() + &"11".repeat(32);
        let key = Hotkey::from_hex(&seed_hex).unwrap();
        assert_eq!(key.public_key(), Hotkey::from_seed([0x11; 32]).public_key());
        assert!(Hotkey::from_hex("abcd").is_err());
    }
}
