//! LM, NTLMv1, NTLM2 session and NTLMv2 response computation.

use des::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Des,
};
use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest, Md5};

type HmacMd5 = Hmac<Md5>;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

// 100ns intervals between 1601-01-01 and the unix epoch.
const FILETIME_EPOCH_OFFSET: u64 = 116_444_736_000_000_000;

pub(super) fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Single-byte encoding used when the server did not negotiate unicode.
pub(super) fn oem(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Spreads 56 key bits over 8 bytes, setting odd parity in the low bit.
fn des_key(k: &[u8]) -> [u8; 8] {
    let mut key = [
        k[0],
        (k[0] << 7) | (k[1] >> 1),
        (k[1] << 6) | (k[2] >> 2),
        (k[2] << 5) | (k[3] >> 3),
        (k[3] << 4) | (k[4] >> 4),
        (k[4] << 3) | (k[5] >> 5),
        (k[5] << 2) | (k[6] >> 6),
        k[6] << 1,
    ];
    for b in key.iter_mut() {
        if (*b >> 1).count_ones() % 2 == 0 {
            *b |= 0x01;
        } else {
            *b &= 0xfe;
        }
    }
    key
}

fn des_encrypt(key7: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let key = des_key(key7);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

pub(super) fn lm_hash(password: &str) -> [u8; 16] {
    let mut key = [0u8; 14];
    let upper = oem(&password.to_uppercase());
    let len = upper.len().min(14);
    key[..len].copy_from_slice(&upper[..len]);

    let mut hash = [0u8; 16];
    hash[..8].copy_from_slice(&des_encrypt(&key[..7], LM_MAGIC));
    hash[8..].copy_from_slice(&des_encrypt(&key[7..], LM_MAGIC));
    hash
}

pub(super) fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

/// The 24-byte DES response: the 16-byte hash, zero padded to 21 bytes, as
/// three keys each encrypting the challenge.
pub(super) fn des_response(hash: &[u8; 16], challenge: &[u8; 8]) -> [u8; 24] {
    let mut keys = [0u8; 21];
    keys[..16].copy_from_slice(hash);

    let mut out = [0u8; 24];
    for (i, chunk) in keys.chunks(7).enumerate() {
        out[i * 8..i * 8 + 8].copy_from_slice(&des_encrypt(chunk, challenge));
    }
    out
}

pub(super) fn ntlm2_session_response(
    nt_hash: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> [u8; 24] {
    let mut md5 = Md5::new();
    md5.update(server_challenge);
    md5.update(client_challenge);
    let digest = md5.finalize();

    let mut session_hash = [0u8; 8];
    session_hash.copy_from_slice(&digest[..8]);
    des_response(nt_hash, &session_hash)
}

/// Username upper-cased, domain as given.
pub(super) fn ntlmv2_hash(nt_hash: &[u8; 16], user: &str, domain: &str) -> [u8; 16] {
    let user = utf16le(&user.to_uppercase());
    let domain = utf16le(domain);
    hmac_md5(nt_hash, &[&user[..], &domain[..]])
}

/// Username and domain both upper-cased.
pub(super) fn lmv2_hash(nt_hash: &[u8; 16], user: &str, domain: &str) -> [u8; 16] {
    let user = utf16le(&user.to_uppercase());
    let domain = utf16le(&domain.to_uppercase());
    hmac_md5(nt_hash, &[&user[..], &domain[..]])
}

pub(super) fn ntlmv2_blob(client_challenge: &[u8; 8], target_info: &[u8], timestamp: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(28 + target_info.len() + 4);
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);
    blob
}

/// HMAC over the server challenge and `client_data`, followed by
/// `client_data`. Gives the NTLMv2 response for a blob and the LMv2
/// response for a client challenge.
pub(super) fn v2_response(hash: &[u8; 16], server_challenge: &[u8; 8], client_data: &[u8]) -> Vec<u8> {
    let proof = hmac_md5(hash, &[&server_challenge[..], client_data]);
    let mut out = Vec::with_capacity(16 + client_data.len());
    out.extend_from_slice(&proof);
    out.extend_from_slice(client_data);
    out
}

/// Now as a Windows FILETIME.
pub(super) fn filetime_now() -> u64 {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    FILETIME_EPOCH_OFFSET + (since_epoch.as_nanos() / 100) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex;

    const CHALLENGE: &[u8; 8] = b"SrvNonce";

    #[test]
    fn lm_response_vector() {
        let hash = lm_hash("Beeblebrox");
        assert_eq!(
            hex(&des_response(&hash, CHALLENGE)),
            "ad87ca6defe34685b9c43c477a8c42d600667d6892e7e897"
        );
    }

    #[test]
    fn nt_response_vector() {
        let hash = nt_hash("Beeblebrox");
        assert_eq!(
            hex(&des_response(&hash, CHALLENGE)),
            "e0e00de3104a1bf2053f07c7dda82d3c489ae989e1b000d3"
        );
    }

    #[test]
    fn nt_hash_of_password() {
        // MD4 of UTF-16LE "password"
        assert_eq!(hex(&nt_hash("password")), "8846f7eaee8fb117ad06bdd830b7586c");
    }

    #[test]
    fn des_key_parity() {
        for b in des_key(&[0xff, 0x00, 0xaa, 0x55, 0x12, 0x34, 0x56]) {
            assert_eq!(b.count_ones() % 2, 1);
        }
    }

    #[test]
    fn blob_layout() {
        let blob = ntlmv2_blob(&[7; 8], &[1, 2, 3], 0x0102_0304_0506_0708);
        assert_eq!(&blob[..4], &[1, 1, 0, 0]);
        assert_eq!(&blob[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&blob[16..24], &[7; 8]);
        assert_eq!(&blob[28..31], &[1, 2, 3]);
        assert_eq!(blob.len(), 28 + 3 + 4);
    }

    #[test]
    fn v2_response_carries_client_data() {
        let hash = ntlmv2_hash(&nt_hash("Beeblebrox"), "Zaphod", "Ursa-Minor");
        let lm_hash = lmv2_hash(&nt_hash("Beeblebrox"), "Zaphod", "Ursa-Minor");
        let lmv2 = v2_response(&lm_hash, CHALLENGE, &[9; 8]);
        assert_eq!(lmv2.len(), 24);
        assert_eq!(&lmv2[16..], &[9; 8]);

        let nt = v2_response(&hash, CHALLENGE, b"blob");
        assert_eq!(nt.len(), 20);
        assert_ne!(&nt[..16], &lmv2[..16]);
    }

    #[test]
    fn filetime_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(filetime_now() > 132_223_104_000_000_000);
    }
}
