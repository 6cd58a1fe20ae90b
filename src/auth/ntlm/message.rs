//! NTLM Type 1 (Negotiate), Type 2 (Challenge) and Type 3 (Authenticate)
//! messages.

use std::{error::Error as StdError, fmt};

use super::crypto;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

pub(crate) const FLAG_UNICODE: u32 = 0x0000_0001;
pub(crate) const FLAG_REQUEST_TARGET: u32 = 0x0000_0004;
pub(crate) const FLAG_LM_KEY: u32 = 0x0000_0080;
pub(crate) const FLAG_NTLM: u32 = 0x0000_0200;
pub(crate) const FLAG_ALWAYS_SIGN: u32 = 0x0000_8000;
pub(crate) const FLAG_NTLM2_SESSION: u32 = 0x0008_0000;
pub(crate) const FLAG_TARGET_INFO: u32 = 0x0080_0000;
pub(crate) const FLAG_VERSION: u32 = 0x0200_0000;
pub(crate) const FLAG_128BIT: u32 = 0x2000_0000;
pub(crate) const FLAG_56BIT: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = FLAG_56BIT
    | FLAG_128BIT
    | FLAG_VERSION
    | FLAG_NTLM2_SESSION
    | FLAG_ALWAYS_SIGN
    | FLAG_NTLM
    | FLAG_UNICODE;

// Type 2 flags echoed back in Type 3.
const AUTHENTICATE_MASK: u32 = FLAG_LM_KEY
    | FLAG_NTLM
    | FLAG_NTLM2_SESSION
    | FLAG_ALWAYS_SIGN
    | FLAG_128BIT
    | FLAG_56BIT
    | FLAG_TARGET_INFO
    | FLAG_UNICODE
    | FLAG_REQUEST_TARGET;

// Windows 5.1 build 2600, NTLM revision 15.
const VERSION: [u8; 8] = [0x05, 0x01, 0x28, 0x0a, 0x00, 0x00, 0x00, 0x0f];

const TYPE1_LEN: u32 = 40;
const TYPE3_HEADER_LEN: usize = 72;

/// The Type 1 message. Domain and workstation are left empty: they are
/// only sent, authenticated, in the Type 3.
pub(crate) fn negotiate() -> Vec<u8> {
    let mut out = Vec::with_capacity(TYPE1_LEN as usize);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    write_buffer_header(&mut out, 0, TYPE1_LEN);
    write_buffer_header(&mut out, 0, TYPE1_LEN);
    out.extend_from_slice(&VERSION);
    out
}

/// A decoded Type 2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub(crate) flags: u32,
    pub(crate) server_challenge: [u8; 8],
    pub(crate) target: Option<String>,
    pub(crate) target_info: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct Malformed(&'static str);

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed NTLM challenge: {}", self.0)
    }
}

impl StdError for Malformed {}

/// A Type 3 field does not fit its 16-bit length.
#[derive(Debug)]
pub(crate) struct Oversized(&'static str);

impl fmt::Display for Oversized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NTLM {} is too long", self.0)
    }
}

impl StdError for Oversized {}

impl Challenge {
    pub(crate) fn decode(msg: &[u8]) -> Result<Challenge, Malformed> {
        if msg.len() < 32 {
            return Err(Malformed("message too short"));
        }
        if &msg[..8] != SIGNATURE {
            return Err(Malformed("bad signature"));
        }
        if read_u32(msg, 8) != 2 {
            return Err(Malformed("not a type 2 message"));
        }

        let flags = read_u32(msg, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&msg[24..32]);

        let target = read_buffer(msg, 12)?
            .filter(|bytes| !bytes.is_empty())
            .map(|bytes| decode_string(bytes, flags & FLAG_UNICODE != 0));

        let target_info = if flags & FLAG_TARGET_INFO != 0 && msg.len() >= 48 {
            read_buffer(msg, 40)?
                .filter(|bytes| !bytes.is_empty())
                .map(<[u8]>::to_vec)
        } else {
            None
        };

        Ok(Challenge {
            flags,
            server_challenge,
            target,
            target_info,
        })
    }
}

/// Everything a Type 3 message is built from.
pub(crate) struct Credentials<'a> {
    pub(crate) domain: Option<&'a str>,
    pub(crate) workstation: Option<&'a str>,
    pub(crate) user: &'a str,
    pub(crate) password: &'a str,
}

/// Builds the Type 3 message answering `challenge`.
///
/// `client_challenge` and `timestamp` are only used by the NTLM2 session
/// and NTLMv2 responses.
pub(crate) fn authenticate(
    creds: &Credentials<'_>,
    challenge: &Challenge,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>, Oversized> {
    let nt_hash = crypto::nt_hash(creds.password);
    let server = &challenge.server_challenge;

    let (lm_response, nt_response) = if let Some(ref target_info) = challenge.target_info {
        let domain = creds.domain.unwrap_or_default();
        let v2 = crypto::ntlmv2_hash(&nt_hash, creds.user, domain);
        let lmv2 = crypto::lmv2_hash(&nt_hash, creds.user, domain);
        let blob = crypto::ntlmv2_blob(&client_challenge, target_info, timestamp);
        (
            crypto::v2_response(&lmv2, server, &client_challenge),
            crypto::v2_response(&v2, server, &blob),
        )
    } else if challenge.flags & FLAG_NTLM2_SESSION != 0 {
        let mut lm = client_challenge.to_vec();
        lm.resize(24, 0);
        let nt = crypto::ntlm2_session_response(&nt_hash, server, &client_challenge);
        (lm, nt.to_vec())
    } else {
        let lm = crypto::des_response(&crypto::lm_hash(creds.password), server);
        let nt = crypto::des_response(&nt_hash, server);
        (lm.to_vec(), nt.to_vec())
    };

    let unicode = challenge.flags & FLAG_UNICODE != 0;
    let encode = |s: &str| {
        if unicode {
            crypto::utf16le(s)
        } else {
            crypto::oem(s)
        }
    };
    let domain = creds
        .domain
        .map(|d| encode(&strip_dot_suffix(d).to_uppercase()))
        .unwrap_or_default();
    let user = encode(creds.user);
    let workstation = creds
        .workstation
        .map(|w| encode(strip_dot_suffix(w)))
        .unwrap_or_default();
    let session_key: &[u8] = &[];

    let payloads: [(&str, &[u8]); 6] = [
        ("LM response", &lm_response),
        ("NT response", &nt_response),
        ("domain", &domain),
        ("user name", &user),
        ("workstation", &workstation),
        ("session key", session_key),
    ];

    let flags = (challenge.flags & AUTHENTICATE_MASK) | FLAG_VERSION;

    let total = TYPE3_HEADER_LEN + payloads.iter().map(|(_, p)| p.len()).sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&3u32.to_le_bytes());

    let mut offset = TYPE3_HEADER_LEN;
    for (name, payload) in payloads {
        let len = u16::try_from(payload.len()).map_err(|_| Oversized(name))?;
        write_buffer_header(&mut out, len, offset as u32);
        offset += payload.len();
    }
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&VERSION);
    debug_assert_eq!(out.len(), TYPE3_HEADER_LEN);

    for (_, payload) in payloads {
        out.extend_from_slice(payload);
    }
    Ok(out)
}

fn strip_dot_suffix(s: &str) -> &str {
    match s.find('.') {
        Some(i) => &s[..i],
        None => s,
    }
}

fn write_buffer_header(out: &mut Vec<u8>, len: u16, offset: u32) {
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(msg: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([msg[at], msg[at + 1]])
}

fn read_u32(msg: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([msg[at], msg[at + 1], msg[at + 2], msg[at + 3]])
}

fn read_buffer(msg: &[u8], at: usize) -> Result<Option<&[u8]>, Malformed> {
    if msg.len() < at + 8 {
        return Ok(None);
    }
    let len = read_u16(msg, at) as usize;
    let offset = read_u32(msg, at + 4) as usize;
    if len == 0 {
        return Ok(Some(&msg[..0]));
    }
    msg.get(offset..offset + len)
        .map(Some)
        .ok_or(Malformed("security buffer out of bounds"))
}

fn decode_string(bytes: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::prelude::{Engine as _, BASE64_STANDARD};

    const TYPE1: &str = "TlRMTVNTUAABAAAAAYIIogAAAAAoAAAAAAAAACgAAAAFASgKAAAADw==";
    const TYPE2: &str = "TlRMTVNTUAACAAAAAAAAACgAAAABggAAU3J2Tm9uY2UAAAAAAAAAAA==";
    const TYPE3: &str = "TlRMTVNTUAADAAAAGAAYAEgAAAAYABgAYAAAABQAFAB4AAAADAAMAIwAAAASABIAmAAAAAAAAACqAAAAAYIAAgUBKAoAAAAPrYfKbe/jRoW5xDxHeoxC1gBmfWiS5+iX4OAN4xBKG/IFPwfH3agtPEia6YnhsADTVQBSAFMAQQAtAE0ASQBOAE8AUgBaAGEAcABoAG8AZABMAGkAZwBoAHQAQwBpAHQAeQA=";

    fn creds() -> Credentials<'static> {
        Credentials {
            domain: Some("Ursa-Minor"),
            workstation: Some("LightCity"),
            user: "Zaphod",
            password: "Beeblebrox",
        }
    }

    #[test]
    fn type1_reference() {
        assert_eq!(BASE64_STANDARD.encode(negotiate()), TYPE1);
    }

    #[test]
    fn type2_reference() {
        let msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        let challenge = Challenge::decode(&msg).unwrap();
        assert_eq!(challenge.flags, 0x0000_8201);
        assert_eq!(&challenge.server_challenge, b"SrvNonce");
        assert_eq!(challenge.target, None);
        assert_eq!(challenge.target_info, None);
    }

    #[test]
    fn type3_reference() {
        let msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        let challenge = Challenge::decode(&msg).unwrap();
        let type3 = authenticate(&creds(), &challenge, [0; 8], 0).unwrap();
        assert_eq!(type3.len(), 170);
        assert_eq!(BASE64_STANDARD.encode(type3), TYPE3);
    }

    #[test]
    fn type2_rejects_garbage() {
        assert!(Challenge::decode(b"short").is_err());

        let mut msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        msg[0] = b'X';
        assert!(Challenge::decode(&msg).is_err());

        let mut msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        msg[8] = 3;
        assert!(Challenge::decode(&msg).is_err());
    }

    fn challenge_with_target_info(flags: u32) -> Vec<u8> {
        let target = crypto::utf16le("DOMAIN");
        let info = [0x02, 0x00, 0x0c, 0x00]
            .iter()
            .copied()
            .chain(crypto::utf16le("DOMAIN"))
            .chain([0, 0, 0, 0])
            .collect::<Vec<u8>>();

        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&2u32.to_le_bytes());
        write_buffer_header(&mut msg, target.len() as u16, 48);
        msg.extend_from_slice(&flags.to_le_bytes());
        msg.extend_from_slice(b"SrvNonce");
        msg.extend_from_slice(&[0; 8]);
        write_buffer_header(&mut msg, info.len() as u16, 48 + target.len() as u32);
        msg.extend_from_slice(&target);
        msg.extend_from_slice(&info);
        msg
    }

    #[test]
    fn type2_target_info() {
        let msg = challenge_with_target_info(FLAG_UNICODE | FLAG_NTLM | FLAG_TARGET_INFO);
        let challenge = Challenge::decode(&msg).unwrap();
        assert_eq!(challenge.target.as_deref(), Some("DOMAIN"));
        assert_eq!(challenge.target_info.as_ref().map(Vec::len), Some(4 + 12 + 4));

        // Without the flag the buffer is ignored.
        let msg = challenge_with_target_info(FLAG_UNICODE | FLAG_NTLM);
        assert_eq!(Challenge::decode(&msg).unwrap().target_info, None);
    }

    #[test]
    fn ntlmv2_when_target_info_present() {
        let msg = challenge_with_target_info(FLAG_UNICODE | FLAG_NTLM | FLAG_TARGET_INFO);
        let challenge = Challenge::decode(&msg).unwrap();
        let type3 = authenticate(&creds(), &challenge, [1; 8], 42).unwrap();

        let lm_len = read_u16(&type3, 12) as usize;
        let nt_len = read_u16(&type3, 20) as usize;
        let lm_off = read_u32(&type3, 16) as usize;
        assert_eq!(lm_len, 24);
        assert_eq!(&type3[lm_off + 16..lm_off + 24], &[1; 8]);
        // proof + blob header + target info + terminator
        assert_eq!(nt_len, 16 + 28 + 20 + 4);
        assert_eq!(read_u32(&type3, 60) & FLAG_TARGET_INFO, FLAG_TARGET_INFO);
    }

    #[test]
    fn ntlm2_session_response_layout() {
        let mut msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        let flags = 0x0000_8201 | FLAG_NTLM2_SESSION;
        msg[20..24].copy_from_slice(&flags.to_le_bytes());
        let challenge = Challenge::decode(&msg).unwrap();
        let type3 = authenticate(&creds(), &challenge, [5; 8], 0).unwrap();

        let lm_off = read_u32(&type3, 16) as usize;
        let mut expected_lm = vec![5u8; 8];
        expected_lm.resize(24, 0);
        assert_eq!(&type3[lm_off..lm_off + 24], &expected_lm[..]);
        assert_eq!(read_u32(&type3, 60), flags | FLAG_VERSION);
    }

    #[test]
    fn oem_strings_without_unicode() {
        let mut msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        let flags = FLAG_NTLM;
        msg[20..24].copy_from_slice(&flags.to_le_bytes());
        let challenge = Challenge::decode(&msg).unwrap();
        let type3 = authenticate(&creds(), &challenge, [0; 8], 0).unwrap();

        let user_len = read_u16(&type3, 36) as usize;
        let user_off = read_u32(&type3, 40) as usize;
        assert_eq!(&type3[user_off..user_off + user_len], b"Zaphod");
    }

    #[test]
    fn oversized_field_is_refused() {
        let msg = BASE64_STANDARD.decode(TYPE2).unwrap();
        let challenge = Challenge::decode(&msg).unwrap();
        let user = "u".repeat(40_000);
        let creds = Credentials {
            user: &user,
            ..creds()
        };
        let err = authenticate(&creds, &challenge, [0; 8], 0).unwrap_err();
        assert_eq!(err.to_string(), "NTLM user name is too long");
    }

    #[test]
    fn dot_suffix() {
        assert_eq!(strip_dot_suffix("host.example.com"), "host");
        assert_eq!(strip_dot_suffix("host"), "host");
    }
}
