//! NTLMSSP wire codec and hash chain.
//!
//! Builds the Type-1 (negotiate) and Type-3 (authenticate) messages, parses
//! the Type-2 (challenge), and derives every response flavor the parent may
//! negotiate: plain LM/NT, NTLM2 Session Response, and NTLMv2.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use crate::auth::Credentials;
use crate::error::{GateError, GateResult};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub const REQUEST_TARGET: u32 = 0x0000_0004;
pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub const DOMAIN_SUPPLIED: u32 = 0x0000_1000;
pub const WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
pub const ALWAYS_SIGN: u32 = 0x0000_8000;
pub const NEGOTIATE_NTLM2: u32 = 0x0008_0000;
pub const NEGOTIATE_128: u32 = 0x2000_0000;

/// Offset between the Unix epoch and the Windows FILETIME epoch, in 100ns
/// ticks (1601-01-01 to 1970-01-01).
const FILETIME_EPOCH_OFFSET: u64 = 116_444_736_000_000_000;

/// Parsed Type-2 challenge message.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub challenge: [u8; 8],
    pub flags: u32,
    pub target_info: Vec<u8>,
}

fn security_buffer(out: &mut Vec<u8>, len: usize, offset: usize) {
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn read_security_buffer(raw: &[u8], at: usize) -> GateResult<&[u8]> {
    let len = u16::from_le_bytes([raw[at], raw[at + 1]]) as usize;
    let offset = u32::from_le_bytes([raw[at + 4], raw[at + 5], raw[at + 6], raw[at + 7]]) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    raw.get(offset..offset + len)
        .ok_or_else(|| GateError::Protocol("NTLM security buffer out of bounds".into()))
}

/// UTF-16LE bytes of a string, the encoding NTLM uses when unicode is
/// negotiated.
pub fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

fn oem(s: &str) -> Vec<u8> {
    s.to_ascii_uppercase().into_bytes()
}

/// Build the Type-1 negotiate message. Domain and workstation may be empty;
/// their supplied-flags must already be reflected in `flags`.
pub fn negotiate_message(flags: u32, domain: &str, workstation: &str) -> Vec<u8> {
    let dom = oem(domain);
    let ws = oem(workstation);

    let payload_offset = 32usize;
    let ws_offset = payload_offset;
    let dom_offset = ws_offset + ws.len();

    let mut msg = Vec::with_capacity(payload_offset + ws.len() + dom.len());
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    security_buffer(&mut msg, dom.len(), dom_offset);
    security_buffer(&mut msg, ws.len(), ws_offset);
    msg.extend_from_slice(&ws);
    msg.extend_from_slice(&dom);
    msg
}

/// Parse a Type-2 challenge message.
pub fn parse_challenge(raw: &[u8]) -> GateResult<Challenge> {
    if raw.len() < 32 {
        return Err(GateError::Protocol(format!(
            "NTLM challenge too short ({} bytes)",
            raw.len()
        )));
    }
    if &raw[0..8] != SIGNATURE {
        return Err(GateError::Protocol("bad NTLMSSP signature".into()));
    }
    let msg_type = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    if msg_type != 2 {
        return Err(GateError::Protocol(format!(
            "expected NTLM type 2 message, got type {msg_type}"
        )));
    }

    let flags = u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]);
    let mut challenge = [0u8; 8];
    challenge.copy_from_slice(&raw[24..32]);

    // Target info is only present in the longer form of the message.
    let target_info = if raw.len() >= 48 {
        read_security_buffer(raw, 40)?.to_vec()
    } else {
        Vec::new()
    };

    Ok(Challenge {
        challenge,
        flags,
        target_info,
    })
}

/// Build the Type-3 authenticate message for `creds` answering `chal`.
///
/// `timestamp` is 100ns ticks since the Unix epoch and `nonce` the 8-byte
/// client nonce; both only matter for the NTLMv2 and NTLM2SR schemes but are
/// threaded through unconditionally so the output is a pure function of its
/// inputs.
pub fn authenticate_message(
    creds: &Credentials,
    chal: &Challenge,
    timestamp: u64,
    nonce: [u8; 8],
) -> GateResult<Vec<u8>> {
    let (lm_resp, nt_resp) = compute_responses(creds, chal, timestamp, nonce)?;

    let unicode = chal.flags & NEGOTIATE_UNICODE != 0;
    let encode = |s: &str| if unicode { utf16le(s) } else { oem(s) };
    let dom = encode(&creds.domain);
    let user = encode(&creds.user);
    let ws = encode(&creds.workstation);

    let header_len = 64usize;
    let dom_offset = header_len;
    let user_offset = dom_offset + dom.len();
    let ws_offset = user_offset + user.len();
    let lm_offset = ws_offset + ws.len();
    let nt_offset = lm_offset + lm_resp.len();
    let session_offset = nt_offset + nt_resp.len();

    let mut msg = Vec::with_capacity(session_offset);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    security_buffer(&mut msg, lm_resp.len(), lm_offset);
    security_buffer(&mut msg, nt_resp.len(), nt_offset);
    security_buffer(&mut msg, dom.len(), dom_offset);
    security_buffer(&mut msg, user.len(), user_offset);
    security_buffer(&mut msg, ws.len(), ws_offset);
    security_buffer(&mut msg, 0, session_offset);
    msg.extend_from_slice(&chal.flags.to_le_bytes());
    msg.extend_from_slice(&dom);
    msg.extend_from_slice(&user);
    msg.extend_from_slice(&ws);
    msg.extend_from_slice(&lm_resp);
    msg.extend_from_slice(&nt_resp);
    Ok(msg)
}

fn compute_responses(
    creds: &Credentials,
    chal: &Challenge,
    timestamp: u64,
    nonce: [u8; 8],
) -> GateResult<(Vec<u8>, Vec<u8>)> {
    if creds.use_ntlm2 {
        let key = creds
            .pass_ntlm2
            .ok_or_else(|| GateError::Config("NTLMv2 selected but hash missing".into()))?;
        let nt = ntlmv2_response(&key, &chal.challenge, &chal.target_info, nonce, timestamp);
        let lm = lmv2_response(&key, &chal.challenge, nonce);
        return Ok((lm.to_vec(), nt));
    }

    let mut lm = Vec::new();
    let mut nt = Vec::new();
    if creds.use_nt == 2 {
        // NTLM2 Session Response: LM slot carries the client nonce.
        let key = creds
            .pass_nt
            .ok_or_else(|| GateError::Config("NTLM2SR selected but NT hash missing".into()))?;
        let (l, n) = ntlm2_session_response(&key, &chal.challenge, nonce);
        lm = l.to_vec();
        nt = n.to_vec();
    } else {
        if creds.use_nt == 1 {
            let key = creds
                .pass_nt
                .ok_or_else(|| GateError::Config("NT selected but hash missing".into()))?;
            nt = challenge_response(&key, &chal.challenge).to_vec();
        }
        if creds.use_lm {
            let key = creds
                .pass_lm
                .ok_or_else(|| GateError::Config("LM selected but hash missing".into()))?;
            lm = challenge_response(&key, &chal.challenge).to_vec();
        }
    }
    Ok((lm, nt))
}

/// Expand a 7-byte key half into the 8-byte DES key layout (parity bits are
/// ignored by the cipher).
fn des_key(half: &[u8]) -> [u8; 8] {
    [
        half[0],
        (half[0] << 7) | (half[1] >> 1),
        (half[1] << 6) | (half[2] >> 2),
        (half[2] << 5) | (half[3] >> 3),
        (half[3] << 4) | (half[4] >> 4),
        (half[4] << 3) | (half[5] >> 5),
        (half[5] << 2) | (half[6] >> 6),
        half[6] << 1,
    ]
}

fn des_encrypt(key7: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(GenericArray::from_slice(&des_key(key7)));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// LM hash of a password, padded to the 21-byte response key.
pub fn lm_hash(password: &str) -> [u8; 21] {
    let mut padded = [0u8; 14];
    for (i, b) in password
        .bytes()
        .map(|b| b.to_ascii_uppercase())
        .take(14)
        .enumerate()
    {
        padded[i] = b;
    }
    let mut out = [0u8; 21];
    out[0..8].copy_from_slice(&des_encrypt(&padded[0..7], LM_MAGIC));
    out[8..16].copy_from_slice(&des_encrypt(&padded[7..14], LM_MAGIC));
    out
}

/// NT hash of a password, padded to the 21-byte response key.
pub fn nt_hash(password: &str) -> [u8; 21] {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password));
    let mut out = [0u8; 21];
    out[0..16].copy_from_slice(&hasher.finalize());
    out
}

/// Classic 24-byte challenge response: three DES rounds over the challenge
/// keyed by thirds of the 21-byte key.
pub fn challenge_response(key: &[u8; 21], challenge: &[u8; 8]) -> [u8; 24] {
    let mut out = [0u8; 24];
    out[0..8].copy_from_slice(&des_encrypt(&key[0..7], challenge));
    out[8..16].copy_from_slice(&des_encrypt(&key[7..14], challenge));
    out[16..24].copy_from_slice(&des_encrypt(&key[14..21], challenge));
    out
}

/// NTLM2 Session Response: the LM slot carries the nonce, the NT response is
/// computed over the MD5 session hash of challenge‖nonce.
pub fn ntlm2_session_response(
    nt_key: &[u8; 21],
    challenge: &[u8; 8],
    nonce: [u8; 8],
) -> ([u8; 24], [u8; 24]) {
    let mut lm = [0u8; 24];
    lm[0..8].copy_from_slice(&nonce);

    let mut hasher = Md5::new();
    hasher.update(challenge);
    hasher.update(nonce);
    let digest = hasher.finalize();
    let mut session = [0u8; 8];
    session.copy_from_slice(&digest[0..8]);

    (lm, challenge_response(nt_key, &session))
}

/// NTLMv2 key: HMAC-MD5 over UTF-16LE(uppercase(user) ‖ domain) keyed by the
/// NT hash.
pub fn ntlmv2_hash(password: &str, user: &str, domain: &str) -> [u8; 16] {
    let nt = nt_hash(password);
    let mut mac = <HmacMd5 as Mac>::new_from_slice(&nt[0..16]).expect("hmac accepts any key length");
    mac.update(&utf16le(&user.to_uppercase()));
    mac.update(&utf16le(domain));
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// The variable-length blob appended to the NTLMv2 HMAC.
pub fn ntlmv2_blob(target_info: &[u8], nonce: [u8; 8], timestamp: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(&(timestamp + FILETIME_EPOCH_OFFSET).to_le_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&0u32.to_le_bytes());
    blob
}

/// NTv2 response: HMAC-MD5(key, challenge ‖ blob) ‖ blob.
pub fn ntlmv2_response(
    key: &[u8; 16],
    challenge: &[u8; 8],
    target_info: &[u8],
    nonce: [u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    let blob = ntlmv2_blob(target_info, nonce, timestamp);
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(challenge);
    mac.update(&blob);
    let mut out = Vec::with_capacity(16 + blob.len());
    out.extend_from_slice(&mac.finalize().into_bytes());
    out.extend_from_slice(&blob);
    out
}

/// LMv2 companion response: HMAC-MD5(key, challenge ‖ nonce) ‖ nonce.
pub fn lmv2_response(key: &[u8; 16], challenge: &[u8; 8], nonce: [u8; 8]) -> [u8; 24] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(challenge);
    mac.update(&nonce);
    let mut out = [0u8; 24];
    out[0..16].copy_from_slice(&mac.finalize().into_bytes());
    out[16..24].copy_from_slice(&nonce);
    out
}

const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex rendering, used for hash printing.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX_LOWER[(b >> 4) as usize] as char);
        out.push(HEX_LOWER[(b & 0x0f) as usize] as char);
    }
    out
}

/// Parse a hex string of exactly `len` bytes, as found in `PassNT`-style
/// config values.
pub fn parse_hex(s: &str, len: usize) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() != len * 2 {
        return None;
    }
    let mut out = Vec::with_capacity(len);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthScheme, Credentials};

    // Vectors for user "User", domain "Domain", password "SecREt01",
    // server challenge 0123456789abcdef, client nonce ffffff0011223344.
    const CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const NONCE: [u8; 8] = [0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44];

    #[test]
    fn test_lm_hash_vector() {
        let hash = lm_hash("SecREt01");
        assert_eq!(to_hex(&hash[0..16]), "ff3750bcc2b22412c2265b23734e0dac");
        assert_eq!(&hash[16..21], &[0u8; 5]);
    }

    #[test]
    fn test_nt_hash_vector() {
        let hash = nt_hash("SecREt01");
        assert_eq!(to_hex(&hash[0..16]), "cd06ca7c7e10c99b1d33b7485a2ed808");
    }

    #[test]
    fn test_lm_response_vector() {
        let resp = challenge_response(&lm_hash("SecREt01"), &CHALLENGE);
        assert_eq!(
            to_hex(&resp),
            "c337cd5cbd44fc9782a667af6d427c6de67c20c2d3e77c56"
        );
    }

    #[test]
    fn test_nt_response_vector() {
        let resp = challenge_response(&nt_hash("SecREt01"), &CHALLENGE);
        assert_eq!(
            to_hex(&resp),
            "25a98c1c31e81847466b29b2df4680f39958fb8c213a9cc6"
        );
    }

    #[test]
    fn test_ntlm2_session_response_vector() {
        let (lm, nt) = ntlm2_session_response(&nt_hash("SecREt01"), &CHALLENGE, NONCE);
        assert_eq!(&lm[0..8], &NONCE);
        assert_eq!(&lm[8..24], &[0u8; 16]);
        assert_eq!(
            to_hex(&nt),
            "10d550832d12b2ccb79d5ad1f4eed3df82aca4c3681dd455"
        );
    }

    #[test]
    fn test_ntlmv2_hash_vector() {
        // Published vector: only the user is case-folded, so the domain
        // must be given uppercase to reproduce it.
        let key = ntlmv2_hash("SecREt01", "User", "DOMAIN");
        assert_eq!(to_hex(&key), "04b8e0ba74289cc540826bab1dee63ae");
    }

    #[test]
    fn test_ntlmv2_response_deterministic_and_self_consistent() {
        let key = ntlmv2_hash("SecREt01", "User", "Domain");
        let resp = ntlmv2_response(&key, &CHALLENGE, &[], NONCE, 0);
        let again = ntlmv2_response(&key, &CHALLENGE, &[], NONCE, 0);
        assert_eq!(resp, again);

        // First 16 bytes are the HMAC of challenge ‖ blob; the rest is the
        // blob itself.
        let blob = ntlmv2_blob(&[], NONCE, 0);
        assert_eq!(&resp[16..], &blob[..]);
        let mut mac = <HmacMd5 as Mac>::new_from_slice(&key).unwrap();
        mac.update(&CHALLENGE);
        mac.update(&blob);
        assert_eq!(&resp[0..16], &mac.finalize().into_bytes()[..]);
    }

    #[test]
    fn test_ntlmv2_blob_layout() {
        let info = [0x02u8, 0x00, 0x00, 0x00];
        let blob = ntlmv2_blob(&info, NONCE, 0);
        assert_eq!(&blob[0..4], &[0x01, 0x01, 0x00, 0x00]);
        assert_eq!(
            u64::from_le_bytes(blob[8..16].try_into().unwrap()),
            FILETIME_EPOCH_OFFSET
        );
        assert_eq!(&blob[16..24], &NONCE);
        assert_eq!(&blob[28..32], &info);
    }

    #[test]
    fn test_negotiate_roundtrip_fields() {
        let msg = negotiate_message(0xb207, "Domain", "ws1");
        assert_eq!(&msg[0..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(msg[12..16].try_into().unwrap()), 0xb207);
        // Workstation payload precedes domain payload.
        assert_eq!(&msg[32..35], b"WS1");
        assert_eq!(&msg[35..41], b"DOMAIN");
    }

    #[test]
    fn test_parse_challenge_minimal() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"NTLMSSP\0");
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]); // target name buffer
        raw.extend_from_slice(&0x00008201u32.to_le_bytes());
        raw.extend_from_slice(&CHALLENGE);
        let chal = parse_challenge(&raw).unwrap();
        assert_eq!(chal.challenge, CHALLENGE);
        assert_eq!(chal.flags, 0x8201);
        assert!(chal.target_info.is_empty());
    }

    #[test]
    fn test_parse_challenge_with_target_info() {
        let info = b"\x02\x00\x04\x00HI!!\x00\x00\x00\x00";
        let mut raw = Vec::new();
        raw.extend_from_slice(b"NTLMSSP\0");
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 8]);
        raw.extend_from_slice(&0x00000001u32.to_le_bytes());
        raw.extend_from_slice(&CHALLENGE);
        raw.extend_from_slice(&[0u8; 8]); // context
        let info_offset = 48u32;
        raw.extend_from_slice(&(info.len() as u16).to_le_bytes());
        raw.extend_from_slice(&(info.len() as u16).to_le_bytes());
        raw.extend_from_slice(&info_offset.to_le_bytes());
        raw.extend_from_slice(info);
        let chal = parse_challenge(&raw).unwrap();
        assert_eq!(chal.target_info, info);
    }

    #[test]
    fn test_parse_challenge_rejects_garbage() {
        assert!(parse_challenge(b"short").is_err());
        assert!(parse_challenge(&[0u8; 40]).is_err());

        let mut wrong_type = Vec::new();
        wrong_type.extend_from_slice(b"NTLMSSP\0");
        wrong_type.extend_from_slice(&1u32.to_le_bytes());
        wrong_type.extend_from_slice(&[0u8; 24]);
        assert!(parse_challenge(&wrong_type).is_err());
    }

    #[test]
    fn test_authenticate_message_layout() {
        let creds = Credentials::from_password("SecREt01", "User", "Domain", "WS", AuthScheme::Ntlmv2)
            .unwrap();
        let chal = Challenge {
            challenge: CHALLENGE,
            flags: NEGOTIATE_UNICODE,
            target_info: Vec::new(),
        };
        let msg = authenticate_message(&creds, &chal, 0, NONCE).unwrap();
        assert_eq!(&msg[0..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);

        // The domain security buffer points at UTF-16LE "Domain".
        let dom_len = u16::from_le_bytes(msg[28..30].try_into().unwrap()) as usize;
        let dom_off =
            u32::from_le_bytes(msg[32..36].try_into().unwrap()) as usize;
        assert_eq!(&msg[dom_off..dom_off + dom_len], &utf16le("Domain")[..]);

        // NT slot holds an NTLMv2 response (HMAC + blob, longer than 24).
        let nt_len = u16::from_le_bytes(msg[20..22].try_into().unwrap()) as usize;
        assert!(nt_len > 24);
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = [0x00u8, 0x9f, 0xff, 0x42];
        let hex = to_hex(&bytes);
        assert_eq!(hex, "009fff42");
        assert_eq!(parse_hex(&hex, 4).unwrap(), bytes);
        assert!(parse_hex("zz", 1).is_none());
        assert!(parse_hex("aabb", 3).is_none());
    }
}
