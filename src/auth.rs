//! Credential material and auth-scheme selection.
//!
//! A `Credentials` value is built once at startup (or per request in
//! NTLM-to-basic mode), after which it is immutable and shared read-only
//! across workers. The plaintext password is hashed into the slots and
//! dropped; it never lives in the long-lived context.

use clap::ValueEnum;

use crate::error::{GateError, GateResult};
use crate::ntlm;

/// Which NTLM dialect to speak to the parent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum AuthScheme {
    /// Combined NT + LM responses (the classic default).
    Ntlm,
    /// NT response only.
    Nt,
    /// LM response only.
    Lm,
    /// NTLMv2 responses.
    Ntlmv2,
    /// NTLM2 Session Response.
    Ntlm2sr,
    /// GSS/Kerberos; accepted as a name, rejected at startup.
    Gss,
}

impl AuthScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ntlm" => Some(AuthScheme::Ntlm),
            "nt" => Some(AuthScheme::Nt),
            "lm" => Some(AuthScheme::Lm),
            "ntlmv2" => Some(AuthScheme::Ntlmv2),
            "ntlm2sr" => Some(AuthScheme::Ntlm2sr),
            "gss" => Some(AuthScheme::Gss),
            _ => None,
        }
    }
}

/// Parent-proxy credentials with derived hash slots.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub domain: String,
    pub workstation: String,
    /// 0 = no NT response, 1 = NT, 2 = NTLM2 Session Response.
    pub use_nt: u8,
    pub use_lm: bool,
    pub use_ntlm2: bool,
    pub pass_nt: Option<[u8; 21]>,
    pub pass_lm: Option<[u8; 21]>,
    pub pass_ntlm2: Option<[u8; 16]>,
    /// Raw operator override for the Type-1 flags field.
    pub flags_override: Option<u32>,
}

impl Credentials {
    fn empty(user: &str, domain: &str, workstation: &str, scheme: AuthScheme) -> GateResult<Self> {
        let (use_nt, use_lm, use_ntlm2) = match scheme {
            AuthScheme::Ntlm => (1, true, false),
            AuthScheme::Nt => (1, false, false),
            AuthScheme::Lm => (0, true, false),
            AuthScheme::Ntlmv2 => (0, false, true),
            AuthScheme::Ntlm2sr => (2, false, false),
            AuthScheme::Gss => {
                return Err(GateError::Config(
                    "GSS/Kerberos authentication is not supported by this build".into(),
                ))
            }
        };
        Ok(Credentials {
            user: user.to_string(),
            domain: domain.to_string(),
            workstation: workstation.to_string(),
            use_nt,
            use_lm,
            use_ntlm2,
            pass_nt: None,
            pass_lm: None,
            pass_ntlm2: None,
            flags_override: None,
        })
    }

    /// Hash a plaintext password into the slots the scheme requires. The
    /// caller is expected to drop the password afterwards.
    pub fn from_password(
        password: &str,
        user: &str,
        domain: &str,
        workstation: &str,
        scheme: AuthScheme,
    ) -> GateResult<Self> {
        let mut creds = Self::empty(user, domain, workstation, scheme)?;
        if creds.use_nt > 0 {
            creds.pass_nt = Some(ntlm::nt_hash(password));
        }
        if creds.use_lm {
            creds.pass_lm = Some(ntlm::lm_hash(password));
        }
        if creds.use_ntlm2 {
            creds.pass_ntlm2 = Some(ntlm::ntlmv2_hash(password, user, domain));
        }
        Ok(creds)
    }

    /// Hash every slot regardless of scheme; used by the hash-print and
    /// magic-detection modes which try all dialects.
    pub fn from_password_all(
        password: &str,
        user: &str,
        domain: &str,
        workstation: &str,
        scheme: AuthScheme,
    ) -> GateResult<Self> {
        let mut creds = Self::empty(user, domain, workstation, scheme)?;
        creds.pass_nt = Some(ntlm::nt_hash(password));
        creds.pass_lm = Some(ntlm::lm_hash(password));
        creds.pass_ntlm2 = Some(ntlm::ntlmv2_hash(password, user, domain));
        Ok(creds)
    }

    /// Build from pre-computed hex hashes (`PassNT` / `PassLM` /
    /// `PassNTLMv2` config values).
    pub fn from_hashes(
        pass_nt: Option<&str>,
        pass_lm: Option<&str>,
        pass_ntlm2: Option<&str>,
        user: &str,
        domain: &str,
        workstation: &str,
        scheme: AuthScheme,
    ) -> GateResult<Self> {
        let mut creds = Self::empty(user, domain, workstation, scheme)?;
        if let Some(hex) = pass_nt {
            let bytes = ntlm::parse_hex(hex, 16)
                .ok_or_else(|| GateError::Config(format!("invalid PassNT hash: {hex}")))?;
            let mut slot = [0u8; 21];
            slot[0..16].copy_from_slice(&bytes);
            creds.pass_nt = Some(slot);
        }
        if let Some(hex) = pass_lm {
            let bytes = ntlm::parse_hex(hex, 16)
                .ok_or_else(|| GateError::Config(format!("invalid PassLM hash: {hex}")))?;
            let mut slot = [0u8; 21];
            slot[0..16].copy_from_slice(&bytes);
            creds.pass_lm = Some(slot);
        }
        if let Some(hex) = pass_ntlm2 {
            let bytes = ntlm::parse_hex(hex, 16)
                .ok_or_else(|| GateError::Config(format!("invalid PassNTLMv2 hash: {hex}")))?;
            let mut slot = [0u8; 16];
            slot.copy_from_slice(&bytes);
            creds.pass_ntlm2 = Some(slot);
        }
        Ok(creds)
    }

    /// Every hash slot the selected scheme needs is populated.
    pub fn complete(&self) -> bool {
        (self.use_nt == 0 || self.pass_nt.is_some())
            && (!self.use_lm || self.pass_lm.is_some())
            && (!self.use_ntlm2 || self.pass_ntlm2.is_some())
    }

    /// Type-1 flags: the operator override wins, otherwise computed from
    /// the credential configuration.
    pub fn negotiate_flags(&self) -> u32 {
        if let Some(flags) = self.flags_override {
            return flags;
        }
        let mut flags = ntlm::NEGOTIATE_UNICODE
            | ntlm::NEGOTIATE_OEM
            | ntlm::REQUEST_TARGET
            | ntlm::NEGOTIATE_NTLM
            | ntlm::ALWAYS_SIGN;
        if !self.domain.is_empty() {
            flags |= ntlm::DOMAIN_SUPPLIED;
        }
        if !self.workstation.is_empty() {
            flags |= ntlm::WORKSTATION_SUPPLIED;
        }
        if self.use_ntlm2 || self.use_nt == 2 {
            flags |= ntlm::NEGOTIATE_NTLM2 | ntlm::NEGOTIATE_128;
        }
        flags
    }
}
