//! ntlmgate - local NTLM authenticating proxy gateway.
//!
//! Clients speak plain HTTP proxy (or SOCKS5, or a fixed TCP tunnel) to
//! this process; it performs the NTLM challenge/response handshake against
//! the corporate parent proxy on their behalf, pools the authenticated
//! connections, and relays traffic verbatim.

pub mod auth;
pub mod config;
pub mod detect;
pub mod error;
pub mod forward;
pub mod http;
pub mod noproxy;
pub mod ntlm;
pub mod pac;
pub mod parent;
pub mod pool;
pub mod socks;
pub mod tunnel;
