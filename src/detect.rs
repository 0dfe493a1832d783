//! Magic NTLM dialect autodetection: try every hash profile against a test
//! URL through the first working parent and report which ones the proxy
//! accepts, so the operator can pick the strongest for the config file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use tracing::warn;

use crate::auth::Credentials;
use crate::config::GateContext;
use crate::error::{GateError, GateResult};
use crate::http::{drain_body, BodyFraming, HeaderMap, HttpStream, RequestRecord};
use crate::ntlm;

enum ProfileResult {
    /// The parent answered without demanding authentication.
    Open(u16),
    /// The dance completed and the parent accepted the credentials.
    Accepted(u16),
    /// 407 again after the Type-3.
    Rejected,
}

struct Profile {
    name: &'static str,
    auth_key: &'static str,
    use_nt: u8,
    use_lm: bool,
    use_ntlm2: bool,
}

const PROFILES: &[Profile] = &[
    Profile { name: "NTLMv2", auth_key: "ntlmv2", use_nt: 0, use_lm: false, use_ntlm2: true },
    Profile { name: "NTLM2SR", auth_key: "ntlm2sr", use_nt: 2, use_lm: false, use_ntlm2: false },
    Profile { name: "NT", auth_key: "nt", use_nt: 1, use_lm: false, use_ntlm2: false },
    Profile { name: "NTLM", auth_key: "ntlm", use_nt: 1, use_lm: true, use_ntlm2: false },
    Profile { name: "LM", auth_key: "lm", use_nt: 0, use_lm: true, use_ntlm2: false },
];

fn test_request(url: &str) -> GateResult<RequestRecord> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| GateError::Config(format!("detection URL must be http://... : {url}")))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = crate::http::split_host_port(authority, 80);

    let mut headers = HeaderMap::new();
    headers.push("Host", authority.to_string());
    headers.push("Proxy-Connection", "Keep-Alive");
    Ok(RequestRecord {
        method: "GET".to_string(),
        uri: url.to_string(),
        version: "HTTP/1.1".to_string(),
        host,
        port,
        headers,
        body: BodyFraming::None,
    })
}

async fn try_profile(
    ctx: &GateContext,
    creds: &Credentials,
    req: &RequestRecord,
) -> GateResult<ProfileResult> {
    let parent = ctx.selector.get(ctx.selector.try_order()[0]);
    let addrs = parent.addresses().await?;
    let stream = tokio::net::TcpStream::connect(addrs[0])
        .await
        .map_err(|e| GateError::Connect(parent.label(), e))?;
    let mut upstream = HttpStream::upstream(stream);

    let type1 = ntlm::negotiate_message(creds.negotiate_flags(), &creds.domain, &creds.workstation);
    let mut probe = req.clone();
    probe
        .headers
        .set("Proxy-Authorization", &format!("NTLM {}", BASE64.encode(&type1)));
    upstream.write_all(&probe.serialize(&req.uri)).await?;
    upstream.flush().await?;

    let resp = upstream.read_response("GET").await?;
    if resp.status != 407 {
        return Ok(ProfileResult::Open(resp.status));
    }
    let challenge_b64 = resp
        .headers
        .get("Proxy-Authenticate")
        .and_then(|v| v.trim().strip_prefix("NTLM "))
        .map(str::trim)
        .ok_or(GateError::AuthFailed(407))?;
    let challenge = ntlm::parse_challenge(
        &BASE64
            .decode(challenge_b64)
            .map_err(|_| GateError::Protocol("NTLM challenge is not valid base64".into()))?,
    )?;
    drain_body(&mut upstream, resp.body).await?;
    if resp.wants_close() {
        return Err(GateError::UpstreamIo(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "parent closed the connection mid-handshake",
        )));
    }

    let nonce: [u8; 8] = rand::thread_rng().gen();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 / 100)
        .unwrap_or(0);
    let type3 = ntlm::authenticate_message(creds, &challenge, timestamp, nonce)?;
    let mut answer = req.clone();
    answer
        .headers
        .set("Proxy-Authorization", &format!("NTLM {}", BASE64.encode(&type3)));
    upstream.write_all(&answer.serialize(&req.uri)).await?;
    upstream.flush().await?;

    let final_resp = upstream.read_response("GET").await?;
    if final_resp.status == 407 {
        Ok(ProfileResult::Rejected)
    } else {
        Ok(ProfileResult::Accepted(final_resp.status))
    }
}

/// Run all profiles and print the outcome; returns the first working
/// profile's config key, if any.
pub async fn magic_auth_detect(ctx: &GateContext, url: &str) -> GateResult<Option<&'static str>> {
    let req = test_request(url)?;
    let mut best = None;

    println!("Probing NTLM dialects against {url}\n");
    for (i, profile) in PROFILES.iter().enumerate() {
        let mut creds = ctx.creds.clone();
        creds.use_nt = profile.use_nt;
        creds.use_lm = profile.use_lm;
        creds.use_ntlm2 = profile.use_ntlm2;

        print!(
            "Config profile {}/{}: {:8} (flags 0x{:08x})  ",
            i + 1,
            PROFILES.len(),
            profile.name,
            creds.negotiate_flags()
        );
        match try_profile(ctx, &creds, &req).await {
            Ok(ProfileResult::Open(status)) => {
                println!("- no auth required (HTTP {status})");
                if best.is_none() {
                    best = Some(profile.auth_key);
                }
            }
            Ok(ProfileResult::Accepted(status)) => {
                println!("- OK (HTTP {status})");
                if best.is_none() {
                    best = Some(profile.auth_key);
                }
            }
            Ok(ProfileResult::Rejected) => println!("- credentials rejected"),
            Err(e) => {
                println!("- failed: {e}");
                warn!("profile {} probe failed: {e}", profile.name);
            }
        }
    }

    match best {
        Some(auth) => {
            println!("\nWorkable config (most secure first):");
            println!("Auth            {auth}");
        }
        None => println!("\nNo dialect authenticated; check credentials and parent address."),
    }
    Ok(best)
}
