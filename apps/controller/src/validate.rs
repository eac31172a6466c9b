use std::net::IpAddr;

use url::{Host, Url};

use crate::routes::CreateSessionRequest;

pub const MAX_CODE_URL_LEN: usize = 2048;
pub const MAX_COMMAND_LEN: usize = 1000;
pub const MAX_PROMPT_LEN: usize = 10_000;

/// Substrings that would let a command escape into shell substitution if any
/// layer below ever re-expanded it. The validated string only travels as a
/// container env value, so this is the outer wall, not the only one.
const SUBSTITUTION_PATTERNS: [&str; 5] = ["$(", "`", "${", "<(", ">("];

/// Admission validation. Returns a short machine-readable reason on the
/// first violated constraint.
pub fn validate(
    request: &CreateSessionRequest,
    allowed_code_domains: &[String],
) -> Result<(), &'static str> {
    validate_code_url(&request.code_url, allowed_code_domains)?;

    if let Some(checksum) = request.code_checksum.as_deref() {
        if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("checksum_not_sha256_hex");
        }
    }

    if request.command.trim().is_empty() {
        return Err("command_missing");
    }
    if request.command.len() > MAX_COMMAND_LEN {
        return Err("command_too_long");
    }
    if SUBSTITUTION_PATTERNS
        .iter()
        .any(|pattern| request.command.contains(pattern))
    {
        return Err("command_substitution_pattern");
    }

    if let Some(prompt) = request.prompt.as_deref() {
        if prompt.len() > MAX_PROMPT_LEN {
            return Err("prompt_too_long");
        }
    }

    Ok(())
}

fn validate_code_url(code_url: &str, allowed_domains: &[String]) -> Result<(), &'static str> {
    if code_url.is_empty() {
        return Err("code_url_missing");
    }
    if code_url.len() > MAX_CODE_URL_LEN {
        return Err("code_url_too_long");
    }

    let parsed = Url::parse(code_url).map_err(|_| "code_url_unparseable")?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err("code_url_scheme");
    }

    match parsed.host() {
        None => Err("code_url_no_host"),
        Some(Host::Ipv4(addr)) => reject_non_public(IpAddr::V4(addr)),
        Some(Host::Ipv6(addr)) => reject_non_public(IpAddr::V6(addr)),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err("code_url_private_host");
            }
            if !domain_allowed(&domain, allowed_domains) {
                return Err("code_url_domain_not_allowed");
            }
            Ok(())
        }
    }
}

fn reject_non_public(addr: IpAddr) -> Result<(), &'static str> {
    let private = match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // unique-local fc00::/7 and link-local fe80::/10
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    };
    if private {
        return Err("code_url_private_host");
    }
    // IP-literal hosts can never match the domain allowlist.
    Err("code_url_domain_not_allowed")
}

/// Exact match, or suffix match for `*.` entries.
fn domain_allowed(domain: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        if let Some(suffix) = entry.strip_prefix("*.") {
            domain == suffix || domain.ends_with(&format!(".{suffix}"))
        } else {
            domain == entry
        }
    })
}
