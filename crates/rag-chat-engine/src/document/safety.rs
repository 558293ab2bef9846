use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnetwork::IpNetwork;
use once_cell::sync::Lazy;
use reqwest::Url;
use tokio::net::lookup_host;

use crate::utils::error::EngineError;

/// Private, reserved, loopback and link-local ranges. Any URL resolving
/// into one of these is refused before a single byte is fetched.
static DENIED_NETWORKS: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "::/128",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .map(|cidr| cidr.parse().expect("static CIDR list is well-formed"))
    .collect()
});

fn is_denied(ip: IpAddr) -> bool {
    // IPv4-mapped IPv6 addresses are checked as their embedded v4 form.
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    DENIED_NETWORKS.iter().any(|net| net.contains(ip))
}

/// Validate that a URL is safe to fetch: http(s) scheme only, and every
/// address its hostname resolves to is outside the denylist.
pub async fn validate_url(raw: &str) -> Result<Url, EngineError> {
    let url: Url = raw
        .parse()
        .map_err(|e| EngineError::SsrfViolation(format!("invalid URL {raw}: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(EngineError::SsrfViolation(format!(
                "unsupported URL scheme '{other}' in {raw}"
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| EngineError::SsrfViolation(format!("no hostname in URL {raw}")))?;
    let port = url.port_or_known_default().unwrap_or(80);

    // IPv6 literals carry brackets in the serialized host.
    let host = host.trim_start_matches('[').trim_end_matches(']');

    // IP literals are checked directly; hostnames go through DNS and
    // every resolved address must pass.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_denied(ip) {
            return Err(EngineError::SsrfViolation(format!(
                "URL {raw} targets private/reserved address {ip}"
            )));
        }
        return Ok(url);
    }

    let resolved = lookup_host((host, port))
        .await
        .map_err(|e| EngineError::SsrfViolation(format!("DNS resolution failed for {host}: {e}")))?;

    let mut any = false;
    for addr in resolved {
        any = true;
        if is_denied(addr.ip()) {
            return Err(EngineError::SsrfViolation(format!(
                "URL {raw} resolves to private/reserved address {}",
                addr.ip()
            )));
        }
    }

    if !any {
        return Err(EngineError::SsrfViolation(format!(
            "hostname {host} resolved to no addresses"
        )));
    }

    Ok(url)
}

/// Resolve a file path and verify it stays inside the operator-configured
/// base directory. An empty base disables the guard.
pub fn validate_file_path(source_uri: &str, allowed_base_dir: &str) -> Result<PathBuf, EngineError> {
    let path = Path::new(source_uri)
        .canonicalize()
        .map_err(|e| EngineError::Ingestion(format!("cannot resolve {source_uri}: {e}")))?;

    if !allowed_base_dir.is_empty() {
        let base = Path::new(allowed_base_dir).canonicalize().map_err(|e| {
            EngineError::Configuration(format!(
                "cannot resolve allowed base directory {allowed_base_dir}: {e}"
            ))
        })?;

        if !path.starts_with(&base) {
            return Err(EngineError::PathTraversal(format!(
                "{} is outside {}",
                path.display(),
                base.display()
            )));
        }
    }

    Ok(path)
}
