//! Parser for `vless://` endpoint links.
//!
//! Grammar: `vless://identity@host:port?query#label` where the query is
//! `&`-joined `key=value` pairs. The `#label` fragment is mandatory: links
//! without it are rejected rather than defaulted, matching the upstream
//! subscription format. Parsing is deterministic and does no I/O.

use std::collections::HashMap;

use tunnelrank_core::{EndpointDescriptor, RankError, Result, Security, Transport};

const SCHEME: &str = "vless://";

/// Parse one endpoint link into a validated descriptor.
///
/// Fails with [`RankError::MalformedUri`] on an unsupported scheme, a missing
/// `identity@host` separator, a missing or non-numeric port, or a missing
/// query/label structure.
pub fn parse(uri: &str) -> Result<EndpointDescriptor> {
    let rest = uri
        .strip_prefix(SCHEME)
        .ok_or_else(|| malformed(uri, "unsupported scheme"))?;

    let (user_id, host_info) = rest
        .split_once('@')
        .ok_or_else(|| malformed(uri, "missing identity separator"))?;
    if user_id.is_empty() || host_info.is_empty() {
        return Err(malformed(uri, "empty identity or host section"));
    }

    let (host_part, query_and_label) = match host_info.split_once('?') {
        Some((h, q)) => (h, q),
        None => (host_info, ""),
    };

    // The fragment separator must occur exactly once after the query; the
    // label is mandatory even when empty.
    let fragments: Vec<&str> = query_and_label.split('#').collect();
    let (query, label) = match fragments.as_slice() {
        [query, label] => (*query, *label),
        _ => return Err(malformed(uri, "missing label fragment")),
    };

    let (host, port_token) = host_part
        .split_once(':')
        .ok_or_else(|| malformed(uri, "host must include a port"))?;
    if host.is_empty() {
        return Err(malformed(uri, "empty host"));
    }
    let port: u16 = port_token
        .trim_end_matches('/')
        .parse()
        .map_err(|_| malformed(uri, "port is not numeric"))?;
    if port == 0 {
        return Err(malformed(uri, "port out of range"));
    }

    // Tokens without a '=' are dropped, not repaired; later duplicates win.
    let mut params: HashMap<&str, &str> = HashMap::new();
    for token in query.split('&') {
        if let Some((key, value)) = token.split_once('=') {
            params.insert(key, value);
        }
    }

    let get = |key: &str| params.get(key).map(|v| v.to_string());

    Ok(EndpointDescriptor {
        user_id: user_id.to_string(),
        host: host.to_string(),
        port,
        transport: params
            .get("type")
            .map(|v| Transport::parse(v))
            .unwrap_or(Transport::Tcp),
        security: params
            .get("security")
            .map(|v| Security::parse(v))
            .unwrap_or(Security::None),
        flow: get("flow"),
        encryption: get("encryption").unwrap_or_else(|| "none".to_string()),
        sni: get("sni"),
        alpn: params
            .get("alpn")
            .map(|v| v.split(',').map(str::to_string).collect()),
        host_header: get("host"),
        path: get("path"),
        label: label.to_string(),
    })
}

/// Parse a batch, keeping the failures alongside the offending input.
pub fn parse_all(uris: &[String]) -> (Vec<EndpointDescriptor>, Vec<(String, RankError)>) {
    let mut parsed = Vec::new();
    let mut failed = Vec::new();
    for uri in uris {
        match parse(uri) {
            Ok(descriptor) => parsed.push(descriptor),
            Err(e) => failed.push((uri.clone(), e)),
        }
    }
    (parsed, failed)
}

fn malformed(uri: &str, reason: &str) -> RankError {
    RankError::MalformedUri(format!("{reason}: {uri}"))
}
