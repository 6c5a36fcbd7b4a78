//! Subscription source retrieval: each source is an HTTP(S) URL whose body
//! is base64-encoded UTF-8 text, one endpoint link per line. A broken
//! source is isolated to that source; the batch carries on.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use reqwest::Client;
use tracing::{debug, warn};
use tunnelrank_core::{RankError, Result};

/// Fetch one source and decode its body into endpoint link lines.
pub async fn fetch_lines(client: &Client, url: &str) -> Result<Vec<String>> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(url, &e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(fetch_err(url, &format!("status {status}")));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| fetch_err(url, &e.to_string()))?;

    let lines = decode_lines(&body).map_err(|reason| fetch_err(url, &reason))?;
    debug!(url, count = lines.len(), "decoded subscription source");
    Ok(lines)
}

/// Fetch every source, collecting lines from the good ones and the failure
/// for each bad one. Never errors as a whole; the caller decides whether an
/// empty result is fatal.
pub async fn fetch_all(
    client: &Client,
    urls: &[String],
) -> (Vec<String>, Vec<(String, RankError)>) {
    let mut lines = Vec::new();
    let mut failures = Vec::new();
    for url in urls {
        match fetch_lines(client, url).await {
            Ok(mut batch) => lines.append(&mut batch),
            Err(e) => {
                warn!(url = url.as_str(), error = %e, "subscription source failed");
                failures.push((url.clone(), e));
            }
        }
    }
    (lines, failures)
}

/// Decode a base64 body into trimmed, non-empty lines.
///
/// Subscription files in the wild are often unpadded, so the strict decode
/// falls back to the no-pad alphabet before giving up.
fn decode_lines(body: &[u8]) -> std::result::Result<Vec<String>, String> {
    let compact: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    let decoded = STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
        .map_err(|e| format!("invalid base64: {e}"))?;

    let text = String::from_utf8(decoded).map_err(|e| format!("invalid utf-8: {e}"))?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

fn fetch_err(url: &str, reason: &str) -> RankError {
    RankError::Fetch {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}
