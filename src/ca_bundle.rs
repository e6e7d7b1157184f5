//! Root CA bundle assembly for the Runner-API client's TLS stack: start from
//! the platform's native trust store (handled by `reqwest`'s default
//! behavior), then fold in every `*.pem`/`*.crt` file under an optional
//! extra directory such as a cluster-injected ConfigMap mount.

use anyhow::{Context, Result};
use reqwest::Certificate;
use tracing::warn;

/// Load every `*.pem`/`*.crt` file directly under `dir` as an additional
/// trusted root. An unreadable file is logged and skipped; a file that
/// parses but contains no valid PEM block aborts startup, since that
/// indicates the mount is present but misconfigured.
pub fn load_extra_certs(dir: &str) -> Result<Vec<Certificate>> {
    let mut certs = Vec::new();
    let entries = std::fs::read_dir(dir).with_context(|| format!("read CA bundle directory {dir}"))?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(dir, error = %e, "failed to read directory entry, skipping");
                continue;
            }
        };
        let path = entry.path();
        let is_cert_file = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("pem") || ext.eq_ignore_ascii_case("crt"))
            .unwrap_or(false);
        if !is_cert_file {
            continue;
        }

        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read CA bundle file, skipping");
                continue;
            }
        };

        let cert = Certificate::from_pem(&bytes)
            .with_context(|| format!("parse PEM certificate {}", path.display()))?;
        certs.push(cert);
    }

    Ok(certs)
}
