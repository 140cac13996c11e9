use std::path::Path;

use anyhow::{anyhow, Result};

const URL_TRANSPORTS: [&str; 6] = ["https", "http", "ssh", "git", "file", "git+ssh"];

/// Normalizes a git source to one canonical transport form so the same
/// upstream always produces the same lock entry and cache key.
///
/// - `scheme://host/path` keeps its scheme, lowercases scheme and host and
///   drops trailing slashes.
/// - scp-style `user@host:path` becomes `ssh://user@host/path`.
/// - absolute filesystem paths become `file://` URLs.
pub fn normalize_source(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("source must not be empty"));
    }

    if let Some((scheme, rest)) = trimmed.split_once("://") {
        let scheme = scheme.to_ascii_lowercase();
        if !URL_TRANSPORTS.contains(&scheme.as_str()) {
            return Err(anyhow!(
                "unsupported source transport '{scheme}' in '{trimmed}'"
            ));
        }
        let scheme = if scheme == "git+ssh" {
            "ssh".to_string()
        } else {
            scheme
        };

        if scheme == "file" {
            let path = strip_trailing_slashes(rest);
            if path.is_empty() {
                return Err(anyhow!("source '{trimmed}' is missing a path"));
            }
            return Ok(format!("file://{path}"));
        }

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(anyhow!("source '{trimmed}' is missing a host"));
        }
        let authority = lowercase_host(authority);
        let path = strip_trailing_slashes(path);
        return Ok(if path.is_empty() {
            format!("{scheme}://{authority}")
        } else {
            format!("{scheme}://{authority}/{path}")
        });
    }

    if Path::new(trimmed).is_absolute() {
        let path = strip_trailing_slashes(trimmed);
        if path.is_empty() {
            return Err(anyhow!("source '{trimmed}' must not be the filesystem root"));
        }
        return Ok(format!("file://{}", path.replace('\\', "/")));
    }

    if let Some((authority, path)) = trimmed.split_once(':') {
        if !authority.is_empty() && !authority.contains('/') && !path.is_empty() {
            let path = strip_trailing_slashes(path.trim_start_matches('/'));
            return Ok(format!("ssh://{}/{path}", lowercase_host(authority)));
        }
    }

    Err(anyhow!(
        "source '{trimmed}' is not a URL, an scp-style address or an absolute path"
    ))
}

fn strip_trailing_slashes(value: &str) -> &str {
    value.trim_end_matches('/')
}

fn lowercase_host(authority: &str) -> String {
    match authority.rsplit_once('@') {
        Some((user, host)) => format!("{user}@{}", host.to_ascii_lowercase()),
        None => authority.to_ascii_lowercase(),
    }
}
