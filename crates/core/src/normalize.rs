use mima_protocol::CanonicalKey;

const MAX_PASSES: usize = 8;

/// Canonical lookup key for an account on a site.
///
/// Total and deterministic: any input, including empty strings, produces a
/// key, and `normalize` applied to its own output is a no-op.
#[must_use]
pub fn normalize(domain: &str, username: &str) -> CanonicalKey {
    CanonicalKey::from_normalized(normalize_domain(domain), normalize_username(username))
}

/// Lowercased host without scheme, credentials, port, path, trailing dots or
/// a leading `www.` label.
#[must_use]
pub fn normalize_domain(raw: &str) -> String {
    let mut current = domain_pass(raw);
    for _ in 0..MAX_PASSES {
        let next = domain_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn domain_pass(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let without_scheme = lowered
        .split_once("://")
        .map_or(lowered.as_str(), |(_, rest)| rest);
    let authority = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let host = match host_port.strip_prefix('[') {
        // IPv6 literal keeps its brackets; anything after `]` is a port.
        Some(rest) => rest
            .find(']')
            .map_or(host_port, |end| &host_port[..end + 2]),
        None => host_port.split(':').next().unwrap_or_default(),
    };

    let mut host = host.trim().trim_end_matches('.');
    while let Some(rest) = host.strip_prefix("www.") {
        if !rest.contains('.') {
            break;
        }
        host = rest;
    }
    host.to_string()
}

/// Trimmed of surrounding whitespace and lowercased.
#[must_use]
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase().trim().to_string()
}
