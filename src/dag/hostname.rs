use eater_domainmatcher::DomainPattern;
use tracing::{debug, warn};

use crate::common::DEFAULT_ROUTE_HOSTNAME;

/// Accepts `*`, fully qualified names and names with a single leading `*.` label.
pub fn is_valid_hostname(hostname: &str) -> bool {
    if hostname == DEFAULT_ROUTE_HOSTNAME {
        return true;
    }
    let name = hostname.strip_prefix("*.").unwrap_or(hostname);
    if name.is_empty() || name.len() > 253 || name.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub fn is_wildcard(hostname: &str) -> bool {
    hostname.starts_with("*.")
}

/// Whether `pattern` covers `hostname`. A wildcard pattern matches one or more extra labels
/// in front of its suffix; a wildcard `hostname` is covered only by a wildcard whose suffix
/// contains it.
pub fn matches(pattern: &str, hostname: &str) -> bool {
    if pattern == DEFAULT_ROUTE_HOSTNAME {
        return true;
    }
    let pattern = pattern.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();
    if pattern == hostname {
        return true;
    }
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };
    // A wildcard hostname is covered when its suffix is.
    let candidate = hostname.strip_prefix("*.").unwrap_or(&hostname);
    let glob = format!("**+.{suffix}");
    match DomainPattern::<'_, '.'>::try_from(glob.as_str()) {
        Ok(domain_pattern) => {
            let matched = domain_pattern.matches(candidate);
            debug!("Comparing hostnames {pattern} {hostname} {matched}");
            matched
        },
        Err(_) => {
            warn!("Hostname is not a valid domain {pattern}");
            false
        },
    }
}

/// The hostnames a route hostname resolves to when attached to a listener, or `None` when they
/// do not intersect.
pub fn intersect(listener: Option<&str>, route: &str) -> Option<String> {
    let listener = match listener {
        None | Some("") => return Some(route.to_owned()),
        Some(listener) => listener,
    };
    if route == DEFAULT_ROUTE_HOSTNAME {
        return Some(listener.to_owned());
    }
    if matches(listener, route) {
        Some(route.to_ascii_lowercase())
    } else if matches(route, listener) {
        Some(listener.to_ascii_lowercase())
    } else {
        None
    }
}

/// Larger is more specific: no hostname, then wildcards, then exact names, longer first.
pub fn specificity(hostname: Option<&str>) -> (u8, usize) {
    match hostname {
        None | Some("") => (0, 0),
        Some(hostname) if is_wildcard(hostname) => (1, hostname.len()),
        Some(hostname) => (2, hostname.len()),
    }
}

/// Whether `effective` should be served by the listener with hostname `own` given the other
/// listener hostnames sharing its port. A more specific sibling listener that covers the
/// hostname takes it.
pub fn owned_by_listener(own: Option<&str>, siblings: &[Option<&str>], effective: &str) -> bool {
    let own_specificity = specificity(own);
    !siblings.iter().any(|sibling| {
        specificity(*sibling) > own_specificity && sibling.is_some_and(|sibling| !sibling.is_empty() && matches(sibling, effective))
    })
}
