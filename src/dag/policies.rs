//! Route and virtual host policies, and the precedence rules between the levels they can be
//! set at. A more specific level always wins: route over virtual host over configured
//! defaults.

use std::{collections::BTreeMap, time::Duration};

use thiserror::Error;

use super::{AuthorizationContext, FilterOrder, HeaderPolicy, RetryPolicy, Timeout, TimeoutPolicy};
use crate::{
    apis::httpproxy::{self, AuthorizationPolicy, HeadersPolicy, RateLimitPolicy},
    configuration::HeadersConfiguration,
};

const RATE_LIMIT_UNITS: [&str; 3] = ["second", "minute", "hour"];
const LOAD_BALANCER_STRATEGIES: [&str; 5] = ["RoundRobin", "WeightedLeastRequest", "Random", "Cookie", "RequestHash"];
const REDIRECT_STATUS_CODES: [u16; 5] = [301, 302, 303, 307, 308];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("invalid duration \"{0}\"")]
    InvalidDuration(String),
    #[error("duplicate header \"{0}\"")]
    DuplicateHeader(String),
    #[error("the Host header cannot be set on responses")]
    HostHeaderInResponse,
    #[error("rate limit unit \"{0}\" is not one of second, minute or hour")]
    InvalidRateLimitUnit(String),
    #[error("local rate limit must allow at least one request")]
    ZeroRequests,
    #[error("redirect status code {0} is not supported")]
    InvalidRedirectStatus(u16),
    #[error("direct response status code {0} is not supported")]
    InvalidDirectResponseStatus(u16),
}

/// Parses Go style durations such as `10s`, `1m30s` or `250ms`. `infinity` disables the
/// timeout and an empty string keeps the proxy default.
pub fn parse_timeout(value: &str) -> Result<Timeout, PolicyError> {
    let value = value.trim();
    match value {
        "" => return Ok(Timeout::Default),
        "infinity" | "infinite" => return Ok(Timeout::Infinite),
        _ => {},
    }
    let invalid = || PolicyError::InvalidDuration(value.to_owned());
    let mut total = Duration::ZERO;
    let mut rest = value;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(invalid)?;
        let (number, tail) = rest.split_at(number_end);
        let number: f64 = number.parse().map_err(|_| invalid())?;
        let unit_end = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let seconds = match unit {
            "ns" => number / 1e9,
            "us" | "µs" => number / 1e6,
            "ms" => number / 1e3,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return Err(invalid()),
        };
        total += Duration::try_from_secs_f64(seconds).map_err(|_| invalid())?;
        rest = tail;
    }
    Ok(Timeout::Duration(total))
}

pub fn timeout_policy(policy: &httpproxy::TimeoutPolicy) -> Result<TimeoutPolicy, PolicyError> {
    Ok(TimeoutPolicy {
        response: parse_timeout(policy.response.as_deref().unwrap_or_default())?,
        idle: parse_timeout(policy.idle.as_deref().unwrap_or_default())?,
    })
}

pub fn retry_policy(policy: &httpproxy::RetryPolicy) -> Result<RetryPolicy, PolicyError> {
    Ok(RetryPolicy {
        count: policy.count.unwrap_or(1),
        per_try_timeout: parse_timeout(policy.per_try_timeout.as_deref().unwrap_or_default())?,
        retry_on: policy.retry_on.clone(),
        retriable_status_codes: policy.retriable_status_codes.clone(),
    })
}

pub fn header_policy(policy: &HeadersPolicy, response: bool) -> Result<HeaderPolicy, PolicyError> {
    let mut set = BTreeMap::new();
    for header in &policy.set {
        let name = header.name.to_lowercase();
        if response && name == "host" {
            return Err(PolicyError::HostHeaderInResponse);
        }
        if set.insert(name.clone(), header.value.clone()).is_some() {
            return Err(PolicyError::DuplicateHeader(name));
        }
    }
    Ok(HeaderPolicy {
        set,
        add: BTreeMap::new(),
        remove: policy.remove.iter().map(|name| name.to_lowercase()).collect(),
    })
}

pub fn default_headers(defaults: &HeadersConfiguration) -> HeaderPolicy {
    HeaderPolicy {
        set: defaults.set.iter().map(|(name, value)| (name.to_lowercase(), value.clone())).collect(),
        add: BTreeMap::new(),
        remove: defaults.remove.iter().map(|name| name.to_lowercase()).collect(),
    }
}

/// Layers header policies, most specific first. A header set or removed at a more specific
/// level shadows whatever a less specific level does with it.
pub fn merge_headers(levels: &[&HeaderPolicy]) -> HeaderPolicy {
    let mut merged = HeaderPolicy::default();
    for level in levels.iter().rev() {
        for (name, value) in &level.set {
            merged.remove.retain(|removed| removed != name);
            merged.add.remove(name);
            merged.set.insert(name.clone(), value.clone());
        }
        for (name, value) in &level.add {
            merged.add.insert(name.clone(), value.clone());
        }
        for name in &level.remove {
            merged.set.remove(name);
            merged.add.remove(name);
            if !merged.remove.contains(name) {
                merged.remove.push(name.clone());
            }
        }
    }
    merged.remove.sort();
    merged
}

pub fn validate_rate_limit(policy: &RateLimitPolicy) -> Result<(), PolicyError> {
    if let Some(local) = &policy.local {
        if local.requests == 0 {
            return Err(PolicyError::ZeroRequests);
        }
        if !RATE_LIMIT_UNITS.contains(&local.unit.as_str()) {
            return Err(PolicyError::InvalidRateLimitUnit(local.unit.clone()));
        }
    }
    Ok(())
}

/// The rate limits that apply to one route. A route local limit replaces the virtual host
/// one, and a route that disables the global limit opts out of the virtual host descriptors.
pub fn effective_rate_limit(vhost: Option<&RateLimitPolicy>, route: Option<&RateLimitPolicy>) -> Option<RateLimitPolicy> {
    let route_global_disabled = route.and_then(|r| r.global.as_ref()).and_then(|g| g.disabled).unwrap_or_default();
    let local = route.and_then(|r| r.local.clone()).or_else(|| vhost.and_then(|v| v.local.clone()));
    let global = if route_global_disabled {
        None
    } else {
        route.and_then(|r| r.global.clone()).or_else(|| vhost.and_then(|v| v.global.clone()))
    };
    if local.is_none() && global.is_none() {
        None
    } else {
        Some(RateLimitPolicy { local, global })
    }
}

/// Route authorization settings layered over the virtual host ones. The route decides
/// whether checks are disabled; context entries merge with route values winning.
pub fn authorization_context(vhost: Option<&AuthorizationPolicy>, route: Option<&AuthorizationPolicy>) -> AuthorizationContext {
    let disabled = route
        .and_then(|r| r.disabled)
        .or_else(|| vhost.and_then(|v| v.disabled))
        .unwrap_or_default();
    let mut context = vhost.map(|v| v.context.clone()).unwrap_or_default();
    if let Some(route) = route {
        context.extend(route.context.clone());
    }
    AuthorizationContext { disabled, context }
}

pub fn filter_order(auth_before_rate_limit: bool) -> FilterOrder {
    if auth_before_rate_limit {
        FilterOrder::AuthorizationThenRateLimit
    } else {
        FilterOrder::RateLimitThenAuthorization
    }
}

/// Unknown strategies fall back to the proxy default.
pub fn load_balancer_strategy(policy: Option<&httpproxy::LoadBalancerPolicy>) -> Option<String> {
    policy
        .and_then(|policy| policy.strategy.as_deref())
        .filter(|strategy| LOAD_BALANCER_STRATEGIES.contains(strategy))
        .map(str::to_owned)
}

pub fn redirect_status(code: Option<u16>) -> Result<u16, PolicyError> {
    match code {
        None => Ok(302),
        Some(code) if REDIRECT_STATUS_CODES.contains(&code) => Ok(code),
        Some(code) => Err(PolicyError::InvalidRedirectStatus(code)),
    }
}

pub fn direct_response_status(code: u16) -> Result<u16, PolicyError> {
    if (200..=599).contains(&code) {
        Ok(code)
    } else {
        Err(PolicyError::InvalidDirectResponseStatus(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::httpproxy::{GlobalRateLimitPolicy, HeaderValue, LocalRateLimitPolicy};

    #[test]
    fn go_durations() {
        assert_eq!(parse_timeout("10s"), Ok(Timeout::Duration(Duration::from_secs(10))));
        assert_eq!(parse_timeout("1m30s"), Ok(Timeout::Duration(Duration::from_secs(90))));
        assert_eq!(parse_timeout("250ms"), Ok(Timeout::Duration(Duration::from_millis(250))));
        assert_eq!(parse_timeout("1.5h"), Ok(Timeout::Duration(Duration::from_secs(5400))));
        assert_eq!(parse_timeout("infinity"), Ok(Timeout::Infinite));
        assert_eq!(parse_timeout(""), Ok(Timeout::Default));
        assert!(parse_timeout("10").is_err());
        assert!(parse_timeout("ten seconds").is_err());
    }

    #[test]
    fn route_headers_shadow_defaults() {
        let defaults = default_headers(&HeadersConfiguration {
            set: [("X-Env".to_owned(), "prod".to_owned()), ("X-Team".to_owned(), "core".to_owned())].into(),
            remove: vec!["x-debug".to_owned()],
        });
        let route = header_policy(
            &HeadersPolicy {
                set: vec![
                    HeaderValue {
                        name: "x-env".to_owned(),
                        value: "staging".to_owned(),
                    },
                    HeaderValue {
                        name: "x-debug".to_owned(),
                        value: "1".to_owned(),
                    },
                ],
                remove: vec!["X-Team".to_owned()],
            },
            false,
        )
        .unwrap();
        let merged = merge_headers(&[&route, &defaults]);
        assert_eq!(merged.set.get("x-env").map(String::as_str), Some("staging"));
        assert_eq!(merged.set.get("x-debug").map(String::as_str), Some("1"));
        assert!(!merged.set.contains_key("x-team"));
        assert_eq!(merged.remove, vec!["x-team".to_owned()]);
    }

    #[test]
    fn host_header_only_on_requests() {
        let policy = HeadersPolicy {
            set: vec![HeaderValue {
                name: "Host".to_owned(),
                value: "internal".to_owned(),
            }],
            remove: vec![],
        };
        assert!(header_policy(&policy, false).is_ok());
        assert_eq!(header_policy(&policy, true), Err(PolicyError::HostHeaderInResponse));
    }

    #[test]
    fn route_disables_global_rate_limit() {
        let vhost = RateLimitPolicy {
            local: Some(LocalRateLimitPolicy {
                requests: 100,
                unit: "minute".to_owned(),
                burst: None,
            }),
            global: Some(GlobalRateLimitPolicy::default()),
        };
        let route = RateLimitPolicy {
            local: None,
            global: Some(GlobalRateLimitPolicy {
                disabled: Some(true),
                descriptors: vec![],
            }),
        };
        let effective = effective_rate_limit(Some(&vhost), Some(&route)).unwrap();
        assert!(effective.global.is_none());
        assert_eq!(effective.local.map(|l| l.requests), Some(100));
        assert_eq!(effective_rate_limit(None, None), None);
        assert_eq!(validate_rate_limit(&vhost), Ok(()));
    }

    #[test]
    fn route_authorization_wins() {
        let vhost = AuthorizationPolicy {
            disabled: Some(true),
            context: [("tier".to_owned(), "gold".to_owned()), ("team".to_owned(), "a".to_owned())].into(),
        };
        let route = AuthorizationPolicy {
            disabled: Some(false),
            context: [("team".to_owned(), "b".to_owned())].into(),
        };
        let context = authorization_context(Some(&vhost), Some(&route));
        assert!(!context.disabled);
        assert_eq!(context.context.get("team").map(String::as_str), Some("b"));
        assert_eq!(context.context.get("tier").map(String::as_str), Some("gold"));
        assert!(authorization_context(Some(&vhost), None).disabled);
        assert_eq!(filter_order(false), FilterOrder::RateLimitThenAuthorization);
    }
}
