use std::{collections::BTreeSet, fmt::Display};

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    chrono::Utc,
};
use serde::Serialize;

pub mod reason {
    pub const ACCEPTED: &str = "Accepted";
    pub const VALID: &str = "Valid";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const PROGRAMMED: &str = "Programmed";
    pub const INVALID: &str = "Invalid";
    pub const NO_CONFLICTS: &str = "NoConflicts";

    pub const ORPHANED: &str = "Orphaned";
    pub const DUPLICATE_VHOST: &str = "DuplicateVhost";
    pub const DUPLICATE_MATCH_CONDITIONS: &str = "DuplicateMatchConditions";
    pub const INCLUDE_NOT_FOUND: &str = "IncludeNotFound";
    pub const INCLUDE_CREATES_CYCLE: &str = "IncludeCreatesCycle";
    pub const ROOT_INCLUDES_ROOT: &str = "RootIncludesRoot";
    pub const MATCH_CONDITIONS_NOT_VALID: &str = "MatchConditionsNotValid";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const SECRET_INVALID: &str = "SecretInvalid";
    pub const DELEGATION_NOT_PERMITTED: &str = "DelegationNotPermitted";
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    pub const REGEX_TOO_LARGE: &str = "RegexTooLarge";
    pub const TLS_CONFIG_NOT_VALID: &str = "TLSConfigNotValid";
    pub const TCP_PROXY_NOT_VALID: &str = "TCPProxyNotValid";
    pub const ROUTE_NOT_VALID: &str = "RouteNotValid";
    pub const POLICY_NOT_VALID: &str = "PolicyNotValid";
    pub const AUTH_NOT_PERMITTED: &str = "AuthNotPermitted";
    pub const FQDN_NOT_VALID: &str = "FQDNNotValid";

    pub const ROUTE_CONFLICT: &str = "RouteConflict";
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
    pub const REF_NOT_PERMITTED: &str = "RefNotPermitted";
    pub const INVALID_KIND: &str = "InvalidKind";
    pub const UNSUPPORTED_VALUE: &str = "UnsupportedValue";
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    pub const NO_MATCHING_LISTENER_HOSTNAME: &str = "NoMatchingListenerHostname";
    pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";

    pub const UNSUPPORTED_PROTOCOL: &str = "UnsupportedProtocol";
    pub const UNSUPPORTED_TLS_MODE: &str = "UnsupportedTLSMode";
    pub const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
    pub const INVALID_ROUTE_KINDS: &str = "InvalidRouteKinds";
    pub const HOSTNAME_CONFLICT: &str = "HostnameConflict";
    pub const PROTOCOL_CONFLICT: &str = "ProtocolConflict";
    pub const LISTENERS_NOT_VALID: &str = "ListenersNotValid";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ConditionType {
    Accepted,
    ResolvedRefs,
    PartiallyInvalid,
    Programmed,
    Conflicted,
}

impl Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Failure classes an input object can produce. None of them abort a build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ErrorKind {
    MalformedReference,
    InvalidShape,
    Conflict,
    Unreachable,
}

/// Whether a problem takes the whole object out of the graph or only one of its fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Object,
    Fragment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConditionEntry {
    pub type_: ConditionType,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

impl ConditionEntry {
    pub fn to_condition(&self, observed_generation: Option<i64>) -> Condition {
        Condition {
            last_transition_time: Time(Utc::now()),
            message: self.message.clone(),
            observed_generation,
            reason: self.reason.clone(),
            status: if self.status { "True".to_owned() } else { "False".to_owned() },
            type_: self.type_.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
struct Problem {
    reason: String,
    message: String,
}

/// Problems recorded against one object (or one route parent, or one gateway listener)
/// during a build. Problems are kept sorted so the rendered conditions do not depend on the
/// order processors discovered them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConditionSet {
    rejected: BTreeSet<Problem>,
    unresolved: BTreeSet<Problem>,
    partial: BTreeSet<Problem>,
    conflicted: BTreeSet<Problem>,
}

impl ConditionSet {
    pub fn record(&mut self, kind: ErrorKind, scope: Scope, reason: &str, message: impl Into<String>) {
        let problem = Problem {
            reason: reason.to_owned(),
            message: message.into(),
        };
        if kind == ErrorKind::MalformedReference {
            self.unresolved.insert(problem.clone());
        }
        match scope {
            Scope::Object => self.rejected.insert(problem),
            Scope::Fragment => self.partial.insert(problem),
        };
    }

    /// Marks a listener-style conflict, which is reported through `Conflicted` rather than
    /// `Accepted`.
    pub fn conflict(&mut self, reason: &str, message: impl Into<String>) {
        self.conflicted.insert(Problem {
            reason: reason.to_owned(),
            message: message.into(),
        });
    }

    pub fn is_rejected(&self) -> bool {
        !self.rejected.is_empty()
    }

    pub fn is_conflicted(&self) -> bool {
        !self.conflicted.is_empty()
    }

    pub fn is_unresolved(&self) -> bool {
        !self.unresolved.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.unresolved.is_empty() && self.partial.is_empty() && self.conflicted.is_empty()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.rejected
            .iter()
            .chain(&self.unresolved)
            .chain(&self.partial)
            .chain(&self.conflicted)
            .any(|problem| problem.reason == reason)
    }

    pub fn merge(&mut self, other: &ConditionSet) {
        self.rejected.extend(other.rejected.iter().cloned());
        self.unresolved.extend(other.unresolved.iter().cloned());
        self.partial.extend(other.partial.iter().cloned());
        self.conflicted.extend(other.conflicted.iter().cloned());
    }

    pub fn accepted(&self, ok_reason: &str) -> ConditionEntry {
        entry(ConditionType::Accepted, &self.rejected, ok_reason, false)
    }

    pub fn resolved_refs(&self) -> ConditionEntry {
        entry(ConditionType::ResolvedRefs, &self.unresolved, reason::RESOLVED_REFS, false)
    }

    pub fn partially_invalid(&self) -> ConditionEntry {
        entry(ConditionType::PartiallyInvalid, &self.partial, reason::VALID, true)
    }

    pub fn programmed(&self) -> ConditionEntry {
        let mut blocking = self.rejected.clone();
        blocking.extend(self.unresolved.iter().cloned());
        blocking.extend(self.conflicted.iter().cloned());
        let mut programmed = entry(ConditionType::Programmed, &blocking, reason::PROGRAMMED, false);
        if !programmed.status {
            programmed.reason = reason::INVALID.to_owned();
        }
        programmed
    }

    pub fn conflicted(&self) -> ConditionEntry {
        entry(ConditionType::Conflicted, &self.conflicted, reason::NO_CONFLICTS, true)
    }

    /// Accepted, ResolvedRefs and PartiallyInvalid, the set every routing object carries.
    pub fn standard(&self, ok_reason: &str) -> Vec<ConditionEntry> {
        vec![self.accepted(ok_reason), self.resolved_refs(), self.partially_invalid()]
    }

    pub fn description(&self) -> String {
        let all = self.rejected.iter().chain(&self.unresolved).chain(&self.partial).chain(&self.conflicted);
        join_messages(all)
    }
}

fn join_messages<'a>(problems: impl Iterator<Item = &'a Problem>) -> String {
    let messages: BTreeSet<&str> = problems.map(|p| p.message.as_str()).collect();
    messages.into_iter().collect::<Vec<_>>().join("; ")
}

fn entry(type_: ConditionType, problems: &BTreeSet<Problem>, ok_reason: &str, problem_status: bool) -> ConditionEntry {
    match problems.first() {
        None => ConditionEntry {
            type_,
            status: !problem_status,
            reason: ok_reason.to_owned(),
            message: String::new(),
        },
        Some(first) => ConditionEntry {
            type_,
            status: problem_status,
            reason: first.reason.clone(),
            message: join_messages(problems.iter()),
        },
    }
}
