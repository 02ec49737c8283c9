use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde::Serialize;
use thiserror::Error;

use crate::apis::httpproxy::{HeaderMatchCondition, MatchCondition, QueryParameterMatchCondition};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("more than one path match condition")]
    MultiplePathConditions,
    #[error("prefix condition \"{0}\" must start with /")]
    PrefixNotAbsolute(String),
    #[error("exact condition \"{0}\" must start with /")]
    ExactNotAbsolute(String),
    #[error("exact path \"{0}\" cannot be extended by further path conditions")]
    ExactNotExtendable(String),
    #[error("regex path \"{0}\" cannot be extended by further path conditions")]
    RegexNotExtendable(String),
    #[error("header condition on \"{0}\" must specify exactly one match kind")]
    HeaderMatchKind(String),
    #[error("query parameter condition on \"{0}\" must specify exactly one match kind")]
    QueryMatchKind(String),
    #[error("treatMissingAsEmpty on header \"{0}\" is only valid with negative matches")]
    TreatMissingOnPositive(String),
    #[error("ignoreCase is not supported with {1} match on \"{0}\"")]
    IgnoreCaseNotSupported(String, &'static str),
    #[error("invalid regex \"{pattern}\": {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("regex \"{pattern}\" exceeds the maximum program size of {limit}")]
    RegexTooLarge { pattern: String, limit: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PrefixKind {
    /// `/foo` matches `/foo` and `/foo/bar`, never `/foobar`.
    Segment,
    /// Raw string prefix, `/foo` also matches `/foobar`.
    String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum PathMatch {
    Exact(String),
    Prefix { value: String, kind: PrefixKind },
    Regex(String),
}

impl PathMatch {
    pub fn root() -> Self {
        Self::segment("/")
    }

    pub fn segment(value: &str) -> Self {
        Self::Prefix {
            value: value.to_owned(),
            kind: PrefixKind::Segment,
        }
    }

    pub fn string_prefix(value: &str) -> Self {
        Self::Prefix {
            value: value.to_owned(),
            kind: PrefixKind::String,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Exact(value) | Self::Regex(value) | Self::Prefix { value, .. } => value,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(value) => path == value,
            Self::Prefix { value, kind: PrefixKind::String } => path.starts_with(value.as_str()),
            Self::Prefix { value, kind: PrefixKind::Segment } => {
                if value.ends_with('/') {
                    return path.starts_with(value.as_str());
                }
                path == value || path.strip_prefix(value.as_str()).is_some_and(|rest| rest.starts_with('/'))
            },
            Self::Regex(pattern) => full_match(pattern, path, false),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(String),
    Present,
}

impl StringMatch {
    pub fn matches(&self, value: &str, ignore_case: bool) -> bool {
        let fold = |s: &str| if ignore_case { s.to_lowercase() } else { s.to_owned() };
        match self {
            Self::Exact(expected) => fold(value) == fold(expected),
            Self::Prefix(expected) => fold(value).starts_with(&fold(expected)),
            Self::Suffix(expected) => fold(value).ends_with(&fold(expected)),
            Self::Contains(expected) => fold(value).contains(&fold(expected)),
            Self::Regex(pattern) => full_match(pattern, value, ignore_case),
            Self::Present => true,
        }
    }

    fn regex(&self) -> Option<&str> {
        match self {
            Self::Regex(pattern) => Some(pattern),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HeaderMatch {
    pub name: String,
    pub matcher: StringMatch,
    pub invert: bool,
    pub ignore_case: bool,
    pub treat_missing_as_empty: bool,
}

impl HeaderMatch {
    pub fn exact(name: &str, value: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            matcher: StringMatch::Exact(value.to_owned()),
            invert: false,
            ignore_case: false,
            treat_missing_as_empty: false,
        }
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        match value {
            Some(value) => self.matcher.matches(value, self.ignore_case) != self.invert,
            None if self.treat_missing_as_empty => self.matcher.matches("", self.ignore_case) != self.invert,
            None => self.invert && self.matcher == StringMatch::Present,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QueryMatch {
    pub name: String,
    pub matcher: StringMatch,
    pub ignore_case: bool,
}

impl QueryMatch {
    pub fn matches(&self, value: Option<&str>) -> bool {
        value.is_some_and(|value| self.matcher.matches(value, self.ignore_case))
    }
}

/// The full predicate of one route.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RouteMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub queries: Vec<QueryMatch>,
    pub method: Option<String>,
}

impl Default for RouteMatch {
    fn default() -> Self {
        Self {
            path: PathMatch::root(),
            headers: vec![],
            queries: vec![],
            method: None,
        }
    }
}

impl RouteMatch {
    pub fn with_path(path: PathMatch) -> Self {
        Self { path, ..Default::default() }
    }

    /// Order-insensitive identity used to detect two routes with the same effective match.
    /// Prefixes ending in `/` match the same paths whatever their kind.
    pub fn identity(&self) -> RouteMatch {
        let mut identity = self.clone();
        if let PathMatch::Prefix { value, kind } = &mut identity.path {
            if value.ends_with('/') {
                *kind = PrefixKind::Segment;
            }
        }
        identity.headers.sort();
        identity.headers.dedup();
        identity.queries.sort();
        identity.queries.dedup();
        identity
    }

    pub fn matches(&self, method: &str, path: &str, headers: &BTreeMap<String, String>, query: &BTreeMap<String, String>) -> bool {
        let path_only = path.split_once('?').map_or(path, |(path, _)| path);
        self.path.matches(path_only)
            && self.method.as_deref().is_none_or(|expected| expected.eq_ignore_ascii_case(method))
            && self.headers.iter().all(|header| header.matches(headers.get(&header.name).map(String::as_str)))
            && self.queries.iter().all(|param| param.matches(query.get(&param.name).map(String::as_str)))
    }

    fn regexes(&self) -> impl Iterator<Item = &str> {
        let path = match &self.path {
            PathMatch::Regex(pattern) => Some(pattern.as_str()),
            _ => None,
        };
        path.into_iter()
            .chain(self.headers.iter().filter_map(|h| h.matcher.regex()))
            .chain(self.queries.iter().filter_map(|q| q.matcher.regex()))
    }
}

fn full_match(pattern: &str, value: &str, ignore_case: bool) -> bool {
    RegexBuilder::new(&format!("^(?:{pattern})$"))
        .case_insensitive(ignore_case)
        .build()
        .is_ok_and(|regex| regex.is_match(value))
}

/// Appends `child` to the prefix `parent` on a segment boundary.
pub fn join_prefix(parent: &str, child: &str) -> String {
    let child = child.trim_start_matches('/');
    if child.is_empty() {
        return if parent.is_empty() { "/".to_owned() } else { parent.to_owned() };
    }
    format!("{}/{child}", parent.trim_end_matches('/'))
}

enum PathCondition<'a> {
    Prefix(&'a str),
    Exact(&'a str),
    Regex(&'a str),
}

fn path_condition(conditions: &[MatchCondition]) -> Result<Option<PathCondition<'_>>, MatchError> {
    let mut found = None;
    for condition in conditions {
        let candidates = [
            condition.prefix.as_deref().map(PathCondition::Prefix),
            condition.exact.as_deref().map(PathCondition::Exact),
            condition.regex.as_deref().map(PathCondition::Regex),
        ];
        for candidate in candidates.into_iter().flatten() {
            if found.is_some() {
                return Err(MatchError::MultiplePathConditions);
            }
            found = Some(candidate);
        }
    }
    Ok(found)
}

/// Extends an inherited match with a block of HTTPProxy conditions.
pub fn merge_conditions(parent: &RouteMatch, conditions: &[MatchCondition]) -> Result<RouteMatch, MatchError> {
    let path = match (path_condition(conditions)?, &parent.path) {
        (None, path) => path.clone(),
        (Some(_), PathMatch::Exact(exact)) => return Err(MatchError::ExactNotExtendable(exact.clone())),
        (Some(_), PathMatch::Regex(regex)) => return Err(MatchError::RegexNotExtendable(regex.clone())),
        (Some(PathCondition::Prefix(prefix)), PathMatch::Prefix { value, kind }) => {
            if !prefix.starts_with('/') {
                return Err(MatchError::PrefixNotAbsolute(prefix.to_owned()));
            }
            PathMatch::Prefix {
                value: join_prefix(value, prefix),
                kind: *kind,
            }
        },
        (Some(PathCondition::Exact(exact)), PathMatch::Prefix { value, .. }) => {
            if !exact.starts_with('/') {
                return Err(MatchError::ExactNotAbsolute(exact.to_owned()));
            }
            PathMatch::Exact(join_prefix(value, exact))
        },
        (Some(PathCondition::Regex(regex)), PathMatch::Prefix { value, .. }) => {
            let base = value.trim_end_matches('/');
            if base.is_empty() {
                PathMatch::Regex(regex.to_owned())
            } else {
                PathMatch::Regex(format!("{}{regex}", regex::escape(base)))
            }
        },
    };

    let mut merged = RouteMatch {
        path,
        headers: parent.headers.clone(),
        queries: parent.queries.clone(),
        method: parent.method.clone(),
    };
    for condition in conditions {
        if let Some(header) = &condition.header {
            merged.headers.push(header_match(header)?);
        }
        if let Some(query) = &condition.query_parameter {
            merged.queries.push(query_match(query)?);
        }
    }
    Ok(merged)
}

/// Canonical form of an include's conditions, compared as a whole when looking for
/// duplicate includes. `None` for sets that are never considered duplicates.
pub fn include_identity(conditions: &[MatchCondition]) -> Result<Option<RouteMatch>, MatchError> {
    let merged = merge_conditions(&RouteMatch::default(), conditions)?.identity();
    if merged == RouteMatch::default() {
        Ok(None)
    } else {
        Ok(Some(merged))
    }
}

pub fn header_match(condition: &HeaderMatchCondition) -> Result<HeaderMatch, MatchError> {
    let name = condition.name.to_lowercase();
    let mut kinds = vec![];
    if condition.present == Some(true) {
        kinds.push((StringMatch::Present, false, "present"));
    }
    if condition.not_present == Some(true) {
        kinds.push((StringMatch::Present, true, "notpresent"));
    }
    if let Some(value) = &condition.exact {
        kinds.push((StringMatch::Exact(value.clone()), false, "exact"));
    }
    if let Some(value) = &condition.not_exact {
        kinds.push((StringMatch::Exact(value.clone()), true, "notexact"));
    }
    if let Some(value) = &condition.prefix {
        kinds.push((StringMatch::Prefix(value.clone()), false, "prefix"));
    }
    if let Some(value) = &condition.suffix {
        kinds.push((StringMatch::Suffix(value.clone()), false, "suffix"));
    }
    if let Some(value) = &condition.contains {
        kinds.push((StringMatch::Contains(value.clone()), false, "contains"));
    }
    if let Some(value) = &condition.not_contains {
        kinds.push((StringMatch::Contains(value.clone()), true, "notcontains"));
    }
    if let Some(value) = &condition.regex {
        kinds.push((StringMatch::Regex(value.clone()), false, "regex"));
    }
    if kinds.len() != 1 {
        return Err(MatchError::HeaderMatchKind(name));
    }
    let (matcher, invert, label) = kinds.remove(0);

    let ignore_case = condition.ignore_case.unwrap_or_default();
    if ignore_case && matches!(matcher, StringMatch::Regex(_) | StringMatch::Present) {
        return Err(MatchError::IgnoreCaseNotSupported(name, label));
    }
    let treat_missing_as_empty = condition.treat_missing_as_empty.unwrap_or_default();
    if treat_missing_as_empty && (!invert || matcher == StringMatch::Present) {
        return Err(MatchError::TreatMissingOnPositive(name));
    }
    Ok(HeaderMatch {
        name,
        matcher,
        invert,
        ignore_case,
        treat_missing_as_empty,
    })
}

pub fn query_match(condition: &QueryParameterMatchCondition) -> Result<QueryMatch, MatchError> {
    let mut kinds = vec![];
    if condition.present == Some(true) {
        kinds.push((StringMatch::Present, "present"));
    }
    if let Some(value) = &condition.exact {
        kinds.push((StringMatch::Exact(value.clone()), "exact"));
    }
    if let Some(value) = &condition.prefix {
        kinds.push((StringMatch::Prefix(value.clone()), "prefix"));
    }
    if let Some(value) = &condition.suffix {
        kinds.push((StringMatch::Suffix(value.clone()), "suffix"));
    }
    if let Some(value) = &condition.contains {
        kinds.push((StringMatch::Contains(value.clone()), "contains"));
    }
    if let Some(value) = &condition.regex {
        kinds.push((StringMatch::Regex(value.clone()), "regex"));
    }
    if kinds.len() != 1 {
        return Err(MatchError::QueryMatchKind(condition.name.clone()));
    }
    let (matcher, label) = kinds.remove(0);
    let ignore_case = condition.ignore_case.unwrap_or_default();
    if ignore_case && matches!(matcher, StringMatch::Regex(_) | StringMatch::Present) {
        return Err(MatchError::IgnoreCaseNotSupported(condition.name.clone(), label));
    }
    Ok(QueryMatch {
        name: condition.name.clone(),
        matcher,
        ignore_case,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegexCheck {
    Fits,
    /// Compiles, but above the warning threshold.
    Large,
}

/// Bounds the compiled program size of every regex that reaches the graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegexLimits {
    pub max_program_size: usize,
    pub warning_program_size: usize,
}

impl RegexLimits {
    pub fn check(&self, pattern: &str) -> Result<RegexCheck, MatchError> {
        let invalid = |e: regex::Error| MatchError::InvalidRegex {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        };
        match RegexBuilder::new(pattern).size_limit(self.warning_program_size).build() {
            Ok(_) => Ok(RegexCheck::Fits),
            Err(regex::Error::CompiledTooBig(_)) => match RegexBuilder::new(pattern).size_limit(self.max_program_size).build() {
                Ok(_) => Ok(RegexCheck::Large),
                Err(regex::Error::CompiledTooBig(limit)) => Err(MatchError::RegexTooLarge {
                    pattern: pattern.to_owned(),
                    limit,
                }),
                Err(e) => Err(invalid(e)),
            },
            Err(e) => Err(invalid(e)),
        }
    }

    /// Checks every regex of a route match, returning the patterns that crossed the warning
    /// threshold.
    pub fn check_route(&self, route_match: &RouteMatch) -> Result<Vec<String>, MatchError> {
        let mut large = vec![];
        for pattern in route_match.regexes() {
            if self.check(pattern)? == RegexCheck::Large {
                large.push(pattern.to_owned());
            }
        }
        Ok(large)
    }
}
