mod backends;
mod gateway;
mod httpproxy;
mod ingress;

pub use backends::{resolve_backend, BackendError};
pub use gateway::GatewayProcessor;
pub use httpproxy::HttpProxyProcessor;
pub use ingress::IngressProcessor;

use kube::Resource;

use super::{
    fragment::{Fragment, ListenerDecl},
    matching::{MatchError, RegexLimits},
    policies::PolicyError,
    secrets::{SecretCache, SecretError},
    status::StatusAccumulator,
    ListenerProtocol, Origin,
};
use crate::{
    common::{reason, ErrorKind, Scope},
    configuration::DagConfiguration,
    state::Objects,
};

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const CONTOUR_CLASS_ANNOTATION: &str = "projectcontour.io/ingress.class";
const DEFAULT_INGRESS_CLASS: &str = "contour";

/// Per build state shared by the processors. Processors only read objects; everything they
/// learn flows into a [`Fragment`] or the status accumulator.
pub struct BuildContext<'a> {
    pub objects: &'a Objects,
    pub config: &'a DagConfiguration,
    pub secrets: SecretCache<'a>,
    pub status: StatusAccumulator,
    pub regex_limits: RegexLimits,
}

impl<'a> BuildContext<'a> {
    pub fn new(objects: &'a Objects, config: &'a DagConfiguration) -> Self {
        Self {
            objects,
            config,
            secrets: SecretCache::new(objects),
            status: StatusAccumulator::default(),
            regex_limits: RegexLimits {
                max_program_size: config.max_regex_program_size,
                warning_program_size: config.regex_program_size_warning,
            },
        }
    }

    pub fn http_listener(&self) -> ListenerDecl {
        ListenerDecl {
            name: self.config.http_listener.name.clone(),
            address: self.config.http_listener.address.clone(),
            port: self.config.http_listener.port,
            protocol: ListenerProtocol::Http,
            sticky: false,
        }
    }

    pub fn https_listener(&self) -> ListenerDecl {
        ListenerDecl {
            name: self.config.https_listener.name.clone(),
            address: self.config.https_listener.address.clone(),
            port: self.config.https_listener.port,
            protocol: ListenerProtocol::Https,
            sticky: false,
        }
    }
}

/// A problem found while translating part of an object, recorded once the caller knows
/// whether it takes out the whole object or one fragment of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ErrorKind,
    pub reason: &'static str,
    pub message: String,
}

impl Rejection {
    pub fn new(kind: ErrorKind, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason,
            message: message.into(),
        }
    }

    pub fn record(self, ctx: &mut BuildContext<'_>, origin: &Origin, scope: Scope) {
        ctx.status.record(origin, self.kind, scope, self.reason, self.message);
    }
}

impl From<SecretError> for Rejection {
    fn from(e: SecretError) -> Self {
        Self::new(e.kind(), e.reason(), e.to_string())
    }
}

impl From<BackendError> for Rejection {
    fn from(e: BackendError) -> Self {
        Self::new(ErrorKind::MalformedReference, reason::SERVICE_NOT_FOUND, e.to_string())
    }
}

impl From<PolicyError> for Rejection {
    fn from(e: PolicyError) -> Self {
        Self::new(ErrorKind::InvalidShape, reason::POLICY_NOT_VALID, e.to_string())
    }
}

impl From<MatchError> for Rejection {
    fn from(e: MatchError) -> Self {
        let reason = match e {
            MatchError::RegexTooLarge { .. } => reason::REGEX_TOO_LARGE,
            _ => reason::MATCH_CONDITIONS_NOT_VALID,
        };
        Self::new(ErrorKind::InvalidShape, reason, e.to_string())
    }
}

/// Checks the regexes of a route against the configured program size bounds.
pub fn check_regexes(ctx: &BuildContext<'_>, origin: &Origin, route_match: &super::matching::RouteMatch) -> Result<(), Rejection> {
    for pattern in ctx.regex_limits.check_route(route_match)? {
        tracing::warn!("Regex {pattern} of {} is above the program size warning threshold", origin.key);
    }
    Ok(())
}

/// Translates one family of routing objects into a graph fragment.
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, ctx: &mut BuildContext<'_>) -> Fragment;
}

/// Whether an HTTPProxy or Ingress belongs to this instance. Without a configured class,
/// objects with no class or the default class are served.
pub fn class_matches<R: Resource>(configured: Option<&str>, resource: &R, spec_class: Option<&str>) -> bool {
    let annotations = resource.meta().annotations.as_ref();
    let object_class = spec_class.or_else(|| {
        annotations.and_then(|annotations| {
            annotations
                .get(CONTOUR_CLASS_ANNOTATION)
                .or_else(|| annotations.get(INGRESS_CLASS_ANNOTATION))
                .map(String::as_str)
        })
    });
    match (configured, object_class) {
        (Some(configured), object_class) => object_class == Some(configured),
        (None, None) => true,
        (None, Some(object_class)) => object_class == DEFAULT_INGRESS_CLASS,
    }
}
