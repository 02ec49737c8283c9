use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// HTTPProxy is the delegating proxy resource. A proxy with a `virtualhost` is a root; any
/// other proxy only contributes routes when a root (or another reachable proxy) includes it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "projectcontour.io", version = "v1", kind = "HTTPProxy", plural = "httpproxies", namespaced, status = "HTTPProxyStatus")]
#[serde(rename_all = "camelCase")]
pub struct HTTPProxySpec {
    pub virtualhost: Option<VirtualHost>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub includes: Vec<Include>,
    pub tcpproxy: Option<TCPProxy>,
    pub ingress_class_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPProxyStatus {
    /// `valid`, `invalid` or `orphaned`.
    pub current_status: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub fqdn: String,
    pub tls: Option<TLS>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub authorization: Option<AuthorizationServer>,
    /// Emit routes in declaration order instead of by specificity.
    pub disable_route_sorting: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TLS {
    /// `name` for a secret in the proxy namespace or `namespace/name` for a delegated one.
    pub secret_name: Option<String>,
    pub minimum_protocol_version: Option<String>,
    pub passthrough: Option<bool>,
    pub client_validation: Option<DownstreamValidation>,
    pub enable_fallback_certificate: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamValidation {
    pub ca_secret: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Include {
    pub name: String,
    pub namespace: Option<String>,
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: Option<bool>,
    pub not_present: Option<bool>,
    pub exact: Option<String>,
    pub not_exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub contains: Option<String>,
    pub not_contains: Option<String>,
    pub regex: Option<String>,
    pub ignore_case: Option<bool>,
    pub treat_missing_as_empty: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub present: Option<bool>,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub contains: Option<String>,
    pub regex: Option<String>,
    pub ignore_case: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
    #[serde(default)]
    pub services: Vec<Service>,
    pub enable_websockets: Option<bool>,
    pub permit_insecure: Option<bool>,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub health_check_policy: Option<HTTPHealthCheckPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub request_redirect_policy: Option<HTTPRequestRedirectPolicy>,
    pub direct_response_policy: Option<HTTPDirectResponsePolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub port: i32,
    pub protocol: Option<String>,
    pub weight: Option<u32>,
    pub mirror: Option<bool>,
    pub validation: Option<UpstreamValidation>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TCPProxy {
    #[serde(default)]
    pub services: Vec<Service>,
    pub include: Option<TCPProxyInclude>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TCPProxyInclude {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
    pub response: Option<String>,
    pub idle: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub count: Option<u32>,
    pub per_try_timeout: Option<String>,
    #[serde(default)]
    pub retry_on: Vec<String>,
    #[serde(default)]
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPHealthCheckPolicy {
    pub path: String,
    pub host: Option<String>,
    pub interval_seconds: Option<u32>,
    pub timeout_seconds: Option<u32>,
    pub unhealthy_threshold_count: Option<u32>,
    pub healthy_threshold_count: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPolicy {
    pub strategy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeadersPolicy {
    #[serde(default)]
    pub set: Vec<HeaderValue>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    pub unit: String,
    pub burst: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRateLimitPolicy {
    /// Set on a route to opt out of the virtual host global rate limit.
    pub disabled: Option<bool>,
    #[serde(default)]
    pub descriptors: Vec<RateLimitDescriptor>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    #[serde(default)]
    pub entries: Vec<RateLimitDescriptorEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptorEntry {
    pub generic_key: Option<GenericKeyDescriptor>,
    pub request_header: Option<RequestHeaderDescriptor>,
    pub remote_address: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenericKeyDescriptor {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderDescriptor {
    pub header_name: String,
    pub descriptor_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationServer {
    pub extension_ref: ExtensionServiceReference,
    pub auth_policy: Option<AuthorizationPolicy>,
    pub response_timeout: Option<String>,
    pub fail_open: Option<bool>,
}

/// References the service answering external authorization checks.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionServiceReference {
    pub name: String,
    pub namespace: Option<String>,
    pub port: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPolicy {
    pub disabled: Option<bool>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRequestRedirectPolicy {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<i32>,
    pub status_code: Option<u16>,
    pub path: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPDirectResponsePolicy {
    pub status_code: u16,
    pub body: Option<String>,
}

impl HTTPProxy {
    pub fn is_root(&self) -> bool {
        self.spec.virtualhost.is_some()
    }
}
