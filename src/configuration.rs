use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::{common::NamespacedName, dag::CrossSchemaPolicy};

const DEFAULT_MAX_REGEX_PROGRAM_SIZE: usize = 1024 * 1024;
const DEFAULT_REGEX_PROGRAM_SIZE_WARNING: usize = 64 * 1024;
const DEFAULT_DEBOUNCE_MILLIS: u64 = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("controller name must be not empty")]
    ControllerName,
    #[error("regex program size warning ({warning}) must be below the maximum ({maximum})")]
    RegexProgramSize { warning: usize, maximum: usize },
    #[error("listener {0} must have a non zero port")]
    ListenerPort(String),
    #[error("http and https listeners must use different names and ports")]
    ListenerClash,
}

#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder, Deserialize)]
pub struct ListenerConfiguration {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default = "0.0.0.0".to_owned(), setter(into))]
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
}

fn default_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_http_listener() -> ListenerConfiguration {
    ListenerConfiguration::builder().name("ingress_http").port(8080).build()
}

fn default_https_listener() -> ListenerConfiguration {
    ListenerConfiguration::builder().name("ingress_https").port(8443).build()
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct HeadersConfiguration {
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Knobs consumed by the graph builder.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder, Deserialize)]
pub struct DagConfiguration {
    #[builder(default)]
    #[serde(default)]
    pub disable_route_sorting: bool,
    #[builder(default = DEFAULT_MAX_REGEX_PROGRAM_SIZE)]
    #[serde(default = "default_max_regex_program_size")]
    pub max_regex_program_size: usize,
    #[builder(default = DEFAULT_REGEX_PROGRAM_SIZE_WARNING)]
    #[serde(default = "default_regex_program_size_warning")]
    pub regex_program_size_warning: usize,
    #[builder(default)]
    #[serde(default)]
    pub auth_before_rate_limit: bool,
    #[builder(default)]
    #[serde(default)]
    pub cross_schema_conflict_policy: CrossSchemaPolicy,
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub ingress_class_name: Option<String>,
    #[builder(default = default_http_listener())]
    #[serde(default = "default_http_listener")]
    pub http_listener: ListenerConfiguration,
    #[builder(default = default_https_listener())]
    #[serde(default = "default_https_listener")]
    pub https_listener: ListenerConfiguration,
    #[builder(default)]
    #[serde(default)]
    pub default_request_headers: HeadersConfiguration,
    #[builder(default)]
    #[serde(default)]
    pub default_response_headers: HeadersConfiguration,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub fallback_certificate: Option<NamespacedName>,
    /// GatewayClass controller served by this instance.
    #[builder(default = "projectcontour.io/gateway-controller".to_owned(), setter(into))]
    #[serde(default = "default_controller_name")]
    pub controller_name: String,
}

fn default_max_regex_program_size() -> usize {
    DEFAULT_MAX_REGEX_PROGRAM_SIZE
}

fn default_regex_program_size_warning() -> usize {
    DEFAULT_REGEX_PROGRAM_SIZE_WARNING
}

fn default_controller_name() -> String {
    "projectcontour.io/gateway-controller".to_owned()
}

impl Default for DagConfiguration {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DagConfiguration {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.regex_program_size_warning >= self.max_regex_program_size {
            return Err(ConfigurationError::RegexProgramSize {
                warning: self.regex_program_size_warning,
                maximum: self.max_regex_program_size,
            });
        }
        for listener in [&self.http_listener, &self.https_listener] {
            if listener.port == 0 {
                return Err(ConfigurationError::ListenerPort(listener.name.clone()));
            }
        }
        if self.http_listener.name == self.https_listener.name || self.http_listener.port == self.https_listener.port {
            return Err(ConfigurationError::ListenerClash);
        }
        Ok(())
    }
}

#[derive(Debug, TypedBuilder, Deserialize)]
pub struct Configuration {
    #[builder(setter(into))]
    pub controller_name: String,
    #[builder(default)]
    #[serde(default)]
    pub enable_open_telemetry: Option<bool>,
    /// Namespaces to watch; all namespaces when empty.
    #[builder(default)]
    #[serde(default)]
    pub watch_namespaces: Vec<String>,
    #[builder(default = DEFAULT_DEBOUNCE_MILLIS)]
    #[serde(default = "default_debounce_millis")]
    pub debounce_millis: u64,
    #[builder(default)]
    #[serde(default)]
    pub dag: DagConfiguration,
}

fn default_debounce_millis() -> u64 {
    DEFAULT_DEBOUNCE_MILLIS
}

impl Configuration {
    pub fn validate(&self) -> crate::Result<()> {
        if self.controller_name.is_empty() {
            return Err(ConfigurationError::ControllerName.into());
        }
        self.dag.validate()?;
        Ok(())
    }

    /// The builder configuration with the controller name this instance answers to.
    pub fn dag_configuration(&self) -> DagConfiguration {
        DagConfiguration {
            controller_name: self.controller_name.clone(),
            ..self.dag.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_configuration() {
        let configuration: Configuration = serde_yaml::from_str("controller_name: example.com/gateway").unwrap();
        assert!(configuration.validate().is_ok());
        assert_eq!(configuration.debounce_millis, DEFAULT_DEBOUNCE_MILLIS);
        let dag = configuration.dag_configuration();
        assert_eq!(dag.controller_name, "example.com/gateway");
        assert_eq!(dag.http_listener.port, 8080);
        assert_eq!(dag.https_listener.name, "ingress_https");
        assert_eq!(dag.cross_schema_conflict_policy, CrossSchemaPolicy::OldestWins);
    }

    #[test]
    fn parse_full_configuration() {
        let yaml = r"
controller_name: example.com/gateway
watch_namespaces: [team-a, team-b]
dag:
  disable_route_sorting: true
  max_regex_program_size: 2048
  regex_program_size_warning: 1024
  cross_schema_conflict_policy: SchemaPriority
  ingress_class_name: internal
  fallback_certificate:
    namespace: certs
    name: fallback
  http_listener:
    name: http
    port: 80
";
        let configuration: Configuration = serde_yaml::from_str(yaml).unwrap();
        assert!(configuration.validate().is_ok());
        assert_eq!(configuration.watch_namespaces.len(), 2);
        assert!(configuration.dag.disable_route_sorting);
        assert_eq!(configuration.dag.cross_schema_conflict_policy, CrossSchemaPolicy::SchemaPriority);
        assert_eq!(configuration.dag.http_listener.address, "0.0.0.0");
        assert_eq!(configuration.dag.fallback_certificate, Some(NamespacedName::new("certs", "fallback")));
    }

    #[test]
    fn reject_invalid_configuration() {
        let configuration = Configuration::builder().controller_name("").build();
        assert!(configuration.validate().is_err());

        let dag = DagConfiguration::builder().max_regex_program_size(10).regex_program_size_warning(10).build();
        assert_eq!(dag.validate(), Err(ConfigurationError::RegexProgramSize { warning: 10, maximum: 10 }));

        let dag = DagConfiguration::builder()
            .http_listener(ListenerConfiguration::builder().name("http").port(0).build())
            .build();
        assert_eq!(dag.validate(), Err(ConfigurationError::ListenerPort("http".to_owned())));
    }
}
