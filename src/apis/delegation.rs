use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grants other namespaces permission to reference TLS secrets living in the namespace of
/// the delegation.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "projectcontour.io", version = "v1", kind = "TLSCertificateDelegation", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct TLSCertificateDelegationSpec {
    #[serde(default)]
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDelegation {
    pub secret_name: String,
    #[serde(default)]
    pub target_namespaces: Vec<String>,
}

impl CertificateDelegation {
    pub fn permits(&self, secret_name: &str, namespace: &str) -> bool {
        self.secret_name == secret_name && self.target_namespaces.iter().any(|ns| ns == "*" || ns == namespace)
    }
}
