use std::collections::BTreeMap;

use k8s_openapi::api::core::v1;
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tracing::debug;

use super::{Secret, SecretKind};
use crate::{
    common::{reason, ErrorKind, NamespacedName},
    state::Objects,
};

const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const TLS_CERT_KEY: &str = "tls.crt";
const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
const CA_CERT_KEY: &str = "ca.crt";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(NamespacedName),
    #[error("secret {0} is not of type kubernetes.io/tls")]
    WrongType(NamespacedName),
    #[error("secret {0} is missing key {1}")]
    MissingKey(NamespacedName, &'static str),
    #[error("secret {0} holds an invalid certificate: {1}")]
    InvalidCertificate(NamespacedName, String),
    #[error("secret {0} holds an invalid private key: {1}")]
    InvalidKey(NamespacedName, String),
    #[error("secret {0} is not delegated to namespace {1}")]
    NotDelegated(NamespacedName, String),
}

impl SecretError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => reason::SECRET_NOT_FOUND,
            Self::NotDelegated(..) => reason::DELEGATION_NOT_PERMITTED,
            Self::WrongType(_) | Self::MissingKey(..) | Self::InvalidCertificate(..) | Self::InvalidKey(..) => reason::SECRET_INVALID,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NotDelegated(..) => ErrorKind::MalformedReference,
            _ => ErrorKind::InvalidShape,
        }
    }
}

/// Validates secrets on first reference and remembers the outcome for the rest of the build.
/// Secrets nobody references are never looked at.
pub struct SecretCache<'a> {
    objects: &'a Objects,
    memo: BTreeMap<(NamespacedName, SecretKind), Result<Secret, SecretError>>,
}

impl<'a> SecretCache<'a> {
    pub fn new(objects: &'a Objects) -> Self {
        Self { objects, memo: BTreeMap::new() }
    }

    pub fn keypair(&mut self, name: &NamespacedName) -> Result<Secret, SecretError> {
        let objects = self.objects;
        self.memo
            .entry((name.clone(), SecretKind::TlsKeyPair))
            .or_insert_with(|| validate_keypair(objects, name))
            .clone()
    }

    pub fn ca_bundle(&mut self, name: &NamespacedName) -> Result<Secret, SecretError> {
        let objects = self.objects;
        self.memo
            .entry((name.clone(), SecretKind::CaBundle))
            .or_insert_with(|| validate_ca_bundle(objects, name))
            .clone()
    }

    /// A keypair referenced from `namespace`, which needs a TLSCertificateDelegation when the
    /// secret lives elsewhere.
    pub fn delegated_keypair(&mut self, name: &NamespacedName, namespace: &str) -> Result<Secret, SecretError> {
        if !self.is_delegated(name, namespace) {
            return Err(SecretError::NotDelegated(name.clone(), namespace.to_owned()));
        }
        self.keypair(name)
    }

    pub fn is_delegated(&self, name: &NamespacedName, namespace: &str) -> bool {
        name.namespace == namespace
            || self
                .objects
                .delegations
                .values()
                .filter(|delegation| delegation.metadata.namespace.as_deref() == Some(name.namespace.as_str()))
                .flat_map(|delegation| &delegation.spec.delegations)
                .any(|delegation| delegation.permits(&name.name, namespace))
    }

    /// Number of secrets validated so far.
    pub fn validated(&self) -> usize {
        self.memo.len()
    }
}

fn secret_data(secret: &v1::Secret) -> BTreeMap<String, Vec<u8>> {
    secret
        .data
        .as_ref()
        .map(|data| data.iter().map(|(key, value)| (key.clone(), value.0.clone())).collect())
        .unwrap_or_default()
}

fn validate_keypair(objects: &Objects, name: &NamespacedName) -> Result<Secret, SecretError> {
    let secret = objects.secrets.get(name).ok_or_else(|| SecretError::NotFound(name.clone()))?;
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return Err(SecretError::WrongType(name.clone()));
    }
    let data = secret_data(secret);
    let certificate = data.get(TLS_CERT_KEY).ok_or(SecretError::MissingKey(name.clone(), TLS_CERT_KEY))?;
    let private_key = data.get(TLS_PRIVATE_KEY_KEY).ok_or(SecretError::MissingKey(name.clone(), TLS_PRIVATE_KEY_KEY))?;
    CertificateDer::from_pem_slice(certificate).map_err(|e| SecretError::InvalidCertificate(name.clone(), e.to_string()))?;
    PrivateKeyDer::from_pem_slice(private_key).map_err(|e| SecretError::InvalidKey(name.clone(), e.to_string()))?;
    debug!("Private key and certificate of {name} are valid");
    Ok(Secret {
        name: name.clone(),
        kind: SecretKind::TlsKeyPair,
        data,
    })
}

fn validate_ca_bundle(objects: &Objects, name: &NamespacedName) -> Result<Secret, SecretError> {
    let secret = objects.secrets.get(name).ok_or_else(|| SecretError::NotFound(name.clone()))?;
    let data = secret_data(secret);
    let bundle = data.get(CA_CERT_KEY).ok_or(SecretError::MissingKey(name.clone(), CA_CERT_KEY))?;
    CertificateDer::from_pem_slice(bundle).map_err(|e| SecretError::InvalidCertificate(name.clone(), e.to_string()))?;
    Ok(Secret {
        name: name.clone(),
        kind: SecretKind::CaBundle,
        data: data.into_iter().filter(|(key, _)| key == CA_CERT_KEY).collect(),
    })
}
