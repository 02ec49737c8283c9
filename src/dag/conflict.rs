use std::cmp::Ordering;

use k8s_openapi::chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{ParentReference, ResourceKey};

/// Object family a fragment came from. The declaration order is the priority order used by
/// [`CrossSchemaPolicy::SchemaPriority`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Schema {
    GatewayApi,
    HttpProxy,
    Ingress,
}

/// How collisions between objects of different schemas are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossSchemaPolicy {
    /// The same creation-time tie-break used inside a schema.
    #[default]
    OldestWins,
    /// Gateway API beats HTTPProxy beats Ingress; creation time only breaks ties inside a
    /// schema.
    SchemaPriority,
}

/// The object (and for Gateway API routes, the parent reference and rule) a piece of
/// configuration is attributed to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub key: ResourceKey,
    pub schema: Schema,
    #[serde(skip)]
    pub created: Option<DateTime<Utc>>,
    pub parent: Option<ParentReference>,
    pub rule: usize,
}

impl Origin {
    pub fn new(key: ResourceKey, schema: Schema, created: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            schema,
            created,
            parent: None,
            rule: 0,
        }
    }

    pub fn with_parent(&self, parent: ParentReference) -> Self {
        Self {
            parent: Some(parent),
            ..self.clone()
        }
    }

    pub fn with_rule(&self, rule: usize) -> Self {
        Self { rule, ..self.clone() }
    }

    /// Same object and, for routes, same parent.
    pub fn same_attachment(&self, other: &Origin) -> bool {
        self.key == other.key && self.parent == other.parent
    }
}

/// `Less` when `a` wins. The oldest creation timestamp wins, an object with a timestamp beats
/// one without, and equal timestamps fall back to the smaller `namespace/name`.
pub fn tie_break(a: &Origin, b: &Origin) -> Ordering {
    let by_time = match (&a.created, &b.created) {
        (Some(left), Some(right)) => left.cmp(right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time
        .then_with(|| a.key.namespace.cmp(&b.key.namespace))
        .then_with(|| a.key.name.cmp(&b.key.name))
        .then_with(|| a.key.kind.cmp(&b.key.kind))
}

/// `Less` when `a` takes precedence over `b` under `policy`.
pub fn precedence(a: &Origin, b: &Origin, policy: CrossSchemaPolicy) -> Ordering {
    match policy {
        CrossSchemaPolicy::SchemaPriority if a.schema != b.schema => a.schema.cmp(&b.schema),
        _ => tie_break(a, b),
    }
}
