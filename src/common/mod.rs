pub mod conditions;
pub mod gateway_api;
mod resource_key;

pub use conditions::{reason, ConditionEntry, ConditionSet, ConditionType, ErrorKind, Scope};
pub use self::gateway_api::{wire_name, Listed, ParentReference};
pub use resource_key::{
    creation_timestamp, NamespacedName, ResourceKey, CONTOUR_GROUP_NAME, CORE_GROUP_NAME, DEFAULT_NAMESPACE_NAME, DEFAULT_ROUTE_HOSTNAME,
    GATEWAY_GROUP_NAME, GATEWAY_KIND, SECRET_KIND, SERVICE_KIND,
};
