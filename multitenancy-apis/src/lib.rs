use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &'static str = "specs.kalexmills.com";

/// Label carrying the name of the Tenant which owns an object.
pub const TENANT_LABEL: &'static str = "multitenancy.kalexmills.com/tenant";

/// Label carrying the name of the TenantResource an object was created from.
/// Dynamic informers select on the existence of this label.
pub const TENANT_RESOURCE_LABEL: &'static str = "multitenancy.kalexmills.com/tenant-resource";

/// Tenant specifies a collection of namespaces which comprise a tenant,
/// along with the TenantResources to materialize into each of them.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "specs.kalexmills.com",
    version = "v1alpha1",
    kind = "Tenant",
    derive = "PartialEq",
    status = "TenantStatus",
    printcolumn = r#"{
        "name":"Namespaces",
        "type": "string",
        "jsonPath": ".spec.namespaces",
        "description": "Namespaces owned by this tenant."
    }"#
)]
pub struct TenantSpec {
    /// The namespaces owned by this tenant. Namespaces which do not exist
    /// are created.
    pub namespaces: Vec<String>,

    /// Labels are added to every namespace owned by the tenant.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Names of TenantResource objects to copy into each namespace of the
    /// tenant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TenantStatus {
    /// NamespaceStatuses maps from namespace name to its current status.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        rename = "namespaceStatuses"
    )]
    pub namespace_statuses: BTreeMap<String, NamespaceStatus>,
}

/// Status of a single namespace owned by a Tenant.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NamespaceStatus {
    Pending,
    Ready,
    Error,
    Deleting,
}

/// TenantResource describes a Kubernetes resource which is copied into every
/// namespace of each Tenant that references it, and kept in sync.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "specs.kalexmills.com",
    version = "v1alpha1",
    kind = "TenantResource",
    derive = "PartialEq",
    printcolumn = r#"{
        "name":"Resource",
        "type": "string",
        "jsonPath": ".spec.resource.resource",
        "description": "Resource type created by this TenantResource."
    }"#
)]
pub struct TenantResourceSpec {
    /// Resource uniquely identifies the type of the resource to create.
    pub resource: GroupVersionResource,

    /// Manifest is the entire manifest to copy into each namespace for this
    /// resource. The namespace and tracking labels of the manifest are
    /// overridden by the controller.
    pub manifest: serde_json::Value,
}

/// A (group, version, resource) triple identifying a Kubernetes resource
/// type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, JsonSchema)]
pub struct GroupVersionResource {
    /// The Kubernetes API Group name, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// The Kubernetes API version.
    pub version: String,
    /// The lower-case plural resource name, e.g. "configmaps".
    pub resource: String,
}

impl GroupVersionResource {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.group, self.version, self.resource)
    }
}
