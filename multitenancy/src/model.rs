use k8s_openapi::api::core::v1::Namespace;
use multitenancy_apis::{GroupVersionResource, Tenant, TenantResource};

use crate::collections::{Keyed, Unstructured};

impl Keyed for Namespace {
    fn key(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

impl Keyed for Tenant {
    fn key(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

impl Keyed for TenantResource {
    fn key(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }
}

impl Keyed for GroupVersionResource {
    fn key(&self) -> String {
        format!("{},{},{}", self.group, self.version, self.resource)
    }
}

/// Strips fields the API server owns before comparing desired and actual
/// objects: resourceVersion, generation, managedFields, uid,
/// creationTimestamp and the status subtree. The residual trees compare
/// equal exactly when an update would not change anything substantial.
pub(crate) fn clean_obj(obj: &Unstructured) -> Unstructured {
    let mut res = obj.object().clone();
    res.metadata.resource_version = None;
    res.metadata.generation = None;
    res.metadata.managed_fields = None;
    res.metadata.uid = None;
    res.metadata.creation_timestamp = None;
    if let Some(data) = res.data.as_object_mut() {
        data.remove("status");
    }
    Unstructured::new(res)
}
