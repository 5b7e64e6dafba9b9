use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::Client;
use multitenancy_apis::{Tenant, TenantResource};
use tokio_util::sync::CancellationToken;

use crate::collections::{informer, Collection, CollectionRef};
use crate::dynamic_informer_controller::DynamicInformerController;
use crate::namespace_controller::NamespaceController;
use crate::tenant_resource_controller::TenantResourceController;

/// A Manager bootstraps the root informers and all controllers, and wires
/// the dependencies between them.
pub(crate) struct Manager {
    pub namespaces: CollectionRef<Arc<Namespace>>,
    pub tenants: CollectionRef<Arc<Tenant>>,
    pub tenant_resources: CollectionRef<Arc<TenantResource>>,

    namespace_controller: NamespaceController,
    dynamic_informer_controller: DynamicInformerController,
    tenant_resource_controller: TenantResourceController,
}

impl Manager {
    pub fn new(client: Client, stop: CancellationToken) -> Self {
        let namespaces = informer::<Namespace>(&client, stop.child_token());
        let tenants = informer::<Tenant>(&client, stop.child_token());
        let tenant_resources = informer::<TenantResource>(&client, stop.child_token());

        let namespace_controller = NamespaceController::new(
            client.clone(),
            namespaces.clone(),
            tenants.clone(),
            stop.child_token(),
        );
        let dynamic_informer_controller = DynamicInformerController::new(
            client.clone(),
            tenant_resources.clone(),
            namespace_controller.tenant_namespaces(),
            stop.child_token(),
        );
        let tenant_resource_controller = TenantResourceController::new(
            client,
            tenant_resources.clone(),
            namespace_controller.tenant_namespaces(),
            dynamic_informer_controller.dynamic_informers(),
            stop.child_token(),
        );

        Self {
            namespaces,
            tenants,
            tenant_resources,
            namespace_controller,
            dynamic_informer_controller,
            tenant_resource_controller,
        }
    }

    /// Blocks until every root informer and derived collection has
    /// completed its initial pass, or `stop` fires. Returns whether
    /// everything synced.
    pub async fn wait_until_synced(&self, stop: &CancellationToken) -> bool {
        let barriers = [
            self.namespaces.synced(),
            self.tenants.synced(),
            self.tenant_resources.synced(),
            self.namespace_controller.tenant_namespaces().synced(),
            self.dynamic_informer_controller.gvrs().synced(),
            self.dynamic_informer_controller.dynamic_informers().synced(),
            self.tenant_resource_controller.desired().synced(),
        ];
        let mut synced = true;
        for barrier in barriers {
            synced &= barrier.wait(stop).await;
        }
        synced
    }
}
