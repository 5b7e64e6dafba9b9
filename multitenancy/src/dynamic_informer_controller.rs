use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use kube::Client;
use multitenancy_apis::{GroupVersionResource, TenantResource, TENANT_RESOURCE_LABEL};
use tokio_util::sync::CancellationToken;

use crate::collections::{
    dynamic_informer, fetch, flat_map, Collection, CollectionRef, Context, Event, EventHandler,
    EventType, Filter, Keyed, StaticCollection, Unstructured,
};
use crate::namespace_controller::TenantNamespace;

/// A DynamicInformer is an informer-backed collection created at runtime
/// for one GroupVersionResource referenced by a TenantResource. It owns a
/// stop signal; collections derived from the informer adopt a child of that
/// signal so they tear down along with it.
#[derive(Clone)]
pub(crate) struct DynamicInformer {
    pub collection: CollectionRef<Unstructured>,
    gvr: GroupVersionResource,
    stop: CancellationToken,
}

impl DynamicInformer {
    pub fn gvr(&self) -> &GroupVersionResource {
        &self.gvr
    }

    /// Stops the informer and everything derived from it. Safe to call any
    /// number of times.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// A token tied to this informer's lifetime, for collections derived
    /// from it.
    pub fn stop_child(&self) -> CancellationToken {
        self.stop.child_token()
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Keyed for DynamicInformer {
    fn key(&self) -> String {
        self.gvr.key()
    }
}

/// Two informers for the same GVR are interchangeable; at most one exists
/// at a time.
impl PartialEq for DynamicInformer {
    fn eq(&self, other: &Self) -> bool {
        self.gvr == other.gvr
    }
}

impl std::fmt::Debug for DynamicInformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicInformer")
            .field("gvr", &self.gvr)
            .finish()
    }
}

/// DynamicInformerController tracks the set of GroupVersionResources in
/// active use and runs exactly one label-filtered dynamic informer per GVR.
pub(crate) struct DynamicInformerController {
    gvrs: CollectionRef<GroupVersionResource>,
    dynamic_informers: Arc<StaticCollection<DynamicInformer>>,
}

impl DynamicInformerController {
    pub fn new(
        client: Client,
        tenant_resources: CollectionRef<Arc<TenantResource>>,
        tenant_namespaces: CollectionRef<TenantNamespace>,
        stop: CancellationToken,
    ) -> Self {
        let gvrs = flat_map(tenant_namespaces, map_to_gvrs(tenant_resources), stop.clone());
        let dynamic_informers = StaticCollection::new(stop.child_token());
        gvrs.register(dynamic_collection_handler(
            client,
            dynamic_informers.clone(),
            stop,
        ));
        Self {
            gvrs,
            dynamic_informers,
        }
    }

    pub fn gvrs(&self) -> CollectionRef<GroupVersionResource> {
        self.gvrs.clone()
    }

    pub fn dynamic_informers(&self) -> Arc<StaticCollection<DynamicInformer>> {
        self.dynamic_informers.clone()
    }
}

/// Collects the deduplicated GVRs of the TenantResources referenced by a
/// TenantNamespace. The fetch records a dependency, so changes to
/// TenantResources or to a tenant's resource list re-derive the set.
fn map_to_gvrs(
    tenant_resources: CollectionRef<Arc<TenantResource>>,
) -> impl Fn(&mut Context, &TenantNamespace) -> Vec<GroupVersionResource> + Send + Sync + 'static {
    move |ctx, tns| {
        let resources = fetch(
            ctx,
            &tenant_resources,
            Filter::match_names(tns.tenant.spec.resources.iter().cloned()),
        );
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for resource in resources {
            let gvr = resource.spec.resource.clone();
            if seen.insert(gvr.key()) {
                result.push(gvr);
            }
        }
        result
    }
}

/// Handler managing the lifecycle of one dynamic informer per active GVR.
fn dynamic_collection_handler(
    client: Client,
    informers: Arc<StaticCollection<DynamicInformer>>,
    stop: CancellationToken,
) -> EventHandler<GroupVersionResource> {
    Arc::new(move |ev: Event<GroupVersionResource>| {
        let client = client.clone();
        let informers = informers.clone();
        let stop = stop.clone();
        async move {
            let gvr = ev.latest();
            let existing = informers.get(&gvr.key());

            match ev.event_type {
                EventType::Add => {
                    if existing.is_some() {
                        info!("received add event for existing dynamic informer, gvr={}", gvr);
                        return;
                    }
                    info!("starting dynamic informer, gvr={}", gvr);
                    let informer_stop = stop.child_token();
                    let collection = dynamic_informer(
                        &client,
                        gvr,
                        TENANT_RESOURCE_LABEL,
                        informer_stop.child_token(),
                    );
                    informers.update(DynamicInformer {
                        collection,
                        gvr: gvr.clone(),
                        stop: informer_stop,
                    });
                }
                EventType::Update => {
                    error!(
                        "GroupVersionResource was updated -- the entire object is its key, gvr={}",
                        gvr
                    );
                }
                EventType::Delete => {
                    if let Some(informer) = existing {
                        info!("stopping dynamic informer, gvr={}", gvr);
                        informer.stop();
                        informers.delete(&informer.key());
                    }
                }
            }
        }
        .boxed()
    })
}
