use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client,
};
use multitenancy_apis::{Tenant, TENANT_LABEL, TENANT_RESOURCE_LABEL};
use opentelemetry::{global, KeyValue};
use tokio_util::sync::CancellationToken;

use crate::collections::{
    fetch, flat_map, Collection, CollectionRef, Context, Event, EventHandler, EventType, Filter,
    Keyed,
};
use crate::errors::{ControllerError, ExtKubeApiError};
use crate::prometheus_exporter::metric_name;
use crate::MANAGER;

/// A TenantNamespace represents a namespace owned by a Tenant. The
/// namespace is the live object when one exists, or a synthesized stub
/// carrying only the name; either way its labels are the merge of the
/// tenant's labels and the tenant tracking label.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TenantNamespace {
    pub tenant: Arc<Tenant>,
    pub namespace: Namespace,
}

impl Keyed for TenantNamespace {
    fn key(&self) -> String {
        format!("{}/{}", self.tenant.key(), self.namespace.key())
    }
}

/// NamespaceController derives TenantNamespace groupings from Tenants and
/// keeps namespace labels reconciled against them.
pub(crate) struct NamespaceController {
    tenant_namespaces: CollectionRef<TenantNamespace>,
}

impl NamespaceController {
    pub fn new(
        client: Client,
        namespaces: CollectionRef<Arc<Namespace>>,
        tenants: CollectionRef<Arc<Tenant>>,
        stop: CancellationToken,
    ) -> Self {
        let tenant_namespaces = flat_map(tenants, tenant_to_namespaces(namespaces), stop);
        tenant_namespaces.register(reconcile_namespaces(client));
        Self { tenant_namespaces }
    }

    pub fn tenant_namespaces(&self) -> CollectionRef<TenantNamespace> {
        self.tenant_namespaces.clone()
    }
}

/// Maps a Tenant to one TenantNamespace per declared namespace. Namespaces
/// which exist in the cluster are fetched so their creationTimestamp is
/// carried along; the rest are synthesized as stubs.
fn tenant_to_namespaces(
    namespaces: CollectionRef<Arc<Namespace>>,
) -> impl Fn(&mut Context, &Arc<Tenant>) -> Vec<TenantNamespace> + Send + Sync + 'static {
    move |ctx, tenant| {
        let fetched = fetch(
            ctx,
            &namespaces,
            Filter::match_names(tenant.spec.namespaces.iter().cloned()),
        );
        let by_name: HashMap<&str, &Arc<Namespace>> = fetched
            .iter()
            .map(|ns| (ns.metadata.name.as_deref().unwrap_or_default(), ns))
            .collect();

        let tenant_name = tenant.metadata.name.clone().unwrap_or_default();
        let mut result = Vec::with_capacity(tenant.spec.namespaces.len());
        for ns_name in &tenant.spec.namespaces {
            let mut ns = match by_name.get(ns_name.as_str()) {
                Some(existing) => (***existing).clone(),
                None => Namespace {
                    metadata: ObjectMeta {
                        name: Some(ns_name.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            };

            let mut labels: BTreeMap<String, String> = tenant.spec.labels.clone();
            labels.insert(TENANT_LABEL.to_string(), tenant_name.clone());
            ns.metadata.labels = Some(labels);

            result.push(TenantNamespace {
                tenant: tenant.clone(),
                namespace: ns,
            });
        }
        result
    }
}

/// Handler keeping tenant namespaces up-to-date in the cluster.
fn reconcile_namespaces(client: Client) -> EventHandler<TenantNamespace> {
    let reconcile_count = global::meter("namespace_controller")
        .u64_counter(metric_name("namespace_reconcile_count"))
        .with_description("Count of namespace reconcile invocations")
        .build();
    Arc::new(move |ev: Event<TenantNamespace>| {
        let client = client.clone();
        let reconcile_count = reconcile_count.clone();
        async move {
            let tns = ev.latest();
            let tenant = tns.tenant.metadata.name.clone().unwrap_or_default();
            let ns_name = tns.namespace.metadata.name.clone().unwrap_or_default();
            reconcile_count.add(
                1,
                &[
                    KeyValue::new("tenant", tenant.clone()),
                    KeyValue::new("namespace", ns_name.clone()),
                    KeyValue::new("event", ev.event_type.to_string()),
                ],
            );
            if let Err(e) = apply_namespace_event(client, &ev).await {
                error!(
                    "error reconciling namespace {} of tenant {}: {}",
                    ns_name, tenant, e
                );
            }
        }
        .boxed()
    })
}

async fn apply_namespace_event(
    client: Client,
    ev: &Event<TenantNamespace>,
) -> Result<(), ControllerError> {
    let api: Api<Namespace> = Api::all(client);
    let tns = ev.latest();
    let ns = &tns.namespace;
    let name = ns.metadata.name.as_deref().unwrap_or_default();
    let pp = PostParams {
        dry_run: false,
        field_manager: Some(MANAGER.to_string()),
    };

    match ev.event_type {
        EventType::Add => {
            let mut ns = ns.clone();
            // Only synthesized namespaces carry no creationTimestamp.
            if ns.metadata.creation_timestamp.is_none() {
                // Replace requires the live resourceVersion, which a
                // synthesized namespace does not have yet; take it from the
                // created object, or from the cluster when creation lost
                // the race.
                match api.create(&pp, &ns).await {
                    Ok(created) => {
                        info!("created namespace {}", name);
                        ns.metadata.resource_version = created.metadata.resource_version;
                    }
                    Err(e) if e.is_already_exists() => {
                        let current = api.get(name).await?;
                        ns.metadata.resource_version = current.metadata.resource_version;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            api.replace(name, &pp, &ns).await?;
            info!("namespace {} labels reconciled", name);
        }
        EventType::Update => {
            // The only changes this controller makes are to namespace labels.
            let labels_unchanged = match (&ev.old, &ev.new) {
                (Some(old), Some(new)) => {
                    old.namespace.metadata.labels == new.namespace.metadata.labels
                }
                _ => false,
            };
            if labels_unchanged {
                return Ok(());
            }
            let mut ns = ns.clone();
            if ns.metadata.resource_version.is_none() {
                // Synthesized namespace; fetch the live version to update.
                match api.get(name).await {
                    Ok(current) => {
                        ns.metadata.resource_version = current.metadata.resource_version
                    }
                    Err(e) if e.is_not_found() => {
                        api.create(&pp, &ns).await?;
                        info!("created namespace {} during update", name);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            match api.replace(name, &pp, &ns).await {
                Ok(_) => info!("namespace {} updated", name),
                Err(e) if e.is_not_found() => {
                    ns.metadata.resource_version = None;
                    api.create(&pp, &ns).await?;
                    info!("created namespace {} during update", name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        EventType::Delete => {
            info!("namespace {} is no longer managed by a tenant", name);
            // Do not delete the namespace; it may carry unrelated state.
            // Remove the tracking label instead.
            let mut labels = serde_json::Map::new();
            labels.insert(TENANT_RESOURCE_LABEL.to_string(), serde_json::Value::Null);
            let patch = serde_json::json!({"metadata": {"labels": labels}});
            let patch_params = PatchParams {
                field_manager: Some(MANAGER.to_string()),
                ..Default::default()
            };
            match api.patch(name, &patch_params, &Patch::Merge(&patch)).await {
                Ok(_) => (),
                Err(e) if e.is_not_found() => (),
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
