use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kube::{
    api::{Api, DeleteParams, DynamicObject, PostParams},
    Client,
};
use multitenancy_apis::{
    GroupVersionResource, TenantResource, TENANT_LABEL, TENANT_RESOURCE_LABEL,
};
use opentelemetry::{global, KeyValue};
use tokio_util::sync::CancellationToken;

use crate::collections::{
    api_resource, fetch, flat_map, join, map, Collection, CollectionRef, Context, Event,
    EventHandler, EventType, Filter, JoinKind, Joined, Keyed, StaticCollection, Unstructured,
};
use crate::dynamic_informer_controller::DynamicInformer;
use crate::errors::{ControllerError, ExtKubeApiError};
use crate::model::clean_obj;
use crate::namespace_controller::TenantNamespace;
use crate::prometheus_exporter::metric_name;
use crate::MANAGER;

/// A DesiredTenantResource is the manifest a TenantResource demands in one
/// tenant namespace, with the namespace overridden and tracking labels
/// stamped.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DesiredTenantResource {
    pub tenant_name: String,
    pub namespace: String,
    pub resource_name: String,
    pub gvr: GroupVersionResource,
    pub object: Unstructured,
}

impl Keyed for DesiredTenantResource {
    fn key(&self) -> String {
        format!("{}/{}/{}", self.tenant_name, self.resource_name, self.namespace)
    }
}

/// An ActualTenantResource is a live object observed by a dynamic informer.
/// Its key is reconstructed from the object's tracking labels and
/// namespace, aligning it with the DesiredTenantResource keyspace.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ActualTenantResource {
    pub object: Unstructured,
}

impl Keyed for ActualTenantResource {
    fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.object.label(TENANT_LABEL).unwrap_or_default(),
            self.object.label(TENANT_RESOURCE_LABEL).unwrap_or_default(),
            self.object.metadata.namespace.as_deref().unwrap_or_default()
        )
    }
}

/// A desired tenant resource paired with the actual cluster object sharing
/// its key, if one exists.
pub(crate) type TenantResourcePair = Joined<DesiredTenantResource, ActualTenantResource>;

/// TenantResourceController derives the desired state of every tenant
/// resource and reconciles it against the objects observed by the dynamic
/// informers.
pub(crate) struct TenantResourceController {
    desired: CollectionRef<DesiredTenantResource>,
}

impl TenantResourceController {
    pub fn new(
        client: Client,
        tenant_resources: CollectionRef<Arc<TenantResource>>,
        tenant_namespaces: CollectionRef<TenantNamespace>,
        dynamic_informers: Arc<StaticCollection<DynamicInformer>>,
        stop: CancellationToken,
    ) -> Self {
        let desired = flat_map(
            tenant_namespaces,
            namespace_to_desired_resource(tenant_resources),
            stop,
        );
        dynamic_informers.register(join_and_register(client, desired.clone()));
        Self { desired }
    }

    pub fn desired(&self) -> CollectionRef<DesiredTenantResource> {
        self.desired.clone()
    }
}

/// Maps a TenantNamespace to the DesiredTenantResources it must hold.
/// Manifests which fail to decode are logged and skipped; the remaining
/// resources of the tenant are unaffected.
fn namespace_to_desired_resource(
    tenant_resources: CollectionRef<Arc<TenantResource>>,
) -> impl Fn(&mut Context, &TenantNamespace) -> Vec<DesiredTenantResource> + Send + Sync + 'static {
    move |ctx, tns| {
        let resources = fetch(
            ctx,
            &tenant_resources,
            Filter::match_names(tns.tenant.spec.resources.iter().cloned()),
        );
        let tenant_name = tns.tenant.metadata.name.clone().unwrap_or_default();
        let ns_name = tns.namespace.metadata.name.clone().unwrap_or_default();

        let mut result = Vec::with_capacity(resources.len());
        for resource in resources {
            let resource_name = resource.metadata.name.clone().unwrap_or_default();
            let mut obj: DynamicObject = match decode_manifest(&resource) {
                Ok(obj) => obj,
                Err(e) => {
                    error!(
                        "error decoding manifest of TenantResource {}: {}",
                        resource_name, e
                    );
                    continue;
                }
            };

            // Override the namespace to the target and stamp the tracking
            // labels required for the desired/actual key symmetry.
            obj.metadata.namespace = Some(ns_name.clone());
            let labels = obj.metadata.labels.get_or_insert_with(Default::default);
            labels.insert(TENANT_RESOURCE_LABEL.to_string(), resource_name.clone());
            labels.insert(TENANT_LABEL.to_string(), tenant_name.clone());

            result.push(DesiredTenantResource {
                tenant_name: tenant_name.clone(),
                namespace: ns_name.clone(),
                resource_name,
                gvr: resource.spec.resource.clone(),
                object: Unstructured::new(obj),
            });
        }
        result
    }
}

fn decode_manifest(resource: &TenantResource) -> Result<DynamicObject, ControllerError> {
    Ok(serde_json::from_value(resource.spec.manifest.clone())?)
}

/// Handler run for every new DynamicInformer: aligns the informer's
/// keyspace with the desired one, joins the two views scoped to the
/// informer's GVR, and registers the reconciler on the joined collection.
/// Everything created here adopts the informer's stop signal.
fn join_and_register(
    client: Client,
    desired: CollectionRef<DesiredTenantResource>,
) -> EventHandler<DynamicInformer> {
    Arc::new(move |ev: Event<DynamicInformer>| {
        let client = client.clone();
        let desired = desired.clone();
        async move {
            if ev.event_type != EventType::Add {
                return;
            }
            let informer = ev.latest();
            info!("joining desired and actual state, gvr={}", informer.gvr());

            let actual = map(
                informer.collection.clone(),
                |_ctx, obj: &Unstructured| {
                    Some(ActualTenantResource {
                        object: obj.clone(),
                    })
                },
                informer.stop_child(),
            );

            let gvr = informer.gvr().clone();
            let scoped = map(
                desired.clone(),
                move |_ctx, d: &DesiredTenantResource| (d.gvr == gvr).then(|| d.clone()),
                informer.stop_child(),
            );

            let joined = join(scoped, actual, JoinKind::Left, informer.stop_child());
            joined.register(reconcile_tenant_resources(
                client.clone(),
                informer.gvr().clone(),
            ));
        }
        .boxed()
    })
}

/// Handler closing the gap between a desired tenant resource and the
/// cluster.
fn reconcile_tenant_resources(
    client: Client,
    gvr: GroupVersionResource,
) -> EventHandler<TenantResourcePair> {
    let meter = global::meter("tenant_resource_controller");
    let reconcile_count = meter
        .u64_counter(metric_name("resource_reconcile_count"))
        .with_description("Count of reconcile invocations for tenant resources")
        .build();
    let reconcile_duration = meter
        .u64_histogram(metric_name("resource_reconcile_duration_ms"))
        .with_description("Reconcile duration for tenant resources in milliseconds")
        .build();
    Arc::new(move |ev: Event<TenantResourcePair>| {
        let client = client.clone();
        let gvr = gvr.clone();
        let reconcile_count = reconcile_count.clone();
        let reconcile_duration = reconcile_duration.clone();
        async move {
            let start = Instant::now();
            let pair = ev.latest();
            let labels = [
                KeyValue::new("gvr", gvr.to_string()),
                KeyValue::new("namespace", pair.left.namespace.clone()),
                KeyValue::new("resource_name", pair.left.resource_name.clone()),
            ];
            if let Err(e) = apply_resource_event(client, &ev).await {
                error!(
                    "error reconciling tenant resource, gvr={} namespace={} resourceName={}: {}",
                    gvr, pair.left.namespace, pair.left.resource_name, e
                );
            }
            reconcile_count.add(1, &labels);
            reconcile_duration.record(start.elapsed().as_millis() as u64, &labels);
        }
        .boxed()
    })
}

async fn apply_resource_event(
    client: Client,
    ev: &Event<TenantResourcePair>,
) -> Result<(), ControllerError> {
    let pair = ev.latest();
    let desired = &pair.left;
    let api: Api<DynamicObject> =
        Api::namespaced_with(client, &desired.namespace, &api_resource(&desired.gvr));
    let name = desired.object.metadata.name.as_deref().unwrap_or_default();
    let pp = PostParams {
        dry_run: false,
        field_manager: Some(MANAGER.to_string()),
    };

    match ev.event_type {
        EventType::Add => {
            match api.create(&pp, desired.object.object()).await {
                Ok(_) => info!(
                    "resource created, gvr={} namespace={} resourceName={}",
                    desired.gvr, desired.namespace, desired.resource_name
                ),
                Err(e) if e.is_already_exists() => {
                    // Overwrite whatever is there. Replace requires the live
                    // resourceVersion, which the desired manifest never
                    // carries; take it from the existing object.
                    let current = api.get(name).await?;
                    let mut obj = desired.object.object().clone();
                    obj.metadata.resource_version = current.metadata.resource_version;
                    api.replace(name, &pp, &obj).await?;
                    info!(
                        "resource overwritten, gvr={} namespace={} resourceName={}",
                        desired.gvr, desired.namespace, desired.resource_name
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        EventType::Update => {
            let mut obj = desired.object.object().clone();
            if let Some(actual) = pair.right.as_ref() {
                if clean_obj(&actual.object) == clean_obj(&desired.object) {
                    info!(
                        "update suppressed -- no substantial modification was found, gvr={} namespace={} resourceName={}",
                        desired.gvr, desired.namespace, desired.resource_name
                    );
                    return Ok(());
                }
                obj.metadata.resource_version = actual.object.metadata.resource_version.clone();
            } else {
                // No observed object in hand; fetch the live version to
                // update against.
                match api.get(name).await {
                    Ok(current) => {
                        obj.metadata.resource_version = current.metadata.resource_version
                    }
                    Err(e) if e.is_not_found() => {
                        api.create(&pp, &obj).await?;
                        info!(
                            "resource created during update, gvr={} namespace={} resourceName={}",
                            desired.gvr, desired.namespace, desired.resource_name
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            match api.replace(name, &pp, &obj).await {
                Ok(_) => info!(
                    "resource updated, gvr={} namespace={} resourceName={}",
                    desired.gvr, desired.namespace, desired.resource_name
                ),
                Err(e) if e.is_not_found() => {
                    obj.metadata.resource_version = None;
                    api.create(&pp, &obj).await?;
                    info!(
                        "resource created during update, gvr={} namespace={} resourceName={}",
                        desired.gvr, desired.namespace, desired.resource_name
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        EventType::Delete => {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => info!(
                    "resource deleted, gvr={} namespace={} resourceName={}",
                    desired.gvr, desired.namespace, desired.resource_name
                ),
                Err(e) if e.is_not_found() => (),
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::testutil::eventually;
    use crate::mock_api::{already_exists_status, handle_next, mock_client};
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use multitenancy_apis::{Tenant, TenantResourceSpec, TenantSpec};
    use serde_json::json;

    fn tenant_namespace(tenant: &str, namespace: &str, resources: &[&str]) -> TenantNamespace {
        TenantNamespace {
            tenant: Arc::new(Tenant::new(
                tenant,
                TenantSpec {
                    namespaces: vec![namespace.to_string()],
                    labels: Default::default(),
                    resources: resources.iter().map(|r| r.to_string()).collect(),
                },
            )),
            namespace: Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn configmap_resource(name: &str, manifest: serde_json::Value) -> Arc<TenantResource> {
        Arc::new(TenantResource::new(
            name,
            TenantResourceSpec {
                resource: GroupVersionResource {
                    group: "".to_string(),
                    version: "v1".to_string(),
                    resource: "configmaps".to_string(),
                },
                manifest,
            },
        ))
    }

    #[tokio::test]
    async fn desired_resources_are_stamped_and_namespaced() {
        let stop = CancellationToken::new();
        let tenant_resources = StaticCollection::<Arc<TenantResource>>::new(stop.child_token());
        let tenant_namespaces = StaticCollection::<TenantNamespace>::new(stop.child_token());
        tenant_resources.update(configmap_resource(
            "r1",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "r1"},
                "data": {"foo": "bar"},
            }),
        ));
        let desired = flat_map(
            tenant_namespaces.clone() as CollectionRef<TenantNamespace>,
            namespace_to_desired_resource(
                tenant_resources.clone() as CollectionRef<Arc<TenantResource>>
            ),
            stop.child_token(),
        );

        tenant_namespaces.update(tenant_namespace("t1", "ns1", &["r1"]));
        eventually("desired resource derived", || {
            desired.get("t1/r1/ns1").is_some()
        })
        .await;

        let d = desired.get("t1/r1/ns1").unwrap();
        assert_eq!("ns1", d.object.metadata.namespace.as_deref().unwrap());
        assert_eq!(Some("t1"), d.object.label(TENANT_LABEL));
        assert_eq!(Some("r1"), d.object.label(TENANT_RESOURCE_LABEL));
        assert_eq!(json!({"foo": "bar"}), d.object.data["data"]);
        stop.cancel();
    }

    #[tokio::test]
    async fn undecodable_manifests_are_skipped() {
        let stop = CancellationToken::new();
        let tenant_resources = StaticCollection::<Arc<TenantResource>>::new(stop.child_token());
        let tenant_namespaces = StaticCollection::<TenantNamespace>::new(stop.child_token());
        // A manifest which is not an object cannot decode into a dynamic
        // object.
        tenant_resources.update(configmap_resource("bad", json!("not-an-object")));
        tenant_resources.update(configmap_resource(
            "good",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "good"},
                "data": {},
            }),
        ));
        let desired = flat_map(
            tenant_namespaces.clone() as CollectionRef<TenantNamespace>,
            namespace_to_desired_resource(
                tenant_resources.clone() as CollectionRef<Arc<TenantResource>>
            ),
            stop.child_token(),
        );

        tenant_namespaces.update(tenant_namespace("t1", "ns1", &["bad", "good"]));
        eventually("good resource derived", || {
            desired.get("t1/good/ns1").is_some()
        })
        .await;
        assert!(desired.get("t1/bad/ns1").is_none());
        assert_eq!(1, desired.list().len());
        stop.cancel();
    }

    #[tokio::test]
    async fn desired_and_actual_keys_are_symmetric() {
        let stop = CancellationToken::new();
        let tenant_resources = StaticCollection::<Arc<TenantResource>>::new(stop.child_token());
        let tenant_namespaces = StaticCollection::<TenantNamespace>::new(stop.child_token());
        tenant_resources.update(configmap_resource(
            "r1",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "r1"},
                "data": {"foo": "bar"},
            }),
        ));
        let desired = flat_map(
            tenant_namespaces.clone() as CollectionRef<TenantNamespace>,
            namespace_to_desired_resource(
                tenant_resources.clone() as CollectionRef<Arc<TenantResource>>
            ),
            stop.child_token(),
        );
        tenant_namespaces.update(tenant_namespace("t1", "ns1", &["r1"]));
        eventually("desired resource derived", || {
            desired.get("t1/r1/ns1").is_some()
        })
        .await;

        // An object created from the desired manifest keys back to the same
        // entry when observed through a dynamic informer.
        let d = desired.get("t1/r1/ns1").unwrap();
        let observed = ActualTenantResource {
            object: d.object.clone(),
        };
        assert_eq!(d.key(), observed.key());
        stop.cancel();
    }

    #[tokio::test]
    async fn desired_joins_with_actual_per_key() {
        let stop = CancellationToken::new();
        let tenant_resources = StaticCollection::<Arc<TenantResource>>::new(stop.child_token());
        let tenant_namespaces = StaticCollection::<TenantNamespace>::new(stop.child_token());
        tenant_resources.update(configmap_resource(
            "r1",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "r1"},
                "data": {"foo": "bar"},
            }),
        ));
        let desired = flat_map(
            tenant_namespaces.clone() as CollectionRef<TenantNamespace>,
            namespace_to_desired_resource(
                tenant_resources.clone() as CollectionRef<Arc<TenantResource>>
            ),
            stop.child_token(),
        );
        tenant_namespaces.update(tenant_namespace("t1", "ns1", &["r1"]));

        // Stands in for the informer-backed collection of a dynamic
        // informer.
        let observed = StaticCollection::<ActualTenantResource>::new(stop.child_token());
        let joined = join(
            desired.clone(),
            observed.clone() as CollectionRef<ActualTenantResource>,
            JoinKind::Left,
            stop.child_token(),
        );

        eventually("pair appears without actual", || {
            joined.get("t1/r1/ns1").is_some_and(|pair| pair.right.is_none())
        })
        .await;

        let d = desired.get("t1/r1/ns1").unwrap();
        observed.update(ActualTenantResource {
            object: d.object.clone(),
        });
        eventually("pair completed by actual", || {
            joined.get("t1/r1/ns1").is_some_and(|pair| pair.right.is_some())
        })
        .await;

        tenant_namespaces.delete("t1/ns1");
        eventually("pair removed with desired", || {
            joined.get("t1/r1/ns1").is_none()
        })
        .await;
        stop.cancel();
    }

    fn configmap_json(data_foo: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "r1",
                "namespace": "ns1",
                "labels": {
                    "multitenancy.kalexmills.com/tenant": "t1",
                    "multitenancy.kalexmills.com/tenant-resource": "r1",
                },
            },
            "data": {"foo": data_foo},
        })
    }

    fn desired_configmap(data_foo: &str) -> DesiredTenantResource {
        DesiredTenantResource {
            tenant_name: "t1".to_string(),
            namespace: "ns1".to_string(),
            resource_name: "r1".to_string(),
            gvr: GroupVersionResource {
                group: "".to_string(),
                version: "v1".to_string(),
                resource: "configmaps".to_string(),
            },
            object: Unstructured::new(serde_json::from_value(configmap_json(data_foo)).unwrap()),
        }
    }

    fn observed_configmap(data_foo: &str, resource_version: &str) -> ActualTenantResource {
        let mut value = configmap_json(data_foo);
        value["metadata"]["resourceVersion"] = json!(resource_version);
        value["metadata"]["uid"] = json!("7a6c45fd-803e-4a2b-9502-92c87d04d325");
        value["metadata"]["creationTimestamp"] = json!("2024-01-01T00:00:00Z");
        ActualTenantResource {
            object: Unstructured::new(serde_json::from_value(value).unwrap()),
        }
    }

    #[tokio::test]
    async fn update_event_overwrites_drift_with_the_actual_resource_version() {
        let (client, mut handle) = mock_client();
        let desired = desired_configmap("bar");
        let ev = Event {
            event_type: EventType::Update,
            old: Some(Joined {
                left: desired.clone(),
                right: None,
            }),
            new: Some(Joined {
                left: desired,
                right: Some(observed_configmap("zzz", "41")),
            }),
        };

        let driver = tokio::spawn(async move {
            let (method, path, payload) = handle_next(
                &mut handle,
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "r1", "namespace": "ns1", "resourceVersion": "42"},
                }),
            )
            .await;
            assert_eq!("PUT", method);
            assert_eq!("/api/v1/namespaces/ns1/configmaps/r1", path);
            // The desired payload is written against the observed version.
            assert_eq!(payload["metadata"]["resourceVersion"], "41");
            assert_eq!(payload["data"]["foo"], "bar");
        });

        apply_resource_event(client, &ev).await.unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn update_event_is_suppressed_when_actual_matches_desired() {
        let (client, _handle) = mock_client();
        let desired = desired_configmap("bar");
        let ev = Event {
            event_type: EventType::Update,
            old: Some(Joined {
                left: desired.clone(),
                right: None,
            }),
            new: Some(Joined {
                left: desired,
                right: Some(observed_configmap("bar", "41")),
            }),
        };

        // A matching actual must produce no cluster write at all; any
        // request would block on the unanswered mock and trip the timeout.
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            apply_resource_event(client, &ev),
        )
        .await
        .expect("no api request expected")
        .unwrap();
    }

    #[tokio::test]
    async fn add_event_overwrites_existing_object_after_losing_create_race() {
        let (client, mut handle) = mock_client();
        let desired = desired_configmap("bar");
        let ev = Event {
            event_type: EventType::Add,
            old: None,
            new: Some(Joined {
                left: desired,
                right: None,
            }),
        };

        let driver = tokio::spawn(async move {
            let (method, path, _) =
                handle_next(&mut handle, 409, already_exists_status("r1")).await;
            assert_eq!("POST", method);
            assert_eq!("/api/v1/namespaces/ns1/configmaps", path);

            let (method, path, _) = handle_next(
                &mut handle,
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "r1", "namespace": "ns1", "resourceVersion": "13"},
                }),
            )
            .await;
            assert_eq!("GET", method);
            assert_eq!("/api/v1/namespaces/ns1/configmaps/r1", path);

            let (method, path, payload) = handle_next(
                &mut handle,
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "r1", "namespace": "ns1", "resourceVersion": "14"},
                }),
            )
            .await;
            assert_eq!("PUT", method);
            assert_eq!("/api/v1/namespaces/ns1/configmaps/r1", path);
            assert_eq!(payload["metadata"]["resourceVersion"], "13");
            assert_eq!(payload["data"]["foo"], "bar");
        });

        apply_resource_event(client, &ev).await.unwrap();
        driver.await.unwrap();
    }
}
