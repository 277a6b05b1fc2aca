/**
 * Kubernetes-backed remote client
 *
 * Implements the mirror's remote boundary over the low-level list/watch api
 * using dynamically-typed objects, so one implementation serves every
 * resource kind the mirror is asked to track.
 */
use crate::error::Result;
use crate::mirror::{EventStream, RemoteClient, RemoteEvent, ResourceList};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::Client;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::core::TypeMeta;

/// Remote client for one resource kind, cluster- or namespace-scoped
pub struct KubeRemote {
    api: Api<DynamicObject>,
}

impl KubeRemote {
    #[must_use]
    pub fn all(client: Client, resource: &ApiResource) -> Self {
        Self {
            api: Api::all_with(client, resource),
        }
    }

    #[must_use]
    pub fn namespaced(client: Client, namespace: &str, resource: &ApiResource) -> Self {
        Self {
            api: Api::namespaced_with(client, namespace, resource),
        }
    }
}

#[async_trait]
impl RemoteClient<DynamicObject> for KubeRemote {
    async fn list(&self) -> Result<ResourceList<DynamicObject>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(ResourceList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
        timeout_seconds: Option<u32>,
    ) -> Result<EventStream<DynamicObject>> {
        let mut params = WatchParams::default();
        if let Some(timeout) = timeout_seconds {
            params = params.timeout(timeout);
        }

        let stream = self.api.watch(&params, resource_version).await?;
        Ok(stream
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::Added(object)) => Some(Ok(RemoteEvent::Added(object))),
                    Ok(WatchEvent::Modified(object)) => Some(Ok(RemoteEvent::Modified(object))),
                    Ok(WatchEvent::Deleted(object)) => Some(Ok(RemoteEvent::Deleted(object))),
                    // Bookmarks carry no object state the cache needs
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(e)) => Some(Ok(RemoteEvent::Error(e.to_string()))),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed())
    }
}

/// Normalizer that fills in group/version/kind when absent
///
/// List responses carry type metadata but watch responses may not, and
/// downstream authorization checks rely on it, so every object is normalized
/// before keying regardless of which path delivered it.
#[must_use]
pub fn type_normalizer(resource: &ApiResource) -> impl Fn(&mut DynamicObject) + Clone + use<> {
    let type_meta = TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    };
    move |object: &mut DynamicObject| {
        let missing = object
            .types
            .as_ref()
            .is_none_or(|t| t.kind.is_empty() || t.api_version.is_empty());
        if missing {
            object.types = Some(type_meta.clone());
        }
    }
}

/// Primary identity key: `Kind/namespace/name`
///
/// Cluster-scoped objects key under the `_cluster` pseudo-namespace. Objects
/// without a kind or name cannot be keyed.
#[must_use]
pub fn object_key(object: &DynamicObject) -> Option<String> {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .filter(|kind| !kind.is_empty())?;
    let name = object.metadata.name.as_deref()?;
    let namespace = object.metadata.namespace.as_deref().unwrap_or("_cluster");
    Some(format!("{kind}/{namespace}/{name}"))
}

/// Secondary key grouping every kind under its namespace
#[must_use]
pub fn namespace_key(object: &DynamicObject) -> Option<String> {
    let kind = object
        .types
        .as_ref()
        .map(|t| t.kind.as_str())
        .filter(|kind| !kind.is_empty())?;
    let name = object.metadata.name.as_deref()?;
    let namespace = object.metadata.namespace.as_deref()?;
    Some(format!("{namespace}/{kind}/{name}"))
}

/// Api descriptors for the kinds the mirror binary tracks out of the box
#[must_use]
pub fn api_resource_for(kind: &str) -> Option<ApiResource> {
    match kind {
        "Pod" => Some(ApiResource::erase::<Pod>(&())),
        "ReplicaSet" => Some(ApiResource::erase::<ReplicaSet>(&())),
        "Event" => Some(ApiResource::erase::<Event>(&())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_object(name: &str, namespace: Option<&str>) -> DynamicObject {
        let resource = api_resource_for("Pod").unwrap();
        let object = DynamicObject::new(name, &resource);
        match namespace {
            Some(ns) => object.within(ns),
            None => object,
        }
    }

    #[test]
    fn test_object_key_includes_kind_and_namespace() {
        let object = pod_object("web-0", Some("prod"));
        assert_eq!(object_key(&object).unwrap(), "Pod/prod/web-0");
    }

    #[test]
    fn test_object_key_cluster_scoped() {
        let object = pod_object("web-0", None);
        assert_eq!(object_key(&object).unwrap(), "Pod/_cluster/web-0");
    }

    #[test]
    fn test_object_key_requires_type_metadata() {
        let mut object = pod_object("web-0", Some("prod"));
        object.types = None;
        assert!(object_key(&object).is_none());
    }

    #[test]
    fn test_namespace_key_requires_namespace() {
        let object = pod_object("web-0", None);
        assert!(namespace_key(&object).is_none());

        let object = pod_object("web-0", Some("prod"));
        assert_eq!(namespace_key(&object).unwrap(), "prod/Pod/web-0");
    }

    #[test]
    fn test_type_normalizer_fills_missing_types_only() {
        let resource = api_resource_for("Pod").unwrap();
        let normalize = type_normalizer(&resource);

        let mut object = pod_object("web-0", Some("prod"));
        object.types = None;
        normalize(&mut object);
        let types = object.types.unwrap();
        assert_eq!(types.kind, "Pod");
        assert_eq!(types.api_version, "v1");

        // Already-typed objects are left alone
        let mut typed = pod_object("web-0", Some("prod"));
        typed.types = Some(TypeMeta {
            api_version: "v2".to_string(),
            kind: "Pod".to_string(),
        });
        normalize(&mut typed);
        assert_eq!(typed.types.unwrap().api_version, "v2");
    }

    #[test]
    fn test_api_resource_for_unknown_kind() {
        assert!(api_resource_for("Gateway").is_none());
    }
}
