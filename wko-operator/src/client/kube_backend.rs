//! [`ApiBackend`] backed by a live Kubernetes API server.

use super::{ApiBackend, ApiFuture};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde_json::Value;
use wko_core::ApiError;

/// Backend using `kube::Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    /// Create a backend over a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

/// Translate a kube client error into an [`ApiError`].
pub(crate) fn map_kube_error(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(response) => {
            ApiError::status(response.code, response.reason, response.message)
        }
        other => ApiError::transport(other.to_string()),
    }
}

fn to_value(object: DynamicObject) -> Result<Value, ApiError> {
    serde_json::to_value(object).map_err(|e| ApiError::transport(e.to_string()))
}

fn from_value(object: Value) -> Result<DynamicObject, ApiError> {
    serde_json::from_value(object)
        .map_err(|e| ApiError::status(422, "Invalid", format!("cannot encode object: {}", e)))
}

impl ApiBackend for KubeBackend {
    fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, Value> {
        let api = self.api(resource, namespace);
        let name = name.to_string();
        Box::pin(async move {
            let object = api.get(&name).await.map_err(map_kube_error)?;
            to_value(object)
        })
    }

    fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> ApiFuture<'_, Vec<Value>> {
        let api = self.api(resource, namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Box::pin(async move {
            let list = api.list(&params).await.map_err(map_kube_error)?;
            list.items.into_iter().map(to_value).collect()
        })
    }

    fn create(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: Value,
    ) -> ApiFuture<'_, Value> {
        let api = self.api(resource, namespace);
        Box::pin(async move {
            let object = from_value(object)?;
            let created = api
                .create(&PostParams::default(), &object)
                .await
                .map_err(map_kube_error)?;
            to_value(created)
        })
    }

    fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> ApiFuture<'_, Value> {
        let api = self.api(resource, namespace);
        let name = name.to_string();
        Box::pin(async move {
            let object = from_value(object)?;
            let replaced = api
                .replace(&name, &PostParams::default(), &object)
                .await
                .map_err(map_kube_error)?;
            to_value(replaced)
        })
    }

    fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value> {
        let api = self.api(resource, namespace);
        let name = name.to_string();
        Box::pin(async move {
            let patched = api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(map_kube_error)?;
            to_value(patched)
        })
    }

    fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value> {
        let api = self.api(resource, namespace);
        let name = name.to_string();
        Box::pin(async move {
            let patched = api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(map_kube_error)?;
            to_value(patched)
        })
    }

    fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, ()> {
        let api = self.api(resource, namespace);
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default())
                .await
                .map_err(map_kube_error)?;
            Ok(())
        })
    }
}
