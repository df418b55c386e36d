//! Cluster API seam.
//!
//! Steps talk to the cluster through [`ClusterClient`], a typed facade over an
//! [`ApiBackend`]. The backend works on untyped JSON objects addressed by a
//! [`ApiResource`], which keeps it object-safe and lets the same steps run
//! against the real API server ([`KubeBackend`]) or the in-memory
//! [`FakeCluster`](crate::testing::FakeCluster).
//!
//! Every backend failure is reported as an [`ApiError`] so the retry policy
//! can classify it.

mod kube_backend;

pub use kube_backend::KubeBackend;

use kube::api::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use wko_core::ApiError;

/// A boxed future for backend calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Untyped cluster API operations.
///
/// An empty `namespace` addresses a cluster-scoped object.
pub trait ApiBackend: Send + Sync {
    /// Read an object.
    fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, Value>;

    /// List objects, optionally filtered by a label selector.
    fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> ApiFuture<'_, Vec<Value>>;

    /// Create an object. Fails with 409 if it already exists.
    fn create(&self, resource: &ApiResource, namespace: &str, object: Value)
        -> ApiFuture<'_, Value>;

    /// Replace an object. Fails with 409 if `metadata.resourceVersion` is stale.
    fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> ApiFuture<'_, Value>;

    /// Apply a JSON merge patch.
    fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value>;

    /// Apply a JSON merge patch to the status subresource.
    fn patch_status(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ApiFuture<'_, Value>;

    /// Delete an object.
    fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> ApiFuture<'_, ()>;
}

/// Resources usable through the typed client.
pub trait TypedResource:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<K> TypedResource for K where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

/// The [`ApiResource`] describing `K`.
pub fn api_resource<K: TypedResource>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Typed facade over an [`ApiBackend`].
#[derive(Clone)]
pub struct ClusterClient {
    backend: Arc<dyn ApiBackend>,
}

impl ClusterClient {
    /// Create a client over a backend.
    pub fn new(backend: Arc<dyn ApiBackend>) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn ApiBackend> {
        &self.backend
    }

    /// Read an object.
    pub async fn get<K: TypedResource>(&self, namespace: &str, name: &str) -> Result<K, ApiError> {
        let value = self
            .backend
            .get(&api_resource::<K>(), namespace, name)
            .await?;
        decode(value)
    }

    /// Read an object, mapping 404 to `None`.
    pub async fn get_opt<K: TypedResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ApiError> {
        match self.get::<K>(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List objects.
    pub async fn list<K: TypedResource>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>, ApiError> {
        let values = self
            .backend
            .list(&api_resource::<K>(), namespace, label_selector)
            .await?;
        values.into_iter().map(decode).collect()
    }

    /// Create an object.
    pub async fn create<K: TypedResource>(&self, namespace: &str, object: &K) -> Result<K, ApiError> {
        let value = self
            .backend
            .create(&api_resource::<K>(), namespace, encode(object)?)
            .await?;
        decode(value)
    }

    /// Replace an object. The object must carry the resource version it was read at.
    pub async fn replace<K: TypedResource>(
        &self,
        namespace: &str,
        name: &str,
        object: &K,
    ) -> Result<K, ApiError> {
        let value = self
            .backend
            .replace(&api_resource::<K>(), namespace, name, encode(object)?)
            .await?;
        decode(value)
    }

    /// Apply a JSON merge patch.
    pub async fn merge_patch<K: TypedResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ApiError> {
        let value = self
            .backend
            .patch(&api_resource::<K>(), namespace, name, patch.clone())
            .await?;
        decode(value)
    }

    /// Apply a JSON merge patch to the status subresource.
    pub async fn patch_status<K: TypedResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, ApiError> {
        let value = self
            .backend
            .patch_status(&api_resource::<K>(), namespace, name, patch.clone())
            .await?;
        decode(value)
    }

    /// Delete an object.
    pub async fn delete<K: TypedResource>(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.backend
            .delete(&api_resource::<K>(), namespace, name)
            .await
    }

    /// Delete an object, treating 404 as success. Returns whether it existed.
    pub async fn delete_if_exists<K: TypedResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ApiError> {
        match self.delete::<K>(namespace, name).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn encode<K: Serialize>(object: &K) -> Result<Value, ApiError> {
    serde_json::to_value(object)
        .map_err(|e| ApiError::status(422, "Invalid", format!("cannot encode object: {}", e)))
}

fn decode<K: DeserializeOwned>(value: Value) -> Result<K, ApiError> {
    serde_json::from_value(value)
        .map_err(|e| ApiError::status(422, "Invalid", format!("cannot decode object: {}", e)))
}
