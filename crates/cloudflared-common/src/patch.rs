//! Scoped merge patching
//!
//! A [`ScopedPatcher`] snapshots an object when it is read and, at commit
//! time, sends only what changed as JSON merge patches (RFC 7386). Top-level
//! sections are split into two groups that are patched independently:
//!
//! - **Main**: every top-level key except `status`, `apiVersion` and `kind`
//! - **Status**: the `status` subresource
//!
//! Fields the caller never touched are absent from the wire payload, so
//! concurrent writers editing other fields are not clobbered. A group with no
//! structural change issues no request at all.

use std::fmt;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::kube_utils::{is_conflict, is_transient};

/// Which group of top-level sections a patch request covers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchScope {
    /// metadata, spec, data and any other non-status section
    Main,
    /// the status subresource
    Status,
}

impl PatchScope {
    fn owns(self, key: &str) -> bool {
        match self {
            PatchScope::Status => key == "status",
            PatchScope::Main => !matches!(key, "status" | "apiVersion" | "kind"),
        }
    }
}

/// Namespace and name of a stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of an existing object
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Errors from committing a scoped patch
#[derive(Debug, Error)]
pub enum PatchError {
    /// The committed object is not the kind the patcher was opened on
    #[error("type mismatch: patcher opened on {expected}, committed {actual}")]
    TypeMismatch {
        /// apiVersion/kind captured at open
        expected: String,
        /// apiVersion/kind of the committed object
        actual: String,
    },

    /// The store rejected the write because the object changed since it was read
    #[error("conflict patching {key}: object changed since it was read")]
    Conflict {
        /// Object that conflicted
        key: String,
    },

    /// Any other store failure
    #[error("failed to patch {key}: {source}")]
    Kube {
        /// Object being patched
        key: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// The object could not be serialized for diffing
    #[error("failed to serialize object for diffing: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Both the main and status patches failed
    #[error("{} patch requests failed: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<PatchError>),
}

fn join_errors(errors: &[PatchError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PatchError {
    /// Check if a later pass can succeed after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            PatchError::TypeMismatch { .. } => false,
            PatchError::Conflict { .. } => true,
            PatchError::Kube { source, .. } => is_transient(source),
            PatchError::Serialization(_) => false,
            PatchError::Aggregate(errors) => errors.iter().any(PatchError::is_retryable),
        }
    }

    /// Check if any part of this error is a write conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            PatchError::Conflict { .. } => true,
            PatchError::Aggregate(errors) => errors.iter().any(PatchError::is_conflict),
            _ => false,
        }
    }
}

/// Store capability used by [`ScopedPatcher`]: apply a merge patch to one scope
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MergePatchApi: Send + Sync {
    /// Apply `patch` as a JSON merge patch to the object or its status subresource
    async fn merge_patch(
        &self,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error>;
}

/// [`MergePatchApi`] over the Kubernetes API for one resource type
pub struct KubeMergePatch {
    client: Client,
    resource: ApiResource,
    field_manager: String,
}

impl KubeMergePatch {
    /// Patch target for the resource type `K`
    pub fn for_resource<K>(client: Client, field_manager: impl Into<String>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            client,
            resource: ApiResource::erase::<K>(&()),
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl MergePatchApi for KubeMergePatch {
    async fn merge_patch(
        &self,
        key: &ObjectKey,
        scope: PatchScope,
        patch: &Value,
    ) -> Result<(), kube::Error> {
        let api = self.api(key);
        let params = PatchParams::apply(&self.field_manager);
        match scope {
            PatchScope::Main => api.patch(&key.name, &params, &Patch::Merge(patch)).await?,
            PatchScope::Status => {
                api.patch_status(&key.name, &params, &Patch::Merge(patch))
                    .await?
            }
        };
        Ok(())
    }
}

/// Snapshot of an object taken at read time, committed as scoped merge patches
#[derive(Clone, Debug)]
pub struct ScopedPatcher {
    key: ObjectKey,
    type_identity: String,
    before: Value,
    optimistic_lock: bool,
}

impl ScopedPatcher {
    /// Capture the object as it was read
    pub fn open<K>(obj: &K) -> Result<Self, PatchError>
    where
        K: Resource + Serialize,
    {
        let before = serde_json::to_value(obj)?;
        Ok(Self {
            key: ObjectKey::of(obj),
            type_identity: type_identity(&before),
            before,
            optimistic_lock: false,
        })
    }

    /// Send the snapshot's resourceVersion with the main patch
    ///
    /// The store then rejects the main patch with a conflict if the object
    /// was written after it was read.
    pub fn with_optimistic_lock(mut self) -> Self {
        self.optimistic_lock = true;
        self
    }

    /// Key of the snapshotted object
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Persist the difference between the snapshot and `obj`
    ///
    /// Returns the scopes that were patched. Both scopes are attempted even if
    /// the first fails; failures are aggregated.
    pub async fn commit<K>(
        &self,
        api: &dyn MergePatchApi,
        obj: &K,
    ) -> Result<Vec<PatchScope>, PatchError>
    where
        K: Serialize,
    {
        let after = serde_json::to_value(obj)?;
        let actual = type_identity(&after);
        if actual != self.type_identity {
            return Err(PatchError::TypeMismatch {
                expected: self.type_identity.clone(),
                actual,
            });
        }

        let mut patched = Vec::new();
        let mut errors = Vec::new();
        for scope in [PatchScope::Main, PatchScope::Status] {
            let Some(patch) = self.scoped_patch(scope, &after) else {
                continue;
            };
            debug!(object = %self.key, ?scope, %patch, "Applying scoped merge patch");
            match api.merge_patch(&self.key, scope, &patch).await {
                Ok(()) => patched.push(scope),
                Err(e) if is_conflict(&e) => errors.push(PatchError::Conflict {
                    key: self.key.to_string(),
                }),
                Err(source) => errors.push(PatchError::Kube {
                    key: self.key.to_string(),
                    source,
                }),
            }
        }

        match errors.len() {
            0 => Ok(patched),
            1 => Err(errors.remove(0)),
            _ => Err(PatchError::Aggregate(errors)),
        }
    }

    fn scoped_patch(&self, scope: PatchScope, after: &Value) -> Option<Value> {
        let mut patch = merge_diff(&section(&self.before, scope), &section(after, scope))?;
        if scope == PatchScope::Main && self.optimistic_lock {
            if let (Some(rv), Value::Object(map)) = (
                self.before.pointer("/metadata/resourceVersion").cloned(),
                &mut patch,
            ) {
                if let Value::Object(meta) = map
                    .entry("metadata")
                    .or_insert_with(|| Value::Object(Map::new()))
                {
                    meta.insert("resourceVersion".to_string(), rv);
                }
            }
        }
        Some(patch)
    }
}

fn type_identity(value: &Value) -> String {
    let field = |name: &str| value.get(name).and_then(Value::as_str).unwrap_or_default();
    format!("{}/{}", field("apiVersion"), field("kind"))
}

fn section(value: &Value, scope: PatchScope) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| scope.owns(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => Value::Object(Map::new()),
    }
}

/// Compute the RFC 7386 merge patch that turns `before` into `after`
///
/// Returns `None` when the two are structurally equal. Removed keys become
/// `null`; arrays and scalars are replaced wholesale.
pub fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for key in b.keys().filter(|k| !a.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, av) in a {
                match b.get(key) {
                    Some(bv) => {
                        if let Some(d) = merge_diff(bv, av) {
                            patch.insert(key.clone(), d);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), av.clone());
                    }
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(after.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{OriginCertReference, Tunnel, TunnelSpec, TunnelStatus};
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("web-config".to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("41".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("config.yaml".to_string(), "tunnel: t-web".to_string()),
                ("extra".to_string(), "keep".to_string()),
            ])),
            ..Default::default()
        }
    }

    fn tunnel() -> Tunnel {
        let mut t = Tunnel::new(
            "web",
            TunnelSpec {
                origin_cert: OriginCertReference::secret("cf-cert"),
                origin_request: None,
                image: None,
                rules: vec![],
            },
        );
        t.metadata.namespace = Some("default".to_string());
        t
    }

    // ==========================================================================
    // merge_diff
    // ==========================================================================

    #[test]
    fn test_merge_diff_equal_values() {
        let v = json!({"a": {"b": [1, 2]}});
        assert_eq!(merge_diff(&v, &v.clone()), None);
    }

    #[test]
    fn test_merge_diff_nested_change_and_removal() {
        let before = json!({"a": {"b": 1, "c": 2}, "d": "x"});
        let after = json!({"a": {"b": 1, "c": 3}, "e": true});
        assert_eq!(
            merge_diff(&before, &after),
            Some(json!({"a": {"c": 3}, "d": null, "e": true}))
        );
    }

    #[test]
    fn test_merge_diff_replaces_arrays_wholesale() {
        let before = json!({"finalizers": ["a"]});
        let after = json!({"finalizers": ["a", "b"]});
        assert_eq!(
            merge_diff(&before, &after),
            Some(json!({"finalizers": ["a", "b"]}))
        );
    }

    // ==========================================================================
    // Story Tests: Scoped commits
    // ==========================================================================

    /// Story: A pass that changes nothing talks to nobody
    ///
    /// The committed object is a fresh clone, not the same reference, and must
    /// still be recognized as unchanged.
    #[tokio::test]
    async fn story_structurally_equal_commit_issues_no_requests() {
        let cm = config_map();
        let patcher = ScopedPatcher::open(&cm).unwrap();

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch().times(0);

        let scopes = patcher.commit(&api, &cm.clone()).await.unwrap();
        assert!(scopes.is_empty());
    }

    /// Story: Only the edited key goes over the wire
    ///
    /// A concurrent writer that changed `extra` after our read keeps its edit
    /// because the payload never mentions `extra`.
    #[tokio::test]
    async fn story_main_patch_carries_only_changed_fields() {
        let cm = config_map();
        let patcher = ScopedPatcher::open(&cm).unwrap();

        let mut edited = cm.clone();
        edited
            .data
            .as_mut()
            .unwrap()
            .insert("config.yaml".to_string(), "tunnel: t-web2".to_string());

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch()
            .withf(|key, scope, patch| {
                key.name == "web-config"
                    && *scope == PatchScope::Main
                    && *patch == json!({"data": {"config.yaml": "tunnel: t-web2"}})
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let scopes = patcher.commit(&api, &edited).await.unwrap();
        assert_eq!(scopes, vec![PatchScope::Main]);
    }

    /// Story: Status changes go to the status subresource alone
    #[tokio::test]
    async fn story_status_only_change_patches_status_scope() {
        let t = tunnel();
        let patcher = ScopedPatcher::open(&t).unwrap();

        let mut edited = t.clone();
        edited.status = Some(TunnelStatus {
            zone: Some("example.com".to_string()),
            ..Default::default()
        });

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch()
            .withf(|_, scope, patch| {
                *scope == PatchScope::Status
                    && *patch == json!({"status": {"zone": "example.com"}})
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let scopes = patcher.commit(&api, &edited).await.unwrap();
        assert_eq!(scopes, vec![PatchScope::Status]);
    }

    /// Story: A failed main patch does not stop the status patch
    #[tokio::test]
    async fn story_status_patch_attempted_after_main_failure() {
        let t = tunnel();
        let patcher = ScopedPatcher::open(&t).unwrap();

        let mut edited = t.clone();
        edited.metadata.finalizers = Some(vec!["x/y".to_string()]);
        edited.status = Some(TunnelStatus {
            routes: vec!["a.example.com".to_string()],
            ..Default::default()
        });

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch()
            .withf(|_, scope, _| *scope == PatchScope::Main)
            .times(1)
            .returning(|_, _, _| Err(api_error(500)));
        api.expect_merge_patch()
            .withf(|_, scope, _| *scope == PatchScope::Status)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let err = patcher.commit(&api, &edited).await.unwrap_err();
        assert!(matches!(err, PatchError::Kube { .. }));
        assert!(err.is_retryable());
    }

    /// Story: When both scopes fail the caller sees both failures
    #[tokio::test]
    async fn story_both_failures_are_aggregated() {
        let t = tunnel();
        let patcher = ScopedPatcher::open(&t).unwrap();

        let mut edited = t.clone();
        edited.metadata.finalizers = Some(vec!["x/y".to_string()]);
        edited.status = Some(TunnelStatus {
            zone: Some("example.com".to_string()),
            ..Default::default()
        });

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch()
            .withf(|_, scope, _| *scope == PatchScope::Main)
            .times(1)
            .returning(|_, _, _| Err(api_error(409)));
        api.expect_merge_patch()
            .withf(|_, scope, _| *scope == PatchScope::Status)
            .times(1)
            .returning(|_, _, _| Err(api_error(422)));

        match patcher.commit(&api, &edited).await.unwrap_err() {
            PatchError::Aggregate(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], PatchError::Conflict { .. }));
                assert!(matches!(errors[1], PatchError::Kube { .. }));
            }
            other => panic!("Expected Aggregate, got {other:?}"),
        }
    }

    /// Story: Committing a different kind is a programming error
    #[tokio::test]
    async fn story_type_mismatch_rejected_before_any_request() {
        let patcher = ScopedPatcher::open(&config_map()).unwrap();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("web-config".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch().times(0);

        let err = patcher.commit(&api, &secret).await.unwrap_err();
        match err {
            PatchError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, "v1/ConfigMap");
                assert_eq!(actual, "v1/Secret");
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    /// Story: Optimistic locking pins the main patch to the version read
    #[tokio::test]
    async fn story_optimistic_lock_sends_resource_version() {
        let cm = config_map();
        let patcher = ScopedPatcher::open(&cm).unwrap().with_optimistic_lock();

        let mut edited = cm.clone();
        edited.data.as_mut().unwrap().remove("extra");

        let mut api = MockMergePatchApi::new();
        api.expect_merge_patch()
            .withf(|_, _, patch| {
                *patch
                    == json!({
                        "data": {"extra": null},
                        "metadata": {"resourceVersion": "41"}
                    })
            })
            .times(1)
            .returning(|_, _, _| Err(api_error(409)));

        let err = patcher.commit(&api, &edited).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::of(&config_map()).to_string(), "default/web-config");
        let key = ObjectKey {
            namespace: None,
            name: "cluster-wide".to_string(),
        };
        assert_eq!(key.to_string(), "cluster-wide");
    }
}
