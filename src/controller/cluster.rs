//! Access to the cluster store
//!
//! The controllers only talk to the API server through the [`Cluster`]
//! trait. [`KubeCluster`] is the production implementation; unit tests use
//! an in-memory fake.
//!
//! Status writes carry the `resourceVersion` that was read, so a concurrent
//! writer makes the API server answer 409 instead of being overwritten.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{NodeReplacement, NodeRollout};
use crate::error::{Error, Result};

/// Namespace that receives events about cluster-scoped objects
const EVENT_NAMESPACE: &str = "default";

/// Field manager name used on writes
pub const FIELD_MANAGER: &str = "node-rollout-operator";

/// What happened to an eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The API server accepted the eviction
    Evicted,
    /// The pod no longer exists
    Gone,
    /// The eviction was refused for now, typically by a PodDisruptionBudget
    Blocked,
}

/// The operations the controllers need from the cluster
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Fetch a node by name, `None` when it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// List nodes matching a label selector in API server syntax
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;

    /// Write a node back, guarded by its resourceVersion
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    /// List every pod bound to the named node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Request graceful eviction of a pod
    async fn evict_pod(&self, pod: &Pod, grace_period: Duration) -> Result<EvictionOutcome>;

    /// Delete a pod immediately, bypassing its termination grace period
    async fn force_delete_pod(&self, pod: &Pod) -> Result<()>;

    async fn list_replacements(&self) -> Result<Vec<NodeReplacement>>;

    async fn create_replacement(&self, replacement: &NodeReplacement) -> Result<NodeReplacement>;

    /// Write the status of a replacement, guarded by its resourceVersion
    async fn replace_replacement_status(
        &self,
        replacement: &NodeReplacement,
    ) -> Result<NodeReplacement>;

    /// Write the status of a rollout, guarded by its resourceVersion
    async fn replace_rollout_status(&self, rollout: &NodeRollout) -> Result<NodeRollout>;

    /// Delete a rollout; owned replacements are garbage-collected by the API server
    async fn delete_rollout(&self, name: &str) -> Result<()>;

    /// Publish a Kubernetes Event about `involved`
    async fn publish_event(
        &self,
        involved: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`Cluster`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Whole seconds of `grace_period`, saturating at what the API accepts
fn grace_period_seconds(grace_period: Duration) -> u32 {
    u32::try_from(grace_period.as_secs()).unwrap_or(u32::MAX)
}

/// Build the merge patch for a status write, pinned to the observed resourceVersion
fn status_patch<S: serde::Serialize>(
    resource_version: Option<String>,
    status: &S,
) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": serde_json::to_value(status)?,
    }))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(nodes.items)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api
            .replace(&node.name_any(), &PostParams::default(), node)
            .await?)
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let pods = api
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await?;
        Ok(pods.items)
    }

    async fn evict_pod(&self, pod: &Pod, grace_period: Duration) -> Result<EvictionOutcome> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_period_seconds(grace_period)),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.evict(&name, &params).await {
            Ok(_) => Ok(EvictionOutcome::Evicted),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(EvictionOutcome::Gone),
            Err(kube::Error::Api(e)) if e.code == 429 || e.code == 409 => {
                debug!("Eviction of {}/{} refused: {}", namespace, name, e.message);
                Ok(EvictionOutcome::Blocked)
            }
            Err(kube::Error::Api(e)) if (400..500).contains(&e.code) => Err(Error::EvictionFailed {
                pod: format!("{}/{}", namespace, name),
                message: e.message,
            }),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn force_delete_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };

        match api.delete(&pod.name_any(), &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list_replacements(&self) -> Result<Vec<NodeReplacement>> {
        let api: Api<NodeReplacement> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_replacement(&self, replacement: &NodeReplacement) -> Result<NodeReplacement> {
        let api: Api<NodeReplacement> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), replacement).await?)
    }

    async fn replace_replacement_status(
        &self,
        replacement: &NodeReplacement,
    ) -> Result<NodeReplacement> {
        let api: Api<NodeReplacement> = Api::all(self.client.clone());
        let patch = status_patch(replacement.resource_version(), &replacement.status)?;
        api.patch_status(
            &replacement.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::StatusUpdateError)
    }

    async fn replace_rollout_status(&self, rollout: &NodeRollout) -> Result<NodeRollout> {
        let api: Api<NodeRollout> = Api::all(self.client.clone());
        let patch = status_patch(rollout.resource_version(), &rollout.status)?;
        api.patch_status(
            &rollout.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(Error::StatusUpdateError)
    }

    async fn delete_rollout(&self, name: &str) -> Result<()> {
        let api: Api<NodeRollout> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn publish_event(
        &self,
        involved: ObjectReference,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), EVENT_NAMESPACE);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!(
                    "{}-",
                    involved.name.clone().unwrap_or_else(|| "node-rollout".to_string())
                )),
                namespace: Some(EVENT_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: involved,
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// Publish an event, logging instead of failing when it cannot be written
pub async fn emit_event(
    cluster: &dyn Cluster,
    involved: ObjectReference,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    if let Err(e) = cluster
        .publish_event(involved, event_type, reason, message)
        .await
    {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}

/// Render a label selector in the syntax the API server accepts in `labelSelector=`
///
/// Unknown operators are rejected rather than skipped, since dropping a term
/// would make the selector match more nodes.
pub fn selector_string(selector: &LabelSelector) -> Result<String> {
    let mut terms = Vec::new();

    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            terms.push(format!("{}={}", key, value));
        }
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.clone().unwrap_or_default();
        let term = match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::InvalidSelector(format!(
                    "operator {} on key {} needs at least one value",
                    expr.operator, expr.key
                )));
            }
            "In" => format!("{} in ({})", expr.key, values.join(",")),
            "NotIn" => format!("{} notin ({})", expr.key, values.join(",")),
            "Exists" => expr.key.clone(),
            "DoesNotExist" => format!("!{}", expr.key),
            other => {
                return Err(Error::InvalidSelector(format!(
                    "unknown operator {:?} on key {}",
                    other, expr.key
                )));
            }
        };
        terms.push(term);
    }

    Ok(terms.join(","))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    use super::*;

    #[test]
    fn test_selector_string_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("role".to_string(), "worker".to_string()),
                ("zone".to_string(), "a".to_string()),
            ])),
            ..Default::default()
        };
        assert_eq!(selector_string(&selector).unwrap(), "role=worker,zone=a");
    }

    #[test]
    fn test_selector_string_expressions() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "zone".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["a".to_string(), "b".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "NotIn".to_string(),
                    values: Some(vec!["gpu".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "spot".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
                LabelSelectorRequirement {
                    key: "ready".to_string(),
                    operator: "Exists".to_string(),
                    values: None,
                },
            ]),
        };
        assert_eq!(
            selector_string(&selector).unwrap(),
            "zone in (a,b),tier notin (gpu),!spot,ready"
        );
    }

    #[test]
    fn test_selector_string_rejects_unknown_operator() {
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "role".to_string(),
                operator: "in".to_string(),
                values: Some(vec!["worker".to_string()]),
            }]),
        };
        let err = selector_string(&selector).unwrap_err();
        assert!(matches!(err, Error::InvalidSelector(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_selector_string_rejects_in_without_values() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("zone".to_string(), "a".to_string())])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "role".to_string(),
                operator: "In".to_string(),
                values: Some(vec![]),
            }]),
        };
        assert!(matches!(
            selector_string(&selector),
            Err(Error::InvalidSelector(_))
        ));
    }

    #[test]
    fn test_grace_period_saturates() {
        assert_eq!(grace_period_seconds(Duration::from_secs(30)), 30);
        assert_eq!(
            grace_period_seconds(Duration::from_secs(u64::from(u32::MAX) + 10)),
            u32::MAX
        );
    }

    #[test]
    fn test_status_patch_pins_resource_version() {
        let patch = status_patch(Some("42".to_string()), &serde_json::json!({"phase": "New"})).unwrap();
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["status"]["phase"], "New");
    }
}
