//! Cluster tools backed by the Kubernetes REST API

use super::{parse_args, Tool, ToolContext, ToolError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const MAX_RESOURCE_CHARS: usize = 8000;
const DEFAULT_NAMESPACE: &str = "default";

/// Where a resource kind lives in the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KindInfo {
    group_path: &'static str,
    plural: &'static str,
    namespaced: bool,
}

impl KindInfo {
    const fn new(group_path: &'static str, plural: &'static str, namespaced: bool) -> Self {
        Self {
            group_path,
            plural,
            namespaced,
        }
    }
}

/// Resolve singular, plural or short kind names
fn resolve_kind(kind: &str) -> Option<KindInfo> {
    let info = match kind.trim().to_ascii_lowercase().as_str() {
        "pod" | "pods" | "po" => KindInfo::new("api/v1", "pods", true),
        "service" | "services" | "svc" => KindInfo::new("api/v1", "services", true),
        "configmap" | "configmaps" | "cm" => KindInfo::new("api/v1", "configmaps", true),
        "event" | "events" | "ev" => KindInfo::new("api/v1", "events", true),
        "persistentvolumeclaim" | "persistentvolumeclaims" | "pvc" => {
            KindInfo::new("api/v1", "persistentvolumeclaims", true)
        }
        "namespace" | "namespaces" | "ns" => KindInfo::new("api/v1", "namespaces", false),
        "node" | "nodes" | "no" => KindInfo::new("api/v1", "nodes", false),
        "deployment" | "deployments" | "deploy" => KindInfo::new("apis/apps/v1", "deployments", true),
        "statefulset" | "statefulsets" | "sts" => KindInfo::new("apis/apps/v1", "statefulsets", true),
        "daemonset" | "daemonsets" | "ds" => KindInfo::new("apis/apps/v1", "daemonsets", true),
        "replicaset" | "replicasets" | "rs" => KindInfo::new("apis/apps/v1", "replicasets", true),
        "job" | "jobs" => KindInfo::new("apis/batch/v1", "jobs", true),
        "cronjob" | "cronjobs" | "cj" => KindInfo::new("apis/batch/v1", "cronjobs", true),
        "ingress" | "ingresses" | "ing" => {
            KindInfo::new("apis/networking.k8s.io/v1", "ingresses", true)
        }
        _ => return None,
    };
    Some(info)
}

fn unsupported_kind(kind: &str) -> ToolError {
    ToolError::InvalidArguments(format!(
        "unsupported kind '{kind}'. Supported: pods, services, configmaps, events, persistentvolumeclaims, namespaces, nodes, deployments, statefulsets, daemonsets, replicasets, jobs, cronjobs, ingresses"
    ))
}

/// Collection path for a kind. A namespaced kind without a namespace lists
/// across all namespaces.
fn collection_path(info: KindInfo, namespace: Option<&str>) -> String {
    match namespace.filter(|ns| info.namespaced && !ns.is_empty()) {
        Some(ns) => format!("/{}/namespaces/{ns}/{}", info.group_path, info.plural),
        None => format!("/{}/{}", info.group_path, info.plural),
    }
}

fn object_path(info: KindInfo, name: &str, namespace: Option<&str>) -> String {
    let namespace = if info.namespaced {
        Some(namespace.filter(|ns| !ns.is_empty()).unwrap_or(DEFAULT_NAMESPACE))
    } else {
        None
    };
    format!("{}/{name}", collection_path(info, namespace))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("\n... (truncated)");
    out
}

/// Thin client for the cluster API server
#[derive(Debug, Clone)]
pub struct ClusterClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ClusterClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default cluster HTTP client");
                Client::new()
            });

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, ctx: &ToolContext) -> Result<Value, ToolError> {
        let request = self.authorize(request);
        let response = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            r = request.send() => r.map_err(|e| ToolError::Failed(format!("cluster request failed: {e}")))?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            b = response.text() => b.map_err(|e| ToolError::Failed(format!("failed to read cluster response: {e}")))?,
        };

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(String::from))
                .unwrap_or(body);
            return Err(ToolError::Failed(format!(
                "cluster returned {}: {message}",
                status.as_u16()
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| ToolError::Failed(format!("invalid cluster response: {e}")))
    }

    async fn get(&self, path: &str, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        self.send(self.http.get(url), ctx).await
    }

    async fn merge_patch(&self, path: &str, body: &Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        let request = self
            .http
            .patch(url)
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .body(body.to_string());
        self.send(request, ctx).await
    }
}

#[derive(Debug, Deserialize)]
struct ListInput {
    kind: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// Lists resource names of one kind
pub struct ListResourcesTool {
    client: Arc<ClusterClient>,
}

impl ListResourcesTool {
    pub fn new(client: Arc<ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for ListResourcesTool {
    fn name(&self) -> &'static str {
        "list_resources"
    }

    fn description(&self) -> String {
        "List the names of cluster resources of one kind (pods, deployments, services, nodes, ...). Omit namespace to list across all namespaces.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["kind"],
            "properties": {
                "kind": {"type": "string", "description": "Resource kind, e.g. pods or deployments"},
                "namespace": {"type": "string", "description": "Namespace to list in"}
            }
        })
    }

    async fn run(&self, arguments: &str, ctx: ToolContext) -> Result<String, ToolError> {
        let input: ListInput = parse_args(arguments)?;
        let info = resolve_kind(&input.kind).ok_or_else(|| unsupported_kind(&input.kind))?;
        let path = collection_path(info, input.namespace.as_deref());

        let list = self.client.get(&path, &ctx).await?;
        let names: Vec<String> = list["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item["metadata"]["name"].as_str()?;
                        Some(match item["metadata"]["namespace"].as_str() {
                            Some(ns) if input.namespace.is_none() => format!("{ns}/{name}"),
                            _ => name.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        if names.is_empty() {
            return Ok(format!("No {} found.", info.plural));
        }
        Ok(names.join(", "))
    }
}

#[derive(Debug, Deserialize)]
struct GetInput {
    kind: String,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// Fetches one resource as JSON
pub struct GetResourceTool {
    client: Arc<ClusterClient>,
}

impl GetResourceTool {
    pub fn new(client: Arc<ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for GetResourceTool {
    fn name(&self) -> &'static str {
        "get_resource"
    }

    fn description(&self) -> String {
        "Fetch a single cluster resource as JSON, including its spec and status. Namespaced kinds default to the 'default' namespace.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["kind", "name"],
            "properties": {
                "kind": {"type": "string", "description": "Resource kind, e.g. pod"},
                "name": {"type": "string", "description": "Resource name"},
                "namespace": {"type": "string", "description": "Namespace of the resource"}
            }
        })
    }

    async fn run(&self, arguments: &str, ctx: ToolContext) -> Result<String, ToolError> {
        let input: GetInput = parse_args(arguments)?;
        let info = resolve_kind(&input.kind).ok_or_else(|| unsupported_kind(&input.kind))?;
        let path = object_path(info, &input.name, input.namespace.as_deref());

        let mut resource = self.client.get(&path, &ctx).await?;
        if let Some(metadata) = resource["metadata"].as_object_mut() {
            metadata.remove("managedFields");
        }

        let text = serde_json::to_string_pretty(&resource)
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(truncate_chars(&text, MAX_RESOURCE_CHARS))
    }
}

#[derive(Debug, Deserialize)]
struct ScaleInput {
    replicas: u32,
}

/// Scales the workload bound to the conversation. Mutating.
pub struct ScaleWorkloadTool {
    client: Arc<ClusterClient>,
}

impl ScaleWorkloadTool {
    pub fn new(client: Arc<ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for ScaleWorkloadTool {
    fn name(&self) -> &'static str {
        "scale_workload"
    }

    fn description(&self) -> String {
        "Change the replica count of the Deployment or StatefulSet the user is viewing. This modifies the cluster; confirm intent with the user first.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["replicas"],
            "properties": {
                "replicas": {"type": "integer", "minimum": 0, "description": "Desired replica count"}
            }
        })
    }

    async fn run(&self, arguments: &str, ctx: ToolContext) -> Result<String, ToolError> {
        let input: ScaleInput = parse_args(arguments)?;
        let target = &ctx.resource;
        if !target.is_scalable() {
            return Err(ToolError::Failed(
                "no scalable workload is bound to this conversation".to_string(),
            ));
        }
        let info = resolve_kind(&target.kind).ok_or_else(|| unsupported_kind(&target.kind))?;
        let path = format!(
            "{}/scale",
            object_path(info, &target.name, Some(target.namespace.as_str()))
        );

        let patch = json!({"spec": {"replicas": input.replicas}});
        self.client.merge_patch(&path, &patch, &ctx).await?;

        tracing::info!(
            session_id = %ctx.session_id,
            kind = %info.plural,
            name = %target.name,
            replicas = input.replicas,
            "Scaled workload"
        );
        Ok(format!(
            "Scaled {}/{} to {} replicas.",
            info.plural, target.name, input.replicas
        ))
    }
}
