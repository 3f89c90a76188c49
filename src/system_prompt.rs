//! System prompt construction from the dashboard context
//!
//! The prompt describes the assistant's role, which capabilities are wired up
//! for this request, and the resource the user is looking at.

use crate::tools::ResourceContext;
use std::fmt::Write;

/// Base system prompt establishing the assistant's role
const BASE_PROMPT: &str = r"You are a Kubernetes assistant embedded in a cluster dashboard. Help the user understand and operate their cluster.

Be concise. Prefer inspecting the cluster with tools over guessing, and say briefly what you are checking. When a tool fails, read the error and decide whether another approach can work.";

const NO_CLUSTER_NOTE: &str = r"

No cluster connection is configured for this session, so you cannot inspect live resources. Answer from general Kubernetes knowledge and say so.";

const MUTATION_NOTE: &str = r"

You can change the replica count of the bound workload with scale_workload. Only do so when the user has clearly asked for it.";

/// Build the system prompt for one request.
///
/// `tool_names` is the advertised tool set, in registration order.
pub fn build_system_prompt(resource: &ResourceContext, tool_names: &[&str]) -> String {
    let mut prompt = BASE_PROMPT.to_string();

    if !tool_names.contains(&"list_resources") {
        prompt.push_str(NO_CLUSTER_NOTE);
    }
    if tool_names.contains(&"scale_workload") {
        prompt.push_str(MUTATION_NOTE);
    }

    if !resource.is_empty() {
        prompt.push_str("\n\n<dashboard_context>\n");
        for (label, value) in [
            ("Page", &resource.route),
            ("Kind", &resource.kind),
            ("Name", &resource.name),
            ("Namespace", &resource.namespace),
        ] {
            if !value.is_empty() {
                let _ = writeln!(prompt, "{label}: {value}");
            }
        }
        prompt.push_str("</dashboard_context>\n\nWhen the user says \"this\" or \"it\", they most likely mean the resource above.");
    }

    prompt
}
