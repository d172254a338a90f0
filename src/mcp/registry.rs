//! Capability registry: the aggregated, namespaced view of every
//! connected upstream
//!
//! A rebuild is the only mutation. The new snapshot is assembled off to
//! the side and published with one atomic pointer swap; readers hold the
//! previous `Arc` for the duration of their call and never observe a
//! half-built registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::config::Settings;

use super::protocol::{PromptArgument, PromptInfo, ResourceInfo, ToolInfo};
use super::session::UpstreamSession;

// ============================================================================
// Aggregated entries
// ============================================================================

#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub exposed_name: String,
    pub original_name: String,
    pub upstream_id: String,
    pub namespace: Option<String>,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct AggregatedResource {
    /// The exposed (possibly namespaced) URI.
    pub exposed_name: String,
    pub original_uri: String,
    pub upstream_id: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AggregatedPrompt {
    pub exposed_name: String,
    pub original_name: String,
    pub upstream_id: String,
    pub namespace: Option<String>,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

/// One published registry generation. Lists keep aggregation order;
/// maps serve lookups.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub tools: Vec<Arc<AggregatedTool>>,
    pub resources: Vec<Arc<AggregatedResource>>,
    pub prompts: Vec<Arc<AggregatedPrompt>>,
    tools_by_name: HashMap<String, Arc<AggregatedTool>>,
    resources_by_name: HashMap<String, Arc<AggregatedResource>>,
    prompts_by_name: HashMap<String, Arc<AggregatedPrompt>>,
}

impl RegistrySnapshot {
    pub fn find_tool(&self, exposed_name: &str) -> Option<&Arc<AggregatedTool>> {
        self.tools_by_name.get(exposed_name)
    }

    pub fn find_resource(&self, exposed_name: &str) -> Option<&Arc<AggregatedResource>> {
        self.resources_by_name.get(exposed_name)
    }

    pub fn find_prompt(&self, exposed_name: &str) -> Option<&Arc<AggregatedPrompt>> {
        self.prompts_by_name.get(exposed_name)
    }
}

/// Per-kind counts plus per-upstream tool counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub tools_per_upstream: HashMap<String, usize>,
}

// ============================================================================
// Name computation
// ============================================================================

/// Tools and prompts: `ns:name` when a namespace is configured.
pub fn exposed_entry_name(namespace: Option<&str>, original: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}:{original}"),
        None => original.to_string(),
    }
}

/// Resources: a URI with a scheme gets the namespace as its first path
/// segment; anything else gets the `ns:` prefix. No namespace leaves the
/// URI unchanged.
pub fn exposed_resource_uri(namespace: Option<&str>, original: &str) -> String {
    let Some(ns) = namespace else {
        return original.to_string();
    };
    match original.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{ns}/{rest}"),
        None => format!("{ns}:{original}"),
    }
}

/// Resolve a duplicate exposed name. With conflict resolution enabled the
/// later entry gets `@upstreamId`, then ordinal suffixes until unique;
/// disabled, the first wins and the later entry is dropped with a warning.
fn resolve_conflict<T>(
    kind: &str,
    base: String,
    upstream_id: &str,
    enabled: bool,
    taken: &HashMap<String, T>,
) -> Option<String> {
    if !taken.contains_key(&base) {
        return Some(base);
    }
    if !enabled {
        tracing::warn!(
            kind,
            name = %base,
            upstream = %upstream_id,
            "Duplicate exposed name dropped (conflict resolution disabled)"
        );
        return None;
    }

    let mut candidate = format!("{base}@{upstream_id}");
    let mut ordinal = 2;
    while taken.contains_key(&candidate) {
        candidate = format!("{base}@{upstream_id}#{ordinal}");
        ordinal += 1;
    }
    tracing::debug!(kind, original = %base, resolved = %candidate, "Renamed conflicting entry");
    Some(candidate)
}

// ============================================================================
// Aggregation passes (pure)
// ============================================================================

type ToolInput = (String, Option<String>, Vec<ToolInfo>);
type ResourceInput = (String, Option<String>, Vec<ResourceInfo>);
type PromptInput = (String, Option<String>, Vec<PromptInfo>);

fn aggregate_tools(
    inputs: &[ToolInput],
    conflict_resolution: bool,
) -> (Vec<Arc<AggregatedTool>>, HashMap<String, Arc<AggregatedTool>>) {
    let mut list = Vec::new();
    let mut map: HashMap<String, Arc<AggregatedTool>> = HashMap::new();

    for (upstream_id, namespace, tools) in inputs {
        for tool in tools {
            let base = exposed_entry_name(namespace.as_deref(), &tool.name);
            let Some(exposed_name) =
                resolve_conflict("tool", base, upstream_id, conflict_resolution, &map)
            else {
                continue;
            };
            let entry = Arc::new(AggregatedTool {
                exposed_name: exposed_name.clone(),
                original_name: tool.name.clone(),
                upstream_id: upstream_id.clone(),
                namespace: namespace.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema.clone(),
            });
            map.insert(exposed_name, Arc::clone(&entry));
            list.push(entry);
        }
    }

    (list, map)
}

fn aggregate_resources(
    inputs: &[ResourceInput],
    conflict_resolution: bool,
) -> (
    Vec<Arc<AggregatedResource>>,
    HashMap<String, Arc<AggregatedResource>>,
) {
    let mut list = Vec::new();
    let mut map: HashMap<String, Arc<AggregatedResource>> = HashMap::new();

    for (upstream_id, namespace, resources) in inputs {
        for resource in resources {
            let base = exposed_resource_uri(namespace.as_deref(), &resource.uri);
            let Some(exposed_name) =
                resolve_conflict("resource", base, upstream_id, conflict_resolution, &map)
            else {
                continue;
            };
            let entry = Arc::new(AggregatedResource {
                exposed_name: exposed_name.clone(),
                original_uri: resource.uri.clone(),
                upstream_id: upstream_id.clone(),
                namespace: namespace.clone(),
                name: resource.name.clone(),
                description: resource.description.clone(),
                mime_type: resource.mime_type.clone(),
            });
            map.insert(exposed_name, Arc::clone(&entry));
            list.push(entry);
        }
    }

    (list, map)
}

fn aggregate_prompts(
    inputs: &[PromptInput],
    conflict_resolution: bool,
) -> (
    Vec<Arc<AggregatedPrompt>>,
    HashMap<String, Arc<AggregatedPrompt>>,
) {
    let mut list = Vec::new();
    let mut map: HashMap<String, Arc<AggregatedPrompt>> = HashMap::new();

    for (upstream_id, namespace, prompts) in inputs {
        for prompt in prompts {
            let base = exposed_entry_name(namespace.as_deref(), &prompt.name);
            let Some(exposed_name) =
                resolve_conflict("prompt", base, upstream_id, conflict_resolution, &map)
            else {
                continue;
            };
            let entry = Arc::new(AggregatedPrompt {
                exposed_name: exposed_name.clone(),
                original_name: prompt.name.clone(),
                upstream_id: upstream_id.clone(),
                namespace: namespace.clone(),
                description: prompt.description.clone(),
                arguments: prompt.arguments.clone(),
            });
            map.insert(exposed_name, Arc::clone(&entry));
            list.push(entry);
        }
    }

    (list, map)
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ConflictFlags {
    tools: bool,
    resources: bool,
    prompts: bool,
}

pub struct CapabilityRegistry {
    flags: ConflictFlags,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    pub fn new(settings: &Settings) -> Self {
        CapabilityRegistry {
            flags: ConflictFlags {
                tools: settings.enable_tool_conflict_resolution,
                resources: settings.enable_resource_conflict_resolution,
                prompts: settings.enable_prompt_conflict_resolution,
            },
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// The currently published snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .unwrap_or_default()
    }

    /// Rebuild from the given connected sessions, in their order, and
    /// publish atomically. Sessions whose list call fails contribute
    /// nothing for that kind but keep their other kinds.
    pub async fn refresh(&self, sessions: &[Arc<UpstreamSession>]) {
        let mut tool_inputs: Vec<ToolInput> = Vec::new();
        let mut resource_inputs: Vec<ResourceInput> = Vec::new();
        let mut prompt_inputs: Vec<PromptInput> = Vec::new();

        for session in sessions {
            if !session.is_connected() {
                continue;
            }
            let id = session.id().to_string();
            let namespace = session.spec().namespace.clone();
            let caps = session.capabilities();

            if caps.has_tools {
                match session.client().list_tools().await {
                    Ok(tools) => tool_inputs.push((id.clone(), namespace.clone(), tools)),
                    Err(error) => {
                        tracing::warn!(upstream = %id, %error, "tools/list failed during refresh");
                    }
                }
            }
            if caps.has_resources {
                match session.client().list_resources().await {
                    Ok(resources) => {
                        resource_inputs.push((id.clone(), namespace.clone(), resources));
                    }
                    Err(error) => {
                        tracing::warn!(upstream = %id, %error, "resources/list failed during refresh");
                    }
                }
            }
            if caps.has_prompts {
                match session.client().list_prompts().await {
                    Ok(prompts) => prompt_inputs.push((id.clone(), namespace.clone(), prompts)),
                    Err(error) => {
                        tracing::warn!(upstream = %id, %error, "prompts/list failed during refresh");
                    }
                }
            }
        }

        let next = self.build(&tool_inputs, &resource_inputs, &prompt_inputs);
        tracing::info!(
            tools = next.tools.len(),
            resources = next.resources.len(),
            prompts = next.prompts.len(),
            "Registry rebuilt"
        );

        if let Ok(mut slot) = self.snapshot.write() {
            *slot = Arc::new(next);
        }
    }

    fn build(
        &self,
        tools: &[ToolInput],
        resources: &[ResourceInput],
        prompts: &[PromptInput],
    ) -> RegistrySnapshot {
        let (tool_list, tools_by_name) = aggregate_tools(tools, self.flags.tools);
        let (resource_list, resources_by_name) =
            aggregate_resources(resources, self.flags.resources);
        let (prompt_list, prompts_by_name) = aggregate_prompts(prompts, self.flags.prompts);

        RegistrySnapshot {
            tools: tool_list,
            resources: resource_list,
            prompts: prompt_list,
            tools_by_name,
            resources_by_name,
            prompts_by_name,
        }
    }

    pub fn find_tool(&self, exposed_name: &str) -> Option<Arc<AggregatedTool>> {
        self.snapshot().find_tool(exposed_name).cloned()
    }

    pub fn find_resource(&self, exposed_name: &str) -> Option<Arc<AggregatedResource>> {
        self.snapshot().find_resource(exposed_name).cloned()
    }

    pub fn find_prompt(&self, exposed_name: &str) -> Option<Arc<AggregatedPrompt>> {
        self.snapshot().find_prompt(exposed_name).cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot();
        let mut tools_per_upstream: HashMap<String, usize> = HashMap::new();
        for tool in &snapshot.tools {
            *tools_per_upstream.entry(tool.upstream_id.clone()).or_insert(0) += 1;
        }
        RegistryStats {
            tools: snapshot.tools.len(),
            resources: snapshot.resources.len(),
            prompts: snapshot.prompts.len(),
            tools_per_upstream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolInfo {
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    fn registry(conflicts: bool) -> CapabilityRegistry {
        let settings = Settings {
            enable_tool_conflict_resolution: conflicts,
            enable_resource_conflict_resolution: conflicts,
            enable_prompt_conflict_resolution: conflicts,
            ..Settings::default()
        };
        CapabilityRegistry::new(&settings)
    }

    #[test]
    fn namespaced_tool_names() {
        assert_eq!(exposed_entry_name(Some("fs"), "ls"), "fs:ls");
        assert_eq!(exposed_entry_name(None, "ls"), "ls");
    }

    #[test]
    fn resource_uri_namespacing() {
        assert_eq!(
            exposed_resource_uri(Some("fs"), "file:///etc/hosts"),
            "file://fs//etc/hosts"
        );
        assert_eq!(
            exposed_resource_uri(Some("db"), "postgres://host/table"),
            "postgres://db/host/table"
        );
        assert_eq!(exposed_resource_uri(Some("ns"), "plain-name"), "ns:plain-name");
        assert_eq!(
            exposed_resource_uri(None, "file:///etc/hosts"),
            "file:///etc/hosts"
        );
    }

    #[test]
    fn conflict_resolution_appends_upstream_id() {
        let inputs = vec![
            ("first".to_string(), None, vec![tool("echo")]),
            ("second".to_string(), None, vec![tool("echo")]),
        ];
        let (list, map) = aggregate_tools(&inputs, true);

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].exposed_name, "echo");
        assert_eq!(list[0].upstream_id, "first");
        assert_eq!(list[1].exposed_name, "echo@second");
        assert_eq!(list[1].upstream_id, "second");
        assert_eq!(map["echo@second"].original_name, "echo");
    }

    #[test]
    fn conflict_resolution_uses_ordinals_when_suffixed_name_is_taken() {
        let inputs = vec![
            ("a".to_string(), None, vec![tool("echo")]),
            ("b".to_string(), None, vec![tool("echo"), tool("echo")]),
        ];
        let (list, _) = aggregate_tools(&inputs, true);
        assert_eq!(list.len(), 3);
        assert_eq!(list[1].exposed_name, "echo@b");
        assert_eq!(list[2].exposed_name, "echo@b#2");
    }

    #[test]
    fn conflicts_disabled_first_wins() {
        let inputs = vec![
            ("first".to_string(), None, vec![tool("echo")]),
            ("second".to_string(), None, vec![tool("echo")]),
        ];
        let (list, map) = aggregate_tools(&inputs, false);

        assert_eq!(list.len(), 1);
        assert_eq!(map["echo"].upstream_id, "first");
    }

    #[test]
    fn namespaces_prevent_conflicts_entirely() {
        let inputs = vec![
            ("a".to_string(), Some("fs".to_string()), vec![tool("ls")]),
            ("b".to_string(), Some("git".to_string()), vec![tool("ls")]),
        ];
        let (list, _) = aggregate_tools(&inputs, true);
        assert_eq!(list[0].exposed_name, "fs:ls");
        assert_eq!(list[1].exposed_name, "git:ls");
    }

    #[test]
    fn build_is_idempotent_for_identical_inputs() {
        let reg = registry(true);
        let inputs = vec![
            ("a".to_string(), Some("fs".to_string()), vec![tool("ls"), tool("cat")]),
            ("b".to_string(), None, vec![tool("ls")]),
        ];

        let first = reg.build(&inputs, &[], &[]);
        let second = reg.build(&inputs, &[], &[]);

        let names = |s: &RegistrySnapshot| {
            s.tools.iter().map(|t| t.exposed_name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), names(&second));
        assert_eq!(names(&first), vec!["fs:ls", "fs:cat", "ls"]);
    }

    #[test]
    fn stats_count_per_upstream() {
        let reg = registry(true);
        let inputs = vec![
            ("a".to_string(), None, vec![tool("t1"), tool("t2")]),
            ("b".to_string(), None, vec![tool("t3")]),
        ];
        let snapshot = reg.build(&inputs, &[], &[]);
        if let Ok(mut slot) = reg.snapshot.write() {
            *slot = Arc::new(snapshot);
        }

        let stats = reg.stats();
        assert_eq!(stats.tools, 3);
        assert_eq!(stats.resources, 0);
        assert_eq!(stats.tools_per_upstream["a"], 2);
        assert_eq!(stats.tools_per_upstream["b"], 1);
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let reg = registry(true);
        assert!(reg.find_tool("anything").is_none());
        assert!(reg.find_resource("uri").is_none());
        assert!(reg.find_prompt("p").is_none());
    }
}
