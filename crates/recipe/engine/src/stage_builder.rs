//! Stage builder
//!
//! Turns a contract and the effective plugins into an ordered stage list:
//! one lifecycle stage per extension point (contract order), one helper
//! stage per distinct helper kind, then finalize.
//!
//! Within a helper kind, helpers are ordered topologically over their
//! `depends_on` edges. Among helpers that are ready at the same time the
//! highest priority runs first, then declaration order. Unresolvable
//! dependencies and cycles are contract diagnostics: the offending helpers
//! are left out of the schedule and later surface as unused.

use crate::contract::RecipeContract;
use crate::helper::{Helper, HelperSpec};
use crate::plugin::{CompositionMode, Registrations};
use recipe_types::{Diagnostic, DiagnosticKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A helper placed in a stage.
#[derive(Clone)]
pub struct ScheduledHelper {
    pub key: String,
    pub plugin: String,
    pub helper: Arc<dyn Helper>,
}

impl fmt::Debug for ScheduledHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHelper")
            .field("key", &self.key)
            .field("plugin", &self.plugin)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum StageKind {
    Lifecycle(String),
    Helpers(String),
    Finalize,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub helpers: Vec<ScheduledHelper>,
}

/// A helper as it was registered, kept for unused-helper reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredHelperInfo {
    pub key: String,
    pub kind: String,
    pub plugin: String,
    pub depends_on: Vec<String>,
}

/// The build-time product: stages, registrations and contract diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StagePlan {
    pub recipe: String,
    pub stages: Vec<Stage>,
    pub registered: Vec<RegisteredHelperInfo>,
    pub artefact_keys: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl StagePlan {
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}

/// Helpers sharing one key: `extend` registrations compose in order.
struct HelperNode {
    key: String,
    kind: String,
    priority: i32,
    depends_on: Vec<String>,
    members: Vec<ScheduledHelper>,
}

fn contract_warn(code: &str, subject: &str, message: String) -> Diagnostic {
    Diagnostic::warn(DiagnosticKind::Contract, message)
        .with_code(code)
        .with_subject(subject)
}

/// Fold registrations by key, honoring `override`.
fn merge_nodes(registrations: &Registrations, diagnostics: &mut Vec<Diagnostic>) -> Vec<HelperNode> {
    let mut nodes: Vec<HelperNode> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for registered in &registrations.helpers {
        let spec: &HelperSpec = &registered.spec;
        let member = ScheduledHelper {
            key: spec.key.clone(),
            plugin: registered.plugin.clone(),
            helper: Arc::clone(&spec.helper),
        };
        let Some(&slot) = index.get(&spec.key) else {
            index.insert(spec.key.clone(), nodes.len());
            nodes.push(HelperNode {
                key: spec.key.clone(),
                kind: spec.kind.clone(),
                priority: spec.priority,
                depends_on: spec.depends_on.clone(),
                members: vec![member],
            });
            continue;
        };

        let node = &mut nodes[slot];
        match spec.mode {
            CompositionMode::Override => {
                node.kind = spec.kind.clone();
                node.priority = spec.priority;
                node.depends_on = spec.depends_on.clone();
                node.members = vec![member];
            }
            CompositionMode::Extend if node.kind == spec.kind => {
                for dependency in &spec.depends_on {
                    if !node.depends_on.contains(dependency) {
                        node.depends_on.push(dependency.clone());
                    }
                }
                node.members.push(member);
            }
            CompositionMode::Extend => diagnostics.push(contract_warn(
                "helper_kind_conflict",
                &spec.key,
                format!(
                    "Helper \"{}\" from plugin \"{}\" extends kind \"{}\" but the key is registered for kind \"{}\".",
                    spec.key, registered.plugin, spec.kind, node.kind
                ),
            )),
        }
    }
    nodes
}

/// Order one kind's helpers. Returns the scheduled order.
fn order_kind(
    kind: &str,
    nodes: &[&HelperNode],
    satisfied_earlier: &HashSet<String>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<ScheduledHelper> {
    let local: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (n.key.as_str(), i)).collect();
    let mut excluded = vec![false; nodes.len()];

    for (i, node) in nodes.iter().enumerate() {
        for dependency in &node.depends_on {
            if local.contains_key(dependency.as_str()) || satisfied_earlier.contains(dependency) {
                continue;
            }
            excluded[i] = true;
            diagnostics.push(
                contract_warn(
                    "helper_dependency_missing",
                    &node.key,
                    format!("Helper \"{}\" depends on \"{}\", which is not registered.", node.key, dependency),
                )
                .with_data(serde_json::json!({ "kind": kind, "dependsOn": node.depends_on })),
            );
        }
    }

    // Anything downstream of an excluded helper can never run either.
    let mut changed = true;
    while changed {
        changed = false;
        for (i, node) in nodes.iter().enumerate() {
            if excluded[i] {
                continue;
            }
            if let Some(blocked) = node
                .depends_on
                .iter()
                .find(|d| local.get(d.as_str()).is_some_and(|&j| excluded[j]))
            {
                excluded[i] = true;
                changed = true;
                diagnostics.push(contract_warn(
                    "helper_dependency_missing",
                    &node.key,
                    format!("Helper \"{}\" depends on \"{}\", which cannot be scheduled.", node.key, blocked),
                ));
            }
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        if excluded[i] {
            continue;
        }
        let local_deps: BTreeSet<usize> = node
            .depends_on
            .iter()
            .filter_map(|d| local.get(d.as_str()).copied())
            .collect();
        for j in local_deps {
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| !excluded[i] && indegree[i] == 0).collect();
    let mut done = vec![false; nodes.len()];
    let mut order = Vec::new();
    while !ready.is_empty() {
        let pick = ready
            .iter()
            .enumerate()
            .max_by(|x, y| {
                nodes[*x.1]
                    .priority
                    .cmp(&nodes[*y.1].priority)
                    .then(y.1.cmp(x.1))
            })
            .map(|(position, _)| position)
            .unwrap_or(0);
        let i = ready.swap_remove(pick);
        done[i] = true;
        order.extend(nodes[i].members.iter().cloned());
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    let cyclic: Vec<&str> = (0..nodes.len())
        .filter(|&i| !excluded[i] && !done[i])
        .map(|i| nodes[i].key.as_str())
        .collect();
    if !cyclic.is_empty() {
        diagnostics.push(
            contract_warn(
                "helper_dependency_cycle",
                cyclic[0],
                format!(
                    "Helpers {} form a dependency cycle in kind \"{}\".",
                    cyclic.iter().map(|k| format!("\"{}\"", k)).collect::<Vec<_>>().join(", "),
                    kind
                ),
            )
            .with_data(serde_json::json!({ "kind": kind, "helpers": cyclic })),
        );
    }
    order
}

/// Build the stage plan for `contract` from the collected registrations.
pub fn build_stages(contract: &RecipeContract, registrations: &Registrations) -> StagePlan {
    let mut diagnostics = Vec::new();
    let mut stages = Vec::new();

    for point in &contract.extension_points {
        let helpers = registrations
            .lifecycle
            .iter()
            .filter(|r| &r.hook.name == point)
            .map(|r| ScheduledHelper {
                key: r.plugin.clone(),
                plugin: r.plugin.clone(),
                helper: Arc::clone(&r.hook.hook),
            })
            .collect();
        stages.push(Stage {
            name: format!("lifecycle:{}", point),
            kind: StageKind::Lifecycle(point.clone()),
            helpers,
        });
    }
    for registered in &registrations.lifecycle {
        if !contract.extension_points.contains(&registered.hook.name) {
            diagnostics.push(contract_warn(
                "lifecycle_unscheduled",
                &registered.plugin,
                format!(
                    "Plugin \"{}\" registers lifecycle \"{}\", which recipe \"{}\" does not declare.",
                    registered.plugin, registered.hook.name, contract.name
                ),
            ));
        }
    }

    let mut kinds: Vec<String> = Vec::new();
    for kind in contract.helper_kinds.iter().chain(registrations.helper_kinds.iter()) {
        if !kinds.contains(kind) {
            kinds.push(kind.clone());
        }
    }

    let nodes = merge_nodes(registrations, &mut diagnostics);
    for node in &nodes {
        if !kinds.contains(&node.kind) {
            diagnostics.push(contract_warn(
                "helper_kind_undeclared",
                &node.key,
                format!("Helper \"{}\" targets undeclared helper kind \"{}\".", node.key, node.kind),
            ));
        }
    }

    let mut satisfied: HashSet<String> = HashSet::new();
    for kind in &kinds {
        let of_kind: Vec<&HelperNode> = nodes.iter().filter(|n| &n.kind == kind).collect();
        let helpers = order_kind(kind, &of_kind, &satisfied, &mut diagnostics);
        satisfied.extend(helpers.iter().map(|h| h.key.clone()));
        stages.push(Stage {
            name: format!("helpers:{}", kind),
            kind: StageKind::Helpers(kind.clone()),
            helpers,
        });
    }

    stages.push(Stage {
        name: "finalize".to_string(),
        kind: StageKind::Finalize,
        helpers: Vec::new(),
    });

    let registered = nodes
        .iter()
        .map(|n| RegisteredHelperInfo {
            key: n.key.clone(),
            kind: n.kind.clone(),
            plugin: n.members.first().map(|m| m.plugin.clone()).unwrap_or_default(),
            depends_on: n.depends_on.clone(),
        })
        .collect();

    StagePlan {
        recipe: contract.name.clone(),
        stages,
        registered,
        artefact_keys: contract.artefact_keys.clone(),
        diagnostics,
    }
}
