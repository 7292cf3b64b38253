//! Dependency graph, cycle detection, and scheduling scopes.
//!
//! Uses `petgraph` to model every edge a workflow declares: explicit `after`
//! edges, implicit edges from branching steps to their branch targets, and
//! ownership edges from loops to their body steps. Strongly connected
//! components reveal cycles (reported as the concrete cycle path).
//!
//! Scheduling happens per *scope*: the top level, plus one scope per loop
//! body. Dependencies on steps inside a loop are lifted to the loop step
//! itself when seen from an enclosing scope.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::{has_path_connecting, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use weaver_types::workflow::{StepDefinition, StepKind, WorkflowDefinition};

use super::definition::{check_structure, WorkflowError};

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A set of steps scheduled together, with their in-scope predecessors.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Members in a topological order (declaration order breaks ties).
    members: Vec<String>,
    preds: HashMap<String, Vec<String>>,
}

impl Scope {
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// In-scope predecessors of `step_id`.
    pub fn predecessors(&self, step_id: &str) -> &[String] {
        self.preds.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.preds.contains_key(step_id)
    }

    /// Members that no other member depends on.
    pub fn sinks(&self) -> Vec<&str> {
        let depended: HashSet<&str> = self
            .preds
            .values()
            .flatten()
            .map(String::as_str)
            .collect();
        self.members
            .iter()
            .map(String::as_str)
            .filter(|id| !depended.contains(id))
            .collect()
    }

    /// Group members into waves of mutually independent steps.
    ///
    /// Wave `n` holds the steps whose longest predecessor chain has length
    /// `n`; every step in a wave could run concurrently.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        for id in &self.members {
            let d = self
                .predecessors(id)
                .iter()
                .map(|p| depth.get(p.as_str()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id.as_str(), d);
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut waves: Vec<Vec<&str>> = vec![Vec::new(); max_depth + 1];
        for id in &self.members {
            waves[depth[id.as_str()]].push(id.as_str());
        }
        waves.retain(|w| !w.is_empty());
        waves
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Graph facts derived from a definition.
#[derive(Debug, Clone, Default)]
pub(crate) struct Analysis {
    /// Body step -> owning loop.
    owner: HashMap<String, String>,
    top: Scope,
    loops: HashMap<String, Scope>,
    /// Step -> steps that list it in `after`.
    dependents: HashMap<String, Vec<String>>,
}

/// Build the full graph, reject cycles, and compute scheduling scopes.
pub(crate) fn analyze(def: &WorkflowDefinition) -> Result<Analysis, WorkflowError> {
    let index: HashMap<&str, usize> = def
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut owner: HashMap<String, String> = HashMap::new();
    for s in &def.steps {
        if let StepKind::Loop { body, .. } = &s.kind {
            for member in body {
                owner.insert(member.clone(), s.id.clone());
            }
        }
    }

    // Full graph: after edges, branch edges, loop ownership edges.
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<NodeIndex> = def.steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
    let node = |id: &str| index.get(id).map(|i| nodes[*i]);

    for s in &def.steps {
        let Some(to) = node(&s.id) else { continue };
        for dep in &s.after {
            let from = node(dep).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' runs after unknown step '{}'",
                    s.id, dep
                ))
            })?;
            graph.add_edge(from, to, ());
        }
        for target in s.kind.branch_targets() {
            if let Some(t) = node(target) {
                graph.add_edge(to, t, ());
            }
        }
        if let StepKind::Loop { body, .. } = &s.kind {
            for member in body {
                if let Some(m) = node(member) {
                    graph.add_edge(to, m, ());
                }
            }
        }
    }

    if let Some(cycle) = find_cycle(&graph) {
        return Err(WorkflowError::CyclicDependency { cycle });
    }

    // Branch targets must live in the same scope as the branching step.
    for s in &def.steps {
        for target in s.kind.branch_targets() {
            if owner.get(target) != owner.get(&s.id) {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' branches to '{target}', which is in a different loop scope",
                    s.id
                )));
            }
        }
    }

    // Implicit predecessors from branching steps.
    let mut branch_sources: HashMap<&str, Vec<&str>> = HashMap::new();
    for s in &def.steps {
        for target in s.kind.branch_targets() {
            branch_sources.entry(target).or_default().push(s.id.as_str());
        }
    }

    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for s in &def.steps {
        for dep in &s.after {
            dependents.entry(dep.clone()).or_default().push(s.id.clone());
        }
    }

    let scope_keys: Vec<Option<&str>> = std::iter::once(None)
        .chain(def.steps.iter().filter_map(|s| match &s.kind {
            StepKind::Loop { .. } => Some(Some(s.id.as_str())),
            _ => None,
        }))
        .collect();

    let mut top = Scope::default();
    let mut loops = HashMap::new();

    for scope_key in scope_keys {
        let members: Vec<&StepDefinition> = def
            .steps
            .iter()
            .filter(|s| owner.get(&s.id).map(String::as_str) == scope_key)
            .collect();

        let mut preds: HashMap<String, Vec<String>> = HashMap::new();
        for s in &members {
            let mut list: Vec<String> = Vec::new();
            let explicit = s.after.iter().map(String::as_str);
            let implicit = branch_sources.get(s.id.as_str()).into_iter().flatten().copied();
            for dep in explicit.chain(implicit) {
                match lift(dep, scope_key, &owner) {
                    Some(lifted) if lifted == s.id => {
                        return Err(WorkflowError::Validation(format!(
                            "step '{}' depends on '{dep}' inside its own loop body",
                            s.id
                        )));
                    }
                    Some(lifted) => {
                        if !list.iter().any(|p| p == lifted) {
                            list.push(lifted.to_string());
                        }
                    }
                    None => {
                        // Outside this loop: must already be done when the loop starts.
                        let loop_id = scope_key.unwrap_or_default();
                        let ok = match (node(dep), node(loop_id)) {
                            (Some(d), Some(l)) => has_path_connecting(&graph, d, l, None),
                            _ => false,
                        };
                        if !ok {
                            return Err(WorkflowError::Validation(format!(
                                "step '{}' in loop '{loop_id}' depends on '{dep}', which does not precede the loop",
                                s.id
                            )));
                        }
                    }
                }
            }
            preds.insert(s.id.clone(), list);
        }

        let scope = order_scope(&members, preds)?;
        match scope_key {
            None => top = scope,
            Some(loop_id) => {
                loops.insert(loop_id.to_string(), scope);
            }
        }
    }

    Ok(Analysis {
        owner,
        top,
        loops,
        dependents,
    })
}

/// Map `dep` to its representative in `scope`: itself or the enclosing loop
/// that is a member of `scope`. `None` when `dep` lies outside the scope.
fn lift<'a>(
    dep: &'a str,
    scope: Option<&str>,
    owner: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let mut current = dep;
    loop {
        let parent = owner.get(current).map(String::as_str);
        if parent == scope {
            return Some(current);
        }
        current = parent?;
    }
}

fn order_scope(
    members: &[&StepDefinition],
    preds: HashMap<String, Vec<String>>,
) -> Result<Scope, WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let idx: HashMap<&str, NodeIndex> = members
        .iter()
        .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
        .collect();
    for (id, list) in &preds {
        for p in list {
            if let (Some(from), Some(to)) = (idx.get(p.as_str()), idx.get(id.as_str())) {
                graph.add_edge(*from, *to, ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| WorkflowError::CyclicDependency {
        cycle: vec![graph[cycle.node_id()].to_string()],
    })?;

    // Stable order: topological rank, then declaration order.
    let rank: HashMap<&str, usize> = sorted
        .iter()
        .enumerate()
        .map(|(i, n)| (graph[*n], i))
        .collect();
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut by_rank: Vec<&StepDefinition> = members.to_vec();
    by_rank.sort_by_key(|s| rank[s.id.as_str()]);
    for s in &by_rank {
        let d = preds[&s.id]
            .iter()
            .map(|p| depth.get(p.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(s.id.as_str(), d);
    }
    let decl: HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut ordered: Vec<&str> = members.iter().map(|s| s.id.as_str()).collect();
    ordered.sort_by_key(|id| (depth[id], decl[id]));

    Ok(Scope {
        members: ordered.into_iter().map(str::to_string).collect(),
        preds,
    })
}

/// Find one cycle and return it as a closed path (`a -> b -> a`).
fn find_cycle(graph: &DiGraph<&str, ()>) -> Option<Vec<String>> {
    for component in tarjan_scc(graph) {
        let start = component[0];
        let self_loop = graph.contains_edge(start, start);
        if component.len() == 1 && !self_loop {
            continue;
        }
        if self_loop {
            let id = graph[start].to_string();
            return Some(vec![id.clone(), id]);
        }

        // BFS from start back to start, staying inside the component.
        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut closing = None;
        while let Some(n) = queue.pop_front() {
            for next in graph.neighbors(n) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    closing = Some(n);
                    break;
                }
                if let std::collections::hash_map::Entry::Vacant(e) = parent.entry(next) {
                    e.insert(n);
                    queue.push_back(next);
                }
            }
            if closing.is_some() {
                break;
            }
        }

        let mut path = vec![graph[start].to_string()];
        let mut cursor = closing?;
        let mut tail = Vec::new();
        while cursor != start {
            tail.push(graph[cursor].to_string());
            cursor = *parent.get(&cursor)?;
        }
        tail.reverse();
        path.extend(tail);
        path.push(graph[start].to_string());
        return Some(path);
    }
    None
}

// ---------------------------------------------------------------------------
// WorkflowPlan
// ---------------------------------------------------------------------------

/// A validated definition plus everything the scheduler needs from its graph.
#[derive(Debug, Clone)]
pub struct WorkflowPlan {
    definition: WorkflowDefinition,
    index: HashMap<String, usize>,
    analysis: Analysis,
}

impl WorkflowPlan {
    /// Validate `definition` and compute its scopes.
    pub fn compile(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        check_structure(&definition)?;
        let analysis = analyze(&definition)?;
        let index = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Ok(Self {
            definition,
            index,
            analysis,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.index.get(id).map(|i| &self.definition.steps[*i])
    }

    /// Steps scheduled at the top level (everything not inside a loop body).
    pub fn top_scope(&self) -> &Scope {
        &self.analysis.top
    }

    /// Body scope of a loop step.
    pub fn loop_scope(&self, loop_id: &str) -> Option<&Scope> {
        self.analysis.loops.get(loop_id)
    }

    /// The loop whose body contains `step_id`.
    pub fn owner_of(&self, step_id: &str) -> Option<&str> {
        self.analysis.owner.get(step_id).map(String::as_str)
    }

    /// Steps listing `step_id` in their `after` set.
    pub fn direct_dependents(&self, step_id: &str) -> &[String] {
        self.analysis
            .dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every step in the workflow, nested loop bodies included.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.definition.steps.iter()
    }

    /// Steps inside `loop_id`'s body, including bodies of nested loops.
    pub fn nested_in(&self, loop_id: &str) -> Vec<String> {
        self.definition
            .steps
            .iter()
            .filter(|s| {
                let mut current = self.owner_of(&s.id);
                while let Some(owner) = current {
                    if owner == loop_id {
                        return true;
                    }
                    current = self.owner_of(owner);
                }
                false
            })
            .map(|s| s.id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
