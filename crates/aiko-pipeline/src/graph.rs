//! Graph model.
//!
//! The `graph` definition is a list of S-expressions over element names.
//! Within one expression consecutive names chain (`(A B C)` is A→B→C); a
//! nested list opens a branch from the current node (`(A (B D) (C D))` fans
//! A out to B and C, both feeding D). The same name always refers to the
//! same node, which is how branches rejoin. A trailing map on an edge
//! renames ports across it: `(A B (from: to))` feeds A's output `from` into
//! B's input `to`.

use std::collections::{BTreeMap, HashMap, HashSet};

use aiko_sexpr::SValue;

use crate::error::{PipelineError, Result};

/// Port rename across one edge: producer port → consumer port.
pub type EdgeRename = (String, String);

// ── PipelineGraph ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PipelineGraph {
    /// Node names in first-seen order.
    nodes: Vec<String>,
    edges: Vec<(String, String)>,
    /// Execution order: head first, every node after all its predecessors.
    order: Vec<String>,
    /// consumer → producer → rename
    fan_in: HashMap<String, BTreeMap<String, EdgeRename>>,
    /// producer → consumer → rename
    fan_out: HashMap<String, BTreeMap<String, EdgeRename>>,
}

impl PipelineGraph {
    pub fn build(graph_definition: &[String]) -> Result<Self> {
        let mut graph = Self::default();
        for expression in graph_definition {
            let value = aiko_sexpr::parse(expression)
                .map_err(|e| PipelineError::Definition(format!("graph: {e}")))?;
            let items = value.as_list().ok_or_else(|| {
                PipelineError::Definition(format!("graph expression is not a list: {expression}"))
            })?;
            graph.walk(items)?;
        }
        graph.dedupe_edges();
        graph.order = graph.execution_order()?;
        Ok(graph)
    }

    /// Walk one expression: `items[0]` is the entry node, later atoms chain,
    /// nested lists branch, a map annotates the edge added last.
    fn walk(&mut self, items: &[SValue]) -> Result<()> {
        let head = match items.first() {
            Some(value) => self.node_name(value)?,
            None => {
                return Err(PipelineError::Definition("empty graph expression".into()));
            }
        };
        self.add_node(&head);

        let mut current = head;
        let mut last_edge: Option<(String, String)> = None;
        for item in &items[1..] {
            match item {
                SValue::Symbol(_) | SValue::Str(_) => {
                    let next = self.node_name(item)?;
                    self.add_node(&next);
                    self.edges.push((current.clone(), next.clone()));
                    last_edge = Some((current.clone(), next.clone()));
                    current = next;
                }
                SValue::List(branch) => {
                    let branch_head = match branch.first() {
                        Some(value) => self.node_name(value)?,
                        None => continue,
                    };
                    self.add_node(&branch_head);
                    self.edges.push((current.clone(), branch_head.clone()));
                    self.walk(branch)?;
                    last_edge = Some((current.clone(), branch_head));
                }
                SValue::Map(pairs) => {
                    let Some((producer, consumer)) = last_edge.clone() else {
                        return Err(PipelineError::Definition(
                            "port mapping before any edge in graph expression".into(),
                        ));
                    };
                    let Some((from, to)) = pairs.first().and_then(|(k, v)| {
                        Some((k.as_text()?.to_string(), v.as_text()?.to_string()))
                    }) else {
                        continue;
                    };
                    self.fan_in
                        .entry(consumer.clone())
                        .or_default()
                        .insert(producer.clone(), (from.clone(), to.clone()));
                    self.fan_out
                        .entry(producer)
                        .or_default()
                        .insert(consumer, (from, to));
                }
                other => {
                    return Err(PipelineError::Definition(format!(
                        "unexpected graph item: {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn node_name(&self, value: &SValue) -> Result<String> {
        value
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::Definition(format!("bad element name: {value}")))
    }

    fn add_node(&mut self, name: &str) {
        if !self.nodes.iter().any(|n| n == name) {
            self.nodes.push(name.to_string());
        }
    }

    fn dedupe_edges(&mut self) {
        let mut seen = HashSet::new();
        self.edges.retain(|edge| seen.insert(edge.clone()));
    }

    /// Kahn's algorithm over the deduplicated edges, keeping first-seen
    /// order among ready nodes. Rejects cycles and multiple heads.
    fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.as_str(), 0)).collect();
        for (_, to) in &self.edges {
            *in_degree.get_mut(to.as_str()).expect("edge to known node") += 1;
        }

        let heads: Vec<&String> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.as_str()] == 0)
            .collect();
        if heads.is_empty() {
            return Err(PipelineError::Invariant("graph contains a cycle".into()));
        }
        if heads.len() > 1 {
            return Err(PipelineError::Invariant(format!(
                "graph has multiple head elements: {heads:?}"
            )));
        }

        let mut ready: Vec<&str> = vec![heads[0].as_str()];
        let mut order = Vec::with_capacity(self.nodes.len());
        while !ready.is_empty() {
            let node = ready.remove(0);
            order.push(node.to_string());
            for (from, to) in &self.edges {
                if from == node {
                    let degree = in_degree.get_mut(to.as_str()).expect("known node");
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(to.as_str());
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(PipelineError::Invariant("graph contains a cycle".into()));
        }
        Ok(order)
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn head(&self) -> &str {
        &self.order[0]
    }

    pub fn node_names(&self) -> &[String] {
        &self.nodes
    }

    /// Index of `name` in the execution order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, to)| to == name)
            .map(|(from, _)| from.as_str())
            .collect()
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    /// Port renames feeding `consumer`, keyed by producer.
    pub fn fan_in(&self, consumer: &str) -> Option<&BTreeMap<String, EdgeRename>> {
        self.fan_in.get(consumer)
    }

    /// Port renames leaving `producer`, keyed by consumer.
    pub fn fan_out(&self, producer: &str) -> Option<&BTreeMap<String, EdgeRename>> {
        self.fan_out.get(producer)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
