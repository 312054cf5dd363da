//! DAG compilation - from validated configuration to executable graph
//!
//! The compiler turns a [`PipelineDefinition`] into an [`ExecutionGraph`]:
//! a typed vertex set with **explicit ID maps** (sink name → node ID,
//! sequence index → node ID, source → node ID) and labeled edges. Nothing
//! downstream ever resolves a destination by substring or name guessing;
//! if it is not in a map, it does not exist.
//!
//! Edges come in two kinds. Along the spine, every stage has a `continue`
//! edge to its successor (the last stage's `continue` edge targets the
//! output sink). Each gate additionally has one labeled edge per route
//! whose target is a sink; `routes["continue"]` is not an edge - it means
//! "use the spine's continue edge".
//!
//! Compilation fails with [`GraphValidationError`] when:
//!
//! 1. a gate route names an undeclared sink;
//! 2. `output_sink` is not a declared sink;
//! 3. the graph has a cycle (topological sort fails);
//! 4. a referenced sink is unreachable from the source;
//! 5. adjacent stages have incompatible schemas;
//! 6. a token-creating transform sits between a gate and a coalesce.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde_json::Value;

use elspeth_landscape::{Determinism, NodeId, NodeType, RouteMode};

use crate::config::{PipelineDefinition, RouteTarget, StageDefinition};
use crate::error::GraphValidationError;
use crate::plugin::ValidationFailurePolicy;
use crate::schema::{check_compatibility, Schema};

/// Label of every spine edge.
pub const CONTINUE_LABEL: &str = "continue";

/// Label of the source-to-quarantine-sink edge.
pub const QUARANTINE_LABEL: &str = "quarantine";

/// Compiled metadata for one vertex.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub plugin_name: String,
    pub node_type: NodeType,
    pub plugin_version: String,
    pub determinism: Determinism,
    /// Original plugin options from the configuration.
    pub options: Value,
    /// Position along the spine; `None` for sinks.
    pub sequence: Option<u32>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

/// One compiled edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEdge {
    pub from: NodeId,
    pub to: NodeId,
    /// Route label (`"continue"`, `"suspicious"`, ...), never a sink name.
    pub label: String,
    pub mode: RouteMode,
}

/// The compiled, validated execution graph.
pub struct ExecutionGraph {
    source_id: NodeId,
    nodes: HashMap<NodeId, NodeInfo>,
    edges: Vec<GraphEdge>,
    sink_ids: BTreeMap<String, NodeId>,
    /// Sequence index -> spine stage node ID.
    stage_ids: Vec<NodeId>,
    topo: Vec<NodeId>,
}

impl ExecutionGraph {
    /// Compiles and validates a pipeline definition.
    pub fn compile(definition: &PipelineDefinition) -> Result<Self, GraphValidationError> {
        if definition.sinks.is_empty() {
            return Err(GraphValidationError::Invalid(
                "a pipeline needs at least one sink".to_string(),
            ));
        }
        if !definition.sinks.contains_key(&definition.output_sink) {
            return Err(GraphValidationError::UnknownOutputSink(
                definition.output_sink.clone(),
            ));
        }

        let mut nodes = HashMap::new();
        let mut edges = Vec::new();

        // Source vertex.
        let source_id = NodeId::generate();
        let source_schema = definition.source.plugin.output_schema();
        nodes.insert(
            source_id,
            NodeInfo {
                node_id: source_id,
                plugin_name: definition.source.plugin.name().to_string(),
                node_type: NodeType::Source,
                plugin_version: definition.source.plugin.plugin_version().to_string(),
                determinism: definition.source.plugin.determinism(),
                options: definition.source.options.clone(),
                sequence: Some(0),
                input_schema: None,
                output_schema: Some(source_schema.to_value()),
            },
        );

        // Sink vertices.
        let mut sink_ids = BTreeMap::new();
        for (name, sink) in &definition.sinks {
            let node_id = NodeId::generate();
            nodes.insert(
                node_id,
                NodeInfo {
                    node_id,
                    plugin_name: sink.plugin.name().to_string(),
                    node_type: NodeType::Sink,
                    plugin_version: sink.plugin.plugin_version().to_string(),
                    determinism: sink.plugin.determinism(),
                    options: sink.options.clone(),
                    sequence: None,
                    input_schema: Some(sink.plugin.input_schema().to_value()),
                    output_schema: None,
                },
            );
            sink_ids.insert(name.clone(), node_id);
        }

        // Spine stage vertices.
        let mut stage_ids = Vec::with_capacity(definition.stages.len());
        let mut coalesce_names = HashSet::new();
        for (index, stage) in definition.stages.iter().enumerate() {
            let node_id = NodeId::generate();
            let info = match stage {
                StageDefinition::Transform { plugin, options, .. } => NodeInfo {
                    node_id,
                    plugin_name: plugin.name().to_string(),
                    node_type: NodeType::Transform,
                    plugin_version: plugin.plugin_version().to_string(),
                    determinism: plugin.determinism(),
                    options: options.clone(),
                    sequence: Some(index as u32 + 1),
                    input_schema: plugin.input_schema().map(Schema::to_value),
                    output_schema: plugin.output_schema().map(Schema::to_value),
                },
                StageDefinition::Gate { plugin, options, .. } => NodeInfo {
                    node_id,
                    plugin_name: plugin.name().to_string(),
                    node_type: NodeType::Gate,
                    plugin_version: plugin.plugin_version().to_string(),
                    determinism: plugin.determinism(),
                    options: options.clone(),
                    sequence: Some(index as u32 + 1),
                    input_schema: plugin.input_schema().map(Schema::to_value),
                    output_schema: plugin.output_schema().map(Schema::to_value),
                },
                StageDefinition::Aggregation { plugin, options, .. } => NodeInfo {
                    node_id,
                    plugin_name: plugin.name().to_string(),
                    node_type: NodeType::Aggregation,
                    plugin_version: plugin.plugin_version().to_string(),
                    determinism: plugin.determinism(),
                    options: options.clone(),
                    sequence: Some(index as u32 + 1),
                    input_schema: plugin.input_schema().map(Schema::to_value),
                    output_schema: plugin.output_schema().map(Schema::to_value),
                },
                StageDefinition::Coalesce { plugin, options, name, .. } => {
                    if !coalesce_names.insert(name.clone()) {
                        return Err(GraphValidationError::DuplicateName {
                            kind: "coalesce",
                            name: name.clone(),
                        });
                    }
                    NodeInfo {
                        node_id,
                        plugin_name: plugin.name().to_string(),
                        node_type: NodeType::Coalesce,
                        plugin_version: plugin.plugin_version().to_string(),
                        determinism: plugin.determinism(),
                        options: options.clone(),
                        sequence: Some(index as u32 + 1),
                        input_schema: None,
                        output_schema: None,
                    }
                }
            };
            nodes.insert(node_id, info);
            stage_ids.push(node_id);
        }

        // Spine continue edges: source -> stage_0 -> ... -> output sink.
        let output_sink_id = sink_ids[&definition.output_sink];
        let mut spine_from = source_id;
        for stage_id in &stage_ids {
            edges.push(GraphEdge {
                from: spine_from,
                to: *stage_id,
                label: CONTINUE_LABEL.to_string(),
                mode: RouteMode::Move,
            });
            spine_from = *stage_id;
        }
        edges.push(GraphEdge {
            from: spine_from,
            to: output_sink_id,
            label: CONTINUE_LABEL.to_string(),
            mode: RouteMode::Move,
        });

        // Gate route edges.
        for (index, stage) in definition.stages.iter().enumerate() {
            let StageDefinition::Gate { plugin, routes, .. } = stage else {
                continue;
            };
            for (label, target) in routes {
                let RouteTarget::Sink { name, mode } = target else {
                    continue;
                };
                let Some(sink_id) = sink_ids.get(name) else {
                    return Err(GraphValidationError::UnknownRouteSink {
                        gate: plugin.name().to_string(),
                        label: label.clone(),
                        sink: name.clone(),
                    });
                };
                edges.push(GraphEdge {
                    from: stage_ids[index],
                    to: *sink_id,
                    label: label.clone(),
                    mode: *mode,
                });
            }
        }

        // Quarantine edge, when the source routes validation failures.
        if let ValidationFailurePolicy::Quarantine(name) =
            definition.source.plugin.on_validation_failure()
        {
            let Some(sink_id) = sink_ids.get(&name) else {
                return Err(GraphValidationError::UnknownQuarantineSink(name));
            };
            edges.push(GraphEdge {
                from: source_id,
                to: *sink_id,
                label: QUARANTINE_LABEL.to_string(),
                mode: RouteMode::Move,
            });
        }

        let graph = Self {
            source_id,
            nodes,
            edges,
            sink_ids,
            stage_ids,
            topo: Vec::new(),
        };
        let graph = graph.validate(definition)?;
        Ok(graph)
    }

    fn validate(
        mut self,
        definition: &PipelineDefinition,
    ) -> Result<Self, GraphValidationError> {
        self.topo = self.topological_sort()?;
        self.check_reachability(definition)?;
        self.check_schemas()?;
        self.check_fork_join_expansion(definition)?;
        tracing::debug!(
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            "execution graph compiled"
        );
        Ok(self)
    }

    fn topological_sort(&self) -> Result<Vec<NodeId>, GraphValidationError> {
        let mut in_degree: HashMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for edge in &self.edges {
            adjacency.entry(edge.from).or_default().push(edge.to);
            *in_degree.entry(edge.to).or_default() += 1;
        }
        let mut ready: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for next in adjacency.get(&node).into_iter().flatten() {
                let degree = in_degree.get_mut(next).expect("edge target exists");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*next);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(id, _)| self.nodes[id].plugin_name.clone())
                .unwrap_or_default();
            return Err(GraphValidationError::Cycle(stuck));
        }
        Ok(order)
    }

    fn check_reachability(
        &self,
        definition: &PipelineDefinition,
    ) -> Result<(), GraphValidationError> {
        let mut reachable = HashSet::new();
        let mut frontier = VecDeque::from([self.source_id]);
        while let Some(node) = frontier.pop_front() {
            if !reachable.insert(node) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.from == node) {
                frontier.push_back(edge.to);
            }
        }

        let mut referenced: HashSet<&str> = HashSet::from([definition.output_sink.as_str()]);
        for stage in &definition.stages {
            if let StageDefinition::Gate { routes, .. } = stage {
                for target in routes.values() {
                    if let RouteTarget::Sink { name, .. } = target {
                        referenced.insert(name);
                    }
                }
            }
        }
        if let ValidationFailurePolicy::Quarantine(name) =
            definition.source.plugin.on_validation_failure()
        {
            if let Some(sink_id) = self.sink_ids.get(&name) {
                if !reachable.contains(sink_id) {
                    return Err(GraphValidationError::UnreachableSink(name));
                }
            }
        }
        for name in referenced {
            let sink_id = self.sink_ids[name];
            if !reachable.contains(&sink_id) {
                return Err(GraphValidationError::UnreachableSink(name.to_string()));
            }
        }
        Ok(())
    }

    fn check_schemas(&self) -> Result<(), GraphValidationError> {
        for edge in &self.edges {
            if edge.label == QUARANTINE_LABEL {
                // Quarantined rows are raw by definition; no contract.
                continue;
            }
            let producer = &self.nodes[&edge.from];
            let consumer = &self.nodes[&edge.to];
            let (Some(out_schema), Some(in_schema)) =
                (&producer.output_schema, &consumer.input_schema)
            else {
                continue;
            };
            let out_schema: Schema = serde_json::from_value(out_schema.clone())
                .map_err(|e| GraphValidationError::Invalid(format!("bad schema: {e}")))?;
            let in_schema: Schema = serde_json::from_value(in_schema.clone())
                .map_err(|e| GraphValidationError::Invalid(format!("bad schema: {e}")))?;
            let issues = check_compatibility(&out_schema, &in_schema);
            if !issues.is_empty() {
                return Err(GraphValidationError::SchemaMismatch {
                    from: producer.plugin_name.clone(),
                    to: consumer.plugin_name.clone(),
                    issues,
                });
            }
        }
        Ok(())
    }

    /// A token-creating transform strictly between a gate and a coalesce
    /// has no defined join semantics; reject it at compile time.
    fn check_fork_join_expansion(
        &self,
        definition: &PipelineDefinition,
    ) -> Result<(), GraphValidationError> {
        let coalesces: Vec<(usize, &str)> = definition
            .stages
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                StageDefinition::Coalesce { name, .. } => Some((i, name.as_str())),
                _ => None,
            })
            .collect();
        if coalesces.is_empty() {
            return Ok(());
        }
        for (gate_index, gate_name) in definition.stages.iter().enumerate().filter_map(|(i, s)| {
            match s {
                StageDefinition::Gate { plugin, .. } => Some((i, plugin.name())),
                _ => None,
            }
        }) {
            for (coalesce_index, coalesce_name) in &coalesces {
                if *coalesce_index <= gate_index {
                    continue;
                }
                for stage in &definition.stages[gate_index + 1..*coalesce_index] {
                    if let StageDefinition::Transform { plugin, .. } = stage {
                        if plugin.creates_tokens() {
                            return Err(GraphValidationError::ExpansionInsideForkJoin {
                                stage: plugin.name().to_string(),
                                gate: gate_name.to_string(),
                                coalesce: (*coalesce_name).to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- accessors ---

    #[must_use]
    pub fn source_id(&self) -> NodeId {
        self.source_id
    }

    /// Nodes in dependency order.
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topo
    }

    #[must_use]
    pub fn node_info(&self, node_id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&node_id)
    }

    #[must_use]
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Sink name -> node ID. The only legal way to resolve a sink.
    #[must_use]
    pub fn sink_id_map(&self) -> &BTreeMap<String, NodeId> {
        &self.sink_ids
    }

    /// Sequence index -> spine stage node ID.
    #[must_use]
    pub fn stage_id_map(&self) -> &[NodeId] {
        &self.stage_ids
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
