use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::GraphError;
use crate::schema::MigrationSchema;

/// A dependency edge: `from_entity` must be written after `to_entity`
/// (except when the edge is deferred, in which case it's written in the
/// second pass instead).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DependencyEdge {
    pub from_entity: String,
    pub to_entity: String,
    pub field_name: String,
    pub required: bool,
}

/// The entity dependency DAG derived from a [`MigrationSchema`]: topological
/// tiers plus the set of edges broken to make that tiering possible.
pub struct DependencyGraph {
    entities: Vec<String>,
    tiers: Vec<Vec<String>>,
    circular_refs: Vec<DependencyEdge>,
    deferred_fields: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph and computes its tiering.
    ///
    /// Strongly connected components are found with Tarjan's algorithm.
    /// Every edge internal to an SCC of size > 1 (or a self-loop) is a
    /// candidate for deferral; candidates are removed, preferring
    /// non-mandatory edges and breaking ties by `(from_entity, field_name)`
    /// lexicographic order, until the SCC's induced subgraph is acyclic.
    /// Tiers are then assigned over the resulting DAG by longest path from
    /// the leaves (entities with no remaining outgoing edges sit at tier 0).
    pub fn build(schema: &MigrationSchema) -> Result<Self, GraphError> {
        if schema.entities.is_empty() {
            return Err(GraphError::empty_schema());
        }

        let mut entities: Vec<String> = schema.entities.iter().map(|e| e.name.clone()).collect();
        let mut index_of: HashMap<String, usize> =
            entities.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

        let mut edges = Vec::new();
        for entity in &schema.entities {
            for rel in &entity.relationships {
                if rel.many_to_many {
                    let intersect = rel
                        .intersect_entity
                        .clone()
                        .unwrap_or_else(|| format!("{}_{}", entity.name, rel.target));
                    if !index_of.contains_key(&intersect) {
                        index_of.insert(intersect.clone(), entities.len());
                        entities.push(intersect.clone());
                    }
                    if !index_of.contains_key(&rel.target) {
                        return Err(GraphError::unknown_target(&entity.name, &rel.target));
                    }
                    edges.push(DependencyEdge {
                        from_entity: intersect.clone(),
                        to_entity: entity.name.clone(),
                        field_name: format!("{}_left", rel.field),
                        required: true,
                    });
                    edges.push(DependencyEdge {
                        from_entity: intersect,
                        to_entity: rel.target.clone(),
                        field_name: format!("{}_right", rel.field),
                        required: true,
                    });
                } else {
                    if !index_of.contains_key(&rel.target) {
                        return Err(GraphError::unknown_target(&entity.name, &rel.target));
                    }
                    edges.push(DependencyEdge {
                        from_entity: entity.name.clone(),
                        to_entity: rel.target.clone(),
                        field_name: rel.field.clone(),
                        required: rel.mandatory,
                    });
                }
            }
        }

        let n = entities.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (edge_idx, edge) in edges.iter().enumerate() {
            adjacency[index_of[&edge.from_entity]].push(edge_idx);
        }
        let edge_to_idx = |e: &DependencyEdge| index_of[&e.to_entity];

        let sccs = tarjan_scc(n, &adjacency, &edges, &edge_to_idx);

        let mut deferred: HashSet<usize> = HashSet::new();
        for members in &sccs {
            let is_circular = members.len() > 1
                || adjacency[members[0]]
                    .iter()
                    .any(|&ei| edge_to_idx(&edges[ei]) == members[0]);
            if !is_circular {
                continue;
            }
            let member_set: HashSet<usize> = members.iter().copied().collect();
            let mut internal: Vec<usize> = adjacency
                .iter()
                .enumerate()
                .filter(|(from, _)| member_set.contains(from))
                .flat_map(|(_, edge_idxs)| edge_idxs.iter().copied())
                .filter(|&ei| member_set.contains(&edge_to_idx(&edges[ei])))
                .collect();
            internal.sort_by(|&a, &b| {
                let ea = &edges[a];
                let eb = &edges[b];
                (ea.required, &ea.from_entity, &ea.field_name)
                    .cmp(&(eb.required, &eb.from_entity, &eb.field_name))
            });

            while induced_subgraph_has_cycle(members, &adjacency, &edges, &edge_to_idx, &deferred) {
                let next = internal
                    .iter()
                    .find(|ei| !deferred.contains(ei))
                    .expect("an SCC with a remaining cycle must have a non-deferred internal edge");
                deferred.insert(*next);
            }
        }

        let mut in_tier: Vec<Option<usize>> = vec![None; n];
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut tier_idx = 0usize;
        let mut tiers: Vec<Vec<String>> = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&node| {
                    adjacency[node].iter().all(|&ei| {
                        if deferred.contains(&ei) {
                            return true;
                        }
                        in_tier[edge_to_idx(&edges[ei])].is_some()
                    })
                })
                .collect();
            if ready.is_empty() {
                // Should not happen: every cycle has a deferred edge by
                // construction, so the remaining graph is acyclic.
                break;
            }
            let mut names: Vec<String> = ready.iter().map(|&i| entities[i].clone()).collect();
            names.sort();
            for &node in &ready {
                in_tier[node] = Some(tier_idx);
            }
            remaining.retain(|node| !ready.contains(node));
            tiers.push(names);
            tier_idx += 1;
        }

        let mut deferred_fields: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut circular_refs = Vec::new();
        for &ei in &deferred {
            let edge = &edges[ei];
            deferred_fields
                .entry(edge.from_entity.clone())
                .or_default()
                .insert(edge.field_name.clone());
            circular_refs.push(edge.clone());
        }
        circular_refs.sort_by(|a, b| (&a.from_entity, &a.field_name).cmp(&(&b.from_entity, &b.field_name)));

        Ok(Self {
            entities,
            tiers,
            circular_refs,
            deferred_fields,
        })
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn circular_refs(&self) -> &[DependencyEdge] {
        &self.circular_refs
    }

    pub fn deferred_fields_for(&self, entity: &str) -> BTreeSet<String> {
        self.deferred_fields.get(entity).cloned().unwrap_or_default()
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }
}

fn tarjan_scc(
    n: usize,
    adjacency: &[Vec<usize>],
    edges: &[DependencyEdge],
    edge_to_idx: &impl Fn(&DependencyEdge) -> usize,
) -> Vec<Vec<usize>> {
    struct State {
        index_counter: usize,
        stack: Vec<usize>,
        on_stack: Vec<bool>,
        indices: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        result: Vec<Vec<usize>>,
    }

    fn strongconnect(
        v: usize,
        state: &mut State,
        adjacency: &[Vec<usize>],
        edges: &[DependencyEdge],
        edge_to_idx: &impl Fn(&DependencyEdge) -> usize,
    ) {
        state.indices[v] = Some(state.index_counter);
        state.lowlink[v] = state.index_counter;
        state.index_counter += 1;
        state.stack.push(v);
        state.on_stack[v] = true;

        for &ei in &adjacency[v] {
            let w = edge_to_idx(&edges[ei]);
            if state.indices[w].is_none() {
                strongconnect(w, state, adjacency, edges, edge_to_idx);
                state.lowlink[v] = state.lowlink[v].min(state.lowlink[w]);
            } else if state.on_stack[w] {
                state.lowlink[v] = state.lowlink[v].min(state.indices[w].unwrap());
            }
        }

        if state.lowlink[v] == state.indices[v].unwrap() {
            let mut members = Vec::new();
            loop {
                let w = state.stack.pop().unwrap();
                state.on_stack[w] = false;
                members.push(w);
                if w == v {
                    break;
                }
            }
            state.result.push(members);
        }
    }

    let mut state = State {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: vec![false; n],
        indices: vec![None; n],
        lowlink: vec![0; n],
        result: Vec::new(),
    };

    for v in 0..n {
        if state.indices[v].is_none() {
            strongconnect(v, &mut state, adjacency, edges, edge_to_idx);
        }
    }
    state.result
}

fn induced_subgraph_has_cycle(
    members: &[usize],
    adjacency: &[Vec<usize>],
    edges: &[DependencyEdge],
    edge_to_idx: &impl Fn(&DependencyEdge) -> usize,
    deferred: &HashSet<usize>,
) -> bool {
    let member_set: HashSet<usize> = members.iter().copied().collect();
    let mut in_degree: HashMap<usize, usize> = members.iter().map(|&m| (m, 0)).collect();
    for &m in members {
        for &ei in &adjacency[m] {
            if deferred.contains(&ei) {
                continue;
            }
            let target = edge_to_idx(&edges[ei]);
            if member_set.contains(&target) {
                *in_degree.get_mut(&target).unwrap() += 1;
            }
        }
    }
    let mut queue: Vec<usize> = in_degree.iter().filter(|(_, &d)| d == 0).map(|(&m, _)| m).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &ei in &adjacency[node] {
            if deferred.contains(&ei) {
                continue;
            }
            let target = edge_to_idx(&edges[ei]);
            if !member_set.contains(&target) {
                continue;
            }
            let d = in_degree.get_mut(&target).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push(target);
            }
        }
    }
    visited != members.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, Relationship};

    fn schema_with(entities: Vec<EntitySchema>) -> MigrationSchema {
        MigrationSchema { entities }
    }

    #[test]
    fn simple_chain_tiers_leaves_first() {
        let schema = schema_with(vec![
            EntitySchema {
                name: "account".into(),
                fields: vec![],
                relationships: vec![],
            },
            EntitySchema {
                name: "contact".into(),
                fields: vec![],
                relationships: vec![Relationship {
                    name: "account".into(),
                    target: "account".into(),
                    field: "account_id".into(),
                    mandatory: true,
                    many_to_many: false,
                    intersect_entity: None,
                }],
            },
        ]);

        let graph = DependencyGraph::build(&schema).expect("builds");
        assert_eq!(graph.tiers(), &[vec!["account".to_string()], vec!["contact".to_string()]]);
        assert!(graph.circular_refs().is_empty());
    }

    #[test]
    fn circular_reference_breaks_with_deferred_edge_on_optional_side() {
        let schema = schema_with(vec![
            EntitySchema {
                name: "account".into(),
                fields: vec![],
                relationships: vec![Relationship {
                    name: "primary_contact".into(),
                    target: "contact".into(),
                    field: "primary_contact".into(),
                    mandatory: false,
                    many_to_many: false,
                    intersect_entity: None,
                }],
            },
            EntitySchema {
                name: "contact".into(),
                fields: vec![],
                relationships: vec![Relationship {
                    name: "primary_account".into(),
                    target: "account".into(),
                    field: "primary_account".into(),
                    mandatory: true,
                    many_to_many: false,
                    intersect_entity: None,
                }],
            },
        ]);

        let graph = DependencyGraph::build(&schema).expect("builds");
        assert_eq!(graph.circular_refs().len(), 1);
        assert_eq!(graph.circular_refs()[0].from_entity, "account");
        assert_eq!(graph.circular_refs()[0].field_name, "primary_contact");
        assert_eq!(graph.tiers(), &[vec!["account".to_string()], vec!["contact".to_string()]]);
        assert!(graph.deferred_fields_for("account").contains("primary_contact"));
    }

    #[test]
    fn many_to_many_creates_intersect_entity_depending_on_both_sides() {
        let schema = schema_with(vec![
            EntitySchema {
                name: "product".into(),
                fields: vec![],
                relationships: vec![],
            },
            EntitySchema {
                name: "order".into(),
                fields: vec![],
                relationships: vec![Relationship {
                    name: "products".into(),
                    target: "product".into(),
                    field: "product".into(),
                    mandatory: false,
                    many_to_many: true,
                    intersect_entity: Some("order_line".into()),
                }],
            },
        ]);

        let graph = DependencyGraph::build(&schema).expect("builds");
        assert!(graph.entities().contains(&"order_line".to_string()));
        let order_line_tier = graph
            .tiers()
            .iter()
            .position(|tier| tier.contains(&"order_line".to_string()))
            .unwrap();
        let product_tier = graph
            .tiers()
            .iter()
            .position(|tier| tier.contains(&"product".to_string()))
            .unwrap();
        let order_tier = graph
            .tiers()
            .iter()
            .position(|tier| tier.contains(&"order".to_string()))
            .unwrap();
        assert!(order_line_tier > product_tier);
        assert!(order_line_tier > order_tier);
    }

    #[test]
    fn tiering_is_deterministic_across_runs() {
        let schema = schema_with(vec![
            EntitySchema {
                name: "a".into(),
                fields: vec![],
                relationships: vec![],
            },
            EntitySchema {
                name: "b".into(),
                fields: vec![],
                relationships: vec![Relationship {
                    name: "a".into(),
                    target: "a".into(),
                    field: "a_id".into(),
                    mandatory: true,
                    many_to_many: false,
                    intersect_entity: None,
                }],
            },
        ]);

        let first = DependencyGraph::build(&schema).unwrap();
        let second = DependencyGraph::build(&schema).unwrap();
        assert_eq!(first.tiers(), second.tiers());
        assert_eq!(first.circular_refs(), second.circular_refs());
    }

    #[test]
    fn unknown_target_is_rejected() {
        let schema = schema_with(vec![EntitySchema {
            name: "contact".into(),
            fields: vec![],
            relationships: vec![Relationship {
                name: "account".into(),
                target: "account".into(),
                field: "account_id".into(),
                mandatory: true,
                many_to_many: false,
                intersect_entity: None,
            }],
        }]);

        let err = DependencyGraph::build(&schema).unwrap_err();
        assert!(matches!(err.kind(), crate::error::GraphErrorKind::UnknownTarget { .. }));
    }
}
