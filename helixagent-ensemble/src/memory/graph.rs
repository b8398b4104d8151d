//! Arena-backed knowledge graph.
//!
//! Entities and relations form cycles freely, so the graph is an arena of
//! nodes addressed by index with id-based adjacency lists - no owning
//! pointers between nodes. Ingestion is append-only; removal tombstones a
//! node and a compaction pass rebuilds the arena without the dead slots.

use std::collections::HashMap;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub struct EntityNode {
    pub name: String,
    /// (target node, relation label)
    pub edges: Vec<(NodeId, String)>,
    tombstone: bool,
}

#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    nodes: Vec<EntityNode>,
    index: HashMap<String, NodeId>,
    tombstones: usize,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an entity, returning its node id.
    pub fn upsert_entity(&mut self, name: &str) -> NodeId {
        let key = name.to_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(EntityNode {
            name: name.to_string(),
            edges: Vec::new(),
            tombstone: false,
        });
        self.index.insert(key, id);
        id
    }

    /// Append a (subject, predicate, object) triple. Duplicate edges are
    /// collapsed.
    pub fn add_relation(&mut self, subject: &str, predicate: &str, object: &str) {
        let from = self.upsert_entity(subject);
        let to = self.upsert_entity(object);
        let node = &mut self.nodes[from];
        if !node
            .edges
            .iter()
            .any(|(target, label)| *target == to && label == predicate)
        {
            node.edges.push((to, predicate.to_string()));
        }
    }

    pub fn entity(&self, name: &str) -> Option<NodeId> {
        self.index
            .get(&name.to_lowercase())
            .copied()
            .filter(|&id| !self.nodes[id].tombstone)
    }

    /// Outgoing neighbors as (entity name, relation label).
    pub fn neighbors(&self, id: NodeId) -> Vec<(String, String)> {
        let Some(node) = self.nodes.get(id) else {
            return Vec::new();
        };
        node.edges
            .iter()
            .filter(|(target, _)| !self.nodes[*target].tombstone)
            .map(|(target, label)| (self.nodes[*target].name.clone(), label.clone()))
            .collect()
    }

    /// Tombstone an entity; edges into it stop resolving immediately,
    /// storage is reclaimed by [`compact`].
    pub fn remove_entity(&mut self, name: &str) -> bool {
        let Some(&id) = self.index.get(&name.to_lowercase()) else {
            return false;
        };
        if self.nodes[id].tombstone {
            return false;
        }
        self.nodes[id].tombstone = true;
        self.index.remove(&name.to_lowercase());
        self.tombstones += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the arena without tombstoned slots. Returns reclaimed count.
    pub fn compact(&mut self) -> usize {
        if self.tombstones == 0 {
            return 0;
        }
        let reclaimed = self.tombstones;

        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.len());
        for (old_id, node) in self.nodes.iter().enumerate() {
            if !node.tombstone {
                remap.insert(old_id, nodes.len());
                nodes.push(node.clone());
            }
        }
        for node in &mut nodes {
            node.edges = node
                .edges
                .drain(..)
                .filter_map(|(target, label)| remap.get(&target).map(|&t| (t, label)))
                .collect();
        }

        self.index = nodes
            .iter()
            .enumerate()
            .map(|(id, node)| (node.name.to_lowercase(), id))
            .collect();
        self.nodes = nodes;
        self.tombstones = 0;
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_are_representable() {
        let mut graph = KnowledgeGraph::new();
        graph.add_relation("Paris", "capital_of", "France");
        graph.add_relation("France", "contains", "Paris");

        let paris = graph.entity("Paris").unwrap();
        let france = graph.entity("France").unwrap();
        assert_eq!(graph.neighbors(paris), vec![("France".to_string(), "capital_of".to_string())]);
        assert_eq!(graph.neighbors(france), vec![("Paris".to_string(), "contains".to_string())]);
    }

    #[test]
    fn duplicate_relations_collapse() {
        let mut graph = KnowledgeGraph::new();
        graph.add_relation("a", "knows", "b");
        graph.add_relation("a", "knows", "b");
        let a = graph.entity("a").unwrap();
        assert_eq!(graph.neighbors(a).len(), 1);
    }

    #[test]
    fn compaction_reclaims_tombstones_and_remaps_edges() {
        let mut graph = KnowledgeGraph::new();
        graph.add_relation("a", "r", "b");
        graph.add_relation("b", "r", "c");
        assert!(graph.remove_entity("b"));
        assert_eq!(graph.len(), 2);

        // Edges through the tombstone no longer resolve
        let a = graph.entity("a").unwrap();
        assert!(graph.neighbors(a).is_empty());

        assert_eq!(graph.compact(), 1);
        assert_eq!(graph.len(), 2);
        let a = graph.entity("a").unwrap();
        let c = graph.entity("c").unwrap();
        assert!(graph.neighbors(a).is_empty());
        assert!(graph.neighbors(c).is_empty());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut graph = KnowledgeGraph::new();
        graph.upsert_entity("Rust");
        assert!(graph.entity("rust").is_some());
        assert!(graph.entity("RUST").is_some());
    }
}
