// Anatomical region hierarchy.
//
// Regions are stored in a flat arena in file order. Parent links are
// resolved to arena indices once at load time, and every parent chain is
// checked to reach the root within `MAX_ANCESTOR_HOPS` steps, so later
// rollups never have to deal with cycles or dangling parents. Branches whose
// top region is parented to the universe are allowed and end there.

use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

pub type RegionId = i64;

// Far deeper than any real atlas hierarchy (the Allen CCF is ~13 levels).
pub const MAX_ANCESTOR_HOPS: usize = 64;

// Reserved ids for the background ("universe") label and the whole-brain
// root. These identify the sentinel records regardless of where they appear
// in the ontology file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SentinelIds {
    pub universe: RegionId,
    pub root: RegionId,
}

impl Default for SentinelIds {
    fn default() -> Self {
        SentinelIds {
            universe: 0,
            root: 997,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegionNode {
    pub id: RegionId,
    pub parent_id: Option<RegionId>,
    pub name: String,
    pub acronym: String,
}

impl RegionNode {
    pub fn new(id: RegionId, parent_id: Option<RegionId>, name: &str, acronym: &str) -> RegionNode {
        RegionNode {
            id,
            parent_id,
            name: name.to_string(),
            acronym: acronym.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RegionRecord {
    id: RegionId,
    name: String,
    #[serde(default)]
    acronym: String,
    #[serde(default, alias = "parent", alias = "parent_id")]
    parent_structure_id: Option<RegionId>,
}

impl From<RegionRecord> for RegionNode {
    fn from(record: RegionRecord) -> Self {
        RegionNode {
            id: record.id,
            // negative parents (-1) are the file's way of saying "none"
            parent_id: record.parent_structure_id.filter(|&p| p >= 0),
            name: record.name,
            acronym: record.acronym,
        }
    }
}

// Where an id sits in the hierarchy.
#[derive(Clone, Debug, PartialEq)]
pub enum Lineage {
    // The universe label: outside every annotated structure.
    Background,
    // Not present in the ontology.
    Unknown,
    // Arena indices from the region itself up to and including the root.
    Path(Vec<usize>),
}

pub struct RegionOntology {
    nodes: Vec<RegionNode>,
    index: HashMap<RegionId, usize>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    sentinels: SentinelIds,
    universe_name: String,
    root: usize,
}

impl RegionOntology {
    pub fn from_path(path: &Path, sentinels: SentinelIds) -> Result<RegionOntology> {
        let file = File::open(path)?;
        let ontology = Self::from_reader(BufReader::new(file), sentinels)?;
        debug!(
            "Loaded {} regions from {}",
            ontology.len(),
            path.display()
        );
        Ok(ontology)
    }

    pub fn from_reader<R: Read>(input: R, sentinels: SentinelIds) -> Result<RegionOntology> {
        let records: Vec<RegionRecord> = serde_json::from_reader(input)?;
        Self::from_nodes(records.into_iter().map(RegionNode::from).collect(), sentinels)
    }

    pub fn from_nodes(all_nodes: Vec<RegionNode>, sentinels: SentinelIds) -> Result<RegionOntology> {
        let mut universe_name = String::from("universe");
        let mut nodes = Vec::with_capacity(all_nodes.len());
        let mut index = HashMap::with_capacity(all_nodes.len());

        for node in all_nodes {
            if node.id == sentinels.universe {
                universe_name = node.name;
                continue;
            }

            if index.insert(node.id, nodes.len()).is_some() {
                return Err(Error::Ontology(format!("duplicate region id {}", node.id)));
            }
            nodes.push(node);
        }

        let root = *index.get(&sentinels.root).ok_or_else(|| {
            Error::Ontology(format!("root region {} is missing", sentinels.root))
        })?;

        let parents: Vec<Option<usize>> = nodes
            .iter()
            .map(|node| node.parent_id.and_then(|p| index.get(&p).cloned()))
            .collect();

        let mut children = vec![Vec::new(); nodes.len()];
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = parent {
                children[*p].push(i);
            }
        }

        let ontology = RegionOntology {
            nodes,
            index,
            parents,
            children,
            sentinels,
            universe_name,
            root,
        };

        for node in &ontology.nodes {
            ontology.ancestors(node.id)?;
        }

        Ok(ontology)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RegionNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &RegionNode {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: RegionId) -> Option<usize> {
        self.index.get(&id).cloned()
    }

    pub fn get(&self, id: RegionId) -> Option<&RegionNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn root(&self) -> &RegionNode {
        &self.nodes[self.root]
    }

    pub fn sentinels(&self) -> SentinelIds {
        self.sentinels
    }

    pub fn universe_name(&self) -> &str {
        &self.universe_name
    }

    // Immediate children, in ontology order.
    pub fn children_of(&self, id: RegionId) -> Vec<&RegionNode> {
        match self.index_of(id) {
            Some(i) => self.children[i].iter().map(|&c| &self.nodes[c]).collect(),
            None => Vec::new(),
        }
    }

    pub fn child_names(&self, index: usize) -> Vec<String> {
        self.children[index]
            .iter()
            .map(|&c| self.nodes[c].name.clone())
            .collect()
    }

    // Walk from `id` to the root, or to the top of a branch parented to the
    // universe, returning arena indices. Fails on cycles,
    // parents missing from the ontology, and chains longer than the hop bound.
    pub fn ancestors(&self, id: RegionId) -> Result<Vec<usize>> {
        let start = self
            .index_of(id)
            .ok_or_else(|| Error::Ontology(format!("region {} is not in the ontology", id)))?;

        let mut path = Vec::new();
        let mut current = start;
        loop {
            if path.contains(&current) {
                return Err(Error::Cycle(id));
            }
            path.push(current);

            if current == self.root {
                return Ok(path);
            }

            if path.len() > MAX_ANCESTOR_HOPS {
                return Err(Error::TooDeep(id, MAX_ANCESTOR_HOPS));
            }

            current = match self.parents[current] {
                Some(parent) => parent,
                // a branch hanging off the universe stops here and rolls up
                // into nothing above it
                None if self.nodes[current].parent_id == Some(self.sentinels.universe) => {
                    return Ok(path);
                }
                None => {
                    let node = &self.nodes[current];
                    return Err(Error::BrokenChain {
                        region: id,
                        at: node.parent_id.unwrap_or(node.id),
                    });
                }
            };
        }
    }

    pub fn lineage(&self, id: RegionId) -> Result<Lineage> {
        if id == self.sentinels.universe {
            Ok(Lineage::Background)
        } else if !self.index.contains_key(&id) {
            Ok(Lineage::Unknown)
        } else {
            Ok(Lineage::Path(self.ancestors(id)?))
        }
    }
}
