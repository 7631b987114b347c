use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize};

/// A weighted transition to (child) or from (grandparent) a parent word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Edge {
    pub word: String,
    pub value: u64,
}

impl Edge {
    pub fn new(word: impl Into<String>, value: u64) -> Self {
        Edge {
            word: word.into(),
            value,
        }
    }
}

/// A node of the chain keyed by one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parent {
    pub word: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub children: Vec<Edge>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub grandparents: Vec<Edge>,
}

// Older documents serialized empty edge lists as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Edge>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Edge>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Parent {
    pub fn new(word: impl Into<String>) -> Self {
        Parent {
            word: word.into(),
            children: Vec::new(),
            grandparents: Vec::new(),
        }
    }

    pub fn bump_child(&mut self, word: &str) {
        bump(&mut self.children, word);
    }

    pub fn bump_grandparent(&mut self, word: &str) {
        bump(&mut self.grandparents, word);
    }

    /// A parent without any edge carries no information and is never persisted.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.grandparents.is_empty()
    }

    pub fn child_weight(&self) -> u64 {
        self.children.iter().map(|c| c.value).sum()
    }

    pub fn grandparent_weight(&self) -> u64 {
        self.grandparents.iter().map(|g| g.value).sum()
    }

    pub fn total_weight(&self) -> u64 {
        self.child_weight() + self.grandparent_weight()
    }

    /// Fold another record for the same word into this one, summing matched edges.
    pub fn absorb(&mut self, other: &Parent) {
        let children = std::mem::take(&mut self.children);
        self.children = merge_edges(children, &other.children);
        let grandparents = std::mem::take(&mut self.grandparents);
        self.grandparents = merge_edges(grandparents, &other.grandparents);
    }

    pub fn edge_count(&self) -> usize {
        self.children.len() + self.grandparents.len()
    }
}

fn bump(edges: &mut Vec<Edge>, word: &str) {
    match edges.iter_mut().find(|e| e.word == word) {
        Some(edge) => edge.value += 1,
        None => edges.push(Edge::new(word, 1)),
    }
}

/// Merge two edge lists by word. Existing order is kept, matched weights are summed,
/// and unmatched incoming edges are appended in their original order.
pub fn merge_edges(existing: Vec<Edge>, incoming: &[Edge]) -> Vec<Edge> {
    if incoming.is_empty() {
        return existing;
    }
    let mut lookup: FxHashMap<&str, (usize, bool)> = incoming
        .iter()
        .enumerate()
        .map(|(i, e)| (e.word.as_str(), (i, false)))
        .collect();

    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for mut edge in existing {
        if let Some((i, used)) = lookup.get_mut(edge.word.as_str()) {
            if !*used {
                edge.value += incoming[*i].value;
                *used = true;
            }
        }
        merged.push(edge);
    }
    for edge in incoming {
        if let Some((_, used)) = lookup.get(edge.word.as_str()) {
            if !*used {
                merged.push(edge.clone());
            }
        }
    }
    merged
}

/// The in-memory collection of parents for one channel, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct Chain {
    parents: Vec<Parent>,
    index: FxHashMap<String, usize>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the parent for `word`, creating it on first use.
    pub fn parent_mut(&mut self, word: &str) -> &mut Parent {
        let i = match self.index.get(word) {
            Some(&i) => i,
            None => {
                self.parents.push(Parent::new(word));
                let i = self.parents.len() - 1;
                self.index.insert(word.to_string(), i);
                i
            }
        };
        &mut self.parents[i]
    }

    pub fn get(&self, word: &str) -> Option<&Parent> {
        self.index.get(word).map(|&i| &self.parents[i])
    }

    pub fn position(&self, word: &str) -> Option<usize> {
        self.index.get(word).copied()
    }

    pub fn parents(&self) -> &[Parent] {
        &self.parents
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn clear(&mut self) {
        self.parents.clear();
        self.index.clear();
    }
}

impl FromIterator<Parent> for Chain {
    fn from_iter<I: IntoIterator<Item = Parent>>(iter: I) -> Self {
        let mut chain = Chain::new();
        for parent in iter {
            chain.parent_mut(&parent.word).absorb(&parent);
        }
        chain
    }
}
