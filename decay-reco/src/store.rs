//! Candidate store
//!
//! An arena of candidates plus named, ordered candidate lists. Daughters are
//! referenced by arena index, so decay trees share sub-trees freely and never
//! form ownership cycles. Candidates are never removed from the arena: filtering
//! a list only drops ids from that list, so references held elsewhere stay valid.

use crate::types::{Candidate, CandidateId, PipelineError, Result, Source};
use std::collections::HashMap;

/// Per-event storage for candidates and their lists
#[derive(Debug, Clone, Default)]
pub struct CandidateStore {
    /// Every candidate ever created in this event
    candidates: Vec<Candidate>,
    /// Candidate lists by label
    lists: HashMap<String, Vec<CandidateId>>,
    /// Labels in creation order, for deterministic iteration
    order: Vec<String>,
}

impl CandidateStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate to the arena without putting it in any list
    pub fn insert(&mut self, candidate: Candidate) -> CandidateId {
        let id = CandidateId::new(self.candidates.len() as u32);
        self.candidates.push(candidate);
        id
    }

    /// Get a candidate by id
    ///
    /// Ids are only handed out by `insert`, so an id from this store is always valid.
    pub fn candidate(&self, id: CandidateId) -> &Candidate {
        &self.candidates[id.index()]
    }

    pub(crate) fn candidate_mut(&mut self, id: CandidateId) -> &mut Candidate {
        &mut self.candidates[id.index()]
    }

    /// Insert a copy of a candidate that shares its daughters but no memoized values
    pub(crate) fn duplicate(&mut self, id: CandidateId) -> CandidateId {
        let mut copy = self.candidate(id).clone();
        copy.invalidate();
        self.insert(copy)
    }

    /// Drop the most recently inserted candidate
    ///
    /// Only valid while nothing else refers to it: the assembler uses this to
    /// throw away a combination that failed its cut right after construction.
    pub(crate) fn discard_last(&mut self, id: CandidateId) {
        debug_assert_eq!(id.index() + 1, self.candidates.len());
        if id.index() + 1 == self.candidates.len() {
            self.candidates.pop();
        }
    }

    /// Number of candidates in the arena
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Create a new empty list; labels are unique keys
    pub fn create_list(&mut self, label: &str) -> Result<()> {
        if self.lists.contains_key(label) {
            return Err(PipelineError::InvalidConfig(format!(
                "candidate list '{}' already exists",
                label
            )));
        }
        self.lists.insert(label.to_string(), Vec::new());
        self.order.push(label.to_string());
        Ok(())
    }

    /// Get a list by label
    pub fn get(&self, label: &str) -> Result<&[CandidateId]> {
        self.lists
            .get(label)
            .map(|v| v.as_slice())
            .ok_or_else(|| PipelineError::UnknownList(label.to_string()))
    }

    /// True if a list with this label exists
    pub fn has_list(&self, label: &str) -> bool {
        self.lists.contains_key(label)
    }

    /// Replace the content of an existing list
    pub fn replace(&mut self, label: &str, ids: Vec<CandidateId>) -> Result<()> {
        let list = self
            .lists
            .get_mut(label)
            .ok_or_else(|| PipelineError::UnknownList(label.to_string()))?;
        *list = ids;
        Ok(())
    }

    /// Append ids to a list, creating it if needed
    pub fn append(&mut self, label: &str, ids: impl IntoIterator<Item = CandidateId>) {
        if !self.lists.contains_key(label) {
            self.order.push(label.to_string());
        }
        self.lists.entry(label.to_string()).or_default().extend(ids);
    }

    /// Keep only the ids of a list whose candidate satisfies `keep`
    ///
    /// Returns the number of ids removed.
    pub fn retain<F>(&mut self, label: &str, mut keep: F) -> Result<usize>
    where
        F: FnMut(&Candidate) -> bool,
    {
        let candidates = &self.candidates;
        let list = self
            .lists
            .get_mut(label)
            .ok_or_else(|| PipelineError::UnknownList(label.to_string()))?;
        let before = list.len();
        list.retain(|id| keep(&candidates[id.index()]));
        Ok(before - list.len())
    }

    /// List labels in creation order
    pub fn labels(&self) -> &[String] {
        &self.order
    }

    /// Final-state leaves under a candidate, depth-first in daughter order
    ///
    /// A final-state candidate is its own single leaf.
    pub fn leaves(&self, id: CandidateId) -> Vec<CandidateId> {
        let mut leaves = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let daughters = self.candidate(current).daughters();
            if daughters.is_empty() {
                leaves.push(current);
            } else {
                // Reverse so the first daughter is visited first
                stack.extend(daughters.iter().rev().copied());
            }
        }
        leaves
    }

    /// Sources of every leaf under a candidate, in traversal order
    pub fn leaf_sources(&self, id: CandidateId) -> Vec<Source> {
        self.leaves(id)
            .into_iter()
            .filter_map(|leaf| self.candidate(leaf).source())
            .collect()
    }

    /// Every node of the tree under a candidate, pre-order, root first
    pub fn tree(&self, id: CandidateId) -> Vec<CandidateId> {
        let mut nodes = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            nodes.push(current);
            stack.extend(self.candidate(current).daughters().iter().rev().copied());
        }
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::LorentzVector;

    fn leaf(store: &mut CandidateStore, track: u32) -> CandidateId {
        store.insert(Candidate::final_state(
            "pi+",
            211,
            1,
            LorentzVector::new(0.0, 0.0, 1.0, 1.01),
            Source::Track(track),
        ))
    }

    #[test]
    fn test_unknown_list() {
        let store = CandidateStore::new();
        assert!(matches!(store.get("pi+"), Err(PipelineError::UnknownList(_))));
    }

    #[test]
    fn test_create_list_twice_fails() {
        let mut store = CandidateStore::new();
        store.create_list("pi+").unwrap();
        assert!(store.get("pi+").unwrap().is_empty());
        assert!(store.create_list("pi+").is_err());
    }

    #[test]
    fn test_replace_keeps_references_valid() {
        let mut store = CandidateStore::new();
        let a = leaf(&mut store, 0);
        let b = leaf(&mut store, 1);
        store.append("pi+", vec![a, b]);
        let parent = store.insert(Candidate::composite(
            "rho0",
            113,
            2,
            LorentzVector::default(),
            vec![a, b],
        ));

        store.replace("pi+", vec![]).unwrap();
        assert!(store.get("pi+").unwrap().is_empty());
        assert_eq!(store.candidate(parent).daughters(), &[a, b]);
        assert_eq!(store.candidate(a).source(), Some(Source::Track(0)));
    }

    #[test]
    fn test_leaves_in_traversal_order() {
        let mut store = CandidateStore::new();
        let a = leaf(&mut store, 0);
        let b = leaf(&mut store, 1);
        let c = leaf(&mut store, 2);
        let inner = store.insert(Candidate::composite("X", 0, 0, LorentzVector::default(), vec![a, b]));
        let outer = store.insert(Candidate::composite("Y", 0, 0, LorentzVector::default(), vec![inner, c]));

        assert_eq!(store.leaves(outer), vec![a, b, c]);
        assert_eq!(store.tree(outer), vec![outer, inner, a, b, c]);
        assert_eq!(
            store.leaf_sources(outer),
            vec![Source::Track(0), Source::Track(1), Source::Track(2)]
        );
        assert_eq!(store.leaves(c), vec![c]);
    }

    #[test]
    fn test_retain_counts_removed() {
        let mut store = CandidateStore::new();
        let ids: Vec<_> = (0..4).map(|i| leaf(&mut store, i)).collect();
        store.append("pi+", ids.clone());

        let removed = store
            .retain("pi+", |c| c.source() != Some(Source::Track(2)))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("pi+").unwrap(), &[ids[0], ids[1], ids[3]]);
        assert_eq!(store.len(), 4);
    }
}
