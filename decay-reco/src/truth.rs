//! Truth matching against the generated reference
//!
//! Classification runs bottom-up. A final-state candidate is classified from its
//! origin tag alone; a composite is classified from its daughters'
//! classifications and the generated decay they point to. The result is written
//! onto each candidate in the tree.
//!
//! When several conditions occur together the worst one wins:
//! `WrongCombination` over `MissingDaughters` over `Exact`. `NoMatch` is reserved
//! for candidates with no leaf tracing to the reference at all. Every condition
//! seen is also recorded in [`TruthMatch::flags`].

use crate::event::Event;
use crate::types::{CandidateId, MatchClass, TruthMatch};
use std::collections::{BTreeMap, HashSet};

/// Condition bits recorded in `TruthMatch::flags` (the `mcErrors` variable)
pub mod flags {
    /// Everything traced correctly
    pub const CORRECT: u32 = 0;
    /// A final-state candidate has a different species than its origin
    pub const MIS_ID: u32 = 1;
    /// A reference daughter has no reconstructed counterpart
    pub const MISSING_PARTICLE: u32 = 2;
    /// A radiated photon of the reference decay was not reconstructed
    pub const MISSING_GAMMA: u32 = 4;
    /// Daughters come from different reference particles
    pub const DIFFERENT_MOTHERS: u32 = 8;
    /// The common reference mother has a different species than the candidate
    pub const WRONG_PARENT: u32 = 16;
    /// A leaf has no origin (background or unmatched)
    pub const NO_ORIGIN: u32 = 32;
    /// Two daughters trace to the same reference particle
    pub const DUPLICATE: u32 = 64;
}

/// Per-class counts from matching one list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub exact: usize,
    pub missing_daughters: usize,
    pub wrong_combination: usize,
    pub no_match: usize,
}

impl MatchSummary {
    fn record(&mut self, class: MatchClass) {
        match class {
            MatchClass::Exact => self.exact += 1,
            MatchClass::MissingDaughters => self.missing_daughters += 1,
            MatchClass::WrongCombination => self.wrong_combination += 1,
            MatchClass::NoMatch => self.no_match += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.exact + self.missing_daughters + self.wrong_combination + self.no_match
    }
}

/// Match one candidate and its whole tree, writing the result in place
pub fn match_candidate(event: &mut Event, id: CandidateId) -> MatchClass {
    let mut done = HashSet::new();
    match_recursive(event, id, &mut done).class
}

/// Match every candidate of a list
pub fn match_list(event: &mut Event, label: &str) -> crate::types::Result<MatchSummary> {
    let ids = event.store.get(label)?.to_vec();
    let mut summary = MatchSummary::default();
    let mut done = HashSet::new();
    for id in ids {
        summary.record(match_recursive(event, id, &mut done).class);
    }
    log::debug!("Truth matched '{}': {:?}", label, summary);
    Ok(summary)
}

/// Classify a candidate without writing anything
///
/// Used by generated-mode assembly to test combinations before they are kept.
pub(crate) fn classify(event: &Event, id: CandidateId) -> TruthMatch {
    let candidate = event.store.candidate(id);
    if candidate.is_final_state() {
        return classify_leaf(event, id);
    }
    let daughters: Vec<TruthMatch> = candidate
        .daughters()
        .iter()
        .map(|d| match event.store.candidate(*d).truth() {
            Some(t) => *t,
            None => classify(event, *d),
        })
        .collect();
    combine(event, candidate.pdg(), &daughters)
}

fn match_recursive(event: &mut Event, id: CandidateId, done: &mut HashSet<CandidateId>) -> TruthMatch {
    if done.contains(&id) {
        if let Some(t) = event.store.candidate(id).truth() {
            return *t;
        }
    }
    let daughters = event.store.candidate(id).daughters().to_vec();
    let result = if daughters.is_empty() {
        classify_leaf(event, id)
    } else {
        let matched: Vec<TruthMatch> = daughters
            .iter()
            .map(|d| match_recursive(event, *d, done))
            .collect();
        combine(event, event.store.candidate(id).pdg(), &matched)
    };
    event.store.candidate_mut(id).set_truth(result);
    done.insert(id);
    log::trace!("Truth match {}: {} (flags {:#x})", id, result.class, result.flags);
    result
}

fn classify_leaf(event: &Event, id: CandidateId) -> TruthMatch {
    let candidate = event.store.candidate(id);
    match candidate.origin().and_then(|i| event.mc.get(i).map(|p| (i, p))) {
        Some((index, particle)) if particle.pdg == candidate.pdg() => TruthMatch {
            class: MatchClass::Exact,
            mc_index: Some(index),
            flags: flags::CORRECT,
        },
        Some((index, _)) => TruthMatch {
            class: MatchClass::WrongCombination,
            mc_index: Some(index),
            flags: flags::MIS_ID,
        },
        None => TruthMatch { class: MatchClass::NoMatch, mc_index: None, flags: flags::NO_ORIGIN },
    }
}

/// Classify a composite from its daughters' results
fn combine(event: &Event, pdg: i32, daughters: &[TruthMatch]) -> TruthMatch {
    let mut bits = daughters.iter().fold(0, |acc, d| acc | d.flags);

    let traced: Vec<usize> = daughters.iter().filter_map(|d| d.mc_index).collect();
    if traced.is_empty() {
        return TruthMatch { class: MatchClass::NoMatch, mc_index: None, flags: bits | flags::NO_ORIGIN };
    }

    let mut worst = daughters
        .iter()
        .map(|d| d.class)
        .filter(|c| *c != MatchClass::NoMatch)
        .min_by_key(|c| c.quality())
        .unwrap_or(MatchClass::Exact);
    if daughters.iter().any(|d| d.class == MatchClass::NoMatch) {
        worst = downgrade(worst, MatchClass::MissingDaughters);
    }

    // Distinct daughters must trace to distinct reference particles
    let mut seen = HashSet::new();
    if !traced.iter().all(|i| seen.insert(*i)) {
        bits |= flags::DUPLICATE;
        worst = MatchClass::WrongCombination;
    }

    // Common mother: the mother every traced daughter agrees on
    let mut mothers: BTreeMap<Option<usize>, usize> = BTreeMap::new();
    for index in &traced {
        *mothers.entry(event.mc.mother(*index)).or_default() += 1;
    }
    let mother = match mothers.len() {
        1 => mothers.keys().next().copied().flatten(),
        _ => {
            bits |= flags::DIFFERENT_MOTHERS;
            worst = MatchClass::WrongCombination;
            // Keep the majority mother for reporting
            mothers
                .iter()
                .max_by_key(|(_, count)| **count)
                .and_then(|(m, _)| *m)
        }
    };

    let Some(mother) = mother else {
        bits |= flags::DIFFERENT_MOTHERS;
        return TruthMatch { class: MatchClass::WrongCombination, mc_index: None, flags: bits };
    };

    if event.mc.get(mother).map(|p| p.pdg) != Some(pdg) {
        bits |= flags::WRONG_PARENT;
        worst = MatchClass::WrongCombination;
    }

    // Reference daughters without a reconstructed counterpart
    for reference in event.mc.daughters(mother) {
        if traced.contains(reference) {
            continue;
        }
        if event.mc.get(*reference).map(|p| p.pdg) == Some(22) {
            bits |= flags::MISSING_GAMMA;
        } else {
            bits |= flags::MISSING_PARTICLE;
            worst = downgrade(worst, MatchClass::MissingDaughters);
        }
    }

    TruthMatch { class: worst, mc_index: Some(mother), flags: bits }
}

fn downgrade(current: MatchClass, to: MatchClass) -> MatchClass {
    if to.quality() < current.quality() {
        to
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventRecord, McParticle, TrackRecord};
    use crate::kinematics::{Beam, LorentzVector};
    use crate::types::Candidate;
    use std::collections::BTreeMap;

    fn mc(pdg: i32, mother: Option<usize>) -> McParticle {
        McParticle { pdg, mother, momentum: [0.1, 0.1, 0.1], energy: None, production_vertex: [0.0; 3] }
    }

    fn track(id: u32, charge: i32, mc_index: Option<usize>) -> TrackRecord {
        TrackRecord {
            id,
            charge,
            momentum: [0.1 * id as f64, 0.2, 0.3],
            position: [0.0; 3],
            position_error: 0.01,
            attributes: BTreeMap::new(),
            mc_index,
        }
    }

    /// D+ (0) -> pi+ (1) pi- (2) pi+ (3), plus an unrelated rho0 (4) -> pi+ (5)
    fn event(origins: [Option<usize>; 3]) -> (Event, CandidateId) {
        let record = EventRecord {
            event: 0,
            tracks: vec![track(0, 1, origins[0]), track(1, -1, origins[1]), track(2, 1, origins[2])],
            clusters: vec![],
            mc_particles: vec![
                mc(411, None),
                mc(211, Some(0)),
                mc(-211, Some(0)),
                mc(211, Some(0)),
                mc(113, None),
                mc(211, Some(4)),
            ],
        };
        let mut event = Event::from_record(record, Beam::default()).unwrap();
        let daughters = event.track_objects().to_vec();
        let d = event.store.insert(Candidate::composite(
            "D+",
            411,
            1,
            LorentzVector::default(),
            daughters,
        ));
        (event, d)
    }

    #[test]
    fn test_exact_match() {
        let (mut event, d) = event([Some(1), Some(2), Some(3)]);
        assert_eq!(match_candidate(&mut event, d), MatchClass::Exact);
        let truth = event.store.candidate(d).truth().unwrap();
        assert_eq!(truth.mc_index, Some(0));
        assert_eq!(truth.flags, flags::CORRECT);
        let leaf = event.track_objects()[1];
        assert_eq!(event.store.candidate(leaf).truth().unwrap().mc_index, Some(2));
    }

    #[test]
    fn test_missing_origin_downgrades() {
        let (mut event, d) = event([Some(1), None, Some(3)]);
        assert_eq!(match_candidate(&mut event, d), MatchClass::MissingDaughters);
        let truth = event.store.candidate(d).truth().unwrap();
        assert_ne!(truth.flags & flags::MISSING_PARTICLE, 0);
        assert_ne!(truth.flags & flags::NO_ORIGIN, 0);
    }

    #[test]
    fn test_no_leaf_traced() {
        let (mut event, d) = event([None, None, None]);
        assert_eq!(match_candidate(&mut event, d), MatchClass::NoMatch);
    }

    #[test]
    fn test_foreign_leaf_is_wrong_combination() {
        let (mut event, d) = event([Some(1), Some(2), Some(5)]);
        assert_eq!(match_candidate(&mut event, d), MatchClass::WrongCombination);
        let flags_seen = event.store.candidate(d).truth().unwrap().flags;
        assert_ne!(flags_seen & flags::DIFFERENT_MOTHERS, 0);
    }

    #[test]
    fn test_mis_id_is_wrong_combination() {
        // pi- track traced to a pi+ of the reference
        let (mut event, d) = event([Some(1), Some(3), None]);
        assert_eq!(match_candidate(&mut event, d), MatchClass::WrongCombination);
        assert_ne!(event.store.candidate(d).truth().unwrap().flags & flags::MIS_ID, 0);
    }

    #[test]
    fn test_wrong_parent_species() {
        let (mut event, _) = event([Some(1), Some(2), Some(3)]);
        let daughters = event.track_objects().to_vec();
        let ds = event.store.insert(Candidate::composite(
            "D_s+",
            431,
            1,
            LorentzVector::default(),
            daughters,
        ));
        assert_eq!(match_candidate(&mut event, ds), MatchClass::WrongCombination);
        assert_ne!(event.store.candidate(ds).truth().unwrap().flags & flags::WRONG_PARENT, 0);
    }

    #[test]
    fn test_match_list_summary() {
        let (mut event, d) = event([Some(1), Some(2), Some(3)]);
        event.store.append("D+", vec![d]);
        let summary = match_list(&mut event, "D+").unwrap();
        assert_eq!(summary.exact, 1);
        assert_eq!(summary.total(), 1);
        assert!(match_list(&mut event, "B-").is_err());
    }

    #[test]
    fn test_classify_does_not_write() {
        let (event, d) = event([Some(1), Some(2), Some(3)]);
        assert_eq!(classify(&event, d).class, MatchClass::Exact);
        assert!(event.store.candidate(d).truth().is_none());
    }
}
