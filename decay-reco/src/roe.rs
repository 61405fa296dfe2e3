//! Rest of event
//!
//! The rest of event of a signal candidate is every event object (track or
//! cluster) whose source is not a leaf of the signal tree. Masks select the
//! well-measured part of it for the event-shape features.

use crate::cut::Cut;
use crate::event::Event;
use crate::types::{CandidateId, RestOfEvent, Result, Source};
use crate::variables::VariableProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Mask definition as written in the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoeMaskConfig {
    pub name: String,
    #[serde(default)]
    pub track_cut: String,
    #[serde(default)]
    pub cluster_cut: String,
}

/// A compiled rest-of-event mask
#[derive(Debug, Clone)]
pub struct RoeMask {
    name: String,
    track_cut: Cut,
    cluster_cut: Cut,
}

impl RoeMask {
    pub fn compile(config: &RoeMaskConfig, provider: &dyn VariableProvider) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            track_cut: Cut::compile(&config.track_cut, provider)?,
            cluster_cut: Cut::compile(&config.cluster_cut, provider)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep the objects of a rest of event that pass the mask
    pub fn apply(&self, event: &Event, roe: &RestOfEvent, provider: &dyn VariableProvider) -> RestOfEvent {
        RestOfEvent {
            tracks: roe
                .tracks
                .iter()
                .copied()
                .filter(|id| self.track_cut.passes(provider, event, *id))
                .collect(),
            clusters: roe
                .clusters
                .iter()
                .copied()
                .filter(|id| self.cluster_cut.passes(provider, event, *id))
                .collect(),
        }
    }
}

/// Event objects not used by the signal candidate
pub fn rest_of_event(event: &Event, id: CandidateId) -> RestOfEvent {
    let used: HashSet<Source> = event.store.leaf_sources(id).into_iter().collect();
    let unused = |objects: &[CandidateId]| -> Vec<CandidateId> {
        objects
            .iter()
            .copied()
            .filter(|o| {
                event
                    .store
                    .candidate(*o)
                    .source()
                    .map_or(true, |s| !used.contains(&s))
            })
            .collect()
    };
    RestOfEvent {
        tracks: unused(event.track_objects()),
        clusters: unused(event.cluster_objects()),
    }
}

/// Build and attach the rest of event for every candidate of a list
///
/// Returns the number of candidates processed.
pub fn build_rest_of_event(event: &mut Event, label: &str) -> Result<usize> {
    let ids = event.store.get(label)?.to_vec();
    for id in &ids {
        let roe = rest_of_event(event, *id);
        log::trace!("{}: rest of event has {} objects", id, roe.len());
        event.store.candidate_mut(*id).set_rest_of_event(roe);
    }
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClusterRecord, EventRecord, TrackRecord};
    use crate::kinematics::{Beam, LorentzVector};
    use crate::types::Candidate;
    use crate::variables::VariableManager;
    use std::collections::BTreeMap;

    fn event() -> (Event, CandidateId) {
        let track = |id: u32, charge: i32, dr: f64| TrackRecord {
            id,
            charge,
            momentum: [0.2, 0.1 * id as f64, 0.3],
            position: [dr, 0.0, 0.0],
            position_error: 0.01,
            attributes: BTreeMap::new(),
            mc_index: None,
        };
        let cluster = |id: u32, e: f64| ClusterRecord {
            id,
            momentum: [0.0, e, 0.0],
            attributes: BTreeMap::new(),
            mc_index: None,
        };
        let record = EventRecord {
            event: 0,
            tracks: vec![track(0, 1, 0.0), track(1, -1, 0.0), track(2, 1, 0.1), track(3, -1, 5.0)],
            clusters: vec![cluster(0, 0.01), cluster(1, 0.5)],
            mc_particles: vec![],
        };
        let mut event = Event::from_record(record, Beam::default()).unwrap();

        // Signal uses a kaon hypothesis of track 0 and the pion of track 1
        let kaon = crate::event::track_candidate(&event.tracks[0], "K+").unwrap();
        let kaon = event.store.insert(kaon);
        let pion = event.track_objects()[1];
        let signal = event.store.insert(Candidate::composite(
            "K*0",
            313,
            0,
            LorentzVector::default(),
            vec![kaon, pion],
        ));
        (event, signal)
    }

    #[test]
    fn test_partition_by_source() {
        let (event, signal) = event();
        let roe = rest_of_event(&event, signal);
        let objects = event.track_objects();
        assert_eq!(roe.tracks, vec![objects[2], objects[3]]);
        assert_eq!(roe.clusters, event.cluster_objects());
        assert_eq!(roe.len(), 4);
    }

    #[test]
    fn test_mask() {
        let (event, signal) = event();
        let vm = VariableManager::new();
        let mask = RoeMask::compile(
            &RoeMaskConfig {
                name: "cleanMask".to_string(),
                track_cut: "abs(dr) < 2".to_string(),
                cluster_cut: "E > 0.05".to_string(),
            },
            &vm,
        )
        .unwrap();
        let masked = mask.apply(&event, &rest_of_event(&event, signal), &vm);
        assert_eq!(masked.tracks, vec![event.track_objects()[2]]);
        assert_eq!(masked.clusters, vec![event.cluster_objects()[1]]);
    }

    #[test]
    fn test_build_for_list() {
        let (mut event, signal) = event();
        event.store.append("K*0", vec![signal]);
        assert_eq!(build_rest_of_event(&mut event, "K*0").unwrap(), 1);
        assert_eq!(event.store.candidate(signal).rest_of_event().unwrap().len(), 4);
    }
}
