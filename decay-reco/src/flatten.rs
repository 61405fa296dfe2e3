//! Attribute flattening
//!
//! A [`Tabulator`] turns each surviving candidate of one list into an
//! [`OutputRow`]: fixed bookkeeping fields followed by `<role>_<variable>`
//! columns for every role in the template and plain columns for top-level
//! variables.
//!
//! Roles are explicit positions in the decay tree. They come either from a
//! decay descriptor with `^` marks plus one prefix per mark, or from a list of
//! named roles located by tree path or by species.

use crate::descriptor::{self, DescriptorNode};
use crate::event::Event;
use crate::particles;
use crate::store::CandidateStore;
use crate::types::{CandidateId, PipelineError, Result};
use crate::variables::{column_safe, expand_collections, Variable, VariableProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One role as written in the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Column prefix
    pub name: String,
    /// Daughter indices from the top-level candidate (`[0, 1]`)
    #[serde(default)]
    pub path: Option<Vec<usize>>,
    /// Species that must occur exactly once in the tree
    #[serde(default)]
    pub species: Option<String>,
    /// Variables for this role in addition to the shared role variables
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Output table definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Table name passed to the sink
    #[serde(default = "default_table_name")]
    pub name: String,
    /// Top-level candidate list, one row per surviving candidate
    pub list: String,
    /// Decay descriptor with `^` marking roles
    #[serde(default)]
    pub descriptor: Option<String>,
    /// One prefix per `^` of the descriptor, in order
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Explicit roles
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    /// Variables evaluated for every role
    #[serde(default)]
    pub role_variables: Vec<String>,
    /// Variables evaluated on the top-level candidate, unprefixed
    #[serde(default)]
    pub variables: Vec<String>,
}

fn default_table_name() -> String {
    "tree".to_string()
}

impl TableConfig {
    pub fn new(list: impl Into<String>) -> Self {
        Self { name: default_table_name(), list: list.into(), ..Default::default() }
    }

    /// Builder method: roles from a descriptor and its prefixes
    pub fn with_descriptor(mut self, descriptor: impl Into<String>, prefixes: &[&str]) -> Self {
        self.descriptor = Some(descriptor.into());
        self.prefixes = prefixes.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Builder method: add an explicit role
    pub fn with_role(mut self, role: RoleConfig) -> Self {
        self.roles.push(role);
        self
    }

    /// Builder method: variables for every role
    pub fn with_role_variables(mut self, names: &[&str]) -> Self {
        self.role_variables.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Builder method: top-level variables
    pub fn with_variables(mut self, names: &[&str]) -> Self {
        self.variables.extend(names.iter().map(|n| n.to_string()));
        self
    }
}

/// One flattened candidate
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub event: u64,
    /// Position of the candidate in its list
    pub candidate: usize,
    /// Number of surviving candidates in the list for this event
    pub n_candidates: usize,
    /// One value per column of the tabulator
    pub values: Vec<f64>,
}

/// How a role finds its node
#[derive(Debug, Clone, PartialEq)]
enum Locator {
    /// Index into the selected nodes of the descriptor walk
    Descriptor(usize),
    Path(Vec<usize>),
    Species(String),
}

#[derive(Debug, Clone)]
struct Role {
    name: String,
    locator: Locator,
    variables: Vec<Variable>,
}

/// Compiled flattening template for one list
#[derive(Debug, Clone)]
pub struct Tabulator {
    table: String,
    list: String,
    descriptor: Option<DescriptorNode>,
    roles: Vec<Role>,
    top: Vec<Variable>,
    columns: Vec<String>,
}

impl Tabulator {
    /// Compile a table definition; unknown variables and column clashes fail here
    pub fn new(config: &TableConfig, provider: &dyn VariableProvider) -> Result<Self> {
        let resolve = |names: &[String]| -> Result<Vec<(String, Variable)>> {
            expand_collections(names)?
                .into_iter()
                .map(|name| provider.resolve(&name).map(|v| (name, v)))
                .collect()
        };
        let shared = resolve(&config.role_variables)?;

        let mut roles = Vec::new();
        let mut descriptor_root = None;
        if let Some(text) = &config.descriptor {
            let root = descriptor::parse(text)?;
            if particles::species_name(&root.label) != particles::species_name(&config.list) {
                return Err(PipelineError::RoleResolution {
                    role: root.label.clone(),
                    reason: format!("descriptor head does not match list '{}'", config.list),
                });
            }
            let selected = root.selected_paths();
            if selected.len() != config.prefixes.len() {
                return Err(PipelineError::InvalidConfig(format!(
                    "descriptor '{}' marks {} particles but {} prefixes are given",
                    text,
                    selected.len(),
                    config.prefixes.len()
                )));
            }
            for (index, prefix) in config.prefixes.iter().enumerate() {
                roles.push((prefix.clone(), Locator::Descriptor(index), shared.clone()));
            }
            descriptor_root = Some(root);
        } else if !config.prefixes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "prefixes given without a descriptor".to_string(),
            ));
        }

        for role in &config.roles {
            let locator = match (&role.path, &role.species) {
                (Some(path), None) => Locator::Path(path.clone()),
                (None, Some(species)) => Locator::Species(species.clone()),
                _ => {
                    return Err(PipelineError::InvalidConfig(format!(
                        "role '{}' needs exactly one of path or species",
                        role.name
                    )))
                }
            };
            let mut variables = shared.clone();
            variables.extend(resolve(&role.variables)?);
            roles.push((role.name.clone(), locator, variables));
        }

        let top = resolve(&config.variables)?;

        let mut columns = Vec::new();
        let mut names = HashSet::new();
        let mut seen = HashSet::new();
        for (name, _, variables) in &roles {
            if !names.insert(name.clone()) {
                return Err(PipelineError::InvalidConfig(format!("duplicate role '{}'", name)));
            }
            for (variable, _) in variables {
                columns.push(format!("{}_{}", name, column_safe(variable)));
            }
        }
        columns.extend(top.iter().map(|(name, _)| column_safe(name)));
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate output column '{}'",
                    column
                )));
            }
        }

        Ok(Self {
            table: config.name.clone(),
            list: config.list.clone(),
            descriptor: descriptor_root,
            roles: roles
                .into_iter()
                .map(|(name, locator, variables)| Role {
                    name,
                    locator,
                    variables: variables.into_iter().map(|(_, v)| v).collect(),
                })
                .collect(),
            top: top.into_iter().map(|(_, v)| v).collect(),
            columns,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn list(&self) -> &str {
        &self.list
    }

    /// Value columns in row order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The descriptor the roles come from, if any
    pub fn descriptor(&self) -> Option<&DescriptorNode> {
        self.descriptor.as_ref()
    }

    /// Flatten one candidate
    pub fn flatten(
        &self,
        event: &Event,
        id: CandidateId,
        provider: &dyn VariableProvider,
    ) -> Result<Vec<f64>> {
        // Lists built with their charge conjugate also hold the antiparticle
        let conjugate =
            event.store.candidate(id).species() != particles::species_name(&self.list);
        let marked = match &self.descriptor {
            Some(root) => {
                let mut out = Vec::new();
                walk_descriptor(&event.store, id, root, conjugate, &mut out)?;
                out
            }
            None => Vec::new(),
        };

        let mut values = Vec::with_capacity(self.columns.len());
        for role in &self.roles {
            let node = match &role.locator {
                Locator::Descriptor(index) => marked.get(*index).copied().ok_or_else(|| {
                    PipelineError::RoleResolution {
                        role: role.name.clone(),
                        reason: "marked particle not found".to_string(),
                    }
                })?,
                Locator::Path(path) => follow_path(&event.store, id, path).ok_or_else(|| {
                    PipelineError::RoleResolution {
                        role: role.name.clone(),
                        reason: format!("no node at path {:?}", path),
                    }
                })?,
                Locator::Species(species) => {
                    find_species(&event.store, id, species, conjugate, &role.name)?
                }
            };
            values.extend(role.variables.iter().map(|v| provider.value(event, node, v)));
        }
        values.extend(self.top.iter().map(|v| provider.value(event, id, v)));
        Ok(values)
    }

    /// One row per surviving candidate of the list, in list order
    pub fn rows(&self, event: &Event, provider: &dyn VariableProvider) -> Result<Vec<OutputRow>> {
        let survivors: Vec<CandidateId> = event
            .store
            .get(&self.list)?
            .iter()
            .copied()
            .filter(|id| event.store.candidate(*id).survives())
            .collect();
        let n_candidates = survivors.len();
        survivors
            .into_iter()
            .enumerate()
            .map(|(candidate, id)| {
                Ok(OutputRow {
                    event: event.number,
                    candidate,
                    n_candidates,
                    values: self.flatten(event, id, provider)?,
                })
            })
            .collect()
    }
}

/// Species a descriptor entry stands for in a candidate tree, which may be the
/// charge conjugate of the one written
fn expected_species(name: &str, conjugate: bool) -> &str {
    if !conjugate {
        return name;
    }
    particles::lookup(name).map_or(name, |s| particles::antiparticle(s).name)
}

/// Match the descriptor against the candidate tree, collecting marked nodes
///
/// Descriptor daughters are matched in order to the first unused candidate
/// daughter of the same species, which is the assembly order for a descriptor
/// written like the decay it describes.
fn walk_descriptor(
    store: &CandidateStore,
    id: CandidateId,
    node: &DescriptorNode,
    conjugate: bool,
    out: &mut Vec<CandidateId>,
) -> Result<()> {
    let candidate = store.candidate(id);
    if candidate.species() != expected_species(node.species(), conjugate) {
        return Err(PipelineError::RoleResolution {
            role: node.label.clone(),
            reason: format!("found '{}' instead", candidate.species()),
        });
    }
    if node.selected {
        out.push(id);
    }
    if node.daughters.is_empty() {
        return Ok(());
    }

    let daughters = candidate.daughters();
    let mut used = vec![false; daughters.len()];
    for child in &node.daughters {
        let wanted = expected_species(child.species(), conjugate);
        let slot = (0..daughters.len())
            .find(|&j| !used[j] && store.candidate(daughters[j]).species() == wanted)
            .ok_or_else(|| PipelineError::RoleResolution {
                role: child.label.clone(),
                reason: format!("absent from the daughters of '{}'", node.label),
            })?;
        used[slot] = true;
        walk_descriptor(store, daughters[slot], child, conjugate, out)?;
    }
    Ok(())
}

fn follow_path(store: &CandidateStore, id: CandidateId, path: &[usize]) -> Option<CandidateId> {
    path.iter()
        .try_fold(id, |current, index| store.candidate(current).daughters().get(*index).copied())
}

fn find_species(
    store: &CandidateStore,
    id: CandidateId,
    species: &str,
    conjugate: bool,
    role: &str,
) -> Result<CandidateId> {
    let wanted = expected_species(particles::species_name(species), conjugate);
    let matches: Vec<CandidateId> = store
        .tree(id)
        .into_iter()
        .filter(|n| store.candidate(*n).species() == wanted)
        .collect();
    match matches.as_slice() {
        [one] => Ok(*one),
        [] => Err(PipelineError::RoleResolution {
            role: role.to_string(),
            reason: format!("no '{}' in the decay tree", species),
        }),
        _ => Err(PipelineError::RoleResolution {
            role: role.to_string(),
            reason: format!("'{}' occurs {} times in the decay tree", species, matches.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventRecord, TrackRecord};
    use crate::kinematics::{Beam, LorentzVector};
    use crate::types::Candidate;
    use crate::variables::VariableManager;
    use std::collections::BTreeMap;

    /// B- -> [D0 -> K- pi+] pi-
    fn event() -> (Event, CandidateId) {
        let track = |id: u32, charge: i32| TrackRecord {
            id,
            charge,
            momentum: [0.1 * (id + 1) as f64, 0.2, 0.3],
            position: [0.0; 3],
            position_error: 0.01,
            attributes: BTreeMap::from([("pionID".to_string(), id as f64)]),
            mc_index: None,
        };
        let record = EventRecord {
            event: 5,
            tracks: vec![track(0, -1), track(1, 1), track(2, -1)],
            ..Default::default()
        };
        let mut event = Event::from_record(record, Beam::default()).unwrap();
        let kaon = crate::event::track_candidate(&event.tracks[0], "K-").unwrap();
        let kaon = event.store.insert(kaon);
        let objects = event.track_objects().to_vec();
        let d0 = event.store.insert(Candidate::composite(
            "D0",
            421,
            0,
            LorentzVector::default(),
            vec![kaon, objects[1]],
        ));
        let b = event.store.insert(Candidate::composite(
            "B-",
            -521,
            -1,
            LorentzVector::default(),
            vec![d0, objects[2]],
        ));
        event.store.append("B-:ch1", vec![b]);
        (event, b)
    }

    #[test]
    fn test_descriptor_roles() {
        let vm = VariableManager::new();
        let (event, b) = event();
        let config = TableConfig::new("B-:ch1")
            .with_descriptor("^B-:ch1 -> [^D0 -> K- ^pi+] ^pi-", &["B", "D", "pip", "pim"])
            .with_role_variables(&["pionID", "charge"])
            .with_variables(&["M"]);
        let tabulator = Tabulator::new(&config, &vm).unwrap();
        assert_eq!(
            tabulator.columns(),
            &[
                "B_pionID", "B_charge", "D_pionID", "D_charge", "pip_pionID", "pip_charge",
                "pim_pionID", "pim_charge", "M"
            ]
        );

        let values = tabulator.flatten(&event, b, &vm).unwrap();
        assert_eq!(values.len(), tabulator.columns().len());
        assert!(values[0].is_nan());
        assert_eq!(values[1], -1.0);
        assert_eq!(values[3], 0.0);
        assert_eq!(values[4], 1.0);
        assert_eq!(values[6], 2.0);
    }

    #[test]
    fn test_explicit_roles() {
        let vm = VariableManager::new();
        let (event, b) = event();
        let config = TableConfig::new("B-:ch1")
            .with_role(RoleConfig {
                name: "K".to_string(),
                path: Some(vec![0, 0]),
                ..Default::default()
            })
            .with_role(RoleConfig {
                name: "D".to_string(),
                species: Some("D0".to_string()),
                variables: vec!["nDaughters".to_string()],
                ..Default::default()
            })
            .with_role_variables(&["PDG"]);
        let tabulator = Tabulator::new(&config, &vm).unwrap();
        assert_eq!(tabulator.columns(), &["K_PDG", "D_PDG", "D_nDaughters"]);
        assert_eq!(tabulator.flatten(&event, b, &vm).unwrap(), vec![-321.0, 421.0, 2.0]);
    }

    #[test]
    fn test_unresolvable_roles() {
        let vm = VariableManager::new();
        let (event, b) = event();
        let unique = TableConfig::new("B-:ch1").with_role(RoleConfig {
            name: "pi".to_string(),
            species: Some("pi-".to_string()),
            ..Default::default()
        });
        assert!(Tabulator::new(&unique, &vm).unwrap().flatten(&event, b, &vm).is_ok());

        let absent = TableConfig::new("B-:ch1").with_role(RoleConfig {
            name: "x".to_string(),
            path: Some(vec![3]),
            ..Default::default()
        });
        assert!(matches!(
            Tabulator::new(&absent, &vm).unwrap().flatten(&event, b, &vm),
            Err(PipelineError::RoleResolution { .. })
        ));

        let mismatch = TableConfig::new("B-:ch1")
            .with_descriptor("^B-:ch1 -> [^D+ -> ^K- ^pi+ ^pi+] ^pi-", &["B", "D", "K", "p1", "p2", "m"]);
        assert!(matches!(
            Tabulator::new(&mismatch, &vm).unwrap().flatten(&event, b, &vm),
            Err(PipelineError::RoleResolution { .. })
        ));
    }

    #[test]
    fn test_ambiguous_species_role() {
        let vm = VariableManager::new();
        let (mut event, _) = event();
        let objects = event.track_objects().to_vec();
        let rho = event.store.insert(Candidate::composite(
            "rho0",
            113,
            0,
            LorentzVector::default(),
            vec![objects[0], objects[2]],
        ));
        let config = TableConfig::new("rho0").with_role(RoleConfig {
            name: "pim".to_string(),
            species: Some("pi-".to_string()),
            ..Default::default()
        });
        let tabulator = Tabulator::new(&config, &vm).unwrap();
        assert!(matches!(
            tabulator.flatten(&event, rho, &vm),
            Err(PipelineError::RoleResolution { .. })
        ));

        let config = TableConfig::new("B-:ch1").with_role(RoleConfig {
            name: "any".to_string(),
            ..Default::default()
        });
        assert!(matches!(Tabulator::new(&config, &vm), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let vm = VariableManager::new();
        let config = TableConfig::new("B-:ch1").with_variables(&["M", "InvM", "M"]);
        assert!(matches!(Tabulator::new(&config, &vm), Err(PipelineError::InvalidConfig(_))));

        let config = TableConfig::new("B-:ch1")
            .with_descriptor("^B-:ch1 -> ^D+ pi- pi-", &["B"]);
        assert!(matches!(Tabulator::new(&config, &vm), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_rows_for_list() {
        let vm = VariableManager::new();
        let (event, _) = event();
        let tabulator = Tabulator::new(&TableConfig::new("B-:ch1").with_variables(&["charge"]), &vm).unwrap();
        let rows = tabulator.rows(&event, &vm).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event, 5);
        assert_eq!(rows[0].n_candidates, 1);
        assert_eq!(rows[0].values, vec![-1.0]);
    }

    #[test]
    fn test_conjugate_candidate_resolves_roles() {
        let vm = VariableManager::new();
        let (mut event, _) = event();
        // B+ -> [anti-D0 -> K+ pi-] pi+ appended to the B- list
        let objects = event.track_objects().to_vec();
        let kaon = crate::event::track_candidate(&event.tracks[1], "K+").unwrap();
        let kaon = event.store.insert(kaon);
        let pion = crate::event::track_candidate(&event.tracks[1], "pi+").unwrap();
        let pion = event.store.insert(pion);
        let d0 = event.store.insert(Candidate::composite(
            "anti-D0",
            -421,
            0,
            LorentzVector::default(),
            vec![kaon, objects[0]],
        ));
        let b = event.store.insert(Candidate::composite(
            "B+",
            521,
            1,
            LorentzVector::default(),
            vec![d0, pion],
        ));
        event.store.append("B-:ch1", vec![b]);

        let config = TableConfig::new("B-:ch1")
            .with_descriptor("^B-:ch1 -> [^D0 -> K- ^pi+] ^pi-", &["B", "D", "pip", "pim"])
            .with_role(RoleConfig {
                name: "K".to_string(),
                species: Some("K-".to_string()),
                ..Default::default()
            })
            .with_role_variables(&["PDG"]);
        let tabulator = Tabulator::new(&config, &vm).unwrap();
        assert_eq!(
            tabulator.flatten(&event, b, &vm).unwrap(),
            vec![521.0, -421.0, -211.0, 211.0, 321.0]
        );

        let rows = tabulator.rows(&event, &vm).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0], -521.0);
        assert_eq!(rows[1].values[0], 521.0);
    }
}
