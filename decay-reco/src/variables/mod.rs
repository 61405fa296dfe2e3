//! Variables: named numeric functions of a candidate
//!
//! Variable names are resolved once, at configuration load, into [`Variable`]
//! values; evaluation never parses strings. Undefined values (a daughter index out
//! of range, a fit that never ran, truth on real data) evaluate to NaN.

pub mod manager;

pub use manager::{VariableManager, VariableProvider, VariablesConfig};

use crate::types::{PipelineError, Result};
use std::fmt;

/// Kinematic quantities, evaluable in the lab or the CMS frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kinematic {
    Px,
    Py,
    Pz,
    P,
    Pt,
    E,
    M,
    M2,
    CosTheta,
    Phi,
}

impl Kinematic {
    const ALL: [(&'static str, Kinematic); 11] = [
        ("px", Kinematic::Px),
        ("py", Kinematic::Py),
        ("pz", Kinematic::Pz),
        ("p", Kinematic::P),
        ("pt", Kinematic::Pt),
        ("E", Kinematic::E),
        ("M", Kinematic::M),
        ("InvM", Kinematic::M),
        ("M2", Kinematic::M2),
        ("cosTheta", Kinematic::CosTheta),
        ("phi", Kinematic::Phi),
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, k)| *k)
    }

    fn name(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, k)| k == self)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }
}

/// Truth quantities read from the matched generated particle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Truth {
    IsSignal,
    IsSignalAcceptMissing,
    McErrors,
    McPdg,
    GenMotherPdg,
    McE,
    McP,
    McPx,
    McPy,
    McPz,
    McPt,
}

impl Truth {
    const ALL: [(&'static str, Truth); 11] = [
        ("isSignal", Truth::IsSignal),
        ("isSignalAcceptMissing", Truth::IsSignalAcceptMissing),
        ("mcErrors", Truth::McErrors),
        ("mcPDG", Truth::McPdg),
        ("genMotherPDG", Truth::GenMotherPdg),
        ("mcE", Truth::McE),
        ("mcP", Truth::McP),
        ("mcPX", Truth::McPx),
        ("mcPY", Truth::McPy),
        ("mcPZ", Truth::McPz),
        ("mcPT", Truth::McPt),
    ];

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().find(|(n, _)| *n == name).map(|(_, t)| *t)
    }

    fn name(&self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, t)| t == self)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }
}

/// Event-shape quantities from the continuum-suppression extractor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shape {
    R2,
    ThrustBm,
    ThrustOm,
    CosTbto,
    CosTbz,
    /// CLEO cone 1..=9
    CleoCone(u8),
    /// KSFW moment by name (`et`, `mm2`, `hso00`, ..., `hoo4`)
    Ksfw(String),
}

/// Names of the KSFW moments the extractor computes
pub const KSFW_NAMES: [&str; 18] = [
    "et", "mm2", "hso00", "hso01", "hso02", "hso03", "hso04", "hso10", "hso12", "hso14", "hso20",
    "hso22", "hso24", "hoo0", "hoo1", "hoo2", "hoo3", "hoo4",
];

/// Named variable collections, referenced as `@name` in variable lists
pub fn collection(name: &str) -> Option<&'static [&'static str]> {
    const KINEMATICS: &[&str] = &["px", "py", "pz", "pt", "p", "E"];
    const PID: &[&str] = &["pionID", "kaonID", "protonID", "electronID", "muonID", "deuteronID"];
    const MC_KINEMATICS: &[&str] = &["mcE", "mcP", "mcPX", "mcPY", "mcPZ", "mcPT"];
    const MC_TRUTH: &[&str] = &["isSignal", "mcErrors", "mcPDG"];
    const DELTAE_MBC: &[&str] = &["Mbc", "deltaE"];
    const TRACK_QUALITY: &[&str] = &["dr", "dz", "nCDCHits"];
    const VERTEX: &[&str] = &["x", "y", "z", "chiProb"];
    const ROE: &[&str] = &["roeNTracks", "roeNClusters", "roeE", "roeM"];
    match name {
        "kinematics" => Some(KINEMATICS),
        "pid" => Some(PID),
        "mc_kinematics" => Some(MC_KINEMATICS),
        "mc_truth" => Some(MC_TRUTH),
        "deltae_mbc" => Some(DELTAE_MBC),
        "track_quality" => Some(TRACK_QUALITY),
        "vertex" => Some(VERTEX),
        "roe" => Some(ROE),
        _ => None,
    }
}

/// Expand `@collection` entries of a variable list in place order
pub fn expand_collections(names: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match name.strip_prefix('@') {
            Some(collection_name) => {
                let members = collection(collection_name).ok_or_else(|| {
                    PipelineError::UnknownVariable(format!("unknown collection '{}'", name))
                })?;
                out.extend(members.iter().map(|m| m.to_string()));
            }
            None => out.push(name.clone()),
        }
    }
    Ok(out)
}

/// A compiled variable reference
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    Kinematic(Kinematic),
    /// `useCMSFrame(var)`: evaluate a variable in the CMS frame
    Cms(Box<Variable>),
    /// `daughter(i, var)`: evaluate a variable on the i-th daughter
    Daughter(usize, Box<Variable>),
    Charge,
    Pdg,
    NDaughters,
    Mbc,
    DeltaE,
    X,
    Y,
    Z,
    Dr,
    Dz,
    ChiProb,
    Truth(Truth),
    IsContinuumEvent,
    Shape(Shape),
    RoeNTracks,
    RoeNClusters,
    RoeE,
    RoeM,
    /// Precomputed attribute supplied by the input feed
    Attribute(String),
}

impl Variable {
    /// Parse a variable name against the built-in catalogue
    ///
    /// `resolve_other` handles plain identifiers that are not built in (input
    /// attributes and aliases).
    pub(crate) fn parse<F>(name: &str, resolve_other: &F) -> Result<Variable>
    where
        F: Fn(&str) -> Result<Variable>,
    {
        let name = name.trim();
        if let Some((function, args)) = split_call(name)? {
            return Self::parse_call(name, function, &args, resolve_other);
        }

        if let Some(k) = Kinematic::from_name(name) {
            return Ok(Variable::Kinematic(k));
        }
        if let Some(t) = Truth::from_name(name) {
            return Ok(Variable::Truth(t));
        }
        let builtin = match name {
            "charge" => Some(Variable::Charge),
            "PDG" => Some(Variable::Pdg),
            "nDaughters" => Some(Variable::NDaughters),
            "Mbc" => Some(Variable::Mbc),
            "deltaE" => Some(Variable::DeltaE),
            "x" => Some(Variable::X),
            "y" => Some(Variable::Y),
            "z" => Some(Variable::Z),
            "dr" => Some(Variable::Dr),
            "dz" => Some(Variable::Dz),
            "chiProb" => Some(Variable::ChiProb),
            "isContinuumEvent" => Some(Variable::IsContinuumEvent),
            "R2" => Some(Variable::Shape(Shape::R2)),
            "thrustBm" => Some(Variable::Shape(Shape::ThrustBm)),
            "thrustOm" => Some(Variable::Shape(Shape::ThrustOm)),
            "cosTBTO" => Some(Variable::Shape(Shape::CosTbto)),
            "cosTBz" => Some(Variable::Shape(Shape::CosTbz)),
            "roeNTracks" => Some(Variable::RoeNTracks),
            "roeNClusters" => Some(Variable::RoeNClusters),
            "roeE" => Some(Variable::RoeE),
            "roeM" => Some(Variable::RoeM),
            _ => None,
        };
        match builtin {
            Some(v) => Ok(v),
            None => resolve_other(name),
        }
    }

    fn parse_call<F>(full: &str, function: &str, args: &[&str], resolve_other: &F) -> Result<Variable>
    where
        F: Fn(&str) -> Result<Variable>,
    {
        let bad_args = || {
            PipelineError::UnknownVariable(format!("{} (wrong arguments for {})", full, function))
        };
        match function {
            "daughter" => {
                if args.len() != 2 {
                    return Err(bad_args());
                }
                let index: usize = args[0].trim().parse().map_err(|_| bad_args())?;
                let inner = Self::parse(args[1], resolve_other)?;
                Ok(Variable::Daughter(index, Box::new(inner)))
            }
            "useCMSFrame" => {
                if args.len() != 1 {
                    return Err(bad_args());
                }
                let inner = Self::parse(args[0], resolve_other)?;
                Ok(Variable::Cms(Box::new(inner)))
            }
            "CleoConeCS" => {
                let cone: u8 = match args {
                    [one] => one.trim().parse().map_err(|_| bad_args())?,
                    _ => return Err(bad_args()),
                };
                if !(1..=9).contains(&cone) {
                    return Err(bad_args());
                }
                Ok(Variable::Shape(Shape::CleoCone(cone)))
            }
            "KSFWVariables" => match args {
                [one] if KSFW_NAMES.contains(&one.trim()) => {
                    Ok(Variable::Shape(Shape::Ksfw(one.trim().to_string())))
                }
                _ => Err(bad_args()),
            },
            _ => Err(PipelineError::UnknownVariable(full.to_string())),
        }
    }

    /// True if this variable depends on the frame it is evaluated in
    pub fn is_kinematic(&self) -> bool {
        matches!(self, Variable::Kinematic(_))
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::Kinematic(k) => write!(f, "{}", k.name()),
            Variable::Cms(inner) => write!(f, "useCMSFrame({})", inner),
            Variable::Daughter(i, inner) => write!(f, "daughter({}, {})", i, inner),
            Variable::Charge => write!(f, "charge"),
            Variable::Pdg => write!(f, "PDG"),
            Variable::NDaughters => write!(f, "nDaughters"),
            Variable::Mbc => write!(f, "Mbc"),
            Variable::DeltaE => write!(f, "deltaE"),
            Variable::X => write!(f, "x"),
            Variable::Y => write!(f, "y"),
            Variable::Z => write!(f, "z"),
            Variable::Dr => write!(f, "dr"),
            Variable::Dz => write!(f, "dz"),
            Variable::ChiProb => write!(f, "chiProb"),
            Variable::Truth(t) => write!(f, "{}", t.name()),
            Variable::IsContinuumEvent => write!(f, "isContinuumEvent"),
            Variable::Shape(Shape::R2) => write!(f, "R2"),
            Variable::Shape(Shape::ThrustBm) => write!(f, "thrustBm"),
            Variable::Shape(Shape::ThrustOm) => write!(f, "thrustOm"),
            Variable::Shape(Shape::CosTbto) => write!(f, "cosTBTO"),
            Variable::Shape(Shape::CosTbz) => write!(f, "cosTBz"),
            Variable::Shape(Shape::CleoCone(i)) => write!(f, "CleoConeCS({})", i),
            Variable::Shape(Shape::Ksfw(name)) => write!(f, "KSFWVariables({})", name),
            Variable::RoeNTracks => write!(f, "roeNTracks"),
            Variable::RoeNClusters => write!(f, "roeNClusters"),
            Variable::RoeE => write!(f, "roeE"),
            Variable::RoeM => write!(f, "roeM"),
            Variable::Attribute(name) => write!(f, "{}", name),
        }
    }
}

/// Split `name(a, b)` into `("name", ["a", "b"])`, respecting nested parentheses
///
/// Returns `None` for a plain identifier.
pub(crate) fn split_call(text: &str) -> Result<Option<(&str, Vec<&str>)>> {
    let Some(open) = text.find('(') else {
        return Ok(None);
    };
    if !text.ends_with(')') {
        return Err(PipelineError::UnknownVariable(text.to_string()));
    }
    let function = text[..open].trim();
    let inner = &text[open + 1..text.len() - 1];

    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PipelineError::UnknownVariable(text.to_string()))?;
            }
            ',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PipelineError::UnknownVariable(text.to_string()));
    }
    if !inner.trim().is_empty() {
        args.push(inner[start..].trim());
    }
    Ok(Some((function, args)))
}

/// Turn a variable name into a column-safe identifier
///
/// `KSFWVariables(hso00)` → `KSFWVariables_bo_hso00_bc`, `daughter(0, M)` →
/// `daughter_bo_0__cm_M_bc`.
pub fn column_safe(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    for c in name.chars() {
        match c {
            '(' => out.push_str("_bo"),
            ')' => out.push_str("_bc"),
            ',' => out.push_str("__cm"),
            ' ' => {}
            ':' => out.push_str("_co"),
            '+' => out.push_str("_pl"),
            '-' => out.push_str("_mi"),
            '*' => out.push_str("_st"),
            '/' => out.push_str("_sl"),
            '.' => out.push_str("_pt"),
            c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}
