//! Particle species table
//!
//! Maps species labels used in list names and decay strings (`"pi+"`, `"D+"`,
//! `"anti-D0"`) to PDG codes, nominal masses and charges. A list label may carry a
//! `:suffix` (`"B-:ch1"`); the species is the part before the colon.

/// Static data for one particle species
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Species {
    pub name: &'static str,
    pub pdg: i32,
    /// Nominal mass in GeV
    pub mass: f64,
    /// Charge in units of the positron charge
    pub charge: i32,
}

const fn species(name: &'static str, pdg: i32, mass: f64, charge: i32) -> Species {
    Species { name, pdg, mass, charge }
}

static TABLE: &[Species] = &[
    species("e-", 11, 0.000_510_999, -1),
    species("e+", -11, 0.000_510_999, 1),
    species("mu-", 13, 0.105_658, -1),
    species("mu+", -13, 0.105_658, 1),
    species("gamma", 22, 0.0, 0),
    species("pi0", 111, 0.134_977, 0),
    species("pi+", 211, 0.139_570, 1),
    species("pi-", -211, 0.139_570, -1),
    species("rho0", 113, 0.775_26, 0),
    species("eta", 221, 0.547_862, 0),
    species("K_S0", 310, 0.497_611, 0),
    species("K+", 321, 0.493_677, 1),
    species("K-", -321, 0.493_677, -1),
    species("K*0", 313, 0.895_55, 0),
    species("anti-K*0", -313, 0.895_55, 0),
    species("p+", 2212, 0.938_272, 1),
    species("anti-p-", -2212, 0.938_272, -1),
    species("deuteron", 1_000_010_020, 1.875_613, 1),
    species("D0", 421, 1.864_84, 0),
    species("anti-D0", -421, 1.864_84, 0),
    species("D+", 411, 1.869_66, 1),
    species("D-", -411, 1.869_66, -1),
    species("D_s+", 431, 1.968_35, 1),
    species("D_s-", -431, 1.968_35, -1),
    species("D*0", 423, 2.006_85, 0),
    species("anti-D*0", -423, 2.006_85, 0),
    species("D*+", 413, 2.010_26, 1),
    species("D*-", -413, 2.010_26, -1),
    species("D_2*0", 425, 2.460_7, 0),
    species("anti-D_2*0", -425, 2.460_7, 0),
    species("J/psi", 443, 3.096_900, 0),
    species("B0", 511, 5.279_65, 0),
    species("anti-B0", -511, 5.279_65, 0),
    species("B+", 521, 5.279_34, 1),
    species("B-", -521, 5.279_34, -1),
    species("Upsilon(4S)", 300_553, 10.579_4, 0),
];

/// Species part of a list label: `"B-:ch1"` → `"B-"`
pub fn species_name(label: &str) -> &str {
    label.split(':').next().unwrap_or(label)
}

/// Look up a species by list label or species name
pub fn lookup(label: &str) -> Option<&'static Species> {
    let name = species_name(label);
    TABLE.iter().find(|s| s.name == name)
}

/// Look up a species by PDG code
pub fn by_pdg(pdg: i32) -> Option<&'static Species> {
    TABLE.iter().find(|s| s.pdg == pdg)
}

/// The antiparticle; species without a table entry for `-pdg` are their own
pub fn antiparticle(species: &'static Species) -> &'static Species {
    by_pdg(-species.pdg).unwrap_or(species)
}

/// Charge-conjugate list label: `"D+:kpipi"` → `"D-:kpipi"`
///
/// Labels of unknown species are returned unchanged.
pub fn conjugate_label(label: &str) -> String {
    let Some(species) = lookup(label) else {
        return label.to_string();
    };
    let name = antiparticle(species).name;
    match label.split_once(':') {
        Some((_, suffix)) => format!("{}:{}", name, suffix),
        None => name.to_string(),
    }
}

/// True for B mesons, used to flag continuum (non-BB) events
pub fn is_b_meson(pdg: i32) -> bool {
    matches!(pdg.abs(), 511 | 521 | 531)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_strips_suffix() {
        let b = lookup("B-:ch1").unwrap();
        assert_eq!(b.pdg, -521);
        assert_eq!(b.charge, -1);
        assert_eq!(species_name("B-:ch1"), "B-");
        assert_eq!(species_name("pi+"), "pi+");
    }

    #[test]
    fn test_by_pdg() {
        assert_eq!(by_pdg(411).unwrap().name, "D+");
        assert_eq!(by_pdg(-321).unwrap().name, "K-");
        assert!(by_pdg(999_999).is_none());
    }

    #[test]
    fn test_unknown_species() {
        assert!(lookup("X(3872)").is_none());
    }

    #[test]
    fn test_conjugates() {
        assert_eq!(conjugate_label("D+:kpipi"), "D-:kpipi");
        assert_eq!(conjugate_label("B-:ch1"), "B+:ch1");
        assert_eq!(conjugate_label("anti-D0"), "D0");
        assert_eq!(conjugate_label("pi0"), "pi0");
        assert_eq!(conjugate_label("rho0:x"), "rho0:x");
        assert_eq!(antiparticle(lookup("K-").unwrap()).name, "K+");
        assert_eq!(antiparticle(lookup("gamma").unwrap()).name, "gamma");
    }

    #[test]
    fn test_b_meson_flag() {
        assert!(is_b_meson(-521));
        assert!(is_b_meson(511));
        assert!(!is_b_meson(411));
    }
}
