//! Continuum-suppression event-shape features
//!
//! Everything is computed in the CMS frame from two sets of particles: the
//! final-state leaves of the signal candidate and the (masked) rest of event.
//! The functions here hold no state; the same inputs always give the same
//! features.

use crate::event::Event;
use crate::roe::RoeMask;
use crate::types::{CandidateId, ContinuumFeatures, RestOfEvent};
use crate::variables::VariableProvider;
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// Thrust iterations per seed axis
const THRUST_ITERATIONS: usize = 16;

/// A particle as seen by the shape calculations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeParticle {
    /// CMS momentum
    pub p: Vector3<f64>,
    pub charge: i32,
}

/// Legendre polynomials P0..P4
fn legendre(l: usize, x: f64) -> f64 {
    match l {
        0 => 1.0,
        1 => x,
        2 => 0.5 * (3.0 * x * x - 1.0),
        3 => 0.5 * (5.0 * x * x * x - 3.0 * x),
        4 => (35.0 * x.powi(4) - 30.0 * x * x + 3.0) / 8.0,
        _ => f64::NAN,
    }
}

fn cos_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let norm = a.norm() * b.norm();
    if norm == 0.0 {
        0.0
    } else {
        (a.dot(b) / norm).clamp(-1.0, 1.0)
    }
}

/// Thrust axis and magnitude of a set of momenta
///
/// Each particle direction seeds an iteration `n ← Σ sign(p·n) p`; the best
/// converged axis wins. An empty set has zero thrust and a zero axis.
pub fn thrust(momenta: &[Vector3<f64>]) -> (Vector3<f64>, f64) {
    let total: f64 = momenta.iter().map(|p| p.norm()).sum();
    if total == 0.0 {
        return (Vector3::zeros(), 0.0);
    }

    let mut best = (Vector3::zeros(), 0.0);
    for seed in momenta.iter().filter(|p| p.norm() > 0.0) {
        let mut axis = seed.normalize();
        for _ in 0..THRUST_ITERATIONS {
            let next: Vector3<f64> = momenta
                .iter()
                .map(|p| if p.dot(&axis) >= 0.0 { *p } else { -*p })
                .sum();
            if next.norm() == 0.0 {
                break;
            }
            let next = next.normalize();
            if (next - axis).norm() < 1e-12 {
                axis = next;
                break;
            }
            axis = next;
        }
        let value = momenta.iter().map(|p| p.dot(&axis).abs()).sum::<f64>() / total;
        if value > best.1 {
            best = (axis, value);
        }
    }
    best
}

/// Fox-Wolfram moment ratio H2/H0
pub fn fox_wolfram_r2(momenta: &[Vector3<f64>]) -> f64 {
    let mut h0 = 0.0;
    let mut h2 = 0.0;
    for a in momenta {
        for b in momenta {
            let weight = a.norm() * b.norm();
            h0 += weight;
            h2 += weight * legendre(2, cos_between(a, b));
        }
    }
    if h0 == 0.0 {
        0.0
    } else {
        h2 / h0
    }
}

/// Momentum flow in 10° cones around an axis, folded into 0..90°
pub fn cleo_cones(momenta: &[Vector3<f64>], axis: &Vector3<f64>) -> [f64; 9] {
    let mut cones = [0.0; 9];
    if axis.norm() == 0.0 {
        return cones;
    }
    for p in momenta {
        let angle = cos_between(p, axis).abs().acos().to_degrees();
        let bin = ((angle / 10.0) as usize).min(8);
        cones[bin] += p.norm();
    }
    cones
}

/// Kakuno-Super-Fox-Wolfram moments
///
/// `sqrt_s` is the collision energy and `signal_e` the CMS energy of the signal
/// candidate; moments are normalised by `2 (E_beam - ΔE)`. Energies of the
/// visible particles are taken as massless.
pub fn ksfw_moments(
    signal: &[ShapeParticle],
    roe: &[ShapeParticle],
    sqrt_s: f64,
    signal_e: f64,
) -> BTreeMap<String, f64> {
    let e_beam = 0.5 * sqrt_s;
    let delta_e = signal_e - e_beam;
    let norm = 2.0 * (e_beam - delta_e);

    let all: Vec<&ShapeParticle> = signal.iter().chain(roe).collect();
    let p_sum: Vector3<f64> = all.iter().map(|s| s.p).sum();
    let e_sum: f64 = all.iter().map(|s| s.p.norm()).sum();
    let missing = -p_sum;

    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    out.insert("et".to_string(), all.iter().map(|s| s.p.xy().norm()).sum::<f64>());
    out.insert("mm2".to_string(), (sqrt_s - e_sum).powi(2) - p_sum.norm_squared());

    // Signal-other moments: charged (0), neutral (1) and missing (2) categories
    let charged: Vec<&ShapeParticle> = roe.iter().filter(|s| s.charge != 0).collect();
    let neutral: Vec<&ShapeParticle> = roe.iter().filter(|s| s.charge == 0).collect();
    let missing_particle = ShapeParticle { p: missing, charge: 0 };
    let categories: [(usize, Vec<&ShapeParticle>); 3] =
        [(0, charged), (1, neutral), (2, vec![&missing_particle])];

    for (c, others) in &categories {
        for l in 0..=4 {
            // Odd moments only exist for charged particles, weighted by charge product
            if l % 2 == 1 && *c != 0 {
                continue;
            }
            let mut h = 0.0;
            for i in signal {
                for j in others {
                    let w = if l % 2 == 1 { (i.charge * j.charge) as f64 } else { 1.0 };
                    h += w * j.p.norm() * legendre(l, cos_between(&i.p, &j.p));
                }
            }
            out.insert(format!("hso{}{}", c, l), if norm == 0.0 { 0.0 } else { h / norm });
        }
    }

    for l in 0..=4 {
        let mut h = 0.0;
        for j in roe {
            for k in roe {
                let w = if l % 2 == 1 { (j.charge * k.charge) as f64 } else { 1.0 };
                h += w * j.p.norm() * k.p.norm() * legendre(l, cos_between(&j.p, &k.p));
            }
        }
        out.insert(format!("hoo{}", l), if norm == 0.0 { 0.0 } else { h / (norm * norm) });
    }
    out
}

/// The full feature battery for one signal and rest-of-event set
pub fn compute(
    signal: &[ShapeParticle],
    roe: &[ShapeParticle],
    sqrt_s: f64,
    signal_e: f64,
) -> ContinuumFeatures {
    let signal_p: Vec<Vector3<f64>> = signal.iter().map(|s| s.p).collect();
    let roe_p: Vec<Vector3<f64>> = roe.iter().map(|s| s.p).collect();
    let all_p: Vec<Vector3<f64>> = signal_p.iter().chain(&roe_p).copied().collect();

    let (axis_b, thrust_bm) = thrust(&signal_p);
    let (axis_o, thrust_om) = thrust(&roe_p);

    ContinuumFeatures {
        r2: fox_wolfram_r2(&all_p),
        thrust_bm,
        thrust_om,
        cos_tbto: cos_between(&axis_b, &axis_o).abs(),
        cos_tbz: cos_between(&axis_b, &Vector3::z()).abs(),
        cleo_cones: cleo_cones(&roe_p, &axis_b),
        ksfw: ksfw_moments(signal, roe, sqrt_s, signal_e),
    }
}

fn shape_particles(event: &Event, ids: impl IntoIterator<Item = CandidateId>) -> Vec<ShapeParticle> {
    ids.into_iter()
        .map(|id| {
            let candidate = event.store.candidate(id);
            ShapeParticle {
                p: event.beam.to_cms(candidate.p4()).momentum(),
                charge: candidate.charge(),
            }
        })
        .collect()
}

/// Features for one signal candidate against a rest of event
pub fn features(event: &Event, id: CandidateId, roe: &RestOfEvent) -> ContinuumFeatures {
    let signal = shape_particles(event, event.store.leaves(id));
    let others = shape_particles(event, roe.iter());
    let signal_e = event.beam.to_cms(event.store.candidate(id).p4()).e;
    compute(&signal, &others, event.beam.sqrt_s(), signal_e)
}

/// Compute and attach continuum-suppression features for every candidate of a list
///
/// Candidates need a rest of event; those without one are skipped. The mask, if
/// given, is applied to the stored rest of event first.
pub fn build_continuum_suppression(
    event: &mut Event,
    label: &str,
    mask: Option<&RoeMask>,
    provider: &dyn VariableProvider,
) -> crate::types::Result<usize> {
    let ids = event.store.get(label)?.to_vec();
    let mut built = 0;
    for id in ids {
        let Some(roe) = event.store.candidate(id).rest_of_event().cloned() else {
            log::warn!("{} in '{}' has no rest of event, skipping shape features", id, label);
            continue;
        };
        let roe = match mask {
            Some(mask) => mask.apply(event, &roe, provider),
            None => roe,
        };
        let result = features(event, id, &roe);
        event.store.candidate_mut(id).set_continuum(result);
        built += 1;
    }
    Ok(built)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::KSFW_NAMES;
    use approx::assert_relative_eq;

    fn particle(x: f64, y: f64, z: f64, charge: i32) -> ShapeParticle {
        ShapeParticle { p: Vector3::new(x, y, z), charge }
    }

    #[test]
    fn test_back_to_back_thrust() {
        let momenta = [Vector3::new(0.0, 0.0, 2.0), Vector3::new(0.0, 0.0, -2.0)];
        let (axis, t) = thrust(&momenta);
        assert_relative_eq!(t, 1.0, epsilon = 1e-12);
        assert_relative_eq!(axis.z.abs(), 1.0, epsilon = 1e-12);
        assert_eq!(thrust(&[]).1, 0.0);
    }

    #[test]
    fn test_r2_jet_like_vs_isotropic() {
        let jet = [Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)];
        assert_relative_eq!(fox_wolfram_r2(&jet), 1.0, epsilon = 1e-12);

        let iso = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -1.0),
        ];
        assert_relative_eq!(fox_wolfram_r2(&iso), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cleo_cones_fold() {
        let axis = Vector3::new(0.0, 0.0, 1.0);
        let momenta = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.0, -0.5),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        let cones = cleo_cones(&momenta, &axis);
        assert_relative_eq!(cones[0], 1.5, epsilon = 1e-12);
        assert_relative_eq!(cones[8], 2.0, epsilon = 1e-12);
        assert_relative_eq!(cones[1..8].iter().sum::<f64>(), 0.0);
    }

    #[test]
    fn test_feature_battery() {
        let signal = [particle(0.0, 0.0, 1.0, 1), particle(0.0, 0.0, -1.0, -1)];
        let roe = [
            particle(1.0, 0.0, 0.0, 1),
            particle(-1.0, 0.0, 0.0, -1),
            particle(0.0, 0.5, 0.0, 0),
        ];
        let f = compute(&signal, &roe, 10.58, 5.29);
        assert_relative_eq!(f.thrust_bm, 1.0, epsilon = 1e-12);
        assert_relative_eq!(f.cos_tbz, 1.0, epsilon = 1e-12);
        // Other-side thrust axis lies in the x-y plane
        assert_relative_eq!(f.cos_tbto, 0.0, epsilon = 1e-12);
        assert_relative_eq!(f.cleo_cones[8], 2.5, epsilon = 1e-12);
        for name in KSFW_NAMES {
            assert!(f.ksfw.contains_key(name), "missing {}", name);
        }
        assert_eq!(f.ksfw.len(), KSFW_NAMES.len());
        assert_relative_eq!(f.ksfw["et"], 2.5, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_rest_of_event() {
        let signal = [particle(0.0, 0.0, 1.0, 1), particle(0.0, 0.0, -1.0, -1)];
        let f = compute(&signal, &[], 10.58, 5.29);
        assert_eq!(f.thrust_om, 0.0);
        assert_eq!(f.cleo_cones, [0.0; 9]);
        assert_eq!(f.ksfw["hoo0"], 0.0);
    }
}
