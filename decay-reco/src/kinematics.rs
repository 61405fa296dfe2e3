//! Four-vectors and the beam rest frame
//!
//! Everything is in GeV with c = 1. The centre-of-mass (CMS) frame is the rest
//! frame of the colliding beams described by [`Beam`].

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

/// Energy-momentum four-vector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LorentzVector {
    pub px: f64,
    pub py: f64,
    pub pz: f64,
    pub e: f64,
}

impl LorentzVector {
    pub const fn new(px: f64, py: f64, pz: f64, e: f64) -> Self {
        Self { px, py, pz, e }
    }

    /// Four-vector of a particle with the given momentum and mass hypothesis
    pub fn from_momentum_mass(p: Vector3<f64>, mass: f64) -> Self {
        let e = (p.norm_squared() + mass * mass).sqrt();
        Self::new(p.x, p.y, p.z, e)
    }

    pub fn momentum(&self) -> Vector3<f64> {
        Vector3::new(self.px, self.py, self.pz)
    }

    pub fn p(&self) -> f64 {
        self.momentum().norm()
    }

    pub fn pt(&self) -> f64 {
        self.px.hypot(self.py)
    }

    pub fn m2(&self) -> f64 {
        self.e * self.e - self.momentum().norm_squared()
    }

    /// Invariant mass, clamped at zero for slightly space-like vectors
    pub fn mass(&self) -> f64 {
        self.m2().max(0.0).sqrt()
    }

    pub fn cos_theta(&self) -> f64 {
        let p = self.p();
        if p > 0.0 {
            self.pz / p
        } else {
            1.0
        }
    }

    pub fn phi(&self) -> f64 {
        self.py.atan2(self.px)
    }

    /// Velocity of this four-vector's rest frame
    pub fn boost_vector(&self) -> Vector3<f64> {
        self.momentum() / self.e
    }

    /// Lorentz-boost by velocity `beta`
    pub fn boost(&self, beta: &Vector3<f64>) -> Self {
        let b2 = beta.norm_squared();
        if b2 <= 0.0 {
            return *self;
        }
        let gamma = 1.0 / (1.0 - b2).sqrt();
        let p = self.momentum();
        let bp = beta.dot(&p);
        let gamma2 = (gamma - 1.0) / b2;
        let p_new = p + beta * (gamma2 * bp + gamma * self.e);
        Self::new(p_new.x, p_new.y, p_new.z, gamma * (self.e + bp))
    }
}

impl Add for LorentzVector {
    type Output = LorentzVector;

    fn add(self, rhs: LorentzVector) -> LorentzVector {
        LorentzVector::new(self.px + rhs.px, self.py + rhs.py, self.pz + rhs.pz, self.e + rhs.e)
    }
}

impl Sub for LorentzVector {
    type Output = LorentzVector;

    fn sub(self, rhs: LorentzVector) -> LorentzVector {
        LorentzVector::new(self.px - rhs.px, self.py - rhs.py, self.pz - rhs.pz, self.e - rhs.e)
    }
}

impl AddAssign for LorentzVector {
    fn add_assign(&mut self, rhs: LorentzVector) {
        *self = *self + rhs;
    }
}

impl Sum for LorentzVector {
    fn sum<I: Iterator<Item = LorentzVector>>(iter: I) -> Self {
        iter.fold(LorentzVector::default(), |acc, v| acc + v)
    }
}

/// Collider beam parameters
///
/// Defaults are the nominal SuperKEKB energies: a 7.004 GeV electron beam and a
/// 4.002 GeV positron beam crossing at 83 mrad.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    /// High-energy ring (electron) beam energy
    #[serde(default = "default_her_energy")]
    pub her_energy: f64,
    /// Low-energy ring (positron) beam energy
    #[serde(default = "default_ler_energy")]
    pub ler_energy: f64,
    /// Full crossing angle in radians, split symmetrically about the z axis
    #[serde(default = "default_crossing_angle")]
    pub crossing_angle: f64,
}

fn default_her_energy() -> f64 {
    7.004
}

fn default_ler_energy() -> f64 {
    4.002
}

fn default_crossing_angle() -> f64 {
    0.083
}

impl Default for Beam {
    fn default() -> Self {
        Self {
            her_energy: default_her_energy(),
            ler_energy: default_ler_energy(),
            crossing_angle: default_crossing_angle(),
        }
    }
}

impl Beam {
    /// Symmetric beams colliding head-on, CMS equals lab
    pub fn symmetric(beam_energy: f64) -> Self {
        Self {
            her_energy: beam_energy,
            ler_energy: beam_energy,
            crossing_angle: 0.0,
        }
    }

    /// Total initial-state four-momentum in the lab frame
    pub fn p4(&self) -> LorentzVector {
        let half = 0.5 * self.crossing_angle;
        let her = LorentzVector::new(self.her_energy * half.sin(), 0.0, self.her_energy * half.cos(), self.her_energy);
        let ler = LorentzVector::new(self.ler_energy * half.sin(), 0.0, -self.ler_energy * half.cos(), self.ler_energy);
        her + ler
    }

    /// Centre-of-mass energy
    pub fn sqrt_s(&self) -> f64 {
        self.p4().mass()
    }

    /// Energy of each beam in the CMS frame
    pub fn cms_beam_energy(&self) -> f64 {
        0.5 * self.sqrt_s()
    }

    /// Transform a lab four-vector into the CMS frame
    pub fn to_cms(&self, p4: &LorentzVector) -> LorentzVector {
        p4.boost(&(-self.p4().boost_vector()))
    }
}
