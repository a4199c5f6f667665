//! Hit measurements and the angular helpers shared by the index and search.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};

/// A single position measurement on a layer. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Measured position [x, y, z] in cm
    pub position: Vector3<f32>,

    /// Symmetric 3×3 position covariance in cm²
    pub covariance: Matrix3<f32>,

    /// Simulated track that produced this hit (validation only)
    pub mc_track_id: Option<u32>,
}

impl Hit {
    pub fn new(position: Vector3<f32>, covariance: Matrix3<f32>) -> Self {
        Self {
            position,
            covariance,
            mc_track_id: None,
        }
    }

    pub fn with_mc_track(mut self, id: u32) -> Self {
        self.mc_track_id = Some(id);
        self
    }

    #[inline]
    pub fn r(&self) -> f32 {
        self.position.x.hypot(self.position.y)
    }

    #[inline]
    pub fn phi(&self) -> f32 {
        self.position.y.atan2(self.position.x)
    }

    #[inline]
    pub fn eta(&self) -> f32 {
        eta_of(self.r(), self.position.z)
    }
}

/// Pseudorapidity of a point at transverse radius `r` and longitudinal `z`.
#[inline]
pub fn eta_of(r: f32, z: f32) -> f32 {
    let theta = r.atan2(z);
    -(theta * 0.5).tan().ln()
}

/// Maps any angle into [-π, π).
#[inline]
pub fn normalized_phi(phi: f32) -> f32 {
    let wrapped = (phi + PI).rem_euclid(TAU) - PI;
    // rem_euclid can round up to TAU for tiny negative inputs
    if wrapped >= PI {
        wrapped - TAU
    } else {
        wrapped
    }
}
