//! Single-state Kalman step: helix propagation to a radius, chi2 and update.
//!
//! The state is [x, y, z, px, py, pz] in a uniform solenoidal field along z.
//! With `kappa = 0.00299792458 * B` the turning rate per unit transverse
//! path `s` is `omega = -q * kappa / pt`. Over `s` the momentum rotates by
//! `theta = omega * s` and, with `A = 1 / (pt * omega)`:
//!
//! ```text
//! x' = x + A * (px * sin(theta) - py * (1 - cos(theta)))
//! y' = y + A * (py * sin(theta) + px * (1 - cos(theta)))
//! z' = z + pz * s / pt
//! ```
//!
//! Zero charge or zero field moves along a straight line.
//!
//! The per-lane helpers here (`transport_to_radius` and friends) are shared
//! with the batched step so both paths produce the same parameters and
//! Jacobians; only the covariance algebra differs.

use crate::hit::Hit;
use crate::track::TrackState;
use nalgebra::{Matrix6, Vector6};
use std::f64::consts::TAU;

// ============================================================================
// LANE HELPERS
// ============================================================================

/// Parameters at the target radius and the transport Jacobian at fixed path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    pub params: [f32; 6],
    pub jacobian: [[f32; 6]; 6],
    /// Transverse path length travelled
    pub path: f32,
}

#[inline]
fn turning_rate(charge: i32, kappa: f64, pt: f64) -> Option<f64> {
    if charge == 0 || kappa == 0.0 {
        None
    } else {
        Some(-(charge as f64) * kappa / pt)
    }
}

/// Moves `params` forward along the helix until its transverse radius is
/// `radius`. Returns `None` when no forward intersection exists.
pub fn transport_to_radius(params: &[f32; 6], charge: i32, kappa: f32, radius: f32) -> Option<Transport> {
    let p = params.map(f64::from);
    let radius = f64::from(radius);
    let pt = p[3].hypot(p[4]);
    if !(pt > 0.0 && radius > 0.0 && radius.is_finite() && p.iter().all(|v| v.is_finite())) {
        return None;
    }
    let path = match turning_rate(charge, f64::from(kappa), pt) {
        None => straight_path(&p, pt, radius)?,
        Some(omega) => helix_path(&p, pt, omega, radius)?,
    };
    let moved = helix_at_path(&p, charge, f64::from(kappa), path);
    let jac = helix_jacobian(&p, charge, f64::from(kappa), path);
    Some(Transport {
        params: moved.map(|v| v as f32),
        jacobian: jac.map(|row| row.map(|v| v as f32)),
        path: path as f32,
    })
}

/// First non-negative path at which a straight line reaches `radius`.
fn straight_path(p: &[f64; 6], pt: f64, radius: f64) -> Option<f64> {
    let (ux, uy) = (p[3] / pt, p[4] / pt);
    let b = p[0] * ux + p[1] * uy;
    let c = p[0] * p[0] + p[1] * p[1] - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let root = disc.sqrt();
    [-b - root, -b + root].into_iter().find(|&t| t >= 0.0)
}

/// First non-negative path at which the helix reaches `radius`, from the
/// intersection of the projected helix circle with the layer circle.
fn helix_path(p: &[f64; 6], pt: f64, omega: f64, radius: f64) -> Option<f64> {
    let a_coef = 1.0 / (pt * omega);
    let (cx, cy) = (p[0] - a_coef * p[4], p[1] + a_coef * p[3]);
    let rho = (1.0 / omega).abs();
    let d = cx.hypot(cy);
    if d < 1e-12 || radius > d + rho || radius < (d - rho).abs() {
        return None;
    }
    let along = (radius * radius - rho * rho + d * d) / (2.0 * d);
    let across = (radius * radius - along * along).max(0.0).sqrt();
    let (ux, uy) = (cx / d, cy / d);
    let start = (p[1] - cy).atan2(p[0] - cx);

    [1.0, -1.0]
        .into_iter()
        .map(|sign| {
            let (qx, qy) = (along * ux - sign * across * uy, along * uy + sign * across * ux);
            let turn = (qy - cy).atan2(qx - cx) - start;
            // rotation about the center has the sign of omega
            let turn = if omega > 0.0 {
                turn.rem_euclid(TAU)
            } else {
                -(-turn).rem_euclid(TAU)
            };
            turn / omega
        })
        .filter(|s| s.is_finite() && *s >= 0.0)
        .reduce(f64::min)
}

/// Helix parameters after transverse path `s`.
pub fn helix_at_path(p: &[f64; 6], charge: i32, kappa: f64, s: f64) -> [f64; 6] {
    let pt = p[3].hypot(p[4]);
    let [x, y, z, px, py, pz] = *p;
    match turning_rate(charge, kappa, pt) {
        None => {
            let f = s / pt;
            [x + px * f, y + py * f, z + pz * f, px, py, pz]
        }
        Some(omega) => {
            let a_coef = 1.0 / (pt * omega);
            let theta = omega * s;
            let (sin_t, cos_t) = theta.sin_cos();
            let one_minus_cos = 2.0 * (0.5 * theta).sin().powi(2);
            [
                x + a_coef * (px * sin_t - py * one_minus_cos),
                y + a_coef * (py * sin_t + px * one_minus_cos),
                z + pz * s / pt,
                px * cos_t - py * sin_t,
                py * cos_t + px * sin_t,
                pz,
            ]
        }
    }
}

/// d(helix_at_path) / d(params) at fixed `s`.
pub fn helix_jacobian(p: &[f64; 6], charge: i32, kappa: f64, s: f64) -> [[f64; 6]; 6] {
    let pt = p[3].hypot(p[4]);
    let [_, _, _, px, py, pz] = *p;
    let pt2 = pt * pt;
    let pt3 = pt2 * pt;

    let mut j = [[0.0; 6]; 6];
    for (i, row) in j.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    j[2][3] = -pz * s * px / pt3;
    j[2][4] = -pz * s * py / pt3;
    j[2][5] = s / pt;

    match turning_rate(charge, kappa, pt) {
        None => {
            j[0][3] = s * py * py / pt3;
            j[0][4] = -s * px * py / pt3;
            j[1][3] = -s * px * py / pt3;
            j[1][4] = s * px * px / pt3;
        }
        Some(omega) => {
            let a_coef = 1.0 / (pt * omega);
            let theta = omega * s;
            let (sin_t, cos_t) = theta.sin_cos();
            let one_minus_cos = 2.0 * (0.5 * theta).sin().powi(2);
            let new_px = px * cos_t - py * sin_t;
            let new_py = py * cos_t + px * sin_t;
            // theta = omega(pt) * s with omega proportional to 1/pt
            let dtheta_dpx = -theta * px / pt2;
            let dtheta_dpy = -theta * py / pt2;

            j[0][3] = a_coef * (sin_t + new_px * dtheta_dpx);
            j[0][4] = a_coef * (-one_minus_cos + new_px * dtheta_dpy);
            j[1][3] = a_coef * (one_minus_cos + new_py * dtheta_dpx);
            j[1][4] = a_coef * (sin_t + new_py * dtheta_dpy);
            j[3][3] = cos_t - new_py * dtheta_dpx;
            j[3][4] = -sin_t - new_py * dtheta_dpy;
            j[4][3] = sin_t + new_px * dtheta_dpx;
            j[4][4] = cos_t + new_px * dtheta_dpy;
        }
    }
    j
}

/// A chi2 is compatible when finite, non-negative and below the cut.
/// Zero is accepted so that a hit exactly on the prediction is kept.
#[inline]
pub fn accept_chi2(chi2: f32, cut: f32) -> bool {
    chi2.is_finite() && chi2 >= 0.0 && chi2 < cut
}

// ============================================================================
// SINGLE-STATE STEP
// ============================================================================

/// Propagates `state` to the transverse `radius`; the result is invalid if
/// the helix cannot reach it or the numbers blow up.
pub fn propagate(state: &TrackState, radius: f32, kappa: f32) -> TrackState {
    let mut out = state.clone();
    let params: [f32; 6] = state.params.into();
    match transport_to_radius(&params, state.charge, kappa, radius) {
        Some(t) => {
            let jac = Matrix6::from_fn(|i, k| t.jacobian[i][k]);
            out.params = Vector6::from(t.params);
            out.covariance = jac * state.covariance * jac.transpose();
            out.check_finite();
        }
        None => out.valid = false,
    }
    out
}

/// Mahalanobis distance between the predicted position and `hit`.
///
/// Returns `+inf` when the residual covariance is singular.
pub fn compute_chi2(state: &TrackState, hit: &Hit) -> f32 {
    let resid_cov = state.position_covariance() + hit.covariance;
    let Some(inv) = resid_cov.try_inverse() else {
        return f32::INFINITY;
    };
    let resid = hit.position - state.position();
    resid.dot(&(inv * resid))
}

/// Kalman update of `state` with the position measurement `hit`.
pub fn update(state: &TrackState, hit: &Hit) -> TrackState {
    let mut out = state.clone();
    let resid_cov = state.position_covariance() + hit.covariance;
    let Some(inv) = resid_cov.try_inverse() else {
        out.valid = false;
        return out;
    };
    let p = &state.covariance;
    let gain = p.fixed_view::<6, 3>(0, 0) * inv;
    let resid = hit.position - state.position();
    out.params = state.params + gain * resid;
    let updated = p - gain * p.fixed_view::<3, 6>(0, 0);
    out.covariance = (updated + updated.transpose()) * 0.5;
    out.check_finite();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CURVATURE_PER_TESLA;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    const KAPPA: f32 = CURVATURE_PER_TESLA * 3.8;

    fn state(momentum: Vector3<f32>, charge: i32) -> TrackState {
        TrackState::new(Vector3::zeros(), momentum, Matrix6::identity() * 0.01, charge)
    }

    #[test]
    fn test_straight_line_without_field() {
        let s = state(Vector3::new(1.0, 0.0, 0.5), 1);
        let out = propagate(&s, 10.0, 0.0);
        assert!(out.valid);
        assert_relative_eq!(out.params[0], 10.0, epsilon = 1e-5);
        assert_relative_eq!(out.params[1], 0.0, epsilon = 1e-5);
        assert_relative_eq!(out.params[2], 5.0, epsilon = 1e-5);
    }

    #[test]
    fn test_neutral_moves_straight_in_field() {
        let s = state(Vector3::new(0.0, 2.0, 0.0), 0);
        let out = propagate(&s, 4.0, KAPPA);
        assert_relative_eq!(out.params[1], 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_helix_lands_on_radius() {
        let s = state(Vector3::new(1.0, 0.3, 0.4), -1);
        let out = propagate(&s, 20.0, KAPPA);
        assert!(out.valid);
        assert_relative_eq!(out.r(), 20.0, epsilon = 1e-3);
        assert_relative_eq!(out.pt(), s.pt(), epsilon = 1e-4);
        assert_relative_eq!(out.params[5], 0.4);
    }

    #[test]
    fn test_positive_charge_bends_clockwise() {
        let out = propagate(&state(Vector3::new(1.0, 0.0, 0.0), 1), 10.0, KAPPA);
        assert!(out.params[1] < 0.0);
        let out = propagate(&state(Vector3::new(1.0, 0.0, 0.0), -1), 10.0, KAPPA);
        assert!(out.params[1] > 0.0);
    }

    #[test]
    fn test_looper_cannot_reach_outer_layer() {
        // radius of curvature ~ 8.8 cm, so the helix never leaves r ~ 17.6 cm
        let out = propagate(&state(Vector3::new(0.1, 0.0, 0.0), 1), 30.0, KAPPA);
        assert!(!out.valid);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let p = [1.0, -2.0, 0.5, 0.8, 0.6, 0.3];
        let (charge, kappa, s) = (1, f64::from(KAPPA), 12.0);
        let jac = helix_jacobian(&p, charge, kappa, s);
        let h = 1e-6;
        for k in 0..6 {
            let (mut up, mut down) = (p, p);
            up[k] += h;
            down[k] -= h;
            let (fu, fd) = (helix_at_path(&up, charge, kappa, s), helix_at_path(&down, charge, kappa, s));
            for i in 0..6 {
                let numeric = (fu[i] - fd[i]) / (2.0 * h);
                assert_relative_eq!(jac[i][k], numeric, epsilon = 1e-5, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn test_chi2_of_known_residual() {
        let mut s = state(Vector3::new(1.0, 0.0, 0.0), 1);
        s.covariance = Matrix6::identity();
        let hit = Hit::new(Vector3::new(1.0, 0.0, 0.0), Matrix3::identity());
        assert_relative_eq!(compute_chi2(&s, &hit), 0.5, epsilon = 1e-6);
        let exact = Hit::new(Vector3::zeros(), Matrix3::identity());
        assert_relative_eq!(compute_chi2(&s, &exact), 0.0);
    }

    #[test]
    fn test_update_pulls_toward_hit_and_shrinks_covariance() {
        let mut s = state(Vector3::new(1.0, 0.0, 0.0), 1);
        s.covariance = Matrix6::identity();
        let hit = Hit::new(Vector3::new(1.0, 0.0, 0.0), Matrix3::identity());
        let out = update(&s, &hit);
        assert!(out.valid);
        assert_relative_eq!(out.params[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(out.covariance[(0, 0)], 0.5, epsilon = 1e-6);
        assert!(out.covariance.trace() < s.covariance.trace());
        assert_eq!(out.covariance, out.covariance.transpose());
    }

    #[test]
    fn test_chi2_acceptance() {
        assert!(accept_chi2(0.0, 15.0));
        assert!(accept_chi2(14.9, 15.0));
        assert!(!accept_chi2(15.0, 15.0));
        assert!(!accept_chi2(-0.1, 15.0));
        assert!(!accept_chi2(f32::NAN, 15.0));
        assert!(!accept_chi2(f32::INFINITY, 15.0));
    }
}
