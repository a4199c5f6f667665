//! Batched Kalman step over `N` track states sharing one target radius.
//!
//! Parameters and Jacobians come from the shared lane helpers in
//! [`crate::kalman`]; the covariance algebra (`J P J^T`, residual covariance
//! inversion, gain and update) runs on [`BatchMatrix`] across all lanes.

use crate::batch_matrix::{BatchMatrix, BatchVector};
use crate::error::MatrixError;
use crate::hit::Hit;
use crate::kalman::transport_to_radius;
use crate::track::TrackState;
use nalgebra::{Matrix6, Vector6};

/// Up to `N` hits, one per lane.
#[derive(Debug, Clone)]
pub struct BatchedHits<const N: usize> {
    pos: BatchVector<3, N>,
    cov: BatchMatrix<3, 3, N>,
    present: [bool; N],
}

impl<const N: usize> Default for BatchedHits<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BatchedHits<N> {
    /// Empty lanes carry an identity covariance so inversion stays finite.
    pub fn new() -> Self {
        Self {
            pos: BatchVector::zeros(),
            cov: BatchMatrix::identity(),
            present: [false; N],
        }
    }

    pub fn set(&mut self, lane: usize, hit: &Hit) {
        self.pos.copy_in(lane, &hit.position);
        self.cov.copy_in(lane, &hit.covariance);
        self.present[lane] = true;
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn is_present(&self, lane: usize) -> bool {
        self.present[lane]
    }
}

/// `N` track states in lane-interleaved form.
#[derive(Debug, Clone)]
pub struct BatchedStates<const N: usize> {
    params: BatchVector<6, N>,
    cov: BatchMatrix<6, 6, N>,
    charge: [i32; N],
    valid: [bool; N],
    len: usize,
}

impl<const N: usize> BatchedStates<N> {
    /// Packs at most `N` states; unused lanes are invalid.
    pub fn load<'a>(states: impl IntoIterator<Item = &'a TrackState>) -> Self {
        let mut out = Self {
            params: BatchVector::zeros(),
            cov: BatchMatrix::identity(),
            charge: [0; N],
            valid: [false; N],
            len: 0,
        };
        for (lane, state) in states.into_iter().take(N).enumerate() {
            out.params.copy_in(lane, &state.params);
            out.cov.copy_in(lane, &state.covariance);
            out.charge[lane] = state.charge;
            out.valid[lane] = state.valid;
            out.len = lane + 1;
        }
        out
    }

    /// Occupied lanes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_valid(&self, lane: usize) -> bool {
        self.valid[lane]
    }

    /// Unpacks one lane.
    pub fn state(&self, lane: usize) -> TrackState {
        let params: Vector6<f32> = self.params.copy_out(lane);
        let covariance: Matrix6<f32> = self.cov.copy_out(lane);
        TrackState {
            params,
            covariance,
            charge: self.charge[lane],
            valid: self.valid[lane],
        }
    }

    /// Propagates every valid lane to `radius`. Lanes that cannot reach it
    /// become invalid.
    pub fn propagate_to_radius(&mut self, radius: f32, kappa: f32) {
        let mut jac = BatchMatrix::<6, 6, N>::identity();
        for lane in 0..self.len {
            if !self.valid[lane] {
                continue;
            }
            let mut params = [0.0f32; 6];
            for (i, p) in params.iter_mut().enumerate() {
                *p = self.params.get(i, 0, lane);
            }
            match transport_to_radius(&params, self.charge[lane], kappa, radius) {
                Some(t) => {
                    for i in 0..6 {
                        self.params.set(i, 0, lane, t.params[i]);
                        for k in 0..6 {
                            jac.set(i, k, lane, t.jacobian[i][k]);
                        }
                    }
                }
                None => self.valid[lane] = false,
            }
        }
        let jp = BatchMatrix::multiply(&jac, &self.cov);
        self.cov = BatchMatrix::multiply(&jp, &jac.transpose());
        self.refresh_validity();
    }

    /// Residual and inverted residual covariance against `hits`.
    fn residual(&self, hits: &BatchedHits<N>) -> Result<(BatchVector<3, N>, BatchMatrix<3, 3, N>), MatrixError> {
        let mut resid_cov = self.cov.block::<3, 3>(0, 0);
        resid_cov.add_assign(&hits.cov);
        resid_cov.invert_cramer()?;
        let mut resid = hits.pos;
        resid.sub_assign(&self.params.block::<3, 1>(0, 0));
        Ok((resid, resid_cov))
    }

    /// Chi2 per lane; `+inf` for invalid lanes and lanes without a hit.
    pub fn compute_chi2(&self, hits: &BatchedHits<N>) -> Result<[f32; N], MatrixError> {
        let (resid, inv) = self.residual(hits)?;
        let weighted = BatchVector::<3, N>::multiply_general(&inv, &resid);
        let mut chi2 = [0.0f32; N];
        for i in 0..3 {
            let (r, w) = (resid.element(i, 0), weighted.element(i, 0));
            for n in 0..N {
                chi2[n] += r[n] * w[n];
            }
        }
        for (n, c) in chi2.iter_mut().enumerate() {
            if !(self.valid[n] && hits.present[n]) {
                *c = f32::INFINITY;
            }
        }
        Ok(chi2)
    }

    /// Kalman update of the lanes that have a hit; other lanes are untouched.
    pub fn update(&mut self, hits: &BatchedHits<N>) -> Result<(), MatrixError> {
        let (resid, inv) = self.residual(hits)?;
        let gain = BatchMatrix::<6, 3, N>::multiply_general(&self.cov.block::<6, 3>(0, 0), &inv);

        let mut params = self.params;
        params.add_assign(&BatchVector::<6, N>::multiply_general(&gain, &resid));
        let mut cov = self.cov;
        cov.sub_assign(&BatchMatrix::<6, 6, N>::multiply_general(&gain, &self.cov.block::<3, 6>(0, 0)));
        cov.symmetrize();

        for n in 0..self.len {
            if !(self.valid[n] && hits.present[n]) {
                continue;
            }
            for i in 0..6 {
                self.params.set(i, 0, n, params.get(i, 0, n));
                for k in 0..6 {
                    self.cov.set(i, k, n, cov.get(i, k, n));
                }
            }
        }
        self.refresh_validity();
        Ok(())
    }

    fn refresh_validity(&mut self) {
        for n in 0..self.len {
            if !self.valid[n] {
                continue;
            }
            let finite = (0..6).all(|i| {
                self.params.get(i, 0, n).is_finite() && (0..6).all(|k| self.cov.get(i, k, n).is_finite())
            });
            self.valid[n] = finite;
        }
    }
}
