//! Structure-of-arrays container for N independent small matrices.
//!
//! Element `(i, j)` of every lane is stored contiguously, so each scalar
//! operation of a matrix routine runs over `N` lanes with unit stride and the
//! compiler can vectorize the inner loop. The flat layout is
//! `data[(i * D2 + j) * N + n]`.
//!
//! Symmetric matrices are kept in full (not packed) form; routines that
//! assume symmetry read only the lower triangle and write both halves.
//!
//! Multiplication has closed-form variants for 2x2, 3x3 and 6x6 square
//! operands and a general fallback for any other shape. Inversion exists only
//! for the closed set of shapes with a closed form: Cramer for 2x2 and 3x3,
//! Cholesky for symmetric positive-definite 3x3. Any other shape returns
//! [`MatrixError::UnsupportedDimension`].
//!
//! Singular inputs are not guarded. A zero determinant produces `inf`/`nan`
//! lanes that downstream validity checks discard.

use crate::error::MatrixError;
use nalgebra::SMatrix;

/// Lane count used by the engine.
pub const LANES: usize = 8;

/// `N` matrices of shape `D1 x D2`, lane-interleaved.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, align(64))]
pub struct BatchMatrix<const D1: usize, const D2: usize, const N: usize> {
    data: [[[f32; N]; D2]; D1],
}

/// Column vectors, one per lane.
pub type BatchVector<const D: usize, const N: usize> = BatchMatrix<D, 1, N>;

impl<const D1: usize, const D2: usize, const N: usize> BatchMatrix<D1, D2, N> {
    pub const ROWS: usize = D1;
    pub const COLS: usize = D2;
    pub const LANES: usize = N;

    pub fn zeros() -> Self {
        Self {
            data: [[[0.0; N]; D2]; D1],
        }
    }

    /// Every lane set to `m`.
    pub fn splat(m: &SMatrix<f32, D1, D2>) -> Self {
        let mut out = Self::zeros();
        for i in 0..D1 {
            for j in 0..D2 {
                out.data[i][j] = [m[(i, j)]; N];
            }
        }
        out
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, n: usize) -> f32 {
        self.data[i][j][n]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, n: usize, value: f32) {
        self.data[i][j][n] = value;
    }

    /// Element `(i, j)` across all lanes.
    #[inline]
    pub fn element(&self, i: usize, j: usize) -> &[f32; N] {
        &self.data[i][j]
    }

    #[inline]
    pub fn element_mut(&mut self, i: usize, j: usize) -> &mut [f32; N] {
        &mut self.data[i][j]
    }

    /// Writes matrix `m` into lane `n`.
    pub fn copy_in(&mut self, n: usize, m: &SMatrix<f32, D1, D2>) {
        for i in 0..D1 {
            for j in 0..D2 {
                self.data[i][j][n] = m[(i, j)];
            }
        }
    }

    /// Reads lane `n` back as a dense matrix.
    pub fn copy_out(&self, n: usize) -> SMatrix<f32, D1, D2> {
        SMatrix::<f32, D1, D2>::from_fn(|i, j| self.data[i][j][n])
    }

    pub fn transpose(&self) -> BatchMatrix<D2, D1, N> {
        let mut out = BatchMatrix::<D2, D1, N>::zeros();
        for i in 0..D1 {
            for j in 0..D2 {
                out.data[j][i] = self.data[i][j];
            }
        }
        out
    }

    pub fn add_assign(&mut self, other: &Self) {
        for i in 0..D1 {
            for j in 0..D2 {
                let (dst, src) = (&mut self.data[i][j], &other.data[i][j]);
                for n in 0..N {
                    dst[n] += src[n];
                }
            }
        }
    }

    pub fn sub_assign(&mut self, other: &Self) {
        for i in 0..D1 {
            for j in 0..D2 {
                let (dst, src) = (&mut self.data[i][j], &other.data[i][j]);
                for n in 0..N {
                    dst[n] -= src[n];
                }
            }
        }
    }

    /// Copies the `R x C` block whose top-left corner is `(r0, c0)`.
    pub fn block<const R: usize, const C: usize>(&self, r0: usize, c0: usize) -> BatchMatrix<R, C, N> {
        debug_assert!(r0 + R <= D1 && c0 + C <= D2);
        let mut out = BatchMatrix::<R, C, N>::zeros();
        for i in 0..R {
            for j in 0..C {
                out.data[i][j] = self.data[r0 + i][c0 + j];
            }
        }
        out
    }

    /// Overwrites the block whose top-left corner is `(r0, c0)`.
    pub fn set_block<const R: usize, const C: usize>(
        &mut self,
        r0: usize,
        c0: usize,
        block: &BatchMatrix<R, C, N>,
    ) {
        debug_assert!(r0 + R <= D1 && c0 + C <= D2);
        for i in 0..R {
            for j in 0..C {
                self.data[r0 + i][c0 + j] = block.data[i][j];
            }
        }
    }

    /// Dense product `a * b` for any compatible shapes.
    pub fn multiply_general<const K: usize>(
        a: &BatchMatrix<D1, K, N>,
        b: &BatchMatrix<K, D2, N>,
    ) -> Self {
        let mut c = Self::zeros();
        for i in 0..D1 {
            for j in 0..D2 {
                let acc = &mut c.data[i][j];
                for k in 0..K {
                    let (x, y) = (&a.data[i][k], &b.data[k][j]);
                    for n in 0..N {
                        acc[n] += x[n] * y[n];
                    }
                }
            }
        }
        c
    }
}

impl<const D: usize, const N: usize> BatchMatrix<D, D, N> {
    pub fn identity() -> Self {
        let mut out = Self::zeros();
        for i in 0..D {
            out.data[i][i] = [1.0; N];
        }
        out
    }

    /// Square product, dispatched to a closed form for D = 2, 3, 6.
    pub fn multiply(a: &Self, b: &Self) -> Self {
        match D {
            2 => Self::multiply_2(a, b),
            3 => Self::multiply_3(a, b),
            6 => Self::multiply_6(a, b),
            _ => Self::multiply_general(a, b),
        }
    }

    fn multiply_2(a: &Self, b: &Self) -> Self {
        let (a, b) = (&a.data, &b.data);
        let mut c = Self::zeros();
        for i in 0..2 {
            for j in 0..2 {
                for n in 0..N {
                    c.data[i][j][n] = a[i][0][n] * b[0][j][n] + a[i][1][n] * b[1][j][n];
                }
            }
        }
        c
    }

    fn multiply_3(a: &Self, b: &Self) -> Self {
        let (a, b) = (&a.data, &b.data);
        let mut c = Self::zeros();
        for i in 0..3 {
            for j in 0..3 {
                for n in 0..N {
                    c.data[i][j][n] = a[i][0][n] * b[0][j][n]
                        + a[i][1][n] * b[1][j][n]
                        + a[i][2][n] * b[2][j][n];
                }
            }
        }
        c
    }

    fn multiply_6(a: &Self, b: &Self) -> Self {
        let (a, b) = (&a.data, &b.data);
        let mut c = Self::zeros();
        for i in 0..6 {
            for j in 0..6 {
                for n in 0..N {
                    c.data[i][j][n] = a[i][0][n] * b[0][j][n]
                        + a[i][1][n] * b[1][j][n]
                        + a[i][2][n] * b[2][j][n]
                        + a[i][3][n] * b[3][j][n]
                        + a[i][4][n] * b[4][j][n]
                        + a[i][5][n] * b[5][j][n];
                }
            }
        }
        c
    }

    /// Replaces each lane by `(A + A^T) / 2`.
    pub fn symmetrize(&mut self) {
        for i in 0..D {
            for j in (i + 1)..D {
                for n in 0..N {
                    let avg = 0.5 * (self.data[i][j][n] + self.data[j][i][n]);
                    self.data[i][j][n] = avg;
                    self.data[j][i][n] = avg;
                }
            }
        }
    }

    /// In-place inversion by the adjugate formula (D = 2 or 3).
    pub fn invert_cramer(&mut self) -> Result<(), MatrixError> {
        match D {
            2 => {
                self.invert_cramer_2();
                Ok(())
            }
            3 => {
                self.invert_cramer_3();
                Ok(())
            }
            _ => Err(MatrixError::unsupported("Cramer inversion", D, D)),
        }
    }

    /// In-place inversion through a Cholesky factorization (D = 3).
    ///
    /// Input must be symmetric positive-definite; only the lower triangle is
    /// read. Other input yields unflagged `nan` lanes.
    pub fn invert_cholesky(&mut self) -> Result<(), MatrixError> {
        if D != 3 {
            return Err(MatrixError::unsupported("Cholesky inversion", D, D));
        }
        let a = &mut self.data;
        for n in 0..N {
            let l00 = a[0][0][n].sqrt();
            let l10 = a[1][0][n] / l00;
            let l20 = a[2][0][n] / l00;
            let l11 = (a[1][1][n] - l10 * l10).sqrt();
            let l21 = (a[2][1][n] - l20 * l10) / l11;
            let l22 = (a[2][2][n] - l20 * l20 - l21 * l21).sqrt();

            // m = L^-1, lower triangular
            let m00 = 1.0 / l00;
            let m11 = 1.0 / l11;
            let m22 = 1.0 / l22;
            let m10 = -l10 * m00 * m11;
            let m21 = -l21 * m11 * m22;
            let m20 = -(l20 * m00 + l21 * m10) * m22;

            // A^-1 = m^T m
            let i00 = m00 * m00 + m10 * m10 + m20 * m20;
            let i10 = m10 * m11 + m20 * m21;
            let i20 = m20 * m22;
            let i11 = m11 * m11 + m21 * m21;
            let i21 = m21 * m22;
            let i22 = m22 * m22;

            a[0][0][n] = i00;
            a[1][0][n] = i10;
            a[0][1][n] = i10;
            a[2][0][n] = i20;
            a[0][2][n] = i20;
            a[1][1][n] = i11;
            a[2][1][n] = i21;
            a[1][2][n] = i21;
            a[2][2][n] = i22;
        }
        Ok(())
    }

    fn invert_cramer_2(&mut self) {
        let a = &mut self.data;
        for n in 0..N {
            let (a00, a01, a10, a11) = (a[0][0][n], a[0][1][n], a[1][0][n], a[1][1][n]);
            let inv_det = 1.0 / (a00 * a11 - a01 * a10);
            a[0][0][n] = a11 * inv_det;
            a[0][1][n] = -a01 * inv_det;
            a[1][0][n] = -a10 * inv_det;
            a[1][1][n] = a00 * inv_det;
        }
    }

    fn invert_cramer_3(&mut self) {
        let a = &mut self.data;
        for n in 0..N {
            let (a00, a01, a02) = (a[0][0][n], a[0][1][n], a[0][2][n]);
            let (a10, a11, a12) = (a[1][0][n], a[1][1][n], a[1][2][n]);
            let (a20, a21, a22) = (a[2][0][n], a[2][1][n], a[2][2][n]);

            let c00 = a11 * a22 - a12 * a21;
            let c01 = a12 * a20 - a10 * a22;
            let c02 = a10 * a21 - a11 * a20;
            let inv_det = 1.0 / (a00 * c00 + a01 * c01 + a02 * c02);

            a[0][0][n] = c00 * inv_det;
            a[0][1][n] = (a02 * a21 - a01 * a22) * inv_det;
            a[0][2][n] = (a01 * a12 - a02 * a11) * inv_det;
            a[1][0][n] = c01 * inv_det;
            a[1][1][n] = (a00 * a22 - a02 * a20) * inv_det;
            a[1][2][n] = (a02 * a10 - a00 * a12) * inv_det;
            a[2][0][n] = c02 * inv_det;
            a[2][1][n] = (a01 * a20 - a00 * a21) * inv_det;
            a[2][2][n] = (a00 * a11 - a01 * a10) * inv_det;
        }
    }
}
