//! Dense linear algebra on small row-major `f64` matrices
//!
//! Candle has no eigen or SVD kernels, so the factored-matrix spectral
//! operations pull their k×k (or m×k) factors out of the tensor world and
//! run the routines here:
//!
//! - `symmetric_eigen`: cyclic Jacobi rotations
//! - `eigenvalues`: Hessenberg reduction + Francis double-shift QR
//! - `thin_svd`: Gram-matrix eigendecomposition

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use serde::Serialize;

use crate::error::CircuitError;

const MAX_JACOBI_SWEEPS: usize = 100;
const MAX_QR_ITERATIONS: usize = 60;

/// Row-major dense matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Mat {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(CircuitError::shape(
                "Mat::from_vec",
                format!("{} elements", rows * cols),
                format!("{} elements", data.len()),
            )
            .into());
        }
        Ok(Self { rows, cols, data })
    }

    /// Copy a 2-D tensor of any float dtype into an f64 matrix
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let (rows, cols) = t.dims2()?;
        let data: Vec<f64> = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
        Self::from_vec(rows, cols, data)
    }

    /// Convert back into a tensor with the requested dtype
    pub fn to_tensor(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), (self.rows, self.cols), device)?.to_dtype(dtype)?)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn transpose(&self) -> Self {
        let mut t = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t[(j, i)] = self[(i, j)];
            }
        }
        t
    }

    pub fn matmul(&self, other: &Mat) -> Result<Self> {
        if self.cols != other.rows {
            return Err(CircuitError::shape(
                "Mat::matmul",
                format!("{} rows on the right", self.cols),
                format!("{}", other.rows),
            )
            .into());
        }
        let mut out = Self::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for p in 0..self.cols {
                let a = self[(i, p)];
                if a == 0.0 {
                    continue;
                }
                for j in 0..other.cols {
                    out[(i, j)] += a * other[(p, j)];
                }
            }
        }
        Ok(out)
    }

    /// Scale column `j` by `s[j]`
    pub fn scale_cols(&self, s: &[f64]) -> Self {
        let mut out = self.clone();
        for i in 0..self.rows {
            for (j, sj) in s.iter().enumerate().take(self.cols) {
                out[(i, j)] *= sj;
            }
        }
        out
    }

    /// Scale row `i` by `s[i]`
    pub fn scale_rows(&self, s: &[f64]) -> Self {
        let mut out = self.clone();
        for (i, si) in s.iter().enumerate().take(self.rows) {
            for j in 0..self.cols {
                out[(i, j)] *= si;
            }
        }
        out
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum::<f64>().sqrt()
    }

    fn is_square(&self) -> bool {
        self.rows == self.cols
    }
}

impl std::ops::Index<(usize, usize)> for Mat {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.cols + j]
    }
}

impl std::ops::IndexMut<(usize, usize)> for Mat {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }
}

/// A (possibly complex) eigenvalue
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Eigenvalue {
    pub re: f64,
    pub im: f64,
}

impl Eigenvalue {
    pub fn real(re: f64) -> Self {
        Self { re, im: 0.0 }
    }

    pub fn modulus(&self) -> f64 {
        self.re.hypot(self.im)
    }
}

impl std::fmt::Display for Eigenvalue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.im == 0.0 {
            write!(f, "{:.4}", self.re)
        } else if self.im > 0.0 {
            write!(f, "{:.4}+{:.4}i", self.re, self.im)
        } else {
            write!(f, "{:.4}-{:.4}i", self.re, -self.im)
        }
    }
}

/// Eigendecomposition of a symmetric matrix.
///
/// Returns eigenvalues sorted descending and the matching eigenvectors as
/// the columns of the second matrix.
pub fn symmetric_eigen(a: &Mat) -> Result<(Vec<f64>, Mat)> {
    if !a.is_square() {
        return Err(CircuitError::shape(
            "symmetric_eigen",
            "square matrix",
            format!("{}x{}", a.rows, a.cols),
        )
        .into());
    }
    let n = a.rows;
    let mut a = a.clone();
    let mut v = Mat::identity(n);
    let scale = a.frobenius_norm().max(f64::MIN_POSITIVE);

    for _ in 0..MAX_JACOBI_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[(p, q)] * a[(p, q)])
            .sum();
        if off.sqrt() <= f64::EPSILON * scale {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[(p, q)];
                if apq.abs() <= f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * apq);
                let sign = if theta >= 0.0 { 1.0 } else { -1.0 };
                let t = sign / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[(k, p)];
                    let akq = a[(k, q)];
                    a[(k, p)] = c * akp - s * akq;
                    a[(k, q)] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[(p, k)];
                    let aqk = a[(q, k)];
                    a[(p, k)] = c * apk - s * aqk;
                    a[(q, k)] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[(k, p)];
                    let vkq = v[(k, q)];
                    v[(k, p)] = c * vkp - s * vkq;
                    v[(k, q)] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[(j, j)].total_cmp(&a[(i, i)]));

    let values = order.iter().map(|&i| a[(i, i)]).collect();
    let mut vectors = Mat::zeros(n, n);
    for (dst, &src) in order.iter().enumerate() {
        for k in 0..n {
            vectors[(k, dst)] = v[(k, src)];
        }
    }
    Ok((values, vectors))
}

/// Thin SVD of an `m×k` matrix: `a = U diag(S) Vᵀ` with `U: m×k`, `V: k×k`.
///
/// Singular values come from the eigenvalues of `aᵀa`; columns of U whose
/// singular value is numerically zero are left as zero vectors.
pub fn thin_svd(a: &Mat) -> Result<(Mat, Vec<f64>, Mat)> {
    let gram = a.transpose().matmul(a)?;
    let (evals, v) = symmetric_eigen(&gram)?;
    let s: Vec<f64> = evals.iter().map(|&e| e.max(0.0).sqrt()).collect();

    let cutoff = s.first().copied().unwrap_or(0.0) * 1e-12;
    let av = a.matmul(&v)?;
    let inv: Vec<f64> = s
        .iter()
        .map(|&si| if si > cutoff && si > 0.0 { 1.0 / si } else { 0.0 })
        .collect();
    let u = av.scale_cols(&inv);
    Ok((u, s, v))
}

/// Eigenvalues of a general real square matrix, sorted by descending modulus.
pub fn eigenvalues(a: &Mat) -> Result<Vec<Eigenvalue>> {
    if !a.is_square() {
        return Err(CircuitError::shape(
            "eigenvalues",
            "square matrix",
            format!("{}x{}", a.rows, a.cols),
        )
        .into());
    }
    let mut h = a.clone();
    hessenberg(&mut h);
    let mut values = hessenberg_qr(&mut h)?;
    values.sort_by(|x, y| {
        y.modulus()
            .total_cmp(&x.modulus())
            .then(y.re.total_cmp(&x.re))
            .then(y.im.total_cmp(&x.im))
    });
    Ok(values)
}

/// Reduce to upper Hessenberg form by stabilized elementary similarity
/// transforms. Entries below the subdiagonal are zeroed on return.
fn hessenberg(a: &mut Mat) {
    let n = a.rows;
    if n < 3 {
        return;
    }
    for m in 1..(n - 1) {
        let mut x = 0.0_f64;
        let mut pivot = m;
        for j in m..n {
            if a[(j, m - 1)].abs() > x.abs() {
                x = a[(j, m - 1)];
                pivot = j;
            }
        }
        if pivot != m {
            for j in (m - 1)..n {
                let tmp = a[(pivot, j)];
                a[(pivot, j)] = a[(m, j)];
                a[(m, j)] = tmp;
            }
            for j in 0..n {
                let tmp = a[(j, pivot)];
                a[(j, pivot)] = a[(j, m)];
                a[(j, m)] = tmp;
            }
        }
        if x != 0.0 {
            for i in (m + 1)..n {
                let mut y = a[(i, m - 1)];
                if y != 0.0 {
                    y /= x;
                    a[(i, m - 1)] = y;
                    for j in m..n {
                        a[(i, j)] -= y * a[(m, j)];
                    }
                    for j in 0..n {
                        a[(j, m)] += y * a[(j, i)];
                    }
                }
            }
        }
    }
    for i in 2..n {
        for j in 0..(i - 1) {
            a[(i, j)] = 0.0;
        }
    }
}

/// Francis double-shift QR on an upper Hessenberg matrix (destroys `a`).
fn hessenberg_qr(a: &mut Mat) -> Result<Vec<Eigenvalue>> {
    let n = a.rows;
    let mut out = vec![Eigenvalue::real(0.0); n];
    if n == 0 {
        return Ok(out);
    }

    let mut anorm = 0.0;
    for i in 0..n {
        for j in i.saturating_sub(1)..n {
            anorm += a[(i, j)].abs();
        }
    }

    let mut nn = n as isize - 1;
    let mut shift = 0.0;
    while nn >= 0 {
        let top = nn as usize;
        let mut its = 0;
        loop {
            // Look for a single small subdiagonal element
            let mut l = top;
            while l > 0 {
                let mut s = a[(l - 1, l - 1)].abs() + a[(l, l)].abs();
                if s == 0.0 {
                    s = anorm;
                }
                if a[(l, l - 1)].abs() <= f64::EPSILON * s {
                    a[(l, l - 1)] = 0.0;
                    break;
                }
                l -= 1;
            }

            let mut x = a[(top, top)];
            if l == top {
                out[top] = Eigenvalue::real(x + shift);
                nn -= 1;
                break;
            }

            let mut y = a[(top - 1, top - 1)];
            let mut w = a[(top, top - 1)] * a[(top - 1, top)];
            if l == top - 1 {
                let p = 0.5 * (y - x);
                let q = p * p + w;
                let z = q.abs().sqrt();
                x += shift;
                if q >= 0.0 {
                    let z = p + z.copysign(p);
                    out[top - 1] = Eigenvalue::real(x + z);
                    out[top] = Eigenvalue::real(if z != 0.0 { x - w / z } else { x + z });
                } else {
                    out[top] = Eigenvalue { re: x + p, im: -z };
                    out[top - 1] = Eigenvalue { re: x + p, im: z };
                }
                nn -= 2;
                break;
            }

            if its == MAX_QR_ITERATIONS {
                anyhow::bail!("QR iteration failed to converge after {MAX_QR_ITERATIONS} steps");
            }
            if its == 10 || its == 20 {
                // Exceptional shift
                shift += x;
                for i in 0..=top {
                    a[(i, i)] -= x;
                }
                let s = a[(top, top - 1)].abs() + a[(top - 1, top - 2)].abs();
                x = 0.75 * s;
                y = x;
                w = -0.4375 * s * s;
            }
            its += 1;

            // Find two consecutive small subdiagonal elements
            let mut m = top - 2;
            let (mut p, mut q, mut r);
            loop {
                let z = a[(m, m)];
                let rr = x - z;
                let ss = y - z;
                p = (rr * ss - w) / a[(m + 1, m)] + a[(m, m + 1)];
                q = a[(m + 1, m + 1)] - z - rr - ss;
                r = a[(m + 2, m + 1)];
                let s = p.abs() + q.abs() + r.abs();
                p /= s;
                q /= s;
                r /= s;
                if m == l {
                    break;
                }
                let u = a[(m, m - 1)].abs() * (q.abs() + r.abs());
                let v = p.abs() * (a[(m - 1, m - 1)].abs() + z.abs() + a[(m + 1, m + 1)].abs());
                if u <= f64::EPSILON * v {
                    break;
                }
                m -= 1;
            }

            for i in m..(top - 1) {
                a[(i + 2, i)] = 0.0;
                if i != m {
                    a[(i + 2, i - 1)] = 0.0;
                }
            }

            // Double QR step on rows l..=top and columns m..=top
            for k in m..top {
                if k != m {
                    p = a[(k, k - 1)];
                    q = a[(k + 1, k - 1)];
                    r = if k + 1 != top { a[(k + 2, k - 1)] } else { 0.0 };
                    x = p.abs() + q.abs() + r.abs();
                    if x != 0.0 {
                        p /= x;
                        q /= x;
                        r /= x;
                    }
                }
                let s = (p * p + q * q + r * r).sqrt().copysign(p);
                if s == 0.0 {
                    continue;
                }
                if k == m {
                    if l != m {
                        a[(k, k - 1)] = -a[(k, k - 1)];
                    }
                } else {
                    a[(k, k - 1)] = -s * x;
                }
                p += s;
                x = p / s;
                y = q / s;
                let z = r / s;
                q /= p;
                r /= p;
                for j in k..=top {
                    let mut pp = a[(k, j)] + q * a[(k + 1, j)];
                    if k + 1 != top {
                        pp += r * a[(k + 2, j)];
                        a[(k + 2, j)] -= pp * z;
                    }
                    a[(k + 1, j)] -= pp * y;
                    a[(k, j)] -= pp * x;
                }
                let mmin = if top < k + 3 { top } else { k + 3 };
                for i in l..=mmin {
                    let mut pp = x * a[(i, k)] + y * a[(i, k + 1)];
                    if k + 1 != top {
                        pp += z * a[(i, k + 2)];
                        a[(i, k + 2)] -= pp * r;
                    }
                    a[(i, k + 1)] -= pp * q;
                    a[(i, k)] -= pp;
                }
            }
        }
    }
    Ok(out)
}
