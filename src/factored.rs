//! Factored matrices: a product `A·B` kept as its two factors
//!
//! Composed head weights such as the full OV circuit `W_E W_V W_O W_U` are
//! `d_vocab × d_vocab` but have rank at most `d_head`. Keeping the two thin
//! factors lets us take norms, spectra and sub-blocks without ever building
//! the full product.
//!
//! ## Example
//!
//! ```ignore
//! use circuit_lens::FactoredMatrix;
//!
//! let ab = FactoredMatrix::new(a, b)?;        // [5, 2] x [2, 5]
//! println!("{:?} hidden={}", ab.shape(), ab.mdim());
//! let abc = ab.compose_right(&c)?;            // still factored
//! let block = ab.index(&[0, 3], &[0, 3])?.ab()?;
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::error::CircuitError;
use crate::linalg::{self, Eigenvalue, Mat};

/// Lazy representation of the product `a · b`
#[derive(Debug, Clone)]
pub struct FactoredMatrix {
    a: Tensor,
    b: Tensor,
}

impl FactoredMatrix {
    /// Build from a left factor `[m, k]` and right factor `[k, n]`
    pub fn new(a: Tensor, b: Tensor) -> Result<Self> {
        if a.rank() != 2 || b.rank() != 2 {
            return Err(CircuitError::shape(
                "FactoredMatrix::new",
                "two 2-D factors",
                format!("{:?} and {:?}", a.dims(), b.dims()),
            )
            .into());
        }
        if a.dim(1)? != b.dim(0)? {
            return Err(CircuitError::shape(
                "FactoredMatrix::new",
                format!("right factor with {} rows", a.dim(1)?),
                format!("{:?}", b.dims()),
            )
            .into());
        }
        Ok(Self {
            a: a.contiguous()?,
            b: b.contiguous()?,
        })
    }

    /// Left factor `[m, k]`
    pub fn a(&self) -> &Tensor {
        &self.a
    }

    /// Right factor `[k, n]`
    pub fn b(&self) -> &Tensor {
        &self.b
    }

    /// Rows of the logical product
    pub fn ldim(&self) -> usize {
        self.a.dims()[0]
    }

    /// Columns of the logical product
    pub fn rdim(&self) -> usize {
        self.b.dims()[1]
    }

    /// Hidden (inner) dimension
    pub fn mdim(&self) -> usize {
        self.a.dims()[1]
    }

    /// Logical shape `(ldim, rdim)`
    pub fn shape(&self) -> (usize, usize) {
        (self.ldim(), self.rdim())
    }

    pub fn dtype(&self) -> DType {
        self.a.dtype()
    }

    pub fn device(&self) -> &Device {
        self.a.device()
    }

    /// Materialize the full product `a · b`
    pub fn ab(&self) -> Result<Tensor> {
        Ok(self.a.matmul(&self.b)?)
    }

    /// The swapped product `b · a` (`mdim × mdim`), only for square matrices
    pub fn ba(&self) -> Result<Tensor> {
        self.require_square("FactoredMatrix::ba")?;
        Ok(self.b.matmul(&self.a)?)
    }

    /// `self · other` for a dense `other` with `rdim` rows.
    ///
    /// The result keeps whichever factorization has the smaller hidden
    /// dimension: `(a, b·other)` when `rdim > mdim`, else `(a·b, other)`.
    pub fn compose_right(&self, other: &Tensor) -> Result<Self> {
        let (rows, _) = dims2_or_mismatch(other, "FactoredMatrix::compose_right")?;
        if rows != self.rdim() {
            return Err(CircuitError::shape(
                "FactoredMatrix::compose_right",
                format!("{} rows", self.rdim()),
                format!("{:?}", other.dims()),
            )
            .into());
        }
        if self.rdim() > self.mdim() {
            Self::new(self.a.clone(), self.b.matmul(&other.contiguous()?)?)
        } else {
            Self::new(self.ab()?, other.clone())
        }
    }

    /// `self · other` where `other` is itself factored
    pub fn compose_right_factored(&self, other: &FactoredMatrix) -> Result<Self> {
        self.compose_right(&other.a)?.compose_right(&other.b)
    }

    /// `other · self` for a dense `other` with `ldim` columns
    pub fn compose_left(&self, other: &Tensor) -> Result<Self> {
        let (_, cols) = dims2_or_mismatch(other, "FactoredMatrix::compose_left")?;
        if cols != self.ldim() {
            return Err(CircuitError::shape(
                "FactoredMatrix::compose_left",
                format!("{} columns", self.ldim()),
                format!("{:?}", other.dims()),
            )
            .into());
        }
        if self.ldim() > self.mdim() {
            Self::new(other.contiguous()?.matmul(&self.a)?, self.b.clone())
        } else {
            Self::new(other.clone(), self.ab()?)
        }
    }

    /// Logical transpose `(bᵀ, aᵀ)`
    pub fn transpose(&self) -> Result<Self> {
        Self::new(self.b.t()?.contiguous()?, self.a.t()?.contiguous()?)
    }

    /// Frobenius norm of the product.
    ///
    /// Uses `‖AB‖² = Σ (AᵀA) ⊙ (BBᵀ)`, so only `k×k` Gram matrices are formed.
    pub fn norm(&self) -> Result<f64> {
        let a = self.a.to_dtype(DType::F64)?;
        let b = self.b.to_dtype(DType::F64)?;
        let gram_a = a.t()?.contiguous()?.matmul(&a)?;
        let gram_b = b.matmul(&b.t()?.contiguous()?)?;
        let sq = (gram_a * gram_b)?.sum_all()?.to_scalar::<f64>()?;
        Ok(sq.max(0.0).sqrt())
    }

    /// Eigenvalues of the product, sorted by descending modulus.
    ///
    /// The nonzero spectrum of `AB` equals that of `BA`, so for a thin
    /// factorization (`mdim <= ldim`) they come from the `mdim × mdim`
    /// product `b · a`; the `ldim - mdim` remaining eigenvalues of the full
    /// product are zero and are not returned. When the hidden dimension is
    /// wider than the matrix, the `ldim × ldim` product itself is smaller and
    /// is decomposed directly. Either way `min(ldim, mdim)` values come back.
    pub fn eigenvalues(&self) -> Result<Vec<Eigenvalue>> {
        self.require_square("FactoredMatrix::eigenvalues")?;
        let small = if self.mdim() <= self.ldim() {
            self.ba()?
        } else {
            self.ab()?
        };
        linalg::eigenvalues(&Mat::from_tensor(&small)?)
    }

    /// Thin SVD of the product: `(U [m,r], S [r], V [n,r])` with
    /// `AB = U diag(S) Vᵀ`, S descending and `r = min(ldim, mdim, rdim)`.
    pub fn svd(&self) -> Result<(Tensor, Tensor, Tensor)> {
        let a = Mat::from_tensor(&self.a)?;
        let b = Mat::from_tensor(&self.b)?;

        // A = Ua Sa Vaᵀ, Bᵀ = Vb Sb Ubᵀ
        let (ua, sa, va) = linalg::thin_svd(&a)?;
        let (vb, sb, ub) = linalg::thin_svd(&b.transpose())?;

        let middle = va
            .transpose()
            .matmul(&ub)?
            .scale_rows(&sa)
            .scale_cols(&sb);
        let (um, sm, vm) = linalg::thin_svd(&middle)?;

        let u = ua.matmul(&um)?;
        let v = vb.matmul(&vm)?;

        // rank never exceeds the smallest dimension; the tail of S is zero
        let rank = self.ldim().min(self.mdim()).min(self.rdim());
        let dtype = self.dtype();
        let device = self.device();
        let s = Tensor::from_vec(sm, self.mdim(), device)?
            .narrow(0, 0, rank)?
            .to_dtype(dtype)?;
        let u = u.to_tensor(dtype, device)?.narrow(1, 0, rank)?.contiguous()?;
        let v = v.to_tensor(dtype, device)?.narrow(1, 0, rank)?.contiguous()?;
        Ok((u, s, v))
    }

    /// Singular values of the product (length `min(ldim, mdim, rdim)`, descending)
    pub fn singular_values(&self) -> Result<Tensor> {
        Ok(self.svd()?.1)
    }

    /// Sub-matrix `AB[rows, :][:, cols]`, still factored.
    ///
    /// Slices `a` by rows and `b` by columns; the full product is never
    /// formed. Indices may repeat and need not be sorted.
    pub fn index(&self, rows: &[usize], cols: &[usize]) -> Result<Self> {
        self.select_rows(rows)?.select_cols(cols)
    }

    /// `AB[rows, :]`
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        let ids = index_tensor(rows, self.ldim(), "row", self.device())?;
        Self::new(self.a.index_select(&ids, 0)?, self.b.clone())
    }

    /// `AB[:, cols]`
    pub fn select_cols(&self, cols: &[usize]) -> Result<Self> {
        let ids = index_tensor(cols, self.rdim(), "column", self.device())?;
        Self::new(self.a.clone(), self.b.index_select(&ids, 1)?)
    }

    /// Materialize the top-left `n × n` block (clamped to the shape)
    pub fn corner(&self, n: usize) -> Result<Tensor> {
        let rows = n.min(self.ldim());
        let cols = n.min(self.rdim());
        Ok(self
            .a
            .narrow(0, 0, rows)?
            .matmul(&self.b.narrow(1, 0, cols)?.contiguous()?)?)
    }

    fn require_square(&self, context: &'static str) -> Result<()> {
        if self.ldim() != self.rdim() {
            return Err(CircuitError::shape(
                context,
                "square product",
                format!("{}x{}", self.ldim(), self.rdim()),
            )
            .into());
        }
        Ok(())
    }
}

fn dims2_or_mismatch(t: &Tensor, context: &'static str) -> Result<(usize, usize)> {
    if t.rank() != 2 {
        return Err(CircuitError::shape(context, "2-D tensor", format!("{:?}", t.dims())).into());
    }
    Ok(t.dims2()?)
}

fn index_tensor(
    indices: &[usize],
    bound: usize,
    what: &'static str,
    device: &Device,
) -> Result<Tensor> {
    let mut ids = Vec::with_capacity(indices.len());
    for &i in indices {
        crate::error::check_index(what, i, bound)?;
        ids.push(i as u32);
    }
    Ok(Tensor::from_vec(ids, indices.len(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tensor(rows: usize, cols: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(x: &Tensor, y: &Tensor) -> f32 {
        (x - y)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn dense_norm(t: &Tensor) -> f64 {
        t.to_dtype(DType::F64)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f64>()
            .unwrap()
            .sqrt()
    }

    #[test]
    fn test_dimensions() {
        let f = FactoredMatrix::new(tensor(5, 2, 1), tensor(2, 7, 2)).unwrap();
        assert_eq!(f.ldim(), 5);
        assert_eq!(f.rdim(), 7);
        assert_eq!(f.mdim(), 2);
        assert_eq!(f.shape(), (5, 7));
        assert_eq!(f.ab().unwrap().dims(), &[5, 7]);
    }

    #[test]
    fn test_inner_dim_mismatch() {
        let err = FactoredMatrix::new(tensor(5, 2, 1), tensor(3, 5, 2)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_norm_matches_dense() {
        let f = FactoredMatrix::new(tensor(5, 2, 3), tensor(2, 5, 4)).unwrap();
        let dense = dense_norm(&f.ab().unwrap());
        assert!((f.norm().unwrap() - dense).abs() < 1e-4);
    }

    #[test]
    fn test_compose_right_keeps_small_hidden_dim() {
        let f = FactoredMatrix::new(tensor(5, 2, 5), tensor(2, 5, 6)).unwrap();
        let c = tensor(5, 300, 7);
        let fc = f.compose_right(&c).unwrap();
        assert_eq!(fc.shape(), (5, 300));
        assert_eq!(fc.mdim(), 2);

        let expected = f.ab().unwrap().matmul(&c).unwrap();
        assert!(max_abs_diff(&fc.ab().unwrap(), &expected) < 1e-4);
    }

    #[test]
    fn test_compose_right_wrong_rows() {
        let f = FactoredMatrix::new(tensor(5, 2, 5), tensor(2, 5, 6)).unwrap();
        assert!(f.compose_right(&tensor(4, 3, 1)).is_err());
    }

    #[test]
    fn test_compose_factored_and_left() {
        let f = FactoredMatrix::new(tensor(4, 2, 8), tensor(2, 6, 9)).unwrap();
        let g = FactoredMatrix::new(tensor(6, 3, 10), tensor(3, 5, 11)).unwrap();
        let fg = f.compose_right_factored(&g).unwrap();
        let expected = f.ab().unwrap().matmul(&g.ab().unwrap()).unwrap();
        assert!(max_abs_diff(&fg.ab().unwrap(), &expected) < 1e-4);

        let x = tensor(3, 4, 12);
        let xf = f.compose_left(&x).unwrap();
        let expected = x.matmul(&f.ab().unwrap()).unwrap();
        assert!(max_abs_diff(&xf.ab().unwrap(), &expected) < 1e-4);
    }

    #[test]
    fn test_transpose() {
        let f = FactoredMatrix::new(tensor(4, 2, 13), tensor(2, 3, 14)).unwrap();
        let ft = f.transpose().unwrap();
        assert_eq!(ft.shape(), (3, 4));
        let expected = f.ab().unwrap().t().unwrap();
        assert!(max_abs_diff(&ft.ab().unwrap(), &expected) < 1e-6);
    }

    #[test]
    fn test_index_matches_dense_slice() {
        let f = FactoredMatrix::new(tensor(6, 2, 15), tensor(2, 6, 16)).unwrap();
        let idx = [4usize, 1, 1, 5];
        let sub = f.index(&idx, &idx).unwrap().ab().unwrap();
        let dense: Vec<Vec<f32>> = f.ab().unwrap().to_vec2().unwrap();
        let sub: Vec<Vec<f32>> = sub.to_vec2().unwrap();
        for (i, &r) in idx.iter().enumerate() {
            for (j, &c) in idx.iter().enumerate() {
                assert!((sub[i][j] - dense[r][c]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_index_out_of_range() {
        let f = FactoredMatrix::new(tensor(6, 2, 15), tensor(2, 4, 16)).unwrap();
        let err = f.index(&[0, 6], &[0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CircuitError>(),
            Some(CircuitError::IndexOutOfRange { index: 6, bound: 6, .. })
        ));
        assert!(f.select_cols(&[4]).is_err());
    }

    #[test]
    fn test_singular_values_match_dense() {
        let f = FactoredMatrix::new(tensor(5, 2, 17), tensor(2, 5, 18)).unwrap();
        let s: Vec<f32> = f.singular_values().unwrap().to_vec1().unwrap();
        assert_eq!(s.len(), 2);

        // Dense reference: eigenvalues of (AB)ᵀ(AB)
        let dense = Mat::from_tensor(&f.ab().unwrap()).unwrap();
        let gram = dense.transpose().matmul(&dense).unwrap();
        let (evals, _) = linalg::symmetric_eigen(&gram).unwrap();
        for (got, want) in s.iter().zip(evals.iter()) {
            assert!((*got as f64 - want.max(0.0).sqrt()).abs() < 1e-4);
        }
        // Rank 2 product: the rest are zero
        assert!(evals[2..].iter().all(|e| e.abs() < 1e-8));
    }

    #[test]
    fn test_svd_reconstructs_product() {
        let f = FactoredMatrix::new(tensor(6, 3, 19), tensor(3, 4, 20)).unwrap();
        let (u, s, v) = f.svd().unwrap();
        assert_eq!(u.dims(), &[6, 3]);
        assert_eq!(v.dims(), &[4, 3]);
        let rebuilt = u
            .broadcast_mul(&s.unsqueeze(0).unwrap())
            .unwrap()
            .matmul(&v.t().unwrap().contiguous().unwrap())
            .unwrap();
        assert!(max_abs_diff(&rebuilt, &f.ab().unwrap()) < 1e-4);
    }

    #[test]
    fn test_eigenvalues_match_dense_spectrum() {
        let f = FactoredMatrix::new(tensor(5, 2, 21), tensor(2, 5, 22)).unwrap();
        let factored = f.eigenvalues().unwrap();
        assert_eq!(factored.len(), 2);

        let dense = linalg::eigenvalues(&Mat::from_tensor(&f.ab().unwrap()).unwrap()).unwrap();
        // The two largest-modulus dense eigenvalues are the factored ones
        for (x, y) in factored.iter().zip(dense.iter()) {
            assert!((x.modulus() - y.modulus()).abs() < 1e-4);
        }
        assert!(dense[2..].iter().all(|e| e.modulus() < 1e-3));
    }

    #[test]
    fn test_wide_hidden_dim_spectrum_has_matrix_size() {
        // 2x5 times 5x2: a 2x2 matrix with a 5-wide hidden dimension
        let f = FactoredMatrix::new(tensor(2, 5, 25), tensor(5, 2, 26)).unwrap();
        let dense = Mat::from_tensor(&f.ab().unwrap()).unwrap();

        let factored = f.eigenvalues().unwrap();
        assert_eq!(factored.len(), 2);
        let reference = linalg::eigenvalues(&dense).unwrap();
        for (x, y) in factored.iter().zip(reference.iter()) {
            assert!((x.re - y.re).abs() < 1e-4 && (x.im - y.im).abs() < 1e-4);
        }

        let (u, s, v) = f.svd().unwrap();
        assert_eq!(u.dims(), &[2, 2]);
        assert_eq!(s.dims(), &[2]);
        assert_eq!(v.dims(), &[2, 2]);
        let gram = dense.transpose().matmul(&dense).unwrap();
        let (evals, _) = linalg::symmetric_eigen(&gram).unwrap();
        let s: Vec<f32> = s.to_vec1().unwrap();
        for (got, want) in s.iter().zip(evals.iter()) {
            assert!((*got as f64 - want.max(0.0).sqrt()).abs() < 1e-4);
        }
        let rebuilt = u
            .broadcast_mul(&f.singular_values().unwrap().unsqueeze(0).unwrap())
            .unwrap()
            .matmul(&v.t().unwrap().contiguous().unwrap())
            .unwrap();
        assert!(max_abs_diff(&rebuilt, &f.ab().unwrap()) < 1e-4);
    }

    #[test]
    fn test_sampled_block_spectrum_shrinks_with_block() {
        let f = FactoredMatrix::new(tensor(8, 4, 27), tensor(4, 8, 28)).unwrap();
        let block = f.index(&[1, 6], &[1, 6]).unwrap();
        assert_eq!(block.mdim(), 4);
        assert_eq!(block.eigenvalues().unwrap().len(), 2);
        assert_eq!(block.singular_values().unwrap().dims(), &[2]);
    }

    #[test]
    fn test_eigenvalues_require_square() {
        let f = FactoredMatrix::new(tensor(5, 2, 1), tensor(2, 3, 2)).unwrap();
        assert!(f.eigenvalues().is_err());
    }

    #[test]
    fn test_corner() {
        let f = FactoredMatrix::new(tensor(5, 2, 23), tensor(2, 5, 24)).unwrap();
        let corner = f.corner(3).unwrap();
        assert_eq!(corner.dims(), &[3, 3]);
        let full = f.ab().unwrap().narrow(0, 0, 3).unwrap().narrow(1, 0, 3).unwrap();
        assert!(max_abs_diff(&corner, &full) < 1e-6);
    }
}
