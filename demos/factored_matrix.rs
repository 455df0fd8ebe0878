//! FactoredMatrix walkthrough
//!
//! Builds a rank-2 5×5 product, inspects its norm and spectrum without
//! materialising it, then composes and indexes it.
//!
//! Usage:
//!   cargo run --release --example factored_matrix

use anyhow::Result;
use candle_core::{Device, Tensor};
use circuit_lens::FactoredMatrix;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let device = Device::Cpu;

    println!("=== FactoredMatrix ===\n");

    let a = Tensor::randn(0f32, 1.0, (5, 2), &device)?;
    let b = Tensor::randn(0f32, 1.0, (2, 5), &device)?;
    let ab = FactoredMatrix::new(a, b)?;
    println!("shape {:?}, hidden dim {}", ab.shape(), ab.mdim());

    let dense = ab.ab()?;
    let dense_norm = f64::from(dense.sqr()?.sum_all()?.to_scalar::<f32>()?).sqrt();
    println!("norm (factored) {:.5}", ab.norm()?);
    println!("norm (dense)    {:.5}", dense_norm);

    println!("\nEigenvalues (from BA):");
    for (i, ev) in ab.eigenvalues()?.iter().enumerate() {
        println!("  λ{i} = {ev}");
    }
    let s: Vec<f32> = ab.singular_values()?.to_vec1()?;
    println!("Singular values: {s:?}");

    let c = Tensor::randn(0f32, 1.0, (5, 3), &device)?;
    let abc = ab.compose_right(&c)?;
    println!("\nAB · C: shape {:?}, hidden dim {}", abc.shape(), abc.mdim());

    let block = ab.index(&[0, 2, 4], &[0, 2, 4])?;
    println!("AB[[0,2,4], [0,2,4]]:\n{}", block.ab()?);
    println!("top-left corner:\n{}", ab.corner(2)?);

    Ok(())
}
