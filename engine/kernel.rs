//! Covariance / similarity kernels shared by the kernel model families.

use ndarray::{Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Kernel {
    /// `k(x, z) = x · z`
    #[default]
    Linear,
    /// `k(x, z) = exp(-gamma * |x - z|^2)`
    Rbf { gamma: f64 },
}

impl Kernel {
    #[inline]
    pub fn evaluate(&self, x: ArrayView1<f64>, z: ArrayView1<f64>) -> f64 {
        match *self {
            Self::Linear => x.dot(&z),
            Self::Rbf { gamma } => {
                let sq_dist: f64 = x.iter().zip(z.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (-gamma * sq_dist).exp()
            }
        }
    }

    /// Gram matrix `K[i, j] = k(a_i, b_j)`, filled row-parallel.
    pub fn gram(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        let mut k = Array2::zeros((a.nrows(), b.nrows()));
        Zip::from(k.rows_mut())
            .and(a.rows())
            .par_for_each(|mut out, x| {
                for (slot, z) in out.iter_mut().zip(b.rows()) {
                    *slot = self.evaluate(x, z);
                }
            });
        k
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Linear => Ok(()),
            Self::Rbf { gamma } if gamma.is_finite() && gamma > 0.0 => Ok(()),
            Self::Rbf { gamma } => Err(format!(
                "RBF gamma must be positive and finite, got {gamma}"
            )),
        }
    }

    pub fn describe(&self) -> String {
        match *self {
            Self::Linear => "linear".to_string(),
            Self::Rbf { gamma } => format!("rbf(gamma={gamma})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn linear_gram_is_inner_products() {
        let a = array![[1.0, 2.0], [0.0, -1.0]];
        let b = array![[3.0, 1.0], [1.0, 1.0], [0.5, 0.0]];
        let k = Kernel::Linear.gram(a.view(), b.view());
        assert_eq!(k.shape(), &[2, 3]);
        let expected = a.dot(&b.t());
        for (got, want) in k.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn rbf_is_one_on_the_diagonal_and_symmetric() {
        let x = array![[0.0, 1.0], [2.0, -1.0], [0.5, 0.5]];
        let k = Kernel::Rbf { gamma: 0.3 }.gram(x.view(), x.view());
        for i in 0..3 {
            assert_abs_diff_eq!(k[[i, i]], 1.0, epsilon = 1e-12);
            for j in 0..3 {
                assert_abs_diff_eq!(k[[i, j]], k[[j, i]], epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(k[[0, 1]], (-0.3f64 * 8.0).exp(), epsilon = 1e-12);
    }

    #[test]
    fn rejects_non_positive_gamma() {
        assert!(Kernel::Rbf { gamma: 0.0 }.validate().is_err());
        assert!(Kernel::Linear.validate().is_ok());
    }
}
