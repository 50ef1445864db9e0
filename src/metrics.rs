//! Agreement metrics between two labelings of the same points
//!
//! Conventions follow scikit-learn: natural logarithms, arithmetic-mean
//! normalization for AMI, and micro-averaged F1 computed on the raw ids
//! (for single-label input this is the fraction of equal entries).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use anyhow::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// The comparison metrics reported for every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMetric {
    AdjustedRandScore,
    AdjustedMutualInfoScore,
    MutualInfoScore,
    F1Score,
}

impl ComparisonMetric {
    pub const ALL: [ComparisonMetric; 4] = [
        Self::AdjustedRandScore,
        Self::AdjustedMutualInfoScore,
        Self::MutualInfoScore,
        Self::F1Score,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::AdjustedRandScore => "adjusted_rand_score",
            Self::AdjustedMutualInfoScore => "adjusted_mutual_info_score",
            Self::MutualInfoScore => "mutual_info_score",
            Self::F1Score => "f1_score",
        }
    }

    /// Score `a` against `b`
    pub fn compute(&self, a: &[i32], b: &[i32]) -> Result<f64> {
        match self {
            Self::AdjustedRandScore => adjusted_rand_score(a, b),
            Self::AdjustedMutualInfoScore => adjusted_mutual_info_score(a, b),
            Self::MutualInfoScore => mutual_info_score(a, b),
            Self::F1Score => f1_micro(a, b),
        }
    }
}

impl fmt::Display for ComparisonMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Contingency table between two labelings.
///
/// Rows follow the ascending distinct values of `a`, columns those of `b`.
#[derive(Debug, Clone)]
pub struct Contingency {
    pub row_values: Vec<i32>,
    pub col_values: Vec<i32>,
    pub counts: Array2<u64>,
}

impl Contingency {
    pub fn new(a: &[i32], b: &[i32]) -> Result<Self> {
        anyhow::ensure!(
            a.len() == b.len(),
            "Labelings have different lengths: {} vs {}",
            a.len(),
            b.len()
        );
        let (row_values, row_of) = dense_codes(a);
        let (col_values, col_of) = dense_codes(b);
        let mut counts = Array2::<u64>::zeros((row_values.len(), col_values.len()));
        for (x, y) in a.iter().zip(b) {
            counts[[row_of[x], col_of[y]]] += 1;
        }
        Ok(Self {
            row_values,
            col_values,
            counts,
        })
    }

    pub fn n_samples(&self) -> u64 {
        self.counts.sum()
    }

    fn row_sums(&self) -> Vec<u64> {
        self.counts.rows().into_iter().map(|r| r.sum()).collect()
    }

    fn col_sums(&self) -> Vec<u64> {
        self.counts.columns().into_iter().map(|c| c.sum()).collect()
    }
}

fn dense_codes<T: Copy + Ord + Hash>(values: &[T]) -> (Vec<T>, HashMap<T, usize>) {
    let mut distinct: Vec<T> = values.to_vec();
    distinct.sort_unstable();
    distinct.dedup();
    let index = distinct.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    (distinct, index)
}

/// Adjusted Rand index, in `[-0.5, 1]`.
///
/// Identical partitions (including two trivial ones) score 1.
pub fn adjusted_rand_score(a: &[i32], b: &[i32]) -> Result<f64> {
    let table = Contingency::new(a, b)?;
    let n = table.n_samples();
    if n == 0 {
        return Ok(1.0);
    }

    // Pair confusion matrix
    let sum_squares: f64 = table.counts.iter().map(|&c| (c as f64).powi(2)).sum();
    let row_sq: f64 = table.row_sums().iter().map(|&c| (c as f64).powi(2)).sum();
    let col_sq: f64 = table.col_sums().iter().map(|&c| (c as f64).powi(2)).sum();
    let nf = n as f64;
    let tp = sum_squares - nf;
    let fp = row_sq - sum_squares;
    let fn_ = col_sq - sum_squares;
    let tn = nf * nf - fp - fn_ - sum_squares;

    if fn_ == 0.0 && fp == 0.0 {
        return Ok(1.0);
    }
    Ok(2.0 * (tp * tn - fn_ * fp) / ((tp + fn_) * (fn_ + tn) + (tp + fp) * (fp + tn)))
}

/// Mutual information in nats (never negative)
pub fn mutual_info_score(a: &[i32], b: &[i32]) -> Result<f64> {
    let table = Contingency::new(a, b)?;
    Ok(mutual_info_from_table(&table))
}

fn mutual_info_from_table(table: &Contingency) -> f64 {
    let n = table.n_samples() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let rows = table.row_sums();
    let cols = table.col_sums();
    let mut mi = 0.0;
    for ((i, j), &nij) in table.counts.indexed_iter() {
        if nij == 0 {
            continue;
        }
        let nij = nij as f64;
        mi += nij / n * (nij * n / (rows[i] as f64 * cols[j] as f64)).ln();
    }
    mi.max(0.0)
}

fn entropy(counts: &[u64]) -> f64 {
    let n: u64 = counts.iter().sum();
    if n == 0 {
        return 1.0;
    }
    let n = n as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.ln()
        })
        .sum::<f64>()
        .max(0.0)
}

/// Expected mutual information under the permutation model
fn expected_mutual_info(table: &Contingency) -> f64 {
    let n = table.n_samples();
    let rows = table.row_sums();
    let cols = table.col_sums();
    let nf = n as f64;
    let gln_n = ln_gamma(nf + 1.0);

    let mut emi = 0.0;
    for &ai in &rows {
        for &bj in &cols {
            let start = 1.max((ai + bj).saturating_sub(n));
            let end = ai.min(bj);
            let (af, bf) = (ai as f64, bj as f64);
            let fixed = ln_gamma(af + 1.0) + ln_gamma(bf + 1.0) + ln_gamma(nf - af + 1.0)
                + ln_gamma(nf - bf + 1.0)
                - gln_n;
            for nij in start..=end {
                let x = nij as f64;
                let term1 = x / nf;
                let term2 = (nf * x).ln() - af.ln() - bf.ln();
                let gln = fixed
                    - ln_gamma(x + 1.0)
                    - ln_gamma(af - x + 1.0)
                    - ln_gamma(bf - x + 1.0)
                    - ln_gamma(nf - af - bf + x + 1.0);
                emi += term1 * term2 * gln.exp();
            }
        }
    }
    emi
}

/// Adjusted mutual information with arithmetic-mean normalization.
///
/// Scores 1 when both labelings are trivial and 0 when only one is.
pub fn adjusted_mutual_info_score(a: &[i32], b: &[i32]) -> Result<f64> {
    let table = Contingency::new(a, b)?;
    let (n_rows, n_cols) = table.counts.dim();
    if (n_rows == 1 && n_cols == 1) || (n_rows == 0 && n_cols == 0) {
        return Ok(1.0);
    }

    let mi = mutual_info_from_table(&table);
    let emi = expected_mutual_info(&table);
    let h_a = entropy(&table.row_sums());
    let h_b = entropy(&table.col_sums());
    let normalizer = 0.5 * (h_a + h_b);

    let mut denominator = normalizer - emi;
    if denominator < 0.0 {
        denominator = denominator.min(-f64::EPSILON);
    } else {
        denominator = denominator.max(f64::EPSILON);
    }
    Ok((mi - emi) / denominator)
}

/// Micro-averaged F1 on raw ids: the fraction of positions where `a == b`
pub fn f1_micro(a: &[i32], b: &[i32]) -> Result<f64> {
    anyhow::ensure!(
        a.len() == b.len(),
        "Labelings have different lengths: {} vs {}",
        a.len(),
        b.len()
    );
    if a.is_empty() {
        return Ok(0.0);
    }
    let equal = a.iter().zip(b).filter(|(x, y)| x == y).count();
    Ok(equal as f64 / a.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_identical_up_to_relabeling() {
        let a = [0, 0, 1, 1, 2, 2];
        let b = [5, 5, 3, 3, 9, 9];
        assert!(close(adjusted_rand_score(&a, &b).unwrap(), 1.0));
        assert!(close(adjusted_mutual_info_score(&a, &b).unwrap(), 1.0));
        assert!(close(mutual_info_score(&a, &b).unwrap(), 3f64.ln()));
        assert!(close(f1_micro(&a, &b).unwrap(), 0.0));
    }

    #[test]
    fn test_reference_values() {
        // scikit-learn: adjusted_rand_score([0,0,1,1],[0,0,1,2]) = 0.5714285714
        let ari = adjusted_rand_score(&[0, 0, 1, 1], &[0, 0, 1, 2]).unwrap();
        assert!(close(ari, 4.0 / 7.0));

        // scikit-learn: adjusted_rand_score([0,0,1,2],[0,0,1,1]) = 0.5714285714
        let ari = adjusted_rand_score(&[0, 0, 1, 2], &[0, 0, 1, 1]).unwrap();
        assert!(close(ari, 4.0 / 7.0));

        // scikit-learn: adjusted_rand_score([0,0,1,1],[0,1,0,1]) = -0.5
        let ari = adjusted_rand_score(&[0, 0, 1, 1], &[0, 1, 0, 1]).unwrap();
        assert!(close(ari, -0.5));

        // mutual_info_score([0,0,1,1],[0,0,1,2]) = ln 2
        let mi = mutual_info_score(&[0, 0, 1, 1], &[0, 0, 1, 2]).unwrap();
        assert!(close(mi, 2f64.ln()));
    }

    #[test]
    fn test_ami_independent_is_not_positive() {
        // scikit-learn: adjusted_mutual_info_score([0,0,1,1],[0,1,0,1]) = -0.5
        let ami = adjusted_mutual_info_score(&[0, 0, 1, 1], &[0, 1, 0, 1]).unwrap();
        assert!(close(ami, -0.5), "ami = {ami}");
    }

    #[test]
    fn test_trivial_assignment_scores_zero() {
        let clusters = [0; 8];
        let truth = [0, 1, 0, 1, 1, 0, 0, 1];
        assert!(close(adjusted_rand_score(&clusters, &truth).unwrap(), 0.0));
        assert!(close(adjusted_mutual_info_score(&clusters, &truth).unwrap(), 0.0));
        assert!(close(mutual_info_score(&clusters, &truth).unwrap(), 0.0));
    }

    #[test]
    fn test_both_trivial() {
        let a = [1; 5];
        let b = [3; 5];
        assert!(close(adjusted_rand_score(&a, &b).unwrap(), 1.0));
        assert!(close(adjusted_mutual_info_score(&a, &b).unwrap(), 1.0));
    }

    #[test]
    fn test_f1_micro_counts_matches() {
        let f1 = f1_micro(&[0, 1, 2, -1], &[0, 1, 1, 1]).unwrap();
        assert!(close(f1, 0.5));
    }

    #[test]
    fn test_length_mismatch() {
        for metric in ComparisonMetric::ALL {
            assert!(metric.compute(&[0, 1], &[0]).is_err());
        }
    }

    #[test]
    fn test_contingency_layout() {
        let table = Contingency::new(&[-1, 0, 0, 2], &[1, 0, 1, 1]).unwrap();
        assert_eq!(table.row_values, vec![-1, 0, 2]);
        assert_eq!(table.col_values, vec![0, 1]);
        assert_eq!(table.counts[[0, 1]], 1);
        assert_eq!(table.counts[[1, 0]], 1);
        assert_eq!(table.counts[[1, 1]], 1);
        assert_eq!(table.counts[[2, 1]], 1);
        assert_eq!(table.n_samples(), 4);
    }
}
