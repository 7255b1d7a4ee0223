//! Optimal one-to-one matching between decoder queries and ground-truth residues.
use crate::config::HungarianMatcherConfig;
use candle_core::{DType, Result, Tensor, D};
use itertools::Itertools;

/// Minimum-cost assignment for a row-major `rows × cols` cost matrix.
///
/// Returns `min(rows, cols)` `(row, col)` pairs sorted by row; every row and every column
/// appears at most once.
pub fn linear_sum_assignment(cost: &[f64], rows: usize, cols: usize) -> Vec<(usize, usize)> {
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    if rows > cols {
        let transposed: Vec<f64> = (0..cols)
            .flat_map(|c| (0..rows).map(move |r| cost[r * cols + c]))
            .collect();
        return linear_sum_assignment(&transposed, cols, rows)
            .into_iter()
            .map(|(c, r)| (r, c))
            .sorted()
            .collect();
    }
    // Shortest augmenting paths with row/column potentials, 1-based with a sentinel column 0.
    let (n, m) = (rows, cols);
    let at = |i: usize, j: usize| cost[(i - 1) * m + (j - 1)];
    let mut u = vec![0f64; n + 1];
    let mut v = vec![0f64; m + 1];
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];
    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = at(i0, j) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }
    (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .sorted()
        .collect()
}

/// Matched query and residue indices of one batch element at one decoder depth, sorted by
/// query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    pub pred: Vec<usize>,
    /// Residue indices into the full ground-truth chain.
    pub gt: Vec<usize>,
}

impl Assignment {
    pub fn len(&self) -> usize {
        self.pred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pred.is_empty()
    }
}

/// Ground truth the matcher compares against, all for one recycling iteration.
#[derive(Clone, Copy, Debug)]
pub struct MatchTargets<'a> {
    /// `[B, N]`
    pub aatype: &'a Tensor,
    /// `[B, N]`
    pub sstype: &'a Tensor,
    /// `[B, N, 3]`
    pub normed_ca: &'a Tensor,
    /// `[B, N]`
    pub mask: &'a Tensor,
}

#[derive(Clone, Debug)]
pub struct HungarianMatcher {
    cost_aa: f64,
    cost_ss: f64,
    cost_ca: f64,
}

/// Amino-acid classes that take part in the cost; the unknown class is left out.
const MATCH_AA_CLASSES: usize = 20;
const MATCH_SS_CLASSES: usize = 4;

impl HungarianMatcher {
    pub fn new(cfg: &HungarianMatcherConfig) -> Self {
        Self {
            cost_aa: cfg.cost_aa,
            cost_ss: cfg.cost_ss,
            cost_ca: cfg.cost_ca,
        }
    }

    /// `aa_logits [L, B, Q, ≥20]`, `ss_logits [L, B, Q, ≥4]`, `normed_frames [L, B, Q, 7]`.
    ///
    /// Returns one [`Assignment`] per depth and batch element.
    pub fn forward(
        &self,
        aa_logits: &Tensor,
        ss_logits: &Tensor,
        normed_frames: &Tensor,
        targets: MatchTargets<'_>,
    ) -> Result<Vec<Vec<Assignment>>> {
        let probs = |logits: &Tensor, classes: usize| -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
            let p = candle_nn::ops::softmax_last_dim(&logits.narrow(D::Minus1, 0, classes)?.contiguous()?)?;
            to_vec4(&p)
        };
        let aa = probs(aa_logits, MATCH_AA_CLASSES)?;
        let ss = probs(ss_logits, MATCH_SS_CLASSES)?;
        let ca = to_vec4(&normed_frames.narrow(D::Minus1, 4, 3)?.to_dtype(DType::F32)?)?;

        let gt_aa = targets.aatype.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let gt_ss = targets.sstype.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        let gt_ca = targets.normed_ca.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let gt_mask = targets.mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let mut out = Vec::with_capacity(aa.len());
        for depth in 0..aa.len() {
            let mut per_batch = Vec::with_capacity(aa[depth].len());
            for b in 0..aa[depth].len() {
                let valid = gt_mask[b].iter().positions(|&m| m > 0.5).collect_vec();
                let q = aa[depth][b].len();
                let m = valid.len();
                let mut cost = Vec::with_capacity(q * m);
                for i in 0..q {
                    for &r in &valid {
                        let l1: f32 = (0..3).map(|k| (ca[depth][b][i][k] - gt_ca[b][r][k]).abs()).sum();
                        let p_aa = aa[depth][b][i].get(gt_aa[b][r] as usize).copied().unwrap_or(0.0);
                        let p_ss = ss[depth][b][i].get(gt_ss[b][r] as usize).copied().unwrap_or(0.0);
                        cost.push(
                            self.cost_ca * l1 as f64 - self.cost_aa * p_aa as f64 - self.cost_ss * p_ss as f64,
                        );
                    }
                }
                let (pred, gt) = linear_sum_assignment(&cost, q, m)
                    .into_iter()
                    .map(|(i, j)| (i, valid[j]))
                    .unzip();
                per_batch.push(Assignment { pred, gt });
            }
            out.push(per_batch);
        }
        tracing::debug!(depths = out.len(), "matched decoder queries");
        Ok(out)
    }
}

fn to_vec4(t: &Tensor) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
    (0..t.dim(0)?)
        .map(|i| t.get(i)?.to_dtype(DType::F32)?.to_vec3::<f32>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn total(cost: &[f64], cols: usize, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| cost[r * cols + c]).sum()
    }

    /// Cheapest cost over every injective map from rows into columns.
    fn brute_force(cost: &[f64], rows: usize, cols: usize) -> f64 {
        (0..cols)
            .permutations(rows)
            .map(|cs| cs.iter().enumerate().map(|(r, &c)| cost[r * cols + c]).sum::<f64>())
            .fold(f64::INFINITY, f64::min)
    }

    #[test]
    fn test_assignment_is_optimal() {
        let mut rng = StdRng::seed_from_u64(3);
        for (rows, cols) in [(1, 1), (3, 3), (3, 5), (4, 6), (5, 5)] {
            for _ in 0..5 {
                let cost: Vec<f64> = (0..rows * cols).map(|_| rng.gen_range(-2.0..5.0)).collect();
                let pairs = linear_sum_assignment(&cost, rows, cols);
                assert_eq!(pairs.len(), rows);
                assert!(pairs.iter().map(|p| p.0).all_unique());
                assert!(pairs.iter().map(|p| p.1).all_unique());
                let best = brute_force(&cost, rows, cols);
                assert!((total(&cost, cols, &pairs) - best).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_more_rows_than_columns() {
        // Only the two cheapest rows can be matched.
        let cost = vec![9.0, 9.0, 1.0, 5.0, 9.0, 9.0, 5.0, 1.0];
        let pairs = linear_sum_assignment(&cost, 4, 2);
        assert_eq!(pairs, vec![(1, 0), (3, 1)]);
    }

    #[test]
    fn test_empty_ground_truth() -> anyhow::Result<()> {
        assert!(linear_sum_assignment(&[], 5, 0).is_empty());
        let device = Device::Cpu;
        let matcher = HungarianMatcher::new(&HungarianMatcherConfig {
            cost_aa: 1.0,
            cost_ss: 1.0,
            cost_ca: 5.0,
            enabled: true,
        });
        let aa = Tensor::randn(0f32, 1.0, (2, 1, 3, 21), &device)?;
        let ss = Tensor::randn(0f32, 1.0, (2, 1, 3, 4), &device)?;
        let frames = Tensor::rand(0f32, 1.0, (2, 1, 3, 7), &device)?;
        let aatype = Tensor::new(&[[1u32, 2, 3]], &device)?;
        let sstype = Tensor::new(&[[0u32, 1, 2]], &device)?;
        let ca = Tensor::rand(0f32, 1.0, (1, 3, 3), &device)?;
        let mask = Tensor::zeros((1, 3), DType::F32, &device)?;
        let targets = MatchTargets {
            aatype: &aatype,
            sstype: &sstype,
            normed_ca: &ca,
            mask: &mask,
        };
        let out = matcher.forward(&aa, &ss, &frames, targets)?;
        assert_eq!(out.len(), 2);
        assert!(out.iter().flatten().all(Assignment::is_empty));
        Ok(())
    }

    #[test]
    fn test_matches_by_position() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let matcher = HungarianMatcher::new(&HungarianMatcherConfig {
            cost_aa: 0.0,
            cost_ss: 0.0,
            cost_ca: 1.0,
            enabled: true,
        });
        let aa = Tensor::zeros((1, 1, 3, 21), DType::F32, &device)?;
        let ss = Tensor::zeros((1, 1, 3, 4), DType::F32, &device)?;
        let quat = [1f32, 0.0, 0.0, 0.0];
        let pts = [[0.9f32, 0.9, 0.9], [0.1, 0.1, 0.1], [0.5, 0.5, 0.5]];
        let frames: Vec<f32> = pts.iter().flat_map(|p| quat.iter().chain(p.iter()).copied()).collect();
        let frames = Tensor::from_vec(frames, (1, 1, 3, 7), &device)?;
        let aatype = Tensor::new(&[[0u32, 0, 0]], &device)?;
        let sstype = Tensor::new(&[[0u32, 0, 0]], &device)?;
        let ca = Tensor::new(&[[[0.1f32, 0.1, 0.1], [0.0, 0.0, 0.0], [0.88, 0.9, 0.92]]], &device)?;
        // Residue 1 has no coordinates.
        let mask = Tensor::new(&[[1f32, 0.0, 1.0]], &device)?;
        let targets = MatchTargets {
            aatype: &aatype,
            sstype: &sstype,
            normed_ca: &ca,
            mask: &mask,
        };
        let out = matcher.forward(&aa, &ss, &frames, targets)?;
        assert_eq!(
            out[0][0],
            Assignment {
                pred: vec![0, 1],
                gt: vec![2, 0]
            }
        );
        Ok(())
    }
}
