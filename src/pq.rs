use crate::error::Error;
use crate::error::Result;
use crate::space::Space;
use std::mem::size_of;
use std::sync::Arc;

fn f32_at(bytes: &[u8], idx: usize) -> f32 {
  let o = idx * size_of::<f32>();
  f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap())
}

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| {
      let d = x - y;
      d * d
    })
    .sum()
}

/// Trained product-quantization codebook: `m` subquantizers of `ks` centroids
/// over `dsub`-dimensional subvectors. Owned by the spaces that use it; there
/// is no process-wide codebook state.
#[derive(Debug)]
pub struct PqCodebook {
  m: usize,
  ks: usize,
  dsub: usize,
  // Per subquantizer, `ks * dsub` floats, centroid-major.
  centroids: Vec<Vec<f32>>,
}

impl PqCodebook {
  pub fn new(dsub: usize, centroids: Vec<Vec<f32>>) -> Result<Self> {
    if dsub == 0 || centroids.is_empty() {
      return Err(Error::InvalidArgument(
        "codebook needs at least one subquantizer and dsub > 0".to_string(),
      ));
    }
    let first = centroids[0].len();
    if first == 0 || first % dsub != 0 {
      return Err(Error::InvalidArgument(
        "centroid table length must be a positive multiple of dsub".to_string(),
      ));
    }
    let ks = first / dsub;
    if ks > 256 {
      return Err(Error::InvalidArgument(
        "at most 256 centroids per subquantizer (codes are u8)".to_string(),
      ));
    }
    if centroids.iter().any(|c| c.len() != first) {
      return Err(Error::InvalidArgument(
        "all subquantizers must have the same centroid table length".to_string(),
      ));
    }
    Ok(Self {
      m: centroids.len(),
      ks,
      dsub,
      centroids,
    })
  }

  pub fn num_subquantizers(&self) -> usize {
    self.m
  }

  pub fn num_centroids(&self) -> usize {
    self.ks
  }

  pub fn dsub(&self) -> usize {
    self.dsub
  }

  /// Dimension of the raw vectors this codebook encodes.
  pub fn dim(&self) -> usize {
    self.m * self.dsub
  }

  fn centroid(&self, sub: usize, idx: usize) -> &[f32] {
    &self.centroids[sub][idx * self.dsub..(idx + 1) * self.dsub]
  }

  /// Nearest-centroid encoding of a raw vector, one code byte per
  /// subquantizer.
  pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
    if vector.len() != self.dim() {
      return Err(Error::DimensionMismatch {
        expected: self.dim() * size_of::<f32>(),
        actual: vector.len() * size_of::<f32>(),
      });
    }
    let mut code = vec![0u8; self.m];
    for i in 0..self.m {
      let sub = &vector[i * self.dsub..(i + 1) * self.dsub];
      let mut best = 0usize;
      let mut best_dist = f32::INFINITY;
      for j in 0..self.ks {
        let d = l2_sq(sub, self.centroid(i, j));
        if d < best_dist {
          best_dist = d;
          best = j;
        }
      }
      code[i] = best as u8;
    }
    Ok(code)
  }

  /// Packed lower-triangular table of squared centroid-to-centroid distances
  /// per subquantizer; entry for centroids `j >= k` lives at
  /// `j * (j + 1) / 2 + k`.
  pub fn pairwise_table(&self) -> Vec<Vec<f32>> {
    let mut tables = Vec::with_capacity(self.m);
    for i in 0..self.m {
      let mut table = vec![0.0_f32; self.ks * (self.ks + 1) / 2];
      for j in 0..self.ks {
        for k in 0..=j {
          let d = l2_sq(self.centroid(i, j), self.centroid(i, k));
          table[j * (j + 1) / 2 + k] = d;
        }
      }
      tables.push(table);
    }
    tables
  }
}

/// Asymmetric PQ distance: raw-f32 query against coded storage. The query
/// side reconstructs nothing; each stored code selects a centroid and the
/// squared distance from the query subvector accumulates.
///
/// Asymmetric means no node-to-node distance, so this space only drives
/// searches over an already-built (loaded or merged) index.
#[derive(Clone, Debug)]
pub struct PqAdcSpace {
  codebook: Arc<PqCodebook>,
}

impl PqAdcSpace {
  pub fn new(codebook: Arc<PqCodebook>) -> Self {
    Self { codebook }
  }

  pub fn codebook(&self) -> &Arc<PqCodebook> {
    &self.codebook
  }
}

impl Space for PqAdcSpace {
  fn data_size(&self) -> usize {
    self.codebook.m
  }

  fn query_size(&self) -> usize {
    self.codebook.dim() * size_of::<f32>()
  }

  fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), self.query_size());
    debug_assert_eq!(b.len(), self.data_size());
    let dsub = self.codebook.dsub;
    let mut res = 0.0_f32;
    for i in 0..self.codebook.m {
      let centroid = self.codebook.centroid(i, b[i] as usize);
      for j in 0..dsub {
        let d = f32_at(a, i * dsub + j) - centroid[j];
        res += d * d;
      }
    }
    res
  }
}

/// Symmetric PQ distance: both sides are codes; distances come from the
/// precomputed pairwise centroid table.
#[derive(Clone, Debug)]
pub struct PqSdcSpace {
  codebook: Arc<PqCodebook>,
  tables: Arc<Vec<Vec<f32>>>,
}

impl PqSdcSpace {
  pub fn new(codebook: Arc<PqCodebook>) -> Self {
    let tables = Arc::new(codebook.pairwise_table());
    Self { codebook, tables }
  }

  pub fn codebook(&self) -> &Arc<PqCodebook> {
    &self.codebook
  }
}

impl Space for PqSdcSpace {
  fn data_size(&self) -> usize {
    self.codebook.m
  }

  fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), self.data_size());
    debug_assert_eq!(b.len(), self.data_size());
    let mut res = 0.0_f32;
    for i in 0..self.codebook.m {
      let (lo, hi) = if a[i] < b[i] { (a[i], b[i]) } else { (b[i], a[i]) };
      let (lo, hi) = (lo as usize, hi as usize);
      res += self.tables[i][hi * (hi + 1) / 2 + lo];
    }
    res
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::space::f32s_as_bytes;
  use approx::assert_relative_eq;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  fn random_codebook(rng: &mut StdRng, m: usize, ks: usize, dsub: usize) -> PqCodebook {
    let centroids = (0..m)
      .map(|_| (0..ks * dsub).map(|_| rng.gen_range(-1.0..1.0)).collect())
      .collect();
    PqCodebook::new(dsub, centroids).unwrap()
  }

  #[test]
  fn encode_picks_nearest_centroid() {
    // Two subquantizers of 1 dim each, centroids at {0, 10} and {-5, 5}.
    let cb = PqCodebook::new(1, vec![vec![0.0, 10.0], vec![-5.0, 5.0]]).unwrap();
    assert_eq!(cb.encode(&[9.0, -4.0]).unwrap(), vec![1, 0]);
    assert_eq!(cb.encode(&[1.0, 4.0]).unwrap(), vec![0, 1]);
  }

  #[test]
  fn encode_rejects_wrong_dim() {
    let cb = PqCodebook::new(2, vec![vec![0.0, 0.0, 1.0, 1.0]]).unwrap();
    assert!(cb.encode(&[0.0]).is_err());
  }

  #[test]
  fn sdc_matches_centroid_l2_and_is_symmetric() {
    let mut rng = StdRng::seed_from_u64(1);
    let cb = Arc::new(random_codebook(&mut rng, 4, 16, 3));
    let space = PqSdcSpace::new(cb.clone());

    for _ in 0..50 {
      let a: Vec<u8> = (0..4).map(|_| rng.gen_range(0..16)).collect();
      let b: Vec<u8> = (0..4).map(|_| rng.gen_range(0..16)).collect();

      let mut expected = 0.0_f32;
      for i in 0..4 {
        let ca = cb.centroid(i, a[i] as usize);
        let cbn = cb.centroid(i, b[i] as usize);
        expected += l2_sq(ca, cbn);
      }

      let got = space.distance(&a, &b);
      assert_relative_eq!(got, expected, epsilon = 1e-5, max_relative = 1e-5);
      assert_relative_eq!(space.distance(&b, &a), got);
    }
  }

  #[test]
  fn adc_matches_query_to_centroid_l2() {
    let mut rng = StdRng::seed_from_u64(2);
    let cb = Arc::new(random_codebook(&mut rng, 3, 8, 4));
    let space = PqAdcSpace::new(cb.clone());
    assert_eq!(space.data_size(), 3);
    assert_eq!(space.query_size(), 3 * 4 * 4);

    for _ in 0..50 {
      let query: Vec<f32> = (0..12).map(|_| rng.gen_range(-1.0..1.0)).collect();
      let codes: Vec<u8> = (0..3).map(|_| rng.gen_range(0..8)).collect();

      let mut expected = 0.0_f32;
      for i in 0..3 {
        expected += l2_sq(&query[i * 4..(i + 1) * 4], cb.centroid(i, codes[i] as usize));
      }

      let got = space.distance(f32s_as_bytes(&query), &codes);
      assert_relative_eq!(got, expected, epsilon = 1e-5, max_relative = 1e-5);
    }
  }

  #[test]
  fn adc_of_exact_centroid_query_is_zero() {
    let cb = Arc::new(PqCodebook::new(2, vec![vec![1.0, 2.0, 3.0, 4.0]]).unwrap());
    let space = PqAdcSpace::new(cb);
    let query = [3.0_f32, 4.0];
    assert_relative_eq!(space.distance(f32s_as_bytes(&query), &[1]), 0.0);
  }
}
