use crate::LabelType;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::mem::size_of;

/// A distance space over opaque vector blobs. The engine never interprets
/// vector contents; only the space knows the encoding.
pub trait Space: Clone + Send + Sync + 'static {
  /// Bytes per stored vector.
  fn data_size(&self) -> usize;

  /// Bytes per query blob. Equal to `data_size` except for asymmetric
  /// spaces (ADC: raw-float query against coded storage).
  fn query_size(&self) -> usize {
    self.data_size()
  }

  /// `a` is the query side, `b` the stored side.
  fn distance(&self, a: &[u8], b: &[u8]) -> f32;
}

pub fn f32s_as_bytes(v: &[f32]) -> &[u8] {
  bytemuck::cast_slice(v)
}

pub fn i8s_as_bytes(v: &[i8]) -> &[u8] {
  bytemuck::cast_slice(v)
}

pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
  bytes
    .chunks_exact(size_of::<f32>())
    .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
    .collect()
}

pub fn label_allowed(filter: Option<&dyn Fn(LabelType) -> bool>, label: LabelType) -> bool {
  filter.map(|f| f(label)).unwrap_or(true)
}

type DistanceFn = unsafe fn(*const f32, *const f32, usize) -> f32;
type Int8DotFn = unsafe fn(*const i8, *const i8, usize) -> i32;

// Stored blobs come out of `Vec<u8>` allocations, so all float loads must be
// unaligned-safe.
unsafe fn l2_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut res = 0.0_f32;
  for i in 0..dim {
    let t = a.add(i).read_unaligned() - b.add(i).read_unaligned();
    res += t * t;
  }
  res
}

unsafe fn ip_distance_scalar(a: *const f32, b: *const f32, dim: usize) -> f32 {
  let mut dot = 0.0_f32;
  for i in 0..dim {
    dot += a.add(i).read_unaligned() * b.add(i).read_unaligned();
  }
  1.0_f32 - dot
}

unsafe fn ip_int8_scalar(a: *const i8, b: *const i8, dim: usize) -> i32 {
  let mut dot = 0_i32;
  for i in 0..dim {
    dot += (*a.add(i) as i32) * (*b.add(i) as i32);
  }
  dot
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86_simd {
  use super::DistanceFn;
  use super::Int8DotFn;
  #[cfg(target_arch = "x86")]
  use std::arch::x86::*;
  #[cfg(target_arch = "x86_64")]
  use std::arch::x86_64::*;

  #[target_feature(enable = "sse")]
  pub unsafe fn l2_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut sum = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      let va = _mm_loadu_ps(a.add(i));
      let vb = _mm_loadu_ps(b.add(i));
      let diff = _mm_sub_ps(va, vb);
      sum = _mm_add_ps(sum, _mm_mul_ps(diff, diff));
      i += 4;
    }

    let mut tmp = [0.0_f32; 4];
    _mm_storeu_ps(tmp.as_mut_ptr(), sum);
    let mut res = tmp.iter().sum::<f32>();

    while i < dim {
      let t = a.add(i).read_unaligned() - b.add(i).read_unaligned();
      res += t * t;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn l2_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut sum = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      let va = _mm256_loadu_ps(a.add(i));
      let vb = _mm256_loadu_ps(b.add(i));
      let diff = _mm256_sub_ps(va, vb);
      sum = _mm256_add_ps(sum, _mm256_mul_ps(diff, diff));
      i += 8;
    }

    let mut tmp = [0.0_f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), sum);
    let mut res = tmp.iter().sum::<f32>();

    while i < dim {
      let t = a.add(i).read_unaligned() - b.add(i).read_unaligned();
      res += t * t;
      i += 1;
    }
    res
  }

  #[target_feature(enable = "sse")]
  pub unsafe fn ip_distance_sse(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut sum = _mm_setzero_ps();
    let mut i = 0usize;
    while i + 4 <= dim {
      let va = _mm_loadu_ps(a.add(i));
      let vb = _mm_loadu_ps(b.add(i));
      sum = _mm_add_ps(sum, _mm_mul_ps(va, vb));
      i += 4;
    }

    let mut tmp = [0.0_f32; 4];
    _mm_storeu_ps(tmp.as_mut_ptr(), sum);
    let mut dot = tmp.iter().sum::<f32>();

    while i < dim {
      dot += a.add(i).read_unaligned() * b.add(i).read_unaligned();
      i += 1;
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "avx")]
  pub unsafe fn ip_distance_avx(a: *const f32, b: *const f32, dim: usize) -> f32 {
    let mut sum = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= dim {
      let va = _mm256_loadu_ps(a.add(i));
      let vb = _mm256_loadu_ps(b.add(i));
      sum = _mm256_add_ps(sum, _mm256_mul_ps(va, vb));
      i += 8;
    }

    let mut tmp = [0.0_f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), sum);
    let mut dot = tmp.iter().sum::<f32>();

    while i < dim {
      dot += a.add(i).read_unaligned() * b.add(i).read_unaligned();
      i += 1;
    }
    1.0_f32 - dot
  }

  #[target_feature(enable = "avx2")]
  pub unsafe fn ip_int8_avx2(a: *const i8, b: *const i8, dim: usize) -> i32 {
    let mut x = a;
    let mut y = b;
    let mut d = dim;
    let mut sum256 = _mm256_setzero_si256();
    while d >= 16 {
      let ma = _mm256_cvtepi8_epi16(_mm_loadu_si128(x as *const __m128i));
      let mb = _mm256_cvtepi8_epi16(_mm_loadu_si128(y as *const __m128i));
      sum256 = _mm256_add_epi32(sum256, _mm256_madd_epi16(ma, mb));
      x = x.add(16);
      y = y.add(16);
      d -= 16;
    }

    let mut sum128 = _mm256_extracti128_si256(sum256, 1);
    sum128 = _mm_add_epi32(sum128, _mm256_extracti128_si256(sum256, 0));
    sum128 = _mm_hadd_epi32(sum128, sum128);
    sum128 = _mm_hadd_epi32(sum128, sum128);
    let mut res = _mm_cvtsi128_si32(sum128);

    while d > 0 {
      res += (*x as i32) * (*y as i32);
      x = x.add(1);
      y = y.add(1);
      d -= 1;
    }
    res
  }

  pub fn pick_l2() -> Option<DistanceFn> {
    if std::is_x86_feature_detected!("avx") {
      return Some(l2_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(l2_sse);
    }
    None
  }

  pub fn pick_ip_distance() -> Option<DistanceFn> {
    if std::is_x86_feature_detected!("avx") {
      return Some(ip_distance_avx);
    }
    if std::is_x86_feature_detected!("sse") {
      return Some(ip_distance_sse);
    }
    None
  }

  pub fn pick_ip_int8() -> Option<Int8DotFn> {
    if std::is_x86_feature_detected!("avx2") {
      return Some(ip_int8_avx2);
    }
    None
  }
}

/// Squared-L2 over raw little-endian f32 vectors.
#[derive(Clone, Debug)]
pub struct L2Space {
  dim: usize,
  dist_fn: DistanceFn,
}

impl L2Space {
  pub fn new(dim: usize) -> Self {
    let mut dist_fn: DistanceFn = l2_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86_simd::pick_l2() {
      dist_fn = f;
    }
    Self { dim, dist_fn }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }
}

impl Space for L2Space {
  fn data_size(&self) -> usize {
    self.dim * size_of::<f32>()
  }

  fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), self.data_size());
    debug_assert_eq!(b.len(), self.data_size());
    unsafe { (self.dist_fn)(a.as_ptr() as *const f32, b.as_ptr() as *const f32, self.dim) }
  }
}

/// `1 - dot(a, b)` over raw little-endian f32 vectors.
#[derive(Clone, Debug)]
pub struct InnerProductSpace {
  dim: usize,
  dist_fn: DistanceFn,
}

impl InnerProductSpace {
  pub fn new(dim: usize) -> Self {
    let mut dist_fn: DistanceFn = ip_distance_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86_simd::pick_ip_distance() {
      dist_fn = f;
    }
    Self { dim, dist_fn }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }
}

impl Space for InnerProductSpace {
  fn data_size(&self) -> usize {
    self.dim * size_of::<f32>()
  }

  fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), self.data_size());
    debug_assert_eq!(b.len(), self.data_size());
    unsafe { (self.dist_fn)(a.as_ptr() as *const f32, b.as_ptr() as *const f32, self.dim) }
  }
}

/// Inner-product distance over vectors quantized to i8 with a uniform clipping
/// scale. De-quantizes the integer dot product with the stored inverse of
/// scale².
#[derive(Clone, Debug)]
pub struct Int8InnerProductSpace {
  dim: usize,
  inv_scale2: f32,
  dot_fn: Int8DotFn,
}

impl Int8InnerProductSpace {
  pub fn new(dim: usize, scale: f32) -> Self {
    assert!(scale > 0.0, "scale must be positive");
    let mut dot_fn: Int8DotFn = ip_int8_scalar;
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if let Some(f) = x86_simd::pick_ip_int8() {
      dot_fn = f;
    }
    Self {
      dim,
      inv_scale2: 1.0 / (scale * scale),
      dot_fn,
    }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  pub fn inv_scale2(&self) -> f32 {
    self.inv_scale2
  }
}

impl Space for Int8InnerProductSpace {
  fn data_size(&self) -> usize {
    self.dim
  }

  fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), self.data_size());
    debug_assert_eq!(b.len(), self.data_size());
    let dot =
      unsafe { (self.dot_fn)(a.as_ptr() as *const i8, b.as_ptr() as *const i8, self.dim) };
    1.0_f32 - (dot as f32) * self.inv_scale2
  }
}

// Fraction of components allowed above the clipping threshold.
const SQ8_CLIP_RATIO: f64 = 0.9;

/// Clipping threshold for SQ8 quantization: the component magnitude at the
/// top-decile boundary, taken over every component of every vector.
pub(crate) fn sq8_clip_max(num_vectors: usize, components: impl IntoIterator<Item = f32>) -> f32 {
  let top_n = (((1.0 - SQ8_CLIP_RATIO) * num_vectors as f64) as usize).max(1);

  let mut top: BinaryHeap<Reverse<OrderedFloat<f32>>> = BinaryHeap::with_capacity(top_n + 1);
  for v in components {
    let abs = v.abs();
    if top.len() < top_n {
      top.push(Reverse(OrderedFloat(abs)));
    } else if abs > top.peek().unwrap().0 .0 {
      top.pop();
      top.push(Reverse(OrderedFloat(abs)));
    }
  }

  let mut max_val = 0.0_f32;
  while let Some(Reverse(OrderedFloat(v))) = top.pop() {
    max_val = v;
    if max_val > 0.0 {
      break;
    }
  }
  max_val
}

/// Quantize one f32 vector to i8 with saturation at the i8 range.
pub fn sq8_encode(vector: &[f32], scale: f32) -> Vec<i8> {
  vector
    .iter()
    .map(|&x| {
      let scaled = x * scale;
      if scaled > 127.0 {
        127
      } else if scaled <= -128.0 {
        -128
      } else {
        scaled as i8
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use rand::rngs::StdRng;
  use rand::Rng;
  use rand::SeedableRng;

  fn l2_ref(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
      .zip(b.iter())
      .map(|(a, b)| {
        let d = a - b;
        d * d
      })
      .sum()
  }

  fn ip_distance_ref(a: &[f32], b: &[f32]) -> f32 {
    1.0 - a.iter().zip(b.iter()).map(|(a, b)| a * b).sum::<f32>()
  }

  #[test]
  fn l2_distance_matches_scalar_with_simd_dispatch() {
    let mut rng = StdRng::seed_from_u64(123);
    let dims = [1usize, 2, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 63, 64, 65, 127, 128, 129];
    for &dim in &dims {
      let space = L2Space::new(dim);
      for _ in 0..50 {
        let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let expected = l2_ref(&a, &b);
        let got = space.distance(f32s_as_bytes(&a), f32s_as_bytes(&b));
        assert_relative_eq!(got, expected, epsilon = 1e-3, max_relative = 1e-3);
      }
    }
  }

  #[test]
  fn inner_product_distance_matches_scalar_with_simd_dispatch() {
    let mut rng = StdRng::seed_from_u64(456);
    let dims = [1usize, 2, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 63, 64, 65, 127, 128, 129];
    for &dim in &dims {
      let space = InnerProductSpace::new(dim);
      for _ in 0..50 {
        let a: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let expected = ip_distance_ref(&a, &b);
        let got = space.distance(f32s_as_bytes(&a), f32s_as_bytes(&b));
        assert_relative_eq!(got, expected, epsilon = 1e-3, max_relative = 1e-3);
      }
    }
  }

  #[test]
  fn int8_inner_product_matches_scalar_reference() {
    let mut rng = StdRng::seed_from_u64(789);
    let dims = [1usize, 3, 15, 16, 17, 32, 33, 64, 100, 128];
    for &dim in &dims {
      let space = Int8InnerProductSpace::new(dim, 1.0);
      for _ in 0..50 {
        let a: Vec<i8> = (0..dim).map(|_| rng.gen_range(-128..=127)).collect();
        let b: Vec<i8> = (0..dim).map(|_| rng.gen_range(-128..=127)).collect();
        let dot: i32 = a
          .iter()
          .zip(b.iter())
          .map(|(&x, &y)| (x as i32) * (y as i32))
          .sum();
        let expected = 1.0 - dot as f32;
        let got = space.distance(i8s_as_bytes(&a), i8s_as_bytes(&b));
        assert_relative_eq!(got, expected);
      }
    }
  }

  #[test]
  fn int8_space_dequantizes_with_inverse_scale_squared() {
    let dim = 4;
    let scale = 2.0_f32;
    let space = Int8InnerProductSpace::new(dim, scale);
    // Quantized encodings of [1, 1, 1, 1] and [0.5, 0.5, 0.5, 0.5] at scale 2.
    let a = sq8_encode(&[1.0, 1.0, 1.0, 1.0], scale);
    let b = sq8_encode(&[0.5, 0.5, 0.5, 0.5], scale);
    let got = space.distance(i8s_as_bytes(&a), i8s_as_bytes(&b));
    assert_relative_eq!(got, 1.0 - 2.0, epsilon = 1e-6);
  }

  #[test]
  fn sq8_encode_saturates() {
    let enc = sq8_encode(&[1000.0, -1000.0, 0.0], 1.0);
    assert_eq!(enc, vec![127, -128, 0]);
  }

  #[test]
  fn sq8_clip_max_takes_top_decile_boundary() {
    // 10 vectors, one component each: values 1..=10. top_n = 1, so the clip
    // threshold is the single largest magnitude.
    let max = sq8_clip_max(10, (1..=10).map(|v| v as f32));
    assert_relative_eq!(max, 10.0);

    // 20 vectors: top_n = 2, threshold is the 2nd largest.
    let max = sq8_clip_max(20, (1..=20).map(|v| v as f32));
    assert_relative_eq!(max, 19.0);
  }
}
