use crate::error::Error;
use crate::error::Result;
use crate::hnsw::HnswIndex;
use crate::LabelType;
use crate::Space;
use crate::TableInt;
use ahash::HashMap;
use ahash::HashMapExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

struct ShardRecord {
  external_label: LabelType,
  shard_id: u32,
  shard_internal: TableInt,
  level: usize,
  // Per layer 0..=level, neighbors as external labels.
  neighbors: Vec<Vec<LabelType>>,
}

// Reduce a unioned neighbor list to the layer cap: sort, de-duplicate, and if
// still over, uniformly shuffle and truncate.
fn merge_select_neighbors(rng: &mut StdRng, neighbors: &mut Vec<TableInt>, cap: usize) {
  neighbors.sort_unstable();
  neighbors.dedup();
  if neighbors.len() <= cap {
    return;
  }
  neighbors.shuffle(rng);
  neighbors.truncate(cap);
}

impl<S: Space> HnswIndex<S> {
  /// Offline union of independently built shards sharing a label space.
  ///
  /// A label present in several shards becomes one node: its level is the max
  /// over the shard records, its vector comes from the first shard in
  /// `(label, shard)` order, and its per-layer neighbor lists are the union of
  /// the shard lists, translated to the new id space and pruned to the layer
  /// cap. No reverse edges are synthesized, so labels only reachable through
  /// a shard the entry point cannot see stay unreachable by graph search;
  /// they remain addressable by label.
  pub fn merge_shards(
    space: S,
    max_elements: usize,
    m: usize,
    ef_construction: usize,
    random_seed: u64,
    shards: &[&HnswIndex<S>],
  ) -> Result<Self> {
    if shards.is_empty() {
      return Err(Error::InvalidArgument("no shards to merge".to_string()));
    }
    for shard in shards {
      if shard.space().data_size() != space.data_size() {
        return Err(Error::InvalidArgument(
          "shard data size differs from the target space".to_string(),
        ));
      }
    }

    let mut records: Vec<ShardRecord> = Vec::new();
    for (shard_id, shard) in shards.iter().enumerate() {
      let count = shard.get_current_element_count();
      for internal in 0..count {
        let internal = internal as TableInt;
        let level = shard.element_level(internal);
        let mut neighbors = Vec::with_capacity(level + 1);
        for l in 0..=level {
          neighbors.push(shard.neighbor_labels(internal, l)?);
        }
        records.push(ShardRecord {
          external_label: shard.get_external_label(internal)?,
          shard_id: shard_id as u32,
          shard_internal: internal,
          level,
          neighbors,
        });
      }
    }
    if records.is_empty() {
      return Err(Error::InvalidArgument(
        "no shard elements to merge".to_string(),
      ));
    }

    // Co-labeled records become contiguous, lowest shard first.
    records.sort_by_key(|r| (r.external_label, r.shard_id));

    // Group boundaries: (start, end, unified level).
    let mut groups: Vec<(usize, usize, usize)> = Vec::new();
    let mut start = 0usize;
    while start < records.len() {
      let label = records[start].external_label;
      let mut end = start;
      let mut level = 0usize;
      while end < records.len() && records[end].external_label == label {
        level = level.max(records[end].level);
        end += 1;
      }
      groups.push((start, end, level));
      start = end;
    }

    let unique = groups.len();
    debug!(
      shards = shards.len(),
      records = records.len(),
      unique,
      "merging shard graphs"
    );
    if unique > max_elements {
      return Err(Error::CapacityExceeded { max_elements });
    }

    let idx = Self::new(space, max_elements, m, ef_construction, random_seed, false);

    let mut label_to_id: HashMap<LabelType, TableInt> = HashMap::with_capacity(unique);
    let mut global_max_level = -1i32;
    let mut enterpoint: TableInt = 0;
    for (new_id, &(start, _end, level)) in groups.iter().enumerate() {
      let new_id = new_id as TableInt;
      let first = &records[start];
      label_to_id.insert(first.external_label, new_id);
      let vector = shards[first.shard_id as usize].vector_arc(first.shard_internal)?;
      idx.install_merged_element(new_id, first.external_label, level, vector)?;
      if (level as i32) > global_max_level {
        global_max_level = level as i32;
        enterpoint = new_id;
      }
    }

    let mut rng = StdRng::seed_from_u64(random_seed.wrapping_add(2));
    for (new_id, &(start, end, level)) in groups.iter().enumerate() {
      let new_id = new_id as TableInt;
      for l in 0..=level {
        let mut merged: Vec<TableInt> = Vec::new();
        for rec in &records[start..end] {
          if l > rec.level {
            continue;
          }
          for neighbor_label in &rec.neighbors[l] {
            let id = label_to_id.get(neighbor_label).ok_or_else(|| {
              Error::Integrity("neighbor label missing from the merge set".to_string())
            })?;
            merged.push(*id);
          }
        }
        merge_select_neighbors(&mut rng, &mut merged, idx.level_cap(l));
        idx.write_merged_neighbor_list(new_id, l, &merged)?;
      }
    }

    idx.finish_merged_build(unique, enterpoint, global_max_level);

    debug!(
      elements = unique,
      max_level = global_max_level,
      "merge complete"
    );
    Ok(idx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::space::f32s_as_bytes;
  use crate::L2Space;
  use approx::assert_relative_eq;
  use rand::Rng;

  fn vec2(x: f32, y: f32) -> Vec<u8> {
    f32s_as_bytes(&[x, y]).to_vec()
  }

  fn build_shard(labels: impl Iterator<Item = u64>, points: &[(f32, f32)]) -> HnswIndex<L2Space> {
    let idx = HnswIndex::new(L2Space::new(2), points.len(), 8, 64, 42, false);
    for (label, &(x, y)) in labels.zip(points.iter()) {
      idx.add_point(&vec2(x, y), label).unwrap();
    }
    idx
  }

  #[test]
  fn merge_of_disjoint_shards_unions_all_labels() {
    let n = 500usize;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let points_a: Vec<(f32, f32)> = (0..n)
      .map(|_| (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
      .collect();
    let points_b: Vec<(f32, f32)> = (0..n)
      .map(|_| (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
      .collect();

    let shard_a = build_shard(0..n as u64, &points_a);
    let shard_b = build_shard((0..n as u64).map(|l| l + n as u64), &points_b);

    let merged = HnswIndex::merge_shards(
      L2Space::new(2),
      2 * n,
      8,
      64,
      7,
      &[&shard_a, &shard_b],
    )
    .unwrap();

    assert_eq!(merged.get_current_element_count(), 2 * n);

    // Every original label keeps its vector.
    for (label, &(x, y)) in (0..n as u64).zip(points_a.iter()) {
      let v = merged.get_data_by_label(label).unwrap();
      assert_eq!(v.as_slice(), vec2(x, y).as_slice());
    }
    for (label, &(x, y)) in (0..n as u64).map(|l| l + n as u64).zip(points_b.iter()) {
      let v = merged.get_data_by_label(label).unwrap();
      assert_eq!(v.as_slice(), vec2(x, y).as_slice());
    }

    // Searches succeed and only ever return merged labels.
    merged.set_ef(64);
    for &(x, y) in points_a.iter().take(20) {
      let res = merged.search_knn(&vec2(x, y), 5, None).unwrap();
      assert!(!res.is_empty());
      assert!(res.iter().all(|(l, _)| (*l as usize) < 2 * n));
    }
  }

  #[test]
  fn co_labeled_nodes_take_the_vector_from_the_first_shard() {
    let shard_a = build_shard([1, 2, 3].into_iter(), &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]);
    // Same labels, different coordinates.
    let shard_b = build_shard([1, 2, 3].into_iter(), &[(5.0, 5.0), (6.0, 5.0), (5.0, 6.0)]);

    let merged =
      HnswIndex::merge_shards(L2Space::new(2), 10, 8, 64, 1, &[&shard_a, &shard_b]).unwrap();

    assert_eq!(merged.get_current_element_count(), 3);
    let v = merged.get_data_by_label(1).unwrap();
    assert_eq!(v.as_slice(), vec2(0.0, 0.0).as_slice());
  }

  #[test]
  fn co_labeled_merge_is_searchable_across_both_shards() {
    // Both shards index the same label set, so every unioned edge list joins
    // the two graphs and plain graph search reaches everything.
    let n = 200usize;
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let points: Vec<(f32, f32)> = (0..n)
      .map(|_| (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
      .collect();

    let shard_a = build_shard(0..n as u64, &points);
    let mut shuffled: Vec<usize> = (0..n).collect();
    shuffled.shuffle(&mut rng);
    let shard_b = {
      let idx = HnswIndex::new(L2Space::new(2), n, 8, 64, 43, false);
      for &i in &shuffled {
        let (x, y) = points[i];
        idx.add_point(&vec2(x, y), i as u64).unwrap();
      }
      idx
    };

    let merged =
      HnswIndex::merge_shards(L2Space::new(2), n, 8, 64, 2, &[&shard_a, &shard_b]).unwrap();
    assert_eq!(merged.get_current_element_count(), n);

    merged.set_ef(64);
    for (i, &(x, y)) in points.iter().enumerate() {
      let res = merged.search_knn(&vec2(x, y), 1, None).unwrap();
      assert_eq!(res[0].0, i as u64);
      assert_relative_eq!(res[0].1, 0.0);
    }
  }

  #[test]
  fn merged_neighbor_lists_respect_layer_caps_and_have_no_duplicates() {
    let n = 300usize;
    let mut rng = rand::rngs::StdRng::seed_from_u64(13);
    let points: Vec<(f32, f32)> = (0..n)
      .map(|_| (rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)))
      .collect();

    let shard_a = build_shard(0..n as u64, &points);
    let shard_b = build_shard(0..n as u64, &points);

    let m = 8usize;
    let merged =
      HnswIndex::merge_shards(L2Space::new(2), n, m, 64, 3, &[&shard_a, &shard_b]).unwrap();

    for id in 0..n as TableInt {
      let level = merged.element_level(id);
      for l in 0..=level {
        let labels = merged.neighbor_labels(id, l).unwrap();
        let cap = if l == 0 { 2 * m } else { m };
        assert!(labels.len() <= cap);
        let mut dedup = labels.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), labels.len(), "duplicate edge at level {l}");
        assert!(labels.iter().all(|&nl| nl != merged.get_external_label(id).unwrap()));
      }
    }
  }

  #[test]
  fn merged_entry_point_is_the_first_node_with_the_top_level() {
    let n = 64usize;
    let mut rng = rand::rngs::StdRng::seed_from_u64(17);
    let points: Vec<(f32, f32)> = (0..n)
      .map(|_| (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
      .collect();
    let shard_a = build_shard(0..n as u64, &points);
    let shard_b = build_shard(0..n as u64, &points);

    let merged =
      HnswIndex::merge_shards(L2Space::new(2), n, 8, 64, 5, &[&shard_a, &shard_b]).unwrap();

    let top = (0..n as TableInt)
      .map(|id| merged.element_level(id))
      .max()
      .unwrap();
    let first_with_top = (0..n as TableInt)
      .find(|&id| merged.element_level(id) == top)
      .unwrap();
    assert_eq!(merged.entry_point(), Some(first_with_top));
  }

  #[test]
  fn merging_nothing_is_an_error() {
    let err = HnswIndex::merge_shards(L2Space::new(2), 10, 8, 64, 1, &[]).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let empty = HnswIndex::new(L2Space::new(2), 10, 8, 64, 1, false);
    let err =
      HnswIndex::merge_shards(L2Space::new(2), 10, 8, 64, 1, &[&empty]).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
  }

  #[test]
  fn merge_overflowing_capacity_is_rejected() {
    let shard_a = build_shard([1, 2].into_iter(), &[(0.0, 0.0), (1.0, 0.0)]);
    let shard_b = build_shard([3, 4].into_iter(), &[(2.0, 0.0), (3.0, 0.0)]);
    let err =
      HnswIndex::merge_shards(L2Space::new(2), 3, 8, 64, 1, &[&shard_a, &shard_b]).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { max_elements: 3 }));
  }
}
