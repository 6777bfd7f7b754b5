use crate::error::Error;
use crate::error::Result;
use crate::space::label_allowed;
use crate::space::sq8_clip_max;
use crate::space::sq8_encode;
use crate::space::Int8InnerProductSpace;
use crate::visited::VisitedListPool;
use crate::LabelType;
use crate::SearchStopCondition;
use crate::Space;
use crate::TableInt;
use ahash::HashMap;
use ahash::HashMapExt;
use ahash::HashSet;
use ahash::HashSetExt;
use arc_swap::ArcSwapOption;
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::cmp::max;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::warn;

// Flag bits live in the high 16 bits of the packed header word; the degree in
// the low 16 bits.
const DELETE_MARK: u32 = 0x01 << 16;
const MAX_LABEL_OPERATION_LOCKS: usize = 65_536;
const DEFAULT_RANDOM_SEED: u64 = 100;

fn linklist_count(header: u32) -> usize {
  (header & 0xffff) as usize
}

fn set_linklist_count(header: &mut u32, count: usize) {
  let count: u32 = count.try_into().expect("count overflow");
  *header = (*header & 0xffff_0000) | (count & 0xffff);
}

#[derive(Clone, Copy)]
struct LinkList<'a> {
  data: &'a [AtomicU32],
  len: usize,
}

impl LinkList<'_> {
  fn len(&self) -> usize {
    self.len
  }
}

struct LinkListIter<'a> {
  data: &'a [AtomicU32],
  idx: usize,
  end: usize,
}

impl Iterator for LinkListIter<'_> {
  type Item = TableInt;

  fn next(&mut self) -> Option<Self::Item> {
    if self.idx >= self.end {
      return None;
    }
    let id = self.data[self.idx].load(Ordering::Relaxed);
    self.idx += 1;
    Some(id)
  }
}

impl<'a> IntoIterator for LinkList<'a> {
  type Item = TableInt;
  type IntoIter = LinkListIter<'a>;

  fn into_iter(self) -> Self::IntoIter {
    LinkListIter {
      data: self.data,
      idx: 0,
      end: self.len,
    }
  }
}

fn consume<const N: usize>(rd: &mut &[u8]) -> Result<[u8; N]> {
  if rd.len() < N {
    return Err(Error::CorruptSnapshot("unexpected EOF".to_string()));
  }
  let (bytes, rest) = rd.split_at(N);
  *rd = rest;
  Ok(bytes.try_into().unwrap())
}

fn consume_u64(rd: &mut &[u8]) -> Result<u64> {
  Ok(u64::from_le_bytes(consume::<8>(rd)?))
}

fn consume_u32(rd: &mut &[u8]) -> Result<u32> {
  Ok(u32::from_le_bytes(consume::<4>(rd)?))
}

fn consume_i32(rd: &mut &[u8]) -> Result<i32> {
  Ok(i32::from_le_bytes(consume::<4>(rd)?))
}

fn consume_f64(rd: &mut &[u8]) -> Result<f64> {
  Ok(f64::from_le_bytes(consume::<8>(rd)?))
}

fn consume_bytes<'a>(rd: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
  if rd.len() < n {
    return Err(Error::CorruptSnapshot("unexpected EOF".to_string()));
  }
  let (bytes, rest) = rd.split_at(n);
  *rd = rest;
  Ok(bytes)
}

#[derive(Debug)]
pub struct HnswIndex<S: Space> {
  space: S,

  max_elements: usize,

  m: usize,
  max_m: usize,
  max_m0: usize,
  ef_construction: usize,

  mult: f64,

  allow_replace_deleted: bool,

  visited_list_pool: VisitedListPool,

  /// Prevents snapshots / resize / quantization from racing concurrent
  /// mutations.
  mutation_lock: RwLock<()>,

  /// Locks operations with element by label value (hashed).
  label_op_locks: Vec<Mutex<()>>,

  /// Protects `enter_point_node` and `max_level` updates.
  global: Mutex<()>,

  /// Protects link list updates per internal id.
  link_list_locks: Vec<Mutex<()>>,

  label_lookup: Mutex<HashMap<LabelType, TableInt>>,

  deleted_elements: Mutex<HashSet<TableInt>>,

  cur_element_count: AtomicUsize,
  num_deleted: AtomicUsize,

  ef: AtomicUsize,
  max_level: AtomicI32,
  /// `TableInt::MAX` means empty.
  enter_point_node: AtomicU32,

  metric_hops: AtomicU64,
  metric_distance_computations: AtomicU64,

  labels: Vec<AtomicU64>,
  vectors: Vec<ArcSwapOption<Vec<u8>>>,

  // Base layer: per element, [header, neighbors...max_m0]
  level0_links: Vec<AtomicU32>,
  // Upper layers: per element, if level > 0, [ [header, neighbors...max_m] * level ]
  link_lists: Vec<OnceLock<Box<[AtomicU32]>>>,
  element_levels: Vec<AtomicI32>,

  level_rng: Mutex<StdRng>,
  update_probability_rng: Mutex<StdRng>,
}

impl<S: Space> HnswIndex<S> {
  pub fn new(
    space: S,
    max_elements: usize,
    m: usize,
    ef_construction: usize,
    random_seed: u64,
    allow_replace_deleted: bool,
  ) -> Self {
    assert!(max_elements <= TableInt::MAX as usize);
    assert!(space.data_size() > 0, "data size must be > 0");
    assert!(m >= 2, "M must be >= 2");

    let m = if m <= 10000 {
      m
    } else {
      warn!("M parameter exceeds 10000; capping to 10000");
      10000
    };

    let max_m = m;
    let max_m0 = m * 2;
    let ef_construction = ef_construction.max(m);

    let level0_words_per_element = 1 + max_m0;
    let level0_total_words = max_elements * level0_words_per_element;

    // Level-distribution constant. Deliberately independent of M.
    let mult = 1.0 / f64::ln(4.0);

    let mut label_op_locks = Vec::with_capacity(MAX_LABEL_OPERATION_LOCKS);
    for _ in 0..MAX_LABEL_OPERATION_LOCKS {
      label_op_locks.push(Mutex::new(()));
    }

    let mut link_list_locks = Vec::with_capacity(max_elements);
    for _ in 0..max_elements {
      link_list_locks.push(Mutex::new(()));
    }

    let mut labels = Vec::with_capacity(max_elements);
    labels.resize_with(max_elements, || AtomicU64::new(0));

    let mut vectors = Vec::with_capacity(max_elements);
    vectors.resize_with(max_elements, ArcSwapOption::empty);

    let mut level0_links = Vec::with_capacity(level0_total_words);
    level0_links.resize_with(level0_total_words, || AtomicU32::new(0));

    let mut link_lists = Vec::with_capacity(max_elements);
    link_lists.resize_with(max_elements, OnceLock::new);

    let mut element_levels = Vec::with_capacity(max_elements);
    element_levels.resize_with(max_elements, || AtomicI32::new(0));

    Self {
      space,
      max_elements,
      m,
      max_m,
      max_m0,
      ef_construction,
      mult,
      allow_replace_deleted,
      visited_list_pool: VisitedListPool::new(1, max_elements),
      mutation_lock: RwLock::new(()),
      label_op_locks,
      global: Mutex::new(()),
      link_list_locks,
      label_lookup: Mutex::new(HashMap::new()),
      deleted_elements: Mutex::new(HashSet::new()),
      cur_element_count: AtomicUsize::new(0),
      num_deleted: AtomicUsize::new(0),
      ef: AtomicUsize::new(10),
      max_level: AtomicI32::new(-1),
      enter_point_node: AtomicU32::new(TableInt::MAX),
      metric_hops: AtomicU64::new(0),
      metric_distance_computations: AtomicU64::new(0),
      labels,
      vectors,
      level0_links,
      link_lists,
      element_levels,
      level_rng: Mutex::new(StdRng::seed_from_u64(random_seed)),
      update_probability_rng: Mutex::new(StdRng::seed_from_u64(random_seed.wrapping_add(1))),
    }
  }

  pub fn space(&self) -> &S {
    &self.space
  }

  pub fn set_ef(&self, ef: usize) {
    self.ef.store(ef.max(1), Ordering::Release);
  }

  pub fn get_max_elements(&self) -> usize {
    self.max_elements
  }

  pub fn get_current_element_count(&self) -> usize {
    self.cur_element_count.load(Ordering::Acquire)
  }

  pub fn get_deleted_count(&self) -> usize {
    self.num_deleted.load(Ordering::Acquire)
  }

  pub fn metric_hops(&self) -> u64 {
    self.metric_hops.load(Ordering::Relaxed)
  }

  pub fn metric_distance_computations(&self) -> u64 {
    self.metric_distance_computations.load(Ordering::Relaxed)
  }

  pub fn reset_metrics(&self) {
    self.metric_hops.store(0, Ordering::Relaxed);
    self.metric_distance_computations.store(0, Ordering::Relaxed);
  }

  fn enter_point_node(&self) -> Option<TableInt> {
    let raw = self.enter_point_node.load(Ordering::Acquire);
    if raw == TableInt::MAX {
      None
    } else {
      Some(raw)
    }
  }

  fn label_op_lock(&self, label: LabelType) -> &Mutex<()> {
    let lock_id = (label as usize) & (MAX_LABEL_OPERATION_LOCKS - 1);
    &self.label_op_locks[lock_id]
  }

  fn level0_block(&self, internal_id: TableInt) -> Result<&[AtomicU32]> {
    let words = 1 + self.max_m0;
    let start = internal_id as usize * words;
    let end = start + words;
    if end > self.level0_links.len() {
      return Err(Error::Integrity("internal id out of bounds".to_string()));
    }
    Ok(&self.level0_links[start..end])
  }

  fn upper_block(&self, internal_id: TableInt, level: usize) -> Result<&[AtomicU32]> {
    debug_assert!(level > 0);
    let Some(raw) = self
      .link_lists
      .get(internal_id as usize)
      .and_then(|c| c.get())
    else {
      return Err(Error::Integrity("missing link list block".to_string()));
    };
    let words_per_level = 1 + self.max_m;
    let start = (level - 1) * words_per_level;
    let end = start + words_per_level;
    if end > raw.len() {
      return Err(Error::Integrity("link list level out of bounds".to_string()));
    }
    Ok(&raw[start..end])
  }

  fn block_at_level(&self, internal_id: TableInt, level: usize) -> Result<&[AtomicU32]> {
    if level == 0 {
      self.level0_block(internal_id)
    } else {
      self.upper_block(internal_id, level)
    }
  }

  fn linklist_at_level(&self, internal_id: TableInt, level: usize) -> Result<LinkList<'_>> {
    let block = self.block_at_level(internal_id, level)?;
    let header = block[0].load(Ordering::Acquire);
    let cnt = linklist_count(header);
    let cap = if level == 0 { self.max_m0 } else { self.max_m };
    if cnt > cap {
      return Err(Error::Integrity("link list over capacity".to_string()));
    }
    Ok(LinkList {
      data: &block[1..],
      len: cnt,
    })
  }

  fn set_linklist_count_atomic(&self, header: &AtomicU32, count: usize) -> Result<()> {
    if count > u16::MAX as usize {
      return Err(Error::Integrity("link list count exceeds 16 bits".to_string()));
    }
    let mut old = header.load(Ordering::Relaxed);
    loop {
      let mut new = old;
      set_linklist_count(&mut new, count);
      match header.compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed) {
        Ok(_) => return Ok(()),
        Err(actual) => old = actual,
      }
    }
  }

  fn is_marked_deleted_internal(&self, internal_id: TableInt) -> bool {
    let Ok(block) = self.level0_block(internal_id) else {
      return false;
    };
    let header = block[0].load(Ordering::Acquire);
    (header & DELETE_MARK) != 0
  }

  fn mark_deleted_internal(&self, internal_id: TableInt, label: LabelType) -> Result<()> {
    if internal_id as usize >= self.get_current_element_count() {
      return Err(Error::Integrity("internal id out of bounds".to_string()));
    }
    let header = self.level0_block(internal_id)?[0].fetch_or(DELETE_MARK, Ordering::AcqRel);
    if (header & DELETE_MARK) != 0 {
      return Err(Error::AlreadyDeleted(label));
    }
    self.num_deleted.fetch_add(1, Ordering::AcqRel);
    if self.allow_replace_deleted {
      self.deleted_elements.lock().insert(internal_id);
    }
    Ok(())
  }

  fn unmark_deleted_internal(&self, internal_id: TableInt, label: LabelType) -> Result<()> {
    if internal_id as usize >= self.get_current_element_count() {
      return Err(Error::Integrity("internal id out of bounds".to_string()));
    }
    let header = self.level0_block(internal_id)?[0].fetch_and(!DELETE_MARK, Ordering::AcqRel);
    if (header & DELETE_MARK) == 0 {
      return Err(Error::NotDeleted(label));
    }
    self.num_deleted.fetch_sub(1, Ordering::AcqRel);
    if self.allow_replace_deleted {
      self.deleted_elements.lock().remove(&internal_id);
    }
    Ok(())
  }

  pub fn mark_delete(&self, label: LabelType) -> Result<()> {
    let _mutation_guard = self.mutation_lock.read();
    let _label_lock = self.label_op_lock(label).lock();
    let internal_id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    self.mark_deleted_internal(internal_id, label)
  }

  pub fn unmark_delete(&self, label: LabelType) -> Result<()> {
    let _mutation_guard = self.mutation_lock.read();
    let _label_lock = self.label_op_lock(label).lock();
    let internal_id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    self.unmark_deleted_internal(internal_id, label)
  }

  pub fn get_external_label(&self, internal_id: TableInt) -> Result<LabelType> {
    if internal_id as usize >= self.get_current_element_count() {
      return Err(Error::Integrity("internal id out of bounds".to_string()));
    }
    Ok(self.labels[internal_id as usize].load(Ordering::Acquire))
  }

  pub fn get_data_by_label(&self, label: LabelType) -> Result<Arc<Vec<u8>>> {
    let internal_id = self
      .label_lookup
      .lock()
      .get(&label)
      .copied()
      .ok_or(Error::LabelNotFound(label))?;
    if self.is_marked_deleted_internal(internal_id) {
      return Err(Error::LabelNotFound(label));
    }
    self
      .vectors
      .get(internal_id as usize)
      .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))?
      .load_full()
      .ok_or_else(|| Error::Integrity("missing vector".to_string()))
  }

  fn get_random_level(&self) -> i32 {
    let mut u: f64 = self.level_rng.lock().gen();
    if u == 0.0 {
      u = f64::MIN_POSITIVE;
    }
    let r = -u.ln() * self.mult;
    r as i32
  }

  fn vector_guard(
    &self,
    internal_id: TableInt,
  ) -> Result<arc_swap::Guard<Option<Arc<Vec<u8>>>>> {
    self
      .vectors
      .get(internal_id as usize)
      .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))
      .map(|v| v.load())
  }

  fn distance_between_internal(&self, a: TableInt, b: TableInt) -> Result<f32> {
    let va = self.vector_guard(a)?;
    let va = va
      .as_ref()
      .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
    let vb = self.vector_guard(b)?;
    let vb = vb
      .as_ref()
      .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
    Ok(self.space.distance(va.as_slice(), vb.as_slice()))
  }

  fn distance_query_to_internal(&self, query: &[u8], internal_id: TableInt) -> Result<f32> {
    let v = self.vector_guard(internal_id)?;
    let v = v
      .as_ref()
      .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
    Ok(self.space.distance(query, v.as_slice()))
  }

  // Diversity-preserving pruning: walk candidates closest-first, keep one only
  // if it is closer to the query than to everything already kept.
  fn get_neighbors_by_heuristic2(
    &self,
    top_candidates: &mut BinaryHeap<(OrderedFloat<f32>, TableInt)>,
    m: usize,
  ) -> Result<()> {
    if top_candidates.len() < m {
      return Ok(());
    }

    let mut queue_closest: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
    while let Some((dist, id)) = top_candidates.pop() {
      queue_closest.push((OrderedFloat(-dist.0), id));
    }

    let mut return_list: Vec<(OrderedFloat<f32>, TableInt)> = Vec::with_capacity(m);
    while let Some((neg_dist_to_query, cur_id)) = queue_closest.pop() {
      if return_list.len() >= m {
        break;
      }
      let dist_to_query = -neg_dist_to_query.0;

      let mut good = true;
      for &(_, selected_id) in &return_list {
        let cur_dist = self.distance_between_internal(selected_id, cur_id)?;
        if cur_dist < dist_to_query {
          good = false;
          break;
        }
      }

      if good {
        return_list.push((neg_dist_to_query, cur_id));
      }
    }

    for (neg_dist, id) in return_list {
      top_candidates.push((OrderedFloat(-neg_dist.0), id));
    }
    Ok(())
  }

  // Beam search over one layer during construction. Deleted nodes stay
  // traversable but never enter the result heap.
  fn search_base_layer(
    &self,
    ep_id: TableInt,
    data_point: &[u8],
    layer: usize,
  ) -> Result<BinaryHeap<(OrderedFloat<f32>, TableInt)>> {
    let mut visited = self.visited_list_pool.get();
    let visited_tag = visited.tag;
    let visited_cells = visited.cells_mut();

    let mut top_candidates: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
    let mut candidate_set: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();

    let mut lower_bound;
    if !self.is_marked_deleted_internal(ep_id) {
      let dist = self.distance_query_to_internal(data_point, ep_id)?;
      top_candidates.push((OrderedFloat(dist), ep_id));
      lower_bound = dist;
      candidate_set.push((OrderedFloat(-dist), ep_id));
    } else {
      lower_bound = f32::INFINITY;
      candidate_set.push((OrderedFloat(-lower_bound), ep_id));
    }
    visited_cells[ep_id as usize] = visited_tag;

    while let Some((neg_dist, cur_node)) = candidate_set.pop() {
      let cur_dist = -neg_dist.0;
      if cur_dist > lower_bound && top_candidates.len() == self.ef_construction {
        break;
      }

      let _lock = self.link_list_locks[cur_node as usize].lock();
      for candidate_id in self.linklist_at_level(cur_node, layer)? {
        if visited_cells[candidate_id as usize] == visited_tag {
          continue;
        }
        visited_cells[candidate_id as usize] = visited_tag;

        let dist1 = self.distance_query_to_internal(data_point, candidate_id)?;
        if top_candidates.len() < self.ef_construction || lower_bound > dist1 {
          candidate_set.push((OrderedFloat(-dist1), candidate_id));
          if !self.is_marked_deleted_internal(candidate_id) {
            top_candidates.push((OrderedFloat(dist1), candidate_id));
          }
          if top_candidates.len() > self.ef_construction {
            top_candidates.pop();
          }
          if let Some((worst, _)) = top_candidates.peek() {
            lower_bound = worst.0;
          }
        }
      }
    }

    Ok(top_candidates)
  }

  // Installs `cur_c`'s neighbor list at `level` from the candidate heap, then
  // publishes reciprocal edges. Returns the closest selected neighbor, the
  // entry point for the next lower layer.
  fn mutually_connect_new_element(
    &self,
    cur_c: TableInt,
    top_candidates: &mut BinaryHeap<(OrderedFloat<f32>, TableInt)>,
    level: usize,
    is_update: bool,
  ) -> Result<TableInt> {
    self.get_neighbors_by_heuristic2(top_candidates, self.m)?;
    if top_candidates.len() > self.m {
      return Err(Error::Integrity(
        "heuristic returned more than M candidates".to_string(),
      ));
    }

    let mut selected_neighbors: Vec<TableInt> = Vec::with_capacity(self.m);
    while let Some((_dist, id)) = top_candidates.pop() {
      selected_neighbors.push(id);
    }

    let next_closest_entry_point = *selected_neighbors
      .last()
      .ok_or_else(|| Error::Integrity("empty selected neighbor list".to_string()))?;

    for &neighbor in &selected_neighbors {
      if level > self.element_levels[neighbor as usize].load(Ordering::Acquire) as usize {
        return Err(Error::Integrity(
          "link on a level the neighbor does not have".to_string(),
        ));
      }
    }

    {
      let _cur_lock = self.link_list_locks[cur_c as usize].lock();
      let block = self.block_at_level(cur_c, level)?;
      let header = block[0].load(Ordering::Acquire);
      if linklist_count(header) != 0 && !is_update {
        return Err(Error::Integrity(
          "newly inserted element must have a blank link list".to_string(),
        ));
      }
      for (idx, &neighbor) in selected_neighbors.iter().enumerate() {
        block[1 + idx].store(neighbor, Ordering::Relaxed);
      }
      self.set_linklist_count_atomic(&block[0], selected_neighbors.len())?;
    }

    self.connect_backlinks(cur_c, &selected_neighbors, level, is_update)?;

    Ok(next_closest_entry_point)
  }

  fn connect_backlinks(
    &self,
    cur_c: TableInt,
    selected_neighbors: &[TableInt],
    level: usize,
    is_update: bool,
  ) -> Result<()> {
    let mcurmax = if level > 0 { self.max_m } else { self.max_m0 };

    for &neighbor in selected_neighbors {
      if neighbor == cur_c {
        return Err(Error::Integrity(
          "attempted to connect an element to itself".to_string(),
        ));
      }
      if level > self.element_levels[neighbor as usize].load(Ordering::Acquire) as usize {
        return Err(Error::Integrity(
          "link on a level the neighbor does not have".to_string(),
        ));
      }

      let _lock = self.link_list_locks[neighbor as usize].lock();
      let existing = self.linklist_at_level(neighbor, level)?;
      let sz_link_list_other = existing.len();
      let is_cur_c_present = is_update && existing.into_iter().any(|id| id == cur_c);
      if sz_link_list_other > mcurmax {
        return Err(Error::Integrity("neighbor list over capacity".to_string()));
      }

      if is_cur_c_present {
        continue;
      }

      if sz_link_list_other < mcurmax {
        // Free slot: append.
        let block = self.block_at_level(neighbor, level)?;
        block[1 + sz_link_list_other].store(cur_c, Ordering::Relaxed);
        self.set_linklist_count_atomic(&block[0], sz_link_list_other + 1)?;
        continue;
      }

      // Full: re-run the heuristic over current neighbors plus the newcomer.
      let existing = existing.into_iter().collect::<Vec<_>>();
      let d_max = self.distance_between_internal(cur_c, neighbor)?;
      let mut candidates: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
      candidates.push((OrderedFloat(d_max), cur_c));

      for existing in existing {
        let dist = self.distance_between_internal(existing, neighbor)?;
        candidates.push((OrderedFloat(dist), existing));
      }

      self.get_neighbors_by_heuristic2(&mut candidates, mcurmax)?;

      let mut new_neighbors: Vec<TableInt> = Vec::with_capacity(candidates.len());
      while let Some((_dist, id)) = candidates.pop() {
        new_neighbors.push(id);
      }

      let block = self.block_at_level(neighbor, level)?;
      for (idx, &id) in new_neighbors.iter().enumerate() {
        block[1 + idx].store(id, Ordering::Relaxed);
      }
      self.set_linklist_count_atomic(&block[0], new_neighbors.len())?;
    }

    Ok(())
  }

  fn get_connections_with_lock(
    &self,
    internal_id: TableInt,
    level: usize,
  ) -> Result<Vec<TableInt>> {
    let _lock = self.link_list_locks[internal_id as usize].lock();
    Ok(
      self
        .linklist_at_level(internal_id, level)?
        .into_iter()
        .collect(),
    )
  }

  fn repair_connections_for_update(
    &self,
    data_point: &[u8],
    entry_point_internal_id: TableInt,
    data_point_internal_id: TableInt,
    data_point_level: usize,
    max_level: usize,
  ) -> Result<()> {
    let mut curr_obj = entry_point_internal_id;
    if data_point_level < max_level {
      let mut curdist = self.distance_query_to_internal(data_point, curr_obj)?;
      for level in (data_point_level + 1..=max_level).rev() {
        let mut changed = true;
        while changed {
          changed = false;
          let _lock = self.link_list_locks[curr_obj as usize].lock();
          for cand in self.linklist_at_level(curr_obj, level)? {
            let d = self.distance_query_to_internal(data_point, cand)?;
            if d < curdist {
              curdist = d;
              curr_obj = cand;
              changed = true;
            }
          }
        }
      }
    }

    if data_point_level > max_level {
      return Err(Error::Integrity(
        "updated element level above index max level".to_string(),
      ));
    }

    for level in (0..=data_point_level).rev() {
      let mut top_candidates = self.search_base_layer(curr_obj, data_point, level)?;
      let mut filtered: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
      while let Some(cand) = top_candidates.pop() {
        if cand.1 != data_point_internal_id {
          filtered.push(cand);
        }
      }

      if filtered.is_empty() {
        continue;
      }

      if self.is_marked_deleted_internal(entry_point_internal_id) {
        let dist = self.distance_query_to_internal(data_point, entry_point_internal_id)?;
        filtered.push((OrderedFloat(dist), entry_point_internal_id));
        if filtered.len() > self.ef_construction {
          filtered.pop();
        }
      }

      curr_obj =
        self.mutually_connect_new_element(data_point_internal_id, &mut filtered, level, true)?;
    }

    Ok(())
  }

  fn update_point(
    &self,
    data_point: &[u8],
    internal_id: TableInt,
    update_neighbor_probability: f32,
  ) -> Result<()> {
    self
      .vectors
      .get(internal_id as usize)
      .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))?
      .store(Some(Arc::new(data_point.to_vec())));

    let max_level_copy = self.max_level.load(Ordering::Acquire);
    let entry_point_copy = self.enter_point_node();
    if entry_point_copy == Some(internal_id) && self.get_current_element_count() == 1 {
      return Ok(());
    }

    let entry_point_copy = entry_point_copy.ok_or(Error::EmptyIndex)?;
    let elem_level = self.element_levels[internal_id as usize].load(Ordering::Acquire);
    if elem_level < 0 {
      return Err(Error::Integrity("negative element level".to_string()));
    }
    let elem_level = elem_level as usize;

    for layer in 0..=elem_level {
      let mut s_cand: HashSet<TableInt> = HashSet::new();
      let mut s_neigh: HashSet<TableInt> = HashSet::new();

      let list_one_hop = self.get_connections_with_lock(internal_id, layer)?;
      if list_one_hop.is_empty() {
        continue;
      }

      s_cand.insert(internal_id);

      let update_decisions: Vec<f32> = {
        let mut rng = self.update_probability_rng.lock();
        (0..list_one_hop.len()).map(|_| rng.gen::<f32>()).collect()
      };

      for (el_one_hop, decision) in list_one_hop.into_iter().zip(update_decisions) {
        s_cand.insert(el_one_hop);

        if decision > update_neighbor_probability {
          continue;
        }

        s_neigh.insert(el_one_hop);

        let list_two_hop = self.get_connections_with_lock(el_one_hop, layer)?;
        for el_two_hop in list_two_hop {
          s_cand.insert(el_two_hop);
        }
      }

      for neigh in s_neigh {
        let size = if s_cand.contains(&neigh) {
          s_cand.len().saturating_sub(1)
        } else {
          s_cand.len()
        };
        if size == 0 {
          continue;
        }

        let elements_to_keep = self.ef_construction.min(size);
        let mut candidates: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();

        for cand in s_cand.iter().copied() {
          if cand == neigh {
            continue;
          }
          let dist = self.distance_between_internal(neigh, cand)?;
          if candidates.len() < elements_to_keep {
            candidates.push((OrderedFloat(dist), cand));
          } else if dist < candidates.peek().unwrap().0 .0 {
            candidates.pop();
            candidates.push((OrderedFloat(dist), cand));
          }
        }

        let cap = if layer == 0 { self.max_m0 } else { self.max_m };
        self.get_neighbors_by_heuristic2(&mut candidates, cap)?;

        let _lock = self.link_list_locks[neigh as usize].lock();
        let block = self.block_at_level(neigh, layer)?;

        let cand_size = candidates.len();
        for idx in 0..cand_size {
          block[1 + idx].store(candidates.pop().unwrap().1, Ordering::Relaxed);
        }
        self.set_linklist_count_atomic(&block[0], cand_size)?;
      }
    }

    self.repair_connections_for_update(
      data_point,
      entry_point_copy,
      internal_id,
      elem_level,
      max_level_copy.max(0) as usize,
    )?;

    Ok(())
  }

  // Core insertion. Caller holds the label-op lock and the mutation read
  // guard.
  fn add_point_internal(
    &self,
    data_point: &[u8],
    label: LabelType,
    forced_level: Option<i32>,
  ) -> Result<TableInt> {
    let cur_c: TableInt;
    {
      let mut label_lookup = self.label_lookup.lock();
      if let Some(&existing) = label_lookup.get(&label) {
        if self.allow_replace_deleted && self.is_marked_deleted_internal(existing) {
          return Err(Error::InvalidArgument(
            "cannot update a deleted element while replacement of deleted elements is enabled"
              .to_string(),
          ));
        }
        drop(label_lookup);
        if self.is_marked_deleted_internal(existing) {
          self.unmark_deleted_internal(existing, label)?;
        }
        self.update_point(data_point, existing, 1.0)?;
        return Ok(existing);
      }

      let cur_count = self.cur_element_count.load(Ordering::Acquire);
      if cur_count >= self.max_elements {
        return Err(Error::CapacityExceeded {
          max_elements: self.max_elements,
        });
      }
      cur_c = cur_count as TableInt;
      self
        .cur_element_count
        .store(cur_count + 1, Ordering::Release);
      label_lookup.insert(label, cur_c);
    }

    let curlevel = forced_level.unwrap_or_else(|| self.get_random_level());
    self.element_levels[cur_c as usize].store(curlevel, Ordering::Release);

    // Fresh slot: scrub any stale words (slots are recycled after a reload).
    for word in self.level0_block(cur_c)? {
      word.store(0, Ordering::Relaxed);
    }

    self.labels[cur_c as usize].store(label, Ordering::Release);
    self
      .vectors
      .get(cur_c as usize)
      .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))?
      .store(Some(Arc::new(data_point.to_vec())));

    if curlevel > 0 {
      let words = (curlevel as usize) * (1 + self.max_m);
      let mut raw = Vec::with_capacity(words);
      raw.resize_with(words, || AtomicU32::new(0));
      self
        .link_lists
        .get(cur_c as usize)
        .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))?
        .set(raw.into_boxed_slice())
        .map_err(|_| Error::Integrity("link list block already initialized".to_string()))?;
    }

    // The global lock is only needed when this node may become the new entry
    // point.
    let mut templock = Some(self.global.lock());
    let maxlevelcopy = self.max_level.load(Ordering::Acquire);
    if curlevel <= maxlevelcopy {
      drop(templock.take());
    }

    let Some(enterpoint_copy) = self.enter_point_node() else {
      // First element.
      self.enter_point_node.store(cur_c, Ordering::Release);
      self.max_level.store(curlevel, Ordering::Release);
      return Ok(cur_c);
    };

    let mut curr_obj = enterpoint_copy;

    if maxlevelcopy >= 0 && curlevel < maxlevelcopy {
      // Greedy descent through the layers above the new node's top.
      let mut curdist = self.distance_query_to_internal(data_point, enterpoint_copy)?;
      for level in ((curlevel + 1) as usize..=maxlevelcopy as usize).rev() {
        let mut changed = true;
        while changed {
          changed = false;
          let _lock = self.link_list_locks[curr_obj as usize].lock();
          for cand in self.linklist_at_level(curr_obj, level)? {
            let d = self.distance_query_to_internal(data_point, cand)?;
            if d < curdist {
              curdist = d;
              curr_obj = cand;
              changed = true;
            }
          }
        }
      }
    }

    let ep_deleted = self.is_marked_deleted_internal(enterpoint_copy);
    let max_conn_level = usize::min(curlevel.max(0) as usize, maxlevelcopy.max(0) as usize);

    for level in (0..=max_conn_level).rev() {
      let mut top_candidates = self.search_base_layer(curr_obj, data_point, level)?;
      if ep_deleted {
        // A deleted entry point stays reachable: force it into the candidate
        // set so the graph does not split from it.
        let dist = self.distance_query_to_internal(data_point, enterpoint_copy)?;
        top_candidates.push((OrderedFloat(dist), enterpoint_copy));
        if top_candidates.len() > self.ef_construction {
          top_candidates.pop();
        }
      }

      curr_obj = self.mutually_connect_new_element(cur_c, &mut top_candidates, level, false)?;
    }

    if curlevel > maxlevelcopy {
      debug_assert!(templock.is_some());
      self.enter_point_node.store(cur_c, Ordering::Release);
      self.max_level.store(curlevel, Ordering::Release);
    }

    Ok(cur_c)
  }

  pub fn add_point(&self, data_point: &[u8], label: LabelType) -> Result<TableInt> {
    self.add_point_at_level(data_point, label, None)
  }

  /// Insert with a caller-chosen top level instead of a sampled one.
  pub fn add_point_at_level(
    &self,
    data_point: &[u8],
    label: LabelType,
    level: Option<i32>,
  ) -> Result<TableInt> {
    if data_point.len() != self.space.data_size() {
      return Err(Error::DimensionMismatch {
        expected: self.space.data_size(),
        actual: data_point.len(),
      });
    }
    if level.is_some_and(|l| l < 0) {
      return Err(Error::InvalidArgument("level must be >= 0".to_string()));
    }
    let _mutation_guard = self.mutation_lock.read();
    let _label_lock = self.label_op_lock(label).lock();
    self.add_point_internal(data_point, label, level)
  }

  /// Insert, reusing an arbitrary soft-deleted slot when one exists.
  pub fn add_point_replace_deleted(
    &self,
    data_point: &[u8],
    label: LabelType,
  ) -> Result<TableInt> {
    if !self.allow_replace_deleted {
      return Err(Error::InvalidArgument(
        "replacement of deleted elements is disabled in constructor".to_string(),
      ));
    }
    if data_point.len() != self.space.data_size() {
      return Err(Error::DimensionMismatch {
        expected: self.space.data_size(),
        actual: data_point.len(),
      });
    }

    let _mutation_guard = self.mutation_lock.read();
    let _label_lock = self.label_op_lock(label).lock();

    {
      let label_lookup = self.label_lookup.lock();
      if label_lookup.contains_key(&label) {
        drop(label_lookup);
        return self.add_point_internal(data_point, label, None);
      }
    }

    let internal_id_replaced = {
      let mut deleted = self.deleted_elements.lock();
      deleted.iter().next().copied().map(|id| {
        deleted.remove(&id);
        id
      })
    };

    let Some(internal_id_replaced) = internal_id_replaced else {
      return self.add_point_internal(data_point, label, None);
    };

    let label_replaced = self.get_external_label(internal_id_replaced)?;
    self.labels[internal_id_replaced as usize].store(label, Ordering::Release);

    {
      let mut label_lookup = self.label_lookup.lock();
      label_lookup.remove(&label_replaced);
      label_lookup.insert(label, internal_id_replaced);
    }

    self.unmark_deleted_internal(internal_id_replaced, label)?;
    self.update_point(data_point, internal_id_replaced, 1.0)?;

    Ok(internal_id_replaced)
  }

  fn search_base_layer_st<const BARE_BONE: bool>(
    &self,
    ep_id: TableInt,
    query: &[u8],
    ef: usize,
    filter: Option<&dyn Fn(LabelType) -> bool>,
  ) -> Result<BinaryHeap<(OrderedFloat<f32>, TableInt)>> {
    let mut visited = self.visited_list_pool.get();
    let visited_tag = visited.tag;
    let visited_cells = visited.cells_mut();

    let mut top_candidates: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
    let mut candidate_set: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();

    let mut lower_bound;
    let ep_label = self.get_external_label(ep_id)?;
    if BARE_BONE || (!self.is_marked_deleted_internal(ep_id) && label_allowed(filter, ep_label)) {
      let dist = self.distance_query_to_internal(query, ep_id)?;
      lower_bound = dist;
      top_candidates.push((OrderedFloat(dist), ep_id));
      candidate_set.push((OrderedFloat(-dist), ep_id));
    } else {
      lower_bound = f32::INFINITY;
      candidate_set.push((OrderedFloat(-lower_bound), ep_id));
    }

    visited_cells[ep_id as usize] = visited_tag;

    while let Some((neg_dist, current_node_id)) = candidate_set.pop() {
      let candidate_dist = -neg_dist.0;

      let flag_stop_search = if BARE_BONE {
        candidate_dist > lower_bound
      } else {
        candidate_dist > lower_bound && top_candidates.len() == ef
      };
      if flag_stop_search {
        break;
      }

      let ll = self.linklist_at_level(current_node_id, 0)?;
      self.metric_hops.fetch_add(1, Ordering::Relaxed);
      self
        .metric_distance_computations
        .fetch_add(ll.len() as u64, Ordering::Relaxed);

      for candidate_id in ll {
        if visited_cells[candidate_id as usize] == visited_tag {
          continue;
        }
        visited_cells[candidate_id as usize] = visited_tag;

        let dist = self.distance_query_to_internal(query, candidate_id)?;
        let flag_consider_candidate = top_candidates.len() < ef || lower_bound > dist;
        if !flag_consider_candidate {
          continue;
        }

        candidate_set.push((OrderedFloat(-dist), candidate_id));

        if BARE_BONE {
          top_candidates.push((OrderedFloat(dist), candidate_id));
        } else {
          let cand_label = self.get_external_label(candidate_id)?;
          if !self.is_marked_deleted_internal(candidate_id) && label_allowed(filter, cand_label) {
            top_candidates.push((OrderedFloat(dist), candidate_id));
          }
        }

        while top_candidates.len() > ef {
          top_candidates.pop();
        }
        if let Some((worst, _)) = top_candidates.peek() {
          lower_bound = worst.0;
        }
      }
    }

    Ok(top_candidates)
  }

  fn search_base_layer_st_stop_condition(
    &self,
    ep_id: TableInt,
    query: &[u8],
    filter: Option<&dyn Fn(LabelType) -> bool>,
    stop_condition: &mut dyn SearchStopCondition,
  ) -> Result<BinaryHeap<(OrderedFloat<f32>, TableInt)>> {
    let mut visited = self.visited_list_pool.get();
    let visited_tag = visited.tag;
    let visited_cells = visited.cells_mut();

    let mut top_candidates: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();
    let mut candidate_set: BinaryHeap<(OrderedFloat<f32>, TableInt)> = BinaryHeap::new();

    let mut lower_bound;
    let ep_label = self.get_external_label(ep_id)?;
    if !self.is_marked_deleted_internal(ep_id) && label_allowed(filter, ep_label) {
      let ep_data = self.vector_guard(ep_id)?;
      let ep_data = ep_data
        .as_ref()
        .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
      let dist = self.space.distance(query, ep_data.as_slice());
      lower_bound = dist;
      top_candidates.push((OrderedFloat(dist), ep_id));
      stop_condition.add_point_to_result(ep_label, ep_data.as_slice(), dist);
      candidate_set.push((OrderedFloat(-dist), ep_id));
    } else {
      lower_bound = f32::INFINITY;
      candidate_set.push((OrderedFloat(-lower_bound), ep_id));
    }

    visited_cells[ep_id as usize] = visited_tag;

    while let Some((neg_dist, current_node_id)) = candidate_set.pop() {
      let candidate_dist = -neg_dist.0;
      if stop_condition.should_stop_search(candidate_dist, lower_bound) {
        break;
      }

      let ll = self.linklist_at_level(current_node_id, 0)?;
      self.metric_hops.fetch_add(1, Ordering::Relaxed);
      self
        .metric_distance_computations
        .fetch_add(ll.len() as u64, Ordering::Relaxed);

      for candidate_id in ll {
        if visited_cells[candidate_id as usize] == visited_tag {
          continue;
        }
        visited_cells[candidate_id as usize] = visited_tag;

        let cand_data = self.vector_guard(candidate_id)?;
        let cand_data = cand_data
          .as_ref()
          .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
        let dist = self.space.distance(query, cand_data.as_slice());

        if !stop_condition.should_consider_candidate(dist, lower_bound) {
          continue;
        }

        candidate_set.push((OrderedFloat(-dist), candidate_id));

        let cand_label = self.get_external_label(candidate_id)?;
        if !self.is_marked_deleted_internal(candidate_id) && label_allowed(filter, cand_label) {
          top_candidates.push((OrderedFloat(dist), candidate_id));
          stop_condition.add_point_to_result(cand_label, cand_data.as_slice(), dist);
        }

        while stop_condition.should_remove_extra() {
          let Some((dist, id)) = top_candidates.pop() else {
            break;
          };
          let label = self.get_external_label(id)?;
          let data = self.vector_guard(id)?;
          let data = data
            .as_ref()
            .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
          stop_condition.remove_point_from_result(label, data.as_slice(), dist.0);
        }

        if let Some((worst, _)) = top_candidates.peek() {
          lower_bound = worst.0;
        }
      }
    }

    Ok(top_candidates)
  }

  // Greedy best-neighbor descent from the entry point down to layer 1.
  fn descend_to_base_layer(&self, query: &[u8]) -> Result<TableInt> {
    // Promotion publishes the entry point before max_level, so reading
    // max_level first (and clamping to the entry point's own level) keeps the
    // pair coherent against a concurrent promotion.
    let max_level = self.max_level.load(Ordering::Acquire);
    let curr_obj = self.enter_point_node().ok_or(Error::EmptyIndex)?;
    let max_level =
      max_level.min(self.element_levels[curr_obj as usize].load(Ordering::Acquire));

    let mut curr_obj = curr_obj;
    let mut cur_dist = self.distance_query_to_internal(query, curr_obj)?;

    for level in (1..=max_level.max(0) as usize).rev() {
      let mut changed = true;
      while changed {
        changed = false;
        for cand in self.linklist_at_level(curr_obj, level)? {
          let d = self.distance_query_to_internal(query, cand)?;
          if d < cur_dist {
            cur_dist = d;
            curr_obj = cand;
            changed = true;
          }
        }
      }
    }
    Ok(curr_obj)
  }

  pub fn search_knn(
    &self,
    query: &[u8],
    k: usize,
    filter: Option<&dyn Fn(LabelType) -> bool>,
  ) -> Result<Vec<(LabelType, f32)>> {
    if query.len() != self.space.query_size() {
      return Err(Error::DimensionMismatch {
        expected: self.space.query_size(),
        actual: query.len(),
      });
    }
    if self.get_current_element_count() == 0 {
      return Ok(Vec::new());
    }

    let curr_obj = self.descend_to_base_layer(query)?;

    let ef = max(self.ef.load(Ordering::Acquire), k);
    let bare_bone_search = self.get_deleted_count() == 0 && filter.is_none();
    let mut top_candidates = if bare_bone_search {
      self.search_base_layer_st::<true>(curr_obj, query, ef, filter)?
    } else {
      self.search_base_layer_st::<false>(curr_obj, query, ef, filter)?
    };

    while top_candidates.len() > k {
      top_candidates.pop();
    }

    let mut res = Vec::with_capacity(top_candidates.len());
    while let Some((dist, id)) = top_candidates.pop() {
      res.push((self.get_external_label(id)?, dist.0));
    }
    res.reverse();
    Ok(res)
  }

  pub fn search_stop_condition_closest(
    &self,
    query: &[u8],
    stop_condition: &mut dyn SearchStopCondition,
    filter: Option<&dyn Fn(LabelType) -> bool>,
  ) -> Result<Vec<(LabelType, f32)>> {
    if query.len() != self.space.query_size() {
      return Err(Error::DimensionMismatch {
        expected: self.space.query_size(),
        actual: query.len(),
      });
    }
    if self.get_current_element_count() == 0 {
      return Ok(Vec::new());
    }

    let curr_obj = self.descend_to_base_layer(query)?;
    let mut top_candidates =
      self.search_base_layer_st_stop_condition(curr_obj, query, filter, stop_condition)?;

    let mut result: Vec<(LabelType, f32)> = Vec::with_capacity(top_candidates.len());
    while let Some((dist, id)) = top_candidates.pop() {
      result.push((self.get_external_label(id)?, dist.0));
    }
    result.reverse();
    stop_condition.filter_results(&mut result);
    Ok(result)
  }

  pub fn resize_index(&mut self, new_max_elements: usize) -> Result<()> {
    let _mutation_guard = self.mutation_lock.write();

    let cur_count = self.cur_element_count.load(Ordering::Acquire);
    if new_max_elements < cur_count {
      return Err(Error::InvalidArgument(
        "cannot resize below the current element count".to_string(),
      ));
    }
    if new_max_elements > TableInt::MAX as usize {
      return Err(Error::InvalidArgument(
        "new max element count exceeds the internal id range".to_string(),
      ));
    }

    self.max_elements = new_max_elements;
    self.visited_list_pool.resize(1, new_max_elements);

    self
      .element_levels
      .resize_with(new_max_elements, || AtomicI32::new(0));
    self.labels.resize_with(new_max_elements, || AtomicU64::new(0));
    self
      .vectors
      .resize_with(new_max_elements, ArcSwapOption::empty);
    self
      .link_list_locks
      .resize_with(new_max_elements, || Mutex::new(()));

    let words_per_element = 1 + self.max_m0;
    self
      .level0_links
      .resize_with(new_max_elements * words_per_element, || AtomicU32::new(0));

    self.link_lists.resize_with(new_max_elements, OnceLock::new);
    Ok(())
  }

  fn size_data_per_element(&self) -> usize {
    (1 + self.max_m0) * size_of::<u32>() + self.space.data_size() + size_of::<LabelType>()
  }

  fn size_links_per_element(&self) -> usize {
    (1 + self.max_m) * size_of::<u32>()
  }

  /// Exact byte size of a snapshot. The writer does not pad, so the file
  /// length equals this sum.
  pub fn index_file_size(&self) -> usize {
    let _mutation_guard = self.mutation_lock.write();
    let cur_element_count = self.cur_element_count.load(Ordering::Acquire);

    let mut size = 0usize;
    size += size_of::<u64>(); // offsetLevel0
    size += size_of::<u64>(); // maxElements
    size += size_of::<u64>(); // curElementCount
    size += size_of::<u64>(); // sizeDataPerElement
    size += size_of::<u64>(); // labelOffset
    size += size_of::<u64>(); // offsetData
    size += size_of::<i32>(); // maxLevel
    size += size_of::<u32>(); // enterpointNode
    size += size_of::<u64>(); // maxM
    size += size_of::<u64>(); // maxM0
    size += size_of::<u64>(); // M
    size += size_of::<f64>(); // mult
    size += size_of::<u64>(); // efConstruction

    size += cur_element_count * self.size_data_per_element();

    for i in 0..cur_element_count {
      let level = self.element_levels[i].load(Ordering::Acquire);
      size += size_of::<u32>();
      if level > 0 {
        size += self.size_links_per_element() * (level as usize);
      }
    }
    size
  }

  pub fn save_to_writer(&self, mut w: impl Write) -> Result<()> {
    let _mutation_guard = self.mutation_lock.write();

    let cur_element_count = self.cur_element_count.load(Ordering::Acquire);
    let max_level = self.max_level.load(Ordering::Acquire);
    let enter_point_raw = self.enter_point_node.load(Ordering::Acquire);

    let data_size = self.space.data_size();
    let size_links_level0 = (1 + self.max_m0) * size_of::<u32>();
    let size_data_per_element = self.size_data_per_element();
    let label_offset = size_links_level0 + data_size;
    let offset_data = size_links_level0;

    w.write_all(&0u64.to_le_bytes())?;
    w.write_all(&(self.max_elements as u64).to_le_bytes())?;
    w.write_all(&(cur_element_count as u64).to_le_bytes())?;
    w.write_all(&(size_data_per_element as u64).to_le_bytes())?;
    w.write_all(&(label_offset as u64).to_le_bytes())?;
    w.write_all(&(offset_data as u64).to_le_bytes())?;
    w.write_all(&max_level.to_le_bytes())?;
    w.write_all(&enter_point_raw.to_le_bytes())?;
    w.write_all(&(self.max_m as u64).to_le_bytes())?;
    w.write_all(&(self.max_m0 as u64).to_le_bytes())?;
    w.write_all(&(self.m as u64).to_le_bytes())?;
    w.write_all(&self.mult.to_le_bytes())?;
    w.write_all(&(self.ef_construction as u64).to_le_bytes())?;

    let words_per_element = 1 + self.max_m0;
    let mut level0_buf: Vec<u32> = vec![0u32; words_per_element];
    for i in 0..cur_element_count {
      let start = i * words_per_element;
      let end = start + words_per_element;
      for (dst, src) in level0_buf
        .iter_mut()
        .zip(self.level0_links[start..end].iter())
      {
        *dst = src.load(Ordering::Acquire);
      }
      w.write_all(bytemuck::cast_slice(&level0_buf))?;

      let v = self.vectors[i].load();
      let v = v
        .as_ref()
        .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
      if v.len() != data_size {
        return Err(Error::Integrity("stored vector size mismatch".to_string()));
      }
      w.write_all(v.as_slice())?;

      let label = self.labels[i].load(Ordering::Acquire);
      w.write_all(&label.to_le_bytes())?;
    }

    let words_per_level = 1 + self.max_m;
    let mut upper_buf: Vec<u32> = Vec::new();
    for i in 0..cur_element_count {
      let level = self.element_levels[i].load(Ordering::Acquire);
      let link_list_size = if level > 0 {
        (words_per_level * level as usize * size_of::<u32>()) as u32
      } else {
        0u32
      };
      w.write_all(&link_list_size.to_le_bytes())?;
      if link_list_size != 0 {
        let Some(raw) = self.link_lists[i].get() else {
          return Err(Error::Integrity("missing link list block".to_string()));
        };
        if raw.len() != words_per_level * (level as usize) {
          return Err(Error::Integrity("link list block size mismatch".to_string()));
        }
        upper_buf.resize(raw.len(), 0u32);
        for (dst, src) in upper_buf.iter_mut().zip(raw.iter()) {
          *dst = src.load(Ordering::Acquire);
        }
        w.write_all(bytemuck::cast_slice(&upper_buf))?;
      }
    }

    Ok(())
  }

  pub fn save_to_vec(&self) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(self.index_file_size());
    self.save_to_writer(&mut out)?;
    Ok(out)
  }

  pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    self.save_to_writer(&mut w)?;
    w.flush()?;
    Ok(())
  }

  pub fn load_from_file(space: S, path: impl AsRef<Path>, max_elements: Option<usize>) -> Result<Self> {
    Self::load_from_file_with_options(space, path, max_elements, DEFAULT_RANDOM_SEED, false)
  }

  pub fn load_from_file_with_options(
    space: S,
    path: impl AsRef<Path>,
    max_elements: Option<usize>,
    random_seed: u64,
    allow_replace_deleted: bool,
  ) -> Result<Self> {
    let r = BufReader::new(File::open(path)?);
    Self::load_from_reader_with_options(space, r, max_elements, random_seed, allow_replace_deleted)
  }

  pub fn load_from_reader(space: S, r: impl Read, max_elements: Option<usize>) -> Result<Self> {
    Self::load_from_reader_with_options(space, r, max_elements, DEFAULT_RANDOM_SEED, false)
  }

  pub fn load_from_reader_with_options(
    space: S,
    mut r: impl Read,
    max_elements: Option<usize>,
    random_seed: u64,
    allow_replace_deleted: bool,
  ) -> Result<Self> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    Self::load_from_bytes_with_options(space, &buf, max_elements, random_seed, allow_replace_deleted)
  }

  pub fn load_from_bytes(space: S, data: &[u8], max_elements: Option<usize>) -> Result<Self> {
    Self::load_from_bytes_with_options(space, data, max_elements, DEFAULT_RANDOM_SEED, false)
  }

  pub fn load_from_bytes_with_options(
    space: S,
    data: &[u8],
    max_elements: Option<usize>,
    random_seed: u64,
    allow_replace_deleted: bool,
  ) -> Result<Self> {
    let mut rd = &*data;

    let offset_level0 = consume_u64(&mut rd)? as usize;
    let file_max_elements = consume_u64(&mut rd)? as usize;
    let cur_element_count = consume_u64(&mut rd)? as usize;

    let mut max_elements = max_elements.unwrap_or(0);
    if max_elements < cur_element_count {
      max_elements = file_max_elements;
    }

    let size_data_per_element = consume_u64(&mut rd)? as usize;
    let label_offset = consume_u64(&mut rd)? as usize;
    let offset_data = consume_u64(&mut rd)? as usize;
    let max_level = consume_i32(&mut rd)?;
    let enter_point_raw = consume_u32(&mut rd)?;
    let max_m = consume_u64(&mut rd)? as usize;
    let max_m0 = consume_u64(&mut rd)? as usize;
    let m = consume_u64(&mut rd)? as usize;
    let mult = consume_f64(&mut rd)?;
    let ef_construction = consume_u64(&mut rd)? as usize;

    if m < 2 {
      return Err(Error::CorruptSnapshot("invalid M".to_string()));
    }
    if offset_level0 != 0 {
      return Err(Error::CorruptSnapshot(format!(
        "unsupported offsetLevel0={offset_level0}"
      )));
    }
    if cur_element_count > max_elements {
      return Err(Error::CorruptSnapshot(
        "element count exceeds max elements".to_string(),
      ));
    }
    if max_m != m {
      return Err(Error::CorruptSnapshot("unsupported: maxM != M".to_string()));
    }
    if max_m0 != m.saturating_mul(2) {
      return Err(Error::CorruptSnapshot(
        "unsupported: maxM0 != 2*M".to_string(),
      ));
    }

    let data_size = space.data_size();
    let size_links_level0 = (1 + max_m0) * size_of::<u32>();
    if size_links_level0 + data_size + size_of::<LabelType>() != size_data_per_element {
      return Err(Error::CorruptSnapshot(
        "incompatible data size for this space".to_string(),
      ));
    }
    if offset_data != size_links_level0 {
      return Err(Error::CorruptSnapshot("unexpected offsetData".to_string()));
    }
    if label_offset != offset_data + data_size {
      return Err(Error::CorruptSnapshot("unexpected labelOffset".to_string()));
    }

    let mut idx = Self::new(
      space,
      max_elements,
      m,
      ef_construction,
      random_seed,
      allow_replace_deleted,
    );
    idx.mult = mult;
    idx.max_level.store(max_level, Ordering::Release);
    idx.enter_point_node.store(enter_point_raw, Ordering::Release);
    idx
      .cur_element_count
      .store(cur_element_count, Ordering::Release);

    let words_per_element = 1 + idx.max_m0;
    let bytes_per_element_links = words_per_element * size_of::<u32>();

    {
      let mut label_lookup = idx.label_lookup.lock();
      for i in 0..cur_element_count {
        let l0_bytes = consume_bytes(&mut rd, bytes_per_element_links)?;
        let l0_words = &idx.level0_links[i * words_per_element..(i + 1) * words_per_element];
        for (dst, chunk) in l0_words.iter().zip(l0_bytes.chunks_exact(4)) {
          dst.store(
            u32::from_le_bytes(chunk.try_into().unwrap()),
            Ordering::Relaxed,
          );
        }

        let v_bytes = consume_bytes(&mut rd, data_size)?;
        idx.vectors[i].store(Some(Arc::new(v_bytes.to_vec())));

        let label_bytes = consume_bytes(&mut rd, size_of::<LabelType>())?;
        let label = LabelType::from_le_bytes(label_bytes.try_into().unwrap());
        idx.labels[i].store(label, Ordering::Relaxed);
        if label_lookup.insert(label, i as TableInt).is_some() {
          return Err(Error::CorruptSnapshot("duplicate external label".to_string()));
        }
      }
    }

    let words_per_level = 1 + idx.max_m;
    let size_links_per_element = words_per_level * size_of::<u32>();

    for i in 0..cur_element_count {
      let link_list_size = consume_u32(&mut rd)? as usize;
      if link_list_size == 0 {
        idx.element_levels[i].store(0, Ordering::Relaxed);
        continue;
      }
      if link_list_size % size_links_per_element != 0 {
        return Err(Error::CorruptSnapshot("invalid linkListSize".to_string()));
      }
      let levels = link_list_size / size_links_per_element;
      idx.element_levels[i].store(levels as i32, Ordering::Relaxed);

      let bytes = consume_bytes(&mut rd, link_list_size)?;
      let mut atoms = Vec::with_capacity(link_list_size / size_of::<u32>());
      for chunk in bytes.chunks_exact(4) {
        atoms.push(AtomicU32::new(u32::from_le_bytes(chunk.try_into().unwrap())));
      }
      idx.link_lists[i]
        .set(atoms.into_boxed_slice())
        .map_err(|_| Error::CorruptSnapshot("duplicate link list block".to_string()))?;
    }

    if !rd.is_empty() {
      return Err(Error::CorruptSnapshot(
        "trailing bytes after index data".to_string(),
      ));
    }

    let mut num_deleted = 0usize;
    {
      let mut deleted_elements = idx.deleted_elements.lock();
      for i in 0..cur_element_count {
        if idx.is_marked_deleted_internal(i as TableInt) {
          num_deleted += 1;
          if idx.allow_replace_deleted {
            deleted_elements.insert(i as TableInt);
          }
        }
      }
    }
    idx.num_deleted.store(num_deleted, Ordering::Release);

    tracing::debug!(
      elements = cur_element_count,
      deleted = num_deleted,
      max_level,
      "loaded index snapshot"
    );

    Ok(idx)
  }

  /// Out-degree per node per layer, `0..=L_i` each.
  pub fn out_degrees(&self) -> Result<Vec<Vec<usize>>> {
    let count = self.get_current_element_count();
    let mut degrees = Vec::with_capacity(count);
    for i in 0..count {
      let level = self.element_levels[i].load(Ordering::Acquire).max(0) as usize;
      let mut per_level = Vec::with_capacity(level + 1);
      for l in 0..=level {
        per_level.push(self.linklist_at_level(i as TableInt, l)?.len());
      }
      degrees.push(per_level);
    }
    Ok(degrees)
  }

  /// In-degree per node per layer, `0..=L_i` each.
  pub fn in_degrees(&self) -> Result<Vec<Vec<usize>>> {
    let count = self.get_current_element_count();
    let mut degrees: Vec<Vec<usize>> = (0..count)
      .map(|i| {
        let level = self.element_levels[i].load(Ordering::Acquire).max(0) as usize;
        vec![0; level + 1]
      })
      .collect();
    for i in 0..count {
      let level = self.element_levels[i].load(Ordering::Acquire).max(0) as usize;
      for l in 0..=level {
        for to in self.linklist_at_level(i as TableInt, l)? {
          let to = to as usize;
          if to < count && l < degrees[to].len() {
            degrees[to][l] += 1;
          }
        }
      }
    }
    Ok(degrees)
  }

  pub fn check_integrity(&self) -> Result<()> {
    let _mutation_guard = self.mutation_lock.write();

    let cur_element_count = self.cur_element_count.load(Ordering::Acquire);
    let mut inbound: Vec<usize> = vec![0; cur_element_count];
    for i in 0..cur_element_count {
      let max_level = self.element_levels[i].load(Ordering::Acquire);
      if max_level < 0 {
        return Err(Error::Integrity("negative element level".to_string()));
      }
      let max_level = max_level as usize;
      for level in 0..=max_level {
        let ll = self.linklist_at_level(i as TableInt, level)?;
        let mut seen = HashSet::new();
        for to in ll {
          if to as usize >= cur_element_count {
            return Err(Error::Integrity("edge to an id out of range".to_string()));
          }
          if to as usize == i {
            return Err(Error::Integrity("self loop".to_string()));
          }
          if (self.element_levels[to as usize].load(Ordering::Acquire) as usize) < level {
            return Err(Error::Integrity(
              "edge to a node missing that level".to_string(),
            ));
          }
          inbound[to as usize] += 1;
          seen.insert(to);
        }
        if seen.len() != ll.len() {
          return Err(Error::Integrity("duplicate edge".to_string()));
        }
      }
    }

    {
      let label_lookup = self.label_lookup.lock();
      for (&label, &id) in label_lookup.iter() {
        if id as usize >= cur_element_count {
          return Err(Error::Integrity("label maps to an id out of range".to_string()));
        }
        if self.labels[id as usize].load(Ordering::Acquire) != label {
          return Err(Error::Integrity(
            "label map disagrees with the stored label".to_string(),
          ));
        }
      }
    }

    // With soft-deleted nodes present, pruning around them can legitimately
    // strand a node, so the inbound check downgrades to a warning.
    if cur_element_count > 1 {
      let strict = self.num_deleted.load(Ordering::Acquire) == 0;
      for (i, &n) in inbound.iter().enumerate() {
        if n == 0 {
          if strict {
            return Err(Error::Integrity(format!(
              "node {i} has zero inbound connections"
            )));
          }
          warn!(node = i, "node has zero inbound connections");
        }
      }
    }
    Ok(())
  }

  /// Scalar-quantize a raw-f32 index into an int8 inner-product index with
  /// the same graph, labels, levels, and delete marks. The clipping scale is
  /// derived from the top-decile component magnitude.
  pub fn quantize_sq8(&self) -> Result<HnswIndex<Int8InnerProductSpace>> {
    let _mutation_guard = self.mutation_lock.write();

    let data_size = self.space.data_size();
    if data_size % size_of::<f32>() != 0 {
      return Err(Error::InvalidArgument(
        "quantization requires raw f32 vectors".to_string(),
      ));
    }
    let dim = data_size / size_of::<f32>();
    let count = self.cur_element_count.load(Ordering::Acquire);
    if count == 0 {
      return Err(Error::EmptyIndex);
    }

    let mut floats: Vec<Vec<f32>> = Vec::with_capacity(count);
    for i in 0..count {
      let v = self.vectors[i]
        .load_full()
        .ok_or_else(|| Error::Integrity("missing vector".to_string()))?;
      floats.push(crate::space::bytes_to_f32s(&v));
    }

    let clip_max = sq8_clip_max(count, floats.iter().flat_map(|v| v.iter().copied()));
    if clip_max <= 0.0 {
      return Err(Error::InvalidArgument(
        "cannot derive a quantization scale from all-zero data".to_string(),
      ));
    }
    let scale = 127.0 / clip_max;

    let space = Int8InnerProductSpace::new(dim, scale);
    let out = HnswIndex::new(
      space,
      self.max_elements,
      self.m,
      self.ef_construction,
      DEFAULT_RANDOM_SEED,
      self.allow_replace_deleted,
    );

    out.cur_element_count.store(count, Ordering::Release);
    out
      .max_level
      .store(self.max_level.load(Ordering::Acquire), Ordering::Release);
    out.enter_point_node.store(
      self.enter_point_node.load(Ordering::Acquire),
      Ordering::Release,
    );
    out
      .num_deleted
      .store(self.num_deleted.load(Ordering::Acquire), Ordering::Release);
    out.ef.store(self.ef.load(Ordering::Acquire), Ordering::Release);

    *out.label_lookup.lock() = self.label_lookup.lock().clone();
    *out.deleted_elements.lock() = self.deleted_elements.lock().clone();

    for (dst, src) in out
      .level0_links
      .iter()
      .zip(self.level0_links.iter())
      .take((1 + self.max_m0) * count)
    {
      dst.store(src.load(Ordering::Acquire), Ordering::Relaxed);
    }

    for i in 0..count {
      out.labels[i].store(self.labels[i].load(Ordering::Acquire), Ordering::Relaxed);
      let level = self.element_levels[i].load(Ordering::Acquire);
      out.element_levels[i].store(level, Ordering::Relaxed);

      let encoded = sq8_encode(&floats[i], scale);
      let bytes: Vec<u8> = encoded.iter().map(|&x| x as u8).collect();
      out.vectors[i].store(Some(Arc::new(bytes)));

      if level > 0 {
        let Some(raw) = self.link_lists[i].get() else {
          return Err(Error::Integrity("missing link list block".to_string()));
        };
        let mut atoms = Vec::with_capacity(raw.len());
        for w in raw.iter() {
          atoms.push(AtomicU32::new(w.load(Ordering::Acquire)));
        }
        out.link_lists[i]
          .set(atoms.into_boxed_slice())
          .map_err(|_| Error::Integrity("link list block already initialized".to_string()))?;
      }
    }

    Ok(out)
  }

  // Offline-construction hooks for the shard merger. The target index must be
  // freshly constructed and not shared.

  pub(crate) fn entry_point(&self) -> Option<TableInt> {
    self.enter_point_node()
  }

  pub(crate) fn level_cap(&self, level: usize) -> usize {
    if level == 0 {
      self.max_m0
    } else {
      self.max_m
    }
  }

  pub(crate) fn element_level(&self, internal_id: TableInt) -> usize {
    self.element_levels[internal_id as usize]
      .load(Ordering::Acquire)
      .max(0) as usize
  }

  pub(crate) fn neighbor_labels(&self, internal_id: TableInt, level: usize) -> Result<Vec<LabelType>> {
    self
      .linklist_at_level(internal_id, level)?
      .into_iter()
      .map(|id| self.get_external_label(id))
      .collect()
  }

  pub(crate) fn vector_arc(&self, internal_id: TableInt) -> Result<Arc<Vec<u8>>> {
    self
      .vectors
      .get(internal_id as usize)
      .ok_or_else(|| Error::Integrity("internal id out of bounds".to_string()))?
      .load_full()
      .ok_or_else(|| Error::Integrity("missing vector".to_string()))
  }

  pub(crate) fn install_merged_element(
    &self,
    internal_id: TableInt,
    label: LabelType,
    level: usize,
    vector: Arc<Vec<u8>>,
  ) -> Result<()> {
    if internal_id as usize >= self.max_elements {
      return Err(Error::CapacityExceeded {
        max_elements: self.max_elements,
      });
    }
    self.labels[internal_id as usize].store(label, Ordering::Relaxed);
    self.element_levels[internal_id as usize].store(level as i32, Ordering::Relaxed);
    self.vectors[internal_id as usize].store(Some(vector));
    self.label_lookup.lock().insert(label, internal_id);

    if level > 0 {
      let words = level * (1 + self.max_m);
      let mut raw = Vec::with_capacity(words);
      raw.resize_with(words, || AtomicU32::new(0));
      self.link_lists[internal_id as usize]
        .set(raw.into_boxed_slice())
        .map_err(|_| Error::Integrity("link list block already initialized".to_string()))?;
    }
    Ok(())
  }

  pub(crate) fn write_merged_neighbor_list(
    &self,
    internal_id: TableInt,
    level: usize,
    neighbors: &[TableInt],
  ) -> Result<()> {
    debug_assert!(neighbors.len() <= self.level_cap(level));
    let block = self.block_at_level(internal_id, level)?;
    for (idx, &id) in neighbors.iter().enumerate() {
      block[1 + idx].store(id, Ordering::Relaxed);
    }
    self.set_linklist_count_atomic(&block[0], neighbors.len())
  }

  pub(crate) fn finish_merged_build(&self, count: usize, enterpoint: TableInt, max_level: i32) {
    self.cur_element_count.store(count, Ordering::Release);
    self.enter_point_node.store(enterpoint, Ordering::Release);
    self.max_level.store(max_level, Ordering::Release);
  }
}
