use crate::LabelType;
use ahash::HashMap;
use ahash::HashMapExt;
use ordered_float::OrderedFloat;
use std::collections::BinaryHeap;
use std::hash::Hash;

/// Caller-supplied termination policy for layer-0 beam search. The engine
/// reports every accepted and evicted result so the condition can track its
/// own notion of "enough".
pub trait SearchStopCondition {
  fn add_point_to_result(&mut self, label: LabelType, datapoint: &[u8], dist: f32);
  fn remove_point_from_result(&mut self, label: LabelType, datapoint: &[u8], dist: f32);

  fn should_stop_search(&self, candidate_dist: f32, lower_bound: f32) -> bool;
  fn should_consider_candidate(&self, candidate_dist: f32, lower_bound: f32) -> bool;
  fn should_remove_extra(&self) -> bool;

  fn filter_results(&mut self, results: &mut Vec<(LabelType, f32)>);
}

/// Keeps every result within `epsilon` of the query, bounded between
/// `min_num_candidates` and `max_num_candidates`.
#[derive(Debug, Clone)]
pub struct EpsilonSearchStopCondition {
  epsilon: f32,
  min_num_candidates: usize,
  max_num_candidates: usize,
  curr_num_items: usize,
}

impl EpsilonSearchStopCondition {
  pub fn new(epsilon: f32, min_num_candidates: usize, max_num_candidates: usize) -> Self {
    assert!(min_num_candidates <= max_num_candidates);
    Self {
      epsilon,
      min_num_candidates,
      max_num_candidates,
      curr_num_items: 0,
    }
  }
}

impl SearchStopCondition for EpsilonSearchStopCondition {
  fn add_point_to_result(&mut self, _label: LabelType, _datapoint: &[u8], _dist: f32) {
    self.curr_num_items += 1;
  }

  fn remove_point_from_result(&mut self, _label: LabelType, _datapoint: &[u8], _dist: f32) {
    self.curr_num_items -= 1;
  }

  fn should_stop_search(&self, candidate_dist: f32, lower_bound: f32) -> bool {
    if candidate_dist > lower_bound && self.curr_num_items == self.max_num_candidates {
      return true;
    }
    if candidate_dist > self.epsilon && self.curr_num_items >= self.min_num_candidates {
      return true;
    }
    false
  }

  fn should_consider_candidate(&self, candidate_dist: f32, lower_bound: f32) -> bool {
    self.curr_num_items < self.max_num_candidates || lower_bound > candidate_dist
  }

  fn should_remove_extra(&self) -> bool {
    self.curr_num_items > self.max_num_candidates
  }

  fn filter_results(&mut self, results: &mut Vec<(LabelType, f32)>) {
    while results.last().is_some_and(|(_, dist)| *dist > self.epsilon) {
      results.pop();
    }
    while results.len() > self.max_num_candidates {
      results.pop();
    }
  }
}

/// Searches until `num_docs_to_search` distinct documents are represented,
/// where `doc_id_for` maps each stored vector to its document.
#[derive(Debug)]
pub struct MultiVectorSearchStopCondition<D, F>
where
  D: Copy + Eq + Hash + Ord,
  F: Fn(LabelType, &[u8]) -> D,
{
  curr_num_docs: usize,
  num_docs_to_search: usize,
  ef_collection: usize,
  doc_counter: HashMap<D, usize>,
  search_results: BinaryHeap<(OrderedFloat<f32>, D)>,
  doc_id_for: F,
}

impl<D, F> MultiVectorSearchStopCondition<D, F>
where
  D: Copy + Eq + Hash + Ord,
  F: Fn(LabelType, &[u8]) -> D,
{
  pub fn new(doc_id_for: F, num_docs_to_search: usize, ef_collection: usize) -> Self {
    let ef_collection = ef_collection.max(num_docs_to_search);
    Self {
      curr_num_docs: 0,
      num_docs_to_search,
      ef_collection,
      doc_counter: HashMap::new(),
      search_results: BinaryHeap::new(),
      doc_id_for,
    }
  }
}

impl<D, F> SearchStopCondition for MultiVectorSearchStopCondition<D, F>
where
  D: Copy + Eq + Hash + Ord,
  F: Fn(LabelType, &[u8]) -> D,
{
  fn add_point_to_result(&mut self, label: LabelType, datapoint: &[u8], dist: f32) {
    let doc_id = (self.doc_id_for)(label, datapoint);
    let entry = self.doc_counter.entry(doc_id).or_insert(0);
    if *entry == 0 {
      self.curr_num_docs += 1;
    }
    *entry += 1;
    self.search_results.push((OrderedFloat(dist), doc_id));
  }

  fn remove_point_from_result(&mut self, label: LabelType, datapoint: &[u8], _dist: f32) {
    let doc_id = (self.doc_id_for)(label, datapoint);
    let Some(entry) = self.doc_counter.get_mut(&doc_id) else {
      return;
    };
    *entry -= 1;
    if *entry == 0 {
      self.curr_num_docs -= 1;
    }
    self.search_results.pop();
  }

  fn should_stop_search(&self, candidate_dist: f32, lower_bound: f32) -> bool {
    candidate_dist > lower_bound && self.curr_num_docs == self.ef_collection
  }

  fn should_consider_candidate(&self, candidate_dist: f32, lower_bound: f32) -> bool {
    self.curr_num_docs < self.ef_collection || lower_bound > candidate_dist
  }

  fn should_remove_extra(&self) -> bool {
    self.curr_num_docs > self.ef_collection
  }

  fn filter_results(&mut self, results: &mut Vec<(LabelType, f32)>) {
    while self.curr_num_docs > self.num_docs_to_search {
      let Some((_, dist_cand)) = results.last() else {
        break;
      };
      let (dist_res, doc_id) = {
        let Some(&(d, id)) = self.search_results.peek() else {
          break;
        };
        (d.0, id)
      };
      debug_assert_eq!(*dist_cand, dist_res);
      let entry = self.doc_counter.get_mut(&doc_id).unwrap();
      *entry -= 1;
      if *entry == 0 {
        self.curr_num_docs -= 1;
      }
      self.search_results.pop();
      results.pop();
    }
  }
}
