use parking_lot::Mutex;
use std::collections::VecDeque;

pub type VisitTag = u16;

/// Scratch bitmap for one graph traversal. A cell is "visited" iff it holds
/// the current tag, so reuse only needs a tag bump; the array is zeroed only
/// when the tag wraps.
#[derive(Debug)]
pub struct VisitedList {
  tag: VisitTag,
  cells: Vec<VisitTag>,
}

impl VisitedList {
  pub fn new(num_elements: usize) -> Self {
    Self {
      tag: VisitTag::MAX,
      cells: vec![0; num_elements],
    }
  }

  fn advance(&mut self) -> VisitTag {
    self.tag = self.tag.wrapping_add(1);
    if self.tag == 0 {
      self.cells.fill(0);
      self.tag = 1;
    }
    self.tag
  }
}

#[derive(Debug)]
pub struct VisitedListPool {
  pool: Mutex<VecDeque<VisitedList>>,
  num_elements: usize,
}

impl VisitedListPool {
  pub fn new(initial_pool_size: usize, num_elements: usize) -> Self {
    let mut pool = VecDeque::with_capacity(initial_pool_size);
    for _ in 0..initial_pool_size {
      pool.push_back(VisitedList::new(num_elements));
    }
    Self {
      pool: Mutex::new(pool),
      num_elements,
    }
  }

  pub fn resize(&mut self, initial_pool_size: usize, num_elements: usize) {
    *self = Self::new(initial_pool_size, num_elements);
  }

  pub fn get(&self) -> VisitedListHandle<'_> {
    let mut list = {
      let mut pool = self.pool.lock();
      pool.pop_front()
    }
    .unwrap_or_else(|| VisitedList::new(self.num_elements));
    let tag = list.advance();
    VisitedListHandle {
      pool: &self.pool,
      list: Some(list),
      tag,
    }
  }
}

pub struct VisitedListHandle<'a> {
  pool: &'a Mutex<VecDeque<VisitedList>>,
  list: Option<VisitedList>,
  pub tag: VisitTag,
}

impl VisitedListHandle<'_> {
  pub fn cells_mut(&mut self) -> &mut [VisitTag] {
    &mut self.list.as_mut().unwrap().cells
  }
}

impl Drop for VisitedListHandle<'_> {
  fn drop(&mut self) {
    if let Some(list) = self.list.take() {
      self.pool.lock().push_back(list);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_lease_sees_no_cell_visited() {
    let pool = VisitedListPool::new(1, 8);
    {
      let mut h = pool.get();
      let tag = h.tag;
      let cells = h.cells_mut();
      assert!(cells.iter().all(|&c| c != tag));
      cells[3] = tag;
    }
    let mut h = pool.get();
    let tag = h.tag;
    assert!(h.cells_mut().iter().all(|&c| c != tag));
  }

  #[test]
  fn tag_wraparound_zeroes_cells() {
    let mut list = VisitedList::new(4);
    // First advance moves MAX -> 0 -> wraps to 1 with a cleared array.
    let tag = list.advance();
    assert_eq!(tag, 1);
    list.cells[0] = tag;

    for _ in 0..(VisitTag::MAX as usize) {
      list.advance();
    }
    // Back at tag 1 after a full cycle; the stale mark must be gone.
    assert_eq!(list.tag, 1);
    assert!(list.cells.iter().all(|&c| c == 0));
  }

  #[test]
  fn released_lists_are_reused() {
    let pool = VisitedListPool::new(1, 4);
    let t1 = {
      let h = pool.get();
      h.tag
    };
    let t2 = {
      let h = pool.get();
      h.tag
    };
    assert_eq!(t2, t1.wrapping_add(1));
  }
}
