//! Binary heap ordered by a caller-supplied comparator.
//!
//! `std::collections::BinaryHeap` requires `Ord` on the element type, which
//! forces newtype wrappers for every ordering the scheduler needs. This queue
//! keeps the ordering outside the element instead.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Max-heap with respect to its comparator: `pop` returns the greatest element.
pub struct PriorityQueue<T> {
    items: Vec<T>,
    compare: Comparator<T>,
}

impl<T: Ord> PriorityQueue<T> {
    /// Create a queue ordered by `Ord`, greatest first.
    pub fn new() -> Self {
        Self::with_comparator(|a: &T, b: &T| a.cmp(b))
    }
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Create a queue where `compare(a, b) == Greater` puts `a` closer to the top.
    pub fn with_comparator<F>(compare: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        Self {
            items: Vec::new(),
            compare: Arc::new(compare),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
        self.sift_up(self.items.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Remove the top element and insert `item` in one pass.
    ///
    /// Returns the previous top. On an empty queue `item` is inserted and
    /// `None` is returned.
    pub fn replace(&mut self, item: T) -> Option<T> {
        if self.items.is_empty() {
            self.items.push(item);
            return None;
        }
        let top = std::mem::replace(&mut self.items[0], item);
        self.sift_down(0);
        Some(top)
    }

    /// Remove every element matching `predicate`, preserving heap order.
    pub fn retain<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.items.len();
        self.items.retain(|item| predicate(item));
        if self.items.len() != before {
            self.rebuild();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drain the queue into a vector ordered from top to bottom.
    pub fn into_sorted_vec(mut self) -> Vec<T> {
        let mut sorted = Vec::with_capacity(self.items.len());
        while let Some(item) = self.pop() {
            sorted.push(item);
        }
        sorted
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    fn rebuild(&mut self) {
        let len = self.items.len();
        for index in (0..len / 2).rev() {
            self.sift_down(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if (self.compare)(&self.items[index], &self.items[parent]) != Ordering::Greater {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut largest = index;

            if left < len
                && (self.compare)(&self.items[left], &self.items[largest]) == Ordering::Greater
            {
                largest = left;
            }
            if right < len
                && (self.compare)(&self.items[right], &self.items[largest]) == Ordering::Greater
            {
                largest = right;
            }
            if largest == index {
                break;
            }
            self.items.swap(index, largest);
            index = largest;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("items", &self.items)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_descending_order_by_default() {
        let mut queue = PriorityQueue::new();
        queue.push(10);
        queue.push(20);
        queue.push(30);

        assert_eq!(queue.pop(), Some(30));
        assert_eq!(queue.pop(), Some(20));
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn replace_returns_previous_top() {
        let mut queue = PriorityQueue::new();
        for value in [10, 20, 30] {
            queue.push(value);
        }

        assert_eq!(queue.replace(40), Some(30));
        assert_eq!(queue.peek(), Some(&40));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn replace_on_empty_queue_inserts() {
        let mut queue = PriorityQueue::new();
        assert_eq!(queue.replace(5), None);
        assert_eq!(queue.peek(), Some(&5));
    }

    #[test]
    fn custom_comparator_builds_min_heap() {
        let mut queue = PriorityQueue::with_comparator(|a: &i32, b: &i32| b.cmp(a));
        for value in [7, 3, 9, 1] {
            queue.push(value);
        }

        assert_eq!(queue.into_sorted_vec(), vec![1, 3, 7, 9]);
    }

    #[test]
    fn retain_keeps_heap_order() {
        let mut queue = PriorityQueue::new();
        for value in 1..=10 {
            queue.push(value);
        }

        queue.retain(|value| value % 2 == 0);

        assert_eq!(queue.into_sorted_vec(), vec![10, 8, 6, 4, 2]);
    }
}
