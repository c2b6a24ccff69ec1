//! Arena-backed doubly-linked list.
//!
//! Nodes live in a slot vector and reference each other by index, so handles
//! stay stable across unrelated insertions and removals and the structure
//! survives callbacks that mutate it mid-iteration. A `Cursor` walks the
//! links without borrowing the list; the node it last yielded may be removed
//! without invalidating it.
//!
//! Value destruction is `Drop`. A clone hook (`set_dup`) and an equality
//! hook (`set_match`) may be supplied by the owner; `duplicate` and `search`
//! fall back to `Clone` / `PartialEq` when they are absent.

use std::fmt;
use std::rc::Rc;

/// Stable handle to a list node.
///
/// Handles are invalidated by `remove`; a handle held across a removal may
/// afterwards name a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Iteration direction, chosen at cursor creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HeadToTail,
    TailToHead,
}

struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

enum Slot<T> {
    Occupied(Node<T>),
    Free { next_free: Option<usize> },
}

type DupFn<T> = dyn Fn(&T) -> T;
type MatchFn<T> = dyn Fn(&T, &T) -> bool;

pub struct List<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    dup: Option<Rc<DupFn<T>>>,
    matches: Option<Rc<MatchFn<T>>>,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for List<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List").field("len", &self.len).finish()
    }
}

impl<T> List<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            head: None,
            tail: None,
            len: 0,
            dup: None,
            matches: None,
        }
    }

    /// Owner-supplied clone hook used by `duplicate`.
    pub fn set_dup(&mut self, dup: Rc<DupFn<T>>) {
        self.dup = Some(dup);
    }

    /// Owner-supplied equality hook used by `search`.
    pub fn set_match(&mut self, matches: Rc<MatchFn<T>>) {
        self.matches = Some(matches);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn front(&self) -> Option<NodeId> {
        self.head.map(NodeId)
    }

    pub fn back(&self) -> Option<NodeId> {
        self.tail.map(NodeId)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied(node)) => Some(&node.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Occupied(node)) => Some(&mut node.value),
            _ => None,
        }
    }

    pub fn next_of(&self, id: NodeId) -> Option<NodeId> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied(node)) => node.next.map(NodeId),
            _ => None,
        }
    }

    pub fn prev_of(&self, id: NodeId) -> Option<NodeId> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied(node)) => node.prev.map(NodeId),
            _ => None,
        }
    }

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free_head {
            Some(idx) => {
                self.free_head = match self.slots[idx] {
                    Slot::Free { next_free } => next_free,
                    Slot::Occupied(_) => unreachable!("free-list points at occupied slot"),
                };
                self.slots[idx] = Slot::Occupied(node);
                idx
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                self.slots.len() - 1
            }
        }
    }

    fn node(&self, idx: usize) -> &Node<T> {
        match &self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Free { .. } => unreachable!("link points at free slot"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<T> {
        match &mut self.slots[idx] {
            Slot::Occupied(node) => node,
            Slot::Free { .. } => unreachable!("link points at free slot"),
        }
    }

    pub fn push_front(&mut self, value: T) -> NodeId {
        let idx = self.alloc(Node { value, prev: None, next: self.head });
        match self.head {
            Some(old) => self.node_mut(old).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
        NodeId(idx)
    }

    pub fn push_back(&mut self, value: T) -> NodeId {
        let idx = self.alloc(Node { value, prev: self.tail, next: None });
        match self.tail {
            Some(old) => self.node_mut(old).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
        NodeId(idx)
    }

    pub fn insert_before(&mut self, at: NodeId, value: T) -> Option<NodeId> {
        if self.get(at).is_none() {
            return None;
        }
        let prev = self.node(at.0).prev;
        let idx = self.alloc(Node { value, prev, next: Some(at.0) });
        self.node_mut(at.0).prev = Some(idx);
        match prev {
            Some(p) => self.node_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.len += 1;
        Some(NodeId(idx))
    }

    pub fn insert_after(&mut self, at: NodeId, value: T) -> Option<NodeId> {
        if self.get(at).is_none() {
            return None;
        }
        let next = self.node(at.0).next;
        let idx = self.alloc(Node { value, prev: Some(at.0), next });
        self.node_mut(at.0).next = Some(idx);
        match next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
        Some(NodeId(idx))
    }

    /// Unlink `id` and return its value. Safe to call for the node a cursor
    /// just yielded.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if self.get(id).is_none() {
            return None;
        }
        let (prev, next) = {
            let node = self.node(id.0);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let slot = std::mem::replace(&mut self.slots[id.0], Slot::Free { next_free: self.free_head });
        self.free_head = Some(id.0);
        self.len -= 1;
        match slot {
            Slot::Occupied(node) => Some(node.value),
            Slot::Free { .. } => None,
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Move the tail node in front of the head. O(1) link surgery.
    pub fn rotate_tail_to_head(&mut self) {
        if self.len < 2 {
            return;
        }
        let t = self.tail.expect("len >= 2 implies a tail");
        let new_tail = self.node(t).prev.expect("len >= 2 implies tail.prev");
        self.node_mut(new_tail).next = None;
        self.tail = Some(new_tail);
        let h = self.head.expect("len >= 2 implies a head");
        self.node_mut(t).prev = None;
        self.node_mut(t).next = Some(h);
        self.node_mut(h).prev = Some(t);
        self.head = Some(t);
    }

    /// Move the head node behind the tail. O(1) link surgery.
    pub fn rotate_head_to_tail(&mut self) {
        if self.len < 2 {
            return;
        }
        let h = self.head.expect("len >= 2 implies a head");
        let new_head = self.node(h).next.expect("len >= 2 implies head.next");
        self.node_mut(new_head).prev = None;
        self.head = Some(new_head);
        let t = self.tail.expect("len >= 2 implies a tail");
        self.node_mut(h).next = None;
        self.node_mut(h).prev = Some(t);
        self.node_mut(t).next = Some(h);
        self.tail = Some(h);
    }

    /// Append every node of `other` to this list's tail, in order. `other`
    /// is left empty but usable. Values move between arenas, so this is
    /// O(len(other)) rather than a pointer splice.
    pub fn join(&mut self, other: &mut List<T>) {
        while let Some(front) = other.front() {
            if let Some(value) = other.remove(front) {
                self.push_back(value);
            }
        }
    }

    /// Clone the list, same order and length. Uses the dup hook when set,
    /// `Clone` otherwise. The hooks themselves are shared with the copy.
    pub fn duplicate(&self) -> List<T>
    where
        T: Clone,
    {
        let mut copy = List::new();
        copy.dup = self.dup.clone();
        copy.matches = self.matches.clone();
        let mut cur = self.cursor(Direction::HeadToTail);
        while let Some(id) = cur.next(self) {
            if let Some(value) = self.get(id) {
                let cloned = match &self.dup {
                    Some(dup) => dup(value),
                    None => value.clone(),
                };
                copy.push_back(cloned);
            }
        }
        copy
    }

    /// First node equal to `key`, walking head to tail. Uses the match hook
    /// when set, `PartialEq` otherwise.
    pub fn search(&self, key: &T) -> Option<NodeId>
    where
        T: PartialEq,
    {
        let mut cur = self.cursor(Direction::HeadToTail);
        while let Some(id) = cur.next(self) {
            let value = self.get(id)?;
            let hit = match &self.matches {
                Some(matches) => matches(value, key),
                None => value == key,
            };
            if hit {
                return Some(id);
            }
        }
        None
    }

    /// Node at position `index`: 0 is the head, -1 the tail, -2 the
    /// penultimate node, and so on.
    pub fn index(&self, index: i64) -> Option<NodeId> {
        if index >= 0 {
            let mut n = self.front();
            for _ in 0..index {
                n = self.next_of(n?);
            }
            n
        } else {
            let mut n = self.back();
            for _ in 0..(-index - 1) {
                n = self.prev_of(n?);
            }
            n
        }
    }

    pub fn cursor(&self, direction: Direction) -> Cursor {
        let start = match direction {
            Direction::HeadToTail => self.head,
            Direction::TailToHead => self.tail,
        };
        Cursor { next: start, direction }
    }

    /// Convenience borrow of every value, head to tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { list: self, cursor: self.cursor(Direction::HeadToTail) }
    }
}

/// Detached iteration state. Holding one does not borrow the list; each step
/// records where to go next before yielding, so removing the yielded node is
/// safe.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    next: Option<usize>,
    direction: Direction,
}

impl Cursor {
    pub fn next<T>(&mut self, list: &List<T>) -> Option<NodeId> {
        let cur = NodeId(self.next?);
        self.next = match self.direction {
            Direction::HeadToTail => list.next_of(cur).map(|n| n.0),
            Direction::TailToHead => list.prev_of(cur).map(|n| n.0),
        };
        Some(cur)
    }
}

pub struct Iter<'a, T> {
    list: &'a List<T>,
    cursor: Cursor,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor.next(self.list)?;
        self.list.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn collect<T: Clone>(list: &List<T>) -> Vec<T> {
        list.iter().cloned().collect()
    }

    #[test]
    fn test_push_and_length_accounting() {
        let mut l: List<i32> = List::new();
        assert!(l.is_empty());
        for i in 0..5 {
            l.push_back(i);
        }
        l.push_front(-1);
        assert_eq!(l.len(), 6);
        assert_eq!(collect(&l), vec![-1, 0, 1, 2, 3, 4]);

        let front = l.front().unwrap();
        let back = l.back().unwrap();
        assert_eq!(l.remove(front), Some(-1));
        assert_eq!(l.remove(back), Some(4));
        assert_eq!(l.len(), 4);
        assert_eq!(collect(&l), vec![0, 1, 2, 3]);
        assert!(l.prev_of(l.front().unwrap()).is_none());
        assert!(l.next_of(l.back().unwrap()).is_none());
    }

    #[test]
    fn test_insert_relative() {
        let mut l: List<&str> = List::new();
        let b = l.push_back("b");
        l.insert_before(b, "a");
        l.insert_after(b, "c");
        assert_eq!(collect(&l), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_twice_is_noop() {
        let mut l: List<u8> = List::new();
        let id = l.push_back(7);
        assert_eq!(l.remove(id), Some(7));
        assert_eq!(l.remove(id), None);
        assert!(l.is_empty());
    }

    #[test]
    fn test_rotations() {
        let mut l: List<i32> = List::new();
        for i in 1..=4 {
            l.push_back(i);
        }
        l.rotate_tail_to_head();
        assert_eq!(collect(&l), vec![4, 1, 2, 3]);
        l.rotate_head_to_tail();
        assert_eq!(collect(&l), vec![1, 2, 3, 4]);

        let mut single: List<i32> = List::new();
        single.push_back(9);
        single.rotate_tail_to_head();
        assert_eq!(collect(&single), vec![9]);
    }

    #[test]
    fn test_join_drains_right() {
        let mut left: List<i32> = List::new();
        let mut right: List<i32> = List::new();
        left.push_back(1);
        left.push_back(2);
        right.push_back(3);
        right.push_back(4);
        left.join(&mut right);
        assert_eq!(collect(&left), vec![1, 2, 3, 4]);
        assert!(right.is_empty());
        right.push_back(5);
        assert_eq!(collect(&right), vec![5]);
    }

    #[test]
    fn test_duplicate_matches_pointwise() {
        let mut l: List<String> = List::new();
        l.push_back("x".to_string());
        l.push_back("y".to_string());
        let copy = l.duplicate();
        assert_eq!(copy.len(), l.len());
        assert_eq!(collect(&copy), collect(&l));
    }

    #[test]
    fn test_duplicate_uses_dup_hook() {
        let mut l: List<String> = List::new();
        l.set_dup(Rc::new(|s: &String| format!("{s}!")));
        l.push_back("a".to_string());
        let copy = l.duplicate();
        assert_eq!(collect(&copy), vec!["a!".to_string()]);
    }

    #[test]
    fn test_search_with_and_without_hook() {
        let mut l: List<(u32, &str)> = List::new();
        l.push_back((1, "one"));
        l.push_back((2, "two"));
        assert_eq!(l.search(&(2, "two")), l.back());

        // Hook that only compares the key half of the pair.
        l.set_match(Rc::new(|v: &(u32, &str), key: &(u32, &str)| v.0 == key.0));
        assert_eq!(l.search(&(2, "ignored")), l.back());
        assert_eq!(l.search(&(3, "ignored")), None);
    }

    #[test]
    fn test_index_from_both_ends() {
        let mut l: List<i32> = List::new();
        for i in 0..4 {
            l.push_back(i);
        }
        assert_eq!(l.get(l.index(0).unwrap()), Some(&0));
        assert_eq!(l.get(l.index(3).unwrap()), Some(&3));
        assert_eq!(l.get(l.index(-1).unwrap()), Some(&3));
        assert_eq!(l.get(l.index(-4).unwrap()), Some(&0));
        assert!(l.index(4).is_none());
        assert!(l.index(-5).is_none());
    }

    #[test]
    fn test_cursor_survives_removal_of_yielded_node() {
        let mut l: List<i32> = List::new();
        for i in 0..5 {
            l.push_back(i);
        }
        let mut cur = l.cursor(Direction::HeadToTail);
        let mut seen = Vec::new();
        while let Some(id) = cur.next(&l) {
            let v = *l.get(id).unwrap();
            seen.push(v);
            if v % 2 == 0 {
                l.remove(id);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(collect(&l), vec![1, 3]);
    }

    #[test]
    fn test_cursor_tail_to_head() {
        let mut l: List<i32> = List::new();
        for i in 0..3 {
            l.push_back(i);
        }
        let mut cur = l.cursor(Direction::TailToHead);
        let mut seen = Vec::new();
        while let Some(id) = cur.next(&l) {
            seen.push(*l.get(id).unwrap());
        }
        assert_eq!(seen, vec![2, 1, 0]);
    }

    #[test]
    fn test_slot_reuse_keeps_links_consistent() {
        let mut l: List<i32> = List::new();
        let a = l.push_back(1);
        l.push_back(2);
        l.remove(a);
        l.push_back(3); // reuses a's slot
        assert_eq!(collect(&l), vec![2, 3]);
        assert_eq!(l.len(), 2);
    }
}
