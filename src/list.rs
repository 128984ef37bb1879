//! Intrusive doubly-linked list with sentinel head and tail.
//!
//! This is the ordering structure behind the FIFO, LRU and FrozenHot
//! policies. Nodes are heap records linked by raw pointers; the hash index
//! of the owning shard keeps a pointer to the node of every resident key,
//! and all structural edits happen under the shard's list mutex.
//!
//! A node that is not currently linked carries the reserved
//! *out-of-list marker* in its `prev` pointer. The marker lets the eviction
//! and erase paths detect a node that a racing path has already detached,
//! which is what prevents double-unlinks (the `prev != marker` check before
//! every detach).
//!
//! **This module is internal infrastructure.** Every method that takes a
//! node pointer is unsafe and relies on the shard's serialization
//! discipline; the invariants are documented per method.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock;

/// A list node. `key` is copied into the node so tail eviction can find the
/// index entry without chasing the map. `last_access` is the recency stamp
/// read by curve profiling; it is atomic because the profiling read happens
/// outside the list mutex.
pub(crate) struct Node {
    pub key: u64,
    pub last_access: AtomicU64,
    pub prev: *mut Node,
    pub next: *mut Node,
}

/// The reserved sentinel pointer marking a detached node. Never
/// dereferenced.
#[inline]
pub(crate) fn out_of_list_marker() -> *mut Node {
    usize::MAX as *mut Node
}

impl Node {
    /// Allocate a detached node for `key`, stamped with the current time.
    pub fn alloc(key: u64) -> *mut Node {
        Box::into_raw(Box::new(Node {
            key,
            last_access: AtomicU64::new(clock::now_micros()),
            prev: out_of_list_marker(),
            next: ptr::null_mut(),
        }))
    }

    /// Free a node previously produced by [`Node::alloc`].
    ///
    /// # Safety
    ///
    /// `node` must be detached and must not be referenced again.
    pub unsafe fn free(node: *mut Node) {
        drop(Box::from_raw(node));
    }

    /// Whether `node` is currently linked into a list.
    ///
    /// # Safety
    ///
    /// `node` must point to a live node.
    #[inline]
    pub unsafe fn is_in_list(node: *mut Node) -> bool {
        (*node).prev != out_of_list_marker()
    }
}

/// Doubly-linked list with boxed sentinels.
///
/// Not `Sync` by itself: the owning shard wraps it in a mutex.
pub(crate) struct List {
    head: *mut Node,
    tail: *mut Node,
}

// SAFETY: the list owns its sentinel allocations; nodes are only reached
// through shard-serialized paths.
unsafe impl Send for List {}

impl List {
    pub fn new() -> Self {
        let head = Node::alloc(0);
        let tail = Node::alloc(0);
        // SAFETY: both sentinels were just allocated.
        unsafe {
            (*head).prev = ptr::null_mut();
            (*head).next = tail;
            (*tail).prev = head;
            (*tail).next = ptr::null_mut();
        }
        Self { head, tail }
    }

    /// True if `node` is one of this list's sentinels.
    #[inline]
    pub fn is_sentinel(&self, node: *mut Node) -> bool {
        node == self.head || node == self.tail
    }

    /// First real node, or the tail sentinel when empty.
    #[inline]
    pub fn first(&self) -> *mut Node {
        // SAFETY: head sentinel is always valid.
        unsafe { (*self.head).next }
    }

    /// Last real node, or the head sentinel when empty.
    #[inline]
    pub fn back(&self) -> *mut Node {
        // SAFETY: tail sentinel is always valid.
        unsafe { (*self.tail).prev }
    }

    /// The tail sentinel's address, for boundary comparisons by a walker
    /// that traverses the chain outside the mutex.
    #[inline]
    pub fn tail_sentinel(&self) -> *mut Node {
        self.tail
    }

    pub fn is_empty(&self) -> bool {
        self.first() == self.tail
    }

    /// Link `node` directly after the head sentinel.
    ///
    /// # Safety
    ///
    /// `node` must be live and detached.
    pub unsafe fn push_front(&mut self, node: *mut Node) {
        let old = (*self.head).next;
        (*node).prev = self.head;
        (*node).next = old;
        (*old).prev = node;
        (*self.head).next = node;
    }

    /// Link `node` directly after `after`, which must be linked in this
    /// list (a real node or the head sentinel).
    ///
    /// # Safety
    ///
    /// `after` must be linked here; `node` must be live and detached.
    pub unsafe fn push_after(&mut self, after: *mut Node, node: *mut Node) {
        let next = (*after).next;
        (*node).prev = after;
        (*node).next = next;
        (*next).prev = node;
        (*after).next = node;
    }

    /// Unlink `node` and mark it detached.
    ///
    /// # Safety
    ///
    /// `node` must be a real node currently linked in this list.
    pub unsafe fn detach(&mut self, node: *mut Node) {
        let prev = (*node).prev;
        let next = (*node).next;
        (*prev).next = next;
        (*next).prev = prev;
        (*node).prev = out_of_list_marker();
    }

    /// Detach the whole chain of real nodes, returning `(first, last)`.
    /// The chain's internal links stay intact; its end pointers are left
    /// dangling for a subsequent `push_chain_*`.
    ///
    /// # Safety
    ///
    /// The caller must re-link or free every node of the chain.
    pub unsafe fn take_chain(&mut self) -> Option<(*mut Node, *mut Node)> {
        if self.is_empty() {
            return None;
        }
        let first = self.first();
        let last = self.back();
        (*self.head).next = self.tail;
        (*self.tail).prev = self.head;
        Some((first, last))
    }

    /// Splice a chain produced by [`take_chain`](Self::take_chain) in at the
    /// front, preserving its internal order.
    ///
    /// # Safety
    ///
    /// `first..=last` must be a well-formed chain not linked anywhere.
    pub unsafe fn push_chain_front(&mut self, first: *mut Node, last: *mut Node) {
        let old = (*self.head).next;
        (*self.head).next = first;
        (*first).prev = self.head;
        (*last).next = old;
        (*old).prev = last;
    }

    /// Splice a chain in at the back, preserving its internal order.
    ///
    /// # Safety
    ///
    /// `first..=last` must be a well-formed chain not linked anywhere.
    pub unsafe fn push_chain_back(&mut self, first: *mut Node, last: *mut Node) {
        let old = (*self.tail).prev;
        (*old).next = first;
        (*first).prev = old;
        (*last).next = self.tail;
        (*self.tail).prev = last;
    }
}

impl Drop for List {
    fn drop(&mut self) {
        // SAFETY: on drop the shard is exclusively owned; every node linked
        // here is owned by the list and freed exactly once, then the
        // sentinels.
        unsafe {
            let mut node = self.first();
            while node != self.tail {
                let next = (*node).next;
                Node::free(node);
                node = next;
            }
            Node::free(self.head);
            Node::free(self.tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(list: &List) -> Vec<u64> {
        let mut out = Vec::new();
        let mut node = list.first();
        while node != list.tail {
            unsafe {
                out.push((*node).key);
                node = (*node).next;
            }
        }
        out
    }

    #[test]
    fn test_push_front_order() {
        let mut list = List::new();
        assert!(list.is_empty());
        unsafe {
            list.push_front(Node::alloc(1));
            list.push_front(Node::alloc(2));
            list.push_front(Node::alloc(3));
        }
        assert_eq!(keys(&list), vec![3, 2, 1]);
        assert!(!list.is_empty());
    }

    #[test]
    fn test_detach_marks_node() {
        let mut list = List::new();
        let node = Node::alloc(7);
        unsafe {
            list.push_front(node);
            assert!(Node::is_in_list(node));
            list.detach(node);
            assert!(!Node::is_in_list(node));
            assert!(list.is_empty());
            Node::free(node);
        }
    }

    #[test]
    fn test_back_is_oldest() {
        let mut list = List::new();
        unsafe {
            list.push_front(Node::alloc(1));
            list.push_front(Node::alloc(2));
        }
        let back = list.back();
        assert_eq!(unsafe { (*back).key }, 1);
    }

    #[test]
    fn test_push_after() {
        let mut list = List::new();
        let marker = Node::alloc(100);
        unsafe {
            list.push_front(Node::alloc(1));
            list.push_front(marker);
            list.push_front(Node::alloc(2));
            list.push_after(marker, Node::alloc(3));
        }
        assert_eq!(keys(&list), vec![2, 100, 3, 1]);
    }

    #[test]
    fn test_take_and_splice_chain() {
        let mut a = List::new();
        let mut b = List::new();
        unsafe {
            a.push_front(Node::alloc(1));
            a.push_front(Node::alloc(2));
            a.push_front(Node::alloc(3));
            b.push_front(Node::alloc(9));

            let (first, last) = a.take_chain().unwrap();
            assert!(a.is_empty());
            b.push_chain_front(first, last);
        }
        assert_eq!(keys(&b), vec![3, 2, 1, 9]);
        assert!(unsafe { a.take_chain() }.is_none());
    }

    #[test]
    fn test_push_chain_back() {
        let mut a = List::new();
        let mut b = List::new();
        unsafe {
            a.push_front(Node::alloc(1));
            a.push_front(Node::alloc(2));
            b.push_front(Node::alloc(9));

            let (first, last) = a.take_chain().unwrap();
            b.push_chain_back(first, last);
        }
        assert_eq!(keys(&b), vec![9, 2, 1]);
    }

    #[test]
    fn test_drop_frees_everything() {
        // Exercised under the leak checks of the test harness: drop with
        // linked nodes must free them all.
        let mut list = List::new();
        for i in 0..32 {
            unsafe { list.push_front(Node::alloc(i)) };
        }
        drop(list);
    }
}
