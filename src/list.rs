//! # Index-Linked Lists
//!
//! Doubly linked lists whose nodes live in a fixed slot array owned
//! elsewhere (the TCB array or the timer pool). Each node embeds a
//! [`Link`] holding the slot indices of its neighbours; a [`List`] only
//! stores head, tail and length. Insert and remove are O(1) given the
//! node index, with no allocation and no raw pointers.
//!
//! A node can be linked into at most one list through a given `Link`.
//! The list does not record which list a node belongs to: callers track
//! membership next to the node and pass the right list back in.

/// Neighbour indices embedded in a list node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

impl Link {
    pub const UNLINKED: Link = Link { prev: None, next: None };
}

/// A slot that can be linked into a [`List`].
pub trait Node {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Head of an index-linked list over a slot array `[N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Append `idx` at the tail.
    pub fn push_back<N: Node>(&mut self, nodes: &mut [N], idx: usize) {
        *nodes[idx].link_mut() = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => nodes[tail].link_mut().next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Insert `idx` immediately before the linked node `at`.
    pub fn insert_before<N: Node>(&mut self, nodes: &mut [N], at: usize, idx: usize) {
        let prev = nodes[at].link().prev;
        *nodes[idx].link_mut() = Link {
            prev,
            next: Some(at),
        };
        nodes[at].link_mut().prev = Some(idx);
        match prev {
            Some(p) => nodes[p].link_mut().next = Some(idx),
            None => self.head = Some(idx),
        }
        self.len += 1;
    }

    /// Insert `idx` before the first node for which `goes_before(idx, node)`
    /// holds, or at the tail. Equal keys keep insertion order.
    pub fn insert_sorted<N, F>(&mut self, nodes: &mut [N], idx: usize, goes_before: F)
    where
        N: Node,
        F: Fn(&N, &N) -> bool,
    {
        let mut cursor = self.head;
        while let Some(at) = cursor {
            if goes_before(&nodes[idx], &nodes[at]) {
                self.insert_before(nodes, at, idx);
                return;
            }
            cursor = nodes[at].link().next;
        }
        self.push_back(nodes, idx);
    }

    /// Unlink `idx`, which must currently be linked into this list.
    pub fn remove<N: Node>(&mut self, nodes: &mut [N], idx: usize) {
        let Link { prev, next } = *nodes[idx].link();
        match prev {
            Some(p) => nodes[p].link_mut().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => nodes[n].link_mut().prev = prev,
            None => self.tail = prev,
        }
        *nodes[idx].link_mut() = Link::UNLINKED;
        self.len -= 1;
    }

    pub fn pop_front<N: Node>(&mut self, nodes: &mut [N]) -> Option<usize> {
        let head = self.head?;
        self.remove(nodes, head);
        Some(head)
    }

    /// Iterate node indices from head to tail.
    pub fn iter<'a, N: Node>(&self, nodes: &'a [N]) -> Iter<'a, N> {
        Iter {
            nodes,
            cursor: self.head,
        }
    }

    /// True if `idx` is reachable from the head.
    pub fn contains<N: Node>(&self, nodes: &[N], idx: usize) -> bool {
        self.iter(nodes).any(|i| i == idx)
    }
}

pub struct Iter<'a, N> {
    nodes: &'a [N],
    cursor: Option<usize>,
}

impl<'a, N: Node> Iterator for Iter<'a, N> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cursor?;
        self.cursor = self.nodes[idx].link().next;
        Some(idx)
    }
}
