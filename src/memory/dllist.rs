//! Intrusive doubly-linked list over index-addressed nodes.
//!
//! Nodes embed a [`Link`] and live in caller-owned storage (a `Vec` of chunk
//! metadata); the list itself only records head, tail and length. Links are
//! indices, not addresses, so a stale link can at worst name the wrong node,
//! never dangle.

/// Sentinel index meaning "no node".
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: u32,
    pub next: u32,
}

impl Link {
    pub const fn detached() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::detached()
    }
}

/// Storage that can hand out the embedded [`Link`] of node `id`.
pub(crate) trait LinkStore {
    fn link(&self, id: u32) -> &Link;
    fn link_mut(&mut self, id: u32) -> &mut Link;
}

impl LinkStore for [Link] {
    fn link(&self, id: u32) -> &Link {
        &self[id as usize]
    }

    fn link_mut(&mut self, id: u32) -> &mut Link {
        &mut self[id as usize]
    }
}

#[derive(Debug)]
pub(crate) struct IndexList {
    head: u32,
    tail: u32,
    len: usize,
}

impl Default for IndexList {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexList {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn front(&self) -> Option<u32> {
        (self.head != NIL).then_some(self.head)
    }

    #[inline]
    pub fn back(&self) -> Option<u32> {
        (self.tail != NIL).then_some(self.tail)
    }

    /// Link a detached node at the head.
    pub fn push_front<S: LinkStore + ?Sized>(&mut self, store: &mut S, id: u32) {
        debug_assert_eq!(*store.link(id), Link::detached(), "node {id} is still linked");
        let old_head = self.head;
        *store.link_mut(id) = Link {
            prev: NIL,
            next: old_head,
        };
        if old_head == NIL {
            self.tail = id;
        } else {
            store.link_mut(old_head).prev = id;
        }
        self.head = id;
        self.len += 1;
    }

    /// Link a detached node at the tail.
    #[cfg(test)]
    pub fn push_back<S: LinkStore + ?Sized>(&mut self, store: &mut S, id: u32) {
        debug_assert_eq!(*store.link(id), Link::detached(), "node {id} is still linked");
        let old_tail = self.tail;
        *store.link_mut(id) = Link {
            prev: old_tail,
            next: NIL,
        };
        if old_tail == NIL {
            self.head = id;
        } else {
            store.link_mut(old_tail).next = id;
        }
        self.tail = id;
        self.len += 1;
    }

    /// Unlink `id`, which must currently be a member of this list.
    pub fn remove<S: LinkStore + ?Sized>(&mut self, store: &mut S, id: u32) {
        let Link { prev, next } = *store.link(id);

        if prev == NIL {
            debug_assert_eq!(self.head, id, "node {id} is not the head of this list");
            self.head = next;
        } else {
            store.link_mut(prev).next = next;
        }

        if next == NIL {
            debug_assert_eq!(self.tail, id, "node {id} is not the tail of this list");
            self.tail = prev;
        } else {
            store.link_mut(next).prev = prev;
        }

        *store.link_mut(id) = Link::detached();
        self.len -= 1;
    }

    pub fn pop_front<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<u32> {
        let id = self.front()?;
        self.remove(store, id);
        Some(id)
    }

    #[cfg(test)]
    pub fn pop_back<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<u32> {
        let id = self.back()?;
        self.remove(store, id);
        Some(id)
    }

    /// Splice every node of `other` onto the tail of `self`, leaving `other`
    /// empty. O(1).
    pub fn append<S: LinkStore + ?Sized>(&mut self, store: &mut S, other: &mut Self) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            std::mem::swap(self, other);
            return;
        }
        store.link_mut(self.tail).next = other.head;
        store.link_mut(other.head).prev = self.tail;
        self.tail = other.tail;
        self.len += other.len;
        *other = Self::new();
    }

    /// Walk the list from head to tail.
    #[cfg(test)]
    pub fn iter<'a, S: LinkStore + ?Sized>(&self, store: &'a S) -> Iter<'a, S> {
        Iter {
            store,
            cursor: self.head,
        }
    }
}

#[cfg(test)]
pub(crate) struct Iter<'a, S: ?Sized> {
    store: &'a S,
    cursor: u32,
}

#[cfg(test)]
impl<S: LinkStore + ?Sized> Iterator for Iter<'_, S> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.store.link(id).next;
        Some(id)
    }
}
