//! Expiry-ordered timer list.
//!
//! A doubly linked list kept sorted ascending by expiry, with nodes stored in
//! an arena and addressed by [`TimerId`] (slot index + generation) instead of
//! pointers. Equal expiries keep insertion order. The reactor owns the only
//! instance, so nothing here is synchronized.

use std::time::Instant;

/// Handle to a timer in a [`TimerList`]. Becomes stale once the timer is
/// removed or fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Node<T> {
    expire: Instant,
    payload: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

#[derive(Debug)]
pub struct TimerList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a timer. Constant time when it expires no earlier than the
    /// current tail (the usual case: every new timer is `now + timeout`) or
    /// strictly before the head.
    pub fn add(&mut self, expire: Instant, payload: T) -> TimerId {
        let index = self.alloc(Node {
            expire,
            payload,
            prev: None,
            next: None,
        });

        match (self.head, self.tail) {
            (Some(head), Some(tail)) => {
                if expire < self.node(head).expire {
                    self.link_front(index);
                } else if expire >= self.node(tail).expire {
                    self.link_back(index);
                } else {
                    self.insert_after(index, head);
                }
            }
            _ => {
                self.head = Some(index);
                self.tail = Some(index);
            }
        }

        self.len += 1;
        TimerId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Move a timer to `expire`, normally later than before. The timer is
    /// re-linked starting from its old successor, so renewing the most
    /// recently touched connection costs a short walk towards the tail.
    /// Returns `false` for a stale id.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        if !self.contains(id) {
            return false;
        }
        let index = id.index;
        self.node_mut(index).expire = expire;

        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        if let Some(prev) = prev {
            if expire < self.node(prev).expire {
                // Moved backwards: nothing ahead of us is a valid start.
                self.unlink(index);
                self.relink(index);
                return true;
            }
        }

        match next {
            None => true,
            Some(next) if expire < self.node(next).expire => true,
            Some(next) => {
                self.unlink(index);
                self.insert_after(index, next);
                true
            }
        }
    }

    /// Unlink and drop a timer in constant time, returning its payload.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id.index);
        Some(self.release(id.index))
    }

    /// Fire every timer with `expire <= now`, head first. Each timer is
    /// unlinked before `on_expire` receives its payload; the walk stops at
    /// the first timer still in the future. Returns how many fired.
    pub fn tick(&mut self, now: Instant, mut on_expire: impl FnMut(T)) -> usize {
        let mut fired = 0;
        while let Some(head) = self.head {
            if now < self.node(head).expire {
                break;
            }
            self.unlink(head);
            let payload = self.release(head);
            on_expire(payload);
            fired += 1;
        }
        fired
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.slots
            .get(id.index)
            .is_some_and(|slot| slot.generation == id.generation && slot.node.is_some())
    }

    pub fn expire_of(&self, id: TimerId) -> Option<Instant> {
        if !self.contains(id) {
            return None;
        }
        Some(self.node(id.index).expire)
    }

    pub fn peek_expire(&self) -> Option<Instant> {
        self.head.map(|head| self.node(head).expire)
    }

    /// Timers in expiry order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    // ---- arena ----

    fn alloc(&mut self, node: Node<T>) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> T {
        let slot = &mut self.slots[index];
        slot.generation += 1;
        let node = slot.node.take();
        self.free.push(index);
        self.len -= 1;
        match node {
            Some(node) => node.payload,
            None => unreachable!("released an empty timer slot"),
        }
    }

    fn node(&self, index: usize) -> &Node<T> {
        match &self.slots[index].node {
            Some(node) => node,
            None => unreachable!("linked index points at a free slot"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match &mut self.slots[index].node {
            Some(node) => node,
            None => unreachable!("linked index points at a free slot"),
        }
    }

    // ---- links ----

    fn link_front(&mut self, index: usize) {
        let old = self.head;
        {
            let node = self.node_mut(index);
            node.prev = None;
            node.next = old;
        }
        match old {
            Some(old) => self.node_mut(old).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn link_back(&mut self, index: usize) {
        let old = self.tail;
        {
            let node = self.node_mut(index);
            node.next = None;
            node.prev = old;
        }
        match old {
            Some(old) => self.node_mut(old).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    /// Insert `index` somewhere after `start`. Requires
    /// `start.expire <= index.expire`.
    fn insert_after(&mut self, index: usize, start: usize) {
        let expire = self.node(index).expire;
        let mut prev = start;
        let mut cursor = self.node(start).next;

        while let Some(current) = cursor {
            if expire < self.node(current).expire {
                self.node_mut(prev).next = Some(index);
                self.node_mut(current).prev = Some(index);
                let node = self.node_mut(index);
                node.prev = Some(prev);
                node.next = Some(current);
                return;
            }
            prev = current;
            cursor = self.node(current).next;
        }

        self.link_back(index);
    }

    /// Link an unlinked node at its sorted position, scanning from the head.
    fn relink(&mut self, index: usize) {
        let expire = self.node(index).expire;
        match self.head {
            None => {
                self.head = Some(index);
                self.tail = Some(index);
            }
            Some(head) if expire < self.node(head).expire => self.link_front(index),
            Some(head) => self.insert_after(index, head),
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;
    }
}

pub struct Iter<'a, T> {
    list: &'a TimerList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Instant, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.node(index);
        self.cursor = node.next;
        Some((node.expire, &node.payload))
    }
}
