// SPDX-License-Identifier: CEPL-1.0
//! Per-frame deferred destruction.
//!
//! Callbacks pushed for a slot run the next time that slot's fence has been
//! waited on, so nothing they destroy can still be referenced by the GPU.

type Deleter<Ctx> = Box<dyn FnOnce(&Ctx)>;

pub struct DeletionQueue<Ctx> {
    slots: Vec<Vec<Deleter<Ctx>>>,
}

impl<Ctx> DeletionQueue<Ctx> {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Vec::new()).collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// An out-of-range slot wraps, so the callback still runs eventually.
    pub fn push(&mut self, slot: usize, f: impl FnOnce(&Ctx) + 'static) {
        let n = self.slots.len();
        if n == 0 {
            self.slots.push(Vec::new());
        }
        let idx = if n == 0 { 0 } else { slot % n };
        self.slots[idx].push(Box::new(f));
    }

    /// Runs the slot's callbacks in insertion order and clears the list.
    pub fn drain(&mut self, slot: usize, ctx: &Ctx) -> usize {
        let Some(list) = self.slots.get_mut(slot) else {
            return 0;
        };
        let pending = std::mem::take(list);
        let n = pending.len();
        for f in pending {
            f(ctx);
        }
        n
    }

    /// Shutdown path: the device must already be idle.
    pub fn drain_all(&mut self, ctx: &Ctx) -> usize {
        (0..self.slots.len()).map(|slot| self.drain(slot, ctx)).sum()
    }

    pub fn len(&self, slot: usize) -> usize {
        self.slots.get(slot).map_or(0, Vec::len)
    }

    pub fn total(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}

impl<Ctx> Drop for DeletionQueue<Ctx> {
    fn drop(&mut self) {
        debug_assert!(self.total() == 0, "DeletionQueue dropped with pending destroys");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Log(RefCell<Vec<&'static str>>);

    #[test]
    fn drains_in_insertion_order() {
        let mut q = DeletionQueue::<Log>::new(2);
        q.push(0, |l: &Log| l.0.borrow_mut().push("a"));
        q.push(0, |l: &Log| l.0.borrow_mut().push("b"));
        q.push(1, |l: &Log| l.0.borrow_mut().push("other"));
        let log = Log::default();
        assert_eq!(q.drain(0, &log), 2);
        assert_eq!(*log.0.borrow(), vec!["a", "b"]);
        assert_eq!(q.len(0), 0);
        assert_eq!(q.len(1), 1);
        q.drain_all(&log);
    }

    #[test]
    fn each_callback_runs_exactly_once() {
        let mut q = DeletionQueue::<Log>::new(3);
        q.push(2, |l: &Log| l.0.borrow_mut().push("staging"));
        let log = Log::default();
        assert_eq!(q.drain(2, &log), 1);
        assert_eq!(q.drain(2, &log), 0);
        assert_eq!(log.0.borrow().len(), 1);
    }

    #[test]
    fn drain_all_empties_every_slot() {
        let mut q = DeletionQueue::<Log>::new(2);
        for slot in 0..4 {
            q.push(slot, |l: &Log| l.0.borrow_mut().push("x"));
        }
        assert_eq!(q.total(), 4);
        let log = Log::default();
        assert_eq!(q.drain_all(&log), 4);
        assert_eq!(q.total(), 0);
    }

    #[test]
    fn unknown_slot_drains_nothing() {
        let mut q = DeletionQueue::<Log>::new(1);
        assert_eq!(q.drain(5, &Log::default()), 0);
    }
}
