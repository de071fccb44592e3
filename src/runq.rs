// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The run queue set.
//!
//! There are `NQS` run queues per scheduling class. Entities are appended
//! to the tail of their queue and taken from the head, giving FIFO order
//! within a priority level. When a queue is non-empty the corresponding bit
//! is set in its class's occupancy mask, so a single bit scan finds the
//! best busy queue.
//!
//! Queues are intrusive doubly-linked lists threaded through a fixed slot
//! arena. The arena also serves as the registry of all live entities, and
//! the entity's `LwpId` is its slot index. Nothing here allocates once the
//! arena has been created, which keeps every critical section under the
//! scheduler lock short and bounded.

use crate::cpumask::CpuSet;
use crate::lwp::Lwp;
use crate::lwp::LwpRef;
use crate::lwp::QueueClass;
use crate::types::*;

const NIL: u32 = u32::MAX;

#[derive(Debug)]
struct Slot {
    lwp: Option<LwpRef>,
    reserved: bool,
    prev: u32,
    next: u32,
}

#[derive(Debug)]
pub struct RunQueues {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: [[u32; NQS]; NR_CLASSES],
    tail: [[u32; NQS]; NR_CLASSES],
    bits: [u32; NR_CLASSES],
    count: usize,
}

impl RunQueues {
    pub fn new(max_lwps: usize) -> Self {
        let slots = (0..max_lwps)
            .map(|_| Slot {
                lwp: None,
                reserved: false,
                prev: NIL,
                next: NIL,
            })
            .collect();
        // Lowest ids are handed out first.
        let free = (0..max_lwps as u32).rev().collect();
        Self {
            slots,
            free,
            head: [[NIL; NQS]; NR_CLASSES],
            tail: [[NIL; NQS]; NR_CLASSES],
            bits: [0; NR_CLASSES],
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve a slot for an entity about to be created.
    pub fn reserve(&mut self) -> Option<LwpId> {
        let slot = self.free.pop()?;
        self.slots[slot as usize].reserved = true;
        Some(LwpId(slot))
    }

    /// Give back a reserved slot that was never installed.
    pub fn unreserve(&mut self, id: LwpId) {
        let slot = &mut self.slots[id.index()];
        assert!(
            slot.reserved && slot.lwp.is_none(),
            "bsd4: unreserve of live slot {}",
            id
        );
        slot.reserved = false;
        self.free.push(id.0);
    }

    /// Install an entity into the slot reserved for it.
    pub fn install(&mut self, lwp: LwpRef) {
        let slot = &mut self.slots[lwp.id().index()];
        assert!(
            slot.reserved && slot.lwp.is_none(),
            "bsd4: install of lwp {} into an unreserved slot",
            lwp.id()
        );
        slot.lwp = Some(lwp);
    }

    /// Drop the registry reference of an exiting entity. The entity must
    /// already be off the queues.
    pub fn remove(&mut self, id: LwpId) -> Option<LwpRef> {
        let slot = self.slots.get_mut(id.index())?;
        let lwp = slot.lwp.take()?;
        assert!(!lwp.on_queue(), "bsd4: removing queued lwp {}", id);
        slot.reserved = false;
        slot.prev = NIL;
        slot.next = NIL;
        self.free.push(id.0);
        Some(lwp)
    }

    pub fn get(&self, id: LwpId) -> Option<&LwpRef> {
        self.slots.get(id.index())?.lwp.as_ref()
    }

    /// All registered entities in id order.
    pub fn lwps(&self) -> impl Iterator<Item = &LwpRef> {
        self.slots.iter().filter_map(|s| s.lwp.as_ref())
    }

    /// Number of queued entities.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bits(&self, class: QueueClass) -> u32 {
        self.bits[class.index()]
    }

    pub fn bucket_len(&self, class: QueueClass, index: usize) -> usize {
        let mut n = 0;
        let mut cur = self.head[class.index()][index];
        while cur != NIL {
            n += 1;
            cur = self.slots[cur as usize].next;
        }
        n
    }

    fn check_registered(&self, lwp: &Lwp) {
        match self.get(lwp.id()) {
            Some(reg) if std::ptr::eq(reg.as_ref(), lwp) => {}
            _ => panic!("bsd4: lwp {} is not registered with this scheduler", lwp),
        }
    }

    /// Append to the tail of the entity's queue.
    pub fn enqueue(&mut self, lwp: &Lwp) {
        assert!(!lwp.on_queue(), "bsd4: lwp {} already on runq", lwp);
        self.check_registered(lwp);

        let class = lwp.queue_class().index();
        let index = lwp.queue_index();
        let id = lwp.id().0;

        let tail = self.tail[class][index];
        {
            let slot = &mut self.slots[id as usize];
            slot.prev = tail;
            slot.next = NIL;
        }
        if tail == NIL {
            self.head[class][index] = id;
        } else {
            self.slots[tail as usize].next = id;
        }
        self.tail[class][index] = id;
        self.bits[class] |= 1 << index;
        self.count += 1;
        lwp.set_on_queue(true);
    }

    /// Unlink the entity from its queue.
    pub fn dequeue(&mut self, lwp: &Lwp) {
        assert!(lwp.on_queue(), "bsd4: lwp {} not on runq", lwp);
        self.check_registered(lwp);

        let class = lwp.queue_class().index();
        let index = lwp.queue_index();
        let id = lwp.id().0;
        let (prev, next) = {
            let slot = &mut self.slots[id as usize];
            let links = (slot.prev, slot.next);
            slot.prev = NIL;
            slot.next = NIL;
            links
        };

        if prev == NIL {
            assert_eq!(
                self.head[class][index], id,
                "bsd4: runq {}/{} corrupted",
                class, index
            );
            self.head[class][index] = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail[class][index] = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }

        if self.head[class][index] == NIL {
            assert!(
                self.bits[class] & (1 << index) != 0,
                "bsd4: remove from empty queue {}/{}",
                class,
                index
            );
            self.bits[class] &= !(1 << index);
        }
        self.count -= 1;
        lwp.set_on_queue(false);
    }

    /// All queued entities, best class and queue first, FIFO within a
    /// queue.
    pub fn iter(&self) -> RunQueueIter<'_> {
        RunQueueIter {
            rq: self,
            class: 0,
            pending: self.bits[0],
            cur: NIL,
        }
    }

    /// The entity queued right behind `lwp` in the same queue.
    pub fn next_in_queue(&self, lwp: &Lwp) -> Option<&LwpRef> {
        if !lwp.on_queue() {
            return None;
        }
        let next = self.slots[lwp.id().index()].next;
        if next == NIL {
            None
        } else {
            self.slots[next as usize].lwp.as_ref()
        }
    }

    /// Find the best queued entity that may run on any CPU of
    /// `cpu_affinity`. If `exclude` is within one queue of the winner,
    /// `None` is returned so that the incumbent is kept rather than
    /// bouncing between the two.
    pub fn pick_best(&self, cpu_affinity: CpuSet, exclude: Option<&Lwp>) -> Option<LwpRef> {
        let lp = self
            .iter()
            .find(|lp| lp.affinity().intersects(cpu_affinity))?;
        if let Some(chk) = exclude {
            if chk.priority() < lp.priority() + PPQ {
                return None;
            }
        }
        Some(lp.clone())
    }

    /// Priority of the best queue holding an entity allowed on
    /// `cpu_affinity`, at queue granularity.
    pub fn best_queued_pri(&self, cpu_affinity: CpuSet) -> Option<u32> {
        self.iter()
            .find(|lp| lp.affinity().intersects(cpu_affinity))
            .map(|lp| pri_bucket(lp.priority()))
    }
}

pub struct RunQueueIter<'a> {
    rq: &'a RunQueues,
    class: usize,
    pending: u32,
    cur: u32,
}

impl<'a> Iterator for RunQueueIter<'a> {
    type Item = &'a LwpRef;

    fn next(&mut self) -> Option<&'a LwpRef> {
        while self.cur == NIL {
            if self.pending == 0 {
                self.class += 1;
                if self.class >= NR_CLASSES {
                    return None;
                }
                self.pending = self.rq.bits[self.class];
                continue;
            }
            let index = self.pending.trailing_zeros() as usize;
            self.pending &= !(1 << index);
            self.cur = self.rq.head[self.class][index];
        }
        let slot = &self.rq.slots[self.cur as usize];
        self.cur = slot.next;
        slot.lwp.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lwp::RtPrio;

    fn add(rq: &mut RunQueues, class: QueueClass, pri: u32, affinity: u64) -> LwpRef {
        let id = rq.reserve().unwrap();
        let lp = Arc::new(Lwp::new(
            id,
            "t",
            RtPrio::normal(),
            0,
            CpuSet::from_bits(affinity),
            CpuId(0),
            0,
        ));
        lp.set_placement(class, pri);
        rq.install(lp.clone());
        lp
    }

    fn check_bits(rq: &RunQueues) {
        for class in QueueClass::ALL {
            for index in 0..NQS {
                let busy = rq.bits(class) & (1 << index) != 0;
                assert_eq!(busy, rq.bucket_len(class, index) > 0);
            }
        }
    }

    #[test]
    fn test_fifo_within_queue() {
        let mut rq = RunQueues::new(8);
        let a = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 8, 1);
        let b = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 9, 1);
        rq.enqueue(&a);
        rq.enqueue(&b);
        check_bits(&rq);
        assert_eq!(rq.pick_best(CpuSet::from_bits(1), None).unwrap().id(), a.id());
        rq.dequeue(&a);
        assert_eq!(rq.pick_best(CpuSet::from_bits(1), None).unwrap().id(), b.id());
        rq.dequeue(&b);
        check_bits(&rq);
        assert!(rq.is_empty());
        assert!(!a.on_queue() && !b.on_queue());
    }

    #[test]
    fn test_class_order_and_affinity() {
        let mut rq = RunQueues::new(8);
        let idle = add(&mut rq, QueueClass::Idle, PRIBASE_IDLE, 0b11);
        let norm = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 40, 0b10);
        let rt = add(&mut rq, QueueClass::Realtime, 100, 0b10);
        for lp in [&idle, &norm, &rt] {
            rq.enqueue(lp);
        }
        assert_eq!(rq.pick_best(CpuSet::from_bits(0b10), None).unwrap().id(), rt.id());
        assert_eq!(rq.pick_best(CpuSet::from_bits(0b01), None).unwrap().id(), idle.id());
        let order: Vec<LwpId> = rq.iter().map(|lp| lp.id()).collect();
        assert_eq!(order, vec![rt.id(), norm.id(), idle.id()]);
        assert_eq!(rq.best_queued_pri(CpuSet::from_bits(0b01)), Some(PRIBASE_IDLE));
    }

    #[test]
    fn test_exclude_keeps_close_incumbent() {
        let mut rq = RunQueues::new(8);
        let q = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 20, 1);
        let close = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 22, 1);
        let far = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL + 24, 1);
        rq.enqueue(&q);
        assert!(rq.pick_best(CpuSet::from_bits(1), Some(&close)).is_none());
        assert_eq!(
            rq.pick_best(CpuSet::from_bits(1), Some(&far)).unwrap().id(),
            q.id()
        );
    }

    #[test]
    fn test_middle_removal() {
        let mut rq = RunQueues::new(8);
        let lps: Vec<LwpRef> = (0..3)
            .map(|_| add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL, 1))
            .collect();
        for lp in lps.iter() {
            rq.enqueue(lp);
        }
        assert_eq!(rq.next_in_queue(&lps[0]).unwrap().id(), lps[1].id());
        rq.dequeue(&lps[1]);
        assert_eq!(rq.next_in_queue(&lps[0]).unwrap().id(), lps[2].id());
        assert_eq!(rq.bucket_len(QueueClass::Normal, 0), 2);
        rq.dequeue(&lps[2]);
        rq.enqueue(&lps[1]);
        let order: Vec<LwpId> = rq.iter().map(|lp| lp.id()).collect();
        assert_eq!(order, vec![lps[0].id(), lps[1].id()]);
        check_bits(&rq);
    }

    #[test]
    #[should_panic(expected = "already on runq")]
    fn test_double_enqueue_is_fatal() {
        let mut rq = RunQueues::new(2);
        let a = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL, 1);
        rq.enqueue(&a);
        rq.enqueue(&a);
    }

    #[test]
    #[should_panic(expected = "not on runq")]
    fn test_dequeue_unqueued_is_fatal() {
        let mut rq = RunQueues::new(2);
        let a = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL, 1);
        rq.dequeue(&a);
    }

    #[test]
    fn test_registry_reuse() {
        let mut rq = RunQueues::new(1);
        let a = add(&mut rq, QueueClass::Normal, PRIBASE_NORMAL, 1);
        assert!(rq.reserve().is_none());
        assert!(rq.remove(a.id()).is_some());
        assert_eq!(rq.reserve(), Some(a.id()));
    }
}
