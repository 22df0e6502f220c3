//! Idle-flow expiration wheel.
//!
//! A circular array of buckets, one singly-linked list of FCBs per bucket,
//! linked intrusively through `Fcb::next_idx`. The owning worker advances
//! the wheel one bucket per recycle tick and decides the fate of every entry
//! in the current bucket through a visitor.

use crate::flowtrack::arena::{FcbArena, FlowId};

/// The visitor's verdict for one scheduled FCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// Drop the entry from the wheel; the visitor has reclaimed it.
    Expire,
    /// Re-link the entry `ticks` buckets ahead of the current one.
    Reschedule(u32),
    /// Leave the entry in the current bucket, to be revisited after a full
    /// wheel revolution.
    Keep,
}

pub(crate) struct TimerWheel {
    /// Head of the intrusive list per bucket.
    buckets: Vec<Option<FlowId>>,
    /// Index of the bucket for the current tick.
    head: usize,
    mask: usize,
}

impl TimerWheel {
    /// Creates a wheel able to span `timeout_ticks` ticks, with slack so a
    /// full-timeout reschedule never lands on the bucket being walked.
    pub(crate) fn new(timeout_ticks: u32) -> Self {
        let nb_buckets = (timeout_ticks as usize + 2).next_power_of_two();
        TimerWheel {
            buckets: vec![None; nb_buckets],
            head: 0,
            mask: nb_buckets - 1,
        }
    }

    pub(crate) fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Links `id` into the bucket `ticks` ahead of the current one.
    ///
    /// The caller guarantees the FCB is not already scheduled; scheduling it
    /// twice would corrupt both bucket lists.
    pub(crate) fn schedule_after(&mut self, arena: &mut FcbArena, id: FlowId, ticks: u32) {
        let ticks = ticks.max(1) as usize;
        debug_assert!(ticks <= self.mask);
        let bucket = (self.head + ticks) & self.mask;
        let fcb = arena.slot_mut(id);
        assert!(!fcb.scheduled, "FCB {} already scheduled", id);
        fcb.next_idx = self.buckets[bucket];
        fcb.scheduled = true;
        self.buckets[bucket] = Some(id);
    }

    /// Advances the wheel one tick and walks the expiring bucket in reverse
    /// insertion order, applying `visit` to each entry.
    pub(crate) fn tick<F>(&mut self, arena: &mut FcbArena, mut visit: F)
    where
        F: FnMut(&mut FcbArena, FlowId) -> TimerAction,
    {
        self.head = (self.head + 1) & self.mask;
        let mut cur = self.buckets[self.head].take();
        while let Some(id) = cur {
            {
                let fcb = arena.slot_mut(id);
                cur = fcb.next_idx.take();
                fcb.scheduled = false;
            }
            match visit(arena, id) {
                TimerAction::Expire => {}
                TimerAction::Reschedule(ticks) => {
                    debug_assert!((self.head + ticks.max(1) as usize) & self.mask != self.head);
                    self.schedule_after(arena, id, ticks);
                }
                TimerAction::Keep => {
                    let fcb = arena.slot_mut(id);
                    fcb.next_idx = self.buckets[self.head];
                    fcb.scheduled = true;
                    self.buckets[self.head] = Some(id);
                }
            }
        }
    }

    /// Unlinks everything; used when draining a manager.
    pub(crate) fn clear(&mut self, arena: &mut FcbArena) {
        for bucket in self.buckets.iter_mut() {
            let mut cur = bucket.take();
            while let Some(id) = cur {
                let fcb = arena.slot_mut(id);
                cur = fcb.next_idx.take();
                fcb.scheduled = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(capacity: u32, timeout_ticks: u32) -> (FcbArena, TimerWheel) {
        (FcbArena::new(capacity, 0), TimerWheel::new(timeout_ticks))
    }

    #[test]
    fn sizes_to_power_of_two_with_slack() {
        let wheel = TimerWheel::new(60);
        assert_eq!(wheel.num_buckets(), 64);
        let wheel = TimerWheel::new(62);
        assert_eq!(wheel.num_buckets(), 64);
        let wheel = TimerWheel::new(63);
        assert_eq!(wheel.num_buckets(), 128);
    }

    #[test]
    fn expires_at_the_scheduled_tick() {
        let (mut arena, mut wheel) = setup(4, 8);
        wheel.schedule_after(&mut arena, 0, 3);
        let mut fired = vec![];
        for tick in 1..=4 {
            wheel.tick(&mut arena, |_, id| {
                fired.push((tick, id));
                TimerAction::Expire
            });
        }
        assert_eq!(fired, vec![(3, 0)]);
        assert!(!arena.slot(0).scheduled);
    }

    #[test]
    fn reschedule_moves_the_deadline() {
        let (mut arena, mut wheel) = setup(4, 8);
        wheel.schedule_after(&mut arena, 1, 1);
        let mut expirations = vec![];
        for tick in 1..=5 {
            wheel.tick(&mut arena, |_, id| {
                if tick < 3 {
                    TimerAction::Reschedule(2)
                } else {
                    expirations.push((tick, id));
                    TimerAction::Expire
                }
            });
        }
        assert_eq!(expirations, vec![(3, 1)]);
    }

    #[test]
    fn keep_revisits_after_a_revolution() {
        let (mut arena, mut wheel) = setup(4, 2);
        // 4 buckets.
        assert_eq!(wheel.num_buckets(), 4);
        wheel.schedule_after(&mut arena, 2, 1);
        let mut visits = vec![];
        for tick in 1..=8 {
            wheel.tick(&mut arena, |_, id| {
                visits.push((tick, id));
                if visits.len() < 2 {
                    TimerAction::Keep
                } else {
                    TimerAction::Expire
                }
            });
        }
        assert_eq!(visits, vec![(1, 2), (5, 2)]);
    }

    #[test]
    fn walks_in_reverse_insertion_order() {
        let (mut arena, mut wheel) = setup(4, 8);
        wheel.schedule_after(&mut arena, 0, 2);
        wheel.schedule_after(&mut arena, 1, 2);
        wheel.schedule_after(&mut arena, 2, 2);
        let mut order = vec![];
        wheel.tick(&mut arena, |_, _| TimerAction::Expire);
        wheel.tick(&mut arena, |_, id| {
            order.push(id);
            TimerAction::Expire
        });
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    #[should_panic(expected = "already scheduled")]
    fn double_schedule_asserts() {
        let (mut arena, mut wheel) = setup(4, 8);
        wheel.schedule_after(&mut arena, 0, 2);
        wheel.schedule_after(&mut arena, 0, 3);
    }
}
