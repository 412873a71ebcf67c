// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::ptr::NonNull;

use cordyceps::List;

use crate::loom::sync::atomic::Ordering;
use crate::time::Ticks;
use crate::time::timer::entry::Entry;
use crate::time::timer::{Core, Deadline};

/// One level of the hierarchical timing wheel.
#[derive(Debug)]
pub(super) struct Wheel {
    /// A bitmap of the occupied slots; the least-significant bit is slot
    /// zero.
    ///
    /// See <https://lwn.net/Articles/646056/> for details on this strategy.
    occupied_slots: u64,
    slots: [List<Entry>; Wheel::SLOTS],
    /// This wheel's level.
    level: usize,
    /// The number of ticks represented by a single slot in this wheel.
    ticks_per_slot: Ticks,
    /// The number of ticks represented by this entire wheel.
    ticks_per_wheel: Ticks,
    /// A bitmask for masking out all lower wheels' indices from a `now`
    /// timestamp.
    wheel_mask: u64,
}

impl Wheel {
    /// The number of slots per wheel is fixed at 64, so a single `u64`
    /// bitmap can track slot occupancy.
    pub(super) const SLOTS: usize = 64;
    pub(super) const BITS: usize = Self::SLOTS.trailing_zeros() as usize;

    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot and level indices are at most 64"
    )]
    pub(super) const fn new(level: usize) -> Self {
        // how many ticks does a single slot represent in a wheel of this
        // level?
        let ticks_per_slot = Ticks((Self::SLOTS as u64).pow(level as u32));
        let ticks_per_wheel = Ticks(ticks_per_slot.0 * Self::SLOTS as u64);

        debug_assert!(ticks_per_slot.0.is_power_of_two());
        debug_assert!(ticks_per_wheel.0.is_power_of_two());

        // because `ticks_per_wheel` is a power of two, this mask strips the
        // indices of all lower wheels out of a timestamp.
        let wheel_mask = !(ticks_per_wheel.0 - 1);
        let slots = [const { List::new() }; Self::SLOTS];

        Self {
            level,
            ticks_per_slot,
            ticks_per_wheel,
            wheel_mask,
            occupied_slots: 0,
            slots,
        }
    }

    pub(super) fn insert(&mut self, deadline: Ticks, ptr: NonNull<Entry>) {
        let slot = self.slot_index(deadline);
        self.slots[slot].push_front(ptr);
        self.fill_slot(slot);
    }

    pub(super) fn remove(&mut self, deadline: Ticks, entry: Pin<&mut Entry>) {
        let slot = self.slot_index(deadline);
        // Safety: the `NonNull` is only used to unlink the entry from this
        // list, never to move it; we know the entry is linked into this slot
        // because its deadline mapped here and its registered bit is set.
        unsafe {
            let entry = NonNull::from(Pin::into_inner_unchecked(entry));
            if let Some(entry) = self.slots[slot].remove(entry) {
                let _did_unlink = entry.as_ref().is_registered.compare_exchange(
                    true,
                    false,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                debug_assert!(
                    _did_unlink.is_ok(),
                    "removed an entry whose registered bit was already unset"
                );
            }
        };

        if self.slots[slot].is_empty() {
            self.clear_slot(slot);
        }
    }

    pub(super) fn next_deadline(&self, now: Ticks) -> Option<Deadline> {
        let distance = self.next_slot_distance(now)?;

        let slot = distance % Self::SLOTS;
        // does the next occupied slot wrap this wheel around from the `now`
        // slot?
        let skipped = distance.saturating_sub(Self::SLOTS);

        debug_assert!(
            distance < Self::SLOTS * 2,
            "distance must be less than 2*{}, but found {distance}",
            Self::SLOTS
        );
        debug_assert!(
            skipped == 0 || self.level == Core::WHEELS - 1,
            "if the next expiring slot wraps around, we must be on the top level wheel\
            \n    dist: {distance}\
            \n    slot: {slot}\
            \n skipped: {skipped}\
            \n   level: {}",
            self.level,
        );

        // when did the current rotation of this wheel begin? all wheels span
        // a power-of-two number of ticks, so masking out the lower wheels'
        // bits recovers the rotation start.
        let rotation_start = now.0 & self.wheel_mask;
        let ticks = {
            let skipped_ticks = skipped as u64 * self.ticks_per_wheel.0;
            Ticks(rotation_start + (slot as u64 * self.ticks_per_slot.0) + skipped_ticks)
        };

        Some(Deadline {
            ticks,
            slot,
            wheel: self.level,
        })
    }

    /// Take all entries out of `slot`, clearing its occupied bit.
    pub(super) fn take_slot(&mut self, slot: usize) -> List<Entry> {
        debug_assert!(
            self.occupied_slots & (1 << slot) != 0,
            "taking an unoccupied slot!"
        );
        let list = self.slots[slot].split_off(0);
        debug_assert!(
            !list.is_empty(),
            "if a slot is occupied, its list must not be empty"
        );
        self.clear_slot(slot);
        list
    }

    /// Returns the distance (in slots from `now`) of the next occupied slot.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot indices are at most 64"
    )]
    fn next_slot_distance(&self, now: Ticks) -> Option<usize> {
        if self.occupied_slots == 0 {
            return None;
        }

        // reduce a wrapped distance back into this rotation: the wrapped
        // slot's computed deadline lands in the past, which makes the next
        // turn process it immediately and reschedule its entries where they
        // belong.
        let now_slot = (now.0 / self.ticks_per_slot.0) as u32 % Self::SLOTS as u32;
        let next_dist = next_set_bit(self.occupied_slots, now_slot)? % Self::SLOTS;

        Some(next_dist)
    }

    fn clear_slot(&mut self, slot_index: usize) {
        debug_assert!(slot_index < Self::SLOTS);
        self.occupied_slots &= !(1 << slot_index);
    }

    fn fill_slot(&mut self, slot_index: usize) {
        debug_assert!(slot_index < Self::SLOTS);
        self.occupied_slots |= 1 << slot_index;
    }

    /// Returns the slot index a deadline maps to on this wheel.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot indices are at most 64"
    )]
    const fn slot_index(&self, ticks: Ticks) -> usize {
        let shift = self.level * Self::BITS;
        ((ticks.0 >> shift) % Self::SLOTS as u64) as usize
    }
}

/// Finds the index of the next set bit in `bitmap` at or after the
/// `offset`th bit, wrapping around.
///
/// Based on
/// <https://github.com/torvalds/linux/blob/d0e60d46bc03252b8d4ffaaaa0b371970ac16cda/include/linux/find.h#L21-L45>
fn next_set_bit(bitmap: u64, offset: u32) -> Option<usize> {
    debug_assert!(offset < 64, "offset: {offset}");
    if bitmap == 0 {
        return None;
    }
    let shifted = bitmap >> offset;
    let zeros = if shifted == 0 {
        bitmap.rotate_right(offset).trailing_zeros()
    } else {
        shifted.trailing_zeros()
    };
    Some(zeros as usize + offset as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_set_bit_wraps() {
        assert_eq!(next_set_bit(0b0001, 0), Some(0));
        assert_eq!(next_set_bit(0b0001, 1), Some(64));
        assert_eq!(next_set_bit(0b1000, 2), Some(3));
        assert_eq!(next_set_bit(0b1000, 4), Some(67));
        assert_eq!(next_set_bit(0, 0), None);
    }

    #[test]
    fn slot_index_per_level() {
        let w0 = Wheel::new(0);
        assert_eq!(w0.slot_index(Ticks(0)), 0);
        assert_eq!(w0.slot_index(Ticks(63)), 63);
        assert_eq!(w0.slot_index(Ticks(64)), 0);

        let w1 = Wheel::new(1);
        assert_eq!(w1.slot_index(Ticks(64)), 1);
        assert_eq!(w1.slot_index(Ticks(64 * 63)), 63);
    }
}
