// src/worker/slots.rs

//! Per-category concurrency accounting.
//!
//! Builds and substitutions draw from independent ceilings so a burst of
//! cheap cache fetches cannot starve builds, and vice versa. Administrative
//! work is never limited.

use crate::types::JobCategory;

#[derive(Debug)]
pub struct SlotTable {
    build_limit: usize,
    substitution_limit: usize,
    build_used: usize,
    substitution_used: usize,
}

impl SlotTable {
    pub fn new(build_limit: usize, substitution_limit: usize) -> Self {
        Self {
            build_limit,
            substitution_limit,
            build_used: 0,
            substitution_used: 0,
        }
    }

    /// Take one slot in `category` if the ceiling allows it.
    pub fn try_acquire(&mut self, category: JobCategory) -> bool {
        match category {
            JobCategory::Build => {
                if self.build_used < self.build_limit {
                    self.build_used += 1;
                    true
                } else {
                    false
                }
            }
            JobCategory::Substitution => {
                if self.substitution_used < self.substitution_limit {
                    self.substitution_used += 1;
                    true
                } else {
                    false
                }
            }
            JobCategory::Administration => true,
        }
    }

    /// Return a previously acquired slot. Must pair with a successful
    /// `try_acquire` for the same category.
    pub fn release(&mut self, category: JobCategory) {
        match category {
            JobCategory::Build => {
                debug_assert!(self.build_used > 0);
                self.build_used = self.build_used.saturating_sub(1);
            }
            JobCategory::Substitution => {
                debug_assert!(self.substitution_used > 0);
                self.substitution_used = self.substitution_used.saturating_sub(1);
            }
            JobCategory::Administration => {}
        }
    }

    pub fn used(&self, category: JobCategory) -> usize {
        match category {
            JobCategory::Build => self.build_used,
            JobCategory::Substitution => self.substitution_used,
            JobCategory::Administration => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_slots_hit_the_ceiling() {
        let mut slots = SlotTable::new(2, 16);
        assert!(slots.try_acquire(JobCategory::Build));
        assert!(slots.try_acquire(JobCategory::Build));
        assert!(!slots.try_acquire(JobCategory::Build));

        slots.release(JobCategory::Build);
        assert!(slots.try_acquire(JobCategory::Build));
    }

    #[test]
    fn categories_are_independent() {
        let mut slots = SlotTable::new(1, 1);
        assert!(slots.try_acquire(JobCategory::Build));
        assert!(slots.try_acquire(JobCategory::Substitution));
        assert!(!slots.try_acquire(JobCategory::Build));
        assert!(!slots.try_acquire(JobCategory::Substitution));
    }

    #[test]
    fn administration_is_never_limited() {
        let mut slots = SlotTable::new(0, 0);
        for _ in 0..100 {
            assert!(slots.try_acquire(JobCategory::Administration));
        }
        assert_eq!(slots.used(JobCategory::Administration), 0);
    }

    #[test]
    fn zero_build_limit_admits_nothing() {
        let mut slots = SlotTable::new(0, 1);
        assert!(!slots.try_acquire(JobCategory::Build));
    }
}
