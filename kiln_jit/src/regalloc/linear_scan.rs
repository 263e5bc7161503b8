//! Linear scan register assignment.
//!
//! Intervals are visited by increasing start. Each one takes a free
//! register of its category, or the register of the active interval that
//! ends last, which is spilled instead. Intervals that cross a call only
//! take callee-saved registers; when none is free they are spilled, since a
//! frame slot survives the call.
//!
//! Intervals marked `must_have_register` are never spilled. If one cannot
//! be placed, compilation bails out.
//!
//! # References
//!
//! - Poletto & Sarkar, "Linear Scan Register Allocation" (1999)

use super::interval::{LiveInterval, ProgPoint};
use super::{Allocation, AllocationMap, AllocatorStats, RegisterConfig};
use crate::lir::value::{Register, Variable};
use crate::lir::{Lir, WORD_SIZE};
use kiln_core::{KilnError, KilnResult};

/// An interval currently holding a register.
#[derive(Debug, Clone, Copy)]
struct ActiveInterval {
    variable: Variable,
    end: ProgPoint,
    register: Register,
    must_have_register: bool,
}

/// Assigns registers to a list of intervals.
pub struct LinearScanAllocator<'a> {
    config: &'a RegisterConfig,
    allocations: AllocationMap,
    active: Vec<ActiveInterval>,
    stats: AllocatorStats,
}

impl<'a> LinearScanAllocator<'a> {
    pub fn new(config: &'a RegisterConfig) -> Self {
        LinearScanAllocator {
            config,
            allocations: AllocationMap::new(),
            active: Vec::new(),
            stats: AllocatorStats::default(),
        }
    }

    /// Allocate `intervals`, which must be sorted by start. Spill slots are
    /// reserved in `lir`.
    pub fn allocate(
        mut self,
        lir: &mut Lir,
        intervals: &[LiveInterval],
    ) -> KilnResult<(AllocationMap, AllocatorStats)> {
        self.stats.num_variables = intervals.len();
        for interval in intervals {
            self.expire(interval.start());
            if !self.try_allocate(interval) {
                self.allocate_with_spill(lir, interval)?;
            }
        }
        Ok((self.allocations, self.stats))
    }

    fn expire(&mut self, position: ProgPoint) {
        self.active.retain(|a| a.end > position);
    }

    /// Registers `interval` may occupy.
    fn candidates<'c>(&'c self, interval: &'c LiveInterval) -> impl Iterator<Item = Register> + 'c {
        self.config
            .allocatable_in(interval.category)
            .filter(move |r| !interval.crosses_call || self.config.is_callee_saved(*r))
    }

    fn try_allocate(&mut self, interval: &LiveInterval) -> bool {
        let free = self
            .candidates(interval)
            .find(|r| !self.active.iter().any(|a| a.register == *r));
        match free {
            Some(register) => {
                self.assign(interval, register);
                true
            }
            None => false,
        }
    }

    fn assign(&mut self, interval: &LiveInterval, register: Register) {
        self.allocations.set(interval.variable, Allocation::Register(register));
        self.active.push(ActiveInterval {
            variable: interval.variable,
            end: interval.end(),
            register,
            must_have_register: interval.must_have_register,
        });
        self.stats.num_allocated += 1;
    }

    fn spill(&mut self, lir: &mut Lir, variable: Variable) {
        let slot = lir.new_stack_slot(WORD_SIZE, variable.kind);
        self.allocations.set(variable, Allocation::Spill(slot));
        self.stats.num_spilled += 1;
    }

    fn allocate_with_spill(&mut self, lir: &mut Lir, interval: &LiveInterval) -> KilnResult<()> {
        // The active interval ending last among those holding a register
        // this interval could use.
        let eligible: Vec<Register> = self.candidates(interval).collect();
        let victim = self
            .active
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.must_have_register && eligible.contains(&a.register))
            .max_by_key(|(_, a)| a.end)
            .map(|(i, a)| (i, *a));

        match victim {
            Some((index, victim)) if interval.must_have_register || victim.end > interval.end() => {
                self.active.swap_remove(index);
                self.stats.num_allocated -= 1;
                self.spill(lir, victim.variable);
                log::trace!("spill {} for {}", victim.variable, interval);
                self.assign(interval, victim.register);
                Ok(())
            }
            _ if interval.must_have_register => Err(KilnError::bailout(format!(
                "no register left for {interval}"
            ))),
            _ => {
                log::trace!("spill {interval}");
                self.spill(lir, interval.variable);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;
    use crate::lir::value::{category_of, RegisterCategory};
    use crate::regalloc::interval::LiveRange;
    use kiln_core::ValueKind;

    fn config(registers: u8) -> RegisterConfig {
        RegisterConfig {
            allocatable: (0..registers).map(Register::general).collect(),
            callee_saved: vec![Register::general(0)],
            scratch_general: [Register::general(10), Register::general(11)],
            scratch_float: [Register::float(14), Register::float(15)],
        }
    }

    fn interval(index: u32, start: u32, end: u32) -> LiveInterval {
        let variable = Variable {
            index,
            kind: ValueKind::Long,
        };
        let mut range = LiveRange::at(ProgPoint::before(start));
        range.extend_to(ProgPoint::before(end));
        LiveInterval {
            variable,
            category: category_of(variable.kind),
            range,
            crosses_call: false,
            must_have_register: false,
        }
    }

    #[test]
    fn test_overlapping_get_different_registers() {
        let intervals = [interval(0, 0, 20), interval(1, 10, 30)];
        let mut lir = Lir::new(Target::Amd64);
        let (map, stats) = LinearScanAllocator::new(&config(4)).allocate(&mut lir, &intervals).unwrap();
        assert_ne!(map.get(intervals[0].variable), map.get(intervals[1].variable));
        assert_eq!(stats.num_spilled, 0);
    }

    #[test]
    fn test_register_reuse_after_expiry() {
        let intervals = [interval(0, 0, 10), interval(1, 20, 30)];
        let mut lir = Lir::new(Target::Amd64);
        let (map, _) = LinearScanAllocator::new(&config(4)).allocate(&mut lir, &intervals).unwrap();
        assert_eq!(map.get(intervals[0].variable), map.get(intervals[1].variable));
    }

    #[test]
    fn test_longest_interval_is_spilled() {
        let intervals = [interval(0, 0, 100), interval(1, 1, 10), interval(2, 2, 12)];
        let mut lir = Lir::new(Target::Amd64);
        let (map, stats) = LinearScanAllocator::new(&config(2)).allocate(&mut lir, &intervals).unwrap();
        assert!(map.get(intervals[0].variable).is_spill());
        assert!(map.get(intervals[1].variable).is_register());
        assert!(map.get(intervals[2].variable).is_register());
        assert_eq!(stats.num_spilled, 1);
        assert_eq!(lir.stack_slots().len(), 1);
    }

    #[test]
    fn test_call_crossing_takes_callee_saved_or_spills() {
        let mut a = interval(0, 0, 50);
        a.crosses_call = true;
        let mut b = interval(1, 1, 50);
        b.crosses_call = true;
        let intervals = [a, b];
        let mut lir = Lir::new(Target::Amd64);
        let (map, _) = LinearScanAllocator::new(&config(4)).allocate(&mut lir, &intervals).unwrap();
        assert_eq!(map.get(intervals[0].variable).reg(), Some(Register::general(0)));
        assert!(map.get(intervals[1].variable).is_spill());
        assert!(intervals.iter().all(|i| i.category == RegisterCategory::General));
    }

    #[test]
    fn test_must_have_register_bails_out() {
        let mut intervals = [interval(0, 0, 10), interval(1, 1, 10)];
        for i in &mut intervals {
            i.must_have_register = true;
        }
        let mut lir = Lir::new(Target::Amd64);
        let err = LinearScanAllocator::new(&config(1))
            .allocate(&mut lir, &intervals)
            .unwrap_err();
        assert!(matches!(err, KilnError::Bailout { .. }));
    }
}
