//! Synthetic record source used while an output speculates past a branch.
//!
//! While speculation is active the scheduler stops draining the current
//! input and asks the speculator for records instead. The only supported
//! flavor today emits nop-like instruction records at the requested pc;
//! extending to replayed-from-trace speculation needs the previous record
//! passed alongside the pc.

use crate::record::TraceRecord;

/// How speculated records are fabricated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeculatorKind {
    /// Fixed-size nop instructions at consecutive pcs.
    Nops,
}

/// Produces one synthetic record per call, advancing `pc` as it goes.
pub struct Speculator<R> {
    kind: SpeculatorKind,
    nop_size: u16,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R: TraceRecord> Speculator<R> {
    pub fn new(kind: SpeculatorKind) -> Self {
        Self {
            kind,
            nop_size: 1,
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns the next speculated record for `*pc` and advances `*pc` past
    /// it. `tid` tags the record for schemas that carry one.
    pub fn next_record(&self, pc: &mut u64, tid: i64) -> Result<R, String> {
        match self.kind {
            SpeculatorKind::Nops => {
                let record = R::speculated_instr(tid, *pc, self.nop_size);
                *pc = pc.wrapping_add(u64::from(self.nop_size));
                Ok(record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MemrefRecord;

    #[test]
    fn nops_advance_pc() {
        let spec = Speculator::<MemrefRecord>::new(SpeculatorKind::Nops);
        let mut pc = 0x4000;
        let r = spec.next_record(&mut pc, 7).unwrap();
        assert!(r.is_instr());
        assert_eq!(pc, 0x4001);
        let r2 = spec.next_record(&mut pc, 7).unwrap();
        assert!(r2.is_instr());
        assert_eq!(pc, 0x4002);
    }
}
