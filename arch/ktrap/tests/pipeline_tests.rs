//! Tests for the save, dispatch and restore pipeline of a single cpu

#![cfg(test)]


use std::cell::{Cell, RefCell};

use ktrap::{
    DaifMask, Disposition, FatalTrap, GPR_COUNT, KERNEL_EL, ProcessorState, ProtocolViolation,
    RawTrapState, TrapCore, TrapFrame, TrapHandler, TrapInfo, TrapKind, TrapPolicy, TrapSource,
    save::save,
};
use test_helpers::*;

fn resume(_: &mut TrapFrame) -> Disposition {
    Disposition::Resume
}

// ========== Round Trip ==========

#[test]
fn test_untouched_frame_restores_exactly() {
    init_logger();
    let cpu = TrapCore::<4>::new(TrapPolicy::all());
    let mut rng = rng(0x5eed);

    for info in TrapInfo::ALL {
        for _ in 0..32 {
            let raw = random_raw(&mut rng, info);
            let mut live = raw;
            cpu.enter(info, &mut live, DaifMask::ENTRY, &resume, &NoMasking)
                .unwrap();
            assert_eq!(live, raw, "state changed across {info}");
            assert_eq!(cpu.frames().depth(), 0);
        }
    }
    assert!(cpu.fatal().is_none());
}

// ========== Identification ==========

#[test]
fn test_slot_index_identifies_trap() {
    let cpu = TrapCore::<1>::new(TrapPolicy::all());
    let mut rng = rng(1);

    for index in 0..16 {
        let expected = TrapInfo::from_vector(index).unwrap();
        let seen = Cell::new(None);
        let handler = |frame: &mut TrapFrame| {
            seen.set(Some((frame.source(), frame.kind())));
            Disposition::Resume
        };
        let mut raw = random_raw(&mut rng, expected);
        cpu.enter_vector(index, &mut raw, DaifMask::ENTRY, &handler, &NoMasking)
            .unwrap();
        assert_eq!(seen.get(), Some((expected.source, expected.kind)));
        assert_eq!(expected.vector_index(), index);
    }
}

#[test]
fn test_bad_vector_is_fatal() {
    let cpu = TrapCore::<1>::new(TrapPolicy::all());
    let mut raw = RawTrapState::default();
    let err = cpu
        .enter_vector(16, &mut raw, DaifMask::ENTRY, &resume, &NoMasking)
        .unwrap_err();
    assert_eq!(err, FatalTrap::BadVector { index: 16 });
    assert_eq!(cpu.fatal(), Some(err));
    assert_eq!(
        cpu.enter_vector(0, &mut raw, DaifMask::ENTRY, &resume, &NoMasking),
        Err(FatalTrap::Halted)
    );
}

// ========== Handler Edits ==========

#[test]
fn test_syscall_return_value_and_pc() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let handler = |frame: &mut TrapFrame| {
        assert_eq!(frame.syndrome().exception_class(), 0x15);
        let nr = frame.reg(8);
        frame.set_return_value(nr * 2);
        frame.advance_pc();
        Disposition::Resume
    };
    let before = svc_raw(64, 1);
    let mut raw = before;
    cpu.enter(
        TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous),
        &mut raw,
        DaifMask::ENTRY,
        &handler,
        &NoMasking,
    )
    .unwrap();

    assert_eq!(raw.x[0], 128);
    assert_eq!(raw.elr, before.elr + 4);
    assert_eq!(raw.x[1..], before.x[1..]);
    assert_eq!(raw.spsr, before.spsr);
    assert_eq!(raw.sp_el0, before.sp_el0);
}

#[test]
fn test_redirect_to_other_user_context() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let next = pstate_for(TrapSource::LowerAArch64, DaifMask::empty());
    let mut next_regs = [0xaa; GPR_COUNT];
    next_regs[30] = 0x2222;
    let handler = |frame: &mut TrapFrame| {
        *frame.regs_mut() = next_regs;
        frame.set_user_sp(0x8000_0000);
        frame.set_tls(0x7f00_0000_2000);
        frame.redirect(0x50_0000, next);
        Disposition::Resume
    };
    let mut raw = svc_raw(1, 2);
    raw.x[30] = 0x1111;
    raw.tpidr_el0 = 0x7f00_0000_1000;
    cpu.enter(
        TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Irq),
        &mut raw,
        DaifMask::ENTRY,
        &handler,
        &NoMasking,
    )
    .unwrap();

    assert_eq!(raw.x, next_regs);
    assert_eq!(raw.sp_el0, 0x8000_0000);
    assert_eq!(raw.tpidr_el0, 0x7f00_0000_2000);
    assert_eq!(raw.elr, 0x50_0000);
    assert_eq!(raw.spsr, next.bits());
}

#[test]
fn test_syndrome_reaches_handler_verbatim() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    // Data abort from EL0, with a fault address.
    let mut raw = svc_raw(0, 0);
    raw.esr = 0x9200_0046;
    raw.far = 0xdead_b000;
    let seen = Cell::new((0, None));
    let handler = |frame: &mut TrapFrame| {
        seen.set((frame.syndrome().bits(), frame.fault_address()));
        Disposition::Resume
    };
    cpu.enter(
        TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous),
        &mut raw,
        DaifMask::ENTRY,
        &handler,
        &NoMasking,
    )
    .unwrap();
    assert_eq!(seen.get(), (0x9200_0046, Some(0xdead_b000)));
    assert_eq!(raw.esr, 0x9200_0046);
}

#[test]
fn test_return_to_kernel_from_user_trap_is_refused() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let handler = |frame: &mut TrapFrame| {
        frame.set_pstate(ProcessorState::new(KERNEL_EL, true, DaifMask::empty()));
        Disposition::Resume
    };
    let before = svc_raw(0, 0);
    let mut raw = before;
    let err = cpu
        .enter(info, &mut raw, DaifMask::ENTRY, &handler, &NoMasking)
        .unwrap_err();
    assert_eq!(
        err,
        FatalTrap::ProtocolViolation(ProtocolViolation::PrivilegeEscalation {
            info,
            target_el: KERNEL_EL,
        })
    );
    assert_eq!(raw, before);
    assert_eq!(cpu.frames().depth(), 0);
}

// ========== Nesting ==========

#[test]
fn test_nested_trap_leaves_outer_frame_intact() {
    init_logger();
    let cpu = TrapCore::<4>::new(TrapPolicy::DEFAULT);
    let mut rng = rng(7);
    let outer_info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let inner_info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Irq);
    let inner_before = random_raw(&mut rng, inner_info);
    let inner_after = RefCell::new(None);

    let inner = |frame: &mut TrapFrame| {
        frame.set_reg(5, 0x1234);
        Disposition::Resume
    };
    let outer = |frame: &mut TrapFrame| {
        let snapshot = *frame;
        assert_eq!(cpu.frames().depth(), 1);

        let mut raw = inner_before;
        cpu.enter(inner_info, &mut raw, DaifMask::ENTRY, &inner, &NoMasking)
            .unwrap();
        *inner_after.borrow_mut() = Some(raw);

        assert_eq!(*frame, snapshot);
        assert_eq!(cpu.frames().depth(), 1);
        frame.set_return_value(0);
        Disposition::Resume
    };

    let mut raw = svc_raw(93, 7);
    cpu.enter(outer_info, &mut raw, DaifMask::ENTRY, &outer, &NoMasking)
        .unwrap();

    let inner_raw = inner_after.borrow().unwrap();
    assert_eq!(inner_raw.x[5], 0x1234);
    assert_eq!(inner_raw.elr, inner_before.elr);
    assert_eq!(raw.x[0], 0);
    assert_eq!(raw.x[8], 93);
    assert_eq!(cpu.frames().depth(), 0);
    assert_eq!(cpu.frames().high_water(), 2);
}

#[test]
fn test_inner_handler_cannot_reach_outer_frame() {
    let cpu = TrapCore::<4>::new(TrapPolicy::DEFAULT);
    let outer_info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let inner_info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Irq);
    let mut inner_raw = kernel_raw(0xffff_0000_0008_0000);
    inner_raw.esr = 0x1234;

    let inner = |frame: &mut TrapFrame| {
        // Overwrite everything the handler can reach.
        let mut copy = *frame;
        copy.regs_mut().fill(0xdead);
        copy.redirect(0, ProcessorState::new(0, false, DaifMask::empty()));
        *frame = copy;
        Disposition::Resume
    };
    let outer = |frame: &mut TrapFrame| {
        let snapshot = *frame;
        let mut raw = inner_raw;
        cpu.enter(inner_info, &mut raw, DaifMask::ENTRY, &inner, &NoMasking)
            .unwrap();
        assert_eq!(raw.esr, 0x1234);
        assert_eq!(raw.elr, 0);
        assert_eq!(*frame, snapshot);
        assert_eq!(frame.info(), outer_info);
        Disposition::Resume
    };

    let before = svc_raw(64, 3);
    let mut raw = before;
    cpu.enter(outer_info, &mut raw, DaifMask::ENTRY, &outer, &NoMasking)
        .unwrap();
    assert_eq!(raw, before);
}

/// Re-enters the cpu from every handler until it runs out of slots.
struct Nester<'a, const N: usize> {
    cpu: &'a TrapCore<N>,
    raw: RawTrapState,
    errors: RefCell<Vec<FatalTrap>>,
}

impl<const N: usize> TrapHandler for Nester<'_, N> {
    fn handle(&self, frame: &mut TrapFrame) -> Disposition {
        let snapshot = *frame;
        let mut raw = self.raw;
        let info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Synchronous);
        if let Err(err) = self
            .cpu
            .enter(info, &mut raw, DaifMask::ENTRY, self, &NoMasking)
        {
            self.errors.borrow_mut().push(err);
        }
        assert_eq!(*frame, snapshot);
        Disposition::Resume
    }
}

#[test]
fn test_exhaustion_reported_once() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let mut rng = rng(3);
    let info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Synchronous);
    let nester = Nester {
        cpu: &cpu,
        raw: random_raw(&mut rng, info),
        errors: RefCell::new(Vec::new()),
    };

    let mut raw = nester.raw;
    let err = cpu
        .enter(info, &mut raw, DaifMask::ENTRY, &nester, &NoMasking)
        .unwrap_err();

    // The traps that were interrupted do not resume either.
    assert_eq!(err, FatalTrap::Halted);
    assert_eq!(
        *nester.errors.borrow(),
        [FatalTrap::Exhausted { capacity: 2 }, FatalTrap::Halted]
    );
    assert_eq!(raw, nester.raw);
    assert_eq!(cpu.frames().depth(), 0);
    assert_eq!(cpu.frames().high_water(), 2);
    assert_eq!(cpu.fatal(), Some(FatalTrap::Exhausted { capacity: 2 }));
    assert_eq!(
        cpu.enter(info, &mut raw, DaifMask::ENTRY, &resume, &NoMasking),
        Err(FatalTrap::Halted)
    );
}

#[test]
fn test_reclaim_after_handler_switched_away() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let raw = svc_raw(0, 0);

    // The handler for this trap switched to another task and never returned.
    let (slot, _) = save(cpu.frames(), info, &raw, DaifMask::ENTRY).unwrap();
    assert_eq!(slot.index(), 0);
    drop(slot);
    assert_eq!(cpu.frames().depth(), 1);

    unsafe { cpu.reclaim_to(0) };
    assert_eq!(cpu.frames().depth(), 0);

    let mut raw = svc_raw(0, 0);
    cpu.enter(info, &mut raw, DaifMask::ENTRY, &resume, &NoMasking)
        .unwrap();
}

#[test]
fn test_halt_during_handler_blocks_outer_return() {
    let cpu = TrapCore::<4>::new(TrapPolicy::DEFAULT);
    let outer_info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let fiq = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Fiq);

    let outer = |frame: &mut TrapFrame| {
        let mut raw = kernel_raw(0xffff_0000_0008_0000);
        let err = cpu
            .enter(fiq, &mut raw, DaifMask::ENTRY, &resume, &NoMasking)
            .unwrap_err();
        assert_eq!(err, FatalTrap::Unexpected { info: fiq });
        frame.set_return_value(0);
        Disposition::Resume
    };

    let before = svc_raw(64, 3);
    let mut raw = before;
    let err = cpu
        .enter(outer_info, &mut raw, DaifMask::ENTRY, &outer, &NoMasking)
        .unwrap_err();
    assert_eq!(err, FatalTrap::Halted);
    assert_eq!(raw, before);
    assert_eq!(cpu.fatal(), Some(FatalTrap::Unexpected { info: fiq }));
    assert_eq!(cpu.frames().depth(), 0);
}

// ========== Frame Identity ==========

#[test]
fn test_swapped_frame_keeps_trap_identity() {
    let cpu = TrapCore::<2>::new(TrapPolicy::all());
    let kernel_info = TrapInfo::new(TrapSource::CurrentSpEl0, TrapKind::Synchronous);
    let user_info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);

    // A frame left over from an earlier kernel-level trap.
    let kept = Cell::new(None);
    let keep = |frame: &mut TrapFrame| {
        kept.set(Some(*frame));
        Disposition::Resume
    };
    let mut raw = RawTrapState {
        spsr: pstate_for(TrapSource::CurrentSpEl0, DaifMask::empty()).bits(),
        ..Default::default()
    };
    cpu.enter(kernel_info, &mut raw, DaifMask::ENTRY, &keep, &NoMasking)
        .unwrap();

    let swap = |frame: &mut TrapFrame| {
        let mut other = kept.get().unwrap();
        other.redirect(
            0xffff_0000_dead_0000,
            ProcessorState::new(KERNEL_EL, true, DaifMask::empty()),
        );
        *frame = other;
        Disposition::Resume
    };
    let before = svc_raw(0, 0);
    let mut raw = before;
    let err = cpu
        .enter(user_info, &mut raw, DaifMask::ENTRY, &swap, &NoMasking)
        .unwrap_err();
    assert_eq!(
        err,
        FatalTrap::ProtocolViolation(ProtocolViolation::PrivilegeEscalation {
            info: user_info,
            target_el: KERNEL_EL,
        })
    );
    assert_eq!(raw, before);
}

#[test]
fn test_swapped_frame_restores_saved_syndrome() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
    let kept = Cell::new(None);
    let keep = |frame: &mut TrapFrame| {
        kept.set(Some(*frame));
        Disposition::Resume
    };
    let mut first = svc_raw(1, 1);
    first.esr = 0x9200_0046;
    first.far = 0x1000;
    cpu.enter(info, &mut first, DaifMask::ENTRY, &keep, &NoMasking)
        .unwrap();

    let swap = |frame: &mut TrapFrame| {
        *frame = kept.get().unwrap();
        Disposition::Resume
    };
    let before = svc_raw(2, 2);
    let mut raw = before;
    cpu.enter(info, &mut raw, DaifMask::ENTRY, &swap, &NoMasking)
        .unwrap();
    // Registers follow the handler; the syndrome and FAR stay this trap's.
    assert_eq!(raw.x, first.x);
    assert_eq!(raw.esr, before.esr);
    assert_eq!(raw.far, before.far);
}

// ========== Unexpected Exceptions ==========

#[derive(Default)]
struct Counting {
    handled: Cell<usize>,
    unexpected: Cell<usize>,
}

impl TrapHandler for Counting {
    fn handle(&self, _frame: &mut TrapFrame) -> Disposition {
        self.handled.set(self.handled.get() + 1);
        Disposition::Resume
    }

    fn unexpected(&self, frame: &mut TrapFrame) -> Disposition {
        assert_eq!(frame.kind(), TrapKind::Fiq);
        self.unexpected.set(self.unexpected.get() + 1);
        Disposition::Unexpected
    }
}

#[test]
fn test_unexpected_kind_is_fatal() {
    let cpu = TrapCore::<2>::new(TrapPolicy::DEFAULT);
    let info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Fiq);
    let handler = Counting::default();
    let before = random_raw(&mut rng(9), info);
    let mut raw = before;

    let err = cpu
        .enter(info, &mut raw, DaifMask::ENTRY, &handler, &NoMasking)
        .unwrap_err();
    assert_eq!(err, FatalTrap::Unexpected { info });
    assert_eq!(handler.handled.get(), 0);
    assert_eq!(handler.unexpected.get(), 1);
    assert_eq!(raw, before);
    assert_eq!(cpu.frames().depth(), 0);
    assert_eq!(cpu.fatal(), Some(err));
}

#[test]
fn test_handler_may_refuse_expected_kind() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::SError);
    let mut raw = svc_raw(0, 0);
    let err = cpu
        .enter(
            info,
            &mut raw,
            DaifMask::ENTRY,
            &|_: &mut TrapFrame| Disposition::Unexpected,
            &NoMasking,
        )
        .unwrap_err();
    assert_eq!(err, FatalTrap::Unexpected { info });
}

// ========== Masking ==========

#[test]
fn test_mask_sequence() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    let masking = RecordingMask::default();
    let handler = |_: &mut TrapFrame| {
        // Only the handler mask is in effect while the handler runs.
        assert_eq!(*masking.applied.borrow(), [DaifMask::D | DaifMask::I]);
        Disposition::Resume
    };
    let mut raw = svc_raw(0, 0);
    cpu.enter(
        TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Irq),
        &mut raw,
        DaifMask::ENTRY,
        &handler,
        &masking,
    )
    .unwrap();
    assert_eq!(
        *masking.applied.borrow(),
        [DaifMask::D | DaifMask::I, DaifMask::ENTRY]
    );
}

#[test]
fn test_interrupted_mask_stays_in_handler() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    let masking = RecordingMask::default();
    let info = TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Synchronous);
    let mut raw = RawTrapState {
        spsr: pstate_for(info.source, DaifMask::I | DaifMask::F).bits(),
        ..Default::default()
    };
    cpu.enter(info, &mut raw, DaifMask::ENTRY, &resume, &masking)
        .unwrap();
    assert_eq!(
        masking.applied.borrow()[0],
        DaifMask::D | DaifMask::I | DaifMask::F
    );
}

#[test]
fn test_unmasked_entry_rejected_before_dispatch() {
    let cpu = TrapCore::<1>::new(TrapPolicy::DEFAULT);
    let masking = RecordingMask::default();
    let handler = Counting::default();
    let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::SError);
    let mut raw = svc_raw(0, 0);
    let err = cpu
        .enter(info, &mut raw, DaifMask::D, &handler, &masking)
        .unwrap_err();
    assert_eq!(
        err,
        FatalTrap::MaskingViolation {
            info,
            entry: DaifMask::D
        }
    );
    assert!(masking.applied.borrow().is_empty());
    assert_eq!(handler.handled.get(), 0);
    assert_eq!(cpu.frames().depth(), 0);
}
