// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! AArch64 vector table installation and the bare-metal trap entry.

use core::mem::{offset_of, size_of};

use aarch64_cpu::{asm::barrier, registers::DAIF};
use tock_registers::interfaces::{Readable, Writeable};

use crate::{
    dispatch::TrapPolicy,
    error::FatalTrap,
    excp::LinkedHandlers,
    frame::RawTrapState,
    mask::{DaifMask, MaskControl},
    pipeline::TrapCore,
    vector::VECTOR_TABLE_ALIGN,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "fp-simd")] {
        const FP_OFFSET: usize = offset_of!(RawTrapState, fp);
    } else {
        const FP_OFFSET: usize = 0;
    }
}

core::arch::global_asm!(
    include_str!("vectors.S"),
    raw_size = const size_of::<RawTrapState>(),
    sp_el0_off = const offset_of!(RawTrapState, sp_el0),
    spsr_off = const offset_of!(RawTrapState, spsr),
    far_off = const offset_of!(RawTrapState, far),
    hpfar_off = const offset_of!(RawTrapState, hpfar),
    tpidr_off = const offset_of!(RawTrapState, tpidr_el0),
    fp_off = const FP_OFFSET,
    el2 = const cfg!(feature = "arm-el2") as u8,
    tls = const cfg!(feature = "tls") as u8,
    fp_simd = const cfg!(feature = "fp-simd") as u8,
);

#[percpu::def_percpu]
static TRAP_CORE: TrapCore = TrapCore::new(TrapPolicy::DEFAULT);

/// Writes `DAIF` directly.
struct DaifRegister;

impl MaskControl for DaifRegister {
    fn set_mask(&self, mask: DaifMask) {
        DAIF.set(mask.bits());
    }
}

/// Installs the vector table on the calling core.
///
/// Must run once per core, after `percpu` has been set up for it.
pub fn init() {
    unsafe extern "C" {
        fn ktrap_vector_base();
    }
    let base = ktrap_vector_base as *const () as usize;
    debug_assert_eq!(base % VECTOR_TABLE_ALIGN, 0);

    cfg_if::cfg_if! {
        if #[cfg(feature = "arm-el2")] {
            aarch64_cpu::registers::VBAR_EL2.set(base as u64);
        } else {
            aarch64_cpu::registers::VBAR_EL1.set(base as u64);
        }
    }
    barrier::isb(barrier::SY);
    info!("trap vectors installed at {base:#x}");
}

/// Runs `f` on the calling core's trap state.
///
/// The scheduler uses this to [`reclaim_to`](TrapCore::reclaim_to) the
/// frames of handlers that switched away, and diagnostics to read the
/// nesting depth.
pub fn with_current<T>(f: impl FnOnce(&TrapCore) -> T) -> T {
    // SAFETY: the core's state is only touched from its own trap path and
    // from code running on it with the matching trap level masked.
    f(unsafe { TRAP_CORE.current_ref_raw() })
}

/// Called from `vectors.S` with the slot index and the spilled registers.
#[unsafe(no_mangle)]
extern "C" fn ktrap_entry(index: usize, raw: &mut RawTrapState) {
    let entry = DaifMask::from_bits_truncate(DAIF.get());
    let result = with_current(|cpu| {
        cpu.enter_vector(index, raw, entry, &LinkedHandlers, &DaifRegister)
    });
    if let Err(err) = result {
        fatal(err, raw);
    }
}

#[cold]
fn fatal(err: FatalTrap, raw: &RawTrapState) -> ! {
    panic!(
        "{err} @ {:#x}, esr={:#x}, far={:#x}:\n{:#x?}",
        raw.elr, raw.esr, raw.far, raw
    );
}
