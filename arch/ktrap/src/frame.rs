// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Trapped execution state: the raw spill image and the structured frame.

use core::{fmt, mem::offset_of};

use static_assertions::const_assert_eq;

use crate::{
    mask::DaifMask,
    vector::{TrapInfo, TrapKind, TrapSource},
};

/// Number of general-purpose registers in a frame (`x0..=x30`).
///
/// `x30` is the link register. The vector thunk spills it before anything on
/// the entry path can clobber it, and the exit path reloads it last.
pub const GPR_COUNT: usize = 31;

/// The register file exactly as the vector assembly spills it on the stack.
///
/// Field order and offsets are part of the contract with `vectors.S`; the
/// offsets are passed to the assembly as `const` operands and checked below.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawTrapState {
    /// `x0..=x30`.
    pub x: [u64; GPR_COUNT],
    pub sp_el0: u64,
    pub elr: u64,
    pub spsr: u64,
    pub esr: u64,
    pub far: u64,
    /// `HPFAR_EL2`, zero unless built with `arm-el2`.
    pub hpfar: u64,
    /// `TPIDR_EL0`, zero unless built with `tls`.
    pub tpidr_el0: u64,
    #[cfg(feature = "fp-simd")]
    pub fp: FpState,
}

const_assert_eq!(offset_of!(RawTrapState, x), 0);
const_assert_eq!(offset_of!(RawTrapState, sp_el0), 31 * 8);
const_assert_eq!(offset_of!(RawTrapState, elr), 32 * 8);
const_assert_eq!(offset_of!(RawTrapState, spsr), 33 * 8);
const_assert_eq!(offset_of!(RawTrapState, esr), 34 * 8);
const_assert_eq!(offset_of!(RawTrapState, far), 35 * 8);
const_assert_eq!(offset_of!(RawTrapState, hpfar), 36 * 8);
const_assert_eq!(offset_of!(RawTrapState, tpidr_el0), 37 * 8);
const_assert_eq!(core::mem::size_of::<RawTrapState>() % 16, 0);
#[cfg(feature = "fp-simd")]
const_assert_eq!(offset_of!(RawTrapState, fp), 38 * 8);
#[cfg(not(feature = "fp-simd"))]
const_assert_eq!(core::mem::size_of::<RawTrapState>(), 38 * 8);

/// FP & SIMD registers, saved and restored with the `fp-simd` feature.
#[cfg(feature = "fp-simd")]
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpState {
    /// `v0..=v31`.
    pub regs: [u128; 32],
    pub fpcr: u32,
    pub fpsr: u32,
}


/// A saved program status register (`SPSR_ELx`) value.
///
/// Only the fields this layer has to reason about are decoded: the target
/// mode `M[4:0]` and the `DAIF` mask bits. Everything else passes through.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorState(u64);

impl ProcessorState {
    const M_SP: u64 = 1 << 0;
    const M_EL_SHIFT: u64 = 2;
    const M_EL_MASK: u64 = 0b11 << Self::M_EL_SHIFT;
    const M_RES0: u64 = 1 << 1;
    const M_AARCH32: u64 = 1 << 4;
    const M_MASK: u64 = 0b1_1111;

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// An AArch64 state returning to `el`, on `SP_ELx` if `sp_elx` is set,
    /// with `mask` in effect.
    pub const fn new(el: u8, sp_elx: bool, mask: DaifMask) -> Self {
        let mut bits = ((el as u64) << Self::M_EL_SHIFT) & Self::M_EL_MASK;
        if sp_elx {
            bits |= Self::M_SP;
        }
        Self(bits | mask.bits())
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Target exception level of an AArch64 mode.
    pub const fn exception_level(self) -> u8 {
        ((self.0 & Self::M_EL_MASK) >> Self::M_EL_SHIFT) as u8
    }

    /// `M[0]`: running on the level's own stack pointer (`ELxh`).
    pub const fn uses_sp_elx(self) -> bool {
        self.0 & Self::M_SP != 0
    }

    /// `M[4]`: the target executes AArch32.
    pub const fn is_aarch32(self) -> bool {
        self.0 & Self::M_AARCH32 != 0
    }

    pub const fn mode_bits(self) -> u8 {
        (self.0 & Self::M_MASK) as u8
    }

    /// Whether `M[4:0]` is an encoding this layer can ever return to.
    ///
    /// AArch32 is only accepted as user mode (`0b10000`); AArch64 modes must
    /// have `M[1]` clear and may not be `EL0h`.
    pub const fn is_valid_mode(self) -> bool {
        if self.is_aarch32() {
            return self.mode_bits() == 0b1_0000;
        }
        if self.0 & Self::M_RES0 != 0 {
            return false;
        }
        !(self.exception_level() == 0 && self.uses_sp_elx())
    }

    pub const fn daif(self) -> DaifMask {
        DaifMask::from_bits_truncate(self.0)
    }
}

impl fmt::Debug for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessorState({:#x}", self.0)?;
        if self.is_aarch32() {
            write!(f, ", aarch32")?;
        } else {
            let sp = if self.uses_sp_elx() { 'h' } else { 't' };
            write!(f, ", EL{}{}", self.exception_level(), sp)?;
        }
        write!(f, ", {:?})", self.daif())
    }
}

/// The raw exception syndrome (`ESR_ELx`).
///
/// This layer does not interpret the syndrome. The field accessors only cut
/// bits out for logging and for deciding whether `FAR` is meaningful.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Syndrome(u64);

impl Syndrome {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// `EC`, bits `[31:26]`.
    pub const fn exception_class(self) -> u8 {
        ((self.0 >> 26) & 0b11_1111) as u8
    }

    /// `IL`, bit 25: the trapped instruction was 32 bits wide.
    pub const fn is_32bit_instruction(self) -> bool {
        (self.0 >> 25) & 1 != 0
    }

    /// `ISS`, bits `[24:0]`.
    pub const fn iss(self) -> u32 {
        (self.0 & 0x1ff_ffff) as u32
    }

    /// Exception classes for which the architecture defines `FAR_ELx`:
    /// instruction aborts, PC alignment, data aborts and watchpoints.
    pub const fn reports_fault_address(self) -> bool {
        matches!(
            self.exception_class(),
            0x20 | 0x21 | 0x22 | 0x24 | 0x25 | 0x34 | 0x35
        )
    }
}

impl fmt::Debug for Syndrome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Syndrome({:#x}, ec={:#x}, iss={:#x})",
            self.0,
            self.exception_class(),
            self.iss()
        )
    }
}


/// What a trap is: fixed at context save, never handler-visible as state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrapOrigin {
    info: TrapInfo,
    syndrome: Syndrome,
    far: u64,
    hpfar: u64,
}

impl TrapOrigin {
    pub(crate) const EMPTY: Self = Self {
        info: TrapInfo::new(TrapSource::CurrentSpEl0, TrapKind::Synchronous),
        syndrome: Syndrome(0),
        far: 0,
        hpfar: 0,
    };

    pub(crate) const fn info(&self) -> TrapInfo {
        self.info
    }
}

/// The state of one trapped execution, owned by the trap pipeline from
/// context save until context restore.
///
/// Handlers may rewrite the general registers (including `x30`), the
/// program counter, the processor state, `SP_EL0`, `TPIDR_EL0` and the FP
/// registers to resume somewhere else. The trap identity, syndrome and
/// fault addresses have no setters. The frame stack keeps its own copy of
/// them and stamps it back onto the frame before restore, so overwriting
/// the whole frame does not change them either.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    regs: [u64; GPR_COUNT],
    sp_el0: u64,
    tpidr_el0: u64,
    pc: u64,
    pstate: ProcessorState,
    origin: TrapOrigin,
    #[cfg(feature = "fp-simd")]
    fp: FpState,
}

impl TrapFrame {
    /// A zeroed frame, used to initialize frame storage.
    pub(crate) const EMPTY: Self = Self {
        regs: [0; GPR_COUNT],
        sp_el0: 0,
        tpidr_el0: 0,
        pc: 0,
        pstate: ProcessorState(0),
        origin: TrapOrigin::EMPTY,
        #[cfg(feature = "fp-simd")]
        fp: FpState {
            regs: [0; 32],
            fpcr: 0,
            fpsr: 0,
        },
    };

    /// Builds a frame from the spilled register file.
    pub(crate) const fn capture(info: TrapInfo, raw: &RawTrapState) -> Self {
        Self {
            regs: raw.x,
            sp_el0: raw.sp_el0,
            tpidr_el0: raw.tpidr_el0,
            pc: raw.elr,
            pstate: ProcessorState(raw.spsr),
            origin: TrapOrigin {
                info,
                syndrome: Syndrome(raw.esr),
                far: raw.far,
                hpfar: raw.hpfar,
            },
            #[cfg(feature = "fp-simd")]
            fp: raw.fp,
        }
    }

    /// Writes the frame back into the spill image.
    ///
    /// `SPSR` and `ELR` are written last; they are what `eret` consumes.
    pub(crate) fn apply(&self, raw: &mut RawTrapState) {
        raw.x = self.regs;
        raw.sp_el0 = self.sp_el0;
        raw.tpidr_el0 = self.tpidr_el0;
        #[cfg(feature = "fp-simd")]
        {
            raw.fp = self.fp;
        }
        raw.esr = self.origin.syndrome.0;
        raw.far = self.origin.far;
        raw.hpfar = self.origin.hpfar;
        raw.spsr = self.pstate.0;
        raw.elr = self.pc;
    }

    pub(crate) const fn origin(&self) -> TrapOrigin {
        self.origin
    }

    /// Puts back the identity recorded at save time.
    pub(crate) fn restamp(&mut self, origin: TrapOrigin) {
        self.origin = origin;
    }

    pub const fn info(&self) -> TrapInfo {
        self.origin.info
    }

    pub const fn source(&self) -> TrapSource {
        self.origin.info.source
    }

    pub const fn kind(&self) -> TrapKind {
        self.origin.info.kind
    }

    pub const fn syndrome(&self) -> Syndrome {
        self.origin.syndrome
    }

    /// The faulting address, for synchronous exceptions whose class
    /// defines one.
    pub const fn fault_address(&self) -> Option<u64> {
        if self.origin.info.kind.is_synchronous() && self.origin.syndrome.reports_fault_address() {
            Some(self.origin.far)
        } else {
            None
        }
    }

    /// The faulting intermediate physical address of a guest's stage 2
    /// abort, from `HPFAR_EL2.FIPA`. Only `arm-el2` builds capture it.
    pub const fn stage2_fault_address(&self) -> Option<u64> {
        const FIPA: u64 = 0x0000_ffff_ffff_fff0;
        let origin = &self.origin;
        if cfg!(feature = "arm-el2")
            && origin.info.source.is_lower()
            && origin.info.kind.is_synchronous()
            && matches!(origin.syndrome.exception_class(), 0x20 | 0x24)
        {
            Some((origin.hpfar & FIPA) << 8)
        } else {
            None
        }
    }

    pub const fn regs(&self) -> &[u64; GPR_COUNT] {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut [u64; GPR_COUNT] {
        &mut self.regs
    }

    /// Reads `x{index}`; `index` must be below [`GPR_COUNT`].
    pub const fn reg(&self, index: usize) -> u64 {
        self.regs[index]
    }

    pub fn set_reg(&mut self, index: usize, value: u64) {
        self.regs[index] = value;
    }

    /// Stores a system call or function return value in `x0`.
    pub fn set_return_value(&mut self, value: u64) {
        self.regs[0] = value;
    }

    /// The link register (`x30`).
    pub const fn lr(&self) -> u64 {
        self.regs[30]
    }

    /// `SP_EL0` at the time of the trap.
    pub const fn user_sp(&self) -> u64 {
        self.sp_el0
    }

    pub fn set_user_sp(&mut self, sp: u64) {
        self.sp_el0 = sp;
    }

    /// `TPIDR_EL0`, the user thread pointer.
    pub const fn tls(&self) -> u64 {
        self.tpidr_el0
    }

    pub fn set_tls(&mut self, tls: u64) {
        self.tpidr_el0 = tls;
    }

    #[cfg(feature = "fp-simd")]
    pub const fn fp_state(&self) -> &FpState {
        &self.fp
    }

    #[cfg(feature = "fp-simd")]
    pub fn fp_state_mut(&mut self) -> &mut FpState {
        &mut self.fp
    }

    /// The address execution resumes at.
    pub const fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Steps over the trapping instruction (e.g. after emulating it).
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }

    pub const fn pstate(&self) -> ProcessorState {
        self.pstate
    }

    pub fn set_pstate(&mut self, pstate: ProcessorState) {
        self.pstate = pstate;
    }

    /// Resumes at `pc` in mode `pstate` instead of the trapped location.
    pub fn redirect(&mut self, pc: u64, pstate: ProcessorState) {
        self.pc = pc;
        self.pstate = pstate;
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TrapFrame {{")?;
        writeln!(f, "    info: {},", self.origin.info)?;
        writeln!(f, "    pc: {:#018x},", self.pc)?;
        writeln!(f, "    pstate: {:?},", self.pstate)?;
        writeln!(f, "    syndrome: {:?},", self.origin.syndrome)?;
        writeln!(f, "    far: {:#018x},", self.origin.far)?;
        writeln!(f, "    hpfar: {:#018x},", self.origin.hpfar)?;
        writeln!(f, "    sp_el0: {:#018x},", self.sp_el0)?;
        writeln!(f, "    tpidr_el0: {:#018x},", self.tpidr_el0)?;
        for (i, pair) in self.regs.chunks(2).enumerate() {
            write!(f, "    x{:<2}: {:#018x}", i * 2, pair[0])?;
            if let Some(odd) = pair.get(1) {
                write!(f, "  x{:<2}: {:#018x}", i * 2 + 1, odd)?;
            }
            writeln!(f, ",")?;
        }
        write!(f, "}}")
    }
}
