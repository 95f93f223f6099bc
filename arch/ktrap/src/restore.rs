// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Context restore.
//!
//! The inverse of [`save`](crate::save::save): pops the top frame and writes
//! it back into the spill image, which the assembly then reloads before
//! `eret`. `eret` is the only instruction that applies `SPSR` and jumps to
//! `ELR`, so the privilege change and the control transfer are one atomic
//! step.
//!
//! On AArch64 none of the register writes can fault. The one ordering hazard
//! is a nested exception overwriting `ELR/SPSR` after they were loaded, which
//! is why the caller re-applies [`MaskTransition::entry`] first.
//!
//! [`MaskTransition::entry`]: crate::mask::MaskTransition::entry

use crate::{
    KERNEL_EL,
    error::{FatalTrap, ProtocolViolation},
    frame::{RawTrapState, TrapFrame},
    stack::{FrameSlot, FrameStack},
};

/// Checks that `frame` may be returned to from [`KERNEL_EL`].
pub fn check_return(frame: &TrapFrame) -> Result<(), ProtocolViolation> {
    let pstate = frame.pstate();
    if !pstate.is_valid_mode() {
        return Err(ProtocolViolation::IllegalMode {
            mode: pstate.mode_bits(),
        });
    }
    if pstate.is_aarch32() {
        // AArch32 targets are user mode only, already checked above.
        return Ok(());
    }

    let target_el = pstate.exception_level();
    if target_el > KERNEL_EL {
        return Err(ProtocolViolation::IllegalMode {
            mode: pstate.mode_bits(),
        });
    }
    if frame.source().is_lower() && target_el >= KERNEL_EL {
        return Err(ProtocolViolation::PrivilegeEscalation {
            info: frame.info(),
            target_el,
        });
    }
    Ok(())
}

/// Pops `slot` and applies its frame to `raw`.
///
/// On error the slot is still released, and `raw` is left untouched.
pub fn restore<const N: usize>(
    frames: &FrameStack<N>,
    slot: FrameSlot<'_>,
    raw: &mut RawTrapState,
) -> Result<(), FatalTrap> {
    let frame = frames.pop(slot)?;
    check_return(&frame)?;
    frame.apply(raw);

    trace!(
        "trap restore: {} depth={} pc={:#x} spsr={:#x}",
        frame.info(),
        frames.depth(),
        raw.elr,
        raw.spsr
    );
    Ok(())
}
