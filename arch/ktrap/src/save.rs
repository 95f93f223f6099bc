// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Context save.
//!
//! By the time this runs the vector thunk and the shared assembly path have
//! spilled the whole register file, together with `ELR`, `SPSR`, `ESR`, `FAR`,
//! `SP_EL0` and whatever the build enables (`HPFAR_EL2`, `TPIDR_EL0`, FP
//! registers), into a [`RawTrapState`] on the kernel stack. Nothing has
//! been allowed to run between the exception and that spill, so the image is
//! exactly the interrupted state. Context save turns it into a [`TrapFrame`]
//! in the core's [`FrameStack`] and decides the handler's mask.

use crate::{
    error::FatalTrap,
    frame::{RawTrapState, TrapFrame},
    mask::{DaifMask, MaskTransition},
    stack::{FrameSlot, FrameStack},
    vector::TrapInfo,
};

/// Captures `raw` as the frame for trap `info`.
///
/// `entry` is the mask in effect on entry. It must cover
/// [`DaifMask::construction`] for the kind; the hardware always masks all
/// four classes, so failing this means the glue is broken.
///
/// No frame is pushed on failure.
pub fn save<'a, const N: usize>(
    frames: &'a FrameStack<N>,
    info: TrapInfo,
    raw: &RawTrapState,
    entry: DaifMask,
) -> Result<(FrameSlot<'a>, MaskTransition), FatalTrap> {
    if !entry.contains(DaifMask::construction(info.kind)) {
        return Err(FatalTrap::MaskingViolation { info, entry });
    }

    let frame = TrapFrame::capture(info, raw);
    let transition = MaskTransition::for_kind(info.kind, entry, frame.pstate().daif());
    let slot = frames.push(frame)?;

    trace!(
        "trap save: {} depth={} pc={:#x} esr={:#x}",
        info,
        slot.index(),
        raw.elr,
        raw.esr
    );
    Ok((slot, transition))
}
