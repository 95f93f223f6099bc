// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Fatal trap conditions.
//!
//! Nothing in here is recoverable by this layer. Recovery (killing a task,
//! retrying an instruction) is the handler's business and is expressed by
//! editing the frame; anything that reaches these types halts the core.

use core::fmt;

use crate::{mask::DaifMask, vector::TrapInfo};

/// A handler left the frame in a state that cannot be returned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// `SPSR.M` names a level above the kernel's own, or an encoding that
    /// does not exist.
    IllegalMode { mode: u8 },
    /// A trap from a lower level was redirected into the kernel's level.
    PrivilegeEscalation { info: TrapInfo, target_el: u8 },
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalMode { mode } => write!(f, "illegal return mode {mode:#07b}"),
            Self::PrivilegeEscalation { info, target_el } => {
                write!(f, "{info} trap redirected to EL{target_el}")
            }
        }
    }
}

/// Conditions that stop the trap pipeline of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalTrap {
    /// No policy exists for this (source, kind), or the handler reported
    /// the exception as unexpected.
    Unexpected { info: TrapInfo },
    /// The vector thunk passed an index outside the table.
    BadVector { index: usize },
    /// Nested traps exceeded the frame storage.
    Exhausted { capacity: usize },
    /// The handler's edits to the frame cannot be restored.
    ProtocolViolation(ProtocolViolation),
    /// The entry mask did not cover what frame construction requires.
    MaskingViolation { info: TrapInfo, entry: DaifMask },
    /// A frame was restored out of LIFO order.
    OutOfOrder { expected: usize, got: usize },
    /// An earlier fatal trap already stopped this core.
    Halted,
}

impl From<ProtocolViolation> for FatalTrap {
    fn from(violation: ProtocolViolation) -> Self {
        Self::ProtocolViolation(violation)
    }
}

impl fmt::Display for FatalTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { info } => write!(f, "unexpected exception {info}"),
            Self::BadVector { index } => write!(f, "unknown exception vector {index}"),
            Self::Exhausted { capacity } => {
                write!(f, "trap nesting exceeded {capacity} frames")
            }
            Self::ProtocolViolation(v) => write!(f, "trap protocol violation: {v}"),
            Self::MaskingViolation { info, entry } => {
                write!(f, "{info} entered with insufficient mask {entry:?}")
            }
            Self::OutOfOrder { expected, got } => {
                write!(f, "frame {got} restored while frame {expected} is on top")
            }
            Self::Halted => write!(f, "trap pipeline halted"),
        }
    }
}
