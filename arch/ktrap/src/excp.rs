// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Link-time registration of the kernel's trap handler.
//!
//! ```ignore
//! use ktrap::{Disposition, TrapFrame, excp::{TRAP_HANDLERS, register_trap_handler}};
//!
//! #[register_trap_handler(TRAP_HANDLERS)]
//! fn kernel_trap(frame: &mut TrapFrame) -> Disposition {
//!     // ...
//!     Disposition::Resume
//! }
//! ```

pub use linkme::{
    distributed_slice as def_trap_handler, distributed_slice as register_trap_handler,
};

use crate::{
    dispatch::{Disposition, TrapHandler},
    frame::TrapFrame,
};

/// The kernel's trap handler. Exactly one registration is expected.
#[def_trap_handler]
pub static TRAP_HANDLERS: [fn(&mut TrapFrame) -> Disposition];

/// Observers for exceptions outside the trap policy, e.g. a crash dumper.
///
/// They cannot change the outcome; the trap is reported as unexpected.
#[def_trap_handler]
pub static UNEXPECTED_OBSERVERS: [fn(&TrapFrame)];

macro_rules! dispatch_trap {
    ($trap:ident, $($args:tt)*) => {{
        let mut iter = $crate::excp::$trap.iter();
        if let Some(func) = iter.next() {
            if iter.next().is_some() {
                warn!("Multiple handlers for trap {} are not currently supported", stringify!($trap));
            }
            Some(func($($args)*))
        } else {
            warn!("No registered handler for trap {}", stringify!($trap));
            None
        }
    }}
}

/// [`TrapHandler`] backed by the link-time registrations above.
pub struct LinkedHandlers;

impl TrapHandler for LinkedHandlers {
    fn handle(&self, frame: &mut TrapFrame) -> Disposition {
        dispatch_trap!(TRAP_HANDLERS, frame).unwrap_or(Disposition::Unexpected)
    }

    fn unexpected(&self, frame: &mut TrapFrame) -> Disposition {
        for observe in UNEXPECTED_OBSERVERS.iter() {
            observe(frame);
        }
        Disposition::Unexpected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dispatch::{TrapPolicy, dispatch},
        frame::RawTrapState,
        vector::{TrapInfo, TrapKind, TrapSource},
    };

    #[test]
    fn test_slices_empty_by_default() {
        assert_eq!(TRAP_HANDLERS.len(), 0);
        assert_eq!(UNEXPECTED_OBSERVERS.len(), 0);
    }

    #[test]
    fn test_no_handler_is_unexpected() {
        let info = TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous);
        let mut frame = TrapFrame::capture(info, &RawTrapState::default());
        assert_eq!(
            dispatch(TrapPolicy::DEFAULT, &LinkedHandlers, &mut frame),
            Disposition::Unexpected
        );
    }
}
