// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture Abstraction Layer (AAL)
//!
//! The only architecture services the socket core needs: saving and
//! restoring the local interrupt state around spinlock critical sections
//! that may also be entered from interrupt handlers.
//!
//! Bare-metal builds (`target_os = "none"`) talk to the CPU directly. Hosted
//! builds have no interrupts to mask, so the calls are no-ops there.

/// Saved interrupt state returned by [`irq_save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(u64);

impl IrqState {
    /// Whether interrupts were enabled when the state was saved
    pub const fn were_enabled(self) -> bool {
        self.0 != 0
    }
}

/// Disable interrupts on the current CPU, returning the previous state
#[inline]
pub fn irq_save() -> IrqState {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        IrqState(enabled as u64)
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        use aarch64_cpu::registers::{Readable, Writeable, DAIF};

        // DAIF.I set means IRQs are masked.
        let masked = DAIF.is_set(DAIF::I);
        DAIF.write(DAIF::I::Masked + DAIF::F::Masked);
        IrqState((!masked) as u64)
    }

    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "none")))]
    {
        IrqState(0)
    }
}

/// Restore an interrupt state previously returned by [`irq_save`]
#[inline]
pub fn irq_restore(state: IrqState) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if state.were_enabled() {
        x86_64::instructions::interrupts::enable();
    }

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    if state.were_enabled() {
        use aarch64_cpu::registers::{Writeable, DAIF};

        DAIF.write(DAIF::I::Unmasked + DAIF::F::Unmasked);
    }

    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "none")))]
    let _ = state;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_save_restore_hosted() {
        let state = irq_save();
        assert!(!state.were_enabled());
        irq_restore(state);
    }
}
