// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Scoped interrupt masking.
//!
//! Shared session state is touched both from the byte ISR and from the main
//! loop. Any multi-step mutation that the other side must observe atomically is
//! wrapped in an [`InterruptGuard`]: interrupts are masked when the guard is
//! created and the previous mask is restored when it is dropped, including on
//! early returns and `?` paths.

use core::marker::PhantomData;

/// Masks interrupts for as long as it lives.
///
/// Guards nest: an inner guard restores the state saved when it was created,
/// so interrupts only come back once the outermost guard is dropped.
pub struct InterruptGuard {
    state: critical_section::RestoreState,
    // Restore must happen on the core that acquired.
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    pub fn new() -> Self {
        // SAFETY: the matching `release` runs exactly once, in `Drop`, with the
        // state returned here. Guards are not `Send`, so they are dropped in
        // reverse creation order on the same core.
        let state = unsafe { critical_section::acquire() };
        Self {
            state,
            _not_send: PhantomData,
        }
    }

    /// Run `f` with interrupts masked.
    pub fn with<R>(f: impl FnOnce() -> R) -> R {
        let _guard = Self::new();
        f()
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        // SAFETY: `state` came from the `acquire` in `new`.
        unsafe { critical_section::release(self.state) }
    }
}
