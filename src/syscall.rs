//! The syscall dispatch boundary reached from SYSENTER.
//!
//! The emulator classifies a SYSENTER as a Mach trap or a Unix syscall by
//! the sign of the A register and hands the saved state across this trait;
//! the actual dispatch lives outside this crate.

use crate::cpu::SavedState;

pub trait SyscallDispatch {
    fn mach_call(&mut self, state: &mut SavedState);
    fn unix_syscall(&mut self, state: &mut SavedState);
}

/// Dispatcher that swallows both paths, for harnesses without a syscall
/// layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSyscalls;

impl SyscallDispatch for NoSyscalls {
    fn mach_call(&mut self, _state: &mut SavedState) {}
    fn unix_syscall(&mut self, _state: &mut SavedState) {}
}
