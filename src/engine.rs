//! Dispatch orchestrator: the kernel-trap and user-trap entry points.
//!
//! Each invalid-opcode trap runs the decoder chain once against the bytes at
//! the saved instruction pointer. The first decoder reporting a nonzero
//! length wins and the instruction pointer advances by exactly that length;
//! anything else falls back to the kernel's own trap machinery.

use crate::cpu::SavedState;
use crate::decoder::{
    FisttpDecoder, InstructionDecoder, MonitorMwaitDecoder, Sse3DupDecoder, Sse3PackedDecoder,
    Sse3ScalarDecoder, Ssse3Decoder, TrapContext,
};
use crate::error::{EmulatorError, Result};
use crate::memory::TrapMemory;
use crate::regs::RegisterFile;
use crate::syscall::SyscallDispatch;
use tracing::warn;

/// Longest encoding any supported instruction can occupy.
pub const MAX_INSN_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The instruction was emulated and the saved IP advanced past it.
    Emulated,
    /// No decoder matched; the original trap path should proceed.
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTrapOutcome {
    Emulated,
    /// SYSENTER was recognized and handed to the syscall dispatcher.
    EnteredSyscall,
    /// SYSEXIT was recognized; the thread resumes in user mode at the loaded
    /// IP/SP with no further instruction-pointer arithmetic.
    ReturnedToUser,
    /// No decoder matched; exception delivery to the process should proceed.
    Unhandled,
}

pub struct Emulator<M: TrapMemory, V: RegisterFile> {
    pub memory: M,
    pub regs: V,
}

impl<M: TrapMemory, V: RegisterFile> Emulator<M, V> {
    pub fn new(memory: M, regs: V) -> Self {
        Self { memory, regs }
    }

    /// Read as many instruction bytes as are reachable at the saved IP, up
    /// to [`MAX_INSN_BYTES`]. Byte-wise so that an instruction sitting just
    /// before an unmapped page still decodes from the readable prefix.
    fn fetch_code(
        &self,
        state: &SavedState,
        kernel_trap: bool,
    ) -> Result<([u8; MAX_INSN_BYTES], usize)> {
        let ip = state.ip();
        let mut buf = [0u8; MAX_INSN_BYTES];
        let mut len = 0usize;
        while len < MAX_INSN_BYTES {
            let mut byte = [0u8; 1];
            if self
                .memory
                .read(ip.wrapping_add(len as u64), &mut byte, kernel_trap)
                .is_err()
            {
                break;
            }
            buf[len] = byte[0];
            len += 1;
        }
        if len == 0 {
            return Err(EmulatorError::FetchFailed(ip));
        }
        Ok((buf, len))
    }

    /// Run the decoder chain in priority order; first nonzero length wins.
    fn run_chain(
        &mut self,
        code: &[u8],
        state: &mut SavedState,
        kernel_trap: bool,
    ) -> Result<usize> {
        let mut ctx = TrapContext {
            state,
            memory: &mut self.memory,
            regs: &mut self.regs,
            kernel_trap,
        };
        let decoders: [&dyn InstructionDecoder<M, V>; 6] = [
            &Ssse3Decoder,
            &Sse3ScalarDecoder,
            &Sse3DupDecoder,
            &Sse3PackedDecoder,
            &FisttpDecoder,
            &MonitorMwaitDecoder,
        ];
        for decoder in decoders {
            let consumed = decoder.try_decode(code, &mut ctx)?;
            if consumed != 0 {
                return Ok(consumed);
            }
        }
        Ok(0)
    }

    /// Invalid-opcode trap taken while executing kernel code.
    pub fn kernel_trap(&mut self, state: &mut SavedState) -> Result<TrapOutcome> {
        let (buf, len) = self.fetch_code(state, true)?;
        let code = &buf[..len];

        let consumed = self.run_chain(code, state, true)?;
        if consumed != 0 {
            state.advance_ip(consumed as u64);
            return Ok(TrapOutcome::Emulated);
        }

        if code.starts_with(&[0x0F, 0x32]) {
            // Ring 0 tripping over an unknown MSR read is not worth a panic:
            // report it, hand back zero, keep running.
            warn!(
                msr = state.msr_selector(),
                "unsupported rdmsr, returning zero"
            );
            state.clear_msr_result();
            state.advance_ip(2);
            return Ok(TrapOutcome::Emulated);
        }

        warn!(
            mode = if state.is_64() { "64-bit" } else { "32-bit" },
            bytes = %hex_bytes(code),
            "invalid kernel opcode"
        );
        Ok(TrapOutcome::Unhandled)
    }

    /// Invalid-opcode trap taken while executing user code.
    pub fn user_trap<S: SyscallDispatch>(
        &mut self,
        state: &mut SavedState,
        syscalls: &mut S,
    ) -> Result<UserTrapOutcome> {
        let (buf, len) = self.fetch_code(state, false)?;
        let code = &buf[..len];

        // SYSENTER/SYSEXIT transfer control instead of producing a value, so
        // they are recognized up front rather than chained with the decoders.
        if code.starts_with(&[0x0F, 0x34]) {
            let mach = match state {
                SavedState::Bit32(s) => {
                    s.eip = s.edx;
                    s.uesp = s.ecx;
                    (s.eax as i32) < 0
                }
                SavedState::Bit64(s) => {
                    s.rip = s.rdx;
                    s.rsp = s.rcx;
                    (s.rax as i32) < 0
                }
            };
            if mach {
                syscalls.mach_call(state);
            } else {
                syscalls.unix_syscall(state);
            }
            return Ok(UserTrapOutcome::EnteredSyscall);
        }
        if code.starts_with(&[0x0F, 0x35]) {
            match state {
                SavedState::Bit32(s) => {
                    s.eip = s.edx;
                    s.uesp = s.ecx;
                }
                SavedState::Bit64(s) => {
                    s.rip = s.rdx;
                    s.rsp = s.rcx;
                }
            }
            return Ok(UserTrapOutcome::ReturnedToUser);
        }

        let consumed = self.run_chain(code, state, false)?;
        if consumed != 0 {
            state.advance_ip(consumed as u64);
            return Ok(UserTrapOutcome::Emulated);
        }

        warn!(
            mode = if state.is_64() { "64-bit" } else { "32-bit" },
            bytes = %hex_bytes(code),
            "invalid user opcode"
        );
        Ok(UserTrapOutcome::Unhandled)
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
