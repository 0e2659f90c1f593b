use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;     // Carry Flag
        const PF = 1 << 2;     // Parity Flag
        const AF = 1 << 4;     // Auxiliary Carry Flag
        const ZF = 1 << 6;     // Zero Flag
        const SF = 1 << 7;     // Sign Flag
        const TF = 1 << 8;     // Trap Flag
        const IF = 1 << 9;     // Interrupt Enable Flag
        const DF = 1 << 10;    // Direction Flag
        const OF = 1 << 11;    // Overflow Flag
    }
}

/// General-purpose snapshot captured by the kernel on a 64-bit trap.
#[derive(Debug, Clone, Default)]
pub struct SavedState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: RFlags,
}

/// General-purpose snapshot captured by the kernel on a 32-bit trap.
#[derive(Debug, Clone, Default)]
pub struct SavedState32 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    /// Stack pointer as saved by the trap frame (the "uesp" slot).
    pub uesp: u32,
    pub eflags: RFlags,
}

/// Saved machine state for the duration of one trap. Exactly one variant is
/// active; the discriminant doubles as the long-mode flag threaded through
/// every decode and fetch call.
#[derive(Debug, Clone)]
pub enum SavedState {
    Bit32(SavedState32),
    Bit64(SavedState64),
}

impl SavedState {
    pub fn is_64(&self) -> bool {
        matches!(self, SavedState::Bit64(_))
    }

    pub fn ip(&self) -> u64 {
        match self {
            SavedState::Bit32(s) => s.eip as u64,
            SavedState::Bit64(s) => s.rip,
        }
    }

    pub fn set_ip(&mut self, ip: u64) {
        match self {
            SavedState::Bit32(s) => s.eip = ip as u32,
            SavedState::Bit64(s) => s.rip = ip,
        }
    }

    pub fn advance_ip(&mut self, bytes: u64) {
        match self {
            SavedState::Bit32(s) => s.eip = s.eip.wrapping_add(bytes as u32),
            SavedState::Bit64(s) => s.rip = s.rip.wrapping_add(bytes),
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            SavedState::Bit32(s) => s.uesp as u64,
            SavedState::Bit64(s) => s.rsp,
        }
    }

    pub fn set_sp(&mut self, sp: u64) {
        match self {
            SavedState::Bit32(s) => s.uesp = sp as u32,
            SavedState::Bit64(s) => s.rsp = sp,
        }
    }

    /// Base register for effective-address computation, in x86 encoding order
    /// (0 = a, 1 = c, 2 = d, 3 = b, 4 = sp, 5 = bp, 6 = si, 7 = di). The
    /// 32-bit variant zero-extends.
    pub fn addr_reg(&self, index: u8) -> u64 {
        match self {
            SavedState::Bit32(s) => {
                let regs = [s.eax, s.ecx, s.edx, s.ebx, s.uesp, s.ebp, s.esi, s.edi];
                regs[(index & 0x07) as usize] as u64
            }
            SavedState::Bit64(s) => {
                let regs = [s.rax, s.rcx, s.rdx, s.rbx, s.rsp, s.rbp, s.rsi, s.rdi];
                regs[(index & 0x07) as usize]
            }
        }
    }

    pub fn flags(&self) -> RFlags {
        match self {
            SavedState::Bit32(s) => s.eflags,
            SavedState::Bit64(s) => s.rflags,
        }
    }

    pub fn set_flags(&mut self, flags: RFlags) {
        match self {
            SavedState::Bit32(s) => s.eflags = flags,
            SavedState::Bit64(s) => s.rflags = flags,
        }
    }

    /// MSR selector (the C register) for the RDMSR diagnostic path.
    pub fn msr_selector(&self) -> u64 {
        match self {
            SavedState::Bit32(s) => s.ecx as u64,
            SavedState::Bit64(s) => s.rcx,
        }
    }

    /// Zero the A/D register pair an MSR read would have filled.
    pub fn clear_msr_result(&mut self) {
        match self {
            SavedState::Bit32(s) => {
                s.eax = 0;
                s.edx = 0;
            }
            SavedState::Bit64(s) => {
                s.rax = 0;
                s.rdx = 0;
            }
        }
    }
}
