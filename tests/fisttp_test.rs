//! FISTTP: truncating x87 store-and-pop, and its deliberately narrow
//! accepted encoding set.

use opemu::{
    Emulator, MappedMemory, NoSyscalls, Permission, SavedState, SavedState32, SavedState64,
    SoftRegisterFile, TrapOutcome, UserTrapOutcome,
};

const CODE_BASE: u64 = 0x1000;
const DATA: u64 = 0x5000;

fn setup(code: &[u8], top: f64) -> (Emulator<MappedMemory, SoftRegisterFile>, SavedState) {
    let mut mem = MappedMemory::new();
    mem.map(
        CODE_BASE,
        0x1000,
        Permission::READ | Permission::WRITE | Permission::USER,
    );
    mem.fill(CODE_BASE, code);
    mem.map(DATA, 0x100, Permission::READ | Permission::WRITE);
    let mut regs = SoftRegisterFile::new();
    regs.fpu_push(top);
    let state = SavedState::Bit64(SavedState64 {
        rip: CODE_BASE,
        rax: DATA,
        ..Default::default()
    });
    (Emulator::new(mem, regs), state)
}

fn read_u64(emu: &Emulator<MappedMemory, SoftRegisterFile>, addr: u64) -> u64 {
    use opemu::TrapMemory;
    let mut buf = [0u8; 8];
    emu.memory.kernel_read(addr, &mut buf).unwrap();
    u64::from_le_bytes(buf)
}

#[test]
fn dword_store_truncates_toward_zero() {
    // fisttp dword [rax]
    let (mut emu, mut state) = setup(&[0xDB, 0x08], 12.75);
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    assert_eq!(read_u64(&emu, DATA) as u32, 12);
    assert_eq!(state.ip(), CODE_BASE + 2);
    assert!(emu.regs.x87.is_empty(), "x87 top must be popped");
}

#[test]
fn negative_values_truncate_toward_zero() {
    let (mut emu, mut state) = setup(&[0xDB, 0x08], -3.99);
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    assert_eq!(read_u64(&emu, DATA) as u32 as i32, -3);
}

#[test]
fn qword_store() {
    // fisttp qword [rax + 0x20]
    let (mut emu, mut state) = setup(&[0xDD, 0x48, 0x20], 1e15);
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    assert_eq!(read_u64(&emu, DATA + 0x20) as i64, 1_000_000_000_000_000);
    assert_eq!(state.ip(), CODE_BASE + 3);
}

#[test]
fn word_store_with_operand_size_prefix() {
    // 66 DF /1-style form: fisttp word [rax]
    let (mut emu, mut state) = setup(&[0x66, 0xDF, 0x08], -129.5);
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    assert_eq!(read_u64(&emu, DATA) as u16 as i16, -129);
    assert_eq!(state.ip(), CODE_BASE + 3);
}

#[test]
fn negative_disp8() {
    // fisttp dword [rax - 0x10]
    let (mut emu, mut state) = setup(&[0xDB, 0x48, 0xF0], 7.0);
    if let SavedState::Bit64(s) = &mut state {
        s.rax = DATA + 0x10;
    }
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    assert_eq!(read_u64(&emu, DATA) as u32, 7);
}

#[test]
fn mod_2_and_3_are_rejected() {
    for modrm in [0x88u8, 0xC8] {
        let (mut emu, mut state) = setup(&[0xDB, modrm, 0, 0, 0, 0], 1.0);
        assert_eq!(
            emu.kernel_trap(&mut state).unwrap(),
            TrapOutcome::Unhandled,
            "mod {:#x} must not decode",
            modrm >> 6
        );
        assert_eq!(state.ip(), CODE_BASE);
        // Nothing was popped on the rejected path.
        assert_eq!(emu.regs.x87.len(), 1);
    }
}

#[test]
fn unencodable_rm_forms_are_rejected() {
    // rm 4 promises a SIB byte and mod 0 rm 5 promises a disp32; neither is
    // an address this family can compute, so both fall through.
    for modrm in [0x0Cu8, 0x0D] {
        let (mut emu, mut state) = setup(&[0xDB, modrm, 0, 0, 0, 0], 1.0);
        assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Unhandled);
        assert_eq!(state.ip(), CODE_BASE);
    }
}

#[test]
fn thirty_two_bit_state_uses_masked_addresses() {
    let mut mem = MappedMemory::new();
    mem.map(CODE_BASE, 0x1000, Permission::READ | Permission::WRITE);
    mem.fill(CODE_BASE, &[0xDB, 0x49, 0x10]); // fisttp dword [ecx + 0x10]
    mem.map(0x8, 0x100, Permission::READ | Permission::WRITE);
    let mut regs = SoftRegisterFile::new();
    regs.fpu_push(42.0);
    let mut state = SavedState::Bit32(SavedState32 {
        eip: CODE_BASE as u32,
        ecx: 0xFFFF_FFF8,
        ..Default::default()
    });
    let mut emu = Emulator::new(mem, regs);
    assert_eq!(emu.kernel_trap(&mut state).unwrap(), TrapOutcome::Emulated);
    let mut buf = [0u8; 4];
    use opemu::TrapMemory;
    emu.memory.kernel_read(0x8, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 42);
}

#[test]
fn user_trap_stores_through_copyout() {
    let (mut emu, mut state) = setup(&[0xDB, 0x08], 9.5);
    // Remap the data page as user-accessible.
    emu.memory
        .map(0x9000, 0x100, Permission::READ | Permission::WRITE | Permission::USER);
    if let SavedState::Bit64(s) = &mut state {
        s.rax = 0x9000;
    }
    assert_eq!(
        emu.user_trap(&mut state, &mut NoSyscalls).unwrap(),
        UserTrapOutcome::Emulated
    );
    assert_eq!(read_u64(&emu, 0x9000) as u32, 9);
}

#[test]
fn user_copyout_to_kernel_page_fails() {
    // DATA is kernel-only; a user-mode fisttp against it must surface the
    // copy failure and leave the IP alone.
    let (mut emu, mut state) = setup(&[0xDB, 0x08], 9.5);
    let err = emu.user_trap(&mut state, &mut NoSyscalls).unwrap_err();
    assert!(matches!(err, opemu::EmulatorError::CopyoutFailed { .. }));
    assert_eq!(state.ip(), CODE_BASE);
}
