//! Instruction decoders for the emulated opcode families.
//!
//! Each decoder consumes the raw bytes at the faulting instruction pointer
//! and either emulates the instruction completely (operand fetch, semantic
//! routine, write-back) and returns the exact encoded length, or returns 0
//! meaning "not mine". A nonzero return is a hard promise: the caller
//! advances the saved instruction pointer by exactly that many bytes, so the
//! count must match what the hardware would have consumed.

use crate::cpu::{RFlags, SavedState};
use crate::error::Result;
use crate::memory::TrapMemory;
use crate::regs::RegisterFile;
use crate::simd;

/// Everything a decoder may touch during one trap: the saved integer state,
/// the trap-time memory universe, the live vector register file, and the
/// kernel/user flag fixed at entry.
pub struct TrapContext<'a, M: TrapMemory, V: RegisterFile> {
    pub state: &'a mut SavedState,
    pub memory: &'a mut M,
    pub regs: &'a mut V,
    pub kernel_trap: bool,
}

/// One recognizer in the dispatch chain. `Ok(0)` means the byte pattern is
/// not this decoder's; an error means the pattern matched but an operand
/// fetch faulted, which must not be papered over with a guess.
pub trait InstructionDecoder<M: TrapMemory, V: RegisterFile> {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// ModRM / SIB / displacement
// ---------------------------------------------------------------------------

enum RmOperand {
    Register(u8),
    Memory { address: u64 },
}

struct DecodedRm {
    /// The ModRM reg field (destination register number, before any
    /// high-bank adjustment).
    reg: u8,
    operand: RmOperand,
    /// Bytes consumed: ModRM plus SIB and displacement when present.
    consumed: usize,
}

fn read_disp32(bytes: &[u8], offset: usize) -> Option<i32> {
    Some(i32::from_le_bytes([
        *bytes.get(offset)?,
        *bytes.get(offset + 1)?,
        *bytes.get(offset + 2)?,
        *bytes.get(offset + 3)?,
    ]))
}

/// Decode a ModRM byte (and SIB/displacement) against the saved register
/// snapshot. `bytes` starts at the ModRM byte. Returns `None` when the
/// buffer is too short to hold the encoding the ModRM byte promises.
fn decode_rm(bytes: &[u8], state: &SavedState) -> Option<DecodedRm> {
    let modrm = *bytes.first()?;
    let mod_bits = modrm >> 6;
    let reg = (modrm >> 3) & 0x07;
    let rm = modrm & 0x07;

    if mod_bits == 3 {
        return Some(DecodedRm {
            reg,
            operand: RmOperand::Register(rm),
            consumed: 1,
        });
    }

    let long = state.is_64();
    let mut consumed = 1usize;
    let mut address: u64;

    if rm == 4 {
        // SIB byte follows.
        let sib = *bytes.get(consumed)?;
        consumed += 1;
        let scale = sib >> 6;
        let index = (sib >> 3) & 0x07;
        let base = sib & 0x07;

        if mod_bits == 0 && base == 5 {
            // disp32, no base register.
            let disp = read_disp32(bytes, consumed)?;
            consumed += 4;
            address = disp as i64 as u64;
        } else {
            address = state.addr_reg(base);
        }
        if index != 4 {
            address = address.wrapping_add(state.addr_reg(index) << scale);
        }
    } else if mod_bits == 0 && rm == 5 {
        // RIP-relative disp32 in long mode, plain disp32 otherwise.
        let disp = read_disp32(bytes, consumed)?;
        consumed += 4;
        address = if long {
            state.ip().wrapping_add(disp as i64 as u64)
        } else {
            disp as u32 as u64
        };
    } else {
        address = state.addr_reg(rm);
    }

    match mod_bits {
        1 => {
            let disp = *bytes.get(consumed)? as i8;
            consumed += 1;
            address = address.wrapping_add(disp as i64 as u64);
        }
        2 => {
            let disp = read_disp32(bytes, consumed)?;
            consumed += 4;
            address = address.wrapping_add(disp as i64 as u64);
        }
        _ => {}
    }

    if !long {
        address &= 0xFFFF_FFFF;
    }

    Some(DecodedRm {
        reg,
        operand: RmOperand::Memory { address },
        consumed,
    })
}

// ---------------------------------------------------------------------------
// Operand fetch
// ---------------------------------------------------------------------------

struct Fetched<T> {
    src: T,
    dst: T,
    /// Destination register number after high-bank adjustment.
    dst_reg: u8,
    consumed: usize,
}

/// Fetch a 128-bit operand pair. The destination always comes from the
/// register named by the ModRM reg field; the source is either a register or
/// a memory load through the kernel/user path.
fn fetch_operands_128<M: TrapMemory, V: RegisterFile>(
    ctx: &mut TrapContext<'_, M, V>,
    bytes: &[u8],
    src_high: bool,
    dst_high: bool,
) -> Result<Option<Fetched<u128>>> {
    let Some(rm) = decode_rm(bytes, ctx.state) else {
        return Ok(None);
    };
    let dst_reg = rm.reg + if dst_high { 8 } else { 0 };
    let dst = ctx.regs.read_xmm(dst_reg);
    let src = match rm.operand {
        RmOperand::Register(r) => ctx.regs.read_xmm(r + if src_high { 8 } else { 0 }),
        RmOperand::Memory { address } => {
            let mut buf = [0u8; 16];
            ctx.memory.read(address, &mut buf, ctx.kernel_trap)?;
            u128::from_le_bytes(buf)
        }
    };
    Ok(Some(Fetched {
        src,
        dst,
        dst_reg,
        consumed: rm.consumed,
    }))
}

/// Fetch a 64-bit operand pair from the legacy bank. The legacy bank has no
/// extended half, so the high-register prefix bits do not apply here.
fn fetch_operands_64<M: TrapMemory, V: RegisterFile>(
    ctx: &mut TrapContext<'_, M, V>,
    bytes: &[u8],
) -> Result<Option<Fetched<u64>>> {
    let Some(rm) = decode_rm(bytes, ctx.state) else {
        return Ok(None);
    };
    let dst_reg = rm.reg;
    let dst = ctx.regs.read_mm(dst_reg);
    let src = match rm.operand {
        RmOperand::Register(r) => ctx.regs.read_mm(r),
        RmOperand::Memory { address } => {
            let mut buf = [0u8; 8];
            ctx.memory.read(address, &mut buf, ctx.kernel_trap)?;
            u64::from_le_bytes(buf)
        }
    };
    Ok(Some(Fetched {
        src,
        dst,
        dst_reg,
        consumed: rm.consumed,
    }))
}

/// Locate a trailing immediate byte from the ModRM mod-field threshold
/// bands: register-direct and plain register-indirect forms put it right
/// after the ModRM byte, disp8 forms one byte later, disp32 forms five.
fn trailing_imm(bytes: &[u8], modrm_pos: usize) -> Option<u8> {
    let modrm = *bytes.get(modrm_pos)?;
    let offset = match modrm >> 6 {
        1 => 2,
        2 => 5,
        _ => 1,
    };
    bytes.get(modrm_pos + offset).copied()
}

// ---------------------------------------------------------------------------
// SSSE3 / SSE4.2 two-byte-escape group
// ---------------------------------------------------------------------------

pub struct Ssse3Decoder;

impl Ssse3Decoder {
    fn string_compare<M: TrapMemory, V: RegisterFile>(
        &self,
        bytes: &[u8],
        ctx: &mut TrapContext<'_, M, V>,
        opcode: u8,
        modrm_pos: usize,
        src_high: bool,
        dst_high: bool,
    ) -> Result<usize> {
        let Some(op) = fetch_operands_128(ctx, &bytes[modrm_pos..], src_high, dst_high)? else {
            return Ok(0);
        };
        let Some(control) = trailing_imm(bytes, modrm_pos) else {
            return Ok(0);
        };

        let result = match opcode {
            // Explicit lengths live in the A and D registers.
            0x60 | 0x61 => {
                let (len_a, len_b) = match ctx.state {
                    SavedState::Bit32(s) => (s.eax as i32, s.edx as i32),
                    SavedState::Bit64(s) => (s.rax as i32, s.rdx as i32),
                };
                simd::pcmpestr(op.dst, op.src, len_a, len_b, control)
            }
            _ => simd::pcmpistr(op.dst, op.src, control),
        };

        if opcode & 0x01 != 0 {
            // Index forms write the C register.
            match ctx.state {
                SavedState::Bit32(s) => s.ecx = result.index,
                SavedState::Bit64(s) => s.rcx = result.index as u64,
            }
        } else {
            // Mask forms write xmm0.
            ctx.regs.write_xmm(0, result.mask);
        }

        let mut flags = ctx.state.flags();
        flags.remove(
            RFlags::CF | RFlags::ZF | RFlags::SF | RFlags::OF | RFlags::AF | RFlags::PF,
        );
        flags.set(RFlags::CF, result.cf);
        flags.set(RFlags::ZF, result.zf);
        flags.set(RFlags::SF, result.sf);
        flags.set(RFlags::OF, result.of);
        ctx.state.set_flags(flags);

        Ok(modrm_pos + op.consumed + 1)
    }
}

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for Ssse3Decoder {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        let mut pos = 0usize;
        let mut wide = false;
        let mut src_high = false;
        let mut dst_high = false;

        // Prefixes: 0x66 selects the 128-bit bank, 0x40..=0x4F selects the
        // extended registers of that bank.
        if bytes.first() == Some(&0x66) {
            wide = true;
            pos += 1;
        }
        if let Some(&b) = bytes.get(pos) {
            if b & 0xF0 == 0x40 {
                src_high = b & 0x01 != 0;
                dst_high = b & 0x04 != 0;
                pos += 1;
            }
        }

        if bytes.get(pos) != Some(&0x0F) {
            return Ok(0);
        }
        pos += 1;

        let (Some(&escape), Some(&opcode)) = (bytes.get(pos), bytes.get(pos + 1)) else {
            return Ok(0);
        };
        let known = match escape {
            0x38 => matches!(opcode, 0x00..=0x0B | 0x1C..=0x1E | 0x37),
            0x3A => matches!(opcode, 0x0F | 0x60..=0x63),
            _ => false,
        };
        if !known {
            return Ok(0);
        }
        pos += 2;
        let modrm_pos = pos;

        if escape == 0x3A && (0x60..=0x63).contains(&opcode) {
            // SSE4.2 string compare: 128-bit only, its own write-back.
            if !wide {
                return Ok(0);
            }
            return self.string_compare(bytes, ctx, opcode, modrm_pos, src_high, dst_high);
        }
        if opcode == 0x37 && !wide {
            // pcmpgtq has no legacy form.
            return Ok(0);
        }

        if wide {
            let Some(op) = fetch_operands_128(ctx, &bytes[modrm_pos..], src_high, dst_high)?
            else {
                return Ok(0);
            };
            let mut len = modrm_pos + op.consumed;
            let result = match opcode {
                0x00 => simd::pshufb128(op.dst, op.src),
                0x01 => simd::phaddw128(op.dst, op.src),
                0x02 => simd::phaddd128(op.dst, op.src),
                0x03 => simd::phaddsw128(op.dst, op.src),
                0x04 => simd::pmaddubsw128(op.dst, op.src),
                0x05 => simd::phsubw128(op.dst, op.src),
                0x06 => simd::phsubd128(op.dst, op.src),
                0x07 => simd::phsubsw128(op.dst, op.src),
                0x08 => simd::psignb128(op.dst, op.src),
                0x09 => simd::psignw128(op.dst, op.src),
                0x0A => simd::psignd128(op.dst, op.src),
                0x0B => simd::pmulhrsw128(op.dst, op.src),
                0x0F => {
                    let Some(imm) = trailing_imm(bytes, modrm_pos) else {
                        return Ok(0);
                    };
                    len += 1;
                    simd::palignr128(op.dst, op.src, imm)
                }
                0x1C => simd::pabsb128(op.src),
                0x1D => simd::pabsw128(op.src),
                0x1E => simd::pabsd128(op.src),
                _ => simd::pcmpgtq128(op.dst, op.src),
            };
            ctx.regs.write_xmm(op.dst_reg, result);
            Ok(len)
        } else {
            let Some(op) = fetch_operands_64(ctx, &bytes[modrm_pos..])? else {
                return Ok(0);
            };
            let mut len = modrm_pos + op.consumed;
            let result = match opcode {
                0x00 => simd::pshufb64(op.dst, op.src),
                0x01 => simd::phaddw64(op.dst, op.src),
                0x02 => simd::phaddd64(op.dst, op.src),
                0x03 => simd::phaddsw64(op.dst, op.src),
                0x04 => simd::pmaddubsw64(op.dst, op.src),
                0x05 => simd::phsubw64(op.dst, op.src),
                0x06 => simd::phsubd64(op.dst, op.src),
                0x07 => simd::phsubsw64(op.dst, op.src),
                0x08 => simd::psignb64(op.dst, op.src),
                0x09 => simd::psignw64(op.dst, op.src),
                0x0A => simd::psignd64(op.dst, op.src),
                0x0B => simd::pmulhrsw64(op.dst, op.src),
                0x0F => {
                    let Some(imm) = trailing_imm(bytes, modrm_pos) else {
                        return Ok(0);
                    };
                    len += 1;
                    simd::palignr64(op.dst, op.src, imm)
                }
                0x1C => simd::pabsb64(op.src),
                0x1D => simd::pabsw64(op.src),
                _ => simd::pabsd64(op.src),
            };
            ctx.regs.write_mm(op.dst_reg, result);
            Ok(len)
        }
    }
}

// ---------------------------------------------------------------------------
// SSE3 sub-groups, split by mandatory prefix
// ---------------------------------------------------------------------------

/// `F2 0F`: movddup, haddps, hsubps, addsubps, lddqu.
pub struct Sse3ScalarDecoder;

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for Sse3ScalarDecoder {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        if bytes.first() != Some(&0xF2) || bytes.get(1) != Some(&0x0F) {
            return Ok(0);
        }
        let Some(&opcode) = bytes.get(2) else {
            return Ok(0);
        };
        if !matches!(opcode, 0x12 | 0x7C | 0x7D | 0xD0 | 0xF0) {
            return Ok(0);
        }
        let Some(op) = fetch_operands_128(ctx, &bytes[3..], false, false)? else {
            return Ok(0);
        };
        let result = match opcode {
            0x12 => simd::movddup(op.src),
            0x7C => simd::haddps(op.dst, op.src),
            0x7D => simd::hsubps(op.dst, op.src),
            0xD0 => simd::addsubps(op.dst, op.src),
            // lddqu: an unaligned load, the fetched value is the result.
            _ => op.src,
        };
        ctx.regs.write_xmm(op.dst_reg, result);
        Ok(3 + op.consumed)
    }
}

/// `F3 0F`: movsldup, movshdup.
pub struct Sse3DupDecoder;

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for Sse3DupDecoder {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        if bytes.first() != Some(&0xF3) || bytes.get(1) != Some(&0x0F) {
            return Ok(0);
        }
        let Some(&opcode) = bytes.get(2) else {
            return Ok(0);
        };
        if !matches!(opcode, 0x12 | 0x16) {
            return Ok(0);
        }
        let Some(op) = fetch_operands_128(ctx, &bytes[3..], false, false)? else {
            return Ok(0);
        };
        let result = match opcode {
            0x12 => simd::movsldup(op.src),
            _ => simd::movshdup(op.src),
        };
        ctx.regs.write_xmm(op.dst_reg, result);
        Ok(3 + op.consumed)
    }
}

/// `66 0F`: haddpd, hsubpd, addsubpd.
pub struct Sse3PackedDecoder;

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for Sse3PackedDecoder {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        if bytes.first() != Some(&0x66) || bytes.get(1) != Some(&0x0F) {
            return Ok(0);
        }
        let Some(&opcode) = bytes.get(2) else {
            return Ok(0);
        };
        if !matches!(opcode, 0x7C | 0x7D | 0xD0) {
            return Ok(0);
        }
        let Some(op) = fetch_operands_128(ctx, &bytes[3..], false, false)? else {
            return Ok(0);
        };
        let result = match opcode {
            0x7C => simd::haddpd(op.dst, op.src),
            0x7D => simd::hsubpd(op.dst, op.src),
            _ => simd::addsubpd(op.dst, op.src),
        };
        ctx.regs.write_xmm(op.dst_reg, result);
        Ok(3 + op.consumed)
    }
}

// ---------------------------------------------------------------------------
// FISTTP: truncating x87 store-and-pop
// ---------------------------------------------------------------------------

pub struct FisttpDecoder;

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for FisttpDecoder {
    fn try_decode(&self, bytes: &[u8], ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        let mut pos = 0usize;
        if bytes.first() == Some(&0x66) {
            pos += 1;
        }
        let opcode = match bytes.get(pos) {
            Some(&b @ (0xDB | 0xDD | 0xDF)) => b,
            _ => return Ok(0),
        };
        pos += 1;
        let Some(&modrm) = bytes.get(pos) else {
            return Ok(0);
        };
        pos += 1;
        let mod_bits = modrm >> 6;
        let rm = modrm & 0x07;

        // Only register-indirect and +disp8 forms are valid encodings here;
        // rm 4 (SIB) and the mod 0 rm 5 disp32 form name addresses this
        // grammar cannot compute.
        if mod_bits > 1 || rm == 4 || (mod_bits == 0 && rm == 5) {
            return Ok(0);
        }

        let mut address = ctx.state.addr_reg(rm);
        if mod_bits == 1 {
            let Some(&disp) = bytes.get(pos) else {
                return Ok(0);
            };
            pos += 1;
            address = address.wrapping_add(disp as i8 as i64 as u64);
        }
        if !ctx.state.is_64() {
            address &= 0xFFFF_FFFF;
        }

        let value = ctx.regs.fpu_pop();
        match opcode {
            0xDB => {
                let stored = value as i32;
                ctx.memory
                    .write(address, &stored.to_le_bytes(), ctx.kernel_trap)?;
            }
            0xDD => {
                let stored = value as i64;
                ctx.memory
                    .write(address, &stored.to_le_bytes(), ctx.kernel_trap)?;
            }
            _ => {
                let stored = value as i16;
                ctx.memory
                    .write(address, &stored.to_le_bytes(), ctx.kernel_trap)?;
            }
        }

        Ok(pos)
    }
}

// ---------------------------------------------------------------------------
// MONITOR / MWAIT: recognized, deliberately inert
// ---------------------------------------------------------------------------

pub struct MonitorMwaitDecoder;

impl<M: TrapMemory, V: RegisterFile> InstructionDecoder<M, V> for MonitorMwaitDecoder {
    fn try_decode(&self, bytes: &[u8], _ctx: &mut TrapContext<'_, M, V>) -> Result<usize> {
        if bytes.len() >= 3
            && bytes[0] == 0x0F
            && bytes[1] == 0x01
            && (bytes[2] == 0xC8 || bytes[2] == 0xC9)
        {
            // No address-range monitoring on this host; skipping is the
            // emulation.
            Ok(3)
        } else {
            Ok(0)
        }
    }
}
