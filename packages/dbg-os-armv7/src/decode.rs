//! Working out where execution continues after an instruction.
//!
//! Condition flags aren't evaluated. A conditional instruction that can write the PC reports
//! both the fallthrough and its target, and the engine plants a breakpoint on each.
//!
//! Targets use the same tagging as breakpoint addresses: bit 0 is set when the target is Thumb
//! code.

use arbitrary_int::{u2, u3, u4, u5, u24};
use bitbybit::bitfield;
use dbg_os::{OsError, Successors};

use crate::frame::ExceptionFrame;

const PC: u4 = u4::new(15);
const ALWAYS: u4 = u4::new(0b1110);
const UNCONDITIONAL: u4 = u4::new(0b1111);

/// `b`, `bl` and `blx <label>`.
#[bitfield(u32)]
struct Branch {
    #[bits(28..=31, r)]
    cond: u4,
    #[bits(25..=27, r)]
    op: u3,
    /// The link bit, or bit 1 of the offset for `blx`.
    #[bit(24, r)]
    link: bool,
    #[bits(0..=23, r)]
    imm24: u24,
}

/// `ldm` and `pop`.
#[bitfield(u32)]
struct LoadMultiple {
    #[bit(24, r)]
    before: bool,
    #[bit(23, r)]
    up: bool,
    #[bit(20, r)]
    load: bool,
    #[bits(16..=19, r)]
    base: u4,
    #[bits(0..=15, r)]
    registers: u16,
}

/// `ldr` of a single word.
#[bitfield(u32)]
struct LoadWord {
    #[bit(25, r)]
    register_offset: bool,
    #[bit(24, r)]
    pre_index: bool,
    #[bit(23, r)]
    up: bool,
    #[bit(22, r)]
    byte: bool,
    #[bit(20, r)]
    load: bool,
    #[bits(16..=19, r)]
    base: u4,
    #[bits(12..=15, r)]
    dest: u4,
}

/// The offset operand of a register-offset `ldr`.
#[bitfield(u32)]
struct ShiftedRegister {
    #[bits(7..=11, r)]
    amount: u5,
    #[bits(5..=6, r)]
    kind: u2,
    #[bit(4, r)]
    by_register: bool,
    #[bits(0..=3, r)]
    register: u4,
}

/// Where an instruction sends execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// On to the next instruction.
    Next,
    /// Always to the target.
    Jump(usize),
    /// Either to the next instruction or to the target.
    Branch(usize),
}

impl Flow {
    const fn successors(self, next: usize) -> Successors {
        match self {
            Self::Next => [Some(next), None],
            Self::Jump(target) => [Some(target), None],
            Self::Branch(target) => [Some(next), Some(target)],
        }
    }
}

/// Returns the value of register `n` as an instruction whose PC reads as `pc` sees it.
fn register(frame: &ExceptionFrame, n: u4, pc: usize) -> usize {
    match n.value() {
        n @ 0..=12 => frame.registers[usize::from(n)] as usize,
        13 => frame.stack_pointer,
        14 => frame.link_register,
        _ => pc,
    }
}

fn sign_extend(value: u32, bits: u32) -> isize {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as isize
}

/// Decodes the ARM instruction `opcode` at `pc`.
///
/// `read` loads a word of data memory, for returns that pop the PC off the stack.
pub(crate) fn arm_successors(
    opcode: u32,
    pc: usize,
    frame: &ExceptionFrame,
    read: impl Fn(usize) -> Result<u32, OsError>,
) -> Result<Successors, OsError> {
    let cond = Branch::new_with_raw_value(opcode).cond();
    let flow = match arm_flow(opcode, pc, frame, read)? {
        Flow::Jump(target) if cond != ALWAYS && cond != UNCONDITIONAL => Flow::Branch(target),
        flow => flow,
    };
    Ok(flow.successors(pc + 4))
}

fn arm_flow(
    opcode: u32,
    pc: usize,
    frame: &ExceptionFrame,
    read: impl Fn(usize) -> Result<u32, OsError>,
) -> Result<Flow, OsError> {
    let visible_pc = pc + 8;

    let branch = Branch::new_with_raw_value(opcode);
    if branch.op() == u3::new(0b101) {
        let offset = sign_extend(branch.imm24().value(), 24) << 2;
        return Ok(Flow::Jump(if branch.cond() == UNCONDITIONAL {
            // blx switches to Thumb.
            let half = isize::from(branch.link()) << 1;
            visible_pc.wrapping_add_signed(offset + half) | 1
        } else {
            visible_pc.wrapping_add_signed(offset)
        }));
    }
    if branch.cond() == UNCONDITIONAL {
        return Ok(Flow::Next);
    }

    // bx, blx <register>
    if opcode & 0x0FFF_FFD0 == 0x012F_FF10 {
        let rm = u4::new((opcode & 0xF) as u8);
        return Ok(Flow::Jump(register(frame, rm, visible_pc)));
    }
    // mov pc, <register>
    if opcode & 0x0FEF_FFF0 == 0x01A0_F000 {
        let rm = u4::new((opcode & 0xF) as u8);
        return Ok(Flow::Jump(register(frame, rm, visible_pc)));
    }

    match branch.op().value() {
        0b100 => {
            let ldm = LoadMultiple::new_with_raw_value(opcode);
            if !ldm.load() || ldm.registers() & 0x8000 == 0 {
                return Ok(Flow::Next);
            }

            // The PC is the highest register, so it is always the last word transferred.
            let words = ldm.registers().count_ones() as usize;
            let base = register(frame, ldm.base(), visible_pc);
            let addr = match (ldm.before(), ldm.up()) {
                (false, true) => base.wrapping_add(4 * (words - 1)),
                (true, true) => base.wrapping_add(4 * words),
                (false, false) => base,
                (true, false) => base.wrapping_sub(4),
            };
            Ok(Flow::Jump(read(addr)? as usize))
        }
        0b010 | 0b011 => {
            let ldr = LoadWord::new_with_raw_value(opcode);
            if !ldr.load() || ldr.byte() || ldr.dest() != PC {
                return Ok(Flow::Next);
            }

            let offset = if ldr.register_offset() {
                let shifted = ShiftedRegister::new_with_raw_value(opcode);
                if shifted.by_register() || shifted.kind() != u2::new(0) {
                    return Err(OsError::Unsupported);
                }
                register(frame, shifted.register(), visible_pc) << shifted.amount().value()
            } else {
                (opcode & 0xFFF) as usize
            };

            let base = register(frame, ldr.base(), visible_pc);
            let addr = match (ldr.pre_index(), ldr.up()) {
                (false, _) => base,
                (true, true) => base.wrapping_add(offset),
                (true, false) => base.wrapping_sub(offset),
            };
            Ok(Flow::Jump(read(addr)? as usize))
        }
        // Arithmetic into the PC.
        0b000 | 0b001 if LoadWord::new_with_raw_value(opcode).dest() == PC => {
            Err(OsError::Unsupported)
        }
        _ => Ok(Flow::Next),
    }
}

/// Returns whether a Thumb halfword is the first half of a 32-bit instruction.
pub(crate) const fn is_wide(first: u16) -> bool {
    matches!(first >> 11, 0b11101..=0b11111)
}

/// Decodes the 16-bit Thumb instruction `op` at the untagged address `pc`.
pub(crate) fn thumb_successors(
    op: u16,
    pc: usize,
    frame: &ExceptionFrame,
    read: impl Fn(usize) -> Result<u32, OsError>,
) -> Result<Successors, OsError> {
    let visible_pc = pc + 4;
    let rm = u4::new(((op >> 3) & 0xF) as u8);

    let flow = match op >> 12 {
        0b1101 => {
            let cond = (op >> 8) & 0xF;
            // 0b1110 and 0b1111 are udf and svc.
            if cond < 0b1110 {
                let offset = sign_extend(u32::from(op & 0xFF), 8) << 1;
                Flow::Branch(visible_pc.wrapping_add_signed(offset) | 1)
            } else {
                Flow::Next
            }
        }
        0b1110 if op & 0x0800 == 0 => {
            let offset = sign_extend(u32::from(op & 0x7FF), 11) << 1;
            Flow::Jump(visible_pc.wrapping_add_signed(offset) | 1)
        }
        // pop {..., pc}
        0b1011 if op & 0x0F00 == 0x0D00 => {
            let words = (op & 0xFF).count_ones() as usize;
            Flow::Jump(read(frame.stack_pointer.wrapping_add(4 * words))? as usize)
        }
        // cbz, cbnz
        0b1011 if op & 0x0500 == 0x0100 => {
            let offset = (usize::from((op >> 9) & 1) << 6) | (usize::from((op >> 3) & 0x1F) << 1);
            Flow::Branch((visible_pc + offset) | 1)
        }
        // bx, blx <register>
        0b0100 if op & 0x0F00 == 0x0700 => Flow::Jump(register(frame, rm, visible_pc)),
        // mov pc, <register> stays in Thumb state.
        0b0100 if op & 0x0F87 == 0x0687 => Flow::Jump(register(frame, rm, visible_pc) | 1),
        // add pc, <register>
        0b0100 if op & 0x0F87 == 0x0487 => return Err(OsError::Unsupported),
        _ => Flow::Next,
    };

    Ok(flow.successors((pc + 2) | 1))
}

/// Decodes the 32-bit Thumb instruction made of `first` and `second` at the untagged address
/// `pc`.
pub(crate) fn wide_thumb_successors(
    first: u16,
    second: u16,
    pc: usize,
    frame: &ExceptionFrame,
    read: impl Fn(usize) -> Result<u32, OsError>,
) -> Result<Successors, OsError> {
    let visible_pc = pc + 4;
    let rn = u4::new((first & 0xF) as u8);
    let rt = u4::new((second >> 12) as u8);

    let flow = if first >> 11 == 0b11110 && second & 0x8000 != 0 {
        let s = u32::from((first >> 10) & 1);
        let j1 = u32::from((second >> 13) & 1);
        let j2 = u32::from((second >> 11) & 1);
        let i1 = !(j1 ^ s) & 1;
        let i2 = !(j2 ^ s) & 1;
        let high = s << 24 | i1 << 23 | i2 << 22 | u32::from(first & 0x3FF) << 12;

        match (second >> 12) & 0b101 {
            // bl, b.w
            0b101 | 0b001 => {
                let offset = sign_extend(high | u32::from(second & 0x7FF) << 1, 25);
                Flow::Jump(visible_pc.wrapping_add_signed(offset) | 1)
            }
            // blx <label> switches to ARM.
            0b100 => {
                let offset = sign_extend(high | u32::from(second & 0x7FE) << 1, 25);
                Flow::Jump((visible_pc & !3).wrapping_add_signed(offset))
            }
            _ => {
                let cond = (first >> 6) & 0xF;
                // Condition codes 0b111x hold the miscellaneous control instructions.
                if cond < 0b1110 {
                    let imm = s << 20
                        | j2 << 19
                        | j1 << 18
                        | u32::from(first & 0x3F) << 12
                        | u32::from(second & 0x7FF) << 1;
                    Flow::Branch(visible_pc.wrapping_add_signed(sign_extend(imm, 21)) | 1)
                } else {
                    Flow::Next
                }
            }
        }
    } else if second & 0x8000 != 0 && first & 0xFFD0 == 0xE890 {
        // ldmia/pop.w {..., pc}
        let words = second.count_ones() as usize;
        let base = register(frame, rn, visible_pc);
        Flow::Jump(read(base.wrapping_add(4 * (words - 1)))? as usize)
    } else if second & 0x8000 != 0 && first & 0xFFD0 == 0xE910 {
        // ldmdb {..., pc}
        Flow::Jump(read(register(frame, rn, visible_pc).wrapping_sub(4))? as usize)
    } else if first & 0xFF7F == 0xF85F && rt == PC {
        // ldr.w pc, <literal>
        let offset = usize::from(second & 0xFFF);
        let base = visible_pc & !3;
        let addr = if first & 0x0080 != 0 {
            base + offset
        } else {
            base - offset
        };
        Flow::Jump(read(addr)? as usize)
    } else if first & 0xFFF0 == 0xF8D0 && rt == PC {
        // ldr.w pc, [rn, #imm12]
        let addr = register(frame, rn, visible_pc).wrapping_add(usize::from(second & 0xFFF));
        Flow::Jump(read(addr)? as usize)
    } else if (first & 0xFFF0 == 0xF850 && rt == PC)
        || (first & 0xFFF0 == 0xE8D0 && second & 0xFFE0 == 0xF000)
    {
        // Indexed loads into the PC and table branches.
        return Err(OsError::Unsupported);
    } else {
        Flow::Next
    };

    Ok(flow.successors((pc + 4) | 1))
}

#[cfg(test)]
mod test {
    use super::*;

    const AT: usize = 0x0380_1000;

    fn no_memory(addr: usize) -> Result<u32, OsError> {
        Err(OsError::InvalidAddress { address: addr })
    }

    fn frame() -> ExceptionFrame {
        ExceptionFrame {
            program_counter: AT,
            stack_pointer: 0x0400_0000,
            link_register: 0x0380_2001,
            ..Default::default()
        }
    }

    #[test]
    fn arm_branches() {
        let frame = frame();

        // b .+0x40
        assert_eq!(
            arm_successors(0xEA00_000E, AT, &frame, no_memory),
            Ok([Some(AT + 0x40), None])
        );
        // bl .-8
        assert_eq!(
            arm_successors(0xEBFF_FFFC, AT, &frame, no_memory),
            Ok([Some(AT - 8), None])
        );
        // bne .+0x40
        assert_eq!(
            arm_successors(0x1A00_000E, AT, &frame, no_memory),
            Ok([Some(AT + 4), Some(AT + 0x40)])
        );
        // blx .+0x42, into Thumb
        assert_eq!(
            arm_successors(0xFB00_000E, AT, &frame, no_memory),
            Ok([Some((AT + 0x42) | 1), None])
        );
    }

    #[test]
    fn arm_register_branches() {
        let mut frame = frame();
        frame.registers[3] = 0x0380_4000;

        // bx lr
        assert_eq!(
            arm_successors(0xE12F_FF1E, AT, &frame, no_memory),
            Ok([Some(0x0380_2001), None])
        );
        // blx r3
        assert_eq!(
            arm_successors(0xE12F_FF33, AT, &frame, no_memory),
            Ok([Some(0x0380_4000), None])
        );
        // mov pc, lr
        assert_eq!(
            arm_successors(0xE1A0_F00E, AT, &frame, no_memory),
            Ok([Some(0x0380_2001), None])
        );
        // add pc, pc, r3
        assert_eq!(
            arm_successors(0xE08F_F003, AT, &frame, no_memory),
            Err(OsError::Unsupported)
        );
    }

    #[test]
    fn arm_returns_through_the_stack() {
        let frame = frame();
        let stack = |addr: usize| match addr {
            0x0400_0008 => Ok(0x0380_3000),
            _ => no_memory(addr),
        };

        // pop {r4, r5, pc}
        assert_eq!(
            arm_successors(0xE8BD_8030, AT, &frame, stack),
            Ok([Some(0x0380_3000), None])
        );
        // ldr pc, [sp, #8]
        assert_eq!(
            arm_successors(0xE59D_F008, AT, &frame, stack),
            Ok([Some(0x0380_3000), None])
        );
        // ldr r0, [sp, #8] doesn't leave
        assert_eq!(
            arm_successors(0xE59D_0008, AT, &frame, stack),
            Ok([Some(AT + 4), None])
        );
    }

    #[test]
    fn ordinary_instructions_fall_through() {
        let frame = frame();
        // mov r0, r0
        assert_eq!(
            arm_successors(0xE1A0_0000, AT, &frame, no_memory),
            Ok([Some(AT + 4), None])
        );
        // adds r0, r0, #1
        assert_eq!(
            thumb_successors(0x1C40, AT, &frame, no_memory),
            Ok([Some((AT + 2) | 1), None])
        );
    }

    #[test]
    fn thumb_branches() {
        let frame = frame();

        // b .+0x20
        assert_eq!(
            thumb_successors(0xE00E, AT, &frame, no_memory),
            Ok([Some((AT + 0x20) | 1), None])
        );
        // beq .-4
        assert_eq!(
            thumb_successors(0xD0FC, AT, &frame, no_memory),
            Ok([Some((AT + 2) | 1), Some((AT - 4) | 1)])
        );
        // cbz r0, .+0x10
        assert_eq!(
            thumb_successors(0xB130, AT, &frame, no_memory),
            Ok([Some((AT + 2) | 1), Some((AT + 0x10) | 1)])
        );
        // bx lr
        assert_eq!(
            thumb_successors(0x4770, AT, &frame, no_memory),
            Ok([Some(0x0380_2001), None])
        );
        // svc #0
        assert_eq!(
            thumb_successors(0xDF00, AT, &frame, no_memory),
            Ok([Some((AT + 2) | 1), None])
        );
    }

    #[test]
    fn thumb_pop_reads_the_return_address() {
        let frame = frame();
        let stack = |addr: usize| match addr {
            0x0400_0004 => Ok(0x0380_3001),
            _ => no_memory(addr),
        };

        // pop {r4, pc}
        assert_eq!(
            thumb_successors(0xBD10, AT, &frame, stack),
            Ok([Some(0x0380_3001), None])
        );
        // pop.w {r4, r5, pc}
        assert_eq!(
            wide_thumb_successors(0xE8BD, 0x8030, AT, &frame, |addr| match addr {
                0x0400_0008 => Ok(0x0380_3001),
                _ => no_memory(addr),
            }),
            Ok([Some(0x0380_3001), None])
        );
    }

    #[test]
    fn wide_thumb_branches() {
        let frame = frame();
        assert!(is_wide(0xF000));
        assert!(is_wide(0xE8BD));
        assert!(!is_wide(0xE00E));

        // bl .+0x100
        assert_eq!(
            wide_thumb_successors(0xF000, 0xF87E, AT, &frame, no_memory),
            Ok([Some((AT + 0x100) | 1), None])
        );
        // bl .-0x100
        assert_eq!(
            wide_thumb_successors(0xF7FF, 0xFF7E, AT, &frame, no_memory),
            Ok([Some((AT - 0x100) | 1), None])
        );
        // blx .+0x100, into ARM
        assert_eq!(
            wide_thumb_successors(0xF000, 0xE87E, AT, &frame, no_memory),
            Ok([Some(AT + 0x100), None])
        );
        // bne.w .+0x100
        assert_eq!(
            wide_thumb_successors(0xF040, 0x807E, AT, &frame, no_memory),
            Ok([Some((AT + 4) | 1), Some((AT + 0x100) | 1)])
        );
        // tbb [pc, r0]
        assert_eq!(
            wide_thumb_successors(0xE8DF, 0xF000, AT, &frame, no_memory),
            Err(OsError::Unsupported)
        );
        // movw r0, #0
        assert_eq!(
            wide_thumb_successors(0xF240, 0x0000, AT, &frame, no_memory),
            Ok([Some((AT + 4) | 1), None])
        );
    }
}
