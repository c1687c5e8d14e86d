use crate::handler::HandlerKind;
use crate::hart::Hart;
use crate::instruction::{
    BranchCondition, FenceOrderCombination, Instruction, LoadWidth, RegImmOp, RegRegOp,
    RegShiftImmOp, StoreWidth,
};
use crate::memory::MemoryError;
use crate::registers::{Registers, Specifier};
use crate::Error;

type ExecutionResult = Result<(), Error>;

/// Executes `instruction`, which was fetched from the hart's current `pc`.
///
/// Every instruction sets the hart's next pc. The loop checks it and commits it afterwards.
pub(crate) fn execute_instruction(hart: &mut Hart, instruction: Instruction) -> ExecutionResult {
    let mut executor = Executor { hart };
    match instruction {
        Instruction::OpImm {
            op,
            dest,
            src,
            immediate,
        } => {
            let op = match op {
                RegImmOp::Addi => Executor::addi,
                RegImmOp::Slti => Executor::slti,
                RegImmOp::Sltiu => Executor::sltiu,
                RegImmOp::Xori => Executor::xori,
                RegImmOp::Ori => Executor::ori,
                RegImmOp::Andi => Executor::andi,
            };
            op(&mut executor, dest, src, immediate)
        }
        Instruction::OpShiftImm {
            op,
            dest,
            src,
            shift_amount_u5,
        } => {
            let op = match op {
                RegShiftImmOp::Slli => Executor::slli,
                RegShiftImmOp::Srli => Executor::srli,
                RegShiftImmOp::Srai => Executor::srai,
            };
            op(&mut executor, dest, src, shift_amount_u5)
        }
        Instruction::Auipc { dest, immediate } => executor.auipc(dest, immediate),
        Instruction::Lui { dest, immediate } => executor.lui(dest, immediate),
        Instruction::Op {
            op,
            dest,
            src1,
            src2,
        } => {
            let op = match op {
                RegRegOp::Add => Executor::add,
                RegRegOp::Slt => Executor::slt,
                RegRegOp::Sltu => Executor::sltu,
                RegRegOp::And => Executor::and,
                RegRegOp::Or => Executor::or,
                RegRegOp::Xor => Executor::xor,
                RegRegOp::Sll => Executor::sll,
                RegRegOp::Srl => Executor::srl,
                RegRegOp::Sub => Executor::sub,
                RegRegOp::Sra => Executor::sra,
            };
            op(&mut executor, dest, src1, src2)
        }
        Instruction::Jal { dest, offset } => executor.jal(dest, offset),
        Instruction::Jalr { dest, base, offset } => executor.jalr(dest, base, offset),
        Instruction::Branch {
            condition,
            src1,
            src2,
            offset,
        } => {
            let op = match condition {
                BranchCondition::Beq => Executor::beq,
                BranchCondition::Bne => Executor::bne,
                BranchCondition::Blt => Executor::blt,
                BranchCondition::Bltu => Executor::bltu,
                BranchCondition::Bge => Executor::bge,
                BranchCondition::Bgeu => Executor::bgeu,
            };
            op(&mut executor, src1, src2, offset)
        }
        Instruction::Load {
            width,
            dest,
            base,
            offset,
        } => {
            let op = match width {
                LoadWidth::Lb => Executor::lb,
                LoadWidth::Lh => Executor::lh,
                LoadWidth::Lw => Executor::lw,
                LoadWidth::Lbu => Executor::lbu,
                LoadWidth::Lhu => Executor::lhu,
            };
            op(&mut executor, dest, base, offset)
        }
        Instruction::Store {
            width,
            src,
            base,
            offset,
        } => {
            let op = match width {
                StoreWidth::Sb => Executor::sb,
                StoreWidth::Sh => Executor::sh,
                StoreWidth::Sw => Executor::sw,
            };
            op(&mut executor, src, base, offset)
        }
        Instruction::Fence {
            predecessor,
            successor,
        } => executor.fence(predecessor, successor),
        Instruction::Ecall => executor.ecall(),
        Instruction::Ebreak => executor.ebreak(),
    }
}

#[derive(Debug)]
struct Executor<'h> {
    hart: &'h mut Hart,
}

impl<'h> Executor<'h> {
    /// Executes an `addi` instruction.
    ///
    /// > ADDI adds the sign-extended 12-bit immediate to register rs1. Arithmetic overflow is
    /// > ignored and the result is simply the low XLEN bits of the result.
    fn addi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s.wrapping_add_signed(imm))
    }

    /// Executes a `slti` instruction.
    ///
    /// > SLTI (set less than immediate) places the value 1 in register rd if register rs1 is less
    /// > than the sign-extended immediate when both are treated as signed numbers, else 0 is
    /// > written to rd.
    fn slti(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| ((s as i32) < imm) as u32)
    }

    /// Executes a `sltiu` instruction.
    ///
    /// The immediate is sign-extended first, then compared as an unsigned number.
    fn sltiu(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| (s < (imm as u32)) as u32)
    }

    fn andi(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s & (imm as u32))
    }

    fn ori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s | (imm as u32))
    }

    fn xori(&mut self, dest: Specifier, src: Specifier, immediate: i32) -> ExecutionResult {
        self.reg_imm_op(dest, src, immediate, |s, imm| s ^ (imm as u32))
    }

    /// Executes a `slli` instruction.
    ///
    /// > SLLI is a logical left shift (zeros are shifted into the lower bits).
    fn slli(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s << shamt)
    }

    /// Executes a `srli` instruction.
    ///
    /// > SRLI is a logical right shift (zeros are shifted into the upper bits).
    fn srli(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| s >> shamt)
    }

    /// Executes a `srai` instruction.
    ///
    /// > SRAI is an arithmetic right shift (the original sign bit is copied into the vacated upper
    /// > bits).
    fn srai(&mut self, dest: Specifier, src: Specifier, shift_amount_u5: u32) -> ExecutionResult {
        self.reg_shamt_op(dest, src, shift_amount_u5, |s, shamt| {
            ((s as i32) >> shamt) as u32
        })
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI places the U-immediate value in the top 20 bits of the destination register rd,
    /// > filling in the lowest 12 bits with zeros.
    fn lui(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        self.hart
            .registers_mut()
            .set_x(dest, immediate as u32 & !0xFFF);
        Ok(())
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC forms a 32-bit offset from the 20-bit U-immediate, filling in the lowest 12 bits
    /// > with zeros, adds this offset to the address of the AUIPC instruction, then places the
    /// > result in register rd.
    fn auipc(&mut self, dest: Specifier, immediate: i32) -> ExecutionResult {
        let registers = self.hart.registers_mut();
        let result = registers.pc().wrapping_add_signed(immediate & !0xFFF);
        registers.set_x(dest, result);
        Ok(())
    }

    fn add(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_add(s2))
    }

    fn sub(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1.wrapping_sub(s2))
    }

    fn slt(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) < (s2 as i32)) as u32
        })
    }

    fn sltu(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| (s1 < s2) as u32)
    }

    fn and(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 & s2)
    }

    fn or(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 | s2)
    }

    fn xor(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 ^ s2)
    }

    /// Executes a `sll` instruction.
    ///
    /// > SLL, SRL, and SRA perform logical left, logical right, and arithmetic right shifts on the
    /// > value in register rs1 by the shift amount held in the lower 5 bits of register rs2.
    fn sll(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 << (s2 & 0x1F))
    }

    fn srl(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| s1 >> (s2 & 0x1F))
    }

    fn sra(&mut self, dest: Specifier, src1: Specifier, src2: Specifier) -> ExecutionResult {
        self.reg_reg_op(dest, src1, src2, |s1, s2| {
            ((s1 as i32) >> (s2 & 0x1F)) as u32
        })
    }

    fn jal(&mut self, dest: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| registers.pc().wrapping_add_signed(offset))
    }

    /// Executes a `jalr` instruction.
    ///
    /// > The target address is obtained by adding the sign-extended 12-bit I-immediate to the
    /// > register rs1, then setting the least-significant bit of the result to zero.
    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.jump_op(dest, |registers| {
            registers.x(base).wrapping_add_signed(offset) & !1
        })
    }

    fn beq(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 == s2)
    }

    fn bne(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 != s2)
    }

    fn blt(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) < (s2 as i32))
    }

    fn bltu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 < s2)
    }

    fn bge(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| (s1 as i32) >= (s2 as i32))
    }

    fn bgeu(&mut self, src1: Specifier, src2: Specifier, offset: i32) -> ExecutionResult {
        self.cond_branch(src1, src2, offset, |s1, s2| s1 >= s2)
    }

    fn lb(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.memory()
                .read_byte(address)
                .map(|value| value as i8 as u32)
        })
    }

    fn lbu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.memory().read_byte(address).map(u32::from)
        })
    }

    fn lh(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.memory()
                .read_halfword(address)
                .map(|value| value as i16 as u32)
        })
    }

    fn lhu(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.memory().read_halfword(address).map(u32::from)
        })
    }

    fn lw(&mut self, dest: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.load_op(dest, base, offset, |hart, address| {
            hart.memory().read_word(address)
        })
    }

    fn sb(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |hart, address, value| {
            hart.memory_mut().write_byte(address, value as u8)
        })
    }

    fn sh(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |hart, address, value| {
            hart.memory_mut().write_halfword(address, value as u16)
        })
    }

    fn sw(&mut self, src: Specifier, base: Specifier, offset: i32) -> ExecutionResult {
        self.store_op(src, base, offset, |hart, address, value| {
            hart.memory_mut().write_word(address, value)
        })
    }

    fn fence(
        &mut self,
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    ) -> ExecutionResult {
        // A single hart observes its own accesses in order, so the ordering sets don't matter to
        // the simulation itself. The environment handler still sees the fence.
        let _ = predecessor;
        let _ = successor;
        self.hart.invoke(HandlerKind::Environment);
        Ok(())
    }

    fn ecall(&mut self) -> ExecutionResult {
        self.hart.invoke(HandlerKind::Environment);
        Ok(())
    }

    fn ebreak(&mut self) -> ExecutionResult {
        self.hart.invoke(HandlerKind::Environment);
        Ok(())
    }

    #[inline]
    fn reg_imm_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, i32) -> u32,
    {
        let registers = self.hart.registers_mut();
        registers.set_x(dest, op(registers.x(src), immediate));
        Ok(())
    }

    #[inline]
    fn reg_shamt_op<F>(
        &mut self,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = self.hart.registers_mut();
        registers.set_x(dest, op(registers.x(src), shift_amount_u5 & 0x1F));
        Ok(())
    }

    #[inline]
    fn reg_reg_op<F>(
        &mut self,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
        op: F,
    ) -> ExecutionResult
    where
        F: FnOnce(u32, u32) -> u32,
    {
        let registers = self.hart.registers_mut();
        registers.set_x(dest, op(registers.x(src1), registers.x(src2)));
        Ok(())
    }

    fn jump_op<F>(&mut self, dest: Specifier, compute_target: F) -> ExecutionResult
    where
        F: FnOnce(&Registers) -> u32,
    {
        // Compute the target before `dest` is overwritten, it may be the base register.
        let registers = self.hart.registers_mut();
        let target = compute_target(registers);
        let link = registers.pc().wrapping_add(4);
        registers.set_x(dest, link);
        self.hart.set_target_address(target);
        self.hart.set_next_pc(target);
        Ok(())
    }

    // Takes the branch if `predicate` returns `true`.
    fn cond_branch<P>(
        &mut self,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        predicate: P,
    ) -> ExecutionResult
    where
        P: FnOnce(u32, u32) -> bool,
    {
        let registers = self.hart.registers();
        let target = registers.pc().wrapping_add_signed(offset);
        let taken = predicate(registers.x(src1), registers.x(src2));
        self.hart.set_target_address(target);
        if taken {
            self.hart.set_next_pc(target);
        }
        Ok(())
    }

    #[inline]
    fn load_op<F>(&mut self, dest: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&Hart, u32) -> Result<u32, MemoryError>,
    {
        let registers = self.hart.registers();
        let pc = registers.pc();
        let address = registers.x(base).wrapping_add_signed(offset);
        self.hart.set_target_address(address);
        let value = op(&*self.hart, address).map_err(|source| Error::Memory { source, pc })?;
        self.hart.registers_mut().set_x(dest, value);
        Ok(())
    }

    /// Performs the store, then gives the MMIO handler a chance to react to it.
    #[inline]
    fn store_op<F>(&mut self, src: Specifier, base: Specifier, offset: i32, op: F) -> ExecutionResult
    where
        F: FnOnce(&mut Hart, u32, u32) -> Result<(), MemoryError>,
    {
        let registers = self.hart.registers();
        let pc = registers.pc();
        let value = registers.x(src);
        let address = registers.x(base).wrapping_add_signed(offset);
        self.hart.set_target_address(address);
        op(&mut *self.hart, address, value).map_err(|source| Error::Memory { source, pc })?;
        self.hart.invoke(HandlerKind::Mmio);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::hart::tests::hart_with_program;
    use crate::{HandlerTable, Halt};

    /// Runs a single instruction at pc `0x100` with `x1 = a` and `x2 = b`, returning `x3`.
    fn alu(raw_instruction: u32, a: u32, b: u32) -> u32 {
        let mut hart = hart_with_program(&[], HandlerTable::default());
        *hart.registers_mut().pc_mut() = 0x100;
        hart.memory_mut().write_word(0x100, raw_instruction).unwrap();
        hart.registers_mut().set_x(Specifier::from_u5(1), a);
        hart.registers_mut().set_x(Specifier::from_u5(2), b);
        assert_eq!(Ok(None), hart.step());
        assert_eq!(0x104, hart.registers().pc());
        hart.registers().x(Specifier::from_u5(3))
    }

    /// Runs a single control transfer at pc `0x100` and returns the next pc.
    fn next_pc(raw_instruction: u32, a: u32, b: u32) -> u32 {
        let mut hart = hart_with_program(&[], HandlerTable::default());
        *hart.registers_mut().pc_mut() = 0x100;
        hart.memory_mut().write_word(0x100, raw_instruction).unwrap();
        hart.registers_mut().set_x(Specifier::from_u5(1), a);
        hart.registers_mut().set_x(Specifier::from_u5(2), b);
        assert_eq!(Ok(None), hart.step());
        hart.registers().pc()
    }

    #[test]
    fn test_reg_reg_ops() {
        assert_eq!(0x0000_0000, alu(asm::add(3, 1, 2), 0xFFFF_FFFF, 1));
        assert_eq!(0xFFFF_FFFF, alu(asm::sub(3, 1, 2), 0, 1));
        assert_eq!(0xC000_0000, alu(asm::sra(3, 1, 2), 0x8000_0000, 1));
        assert_eq!(0x4000_0000, alu(asm::srl(3, 1, 2), 0x8000_0000, 1));
        // Only the low 5 bits of rs2 count
        assert_eq!(0x0000_0002, alu(asm::sll(3, 1, 2), 1, 33));
        assert_eq!(0, alu(asm::sltu(3, 1, 2), 0xFFFF_FFFF, 0));
        assert_eq!(1, alu(asm::slt(3, 1, 2), 0xFFFF_FFFF, 0));
        assert_eq!(0b0110, alu(asm::xor(3, 1, 2), 0b1010, 0b1100));
        assert_eq!(0b1110, alu(asm::or(3, 1, 2), 0b1010, 0b1100));
        assert_eq!(0b1000, alu(asm::and(3, 1, 2), 0b1010, 0b1100));
    }

    const OPERANDS: [u32; 4] = [0, 1, 0x8000_0000, 0xFFFF_FFFF];

    #[test]
    fn test_reg_reg_ops_over_edge_operands() {
        type Reference = fn(u32, u32) -> u32;
        let ops: [(fn(u32, u32, u32) -> u32, Reference); 10] = [
            (asm::add, |a, b| a.wrapping_add(b)),
            (asm::sub, |a, b| a.wrapping_sub(b)),
            (asm::sll, |a, b| a << (b & 0x1F)),
            (asm::srl, |a, b| a >> (b & 0x1F)),
            (asm::sra, |a, b| ((a as i32) >> (b & 0x1F)) as u32),
            (asm::slt, |a, b| u32::from((a as i32) < (b as i32))),
            (asm::sltu, |a, b| u32::from(a < b)),
            (asm::xor, |a, b| a ^ b),
            (asm::or, |a, b| a | b),
            (asm::and, |a, b| a & b),
        ];
        for (encode, reference) in ops {
            let raw = encode(3, 1, 2);
            for a in OPERANDS {
                for b in OPERANDS {
                    assert_eq!(reference(a, b), alu(raw, a, b), "{raw:#010x} {a:#x} {b:#x}");
                }
            }
        }
    }

    #[test]
    fn test_reg_imm_ops_over_edge_operands() {
        type Reference = fn(u32, u32) -> u32;
        let ops: [(fn(u32, u32, i32) -> u32, Reference); 6] = [
            (asm::addi, |a, imm| a.wrapping_add(imm)),
            (asm::slti, |a, imm| u32::from((a as i32) < (imm as i32))),
            (asm::sltiu, |a, imm| u32::from(a < imm)),
            (asm::xori, |a, imm| a ^ imm),
            (asm::ori, |a, imm| a | imm),
            (asm::andi, |a, imm| a & imm),
        ];
        for (encode, reference) in ops {
            for imm in [0, 1, -1, 2047, -2048] {
                let raw = encode(3, 1, imm);
                for a in OPERANDS {
                    assert_eq!(reference(a, imm as u32), alu(raw, a, 0), "{raw:#010x} {a:#x}");
                }
            }
        }
    }

    #[test]
    fn test_reg_imm_ops() {
        assert_eq!(0x7FF, alu(asm::addi(3, 1, 0x7FF), 0, 0));
        assert_eq!(0xFFFF_FFFE, alu(asm::addi(3, 1, -2), 0, 0));
        assert_eq!(1, alu(asm::slti(3, 1, -1), 0x8000_0000, 0));
        // -1 becomes 0xFFFFFFFF before the unsigned compare
        assert_eq!(1, alu(asm::sltiu(3, 1, -1), 0xFFFF_FFFE, 0));
        assert_eq!(0, alu(asm::sltiu(3, 1, 1), 5, 0));
        assert_eq!(0xFFFF_F0F0, alu(asm::xori(3, 1, -1), 0x0F0F, 0));
        assert_eq!(0xFFFF_FFFF, alu(asm::ori(3, 1, -16), 0xF, 0));
        assert_eq!(0x0000_0700, alu(asm::andi(3, 1, 0x7FF), 0xFFFF_FF00, 0));
        assert_eq!(0x8000_0000, alu(asm::slli(3, 1, 31), 1, 0));
        assert_eq!(0x0000_0001, alu(asm::srli(3, 1, 31), 0x8000_0000, 0));
        assert_eq!(0xFFFF_FFFF, alu(asm::srai(3, 1, 31), 0x8000_0000, 0));
    }

    #[test]
    fn test_upper_immediates() {
        assert_eq!(0x1234_5000, alu(asm::lui(3, 0x12345), 0, 0));
        assert_eq!(0x0000_1100, alu(asm::auipc(3, 1), 0, 0));
        assert_eq!(0xFFFF_F100, alu(asm::auipc(3, 0xFFFFF), 0, 0));
    }

    #[test]
    fn test_branches() {
        assert_eq!(0x108, next_pc(asm::beq(1, 2, 8), 5, 5));
        assert_eq!(0x104, next_pc(asm::beq(1, 2, 8), 5, 6));
        assert_eq!(0x0F8, next_pc(asm::bne(1, 2, -8), 5, 6));
        assert_eq!(0x110, next_pc(asm::blt(1, 2, 16), 0xFFFF_FFFF, 0));
        assert_eq!(0x104, next_pc(asm::bltu(1, 2, 16), 0xFFFF_FFFF, 0));
        assert_eq!(0x110, next_pc(asm::bge(1, 2, 16), 0, 0xFFFF_FFFF));
        assert_eq!(0x104, next_pc(asm::bgeu(1, 2, 16), 0, 0xFFFF_FFFF));
        assert_eq!(0x000, next_pc(asm::bgeu(1, 2, -0x100), 3, 3));
    }

    #[test]
    fn test_jumps() {
        let mut hart = hart_with_program(&[], HandlerTable::default());
        *hart.registers_mut().pc_mut() = 0x100;
        hart.memory_mut().write_word(0x100, asm::jal(1, -0x80)).unwrap();
        assert_eq!(Ok(None), hart.step());
        assert_eq!(0x80, hart.registers().pc());
        assert_eq!(0x104, hart.registers().x(Specifier::RA));
        assert_eq!(0x80, hart.target_address());

        // jalr clears bit 0 and may use its destination as base
        hart.memory_mut().write_word(0x80, asm::jalr(1, 1, 0x11)).unwrap();
        assert_eq!(Ok(None), hart.step());
        assert_eq!(0x114, hart.registers().pc());
        assert_eq!(0x84, hart.registers().x(Specifier::RA));
    }

    #[test]
    fn test_loads_and_stores() {
        let program = [
            asm::li(1, -2),
            asm::sw(1, 0, 0x200),
            asm::lb(3, 0, 0x200),
            asm::lbu(4, 0, 0x200),
            asm::lh(5, 0, 0x201),
            asm::lhu(6, 0, 0x201),
            asm::sh(1, 0, 0x210),
            asm::sb(0, 0, 0x210),
            asm::lw(7, 0, 0x210),
            asm::EBREAK,
        ];
        let mut hart = hart_with_program(&program, HandlerTable::default());
        assert_eq!(Ok(Halt::Breakpoint), hart.run());
        let x = |i| hart.registers().x(Specifier::from_u5(i));
        assert_eq!(0xFFFF_FFFE, x(3));
        assert_eq!(0x0000_00FE, x(4));
        assert_eq!(0xFFFF_FFFF, x(5));
        assert_eq!(0x0000_FFFF, x(6));
        assert_eq!(0x0000_FF00, x(7));
    }

    #[test]
    fn test_load_out_of_bounds() {
        let program = [asm::lui(1, 0x8), asm::lw(2, 1, -2)];
        let mut hart = hart_with_program(&program, HandlerTable::default());
        assert_eq!(
            Err(Error::Memory {
                source: MemoryError::OutOfBounds {
                    address: 0x7FFE,
                    width: 4
                },
                pc: 4,
            }),
            hart.run()
        );
        assert_eq!(0x7FFE, hart.target_address());
    }

    #[test]
    fn test_store_out_of_bounds_skips_mmio() {
        let mut table = HandlerTable::default();
        table.set(HandlerKind::Mmio, |hart| hart.halt(Halt::Exit(1)));
        let program = [asm::lui(1, 0x8), asm::sb(0, 1, 0)];
        let mut hart = hart_with_program(&program, table);
        assert!(matches!(hart.run(), Err(Error::Memory { pc: 4, .. })));
    }

    #[test]
    fn test_mmio_handler_sees_store_address() {
        let mut table = HandlerTable::default();
        table.set(HandlerKind::Mmio, |hart| {
            let value = hart.memory().read_byte(hart.target_address()).unwrap_or(0);
            hart.halt(Halt::Exit(i32::from(value)));
        });
        let program = [asm::li(1, 0x2A), asm::sb(1, 0, 0x300), asm::EBREAK];
        let mut hart = hart_with_program(&program, table);
        assert_eq!(Ok(Halt::Exit(0x2A)), hart.run());
    }
}
