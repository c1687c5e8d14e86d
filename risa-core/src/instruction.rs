//! RV32I instruction formats, field extraction and decoding.

use crate::registers::Specifier;
use std::fmt;
use thiserror::Error;

/// Data structure that can hold any supported instruction in its decoded form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Instruction {
    OpImm {
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    },
    OpShiftImm {
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount_u5: u32,
    },
    Auipc {
        dest: Specifier,
        immediate: i32,
    },
    Lui {
        dest: Specifier,
        immediate: i32,
    },
    Op {
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    },
    Jal {
        dest: Specifier,
        offset: i32,
    },
    Jalr {
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Branch {
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
    },
    Load {
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    },
    Store {
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    },
    Fence {
        predecessor: FenceOrderCombination,
        successor: FenceOrderCombination,
    },
    Ecall,
    Ebreak,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegImmOp {
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegShiftImmOp {
    Slli,
    Srli,
    Srai,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegRegOp {
    Add,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Sll,
    Srl,
    Sub,
    Sra,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BranchCondition {
    Beq,
    Bne,
    Blt,
    Bltu,
    Bge,
    Bgeu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LoadWidth {
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreWidth {
    Sb,
    Sh,
    Sw,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FenceOrderCombination {
    pub device_input: bool,
    pub device_output: bool,
    pub memory_reads: bool,
    pub memory_writes: bool,
}

impl FenceOrderCombination {
    /// Builds the combination from a 4-bit `iorw` group.
    fn from_u4(bits: u32) -> Self {
        Self {
            device_input: bits & 0b1000 != 0,
            device_output: bits & 0b0100 != 0,
            memory_reads: bits & 0b0010 != 0,
            memory_writes: bits & 0b0001 != 0,
        }
    }
}

/// The six base instruction encodings.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Format {
    R,
    I,
    S,
    B,
    U,
    J,
    Undefined,
}

/// Format of every 7-bit opcode.
static FORMATS: [Format; 128] = {
    let mut table = [Format::Undefined; 128];
    table[opcodes::OP as usize] = Format::R;
    table[opcodes::LOAD as usize] = Format::I;
    table[opcodes::MISC_MEM as usize] = Format::I;
    table[opcodes::OP_IMM as usize] = Format::I;
    table[opcodes::JALR as usize] = Format::I;
    table[opcodes::SYSTEM as usize] = Format::I;
    table[opcodes::STORE as usize] = Format::S;
    table[opcodes::BRANCH as usize] = Format::B;
    table[opcodes::LUI as usize] = Format::U;
    table[opcodes::AUIPC as usize] = Format::U;
    table[opcodes::JAL as usize] = Format::J;
    table
};

#[allow(clippy::unusual_byte_groupings)]
mod opcodes {
    pub const LOAD: u8 = 0b00_000_11;
    pub const MISC_MEM: u8 = 0b00_011_11;
    pub const OP_IMM: u8 = 0b00_100_11;
    pub const AUIPC: u8 = 0b00_101_11;
    pub const STORE: u8 = 0b01_000_11;
    pub const OP: u8 = 0b01_100_11;
    pub const LUI: u8 = 0b01_101_11;
    pub const BRANCH: u8 = 0b11_000_11;
    pub const JALR: u8 = 0b11_001_11;
    pub const JAL: u8 = 0b11_011_11;
    pub const SYSTEM: u8 = 0b11_100_11;
}

impl Format {
    /// Classifies `raw_instruction` by its low 7 bits.
    pub fn of(raw_instruction: u32) -> Self {
        FORMATS[(raw_instruction & 0x7F) as usize]
    }
}

/// The fields of an instruction word as laid out by its format.
///
/// Fields a format does not have are left at zero. `immediate` is the fully assembled and
/// sign-extended immediate; for B-type and J-type it is a byte offset relative to `pc`.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Fields {
    pub opcode: u8,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct3: u8,
    pub funct7: u8,
    pub immediate: i32,
}

impl Fields {
    pub fn extract(raw_instruction: u32, format: Format) -> Self {
        let opcode = opcode(raw_instruction);
        match format {
            Format::R => Self {
                opcode,
                rd: rd(raw_instruction),
                rs1: rs1(raw_instruction),
                rs2: rs2(raw_instruction),
                funct3: funct3(raw_instruction),
                funct7: funct7(raw_instruction),
                immediate: 0,
            },
            Format::I => Self {
                opcode,
                rd: rd(raw_instruction),
                rs1: rs1(raw_instruction),
                funct3: funct3(raw_instruction),
                immediate: i_imm(raw_instruction),
                ..Self::default()
            },
            Format::S => Self {
                opcode,
                rs1: rs1(raw_instruction),
                rs2: rs2(raw_instruction),
                funct3: funct3(raw_instruction),
                immediate: s_imm(raw_instruction),
                ..Self::default()
            },
            Format::B => Self {
                opcode,
                rs1: rs1(raw_instruction),
                rs2: rs2(raw_instruction),
                funct3: funct3(raw_instruction),
                immediate: b_imm(raw_instruction),
                ..Self::default()
            },
            Format::U => Self {
                opcode,
                rd: rd(raw_instruction),
                immediate: u_imm(raw_instruction),
                ..Self::default()
            },
            Format::J => Self {
                opcode,
                rd: rd(raw_instruction),
                immediate: j_imm(raw_instruction),
                ..Self::default()
            },
            Format::Undefined => Self {
                opcode,
                ..Self::default()
            },
        }
    }

    fn rd(&self) -> Specifier {
        Specifier::from_u5(self.rd)
    }

    fn rs1(&self) -> Specifier {
        Specifier::from_u5(self.rs1)
    }

    fn rs2(&self) -> Specifier {
        Specifier::from_u5(self.rs2)
    }
}

impl Instruction {
    pub fn decode(raw_instruction: u32) -> Result<Self, DecodeError> {
        let format = Format::of(raw_instruction);
        if format == Format::Undefined {
            return Err(DecodeError::UndefinedOpcode);
        }
        let fields = Fields::extract(raw_instruction, format);
        Self::from_fields(raw_instruction, &fields).ok_or(DecodeError::IllegalInstruction)
    }

    fn from_fields(raw_instruction: u32, fields: &Fields) -> Option<Self> {
        Some(match fields.opcode {
            opcodes::OP => Self::Op {
                op: r_funct(fields.funct7, fields.funct3)?,
                dest: fields.rd(),
                src1: fields.rs1(),
                src2: fields.rs2(),
            },
            opcodes::OP_IMM => match i_funct(fields.funct3) {
                Some(op) => Self::OpImm {
                    op,
                    dest: fields.rd(),
                    src: fields.rs1(),
                    immediate: fields.immediate,
                },
                // The upper immediate bits act as funct7 for the shifts.
                None => Self::OpShiftImm {
                    op: i_shfunct(funct7(raw_instruction), fields.funct3)?,
                    dest: fields.rd(),
                    src: fields.rs1(),
                    shift_amount_u5: fields.immediate as u32 & 0x1F,
                },
            },
            opcodes::LOAD => Self::Load {
                width: i_width(fields.funct3)?,
                dest: fields.rd(),
                base: fields.rs1(),
                offset: fields.immediate,
            },
            opcodes::JALR => match fields.funct3 {
                0b000 => Self::Jalr {
                    dest: fields.rd(),
                    base: fields.rs1(),
                    offset: fields.immediate,
                },
                _ => return None,
            },
            opcodes::MISC_MEM => match fields.funct3 {
                // Reserved fm/rs1/rd encodings are treated as a normal fence for forward
                // compatibility, which includes FENCE.TSO.
                0b000 => Self::Fence {
                    predecessor: FenceOrderCombination::from_u4((raw_instruction >> 24) & 0xF),
                    successor: FenceOrderCombination::from_u4((raw_instruction >> 20) & 0xF),
                },
                _ => return None,
            },
            opcodes::SYSTEM => match (raw_instruction >> 20, fields.funct3) {
                (0, 0b000) => Self::Ecall,
                (1, 0b000) => Self::Ebreak,
                _ => return None,
            },
            opcodes::STORE => Self::Store {
                width: s_width(fields.funct3)?,
                src: fields.rs2(),
                base: fields.rs1(),
                offset: fields.immediate,
            },
            opcodes::BRANCH => Self::Branch {
                condition: b_funct(fields.funct3)?,
                src1: fields.rs1(),
                src2: fields.rs2(),
                offset: fields.immediate,
            },
            opcodes::LUI => Self::Lui {
                dest: fields.rd(),
                immediate: fields.immediate,
            },
            opcodes::AUIPC => Self::Auipc {
                dest: fields.rd(),
                immediate: fields.immediate,
            },
            opcodes::JAL => Self::Jal {
                dest: fields.rd(),
                offset: fields.immediate,
            },
            _ => return None,
        })
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("instruction has an undefined opcode")]
    UndefinedOpcode,
    #[error("illegal instruction")]
    IllegalInstruction,
}

/// Sign-extends the low `bits` bits of `value` to 32 bits.
///
/// Shifts the sign bit up to bit 31 and arithmetic-shifts it back down.
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    debug_assert!((1..=32).contains(&bits));
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Returns `width` bits of `raw_instruction` starting at bit `position`.
fn bits(raw_instruction: u32, position: u32, width: u32) -> u32 {
    (raw_instruction >> position) & ((1 << width) - 1)
}

/// Returns the 7-bit *opcode* value of the instruction.
fn opcode(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 0, 7) as u8
}

/// Returns the 5-bit *rd* value for R-type, I-type, U-type, J-type instructions.
fn rd(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 7, 5) as u8
}

/// Returns the 5-bit *rs1* value for R-type, I-type, S-type, B-type instructions.
fn rs1(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 15, 5) as u8
}

/// Returns the 5-bit *rs2* value for R-type, S-type, B-type instructions.
fn rs2(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 20, 5) as u8
}

/// Returns the 3-bit *funct3* value for R-type, I-type, S-type, B-type instructions.
fn funct3(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 12, 3) as u8
}

/// Returns the 7-bit *funct7* value for R-type instructions.
fn funct7(raw_instruction: u32) -> u8 {
    bits(raw_instruction, 25, 7) as u8
}

/// Returns the 12-bit I-immediate sign-extended to 32 bits.
fn i_imm(raw_instruction: u32) -> i32 {
    sign_extend(bits(raw_instruction, 20, 12), 12)
}

/// Returns the 12-bit S-immediate sign-extended to 32 bits.
fn s_imm(raw_instruction: u32) -> i32 {
    let imm_4_0 = bits(raw_instruction, 7, 5);
    let imm_11_5 = bits(raw_instruction, 25, 7);
    sign_extend(imm_4_0 | (imm_11_5 << 5), 12)
}

/// Returns the 13-bit B-immediate sign-extended to 32 bits.
fn b_imm(raw_instruction: u32) -> i32 {
    let imm_11 = bits(raw_instruction, 7, 1);
    let imm_4_1 = bits(raw_instruction, 8, 4);
    let imm_10_5 = bits(raw_instruction, 25, 6);
    let imm_12 = bits(raw_instruction, 31, 1);
    sign_extend(
        (imm_4_1 << 1) | (imm_10_5 << 5) | (imm_11 << 11) | (imm_12 << 12),
        13,
    )
}

/// Returns the signed 32-bit U-immediate.
fn u_imm(raw_instruction: u32) -> i32 {
    (bits(raw_instruction, 12, 20) << 12) as i32
}

/// Returns the 21-bit J-immediate sign-extended to 32 bits.
fn j_imm(raw_instruction: u32) -> i32 {
    let imm_19_12 = bits(raw_instruction, 12, 8);
    let imm_11 = bits(raw_instruction, 20, 1);
    let imm_10_1 = bits(raw_instruction, 21, 10);
    let imm_20 = bits(raw_instruction, 31, 1);
    sign_extend(
        (imm_10_1 << 1) | (imm_11 << 11) | (imm_19_12 << 12) | (imm_20 << 20),
        21,
    )
}

fn i_funct(funct3: u8) -> Option<RegImmOp> {
    match funct3 {
        0b000 => Some(RegImmOp::Addi),
        0b010 => Some(RegImmOp::Slti),
        0b011 => Some(RegImmOp::Sltiu),
        0b100 => Some(RegImmOp::Xori),
        0b110 => Some(RegImmOp::Ori),
        0b111 => Some(RegImmOp::Andi),
        _ => None,
    }
}

fn i_shfunct(funct7: u8, funct3: u8) -> Option<RegShiftImmOp> {
    match (funct7, funct3) {
        (0b0000000, 0b001) => Some(RegShiftImmOp::Slli),
        (0b0000000, 0b101) => Some(RegShiftImmOp::Srli),
        (0b0100000, 0b101) => Some(RegShiftImmOp::Srai),
        _ => None,
    }
}

fn i_width(funct3: u8) -> Option<LoadWidth> {
    match funct3 {
        0b000 => Some(LoadWidth::Lb),
        0b001 => Some(LoadWidth::Lh),
        0b010 => Some(LoadWidth::Lw),
        0b100 => Some(LoadWidth::Lbu),
        0b101 => Some(LoadWidth::Lhu),
        _ => None,
    }
}

fn s_width(funct3: u8) -> Option<StoreWidth> {
    match funct3 {
        0b000 => Some(StoreWidth::Sb),
        0b001 => Some(StoreWidth::Sh),
        0b010 => Some(StoreWidth::Sw),
        _ => None,
    }
}

fn r_funct(funct7: u8, funct3: u8) -> Option<RegRegOp> {
    match (funct7, funct3) {
        (0b0000000, 0b000) => Some(RegRegOp::Add),
        (0b0000000, 0b001) => Some(RegRegOp::Sll),
        (0b0000000, 0b010) => Some(RegRegOp::Slt),
        (0b0000000, 0b011) => Some(RegRegOp::Sltu),
        (0b0000000, 0b100) => Some(RegRegOp::Xor),
        (0b0000000, 0b101) => Some(RegRegOp::Srl),
        (0b0000000, 0b110) => Some(RegRegOp::Or),
        (0b0000000, 0b111) => Some(RegRegOp::And),
        (0b0100000, 0b000) => Some(RegRegOp::Sub),
        (0b0100000, 0b101) => Some(RegRegOp::Sra),
        _ => None,
    }
}

fn b_funct(funct3: u8) -> Option<BranchCondition> {
    match funct3 {
        0b000 => Some(BranchCondition::Beq),
        0b001 => Some(BranchCondition::Bne),
        0b100 => Some(BranchCondition::Blt),
        0b101 => Some(BranchCondition::Bge),
        0b110 => Some(BranchCondition::Bltu),
        0b111 => Some(BranchCondition::Bgeu),
        _ => None,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::OpImm {
                op,
                dest,
                src,
                immediate,
            } => {
                let mnemonic = match op {
                    RegImmOp::Addi => "addi",
                    RegImmOp::Slti => "slti",
                    RegImmOp::Sltiu => "sltiu",
                    RegImmOp::Xori => "xori",
                    RegImmOp::Ori => "ori",
                    RegImmOp::Andi => "andi",
                };
                write!(f, "{mnemonic} {dest}, {src}, {immediate}")
            }
            Self::OpShiftImm {
                op,
                dest,
                src,
                shift_amount_u5,
            } => {
                let mnemonic = match op {
                    RegShiftImmOp::Slli => "slli",
                    RegShiftImmOp::Srli => "srli",
                    RegShiftImmOp::Srai => "srai",
                };
                write!(f, "{mnemonic} {dest}, {src}, {shift_amount_u5}")
            }
            Self::Auipc { dest, immediate } => {
                write!(f, "auipc {dest}, {:#x}", immediate as u32 >> 12)
            }
            Self::Lui { dest, immediate } => write!(f, "lui {dest}, {:#x}", immediate as u32 >> 12),
            Self::Op {
                op,
                dest,
                src1,
                src2,
            } => {
                let mnemonic = match op {
                    RegRegOp::Add => "add",
                    RegRegOp::Slt => "slt",
                    RegRegOp::Sltu => "sltu",
                    RegRegOp::And => "and",
                    RegRegOp::Or => "or",
                    RegRegOp::Xor => "xor",
                    RegRegOp::Sll => "sll",
                    RegRegOp::Srl => "srl",
                    RegRegOp::Sub => "sub",
                    RegRegOp::Sra => "sra",
                };
                write!(f, "{mnemonic} {dest}, {src1}, {src2}")
            }
            Self::Jal { dest, offset } => write!(f, "jal {dest}, {offset}"),
            Self::Jalr { dest, base, offset } => write!(f, "jalr {dest}, {offset}({base})"),
            Self::Branch {
                condition,
                src1,
                src2,
                offset,
            } => {
                let mnemonic = match condition {
                    BranchCondition::Beq => "beq",
                    BranchCondition::Bne => "bne",
                    BranchCondition::Blt => "blt",
                    BranchCondition::Bltu => "bltu",
                    BranchCondition::Bge => "bge",
                    BranchCondition::Bgeu => "bgeu",
                };
                write!(f, "{mnemonic} {src1}, {src2}, {offset}")
            }
            Self::Load {
                width,
                dest,
                base,
                offset,
            } => {
                let mnemonic = match width {
                    LoadWidth::Lb => "lb",
                    LoadWidth::Lh => "lh",
                    LoadWidth::Lw => "lw",
                    LoadWidth::Lbu => "lbu",
                    LoadWidth::Lhu => "lhu",
                };
                write!(f, "{mnemonic} {dest}, {offset}({base})")
            }
            Self::Store {
                width,
                src,
                base,
                offset,
            } => {
                let mnemonic = match width {
                    StoreWidth::Sb => "sb",
                    StoreWidth::Sh => "sh",
                    StoreWidth::Sw => "sw",
                };
                write!(f, "{mnemonic} {src}, {offset}({base})")
            }
            Self::Fence {
                predecessor,
                successor,
            } => write!(f, "fence {predecessor}, {successor}"),
            Self::Ecall => f.write_str("ecall"),
            Self::Ebreak => f.write_str("ebreak"),
        }
    }
}

impl fmt::Display for FenceOrderCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (self.device_input, 'i'),
            (self.device_output, 'o'),
            (self.memory_reads, 'r'),
            (self.memory_writes, 'w'),
        ];
        for (set, c) in flags {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}
