//! Tiny RV32I encoder used to build test programs.
//!
//! Operand order follows assembly syntax, e.g. `sw(src, base, offset)` for `sw src, offset(base)`.

pub const ECALL: u32 = 0x0000_0073;
pub const EBREAK: u32 = 0x0010_0073;
/// `fence iorw, iorw`
pub const FENCE: u32 = 0x0FF0_000F;

fn r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32 & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0x1F) << 7)
        | 0b0100011
}

fn b(offset: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = offset as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0b1100011
}

macro_rules! r_ops {
    ( $( $name:ident => $funct7:expr, $funct3:expr ),* $(,)? ) => {
        $(
            pub fn $name(rd: u32, rs1: u32, rs2: u32) -> u32 {
                r($funct7, rs2, rs1, $funct3, rd, 0b0110011)
            }
        )*
    };
}

macro_rules! i_ops {
    ( $( $name:ident => $funct3:expr, $opcode:expr ),* $(,)? ) => {
        $(
            pub fn $name(rd: u32, rs1: u32, imm: i32) -> u32 {
                i(imm, rs1, $funct3, rd, $opcode)
            }
        )*
    };
}

macro_rules! shift_ops {
    ( $( $name:ident => $funct7:expr, $funct3:expr ),* $(,)? ) => {
        $(
            pub fn $name(rd: u32, rs1: u32, shamt: u32) -> u32 {
                r($funct7, shamt & 0x1F, rs1, $funct3, rd, 0b0010011)
            }
        )*
    };
}

macro_rules! store_ops {
    ( $( $name:ident => $funct3:expr ),* $(,)? ) => {
        $(
            pub fn $name(src: u32, base: u32, offset: i32) -> u32 {
                s(offset, src, base, $funct3)
            }
        )*
    };
}

macro_rules! branch_ops {
    ( $( $name:ident => $funct3:expr ),* $(,)? ) => {
        $(
            pub fn $name(rs1: u32, rs2: u32, offset: i32) -> u32 {
                b(offset, rs2, rs1, $funct3)
            }
        )*
    };
}

r_ops! {
    add => 0, 0b000,
    sub => 0b0100000, 0b000,
    sll => 0, 0b001,
    slt => 0, 0b010,
    sltu => 0, 0b011,
    xor => 0, 0b100,
    srl => 0, 0b101,
    sra => 0b0100000, 0b101,
    or => 0, 0b110,
    and => 0, 0b111,
}

i_ops! {
    addi => 0b000, 0b0010011,
    slti => 0b010, 0b0010011,
    sltiu => 0b011, 0b0010011,
    xori => 0b100, 0b0010011,
    ori => 0b110, 0b0010011,
    andi => 0b111, 0b0010011,
    lb => 0b000, 0b0000011,
    lh => 0b001, 0b0000011,
    lw => 0b010, 0b0000011,
    lbu => 0b100, 0b0000011,
    lhu => 0b101, 0b0000011,
    jalr => 0b000, 0b1100111,
}

shift_ops! {
    slli => 0, 0b001,
    srli => 0, 0b101,
    srai => 0b0100000, 0b101,
}

store_ops! {
    sb => 0b000,
    sh => 0b001,
    sw => 0b010,
}

branch_ops! {
    beq => 0b000,
    bne => 0b001,
    blt => 0b100,
    bge => 0b101,
    bltu => 0b110,
    bgeu => 0b111,
}

pub fn lui(rd: u32, imm_u20: u32) -> u32 {
    ((imm_u20 & 0xF_FFFF) << 12) | (rd << 7) | 0b0110111
}

pub fn auipc(rd: u32, imm_u20: u32) -> u32 {
    ((imm_u20 & 0xF_FFFF) << 12) | (rd << 7) | 0b0010111
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0b1101111
}

/// `li rd, value` for values that fit a 12-bit immediate.
pub fn li(rd: u32, value: i32) -> u32 {
    addi(rd, 0, value)
}

/// Serializes `words` as a little-endian program image.
pub fn program(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}
