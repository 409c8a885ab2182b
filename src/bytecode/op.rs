use serde::{Deserialize, Serialize};

use crate::bytecode::stack_check::StackUse;

// =============================================================================
// OPCODE - the machine's closed instruction vocabulary
// =============================================================================

/// A machine instruction.
///
/// The discriminant is the encoded byte. The numbering is fixed by the
/// firmware, so new opcodes may only ever be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // stack ops
    Dup = 0,
    Drop,
    Over,
    Swap,
    Copy,
    Rot,
    Nrot,

    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Rec,

    // tests
    Tz,
    Tgt,
    Tlt,
    Tge,
    Tle,
    Tin,

    // bitwise
    Or,
    And,
    Xor,
    Binv,

    // control flow
    Bnz,
    Bz,
    Bra,
    Call,
    Ret,
    Exit,
    Wait,
    Nop,

    // return stack
    ToR,
    FromR,
    CopyR,

    // immediates
    PcImms,
    Imm,
    Imms,
    Immu,
    Immf,

    // memory
    Store,
    Fetch,
    StoreByte,
    FetchByte,

    // packets
    Txp,
    Rxp,

    // I/O points
    Ior,
    Iow,
    Iort,

    // loops
    For,
    EndFor,

    Stop,
    Index,
}

/// Opcodes whose stack effect cannot be tabulated statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Special {
    None,
    /// `COPY` reaches an arbitrary depth chosen at runtime.
    Copy,
    /// `INDEX` reads the innermost loop frame.
    Index,
}

/// Static description of one opcode.
///
/// Stack signatures name the slots consumed and produced, e.g. `DUP` is
/// `a -- a a`. Only the slot counts matter to the code generator.
#[derive(Debug)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub mnemonic: &'static str,
    /// Encoded length in bytes, including trailing immediate bytes.
    pub length: usize,
    pub main_before: &'static str,
    pub main_after: &'static str,
    pub ret_before: &'static str,
    pub ret_after: &'static str,
    pub special: Special,
}

macro_rules! op {
    ($op:ident, $name:expr, $len:expr, $mb:expr, $ma:expr, $rb:expr, $ra:expr) => {
        op!($op, $name, $len, $mb, $ma, $rb, $ra, Special::None)
    };
    ($op:ident, $name:expr, $len:expr, $mb:expr, $ma:expr, $rb:expr, $ra:expr, $special:expr) => {
        OpcodeInfo {
            opcode: Opcode::$op,
            mnemonic: $name,
            length: $len,
            main_before: $mb,
            main_after: $ma,
            ret_before: $rb,
            ret_after: $ra,
            special: $special,
        }
    };
}

/// The opcode table. Indexed by encoded byte.
///
/// Both the code generator (stack bookkeeping) and the VM (instruction
/// length) read this table, so it is the only place these facts live.
pub static OPCODES: [OpcodeInfo; Opcode::COUNT] = [
    op!(Dup, "DUP", 1, "a", "a a", "", ""),
    op!(Drop, "DROP", 1, "a", "", "", ""),
    op!(Over, "OVER", 1, "a b", "a b a", "", ""),
    op!(Swap, "SWAP", 1, "a b", "b a", "", ""),
    op!(Copy, "COPY", 1, "", "", "", "", Special::Copy),
    op!(Rot, "ROT", 1, "a b c", "b c a", "", ""),
    op!(Nrot, "NROT", 1, "a b c", "c a b", "", ""),
    op!(Add, "+", 1, "a b", "c", "", ""),
    op!(Sub, "-", 1, "a b", "c", "", ""),
    op!(Mul, "*", 1, "a b", "c", "", ""),
    op!(Div, "/", 1, "a b", "c", "", ""),
    op!(Pow, "POW", 1, "a b", "c", "", ""),
    op!(Neg, "NEG", 1, "a", "b", "", ""),
    op!(Rec, "REC", 1, "a", "b", "", ""),
    op!(Tz, "TZ", 1, "a", "b", "", ""),
    op!(Tgt, "TGT", 1, "a b", "c", "", ""),
    op!(Tlt, "TLT", 1, "a b", "c", "", ""),
    op!(Tge, "TGE", 1, "a b", "c", "", ""),
    op!(Tle, "TLE", 1, "a b", "c", "", ""),
    op!(Tin, "TIN", 1, "a", "b", "", ""),
    op!(Or, "OR", 1, "a b", "c", "", ""),
    op!(And, "AND", 1, "a b", "c", "", ""),
    op!(Xor, "XOR", 1, "a b", "c", "", ""),
    op!(Binv, "BINV", 1, "a", "b", "", ""),
    op!(Bnz, "BNZ", 1, "a b", "", "", ""),
    op!(Bz, "BZ", 1, "a b", "", "", ""),
    op!(Bra, "BRA", 1, "a", "", "", ""),
    op!(Call, "CALL", 1, "a", "", "", "a"),
    op!(Ret, ";", 1, "", "", "a", ""),
    op!(Exit, "EXIT", 1, "", "", "a", ""),
    op!(Wait, "WAIT", 1, "", "", "", ""),
    op!(Nop, "NOP", 1, "", "", "", ""),
    op!(ToR, "TOR", 1, "a", "", "", "a"),
    op!(FromR, "FROMR", 1, "", "a", "a", ""),
    op!(CopyR, "COPYR", 1, "", "a", "a", "a"),
    op!(PcImms, "PCIMMS", 2, "", "a", "", ""),
    op!(Imm, "IMM", 1, "", "a", "", ""),
    op!(Imms, "IMMS", 2, "", "a", "", ""),
    op!(Immu, "IMMU", 3, "", "a", "", ""),
    op!(Immf, "IMMF", 5, "", "a", "", ""),
    op!(Store, "!", 1, "a b", "", "", ""),
    op!(Fetch, "@", 1, "a", "b", "", ""),
    op!(StoreByte, "!B", 1, "a b", "", "", ""),
    op!(FetchByte, "@B", 1, "a", "b", "", ""),
    op!(Txp, "TXP", 1, "", "a", "", ""),
    op!(Rxp, "RXP?", 1, "", "a", "", ""),
    op!(Ior, "IOR", 1, "a", "b", "", ""),
    op!(Iow, "IOW", 1, "a b", "", "", ""),
    op!(Iort, "IORT", 1, "a", "b", "", ""),
    // FOR and ENDFOR are one primitive: the frame FOR pushes is the frame
    // ENDFOR removes once the loop is done.
    op!(For, "FOR", 1, "a b c d", "", "", "a b c e"),
    op!(EndFor, "ENDFOR", 1, "", "", "a b c d", ""),
    op!(Stop, "STOP", 1, "", "", "", ""),
    op!(Index, "INDEX", 1, "", "a", "", "", Special::Index),
];

/// Set on a byte that carries a 7-bit unsigned immediate in its low bits.
pub const SHORT_IMMEDIATE: u8 = 0x80;

fn slot_count(signature: &str) -> i32 {
    signature.split_whitespace().count() as i32
}

impl Opcode {
    pub const COUNT: usize = 53;

    pub fn info(self) -> &'static OpcodeInfo {
        &OPCODES[self as usize]
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    pub fn len(self) -> usize {
        self.info().length
    }

    /// Decodes a byte that is not a short immediate.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        OPCODES.get(byte as usize).map(|info| info.opcode)
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        OPCODES
            .iter()
            .find(|info| info.mnemonic == name)
            .map(|info| info.opcode)
    }

    /// Net effect on the (main, return) stacks.
    pub fn net_effect(self) -> StackUse {
        let info = self.info();
        StackUse::new(
            slot_count(info.main_after) - slot_count(info.main_before),
            slot_count(info.ret_after) - slot_count(info.ret_before),
        )
    }

    pub fn is_special(self) -> bool {
        self.info().special != Special::None
    }

    /// Opcodes that carry an inline operand (or, for `IMM`, stand for the
    /// packed 7-bit form). Source code may not name these directly.
    pub fn is_immediate_form(self) -> bool {
        matches!(
            self,
            Opcode::PcImms | Opcode::Imm | Opcode::Imms | Opcode::Immu | Opcode::Immf
        )
    }

    /// Instructions that leave the current word.
    pub fn is_exit(self) -> bool {
        matches!(self, Opcode::Ret | Opcode::Exit)
    }

    /// Instructions that take a target address from the stack.
    /// Jumps within the current word.
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Bz | Opcode::Bnz | Opcode::Bra)
    }

    pub fn takes_target(self) -> bool {
        matches!(
            self,
            Opcode::Bz | Opcode::Bnz | Opcode::Bra | Opcode::Call | Opcode::For
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Length of the instruction starting with `byte`, or `None` for an
/// unassigned code.
pub fn instruction_len(byte: u8) -> Option<usize> {
    if byte & SHORT_IMMEDIATE != 0 {
        return Some(1);
    }
    Opcode::from_byte(byte).map(Opcode::len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_indexed_by_code() {
        for (i, info) in OPCODES.iter().enumerate() {
            assert_eq!(info.opcode as usize, i, "{} out of place", info.mnemonic);
        }
        assert_eq!(Opcode::Index.code(), 52);
        assert_eq!(Opcode::Dup.code(), 0);
    }

    #[test]
    fn test_firmware_numbering() {
        assert_eq!(Opcode::Call.code(), 27);
        assert_eq!(Opcode::Ret.code(), 28);
        assert_eq!(Opcode::Immu.code(), 38);
        assert_eq!(Opcode::For.code(), 49);
        assert_eq!(Opcode::Stop.code(), 51);
    }

    #[test]
    fn test_mnemonics_roundtrip() {
        for info in OPCODES.iter() {
            assert_eq!(Opcode::from_mnemonic(info.mnemonic), Some(info.opcode));
        }
        assert_eq!(Opcode::from_mnemonic("dup"), None);
        assert_eq!(Opcode::from_mnemonic("RXP?"), Some(Opcode::Rxp));
    }

    #[test]
    fn test_lengths() {
        assert_eq!(instruction_len(Opcode::PcImms.code()), Some(2));
        assert_eq!(instruction_len(Opcode::Imms.code()), Some(2));
        assert_eq!(instruction_len(Opcode::Immu.code()), Some(3));
        assert_eq!(instruction_len(Opcode::Immf.code()), Some(5));
        assert_eq!(instruction_len(Opcode::Add.code()), Some(1));
        assert_eq!(instruction_len(0x80 | 42), Some(1));
        assert_eq!(instruction_len(53), None);
    }

    #[test]
    fn test_net_effects() {
        assert_eq!(Opcode::Dup.net_effect(), StackUse::new(1, 0));
        assert_eq!(Opcode::Call.net_effect(), StackUse::new(-1, 1));
        assert_eq!(Opcode::Ret.net_effect(), StackUse::new(0, -1));
        assert_eq!(Opcode::For.net_effect(), StackUse::new(-4, 4));
        assert_eq!(Opcode::EndFor.net_effect(), StackUse::new(0, -4));
        assert_eq!(Opcode::Bz.net_effect(), StackUse::new(-2, 0));
        assert_eq!(Opcode::Tgt.net_effect(), StackUse::new(-1, 0));
        assert_eq!(Opcode::CopyR.net_effect(), StackUse::new(1, 0));
    }

    #[test]
    fn test_specials() {
        assert!(Opcode::Copy.is_special());
        assert!(Opcode::Index.is_special());
        assert!(!Opcode::Dup.is_special());
    }
}
