use byteorder::{ByteOrder, LittleEndian};

use crate::bytecode::op::{Opcode, SHORT_IMMEDIATE};

/// One inline operand, in the shortest form that represents it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// 0..128 packed into the low bits of a single byte.
    Short(u8),
    /// `IMMS` + i8.
    Signed(i8),
    /// `PCIMMS` + i8, relative to the address of the `PCIMMS` byte.
    PcRelative(i8),
    /// `IMMU` + u16.
    Unsigned(u16),
    /// `IMMF` + f32.
    Float(f32),
}

impl Immediate {
    /// Picks the encoding for `value` when emitted at address `at`.
    ///
    /// Integers prefer, in order: the packed byte, a signed byte, a byte
    /// relative to `at`, then an unsigned 16-bit word. Anything else is a
    /// float.
    pub fn choose(value: f64, at: usize) -> Immediate {
        if !value.is_finite() || value.fract() != 0.0 {
            return Immediate::Float(value as f32);
        }
        let int = value as i64;

        if (0..128).contains(&int) {
            return Immediate::Short(int as u8);
        }
        if (-128..128).contains(&int) {
            return Immediate::Signed(int as i8);
        }
        let offset = i64::try_from(at).ok().and_then(|at| int.checked_sub(at));
        if let Some(offset) = offset.filter(|o| (-128..128).contains(o)) {
            return Immediate::PcRelative(offset as i8);
        }
        if (0..65536).contains(&int) {
            return Immediate::Unsigned(int as u16);
        }
        Immediate::Float(value as f32)
    }

    /// The 16-bit absolute form used for addresses that are patched later.
    pub fn address(addr: u16) -> Immediate {
        Immediate::Unsigned(addr)
    }

    /// Leading opcode, or `None` for the packed single-byte form.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Immediate::Short(_) => None,
            Immediate::Signed(_) => Some(Opcode::Imms),
            Immediate::PcRelative(_) => Some(Opcode::PcImms),
            Immediate::Unsigned(_) => Some(Opcode::Immu),
            Immediate::Float(_) => Some(Opcode::Immf),
        }
    }

    pub fn len(&self) -> usize {
        match self.opcode() {
            Some(op) => op.len(),
            None => 1,
        }
    }

    /// Encoded bytes, opcode first.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Immediate::Short(v) => vec![SHORT_IMMEDIATE | v],
            Immediate::Signed(v) => vec![Opcode::Imms.code(), v as u8],
            Immediate::PcRelative(v) => vec![Opcode::PcImms.code(), v as u8],
            Immediate::Unsigned(v) => {
                let mut out = vec![Opcode::Immu.code(), 0, 0];
                LittleEndian::write_u16(&mut out[1..], v);
                out
            }
            Immediate::Float(v) => {
                let mut out = vec![Opcode::Immf.code(), 0, 0, 0, 0];
                LittleEndian::write_f32(&mut out[1..], v);
                out
            }
        }
    }

    /// Value pushed when the immediate at address `at` executes.
    pub fn value(&self, at: usize) -> f32 {
        match *self {
            Immediate::Short(v) => v as f32,
            Immediate::Signed(v) => v as f32,
            Immediate::PcRelative(v) => (at as i64 + v as i64) as f32,
            Immediate::Unsigned(v) => v as f32,
            Immediate::Float(v) => v,
        }
    }

    /// Decodes the immediate starting at `rom[at]`.
    ///
    /// Returns `None` if the byte there is not an immediate or the operand
    /// runs past the end of `rom`.
    pub fn decode(rom: &[u8], at: usize) -> Option<Immediate> {
        let first = *rom.get(at)?;
        if first & SHORT_IMMEDIATE != 0 {
            return Some(Immediate::Short(first & !SHORT_IMMEDIATE));
        }
        let op = Opcode::from_byte(first)?;
        let operand = rom.get(at + 1..at + op.len())?;
        match op {
            Opcode::Imms => Some(Immediate::Signed(operand[0] as i8)),
            Opcode::PcImms => Some(Immediate::PcRelative(operand[0] as i8)),
            Opcode::Immu => Some(Immediate::Unsigned(LittleEndian::read_u16(operand))),
            Opcode::Immf => Some(Immediate::Float(LittleEndian::read_f32(operand))),
            _ => None,
        }
    }
}

impl std::fmt::Display for Immediate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Immediate::Short(v) => write!(f, "#{}", v),
            Immediate::Signed(v) => write!(f, "IMMS {}", v),
            Immediate::PcRelative(v) => write!(f, "PCIMMS {:+}", v),
            Immediate::Unsigned(v) => write!(f, "IMMU {}", v),
            Immediate::Float(v) => write!(f, "IMMF {}", v),
        }
    }
}
