use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::bytecode::debug_map::DebugInfo;
use crate::bytecode::imm::Immediate;
use crate::bytecode::op::{Opcode, instruction_len};

/// One decoded instruction of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct DisasmLine {
    pub address: usize,
    pub bytes: Vec<u8>,
    /// Mnemonic, or the literal for an immediate.
    pub text: String,
    /// Value pushed, for immediates.
    pub value: Option<f32>,
    /// Source text that produced the instruction, when it says more than
    /// `text` does.
    pub comment: Option<String>,
    pub line: usize,
}

/// Address and source-line lookups over a compiled program's debug info.
///
/// Built from the final ROM bytes recorded in the debug map, so every
/// fixup is already in place.
#[derive(Debug, Clone)]
pub struct DebugIndex {
    info: DebugInfo,
    rom: Vec<u8>,
    starts: Vec<usize>,
    first_address: BTreeMap<usize, usize>,
}

impl DebugIndex {
    pub fn new(info: DebugInfo) -> Self {
        let rom = info.rom();
        let mut starts = Vec::new();
        let mut first_address = BTreeMap::new();
        for (addr, entry) in info.entries.iter().enumerate() {
            if entry.instruction_start() {
                starts.push(addr);
                first_address.entry(entry.line()).or_insert(addr);
            }
        }
        DebugIndex {
            info,
            rom,
            starts,
            first_address,
        }
    }

    pub fn info(&self) -> &DebugInfo {
        &self.info
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn line_for(&self, addr: usize) -> Option<usize> {
        self.info.entries.get(addr).map(|e| e.line())
    }

    /// First address of `line`, or of the next line after it that holds
    /// code.
    pub fn address_for_line(&self, line: usize) -> Option<usize> {
        self.first_address.range(line..).next().map(|(_, &addr)| addr)
    }

    /// Start and length of the instruction covering `addr`.
    pub fn instruction_at(&self, addr: usize) -> Option<(usize, usize)> {
        if addr >= self.rom.len() {
            return None;
        }
        let idx = self.starts.partition_point(|&s| s <= addr);
        let start = *self.starts.get(idx.checked_sub(1)?)?;
        let next = self.starts.get(idx).copied().unwrap_or(self.rom.len());
        let len = instruction_len(self.rom[start])
            .filter(|&len| start + len <= next)
            .unwrap_or(next - start);
        (addr < start + len).then_some((start, len))
    }

    pub fn tag(&self, addr: usize) -> Option<&str> {
        let addr = u16::try_from(addr).ok()?;
        self.info.tags.get(&addr).map(String::as_str)
    }

    /// The word whose body contains `addr`.
    pub fn word_at(&self, addr: usize) -> Option<&str> {
        self.info
            .words
            .iter()
            .filter(|(_, w)| w.address as usize <= addr)
            .max_by_key(|(_, w)| w.address)
            .map(|(name, _)| name.as_str())
    }

    /// The source text of `line`, 1-based.
    pub fn source_line(&self, line: usize) -> Option<&str> {
        self.info.source.lines().nth(line.checked_sub(1)?)
    }

    pub fn disassemble(&self) -> Vec<DisasmLine> {
        let mut out = Vec::new();
        let mut addr = 0;
        while let Some((start, len)) = self.instruction_at(addr) {
            out.push(self.decode(start, len));
            addr = start + len;
        }
        out
    }

    fn decode(&self, start: usize, len: usize) -> DisasmLine {
        let bytes = self.rom[start..start + len].to_vec();
        let (text, value) = match Immediate::decode(&self.rom, start) {
            Some(imm) => (imm.to_string(), Some(imm.value(start))),
            None => match Opcode::from_byte(bytes[0]) {
                Some(op) => (op.mnemonic().to_string(), None),
                None => (format!("DB {:#04X}", bytes[0]), None),
            },
        };

        let entry = self.info.entries.get(start);
        let source = entry.map(|e| e.text()).unwrap_or_default();
        let comment = (!source.is_empty() && source != text).then(|| source.to_string());

        DisasmLine {
            address: start,
            bytes,
            text,
            value,
            comment,
            line: entry.map(|e| e.line()).unwrap_or_default(),
        }
    }

    /// Addresses some branch, call or loop instruction jumps to.
    pub fn branch_targets(&self) -> BTreeSet<usize> {
        let lines = self.disassemble();
        let mut targets = BTreeSet::new();
        for pair in lines.windows(2) {
            let takes_target = Opcode::from_byte(pair[1].bytes[0])
                .filter(|_| pair[1].value.is_none())
                .is_some_and(Opcode::takes_target);
            if let (true, Some(v)) = (takes_target, pair[0].value) {
                if v >= 0.0 {
                    targets.insert(v as usize);
                }
            }
        }
        targets
    }

    /// A text listing with word headers, tags and branch-target markers.
    pub fn listing(&self) -> String {
        let targets = self.branch_targets();
        let word_starts: BTreeMap<usize, &str> = self
            .info
            .words
            .iter()
            .map(|(name, w)| (w.address as usize, name.as_str()))
            .collect();

        let mut out = String::new();
        for line in self.disassemble() {
            if let Some(name) = word_starts.get(&line.address) {
                out.push_str("════════════════════════════════════════\n");
                let _ = writeln!(out, " {}", name);
                out.push_str("════════════════════════════════════════\n");
            }
            if let Some(tag) = self.tag(line.address) {
                let _ = writeln!(out, "      <{}>", tag);
            }
            let marker = if targets.contains(&line.address) {
                "► "
            } else {
                "  "
            };
            let hex: Vec<String> = line.bytes.iter().map(|b| format!("{:02X}", b)).collect();
            let _ = write!(out, "{:04X} {}{:<15} {:<16}", line.address, marker, hex.join(" "), line.text);
            if let Some(comment) = &line.comment {
                let _ = write!(out, " ; {}", comment);
            }
            let _ = writeln!(out, "  (line {})", line.line);
        }
        out
    }
}
