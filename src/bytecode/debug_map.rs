use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frontend::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Opcode,
    Value,
}

/// What produced one ROM byte.
///
/// Everything but `byte` is fixed at emission. `byte` changes only when a
/// fixup lands on this address, through [`DebugEntry::patch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    instruction_start: bool,
    kind: EntryKind,
    offset: usize,
    line: usize,
    column: usize,
    text: String,
    byte: u8,
}

impl DebugEntry {
    pub fn new(instruction_start: bool, kind: EntryKind, token: &Token, byte: u8) -> Self {
        DebugEntry {
            instruction_start,
            kind,
            offset: token.offset,
            line: token.line,
            column: token.column,
            text: token.text.clone(),
            byte,
        }
    }

    pub fn instruction_start(&self) -> bool {
        self.instruction_start
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn line(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn byte(&self) -> u8 {
        self.byte
    }

    pub fn patch(&mut self, byte: u8) {
        self.byte = byte;
    }
}

/// One entry per ROM address, in address order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugMap {
    entries: Vec<DebugEntry>,
}

impl DebugMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: DebugEntry) {
        self.entries.push(entry);
    }

    /// Rewrites the recorded byte at `addr`. Returns false if nothing was
    /// emitted there.
    pub fn patch(&mut self, addr: usize, byte: u8) -> bool {
        match self.entries.get_mut(addr) {
            Some(entry) => {
                entry.patch(byte);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, addr: usize) -> Option<&DebugEntry> {
        self.entries.get(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DebugEntry> {
        self.entries.iter()
    }

    /// The ROM as recorded, after every patch.
    pub fn bytes(&self) -> Vec<u8> {
        self.entries.iter().map(DebugEntry::byte).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub ordinal: usize,
    pub address: u16,
}

#[derive(Debug, Error)]
pub enum DebugInfoError {
    #[error("failed to access debug file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed debug file: {0}")]
    Json(#[from] serde_json::Error),
}

/// The `.debug` sidecar written next to a compiled program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub entries: DebugMap,
    pub words: IndexMap<String, Word>,
    #[serde(default)]
    pub globals: IndexMap<String, u16>,
    pub tags: BTreeMap<u16, String>,
    pub source: String,
}

impl DebugInfo {
    pub fn to_json(&self) -> Result<String, DebugInfoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, DebugInfoError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), DebugInfoError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, DebugInfoError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn rom(&self) -> Vec<u8> {
        self.entries.bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::token::TokenKind;

    fn token(text: &str, line: usize, column: usize) -> Token {
        Token::new(TokenKind::Identifier, text, 0, line, column)
    }

    #[test]
    fn test_patch_changes_only_byte() {
        let mut entry = DebugEntry::new(false, EntryKind::Value, &token("IF", 3, 5), 0);
        entry.patch(0x42);
        assert_eq!(entry.byte(), 0x42);
        assert_eq!(entry.line(), 3);
        assert_eq!(entry.column(), 5);
        assert_eq!(entry.text(), "IF");
        assert_eq!(entry.kind(), EntryKind::Value);
    }

    #[test]
    fn test_map_patch_out_of_range() {
        let mut map = DebugMap::new();
        map.push(DebugEntry::new(true, EntryKind::Opcode, &token("DUP", 1, 1), 0));
        assert!(map.patch(0, 7));
        assert!(!map.patch(1, 7));
        assert_eq!(map.bytes(), vec![7]);
    }

    #[test]
    fn test_sidecar_json_roundtrip() {
        let mut info = DebugInfo::default();
        info.entries
            .push(DebugEntry::new(true, EntryKind::Opcode, &token(";", 1, 9), 28));
        info.words.insert("Idle".to_string(), Word { ordinal: 0, address: 0 });
        info.globals.insert("Counter".to_string(), 0);
        info.tags.insert(0, "top".to_string());
        info.source = ": Idle ;".to_string();

        let json = info.to_json().unwrap();
        assert!(json.contains("\"entries\""));
        assert!(json.contains("\"words\""));
        assert!(json.contains("\"tags\""));
        assert!(json.contains("\"source\""));

        let back = DebugInfo::from_json(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_sidecar_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.debug");
        let mut info = DebugInfo::default();
        info.source = "x".to_string();
        info.write_to(&path).unwrap();
        assert_eq!(DebugInfo::read_from(&path).unwrap().source, "x");
    }

    #[test]
    fn test_malformed_sidecar() {
        let err = DebugInfo::from_json("{").unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }
}
