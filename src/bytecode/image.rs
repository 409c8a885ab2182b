use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"EFVM";
pub const VERSION: u16 = 0;
/// Byte offset of the ROM within the file; also the header length.
pub const ROM_START: u16 = 0x12;
pub const MAX_ROM_LEN: usize = 65536;

/// The three words every program must define, in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryWord {
    RunShot,
    Idle,
    Halt,
}

impl EntryWord {
    pub const ALL: [EntryWord; 3] = [EntryWord::RunShot, EntryWord::Idle, EntryWord::Halt];

    pub fn name(&self) -> &'static str {
        match self {
            EntryWord::RunShot => "RunShot",
            EntryWord::Idle => "Idle",
            EntryWord::Halt => "Halt",
        }
    }

    pub fn from_name(name: &str) -> Option<EntryWord> {
        Self::ALL.into_iter().find(|w| w.name() == name)
    }
}

impl std::fmt::Display for EntryWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub run_shot: u16,
    pub idle: u16,
    pub halt: u16,
}

impl EntryPoints {
    pub fn get(&self, word: EntryWord) -> u16 {
        match word {
            EntryWord::RunShot => self.run_shot,
            EntryWord::Idle => self.idle,
            EntryWord::Halt => self.halt,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a program image: bad magic {0:02X?}")]
    BadMagic([u8; 4]),
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected ROM start 0x{0:X} (expected 0x12)")]
    BadRomStart(u16),
    #[error("image truncated: header needs 18 bytes, got {0}")]
    Truncated(usize),
    #[error("ROM too large: {0} bytes")]
    RomTooLarge(usize),
    #[error("failed to access image: {0}")]
    Io(#[from] std::io::Error),
}

/// A compiled program as stored in a `.bin` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub max_volume: u16,
    pub max_seconds: u16,
    pub entries: EntryPoints,
    pub rom: Vec<u8>,
}

impl Image {
    pub fn entry(&self, word: EntryWord) -> u16 {
        self.entries.get(word)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = [0u8; ROM_START as usize];
        header[..4].copy_from_slice(MAGIC);
        let fields = [
            VERSION,
            self.max_volume,
            self.max_seconds,
            ROM_START,
            self.entries.run_shot,
            self.entries.idle,
            self.entries.halt,
        ];
        for (i, field) in fields.iter().enumerate() {
            LittleEndian::write_u16(&mut header[4 + i * 2..], *field);
        }

        let mut out = Vec::with_capacity(header.len() + self.rom.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.rom);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Image, ImageError> {
        if data.len() < ROM_START as usize {
            return Err(ImageError::Truncated(data.len()));
        }
        let mut rdr = Cursor::new(data);

        let mut magic = [0u8; 4];
        rdr.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        let version = rdr.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let max_volume = rdr.read_u16::<LittleEndian>()?;
        let max_seconds = rdr.read_u16::<LittleEndian>()?;
        let rom_start = rdr.read_u16::<LittleEndian>()?;
        if rom_start != ROM_START {
            return Err(ImageError::BadRomStart(rom_start));
        }
        let entries = EntryPoints {
            run_shot: rdr.read_u16::<LittleEndian>()?,
            idle: rdr.read_u16::<LittleEndian>()?,
            halt: rdr.read_u16::<LittleEndian>()?,
        };

        let rom = data[ROM_START as usize..].to_vec();
        if rom.len() > MAX_ROM_LEN {
            return Err(ImageError::RomTooLarge(rom.len()));
        }

        Ok(Image {
            max_volume,
            max_seconds,
            entries,
            rom,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ImageError> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Image, ImageError> {
        Image::from_bytes(&fs::read(path)?)
    }
}
