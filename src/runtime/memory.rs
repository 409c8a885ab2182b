use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::runtime::io::{PACKET_LEN, Packet};

pub const SCRATCH_BASE: usize = 0x0000;
pub const SCRATCH_LEN: usize = 0x100;
pub const RX_BASE: usize = 0x0100;
pub const TX_BASE: usize = 0x0110;
pub const ROM_BASE: usize = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    Scratch,
    Rx,
    Tx,
    Rom,
}

/// The data address space: scratch RAM, the two packet buffers, and a
/// read-only alias of the ROM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    scratch: Vec<u8>,
    rx: Packet,
    tx: Packet,
    #[serde(skip)]
    rom: Vec<u8>,
}

/// An access that does not fit in a single zone, or writes the ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadAccess {
    pub addr: i64,
    pub len: usize,
}

impl Memory {
    pub fn new(rom: Vec<u8>) -> Self {
        Memory {
            scratch: vec![0; SCRATCH_LEN],
            rx: [0; PACKET_LEN],
            tx: [0; PACKET_LEN],
            rom,
        }
    }

    /// Zeroes RAM and both packets. The ROM is kept.
    pub fn clear(&mut self) {
        self.scratch.fill(0);
        self.rx = [0; PACKET_LEN];
        self.tx = [0; PACKET_LEN];
    }

    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    pub fn set_rom(&mut self, rom: Vec<u8>) {
        self.rom = rom;
    }

    pub fn rx(&self) -> &Packet {
        &self.rx
    }

    pub fn set_rx(&mut self, packet: Packet) {
        self.rx = packet;
    }

    pub fn tx(&self) -> &Packet {
        &self.tx
    }

    pub fn scratch(&self) -> &[u8] {
        &self.scratch
    }

    fn locate(&self, addr: i64, len: usize) -> Result<(Zone, usize), BadAccess> {
        let bad = BadAccess { addr, len };
        let start = usize::try_from(addr).map_err(|_| bad)?;
        let end = start.checked_add(len).ok_or(bad)?;

        let zones = [
            (Zone::Scratch, SCRATCH_BASE, SCRATCH_LEN),
            (Zone::Rx, RX_BASE, PACKET_LEN),
            (Zone::Tx, TX_BASE, PACKET_LEN),
            (Zone::Rom, ROM_BASE, self.rom.len()),
        ];
        zones
            .into_iter()
            .find(|&(_, base, size)| start >= base && end <= base + size)
            .map(|(zone, base, _)| (zone, start - base))
            .ok_or(bad)
    }

    fn slice(&self, addr: i64, len: usize) -> Result<&[u8], BadAccess> {
        let (zone, at) = self.locate(addr, len)?;
        let bytes: &[u8] = match zone {
            Zone::Scratch => &self.scratch,
            Zone::Rx => &self.rx,
            Zone::Tx => &self.tx,
            Zone::Rom => &self.rom,
        };
        Ok(&bytes[at..at + len])
    }

    fn slice_mut(&mut self, addr: i64, len: usize) -> Result<&mut [u8], BadAccess> {
        let (zone, at) = self.locate(addr, len)?;
        let bytes: &mut [u8] = match zone {
            Zone::Scratch => &mut self.scratch,
            Zone::Rx => &mut self.rx,
            Zone::Tx => &mut self.tx,
            Zone::Rom => return Err(BadAccess { addr, len }),
        };
        Ok(&mut bytes[at..at + len])
    }

    pub fn read_f32(&self, addr: i64) -> Result<f32, BadAccess> {
        Ok(LittleEndian::read_f32(self.slice(addr, 4)?))
    }

    pub fn write_f32(&mut self, addr: i64, value: f32) -> Result<(), BadAccess> {
        LittleEndian::write_f32(self.slice_mut(addr, 4)?, value);
        Ok(())
    }

    pub fn read_u8(&self, addr: i64) -> Result<u8, BadAccess> {
        Ok(self.slice(addr, 1)?[0])
    }

    pub fn write_u8(&mut self, addr: i64, value: u8) -> Result<(), BadAccess> {
        self.slice_mut(addr, 1)?[0] = value;
        Ok(())
    }
}
