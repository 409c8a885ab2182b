use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::io::DeviceBridge;
use crate::runtime::memory::Memory;
use crate::runtime::runtime_error::{Fault, MachineState};
use crate::runtime::time::SystemTime;
use crate::runtime::vm::Cpu;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed snapshot: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("snapshot does not fit this machine: {0}")]
    Mismatch(String),
}

/// Everything mutable about a machine except its program and device.
///
/// The ROM is not captured; a snapshot is only meaningful against the
/// image it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub pc: usize,
    pub state: MachineState,
    pub fault: Option<Fault>,
    pub stack: Vec<f32>,
    pub calls: Vec<f32>,
    pub control: Vec<f32>,
    pub memory: Memory,
    pub time: SystemTime,
    pub breakpoints: Vec<usize>,
}

impl MachineSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SnapshotError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, SnapshotError> {
        Self::from_bytes(&fs::read(path)?)
    }
}

impl<D: DeviceBridge> Cpu<D> {
    pub fn snapshot(&self) -> MachineSnapshot {
        let mut memory = self.memory().clone();
        memory.set_rom(Vec::new());
        MachineSnapshot {
            pc: self.pc(),
            state: self.state(),
            fault: self.fault().cloned(),
            stack: self.stack().to_vec(),
            calls: self.call_stack().to_vec(),
            control: self.control_stack().to_vec(),
            memory,
            time: *self.time(),
            breakpoints: self.breakpoints().collect(),
        }
    }

    /// Puts the machine back into the captured state. The ROM and device
    /// are left as they are.
    pub fn restore(&mut self, snapshot: &MachineSnapshot) -> Result<(), SnapshotError> {
        self.restore_parts(snapshot).map_err(|_| {
            SnapshotError::Mismatch("stack contents exceed configured depths".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::image::{EntryPoints, Image};
    use crate::bytecode::op::{Opcode, SHORT_IMMEDIATE};
    use crate::runtime::io::SimulatedDevice;
    use crate::runtime::runtime_error::Step;
    use crate::runtime::vm::CpuConfig;

    fn image() -> Image {
        Image {
            max_volume: 0,
            max_seconds: 0,
            entries: EntryPoints::default(),
            rom: vec![
                SHORT_IMMEDIATE | 4,
                SHORT_IMMEDIATE | 8,
                Opcode::Store.code(),
                SHORT_IMMEDIATE | 1,
                SHORT_IMMEDIATE | 2,
                Opcode::Ret.code(),
            ],
        }
    }

    #[test]
    fn test_snapshot_restores_midway() {
        let mut cpu = Cpu::new(&image(), SimulatedDevice::new());
        cpu.set_breakpoint(4);
        assert_eq!(cpu.run(), Step::Breakpoint(4));

        let snap = cpu.snapshot();
        let bytes = snap.to_bytes().unwrap();
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[1.0, 2.0]);

        let back = MachineSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(back, snap);
        cpu.restore(&back).unwrap();
        assert_eq!(cpu.pc(), 4);
        assert_eq!(cpu.stack(), &[1.0]);
        assert_eq!(cpu.memory().read_f32(8).unwrap(), 4.0);
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[1.0, 2.0]);
    }

    #[test]
    fn test_restore_rejects_deeper_stacks() {
        let mut cpu = Cpu::new(&image(), SimulatedDevice::new());
        let mut snap = cpu.snapshot();
        snap.stack = vec![0.0; 65];
        assert!(matches!(
            cpu.restore(&snap),
            Err(SnapshotError::Mismatch(_))
        ));

        let config = CpuConfig {
            stack_depth: 128,
            ..CpuConfig::default()
        };
        let mut roomy = Cpu::with_config(&image(), SimulatedDevice::new(), config);
        assert!(roomy.restore(&snap).is_ok());
        assert_eq!(roomy.stack().len(), 65);
    }

    #[test]
    fn test_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.snap");
        let cpu = Cpu::new(&image(), SimulatedDevice::new());
        cpu.snapshot().write_to(&path).unwrap();
        assert_eq!(MachineSnapshot::read_from(&path).unwrap(), cpu.snapshot());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            MachineSnapshot::from_bytes(&[0xFF]),
            Err(SnapshotError::Encoding(_))
        ));
    }
}
