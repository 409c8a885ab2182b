use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::io::{IoAccess, IoPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackKind {
    Operand,
    Call,
    Control,
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackKind::Operand => write!(f, "operand"),
            StackKind::Call => write!(f, "call"),
            StackKind::Control => write!(f, "loop control"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MachineState {
    #[default]
    Reset,
    Running,
    Breakpoint,
    Stopped,
    Faulted,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineState::Reset => "reset",
            MachineState::Running => "running",
            MachineState::Breakpoint => "breakpoint",
            MachineState::Stopped => "stopped",
            MachineState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Everything that halts the machine abnormally. `pc` is the address of the
/// instruction that faulted.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("{stack} stack underflow at {pc:04X}")]
    StackUnderflow { stack: StackKind, pc: usize },
    #[error("{stack} stack overflow at {pc:04X}")]
    StackOverflow { stack: StackKind, pc: usize },
    #[error("bad memory access of {len} byte(s) at address {addr} ({pc:04X})")]
    MemoryAccess { addr: i64, len: usize, pc: usize },
    #[error("invalid opcode {byte} at {pc:04X}")]
    InvalidOpcode { byte: u8, pc: usize },
    #[error("program counter out of range: {pc}")]
    PcOutOfRange { pc: i64 },
    #[error("{access} not permitted on {point} at {pc:04X}")]
    IoPermission {
        point: IoPoint,
        access: IoAccess,
        pc: usize,
    },
    #[error("unknown I/O point {index} at {pc:04X}")]
    UnknownIoPoint { index: i64, pc: usize },
    #[error("machine is not running (state: {state})")]
    NotRunning { state: MachineState },
}

/// Outcome of one `step` or `run`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Continue,
    Breakpoint(usize),
    Stopped,
    Faulted(Fault),
}

impl Step {
    pub fn is_continue(&self) -> bool {
        matches!(self, Step::Continue)
    }
}
