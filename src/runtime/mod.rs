pub mod debugger;
pub mod io;
pub mod memory;
pub mod runtime_error;
pub mod snapshot;
pub mod stack;
pub mod time;
pub mod vm;

pub use debugger::Debugger;
pub use io::{DeviceBridge, IoPoint, SimulatedDevice};
pub use runtime_error::{Fault, MachineState, Step};
pub use snapshot::MachineSnapshot;
pub use vm::{Cpu, CpuConfig};
