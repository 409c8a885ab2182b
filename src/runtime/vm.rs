use std::collections::BTreeSet;

use tracing::{debug, trace, warn};

use crate::bytecode::image::{EntryPoints, EntryWord, Image};
use crate::bytecode::imm::Immediate;
use crate::bytecode::op::{Opcode, SHORT_IMMEDIATE};
use crate::runtime::io::{DeviceBridge, IoAccess, IoPoint, SimulatedDevice};
use crate::runtime::memory::{BadAccess, Memory};
use crate::runtime::runtime_error::{Fault, MachineState, StackKind, Step};
use crate::runtime::snapshot::MachineSnapshot;
use crate::runtime::stack::{BoundedStack, StackError};
use crate::runtime::time::SystemTime;

#[derive(Debug, Clone)]
pub struct CpuConfig {
    pub stack_depth: usize,
    pub call_depth: usize,
    pub control_depth: usize,
    /// Budget for one `run` call.
    pub max_steps: Option<usize>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            stack_depth: 64,
            call_depth: 64,
            control_depth: 64,
            max_steps: None,
        }
    }
}

enum Flow {
    Next,
    Stop,
}

/// The bytecode machine.
///
/// Execution is cooperative: `step` runs at most one instruction and
/// reports what happened. `run` is nothing more than repeated steps.
pub struct Cpu<D: DeviceBridge = SimulatedDevice> {
    config: CpuConfig,
    pc: usize,
    /// Start of the instruction being executed; faults report it.
    op_pc: usize,
    stack: BoundedStack,
    calls: BoundedStack,
    control: BoundedStack,
    memory: Memory,
    time: SystemTime,
    entries: EntryPoints,
    breakpoints: BTreeSet<usize>,
    state: MachineState,
    fault: Option<Fault>,
    device: D,
}

impl<D: DeviceBridge> Cpu<D> {
    pub fn new(image: &Image, device: D) -> Self {
        Self::with_config(image, device, CpuConfig::default())
    }

    pub fn with_config(image: &Image, device: D, config: CpuConfig) -> Self {
        Cpu {
            pc: 0,
            op_pc: 0,
            stack: BoundedStack::new(config.stack_depth),
            calls: BoundedStack::new(config.call_depth),
            control: BoundedStack::new(config.control_depth),
            memory: Memory::new(image.rom.clone()),
            time: SystemTime::new(),
            entries: image.entries,
            breakpoints: BTreeSet::new(),
            state: MachineState::Reset,
            fault: None,
            config,
            device,
        }
    }

    /// Replaces the program and resets. Breakpoints are kept.
    pub fn load(&mut self, image: &Image) {
        self.memory.set_rom(image.rom.clone());
        self.entries = image.entries;
        self.reset();
    }

    /// Clears stacks, RAM and the clock, and moves the PC to 0.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.op_pc = 0;
        self.stack.clear();
        self.calls.clear();
        self.control.clear();
        self.memory.clear();
        self.time.reset();
        self.state = MachineState::Reset;
        self.fault = None;
    }

    /// Resets and positions the PC at one of the program's entry words.
    pub fn enter(&mut self, word: EntryWord) {
        self.reset();
        self.pc = self.entries.get(word) as usize;
        debug!(word = %word, pc = self.pc, "enter");
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CpuConfig {
        &mut self.config
    }

    /// Operand stack, bottom first.
    pub fn stack(&self) -> &[f32] {
        self.stack.as_slice()
    }

    pub fn call_stack(&self) -> &[f32] {
        self.calls.as_slice()
    }

    pub fn control_stack(&self) -> &[f32] {
        self.control.as_slice()
    }

    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn time(&self) -> &SystemTime {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut SystemTime {
        &mut self.time
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The opcode at the PC, or `None` for a packed immediate or a bad byte.
    pub fn current_opcode(&self) -> Option<Opcode> {
        let byte = *self.memory.rom().get(self.pc)?;
        if byte & SHORT_IMMEDIATE != 0 {
            return None;
        }
        Opcode::from_byte(byte)
    }

    /// Loads captured state; nothing changes if a stack does not fit.
    pub(crate) fn restore_parts(&mut self, snap: &MachineSnapshot) -> Result<(), StackError> {
        let fits = snap.stack.len() <= self.stack.capacity()
            && snap.calls.len() <= self.calls.capacity()
            && snap.control.len() <= self.control.capacity();
        if !fits {
            return Err(StackError::Overflow);
        }
        self.stack.load(&snap.stack)?;
        self.calls.load(&snap.calls)?;
        self.control.load(&snap.control)?;

        let mut memory = snap.memory.clone();
        memory.set_rom(self.memory.rom().to_vec());
        self.memory = memory;

        self.pc = snap.pc;
        self.op_pc = snap.pc;
        self.state = snap.state;
        self.fault = snap.fault.clone();
        self.time = snap.time;
        self.breakpoints = snap.breakpoints.iter().copied().collect();
        Ok(())
    }

    // ========================================================================
    // Breakpoints
    // ========================================================================

    pub fn set_breakpoint(&mut self, addr: usize) {
        self.breakpoints.insert(addr);
    }

    pub fn clear_breakpoint(&mut self, addr: usize) -> bool {
        self.breakpoints.remove(&addr)
    }

    /// Returns whether a breakpoint is set at `addr` afterwards.
    pub fn toggle_breakpoint(&mut self, addr: usize) -> bool {
        if !self.breakpoints.remove(&addr) {
            self.breakpoints.insert(addr);
            return true;
        }
        false
    }

    pub fn is_breakpoint(&self, addr: usize) -> bool {
        self.breakpoints.contains(&addr)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = usize> + '_ {
        self.breakpoints.iter().copied()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Executes one instruction.
    ///
    /// A breakpoint at the PC suspends before execution unless the PC is
    /// `ignore`. Stepping a stopped or faulted machine changes nothing.
    pub fn step(&mut self, ignore: Option<usize>) -> Step {
        if matches!(self.state, MachineState::Stopped | MachineState::Faulted) {
            return Step::Faulted(Fault::NotRunning { state: self.state });
        }
        if self.breakpoints.contains(&self.pc) && ignore != Some(self.pc) {
            debug!(pc = self.pc, "breakpoint");
            self.state = MachineState::Breakpoint;
            return Step::Breakpoint(self.pc);
        }

        self.state = MachineState::Running;
        match self.execute() {
            Ok(Flow::Next) => Step::Continue,
            Ok(Flow::Stop) => {
                debug!(pc = self.op_pc, ticks = self.time.ticks(), "stopped");
                self.state = MachineState::Stopped;
                Step::Stopped
            }
            Err(fault) => {
                warn!(%fault, "machine fault");
                self.state = MachineState::Faulted;
                self.fault = Some(fault.clone());
                Step::Faulted(fault)
            }
        }
    }

    /// Steps until something other than `Continue` happens, or the step
    /// budget runs out.
    ///
    /// When resuming from a breakpoint, the breakpoint at the current PC is
    /// passed over once.
    pub fn run(&mut self) -> Step {
        let mut ignore = (self.state == MachineState::Breakpoint).then_some(self.pc);
        let mut steps = 0;
        loop {
            if self.config.max_steps.is_some_and(|max| steps >= max) {
                debug!(steps, "step budget exhausted");
                return Step::Continue;
            }
            let outcome = self.step(ignore.take());
            steps += 1;
            if !outcome.is_continue() {
                return outcome;
            }
        }
    }

    fn execute(&mut self) -> Result<Flow, Fault> {
        let pc = self.pc;
        self.op_pc = pc;
        let rom = self.memory.rom();
        let byte = *rom.get(pc).ok_or(Fault::PcOutOfRange { pc: pc as i64 })?;

        if byte & SHORT_IMMEDIATE != 0 || matches!(
            Opcode::from_byte(byte),
            Some(Opcode::Imms | Opcode::PcImms | Opcode::Immu | Opcode::Immf)
        ) {
            let imm = Immediate::decode(rom, pc).ok_or(Fault::PcOutOfRange {
                pc: rom.len() as i64,
            })?;
            self.time.tick();
            trace!(pc, %imm, "imm");
            self.push(imm.value(pc))?;
            self.pc = pc + imm.len();
            return Ok(Flow::Next);
        }

        let op = Opcode::from_byte(byte).ok_or(Fault::InvalidOpcode { byte, pc })?;
        self.time.tick();
        trace!(pc, op = op.mnemonic(), "exec");
        self.pc = pc + op.len();
        self.dispatch(op)
    }

    fn dispatch(&mut self, op: Opcode) -> Result<Flow, Fault> {
        match op {
            // stack
            Opcode::Dup => {
                let v = self.peek(0)?;
                self.push(v)?;
            }
            Opcode::Drop => {
                self.pop()?;
            }
            Opcode::Over => {
                let v = self.peek(1)?;
                self.push(v)?;
            }
            Opcode::Swap => {
                let (a, b) = self.pop2()?;
                self.push(b)?;
                self.push(a)?;
            }
            Opcode::Copy => {
                let depth = to_index(self.pop()?);
                let depth = usize::try_from(depth).map_err(|_| self.underflow(StackKind::Operand))?;
                let v = self.peek(depth)?;
                self.push(v)?;
            }
            Opcode::Rot => {
                let c = self.pop()?;
                let (a, b) = self.pop2()?;
                self.push(b)?;
                self.push(c)?;
                self.push(a)?;
            }
            Opcode::Nrot => {
                let c = self.pop()?;
                let (a, b) = self.pop2()?;
                self.push(c)?;
                self.push(a)?;
                self.push(b)?;
            }

            // arithmetic
            Opcode::Add => self.binary(|a, b| a + b)?,
            Opcode::Sub => self.binary(|a, b| a - b)?,
            Opcode::Mul => self.binary(|a, b| a * b)?,
            Opcode::Div => self.binary(|a, b| a / b)?,
            Opcode::Pow => self.binary(f64::powf)?,
            Opcode::Neg => self.unary(|a| -a)?,
            Opcode::Rec => self.unary(|a| 1.0 / a)?,

            // tests
            Opcode::Tz => self.unary(|a| flag(a == 0.0))?,
            Opcode::Tgt => self.binary(|a, b| flag(a > b))?,
            Opcode::Tlt => self.binary(|a, b| flag(a < b))?,
            Opcode::Tge => self.binary(|a, b| flag(a >= b))?,
            Opcode::Tle => self.binary(|a, b| flag(a <= b))?,
            Opcode::Tin => self.unary(|a| flag(!a.is_finite()))?,

            // bitwise
            Opcode::Or => self.bitwise(|a, b| a | b)?,
            Opcode::And => self.bitwise(|a, b| a & b)?,
            Opcode::Xor => self.bitwise(|a, b| a ^ b)?,
            Opcode::Binv => {
                let a = to_int(self.pop()?);
                self.push(!a as f32)?;
            }

            // control flow
            Opcode::Bnz => {
                let (cond, target) = self.pop2()?;
                if cond != 0.0 {
                    self.jump(target)?;
                }
            }
            Opcode::Bz => {
                let (cond, target) = self.pop2()?;
                if cond == 0.0 {
                    self.jump(target)?;
                }
            }
            Opcode::Bra => {
                let target = self.pop()?;
                self.jump(target)?;
            }
            Opcode::Call => {
                let target = self.pop()?;
                let back = self.pc as f32;
                self.calls
                    .push(back)
                    .map_err(|e| e.into_fault(StackKind::Call, self.op_pc))?;
                self.jump(target)?;
            }
            Opcode::Ret | Opcode::Exit => {
                if self.calls.is_empty() {
                    return Ok(Flow::Stop);
                }
                let back = self.pop_call()?;
                self.jump(back)?;
            }
            Opcode::Wait => self.time.wait_for_zero_cross(),
            Opcode::Nop => {}

            // return stack
            Opcode::ToR => {
                let v = self.pop()?;
                self.calls
                    .push(v)
                    .map_err(|e| e.into_fault(StackKind::Call, self.op_pc))?;
            }
            Opcode::FromR => {
                let v = self.pop_call()?;
                self.push(v)?;
            }
            Opcode::CopyR => {
                let v = self
                    .calls
                    .peek(0)
                    .map_err(|e| e.into_fault(StackKind::Call, self.op_pc))?;
                self.push(v)?;
            }

            // operand forms never get here; a bare IMM has no operand
            Opcode::Imm | Opcode::PcImms | Opcode::Imms | Opcode::Immu | Opcode::Immf => {
                return Err(Fault::InvalidOpcode {
                    byte: op.code(),
                    pc: self.op_pc,
                });
            }

            // memory
            Opcode::Store => {
                let (value, addr) = self.pop2()?;
                let addr = to_index(addr);
                self.memory
                    .write_f32(addr, value)
                    .map_err(|e| self.memory_fault(e))?;
            }
            Opcode::Fetch => {
                let addr = to_index(self.pop()?);
                let v = self.memory.read_f32(addr).map_err(|e| self.memory_fault(e))?;
                self.push(v)?;
            }
            Opcode::StoreByte => {
                let (value, addr) = self.pop2()?;
                let addr = to_index(addr);
                self.memory
                    .write_u8(addr, to_int(value) as u8)
                    .map_err(|e| self.memory_fault(e))?;
            }
            Opcode::FetchByte => {
                let addr = to_index(self.pop()?);
                let v = self.memory.read_u8(addr).map_err(|e| self.memory_fault(e))?;
                self.push(v as f32)?;
            }

            // packets
            Opcode::Txp => {
                let packet = *self.memory.tx();
                let accepted = self.device.transmit(&packet);
                self.push(flag(accepted) as f32)?;
            }
            Opcode::Rxp => {
                let received = match self.device.receive() {
                    Some(packet) => {
                        self.memory.set_rx(packet);
                        true
                    }
                    None => false,
                };
                self.push(flag(received) as f32)?;
            }

            // I/O points
            Opcode::Ior => {
                let point = self.io_point(IoAccess::Read)?;
                let v = self.device.read(point);
                self.push(v)?;
            }
            Opcode::Iow => {
                let point = self.io_point(IoAccess::Write)?;
                let v = self.pop()?;
                self.device.write(point, v);
            }
            Opcode::Iort => {
                let point = self.io_point(IoAccess::ReadTarget)?;
                let v = self.device.read_target(point);
                self.push(v)?;
            }

            // loops
            Opcode::For => {
                let exit = self.pop()?;
                let index = self.pop()?;
                let (limit, step) = self.pop2()?;
                if in_range(limit, step, index) {
                    let resume = self.pc as f32;
                    self.push_frame([limit, step, index, resume])?;
                } else {
                    self.jump(exit)?;
                }
            }
            Opcode::EndFor => {
                let resume = self.pop_control()?;
                let index = self.pop_control()?;
                let step = self.pop_control()?;
                let limit = self.pop_control()?;
                let index = index + step;
                if in_range(limit, step, index) {
                    self.push_frame([limit, step, index, resume])?;
                    self.jump(resume)?;
                }
            }
            Opcode::Index => {
                let index = self
                    .control
                    .peek(1)
                    .map_err(|e| e.into_fault(StackKind::Control, self.op_pc))?;
                self.push(index)?;
            }

            Opcode::Stop => return Ok(Flow::Stop),
        }
        Ok(Flow::Next)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn push(&mut self, v: f32) -> Result<(), Fault> {
        self.stack
            .push(v)
            .map_err(|e| e.into_fault(StackKind::Operand, self.op_pc))
    }

    fn pop(&mut self) -> Result<f32, Fault> {
        self.stack
            .pop()
            .map_err(|e| e.into_fault(StackKind::Operand, self.op_pc))
    }

    /// Pops `( a b -- )`, returning `(a, b)`.
    fn pop2(&mut self) -> Result<(f32, f32), Fault> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    fn peek(&self, depth: usize) -> Result<f32, Fault> {
        self.stack
            .peek(depth)
            .map_err(|e| e.into_fault(StackKind::Operand, self.op_pc))
    }

    fn pop_call(&mut self) -> Result<f32, Fault> {
        self.calls
            .pop()
            .map_err(|e| e.into_fault(StackKind::Call, self.op_pc))
    }

    fn pop_control(&mut self) -> Result<f32, Fault> {
        self.control
            .pop()
            .map_err(|e| e.into_fault(StackKind::Control, self.op_pc))
    }

    fn push_frame(&mut self, frame: [f32; 4]) -> Result<(), Fault> {
        for v in frame {
            self.control
                .push(v)
                .map_err(|e| e.into_fault(StackKind::Control, self.op_pc))?;
        }
        Ok(())
    }

    fn underflow(&self, stack: StackKind) -> Fault {
        Fault::StackUnderflow {
            stack,
            pc: self.op_pc,
        }
    }

    fn memory_fault(&self, bad: BadAccess) -> Fault {
        Fault::MemoryAccess {
            addr: bad.addr,
            len: bad.len,
            pc: self.op_pc,
        }
    }

    fn unary(&mut self, f: impl Fn(f64) -> f64) -> Result<(), Fault> {
        let a = self.pop()?;
        self.push(f(a as f64) as f32)
    }

    fn binary(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), Fault> {
        let (a, b) = self.pop2()?;
        self.push(f(a as f64, b as f64) as f32)
    }

    fn bitwise(&mut self, f: impl Fn(i64, i64) -> i64) -> Result<(), Fault> {
        let (a, b) = self.pop2()?;
        self.push(f(to_int(a), to_int(b)) as f32)
    }

    fn jump(&mut self, target: f32) -> Result<(), Fault> {
        let to = to_int(target);
        if !target.is_finite() || to < 0 || to as usize >= self.memory.rom().len() {
            return Err(Fault::PcOutOfRange { pc: to });
        }
        self.pc = to as usize;
        Ok(())
    }

    /// Pops a point index and checks it allows `access`.
    fn io_point(&mut self, access: IoAccess) -> Result<IoPoint, Fault> {
        let index = to_index(self.pop()?);
        let point = IoPoint::from_index(index).ok_or(Fault::UnknownIoPoint {
            index,
            pc: self.op_pc,
        })?;
        if !point.permissions().allows(access) {
            return Err(Fault::IoPermission {
                point,
                access,
                pc: self.op_pc,
            });
        }
        Ok(point)
    }
}

fn to_int(v: f32) -> i64 {
    v.round_ties_even() as i64
}

/// Like [`to_int`], but NaN and infinities land below every valid address,
/// point and depth.
fn to_index(v: f32) -> i64 {
    if v.is_finite() { to_int(v) } else { i64::MIN }
}

fn flag(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn in_range(limit: f32, step: f32, index: f32) -> bool {
    (step > 0.0 && index < limit) || (step < 0.0 && index > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile_source;

    const HEADER: &str = "Program(\"test\", 100, 60)\n: Idle ;\n: Halt ;\n";

    fn machine(words: &str) -> Cpu {
        machine_from(&format!("{}{}\n", HEADER, words))
    }

    fn machine_from(source: &str) -> Cpu {
        let program = compile_source(source).unwrap();
        let mut cpu = Cpu::new(&program.image, SimulatedDevice::new());
        cpu.enter(EntryWord::RunShot);
        cpu
    }

    fn run_shot(body: &str) -> Cpu {
        let mut cpu = machine(&format!(": RunShot {} ;", body));
        assert_eq!(cpu.run(), Step::Stopped);
        cpu
    }

    fn raw(rom: Vec<u8>) -> Cpu {
        raw_with(rom, CpuConfig::default())
    }

    fn raw_with(rom: Vec<u8>, config: CpuConfig) -> Cpu {
        let image = Image {
            max_volume: 0,
            max_seconds: 0,
            entries: EntryPoints::default(),
            rom,
        };
        Cpu::with_config(&image, SimulatedDevice::new(), config)
    }

    fn short(v: u8) -> u8 {
        SHORT_IMMEDIATE | v
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_shot("1 2 +").stack(), &[3.0]);
        assert_eq!(run_shot("7 2 -").stack(), &[5.0]);
        assert_eq!(run_shot("3 4 *").stack(), &[12.0]);
        assert_eq!(run_shot("1 4 /").stack(), &[0.25]);
        assert_eq!(run_shot("2 10 POW").stack(), &[1024.0]);
        assert_eq!(run_shot("5 NEG").stack(), &[-5.0]);
        assert_eq!(run_shot("4 REC").stack(), &[0.25]);
    }

    #[test]
    fn test_division_by_zero_is_infinite() {
        let cpu = run_shot("1 0 / TIN");
        assert_eq!(cpu.stack(), &[1.0]);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(run_shot("3 2 TGT").stack(), &[1.0]);
        assert_eq!(run_shot("3 2 TLT").stack(), &[0.0]);
        assert_eq!(run_shot("2 2 TGE").stack(), &[1.0]);
        assert_eq!(run_shot("2 2 TLE").stack(), &[1.0]);
        assert_eq!(run_shot("0 TZ").stack(), &[1.0]);
    }

    #[test]
    fn test_bitwise_rounds_half_to_even() {
        assert_eq!(run_shot("12 10 AND").stack(), &[8.0]);
        assert_eq!(run_shot("12 3 OR").stack(), &[15.0]);
        assert_eq!(run_shot("6 3 XOR").stack(), &[5.0]);
        assert_eq!(run_shot("2.5 1 OR").stack(), &[3.0]);
        assert_eq!(run_shot("0 BINV").stack(), &[-1.0]);
    }

    #[test]
    fn test_stack_shuffles() {
        assert_eq!(run_shot("1 2 3 ROT").stack(), &[2.0, 3.0, 1.0]);
        assert_eq!(run_shot("1 2 3 NROT").stack(), &[3.0, 1.0, 2.0]);
        assert_eq!(run_shot("1 2 OVER").stack(), &[1.0, 2.0, 1.0]);
        assert_eq!(run_shot("1 2 SWAP").stack(), &[2.0, 1.0]);
        assert_eq!(run_shot("10 20 30 1 COPY").stack(), &[10.0, 20.0, 30.0, 20.0]);
    }

    #[test]
    fn test_return_stack() {
        let cpu = run_shot("5 TOR COPYR FROMR");
        assert_eq!(cpu.stack(), &[5.0, 5.0]);
        assert!(cpu.call_stack().is_empty());
    }

    #[test]
    fn test_call_and_return() {
        let mut cpu = machine(": AddThree 3 + ;\n: RunShot 1 AddThree AddThree ;");
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[7.0]);
        assert_eq!(cpu.call_depth(), 0);
    }

    #[test]
    fn test_if_else_paths() {
        assert_eq!(run_shot("1 IF 7 ELSE 8 ENDIF").stack(), &[7.0]);
        assert_eq!(run_shot("0 IF 7 ELSE 8 ENDIF").stack(), &[8.0]);
    }

    #[test]
    fn test_for_counts_up() {
        let cpu = run_shot("0 5 1 0 FOR 1 + ENDFOR");
        assert_eq!(cpu.stack(), &[5.0]);
        assert!(cpu.control_stack().is_empty());

        let cpu = run_shot("0 5 1 0 FOR INDEX + ENDFOR");
        assert_eq!(cpu.stack(), &[10.0]);
    }

    #[test]
    fn test_for_final_index() {
        let code = Opcode::EndFor.code();
        let mut cpu = machine(": RunShot 0 5 1 0 FOR 1 + ENDFOR ;");
        // stop on the last ENDFOR and look at the frame it pops
        let endfor = cpu.memory().rom().iter().rposition(|&b| b == code).unwrap();
        cpu.set_breakpoint(endfor);
        let mut last_index = None;
        loop {
            match cpu.run() {
                Step::Breakpoint(_) => last_index = Some(cpu.control_stack()[2]),
                Step::Stopped => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(last_index.map(|i| i + 1.0), Some(5.0));
    }

    #[test]
    fn test_for_counts_down() {
        let cpu = run_shot("0 0 -1 3 FOR 1 + ENDFOR");
        assert_eq!(cpu.stack(), &[3.0]);
        let cpu = run_shot("0 0 -1 3 FOR INDEX + ENDFOR");
        assert_eq!(cpu.stack(), &[6.0]);
    }

    #[test]
    fn test_for_zero_step_skips() {
        let cpu = run_shot("0 5 0 0 FOR 1 + ENDFOR");
        assert_eq!(cpu.stack(), &[0.0]);
    }

    #[test]
    fn test_for_empty_range_skips() {
        let cpu = run_shot("0 0 1 3 FOR 1 + ENDFOR");
        assert_eq!(cpu.stack(), &[0.0]);
    }

    #[test]
    fn test_nested_for_index_is_innermost() {
        let cpu = run_shot("0 2 1 0 FOR 3 1 0 FOR INDEX + ENDFOR ENDFOR");
        assert_eq!(cpu.stack(), &[6.0]);
    }

    #[test]
    fn test_memory_roundtrip() {
        assert_eq!(run_shot("7 12 ! 12 @").stack(), &[7.0]);
        assert_eq!(run_shot("300 3 !B 3 @B").stack(), &[44.0]);
    }

    #[test]
    fn test_globals_live_in_scratch() {
        let mut cpu = machine_from(
            "Program(\"test\", 100, 60)\nGlobal Level\n: Idle ;\n: Halt ;\n: RunShot 42 Level ! Level @ ;\n",
        );
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[42.0]);
        assert_eq!(cpu.memory().read_f32(0).unwrap(), 42.0);
    }

    #[test]
    fn test_memory_fault() {
        let mut cpu = machine(": RunShot 1 254 ! ;");
        let outcome = cpu.run();
        assert!(matches!(
            outcome,
            Step::Faulted(Fault::MemoryAccess { addr: 254, len: 4, .. })
        ));
        assert_eq!(cpu.state(), MachineState::Faulted);
    }

    #[test]
    fn test_rom_alias_is_readable() {
        let cpu = run_shot("0x10000 @B");
        let first = cpu.memory().rom()[0];
        assert_eq!(cpu.stack(), &[first as f32]);
    }

    #[test]
    fn test_io_points() {
        let cpu = run_shot("9 IO_Pressure IOW IO_Pressure IOR IO_Pressure IORT");
        assert_eq!(cpu.stack(), &[9.0, 9.0]);
        assert_eq!(cpu.device().target(IoPoint::Pressure), 9.0);
    }

    #[test]
    fn test_io_read_of_sensor() {
        let mut cpu = machine(": RunShot IO_Vol IOR ;");
        cpu.device_mut().set_reading(IoPoint::Vol, 36.5);
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[36.5]);
    }

    #[test]
    fn test_io_permission_fault() {
        let mut cpu = machine(": RunShot 1 IO_Vol IOW ;");
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::IoPermission {
                point: IoPoint::Vol,
                access: IoAccess::Write,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_io_point() {
        let mut cpu = raw(vec![short(20), Opcode::Ior.code()]);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::UnknownIoPoint { index: 20, pc: 1 })
        ));
    }

    #[test]
    fn test_nan_address_faults() {
        let nan = [short(0), short(0), Opcode::Div.code()];
        let mut store = vec![short(7)];
        store.extend(nan);
        store.push(Opcode::Store.code());
        let mut cpu = raw(store);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::MemoryAccess { len: 4, pc: 4, .. })
        ));
        assert_eq!(cpu.memory().read_f32(0).unwrap(), 0.0);

        let mut fetch = nan.to_vec();
        fetch.push(Opcode::FetchByte.code());
        let mut cpu = raw(fetch);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::MemoryAccess { len: 1, pc: 3, .. })
        ));
    }

    #[test]
    fn test_nan_io_point_faults() {
        let mut cpu = raw(vec![short(0), short(0), Opcode::Div.code(), Opcode::Ior.code()]);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::UnknownIoPoint { pc: 3, .. })
        ));
    }

    #[test]
    fn test_nan_copy_depth_underflows() {
        let mut cpu = raw(vec![
            short(5),
            short(0),
            short(0),
            Opcode::Div.code(),
            Opcode::Copy.code(),
        ]);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::StackUnderflow {
                stack: StackKind::Operand,
                pc: 4
            })
        ));
    }

    #[test]
    fn test_packets() {
        let mut cpu = machine(": RunShot 5 0x110 !B TXP RXP? RXP? 0x100 @B ;");
        cpu.device_mut().queue_packet([3; 16]);
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[1.0, 1.0, 0.0, 3.0]);
        assert_eq!(cpu.device().sent_packets()[0][0], 5);
    }

    #[test]
    fn test_ticks_and_wait() {
        let mut cpu = raw(vec![Opcode::Nop.code(), Opcode::Wait.code(), Opcode::Ret.code()]);
        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.time().ticks(), 51);
    }

    #[test]
    fn test_stop_opcode() {
        let mut cpu = raw(vec![Opcode::Stop.code(), short(1)]);
        assert_eq!(cpu.run(), Step::Stopped);
        assert!(cpu.stack().is_empty());
        assert_eq!(cpu.state(), MachineState::Stopped);
    }

    #[test]
    fn test_underflow_then_not_running() {
        let mut cpu = raw(vec![Opcode::Drop.code()]);
        assert_eq!(
            cpu.step(None),
            Step::Faulted(Fault::StackUnderflow {
                stack: StackKind::Operand,
                pc: 0
            })
        );
        assert_eq!(cpu.state(), MachineState::Faulted);
        assert_eq!(
            cpu.step(None),
            Step::Faulted(Fault::NotRunning {
                state: MachineState::Faulted
            })
        );
        assert_eq!(cpu.state(), MachineState::Faulted);
        assert_eq!(cpu.pc(), 0);
    }

    #[test]
    fn test_overflow() {
        let config = CpuConfig {
            stack_depth: 2,
            ..CpuConfig::default()
        };
        let mut cpu = raw_with(vec![short(1), short(2), short(3)], config);
        assert_eq!(
            cpu.run(),
            Step::Faulted(Fault::StackOverflow {
                stack: StackKind::Operand,
                pc: 2
            })
        );
        assert_eq!(cpu.stack(), &[1.0, 2.0]);
    }

    #[test]
    fn test_call_stack_underflow() {
        let mut cpu = raw(vec![Opcode::FromR.code()]);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::StackUnderflow {
                stack: StackKind::Call,
                ..
            })
        ));
    }

    #[test]
    fn test_index_outside_loop_faults() {
        let mut cpu = raw(vec![Opcode::Index.code()]);
        assert!(matches!(
            cpu.run(),
            Step::Faulted(Fault::StackUnderflow {
                stack: StackKind::Control,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_opcodes() {
        let mut cpu = raw(vec![60]);
        assert_eq!(
            cpu.run(),
            Step::Faulted(Fault::InvalidOpcode { byte: 60, pc: 0 })
        );
        let mut cpu = raw(vec![Opcode::Imm.code()]);
        assert!(matches!(cpu.run(), Step::Faulted(Fault::InvalidOpcode { .. })));
    }

    #[test]
    fn test_branch_out_of_rom() {
        let mut cpu = raw(vec![short(100), Opcode::Bra.code()]);
        assert_eq!(cpu.run(), Step::Faulted(Fault::PcOutOfRange { pc: 100 }));
    }

    #[test]
    fn test_running_off_the_end() {
        let mut cpu = raw(vec![short(1)]);
        assert_eq!(cpu.run(), Step::Faulted(Fault::PcOutOfRange { pc: 1 }));
    }

    #[test]
    fn test_breakpoint_hits_once() {
        let mut cpu = raw(vec![short(1), short(2), short(3), Opcode::Ret.code()]);
        cpu.set_breakpoint(1);

        assert_eq!(cpu.run(), Step::Breakpoint(1));
        assert_eq!(cpu.pc(), 1);
        assert_eq!(cpu.stack(), &[1.0]);
        assert_eq!(cpu.state(), MachineState::Breakpoint);

        assert_eq!(cpu.run(), Step::Stopped);
        assert_eq!(cpu.stack(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_step_ignoring_breakpoint() {
        let mut cpu = raw(vec![short(1), short(2), Opcode::Ret.code()]);
        cpu.set_breakpoint(0);
        assert_eq!(cpu.step(None), Step::Breakpoint(0));
        assert_eq!(cpu.step(None), Step::Breakpoint(0));
        assert_eq!(cpu.step(Some(0)), Step::Continue);
        assert_eq!(cpu.pc(), 1);
    }

    #[test]
    fn test_breakpoint_in_loop_hits_each_pass() {
        let mut cpu = machine(": RunShot 0 3 1 0 FOR 1 + ENDFOR ;");
        let endfor = cpu
            .memory()
            .rom()
            .iter()
            .rposition(|&b| b == Opcode::EndFor.code())
            .unwrap();
        cpu.set_breakpoint(endfor);
        let mut hits = 0;
        while let Step::Breakpoint(_) = cpu.run() {
            hits += 1;
        }
        assert_eq!(hits, 3);
        assert_eq!(cpu.state(), MachineState::Stopped);
    }

    #[test]
    fn test_toggle_breakpoint() {
        let mut cpu = raw(vec![Opcode::Ret.code()]);
        assert!(cpu.toggle_breakpoint(0));
        assert!(cpu.is_breakpoint(0));
        assert!(!cpu.toggle_breakpoint(0));
        assert_eq!(cpu.breakpoints().count(), 0);
    }

    #[test]
    fn test_step_budget() {
        let config = CpuConfig {
            max_steps: Some(10),
            ..CpuConfig::default()
        };
        // BRA back to 0 forever
        let mut cpu = raw_with(vec![short(0), Opcode::Bra.code()], config);
        assert_eq!(cpu.run(), Step::Continue);
        assert_eq!(cpu.time().ticks(), 10);
        assert_eq!(cpu.state(), MachineState::Running);
    }

    #[test]
    fn test_enter_each_word() {
        let source = format!("{}: RunShot 1 ;\n", HEADER);
        let program = compile_source(&source).unwrap();
        let mut cpu = Cpu::new(&program.image, SimulatedDevice::new());
        for word in EntryWord::ALL {
            cpu.enter(word);
            assert_eq!(cpu.pc(), program.image.entry(word) as usize);
            assert_eq!(cpu.state(), MachineState::Reset);
            assert_eq!(cpu.run(), Step::Stopped);
            let expected: &[f32] = if word == EntryWord::RunShot { &[1.0] } else { &[] };
            assert_eq!(cpu.stack(), expected);
        }
    }

    #[test]
    fn test_reset_clears_fault() {
        let mut cpu = raw(vec![Opcode::Drop.code()]);
        cpu.run();
        assert!(cpu.fault().is_some());
        cpu.reset();
        assert_eq!(cpu.state(), MachineState::Reset);
        assert!(cpu.fault().is_none());
    }
}
