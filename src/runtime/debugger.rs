use tracing::debug;

use crate::bytecode::disasm::DebugIndex;
use crate::bytecode::image::EntryWord;
use crate::bytecode::op::Opcode;
use crate::runtime::io::{DeviceBridge, SimulatedDevice};
use crate::runtime::runtime_error::Step;
use crate::runtime::vm::Cpu;

/// Source-level stepping on top of the machine's single-instruction steps.
///
/// Every command ignores a breakpoint at the PC it started from, so
/// issuing the same command again after a breakpoint moves on.
pub struct Debugger<D: DeviceBridge = SimulatedDevice> {
    cpu: Cpu<D>,
    index: DebugIndex,
}

impl<D: DeviceBridge> Debugger<D> {
    pub fn new(cpu: Cpu<D>, index: DebugIndex) -> Self {
        Debugger { cpu, index }
    }

    pub fn cpu(&self) -> &Cpu<D> {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu<D> {
        &mut self.cpu
    }

    pub fn index(&self) -> &DebugIndex {
        &self.index
    }

    pub fn current_line(&self) -> Option<usize> {
        self.index.line_for(self.cpu.pc())
    }

    pub fn enter(&mut self, word: EntryWord) {
        self.cpu.enter(word);
    }

    /// Sets a breakpoint on the first instruction of `line`, or of the
    /// next line holding code.
    pub fn break_at_line(&mut self, line: usize) -> Option<usize> {
        let addr = self.index.address_for_line(line)?;
        self.cpu.set_breakpoint(addr);
        Some(addr)
    }

    /// One instruction.
    pub fn step(&mut self) -> Step {
        let pc = self.cpu.pc();
        self.cpu.step(Some(pc))
    }

    pub fn run(&mut self) -> Step {
        self.cpu.run()
    }

    /// Runs until the PC is on a different source line.
    pub fn step_line(&mut self) -> Step {
        let start = self.cpu.pc();
        let line = self.current_line();
        loop {
            let outcome = self.cpu.step(Some(start));
            if !outcome.is_continue() || self.current_line() != line {
                return outcome;
            }
        }
    }

    /// Like [`step_line`](Self::step_line), but a call on the current line
    /// runs to completion.
    pub fn step_over(&mut self) -> Step {
        if self.at_return() {
            return self.step();
        }
        let start = self.cpu.pc();
        let line = self.current_line();
        loop {
            let outcome = if self.cpu.current_opcode() == Some(Opcode::Call) {
                self.finish_call(start)
            } else {
                self.cpu.step(Some(start))
            };
            if !outcome.is_continue() || self.current_line() != line {
                return outcome;
            }
        }
    }

    /// Runs until the current word returns.
    pub fn step_out(&mut self) -> Step {
        let start = self.cpu.pc();
        let depth = self.cpu.call_depth();
        loop {
            let leaving = self.at_return() && self.cpu.call_depth() == depth;
            let outcome = self.cpu.step(Some(start));
            if leaving || !outcome.is_continue() {
                return outcome;
            }
        }
    }

    fn at_return(&self) -> bool {
        matches!(self.cpu.current_opcode(), Some(Opcode::Ret | Opcode::Exit))
    }

    /// Executes the `CALL` at the PC and runs until it comes back.
    fn finish_call(&mut self, ignore: usize) -> Step {
        let depth = self.cpu.call_depth();
        let outcome = self.cpu.step(Some(ignore));
        if !outcome.is_continue() {
            return outcome;
        }
        debug!(depth, pc = self.cpu.pc(), "stepping over call");
        while self.cpu.call_depth() > depth {
            let outcome = self.cpu.step(Some(ignore));
            if !outcome.is_continue() {
                return outcome;
            }
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile_source;
    use crate::runtime::runtime_error::MachineState;

    const SOURCE: &str = "Program(\"t\", 100, 60)
: Idle ;
: Halt ;
: Twice
  2 *
  ;
: RunShot
  3
  Twice
  1 +
  ;
";

    fn debugger() -> Debugger {
        let program = compile_source(SOURCE).unwrap();
        let cpu = Cpu::new(&program.image, SimulatedDevice::new());
        let mut dbg = Debugger::new(cpu, DebugIndex::new(program.debug));
        dbg.enter(EntryWord::RunShot);
        dbg
    }

    #[test]
    fn test_step_line() {
        let mut dbg = debugger();
        assert_eq!(dbg.current_line(), Some(8));
        assert_eq!(dbg.step_line(), Step::Continue);
        assert_eq!(dbg.current_line(), Some(9));
        // into the call
        dbg.step_line();
        assert_eq!(dbg.current_line(), Some(5));
        assert_eq!(dbg.cpu().call_depth(), 1);
    }

    #[test]
    fn test_step_over_skips_call_body() {
        let mut dbg = debugger();
        dbg.step_line();
        assert_eq!(dbg.step_over(), Step::Continue);
        assert_eq!(dbg.current_line(), Some(10));
        assert_eq!(dbg.cpu().call_depth(), 0);
        assert_eq!(dbg.cpu().stack(), &[6.0]);
    }

    #[test]
    fn test_step_out_returns_to_caller() {
        let mut dbg = debugger();
        dbg.step_line();
        dbg.step_line();
        assert_eq!(dbg.cpu().call_depth(), 1);
        assert_eq!(dbg.step_out(), Step::Continue);
        assert_eq!(dbg.cpu().call_depth(), 0);
        assert_eq!(dbg.current_line(), Some(10));
        assert_eq!(dbg.cpu().stack(), &[6.0]);
    }

    #[test]
    fn test_step_out_of_entry_word_stops() {
        let mut dbg = debugger();
        assert_eq!(dbg.step_out(), Step::Stopped);
        assert_eq!(dbg.cpu().stack(), &[7.0]);
        assert_eq!(dbg.cpu().state(), MachineState::Stopped);
    }

    #[test]
    fn test_breakpoint_inside_stepped_over_call() {
        let mut dbg = debugger();
        let addr = dbg.break_at_line(5).unwrap();
        dbg.step_line();
        assert_eq!(dbg.step_over(), Step::Breakpoint(addr));
        assert_eq!(dbg.current_line(), Some(5));
        assert_eq!(dbg.step_line(), Step::Continue);
    }

    #[test]
    fn test_break_at_blank_line_moves_forward() {
        let mut dbg = debugger();
        let addr = dbg.break_at_line(7).unwrap();
        assert_eq!(dbg.index().line_for(addr), Some(8));
        dbg.enter(EntryWord::RunShot);
        assert_eq!(dbg.run(), Step::Breakpoint(addr));
    }
}
