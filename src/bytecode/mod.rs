pub mod compile;
pub mod compile_error;
pub mod debug_map;
pub mod disasm;
pub mod image;
pub mod imm;
pub mod op;
pub mod stack_check;

pub use compile::{Compiler, Program, compile_source};
pub use compile_error::{CompileErrors, Diagnostic, DiagnosticKind};
pub use debug_map::DebugInfo;
pub use disasm::DebugIndex;
pub use image::{EntryWord, Image};
pub use op::Opcode;
