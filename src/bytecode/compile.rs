use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::bytecode::compile_error::{CompileErrors, Diagnostic};
use crate::bytecode::debug_map::{DebugEntry, DebugInfo, DebugMap, EntryKind, Word};
use crate::bytecode::image::{EntryPoints, EntryWord, Image, MAX_ROM_LEN};
use crate::bytecode::imm::Immediate;
use crate::bytecode::op::Opcode;
use crate::bytecode::stack_check::{StackUse, check_exit, check_loop_body, join_paths};
use crate::frontend::lexer::tokenize;
use crate::frontend::token::{Token, TokenKind};
use crate::runtime::io::IoPoint;
use crate::runtime::memory::SCRATCH_LEN;

/// Syntax errors closer than this many tokens to the previous one are
/// dropped; they are almost always echoes of the first.
const MIN_ERR_DIST: usize = 2;

/// Output of a successful compilation.
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub image: Image,
    pub debug: DebugInfo,
}

/// A label reference emitted before the label was defined.
#[derive(Debug)]
struct ForwardLabel {
    name: String,
    data_at: usize,
    token: Token,
}

/// Code generation state for the word being compiled.
#[derive(Debug)]
struct WordContext {
    name: String,
    /// False when the name was a redefinition; the body is still checked
    /// but never enters the word table.
    registered: bool,
    stack_use: StackUse,
    reachable: bool,
    exit_use: Option<StackUse>,
    forward_labels: Vec<ForwardLabel>,
    /// Label whose address was the last thing emitted.
    last_label_ref: Option<String>,
    /// Stack state at the first branch to each label.
    label_entry: HashMap<String, StackUse>,
}

/// One compilation session.
///
/// Recognizing a construct and emitting its code are the same step; there
/// is no syntax tree. All symbol tables live here, so independent sessions
/// never share state.
pub struct Compiler {
    tokens: Vec<Token>,
    /// Index of the lookahead token.
    pos: usize,
    /// Most recently consumed token.
    token: Token,
    err_dist: usize,
    diagnostics: Vec<Diagnostic>,

    rom: Vec<u8>,
    debug: DebugMap,
    fixups: Vec<usize>,

    words: IndexMap<String, Word>,
    word_stack_use: HashMap<String, StackUse>,
    globals: IndexMap<String, u16>,
    next_global: usize,
    labels: HashMap<String, usize>,
    tags: BTreeMap<u16, String>,
    current: Option<WordContext>,

    name: String,
    max_volume: u16,
    max_seconds: u16,
    source: String,
}

impl Compiler {
    pub fn new(mut tokens: Vec<Token>, source: impl Into<String>) -> Self {
        if tokens.last().map(|t| t.kind) != Some(TokenKind::Eof) {
            let (line, column, offset) = tokens
                .last()
                .map(|t| (t.line, t.column + t.text.chars().count(), t.offset + t.text.len()))
                .unwrap_or((1, 1, 0));
            tokens.push(Token::new(TokenKind::Eof, "", offset, line, column));
        }

        let mut compiler = Compiler {
            tokens,
            pos: 0,
            token: Token::start(),
            err_dist: MIN_ERR_DIST,
            diagnostics: Vec::new(),
            rom: Vec::new(),
            debug: DebugMap::new(),
            fixups: Vec::new(),
            words: IndexMap::new(),
            word_stack_use: HashMap::new(),
            globals: IndexMap::new(),
            next_global: 0,
            labels: HashMap::new(),
            tags: BTreeMap::new(),
            current: None,
            name: String::new(),
            max_volume: 0,
            max_seconds: 0,
            source: source.into(),
        };
        compiler.skip_invalid();
        compiler
    }

    pub fn compile(mut self) -> Result<Program, CompileErrors> {
        self.froth();

        if self.rom.len() > MAX_ROM_LEN {
            let at = self.la().clone();
            self.sem_err(Diagnostic::semantic(
                &at,
                format!("program needs {} bytes of ROM, limit is {}", self.rom.len(), MAX_ROM_LEN),
            ));
        }

        if !self.diagnostics.is_empty() {
            return Err(CompileErrors {
                diagnostics: self.diagnostics,
            });
        }

        let entry = |word: EntryWord| self.words.get(word.name()).map_or(0, |w| w.address);
        let entries = EntryPoints {
            run_shot: entry(EntryWord::RunShot),
            idle: entry(EntryWord::Idle),
            halt: entry(EntryWord::Halt),
        };

        debug!(
            name = %self.name,
            rom = self.rom.len(),
            words = self.words.len(),
            "compiled program"
        );

        Ok(Program {
            name: self.name,
            image: Image {
                max_volume: self.max_volume,
                max_seconds: self.max_seconds,
                entries,
                rom: self.rom,
            },
            debug: DebugInfo {
                entries: self.debug,
                words: self.words,
                globals: self.globals,
                tags: self.tags,
                source: self.source,
            },
        })
    }

    // =========================================================================
    // Token stream
    // =========================================================================

    fn la(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn la_kind(&self) -> TokenKind {
        self.tokens[self.pos].kind
    }

    /// Reports and steps over unscannable input at the lookahead.
    fn skip_invalid(&mut self) {
        while self.tokens[self.pos].kind == TokenKind::Invalid {
            let diag = Diagnostic::invalid_token(&self.tokens[self.pos]);
            self.diagnostics.push(diag);
            self.pos += 1;
        }
    }

    fn get(&mut self) {
        self.token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        self.skip_invalid();
        self.err_dist += 1;
    }

    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.la_kind() == kind {
            self.get();
            true
        } else {
            let diag = Diagnostic::expected(kind, self.la());
            self.syn_err(diag);
            false
        }
    }

    fn expect_ident(&mut self) -> Option<Token> {
        if self.expect(TokenKind::Identifier) {
            Some(self.token.clone())
        } else {
            None
        }
    }

    fn syn_err(&mut self, diag: Diagnostic) {
        if self.err_dist >= MIN_ERR_DIST {
            self.diagnostics.push(diag);
        }
        self.err_dist = 0;
    }

    fn sem_err(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    /// Skips tokens until one of `sync` (or EOF) is the lookahead.
    fn skip_until(&mut self, sync: &[TokenKind]) {
        while self.la_kind() != TokenKind::Eof && !sync.contains(&self.la_kind()) {
            self.get();
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn addr(&self) -> usize {
        self.rom.len()
    }

    fn emit_byte(&mut self, byte: u8, start: bool, kind: EntryKind, at: &Token) {
        self.rom.push(byte);
        self.debug.push(DebugEntry::new(start, kind, at, byte));
    }

    fn account(&mut self, delta: StackUse) {
        if let Some(word) = self.current.as_mut() {
            word.stack_use += delta;
        }
    }

    fn emit_opcode(&mut self, op: Opcode, at: &Token) {
        trace!(addr = self.addr(), op = op.mnemonic(), "emit");
        let label = self.current.as_mut().and_then(|w| w.last_label_ref.take());
        self.emit_byte(op.code(), true, EntryKind::Opcode, at);
        self.account(op.net_effect());
        if let (Some(name), true) = (label, op.is_branch()) {
            self.record_label_entry(name);
        }
        if op.is_exit() {
            self.record_exit(at);
        }
    }

    fn emit_immediate(&mut self, imm: Immediate, at: &Token) {
        trace!(addr = self.addr(), %imm, "emit");
        if let Some(word) = self.current.as_mut() {
            word.last_label_ref = None;
        }
        let has_opcode = imm.opcode().is_some();
        for (i, byte) in imm.encode().into_iter().enumerate() {
            let kind = if i == 0 && has_opcode {
                EntryKind::Opcode
            } else {
                EntryKind::Value
            };
            self.emit_byte(byte, i == 0, kind, at);
        }
        self.account(StackUse::new(1, 0));
    }

    fn emit_value(&mut self, value: f64, at: &Token) {
        let imm = Immediate::choose(value, self.addr());
        self.emit_immediate(imm, at);
    }

    /// Emits a 16-bit address to be patched later and returns the offset of
    /// its first data byte.
    fn emit_placeholder(&mut self, at: &Token) -> usize {
        let data_at = self.addr() + 1;
        self.emit_immediate(Immediate::address(0), at);
        data_at
    }

    fn patch_address(&mut self, data_at: usize, target: usize) {
        debug!(at = data_at, target, "fixup");
        let [lo, hi] = (target as u16).to_le_bytes();
        self.rom[data_at] = lo;
        self.rom[data_at + 1] = hi;
        self.debug.patch(data_at, lo);
        self.debug.patch(data_at + 1, hi);
    }

    fn push_fixup(&mut self, at: &Token) {
        let data_at = self.emit_placeholder(at);
        self.fixups.push(data_at);
    }

    fn resolve_fixup(&mut self, target: usize) {
        if let Some(data_at) = self.fixups.pop() {
            self.patch_address(data_at, target);
        }
    }

    // =========================================================================
    // Stack bookkeeping
    // =========================================================================

    /// Stack state on the current path, or `None` if control cannot reach
    /// this point.
    fn path_state(&self) -> Option<StackUse> {
        self.current
            .as_ref()
            .and_then(|w| w.reachable.then_some(w.stack_use))
    }

    fn restore(&mut self, state: Option<StackUse>) {
        if let Some(word) = self.current.as_mut() {
            match state {
                Some(u) => {
                    word.stack_use = u;
                    word.reachable = true;
                }
                None => word.reachable = false,
            }
        }
    }

    fn record_label_entry(&mut self, name: String) {
        if let Some(word) = self.current.as_mut().filter(|w| w.reachable) {
            let state = word.stack_use;
            word.label_entry.entry(name).or_insert(state);
        }
    }

    fn record_exit(&mut self, at: &Token) {
        let Some(word) = self.current.as_mut() else {
            return;
        };
        if !word.reachable {
            return;
        }
        word.reachable = false;
        match check_exit(word.exit_use, word.stack_use) {
            Ok(u) => word.exit_use = Some(u),
            Err(e) => self.sem_err(Diagnostic::stack(e, at)),
        }
    }

    // =========================================================================
    // Grammar
    // =========================================================================

    fn froth(&mut self) {
        self.expect(TokenKind::ProgramOpen);
        if self.expect(TokenKind::Str) {
            self.name = self.token.text.clone();
        }
        self.expect(TokenKind::Comma);
        self.max_volume = self.header_number("maximum volume");
        self.expect(TokenKind::Comma);
        self.max_seconds = self.header_number("maximum seconds");
        self.expect(TokenKind::RParen);

        self.program();
        self.check_mandatory_words();
        self.expect(TokenKind::Eof);
    }

    fn header_number(&mut self, what: &str) -> u16 {
        if !self.expect(TokenKind::Number) {
            return 0;
        }
        let at = self.token.clone();
        match at.text.parse::<u16>() {
            Ok(v) => v,
            Err(_) => {
                self.sem_err(Diagnostic::semantic(
                    &at,
                    format!("{} must be an integer in 0..=65535, got {}", what, at.text),
                ));
                0
            }
        }
    }

    fn program(&mut self) {
        while self.la_kind() == TokenKind::Global {
            self.global();
        }

        loop {
            match self.la_kind() {
                TokenKind::Colon | TokenKind::AnnotatedColon => self.word(),
                TokenKind::Eof => break,
                _ => {
                    let diag = Diagnostic::invalid("Word", self.la());
                    self.syn_err(diag);
                    self.get();
                    self.skip_until(&[TokenKind::Colon, TokenKind::AnnotatedColon]);
                }
            }
        }
    }

    fn global(&mut self) {
        self.get();
        let Some(at) = self.expect_ident() else {
            return;
        };
        let name = at.text.clone();

        if self.globals.contains_key(&name) {
            self.sem_err(Diagnostic::already_defined("global", &name, &at));
            return;
        }
        if self.next_global + 4 > SCRATCH_LEN {
            self.sem_err(Diagnostic::semantic(
                &at,
                format!(
                    "global '{}' does not fit in the {}-byte scratch area",
                    name, SCRATCH_LEN
                ),
            ));
            return;
        }

        debug!(global = %name, addr = self.next_global, "global");
        self.globals.insert(name, self.next_global as u16);
        self.next_global += 4;
    }

    fn word(&mut self) {
        if self.la_kind() == TokenKind::AnnotatedColon {
            // `:( in -- out )` names are documentation only
            self.get();
            while self.la_kind() == TokenKind::Identifier {
                self.get();
            }
            self.expect(TokenKind::DashDash);
            while self.la_kind() == TokenKind::Identifier {
                self.get();
            }
            self.expect(TokenKind::RParen);
        } else {
            self.expect(TokenKind::Colon);
        }
        self.rest_of_word();
    }

    fn rest_of_word(&mut self) {
        let at = self.expect_ident();
        self.begin_word(at);

        loop {
            self.compound_list();
            match self.la_kind() {
                TokenKind::Semicolon
                | TokenKind::Colon
                | TokenKind::AnnotatedColon
                | TokenKind::Eof => break,
                _ => {
                    let diag = Diagnostic::expected(TokenKind::Semicolon, self.la());
                    self.syn_err(diag);
                    self.get();
                }
            }
        }

        self.end_word();
    }

    fn begin_word(&mut self, at: Option<Token>) {
        let Some(at) = at else {
            self.current = Some(WordContext {
                name: String::new(),
                registered: false,
                stack_use: StackUse::ZERO,
                reachable: true,
                exit_use: None,
                forward_labels: Vec::new(),
                last_label_ref: None,
                label_entry: HashMap::new(),
            });
            return;
        };

        let name = at.text.clone();
        let registered = !self.words.contains_key(&name);
        if registered {
            let word = Word {
                ordinal: self.words.len(),
                address: self.addr() as u16,
            };
            debug!(word = %name, addr = word.address, "word");
            self.words.insert(name.clone(), word);
        } else {
            self.sem_err(Diagnostic::already_defined("word", &name, &at));
        }

        self.current = Some(WordContext {
            name,
            registered,
            stack_use: StackUse::ZERO,
            reachable: true,
            exit_use: None,
            forward_labels: Vec::new(),
            last_label_ref: None,
            label_entry: HashMap::new(),
        });
    }

    fn end_word(&mut self) {
        let at = self.la().clone();
        self.emit_opcode(Opcode::Ret, &at);
        self.expect(TokenKind::Semicolon);

        let Some(word) = self.current.take() else {
            return;
        };

        for fwd in &word.forward_labels {
            let qualified = format!("{}::{}", word.name, fwd.name);
            match self.labels.get(&qualified).copied() {
                Some(target) => self.patch_address(fwd.data_at, target),
                None => self.sem_err(Diagnostic::unresolved(&fwd.name, &fwd.token)),
            }
        }

        let exit_use = word.exit_use.unwrap_or(word.stack_use);
        debug!(word = %word.name, stack_use = %exit_use, "end of word");
        if word.registered {
            self.word_stack_use.insert(word.name, exit_use);
        }
    }

    fn compound_list(&mut self) {
        while self.la_kind().starts_compound() {
            self.compound();
        }
    }

    fn compound(&mut self) {
        match self.la_kind() {
            TokenKind::If => self.if_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Repeat => self.repeat_statement(),
            TokenKind::While => self.while_statement(),
            _ => self.statement(),
        }
    }

    fn if_statement(&mut self) {
        let at = self.la().clone();
        self.get();
        self.push_fixup(&at);
        self.emit_opcode(Opcode::Bz, &at);
        let before = self.path_state();

        self.compound_list();
        let mut taken = self.path_state();
        // without ELSE the untaken path is the empty one
        let mut other = before;

        if self.la_kind() == TokenKind::Else {
            let at = self.la().clone();
            self.get();
            let to_else = self.fixups.pop();
            self.push_fixup(&at);
            self.emit_opcode(Opcode::Bra, &at);
            taken = self.path_state();
            if let Some(data_at) = to_else {
                self.patch_address(data_at, self.addr());
            }

            self.restore(before);
            self.compound_list();
            other = self.path_state();
        }

        let end = self.la().clone();
        self.expect(TokenKind::EndIf);
        self.resolve_fixup(self.addr());

        match join_paths(taken, other) {
            Ok(state) => self.restore(state),
            Err(e) => {
                self.sem_err(Diagnostic::stack(e, &end));
                self.restore(before);
            }
        }
    }

    fn for_statement(&mut self) {
        let at = self.la().clone();
        self.get();
        self.push_fixup(&at);
        self.emit_opcode(Opcode::For, &at);
        let body_start = self.path_state();

        self.compound_list();
        let body_end = self.path_state();

        let end = self.la().clone();
        self.expect(TokenKind::EndFor);
        if let (Some(before), Some(after)) = (body_start, body_end) {
            if let Err(e) = check_loop_body(before, after) {
                self.sem_err(Diagnostic::stack(e, &end));
            }
        }

        // the skip path joins here with the frame never pushed
        self.restore(body_start);
        self.emit_opcode(Opcode::EndFor, &end);
        self.resolve_fixup(self.addr());
    }

    fn repeat_statement(&mut self) {
        self.get();
        let start = self.addr();
        self.compound_list();
        let end = self.la().clone();
        self.expect(TokenKind::EndRepeat);
        self.emit_value(start as f64, &end);
        self.emit_opcode(Opcode::Bra, &end);
    }

    fn while_statement(&mut self) {
        self.get();
        let start = self.addr();
        self.compound_list();
        let end = self.la().clone();
        self.expect(TokenKind::EndWhile);
        self.emit_value(start as f64, &end);
        self.emit_opcode(Opcode::Bnz, &end);
    }

    fn statement(&mut self) {
        match self.la_kind() {
            TokenKind::Identifier => {
                self.get();
                let at = self.token.clone();
                self.resolve_identifier(&at);
            }
            TokenKind::LBrace => self.label(),
            TokenKind::Lt => self.tag(),
            kind if kind.is_number() => {
                self.get();
                let at = self.token.clone();
                self.number(&at);
            }
            kind if kind.is_math_op() => {
                self.get();
                let at = self.token.clone();
                if let Some(op) = Opcode::from_mnemonic(&at.text) {
                    self.emit_opcode(op, &at);
                }
            }
            _ => {
                let diag = Diagnostic::invalid("Statement", self.la());
                self.syn_err(diag);
            }
        }
    }

    fn number(&mut self, at: &Token) {
        let parsed = match at.kind {
            TokenKind::HexNumber => i64::from_str_radix(&at.text[2..], 16)
                .ok()
                .map(|v| v as f64),
            _ => at.text.parse::<f64>().ok(),
        };
        match parsed {
            Some(v) => self.emit_value(v, at),
            None => self.sem_err(Diagnostic::semantic(
                at,
                format!("number '{}' is out of range", at.text),
            )),
        }
    }

    fn label(&mut self) {
        self.get();
        if let Some(at) = self.expect_ident() {
            self.define_label(&at);
        }
        self.expect(TokenKind::RBrace);
    }

    fn define_label(&mut self, at: &Token) {
        let Some(word) = self.current.as_mut() else {
            return;
        };
        // a label is a jump target, so the code after it is live again,
        // entered with the stack of the branch that jumps here
        if !word.reachable {
            if let Some(entry) = word.label_entry.get(&at.text) {
                word.stack_use = *entry;
            }
        }
        word.reachable = true;
        let qualified = format!("{}::{}", word.name, at.text);

        if self.labels.contains_key(&qualified) {
            self.sem_err(Diagnostic::already_defined("label", &qualified, at));
            return;
        }
        debug!(label = %qualified, addr = self.addr(), "label");
        self.labels.insert(qualified, self.addr());
    }

    fn tag(&mut self) {
        self.get();
        if let Some(at) = self.expect_ident() {
            debug!(tag = %at.text, addr = self.addr(), "tag");
            self.tags.insert(self.addr() as u16, at.text);
        }
        self.expect(TokenKind::Gt);
    }

    /// Resolves a bare identifier: opcode, I/O point, word, label of the
    /// current word, then global. Anything else is taken as a label defined
    /// later in the same word.
    fn resolve_identifier(&mut self, at: &Token) {
        let name = at.text.as_str();

        if let Some(op) = Opcode::from_mnemonic(name) {
            if op.is_immediate_form() {
                self.sem_err(Diagnostic::semantic(
                    at,
                    format!("'{}' takes an inline operand and cannot be written directly", name),
                ));
            } else {
                self.emit_opcode(op, at);
            }
            return;
        }

        if let Some(point) = IoPoint::from_name(name) {
            self.emit_value(point.index() as f64, at);
            return;
        }

        if let Some(word) = self.words.get(name).copied() {
            self.call_word(name, word, at);
            return;
        }

        let word_name = self.current.as_ref().map(|w| w.name.clone()).unwrap_or_default();
        let qualified = format!("{}::{}", word_name, name);
        if let Some(addr) = self.labels.get(&qualified).copied() {
            self.emit_value(addr as f64, at);
            self.note_label_ref(name);
            return;
        }

        if let Some(addr) = self.globals.get(name).copied() {
            self.emit_value(addr as f64, at);
            return;
        }

        let data_at = self.emit_placeholder(at);
        if let Some(word) = self.current.as_mut() {
            word.forward_labels.push(ForwardLabel {
                name: name.to_string(),
                data_at,
                token: at.clone(),
            });
        }
        self.note_label_ref(name);
    }

    fn note_label_ref(&mut self, name: &str) {
        if let Some(word) = self.current.as_mut() {
            word.last_label_ref = Some(name.to_string());
        }
    }

    fn call_word(&mut self, name: &str, word: Word, at: &Token) {
        let self_call = self
            .current
            .as_ref()
            .is_some_and(|w| w.registered && w.name == name);
        if self_call {
            self.sem_err(Diagnostic::semantic(
                at,
                format!("word '{}' cannot call itself before its ';'", name),
            ));
            return;
        }

        self.emit_value(word.address as f64, at);
        self.emit_opcode(Opcode::Call, at);
        let callee = self.word_stack_use.get(name).copied().unwrap_or_default();
        self.account(callee);
    }

    fn check_mandatory_words(&mut self) {
        for word in EntryWord::ALL {
            if !self.words.contains_key(word.name()) {
                let at = self.la().clone();
                self.sem_err(Diagnostic::semantic(
                    &at,
                    format!("the word '{}' must be defined", word.name()),
                ));
            }
        }
    }
}

/// Tokenizes and compiles `source` in a fresh session.
pub fn compile_source(source: &str) -> Result<Program, CompileErrors> {
    Compiler::new(tokenize(source), source).compile()
}
