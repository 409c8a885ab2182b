use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use froth::bytecode::{DebugInfo, EntryWord, Image};

const PROGRAM: &str = r#"Program("espresso", 100, 60)
Global Shots

: Idle ;
: Halt ;
: Bump Shots @ 1 + Shots ! ;
: RunShot
  Bump
  0 5 1 0 FOR INDEX + ENDFOR
  ;
"#;

fn froth(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_froth"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run froth")
}

fn write_source(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("shot.fth");
    fs::write(&path, text).unwrap();
    path
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn compile_writes_image_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), PROGRAM);

    let out = froth(&[src.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let image = Image::read_from(&dir.path().join("shot.bin")).unwrap();
    let debug = DebugInfo::read_from(&dir.path().join("shot.debug")).unwrap();
    assert_eq!(image.max_volume, 100);
    assert_eq!(image.max_seconds, 60);
    assert_eq!(image.rom, debug.rom());
    for word in EntryWord::ALL {
        assert_eq!(debug.words[word.name()].address, image.entry(word));
    }
    assert_eq!(debug.source, PROGRAM);
}

#[test]
fn compile_errors_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(
        dir.path(),
        "Program(\"bad\", 1, 1)\n: Idle Nope ;\n: Halt ;\n: RunShot ;\n",
    );

    let out = froth(&[src.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("(2, 8)"), "stderr: {}", err);
    assert!(err.contains("'Nope'"));
    assert!(err.contains("1 error detected."));
    assert!(!dir.path().join("shot.bin").exists());
    assert!(!dir.path().join("shot.debug").exists());
}

#[test]
fn run_reports_final_stack() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), PROGRAM);
    assert!(froth(&[src.to_str().unwrap()]).status.success());

    let bin = dir.path().join("shot.bin");
    let out = froth(&["run", bin.to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("stopped after"), "stdout: {}", text);
    assert!(text.contains("stack: [10]"), "stdout: {}", text);

    let out = froth(&["run", bin.to_str().unwrap(), "--word", "Idle"]);
    assert!(stdout(&out).contains("stack: []"));
}

#[test]
fn run_stops_at_breakpoint() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), PROGRAM);
    assert!(froth(&[src.to_str().unwrap()]).status.success());
    let image = Image::read_from(&dir.path().join("shot.bin")).unwrap();
    let entry = format!("{:#x}", image.entry(EntryWord::RunShot));

    let bin = dir.path().join("shot.bin");
    let out = froth(&["run", bin.to_str().unwrap(), "--break", &entry]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("breakpoint at"));
}

#[test]
fn run_with_step_budget() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(
        dir.path(),
        "Program(\"spin\", 1, 1)\n: Idle ;\n: Halt ;\n: RunShot REPEAT NOP ENDREPEAT ;\n",
    );
    assert!(froth(&[src.to_str().unwrap()]).status.success());

    let bin = dir.path().join("shot.bin");
    let out = froth(&["run", bin.to_str().unwrap(), "--max-steps", "100"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("step budget exhausted"));
}

#[test]
fn run_unknown_word_fails() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), PROGRAM);
    assert!(froth(&[src.to_str().unwrap()]).status.success());

    let bin = dir.path().join("shot.bin");
    let out = froth(&["run", bin.to_str().unwrap(), "--word", "Brew"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown entry word"));
}

#[test]
fn disasm_lists_words() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), PROGRAM);
    assert!(froth(&[src.to_str().unwrap()]).status.success());

    let out = froth(&["disasm", dir.path().join("shot.debug").to_str().unwrap()]);
    assert!(out.status.success());
    let text = stdout(&out);
    for name in ["Idle", "Halt", "Bump", "RunShot"] {
        assert!(text.contains(&format!(" {}\n", name)), "missing {}", name);
    }
    assert!(text.contains("ENDFOR"));
    assert!(text.contains("CALL"));
}

#[test]
fn tokens_dump() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(dir.path(), ": Idle 0x10 ;");

    let out = froth(&["tokens", src.to_str().unwrap(), "--no-color"]);
    assert!(out.status.success());
    let text = stdout(&out);
    assert!(text.contains("\"Idle\""), "stdout: {}", text);
    assert!(text.contains("\"0x10\""), "stdout: {}", text);
}

#[test]
fn missing_file_is_an_error() {
    let out = froth(&["/nonexistent/prog.fth"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("failed to read"));
}
