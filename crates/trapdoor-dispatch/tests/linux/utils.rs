use std::path::Path;
use std::process::Command;

pub fn compile_tracee(asm_path: &Path, is_pie: bool) -> tempfile::TempPath {
    let out_dir = tempfile::tempdir().expect("tempdir");
    let out_file = tempfile::NamedTempFile::new().expect("tempfile");

    let o = nasm_rs::Build::new()
        .target("x86_64-unknown-linux-gnu")
        .debug(true)
        .file(asm_path)
        .out_dir(&out_dir)
        .compile_objects()
        .expect("nasm")
        .pop()
        .unwrap();

    let mut gcc = Command::new("gcc");
    gcc.arg(o).arg("-pthread").arg("-o").arg(out_file.path());

    if is_pie {
        gcc.arg("-pie");
    } else {
        gcc.arg("-no-pie");
    }

    println!("running: {gcc:?}");

    let gcc = gcc.output().expect("gcc");

    if !gcc.status.success() {
        let msg = String::from_utf8_lossy(&gcc.stderr);
        panic!("{msg}");
    }

    out_file.into_temp_path()
}
