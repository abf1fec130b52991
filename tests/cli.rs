//! Integration tests for the objsheet binary

use std::path::PathBuf;
use std::process::Command;

fn fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/fixtures");
    path.push(name);
    path.display().to_string()
}

fn run(args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_objsheet"))
        // Tests must not depend on a user's ~/.config/objsheet/config.toml.
        .arg("--no-config")
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute objsheet");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    (stdout, stderr, exit_code)
}

#[test]
fn test_eval_formula() {
    let pets = fixture("pets.toml");
    let (stdout, _, code) = run(&[&pets, "-e", "adults", "-e", "Person.name"]);
    assert_eq!(code, 0);
    assert_eq!(stdout, "1\n{Ann, Bo}\n");
}

#[test]
fn test_call_then_eval() {
    let pets = fixture("pets.toml");
    let (stdout, stderr, code) = run(&[
        &pets,
        "-c",
        "addPerson",
        "-a",
        "who=\"Cy\"",
        "-a",
        "age=40",
        "-e",
        "adults",
    ]);
    assert_eq!(code, 0, "stderr: {}", stderr);
    assert_eq!(stdout.trim(), "2");
}

#[test]
fn test_compiler_gives_same_answer() {
    let pets = fixture("pets.toml");
    let (stdout, _, code) = run(&["--compiler", &pets, "-e", "Person.Pet.species"]);
    assert_eq!(code, 0);
    assert_eq!(stdout.trim(), "cat");
}

#[test]
fn test_failed_transaction_exits_nonzero() {
    let pets = fixture("pets.toml");
    let (stdout, stderr, code) = run(&[&pets, "-c", "careful", "-e", "adults"]);
    assert_eq!(code, 1);
    assert!(stdout.is_empty());
    assert!(stderr.starts_with("Error: transaction 'careful'"), "stderr: {}", stderr);
    assert!(stderr.contains("check condition failed"));
}

#[test]
fn test_print_projection() {
    let pets = fixture("pets.toml");
    let (stdout, _, code) = run(&[&pets, "-p", "Person"]);
    assert_eq!(code, 0);
    assert!(stdout.starts_with("Columns:\n"));
    assert!(stdout.contains("species: text"));
    assert!(stdout.contains("cat"));
}

#[test]
fn test_unknown_procedure() {
    let pets = fixture("pets.toml");
    let (_, stderr, code) = run(&[&pets, "-c", "nope"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("No such procedure 'nope'."));
}

#[test]
fn test_missing_sheet_file() {
    let (_, stderr, code) = run(&["/nonexistent/sheet.toml"]);
    assert_eq!(code, 1);
    assert!(stderr.starts_with("Error: loading /nonexistent/sheet.toml"));
}

#[test]
fn test_unknown_option() {
    let (_, stderr, code) = run(&["--bogus"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("Unknown option: --bogus"));
}
