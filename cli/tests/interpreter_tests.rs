//! End-to-end scenarios: source text in, process stdout/exit-code out.

use assert_cmd::Command;
use std::io::Write;
use tempfile::NamedTempFile;

fn run(source: &str) -> std::process::Output {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{source}").unwrap();
    Command::cargo_bin("lox")
        .unwrap()
        .arg(file.path())
        .output()
        .unwrap()
}

fn stdout_lines(source: &str) -> Vec<String> {
    let output = run(source);
    assert!(output.status.success(), "non-zero exit for: {source}\nstderr: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(stdout_lines("print 1 + 2 * 3;"), vec!["7"]);
}

#[test]
fn string_concatenation_of_interned_literals() {
    assert_eq!(
        stdout_lines(r#"var a = "he"; var b = "llo"; print a + b;"#),
        vec!["hello"]
    );
}

#[test]
fn closures_share_and_persist_an_upvalue() {
    let source = "fun makeCounter() { \
         var n = 0; \
         fun inc() { n = n + 1; return n; } \
         return inc; \
     } \
     var c = makeCounter(); \
     print c(); print c(); print c();";
    assert_eq!(stdout_lines(source), vec!["1", "2", "3"]);
}

#[test]
fn class_init_and_method_call() {
    let source = "class Point { \
         init(x, y) { this.x = x; this.y = y; } \
         sum() { return this.x + this.y; } \
     } \
     print Point(3, 4).sum();";
    assert_eq!(stdout_lines(source), vec!["7"]);
}

#[test]
fn inheritance_and_super_call() {
    let source = "class A { hi() { return \"A\"; } } \
     class B < A { hi() { return super.hi() + \"B\"; } } \
     print B().hi();";
    assert_eq!(stdout_lines(source), vec!["AB"]);
}

#[test]
fn array_indexing_assignment_and_length() {
    let source = "var a = [10, 20, 30]; a[1] = 99; print a[0]; print a[1]; print a.length;";
    assert_eq!(stdout_lines(source), vec!["10", "99", "3"]);
}

#[test]
fn string_plus_number_coerces_the_number() {
    assert_eq!(stdout_lines(r#"print "x" + 1;"#), vec!["x1"]);
    assert_eq!(stdout_lines(r#"print 1 + "x";"#), vec!["1x"]);
}

#[test]
fn string_plus_non_number_non_string_is_a_runtime_error() {
    for source in [r#"print "x" + true;"#, r#"print "x" + nil;"#, r#"print "x" + [1];"#] {
        let output = run(source);
        assert_eq!(output.status.code(), Some(70), "expected runtime error for: {source}");
    }
}

#[test]
fn wrong_arity_is_a_runtime_error_not_a_panic() {
    let output = run("fun f(a, b) { return a + b; } f(1);");
    assert_eq!(output.status.code(), Some(70));
    assert!(String::from_utf8_lossy(&output.stderr).contains("runtime error"));
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let output = run("print undeclared;");
    assert_eq!(output.status.code(), Some(70));
}

#[test]
fn syntax_error_exits_with_data_err_and_never_runs() {
    let output = run("var = 1;");
    assert_eq!(output.status.code(), Some(65));
    assert!(output.stdout.is_empty());
}

#[test]
fn self_inheriting_class_is_a_compile_error() {
    let output = run("class A < A {}");
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn call_with_256_arguments_is_a_compile_error() {
    let args = (0..256).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
    let output = run(&format!("fun f() {{}} f({args});"));
    assert_eq!(output.status.code(), Some(65));
}

#[test]
fn self_referential_array_prints_without_crashing() {
    assert_eq!(
        stdout_lines("var a = []; a.append(a); print a;"),
        vec!["[...]"]
    );
}

#[test]
fn a_setting_after_the_file_path_is_still_honored() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "print 1;").unwrap();
    let output = Command::cargo_bin("lox")
        .unwrap()
        .arg(file.path())
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Usage"));
}
