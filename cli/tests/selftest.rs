use std::process::Command;

fn rehook() -> Command {
    Command::new(env!("CARGO_BIN_EXE_rehook"))
}

#[cfg(all(any(target_os = "linux", target_os = "macos"), any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn selftest_round_trip_passes() {
    let output = rehook().arg("selftest").output().expect("run rehook");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("selftest passed"));
}

#[cfg(target_os = "linux")]
#[test]
fn resolve_reports_module_relative_offset() {
    let output = rehook().args(["resolve", "libc.so.6", "0x0"]).output().expect("run rehook");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("(libc.so.6+0x0)"));
}

#[cfg(target_os = "linux")]
#[test]
fn resolve_finds_exports_of_the_main_executable() {
    let output = rehook().args(["resolve", "rehook", "rehook_fixture_answer"]).output().expect("run rehook");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("(rehook+0x"), "stdout: {stdout}");
    assert!(!stdout.starts_with("0x0 "));
}

#[test]
fn unknown_module_is_an_error() {
    let output = rehook()
        .args(["resolve", "librehook-missing.so", "main"])
        .env("REHOOK_NO_LOAD", "1")
        .output()
        .expect("run rehook");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("module not found"));
}
