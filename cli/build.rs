//! Build script for the rehook binary
//!
//! Exports the binary's own symbols so `rehook resolve rehook <name>` can find
//! the self-test fixtures through the main executable's dynamic symbol table.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os == "linux" {
        println!("cargo:rustc-link-arg-bins=-rdynamic");
    }
}
