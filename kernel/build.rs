//! Build script for the kernel binary: wires up the linker script.

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let workspace_root = std::path::Path::new(&manifest_dir).parent().unwrap();

    let target = std::env::var("TARGET").unwrap_or_default();
    if !target.starts_with("x86_64") {
        return; // native target (e.g. host tests), no custom linker script
    }

    let script_path = workspace_root.join("targets").join("x86_64-unknown-ferrite.ld");
    println!("cargo:rustc-link-arg-bins=-T{}", script_path.display());
    println!("cargo:rerun-if-changed={}", script_path.display());
}
