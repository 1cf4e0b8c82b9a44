use std::{env, path::PathBuf};

fn main() {
    let target = env::var("TARGET").expect("TARGET not set");
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let kernel_dir = PathBuf::from(manifest_dir);

    // Bare-metal targets link with the kernel layout (multiboot header
    // first, image bounds exported); host builds (unit tests) use the
    // platform defaults.
    if target.contains("-none") {
        let linker_script = kernel_dir.join("src/arch/x86_64/link.ld");
        println!("cargo:rustc-link-arg=-T{}", linker_script.display());
    }

    println!("cargo:rerun-if-changed=src/arch/x86_64/link.ld");
}
