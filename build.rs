use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    // Only bare-metal builds link with memory.x; host builds run the unit tests
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
        fs::copy("memory.x", out_dir.join("memory.x")).unwrap();
        println!("cargo:rustc-link-search={}", out_dir.display());
    }
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");
}
