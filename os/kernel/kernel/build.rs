use kernel_info::memory;
use std::{env, path::PathBuf};

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let ld = manifest_dir.join("kernel.ld");

    let klink_offset = memory::KLINK_OFFSET;
    let kernlink_pa = memory::KERNLINK_PA;
    assert_eq!(
        klink_offset & ((1u64 << 21) - 1),
        0,
        "KLINK_OFFSET must be 2 MiB aligned (got {klink_offset:#x})"
    );
    assert_eq!(
        kernlink_pa & 0xfff,
        0,
        "KERNLINK_PA must be 4 KiB aligned (got {kernlink_pa:#x})"
    );
    assert!(
        kernlink_pa < memory::EARLY_MAP_END,
        "the image must sit inside the boot stub's first gigabyte"
    );

    println!("cargo:rerun-if-changed={}", ld.display());

    // Host builds produce a stub binary for tests; only the bare-metal
    // target gets the real layout.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("none") {
        return;
    }

    println!("cargo:rustc-link-arg-bins=-T{}", ld.display());
    // The 32-bit boot stub uses absolute addresses.
    println!("cargo:rustc-link-arg-bins=--no-pie");
    println!("cargo:rustc-link-arg-bins=--defsym=KLINK_OFFSET={klink_offset:#x}");
    println!("cargo:rustc-link-arg-bins=--defsym=KERNLINK_PA={kernlink_pa:#x}");
}
