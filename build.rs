fn main() {
    if !(cfg!(target_os = "linux") && cfg!(target_arch = "x86_64") && cfg!(target_env = "gnu")) {
        panic!(
            "{} only works with linux using glibc on x86_64",
            env!("CARGO_PKG_NAME")
        );
    }

    // notification functions must stay visible to an external debugger
    println!("cargo:rustc-link-arg-cdylib=-Wl,--export-dynamic");
    println!("cargo:rustc-link-arg-tests=-Wl,--export-dynamic");
}
