use std::env;

/// Default DeepStream install location.
const DEEPSTREAM_LIB_DIR: &str = "/opt/nvidia/deepstream/deepstream/lib";

fn main() {
    println!("cargo:rerun-if-env-changed=DEEPSTREAM_LIB_DIR");

    // The metadata libraries live outside the system library path
    if env::var_os("CARGO_FEATURE_DEEPSTREAM").is_some() {
        let dir = env::var("DEEPSTREAM_LIB_DIR").unwrap_or_else(|_| DEEPSTREAM_LIB_DIR.to_string());
        println!("cargo:rustc-link-search=native={}", dir);
    }
}
