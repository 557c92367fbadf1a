fn main() {
    // Stamp the binary so `--version` output identifies which build touched a store
    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rerun-if-changed=build.rs");

    // Enables static linking of the vcruntime library on Windows builds
    static_vcruntime::metabuild();
}
