fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Gather build-time info, including git details where available.
    built::write_built_file().expect("Failed to acquire build-time information");
}
