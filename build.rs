fn main() {
    // Exposes package metadata (version, target) to the model metadata writer
    built::write_built_file().expect("Failed to generate build info");
}
