fn main() {
    println!("cargo:rerun-if-changed=proto/bundle.proto");
    prost_build::compile_protos(&["proto/bundle.proto"], &["proto"])
        .expect("failed to compile proto/bundle.proto");
}
