fn main() {
    prost_build::compile_protos(&["proto/telecast.proto"], &["proto/"])
        .expect("failed to compile telecast.proto");
}
