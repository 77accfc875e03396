fn main() {
    prost_build::compile_protos(&["proto/bitswap.proto"], &["proto/"])
        .expect("failed to compile bitswap.proto");
}
