// Regenerates proto/mr.rs, the checked-in wire schema shared by the
// coordinator service and the worker gateway.
fn main() {
    let proto_files = &["proto/mr.proto"];
    tonic_build::configure()
        .out_dir("proto")
        .build_client(true)
        .build_server(true)
        .compile(proto_files, &["proto"])
        .unwrap_or_else(|e| panic!("protobuf compilation failed: {}", e));

    for file in proto_files {
        println!("cargo:rerun-if-changed={}", file);
    }
}
