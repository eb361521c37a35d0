fn main() {
    println!("cargo:rerun-if-changed=proto/periscope.proto");
    println!("cargo:rerun-if-changed=proto");

    // protox compiles the schema in-process, so builds do not depend on a
    // protoc binary being installed.
    let fds = protox::compile(["proto/periscope.proto"], ["proto"])
        .unwrap_or_else(|e| panic!("failed to compile protos: {e}"));

    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile_fds(fds)
        .unwrap_or_else(|e| panic!("failed to generate gRPC stubs: {e}"));
}
