fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The server half is only used by the in-process fake in tests
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../../proto/user.proto"], &["../../proto"])?;
    Ok(())
}
