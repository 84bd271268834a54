fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Client only: the NAT plugin service lives in the control plane.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/nat.proto"], &["proto"])?;
    Ok(())
}
