fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/osmo.proto");
    println!("cargo:rerun-if-changed=migrations");

    // Services are used from both sides: the central service serves them and
    // backend operators / task controllers connect as clients.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[allow(clippy::large_enum_variant)]")
        .compile_protos(&["proto/osmo.proto"], &["proto"])?;

    Ok(())
}
