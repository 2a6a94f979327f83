fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    tonic_prost_build::configure()
        // Suppress unused_results lint in generated code (tonic inserts values into extensions/headers)
        .server_mod_attribute(".", "#[allow(unused_results)]")
        .client_mod_attribute(".", "#[allow(unused_results)]")
        .compile_protos(&["proto/jes.proto"], &["proto"])?;
    Ok(())
}
