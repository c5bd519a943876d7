//! Compiles the control-plane proto definition with tonic-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the vendored protoc so builds do not require a
    // system-wide protobuf install.
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/control.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/control.proto");
    Ok(())
}
