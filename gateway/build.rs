fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::configure()
        .build_client(false)
        .build_server(true)
        .compile(&["../proto/capture.proto"], &["../proto"])?;
    println!("cargo:rerun-if-changed=../proto/capture.proto");
    Ok(())
}
