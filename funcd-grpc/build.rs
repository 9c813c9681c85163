fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fds = protox::compile(["proto/runner.proto"], ["proto"])?;
    let bytes = protox::prost::Message::encode_to_vec(&fds);
    let fds = <tonic_build::FileDescriptorSet as prost::Message>::decode(bytes.as_slice())?;
    tonic_build::configure().compile_fds(fds)?;
    Ok(())
}
