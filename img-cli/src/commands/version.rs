pub fn execute() -> anyhow::Result<()> {
    println!("img {}", env!("CARGO_PKG_VERSION"));
    println!("runtime: {}", img_shared::constants::runtime::DEFAULT_BINARY);
    Ok(())
}
