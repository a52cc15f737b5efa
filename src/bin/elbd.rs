fn main() -> anyhow::Result<()> {
    elbd_cmd::cmd::run()?;
    Ok(())
}
