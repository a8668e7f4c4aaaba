#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = gradebench::run().await {
        eprintln!("gradebench fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
