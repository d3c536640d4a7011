use peerlink::cli::initialize_from_arguments;

/// Runs the demo with the settings given on the command line
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Peerlink v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await?;
    println!("Done");
    Ok(())
}
