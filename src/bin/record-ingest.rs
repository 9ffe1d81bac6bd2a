#[tokio::main]
async fn main() -> anyhow::Result<()> {
    record_store::cli::run().await
}
