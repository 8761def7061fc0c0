use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    mima_cli::main_entry().await
}
