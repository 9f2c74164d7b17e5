#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fcached::run_cli().await
}
