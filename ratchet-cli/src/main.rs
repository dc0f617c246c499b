#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ratchet_cli::run_app().await
}
