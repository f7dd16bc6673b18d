#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    mcprison_players::run().await
}
