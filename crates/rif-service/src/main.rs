#[tokio::main]
async fn main() {
    rif_service::start(std::env::args()).await;
}
