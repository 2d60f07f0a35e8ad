#[tokio::main]
async fn main() {
    grocer::start_server().await;
}
