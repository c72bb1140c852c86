#[tokio::main]
async fn main() {
    if let Err(e) = redactado_lib::run().await {
        eprintln!("redactado: {e}");
        std::process::exit(1);
    }
}
