mod cli;
mod core;
mod interfaces;
mod logging;

#[tokio::main]
async fn main() {
    logging::init();
    match cli::run_main().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
