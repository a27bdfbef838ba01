use pgcatalog_migrator::core::{CoreApp, ExitStatus};

#[tokio::main]
async fn main() {
    let status = match CoreApp::run().await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("\nError: {:#}\n", e);
            ExitStatus::from_error(&e)
        }
    };
    std::process::exit(status.code());
}
