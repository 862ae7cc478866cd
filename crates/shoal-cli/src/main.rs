mod cli;

use clap::Parser;
use shoal::ClusterError;

fn exit_code(err: &ClusterError) -> i32 {
    match err {
        ClusterError::NotReady => 2,
        ClusterError::PermissionDenied { .. } => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = cli::Cli::parse();
    if let Err(err) = cli.run().await {
        eprintln!("error: {err}");
        std::process::exit(exit_code(&err));
    }
}
