mod deploy;

use anyhow::Result;
use console::style;

use crate::core::config::OrchestratorConfig;
use crate::interfaces::web::ApiServer;

fn print_help() {
    println!("\n {}\n", style("on-demand-infra").green().bold());
    println!(" {}", style("Server").bold());
    println!("   serve                 Start the chat-driven deployment API");
    println!("     --api-host <host>   Bind address (default 127.0.0.1)");
    println!("     --api-port <port>   Bind port (default 8080)");
    println!();
    println!(" {}", style("Deploy (wrappers over the HTTP API)").bold());
    println!(
        "   deploy-local          --app-name <n> --repo-url <url> [--namespace <ns>] [--replicas <n>]"
    );
    println!("   deploy-cloud-hosted   --app-name <n> --repo-url <url> [--cluster-name <n>]");
    println!("                         [--zone-id <Z..> --subdomain <label>]");
    println!();
    println!(
        " {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("on-demand-infra").green()
    );
    println!(
        " Exit codes: 0 success, 1 validation error, 2 pipeline failure, 3 decommission failure\n"
    );
}

fn serve_config(args: &[String]) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_env();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if let Some(port) = args.get(i + 1).and_then(|p| p.parse().ok()) {
                    config.api_port = port;
                }
                i += 2;
            }
            "--api-host" => {
                if let Some(host) = args.get(i + 1) {
                    config.api_host = host.clone();
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    config
}

pub async fn run_main() -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("serve");
    let rest: &[String] = if args.len() > 2 { &args[2..] } else { &[] };

    match command {
        "serve" => {
            ApiServer::new(serve_config(rest)).serve().await?;
            Ok(0)
        }
        "deploy-local" => deploy::deploy_local(rest).await,
        "deploy-cloud-hosted" => deploy::deploy_cloud_hosted(rest).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(0)
        }
        other => {
            eprintln!(
                "{} unknown command '{}'",
                style("error:").red().bold(),
                other
            );
            print_help();
            Ok(1)
        }
    }
}
