//! Thin CLI wrappers over the HTTP endpoint.
//!
//! The wrapper posts a streaming chat request, prints each delta line, and
//! maps the terminal outcome to the documented exit codes: 0 success,
//! 1 validation error, 2 pipeline failure, 3 decommission failure.

use anyhow::Result;
use console::style;
use tokio_stream::StreamExt;

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn server_base(args: &[String]) -> String {
    flag_value(args, "--server").unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
}

pub async fn deploy_local(args: &[String]) -> Result<i32> {
    let Some(app_name) = flag_value(args, "--app-name") else {
        eprintln!("{}", style("--app-name is required").red());
        return Ok(1);
    };
    let Some(repo_url) = flag_value(args, "--repo-url") else {
        eprintln!("{}", style("--repo-url is required").red());
        return Ok(1);
    };

    let body = serde_json::json!({
        "model": "on-demand-infra",
        "stream": true,
        "messages": [{"role": "user", "content": format!("deploy {} locally", app_name)}],
        "action": "deploy",
        "deployment_mode": "local",
        "github_repo_url": repo_url,
        "instance_name": app_name,
        "target_namespace": flag_value(args, "--namespace").unwrap_or_else(|| "default".to_string()),
        "replicas": flag_value(args, "--replicas").and_then(|r| r.parse::<u32>().ok()).unwrap_or(1),
    });
    run_streaming_request(&server_base(args), body).await
}

pub async fn deploy_cloud_hosted(args: &[String]) -> Result<i32> {
    let Some(app_name) = flag_value(args, "--app-name") else {
        eprintln!("{}", style("--app-name is required").red());
        return Ok(1);
    };
    let Some(repo_url) = flag_value(args, "--repo-url") else {
        eprintln!("{}", style("--repo-url is required").red());
        return Ok(1);
    };

    let mut body = serde_json::json!({
        "model": "on-demand-infra",
        "stream": true,
        "messages": [{"role": "user", "content": format!("deploy {} to the hosted cluster", app_name)}],
        "action": "deploy",
        "deployment_mode": "cloud-hosted",
        "github_repo_url": repo_url,
        "instance_name": app_name,
        "target_namespace": flag_value(args, "--namespace").unwrap_or_else(|| "default".to_string()),
        "replicas": flag_value(args, "--replicas").and_then(|r| r.parse::<u32>().ok()).unwrap_or(1),
    });
    if let Some(cluster) = flag_value(args, "--cluster-name") {
        body["instance_name"] = serde_json::Value::String(cluster);
    }
    if let (Some(zone), Some(label)) = (
        flag_value(args, "--zone-id"),
        flag_value(args, "--subdomain"),
    ) {
        body["base_hosted_zone_id"] = serde_json::Value::String(zone);
        body["app_subdomain_label"] = serde_json::Value::String(label);
    }
    run_streaming_request(&server_base(args), body).await
}

/// Stream the chat completion, echoing progress lines, and derive the exit
/// code from the terminal delta.
async fn run_streaming_request(server: &str, body: serde_json::Value) -> Result<i32> {
    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/v1/chat/completions", server))
        .json(&body)
        .send()
        .await?;

    if res.status() == reqwest::StatusCode::BAD_REQUEST {
        let detail = res.text().await.unwrap_or_default();
        eprintln!("{} {}", style("request rejected:").red().bold(), detail);
        return Ok(1);
    }
    if !res.status().is_success() {
        eprintln!("{} {}", style("server error:").red().bold(), res.status());
        return Ok(2);
    }

    let mut exit_code = 2;
    let mut buffer = String::new();
    let stream = res.bytes_stream();
    tokio::pin!(stream);
    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };
            let choice = &parsed["choices"][0];
            if let Some(content) = choice["delta"]["content"].as_str() {
                match choice["finish_reason"].as_str() {
                    Some("stop") => {
                        exit_code = terminal_exit_code(content);
                        println!("{}", content);
                    }
                    Some("error") => {
                        exit_code = 1;
                        eprintln!("{} {}", style("rejected:").red().bold(), content);
                    }
                    _ => print!("{}", content),
                }
            }
        }
    }
    Ok(exit_code)
}

fn terminal_exit_code(payload: &str) -> i32 {
    let Ok(outcome) = serde_json::from_str::<serde_json::Value>(payload) else {
        return 2;
    };
    match outcome["status"].as_str() {
        Some("succeeded") | Some("decommissioned") => 0,
        _ => {
            if outcome["error"]["kind"].as_str() == Some("DecommissionError") {
                3
            } else {
                2
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_exit_codes_follow_the_contract() {
        assert_eq!(terminal_exit_code(r#"{"status":"succeeded"}"#), 0);
        assert_eq!(terminal_exit_code(r#"{"status":"decommissioned"}"#), 0);
        assert_eq!(
            terminal_exit_code(
                r#"{"status":"failed","error":{"kind":"SubprocessExitError","message":"x"}}"#
            ),
            2
        );
        assert_eq!(
            terminal_exit_code(
                r#"{"status":"failed","error":{"kind":"DecommissionError","message":"x"}}"#
            ),
            3
        );
        assert_eq!(terminal_exit_code("not json"), 2);
    }

    #[test]
    fn flag_values_are_positional_pairs() {
        let args: Vec<String> = ["--app-name", "web", "--replicas", "3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(flag_value(&args, "--app-name").as_deref(), Some("web"));
        assert_eq!(flag_value(&args, "--replicas").as_deref(), Some("3"));
        assert!(flag_value(&args, "--missing").is_none());
    }
}
