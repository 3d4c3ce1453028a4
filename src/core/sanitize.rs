//! Input sanitizers for values that end up inside templates or subprocess
//! argument lists. Rejecting is always safer than escaping here.

use tracing::warn;

fn validate(input: &str, pattern: &str, max_length: usize, context: &str) -> Option<String> {
    if input.is_empty() {
        return Some(String::new());
    }

    if input.len() > max_length {
        warn!(
            "Input validation failed in {}: value exceeds max length {}",
            context, max_length
        );
        return None;
    }

    let re = regex::Regex::new(pattern).unwrap();
    if !re.is_match(input) {
        warn!(
            "Input validation failed in {}: value contains invalid characters",
            context
        );
        return None;
    }

    Some(input.to_string())
}

/// Terraform identifiers: alphanumeric plus hyphen, underscore and dot.
pub fn sanitize_terraform_input(input: &str) -> Option<String> {
    validate(input, r"^[a-zA-Z0-9_.\-]+$", 64, "terraform")
}

/// Kubernetes object names (RFC 1123 labels, dot-separated).
pub fn sanitize_kubernetes_name(input: &str) -> Option<String> {
    validate(
        input,
        r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$",
        63,
        "kubernetes",
    )
}

/// Shell argument safety net for values interpolated into remote commands.
pub fn sanitize_shell_input(input: &str) -> Option<String> {
    validate(input, r"^[a-zA-Z0-9_.\-/:= ]+$", 256, "shell")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terraform_accepts_identifier_characters() {
        assert_eq!(
            sanitize_terraform_input("my-cluster_v1.2").as_deref(),
            Some("my-cluster_v1.2")
        );
    }

    #[test]
    fn terraform_rejects_interpolation() {
        assert!(sanitize_terraform_input("${var.evil}").is_none());
        assert!(sanitize_terraform_input("a; rm -rf /").is_none());
    }

    #[test]
    fn kubernetes_enforces_rfc1123() {
        assert!(sanitize_kubernetes_name("my-app").is_some());
        assert!(sanitize_kubernetes_name("My-App").is_none());
        assert!(sanitize_kubernetes_name("-leading").is_none());
        assert!(sanitize_kubernetes_name("trailing-").is_none());
    }

    #[test]
    fn kubernetes_enforces_length() {
        let long = "a".repeat(64);
        assert!(sanitize_kubernetes_name(&long).is_none());
        let ok = "a".repeat(63);
        assert!(sanitize_kubernetes_name(&ok).is_some());
    }

    #[test]
    fn shell_rejects_metacharacters() {
        assert!(sanitize_shell_input("docker build -t app:v1 .").is_some());
        assert!(sanitize_shell_input("true && curl evil").is_none());
        assert!(sanitize_shell_input("$(whoami)").is_none());
    }
}
