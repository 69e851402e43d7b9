//! Deterministic session/environment identities and the environment contract.

use anyhow::{Result, anyhow};

/// Marker set in every managed environment and session.
pub const ENV_MANAGED: &str = "CONDUCTOR_MANAGED";
pub const ENV_ITEM_ID: &str = "CONDUCTOR_ITEM_ID";
pub const ENV_ROLE: &str = "CONDUCTOR_ROLE";

/// Role used to name the environment that owns an item's sessions.
pub const ENVIRONMENT_ROLE: &str = "env";

/// Resolve a `{project}-{role}-{id}` style template.
///
/// Characters that tmux and container runtimes reject in names are replaced
/// with `-`, so every process resolves the same identity for the same input.
pub fn render_name(template: &str, project: &str, role: &str, id: &str) -> String {
    let raw = template
        .replace("{project}", project)
        .replace("{role}", role)
        .replace("{id}", id);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// A naming template must distinguish both items and roles.
pub fn validate_template(template: &str) -> Result<()> {
    for placeholder in ["{id}", "{role}"] {
        if !template.contains(placeholder) {
            return Err(anyhow!(
                "naming template '{template}' must contain {placeholder}"
            ));
        }
    }
    Ok(())
}

/// Substitute `{id}` in a path template such as `worktrees/{id}`.
pub fn render_path(template: &str, id: &str) -> String {
    template.replace("{id}", id)
}

/// The three variables every agent process may rely on.
pub fn managed_env(id: &str, role: &str) -> Vec<(String, String)> {
    vec![
        (ENV_MANAGED.to_string(), "1".to_string()),
        (ENV_ITEM_ID.to_string(), id.to_string()),
        (ENV_ROLE.to_string(), role.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic_and_sanitized() {
        let a = render_name("{project}-{role}-{id}", "acme", "coder", "42");
        let b = render_name("{project}-{role}-{id}", "acme", "coder", "42");
        assert_eq!(a, "acme-coder-42");
        assert_eq!(a, b);
        assert_eq!(
            render_name("{project}-{role}-{id}", "my.app", "env", "a:b"),
            "my-app-env-a-b"
        );
    }

    #[test]
    fn template_without_role_is_rejected() {
        assert!(validate_template("{project}-{id}").is_err());
        assert!(validate_template("{project}-{role}-{id}").is_ok());
    }

    #[test]
    fn managed_env_carries_the_contract() {
        let env = managed_env("7", "reviewer");
        assert_eq!(env[0], (ENV_MANAGED.to_string(), "1".to_string()));
        assert_eq!(env[1].1, "7");
        assert_eq!(env[2].1, "reviewer");
    }
}
