//! Loading `.conductor/flows.toml` into a validated [`Registry`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::registry::{Registry, RegistryFile};

/// Parse and validate the stage/flow configuration. Any invalid flow fails the load.
pub fn load_registry(path: &Path) -> Result<Registry> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_registry(&contents).with_context(|| format!("load {}", path.display()))
}

pub fn parse_registry(contents: &str) -> Result<Registry> {
    let file: RegistryFile = toml::from_str(contents).context("parse flows toml")?;
    let registry = Registry::new(file)?;
    debug!(stages = registry.stages().count(), "registry loaded");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_lists_parse_from_toml_tables() {
        let registry = parse_registry(
            r#"
[stages.review]
[[stages.review.pre_completion]]
kind = "approval_checkbox"
document = "review.md"
section = "Verdict"
on_fail_stage = "revise"

[stages.revise]
[stages.done]
terminal = true

[flows.default]
stages = ["review", "revise", "done"]
"#,
        )
        .expect("parse");
        let review = registry.stage("review").expect("stage");
        assert_eq!(review.hooks.pre_completion.len(), 1);
        assert_eq!(review.hooks.pre_completion[0].on_fail_stage(), Some("revise"));
    }

    #[test]
    fn unknown_stage_in_flow_fails_fast() {
        let err = parse_registry(
            r#"
[stages.done]
terminal = true

[flows.default]
stages = ["plan", "done"]
"#,
        )
        .expect_err("invalid");
        assert!(format!("{err:#}").contains("plan"));
    }
}
