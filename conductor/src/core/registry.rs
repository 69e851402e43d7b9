//! Stage and flow registry.
//!
//! Loaded once per process and immutable afterwards. [`Registry::new`]
//! rejects configurations where a flow names an undefined stage, does not
//! end in a terminal stage, or redirects somewhere its items could never
//! leave.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hooks::HookSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid stage/flow configuration:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
    #[error("unknown stage '{0}'")]
    UnknownStage(String),
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),
    #[error("stage '{stage}' is not part of flow '{flow}'")]
    NotInFlow { flow: String, stage: String },
}

/// Hook lists shared by stages and substages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookLists {
    pub pre_start: Vec<HookSpec>,
    pub post_start: Vec<HookSpec>,
    pub pre_completion: Vec<HookSpec>,
    pub post_completion: Vec<HookSpec>,
}

impl HookLists {
    /// Hooks run when leaving: completion checks, then completion actions.
    pub fn exit(&self) -> impl Iterator<Item = &HookSpec> {
        self.pre_completion.iter().chain(&self.post_completion)
    }

    /// Hooks run after arriving: start checks, then start actions.
    pub fn entry(&self) -> impl Iterator<Item = &HookSpec> {
        self.pre_start.iter().chain(&self.post_start)
    }

    fn all(&self) -> impl Iterator<Item = &HookSpec> {
        self.exit().chain(self.entry())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstageDefinition {
    pub name: String,
    #[serde(flatten)]
    pub hooks: HookLists,
}

/// Sessions and environment a work item needs while it sits in an active stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSpec {
    pub roles: Vec<String>,
    /// Run sessions inside an isolated environment instead of on the controller host.
    pub isolated: bool,
    pub image: Option<String>,
    pub ports: Vec<u16>,
    pub mounts: Vec<String>,
    /// Command each session starts with.
    pub command: Vec<String>,
    /// Run inside the environment (or on the host when not isolated) before teardown.
    pub pre_teardown: Vec<Vec<String>>,
    /// Run on the host after the environment is gone.
    pub post_teardown: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDefinition {
    #[serde(skip)]
    pub name: String,
    pub substages: Vec<SubstageDefinition>,
    /// Entering this stage needs an explicit approval signal.
    pub human_review: bool,
    pub terminal: bool,
    /// The controller advances items here without waiting for an agent.
    pub auto_advance: bool,
    /// Artifact that must exist in the workspace before the stage can be left.
    pub output: Option<String>,
    #[serde(flatten)]
    pub hooks: HookLists,
    pub runtime: Option<RuntimeSpec>,
}

impl StageDefinition {
    pub fn first_substage(&self) -> Option<&str> {
        self.substages.first().map(|sub| sub.name.as_str())
    }

    pub fn substage(&self, name: &str) -> Option<&SubstageDefinition> {
        self.substages.iter().find(|sub| sub.name == name)
    }

    /// Substage following `name`, or `None` if `name` is the last one.
    pub fn next_substage(&self, name: &str) -> Option<&SubstageDefinition> {
        let index = self.substages.iter().position(|sub| sub.name == name)?;
        self.substages.get(index + 1)
    }

    /// Checks run when leaving the stage: the declared `output` artifact first,
    /// then the declared exit lists.
    pub fn exit_hooks(&self) -> Vec<HookSpec> {
        let mut hooks = Vec::new();
        if let Some(output) = &self.output {
            hooks.push(HookSpec::ArtifactExists {
                path: output.clone(),
                on_fail_stage: None,
            });
        }
        hooks.extend(self.hooks.exit().cloned());
        hooks
    }

    pub fn entry_hooks(&self) -> Vec<HookSpec> {
        self.hooks.entry().cloned().collect()
    }

    /// A stage is active when it declares at least one session role.
    pub fn is_active(&self) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|runtime| !runtime.roles.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(skip)]
    pub name: String,
    pub stages: Vec<String>,
}

impl FlowDefinition {
    pub fn first_stage(&self) -> Option<&str> {
        self.stages.first().map(String::as_str)
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|name| name == stage)
    }
}

/// On-disk shape of `flows.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistryFile {
    pub stages: BTreeMap<String, StageDefinition>,
    pub flows: BTreeMap<String, FlowDefinition>,
}

/// Successor lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStage<'a> {
    Stage(&'a StageDefinition),
    Terminal,
}

#[derive(Debug, Clone)]
pub struct Registry {
    stages: BTreeMap<String, StageDefinition>,
    flows: BTreeMap<String, FlowDefinition>,
}

impl Registry {
    pub fn new(file: RegistryFile) -> Result<Self, RegistryError> {
        let stages = file
            .stages
            .into_iter()
            .map(|(name, mut stage)| {
                stage.name = name.clone();
                (name, stage)
            })
            .collect();
        let flows = file
            .flows
            .into_iter()
            .map(|(name, mut flow)| {
                flow.name = name.clone();
                (name, flow)
            })
            .collect();
        let registry = Self { stages, flows };
        let errors = registry.validate();
        if !errors.is_empty() {
            return Err(RegistryError::Invalid(errors));
        }
        Ok(registry)
    }

    pub fn stage(&self, name: &str) -> Result<&StageDefinition, RegistryError> {
        self.stages
            .get(name)
            .ok_or_else(|| RegistryError::UnknownStage(name.to_string()))
    }

    pub fn flow(&self, name: &str) -> Result<&FlowDefinition, RegistryError> {
        self.flows
            .get(name)
            .ok_or_else(|| RegistryError::UnknownFlow(name.to_string()))
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.values()
    }

    pub fn is_terminal(&self, stage: &str) -> bool {
        self.stages.get(stage).is_some_and(|def| def.terminal)
    }

    /// Successor of `current` in `flow`.
    pub fn next_stage(&self, flow: &str, current: &str) -> Result<NextStage<'_>, RegistryError> {
        let stage = self.stage(current)?;
        if stage.terminal {
            return Ok(NextStage::Terminal);
        }
        let flow_def = self.flow(flow)?;
        let index = flow_def
            .stages
            .iter()
            .position(|name| name == current)
            .ok_or_else(|| RegistryError::NotInFlow {
                flow: flow.to_string(),
                stage: current.to_string(),
            })?;
        match flow_def.stages.get(index + 1) {
            Some(next) => Ok(NextStage::Stage(self.stage(next)?)),
            None => Ok(NextStage::Terminal),
        }
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.flows.is_empty() {
            errors.push("no flows defined".to_string());
        }

        for flow in self.flows.values() {
            self.validate_flow(flow, &mut errors);
        }

        for stage in self.stages.values() {
            self.validate_stage(stage, &mut errors);
        }
        errors
    }

    fn validate_flow(&self, flow: &FlowDefinition, errors: &mut Vec<String>) {
        if flow.stages.is_empty() {
            errors.push(format!("flow '{}': no stages", flow.name));
            return;
        }
        let mut seen = HashSet::new();
        let last = flow.stages.len() - 1;
        for (index, name) in flow.stages.iter().enumerate() {
            if !seen.insert(name.as_str()) {
                errors.push(format!("flow '{}': stage '{}' listed twice", flow.name, name));
            }
            let Some(stage) = self.stages.get(name) else {
                errors.push(format!(
                    "flow '{}': references undefined stage '{}'",
                    flow.name, name
                ));
                continue;
            };
            if index == last && !stage.terminal {
                errors.push(format!(
                    "flow '{}': last stage '{}' must be terminal",
                    flow.name, name
                ));
            }
            if index != last && stage.terminal {
                errors.push(format!(
                    "flow '{}': terminal stage '{}' must be last",
                    flow.name, name
                ));
            }
        }
    }

    fn validate_stage(&self, stage: &StageDefinition, errors: &mut Vec<String>) {
        let name = &stage.name;
        let mut substages = HashSet::new();
        for sub in &stage.substages {
            if sub.name.trim().is_empty() {
                errors.push(format!("stage '{name}': substage with empty name"));
            }
            if !substages.insert(sub.name.as_str()) {
                errors.push(format!("stage '{name}': substage '{}' listed twice", sub.name));
            }
        }

        if stage.terminal && (stage.is_active() || !stage.substages.is_empty()) {
            errors.push(format!(
                "stage '{name}': terminal stages cannot declare substages or sessions"
            ));
        }

        if let Some(runtime) = &stage.runtime {
            let mut roles = HashSet::new();
            for role in &runtime.roles {
                if role.trim().is_empty() || !roles.insert(role.as_str()) {
                    errors.push(format!("stage '{name}': empty or duplicate role '{role}'"));
                }
            }
            if stage.is_active() && runtime.command.is_empty() {
                errors.push(format!("stage '{name}': runtime.command must not be empty"));
            }
        }

        let hooks = stage
            .hooks
            .all()
            .chain(stage.substages.iter().flat_map(|sub| sub.hooks.all()));
        for hook in hooks {
            for error in hook.validate() {
                errors.push(format!("stage '{name}': {error}"));
            }
            if let Some(target) = hook.on_fail_stage() {
                self.validate_redirect(stage, target, errors);
            }
        }
    }

    fn validate_redirect(&self, stage: &StageDefinition, target: &str, errors: &mut Vec<String>) {
        let Some(target_def) = self.stages.get(target) else {
            errors.push(format!(
                "stage '{}': redirect target '{}' is undefined",
                stage.name, target
            ));
            return;
        };
        if target_def.terminal {
            return;
        }
        for flow in self.flows.values() {
            if flow.contains(&stage.name) && !flow.contains(target) {
                errors.push(format!(
                    "stage '{}': redirect target '{}' has no terminal successor in flow '{}'",
                    stage.name, target, flow.name
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Registry, RegistryError> {
        let file: RegistryFile = toml::from_str(raw).expect("toml");
        Registry::new(file)
    }

    const BASIC: &str = r#"
[stages.backlog]
[stages.plan]
[stages.implement]
substages = [{ name = "setup" }, { name = "build" }]
[stages.accepted]
terminal = true

[flows.default]
stages = ["backlog", "plan", "implement", "accepted"]
"#;

    #[test]
    fn next_stage_follows_flow_order() {
        let registry = parse(BASIC).expect("registry");
        match registry.next_stage("default", "plan").expect("next") {
            NextStage::Stage(stage) => assert_eq!(stage.name, "implement"),
            NextStage::Terminal => panic!("expected a stage"),
        }
        assert_eq!(
            registry.next_stage("default", "accepted").expect("next"),
            NextStage::Terminal
        );
        assert_eq!(
            registry.stage("implement").expect("stage").first_substage(),
            Some("setup")
        );
    }

    #[test]
    fn undefined_stage_fails_at_load() {
        let err = parse(
            r#"
[stages.done]
terminal = true
[flows.default]
stages = ["ghost", "done"]
"#,
        )
        .expect_err("invalid");
        assert!(err.to_string().contains("undefined stage 'ghost'"));
    }

    #[test]
    fn flow_without_terminal_end_fails_at_load() {
        let err = parse(
            r#"
[stages.plan]
[stages.build]
[flows.default]
stages = ["plan", "build"]
"#,
        )
        .expect_err("invalid");
        assert!(err.to_string().contains("must be terminal"));
    }

    #[test]
    fn redirect_outside_flow_fails_at_load() {
        let err = parse(
            r#"
[stages.plan]
pre_completion = [{ kind = "artifact_exists", path = "plan.md", on_fail_stage = "limbo" }]
[stages.limbo]
[stages.done]
terminal = true
[flows.default]
stages = ["plan", "done"]
"#,
        )
        .expect_err("invalid");
        assert!(err.to_string().contains("no terminal successor"));
    }

    #[test]
    fn redirect_to_terminal_stage_outside_flow_is_allowed() {
        parse(
            r#"
[stages.review]
pre_completion = [{ kind = "ci_status", on_fail_stage = "rejected" }]
[stages.accepted]
terminal = true
[stages.rejected]
terminal = true
[flows.default]
stages = ["review", "accepted"]
"#,
        )
        .expect("valid");
    }

    #[test]
    fn substage_helpers_walk_in_order() {
        let registry = parse(BASIC).expect("registry");
        let implement = registry.stage("implement").expect("stage");
        assert_eq!(
            implement.next_substage("setup").map(|sub| sub.name.as_str()),
            Some("build")
        );
        assert!(implement.next_substage("build").is_none());
    }

    #[test]
    fn stage_outside_flow_has_no_successor() {
        let registry = parse(BASIC).expect("registry");
        let mut file = RegistryFile::default();
        file.stages = registry.stages.clone();
        file.flows.insert(
            "short".to_string(),
            FlowDefinition {
                name: String::new(),
                stages: vec!["plan".to_string(), "accepted".to_string()],
            },
        );
        let registry = Registry::new(file).expect("registry");
        assert_eq!(
            registry.next_stage("short", "implement"),
            Err(RegistryError::NotInFlow {
                flow: "short".to_string(),
                stage: "implement".to_string()
            })
        );
    }
}
