//! Hook definitions and their short-circuit evaluation.
//!
//! Hook kinds form a closed set: adding one means adding a [`HookSpec`]
//! variant and handling it in the executor's exhaustive match.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{HookOutcome, HookPhase, HookRecord};

fn default_base() -> String {
    "main".to_string()
}

fn default_marker() -> String {
    "Approved".to_string()
}

/// A declared check or action attached to a stage or substage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookSpec {
    /// `document` (relative to the workspace) must match the `pattern` regex.
    ContentPresent {
        document: String,
        pattern: String,
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    ArtifactExists {
        path: String,
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    /// External command; any exit code other than `expect_exit` (or a timeout) fails.
    Command {
        command: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        expect_exit: i32,
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    /// At least one commit on HEAD that is not on `base` (optionally matching `pattern`).
    CommitPresent {
        #[serde(default = "default_base")]
        base: String,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    /// `- [x] <marker>` inside the named section of `document`.
    ApprovalCheckbox {
        document: String,
        section: String,
        #[serde(default = "default_marker")]
        marker: String,
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    /// Hard stop once more than `max` files in `dir` match `pattern`.
    IterationGuard {
        pattern: String,
        max: u32,
        #[serde(default)]
        dir: Option<String>,
    },
    CiStatus {
        #[serde(default)]
        on_fail_stage: Option<String>,
    },
    Rebase {
        #[serde(default = "default_base")]
        onto: String,
    },
    CreateDocument {
        path: String,
        template: String,
    },
}

impl HookSpec {
    /// Short human-readable name used in history records and error messages.
    pub fn label(&self) -> String {
        match self {
            HookSpec::ContentPresent { document, .. } => format!("content_present({document})"),
            HookSpec::ArtifactExists { path, .. } => format!("artifact_exists({path})"),
            HookSpec::Command { command, .. } => format!("command({})", command.join(" ")),
            HookSpec::CommitPresent { base, .. } => format!("commit_present({base})"),
            HookSpec::ApprovalCheckbox {
                document, section, ..
            } => format!("approval_checkbox({document}#{section})"),
            HookSpec::IterationGuard { pattern, max, .. } => {
                format!("iteration_guard({pattern} <= {max})")
            }
            HookSpec::CiStatus { .. } => "ci_status".to_string(),
            HookSpec::Rebase { onto } => format!("rebase({onto})"),
            HookSpec::CreateDocument { path, .. } => format!("create_document({path})"),
        }
    }

    /// Redirect target used when this check fails.
    pub fn on_fail_stage(&self) -> Option<&str> {
        match self {
            HookSpec::ContentPresent { on_fail_stage, .. }
            | HookSpec::ArtifactExists { on_fail_stage, .. }
            | HookSpec::Command { on_fail_stage, .. }
            | HookSpec::CommitPresent { on_fail_stage, .. }
            | HookSpec::ApprovalCheckbox { on_fail_stage, .. }
            | HookSpec::CiStatus { on_fail_stage } => on_fail_stage.as_deref(),
            HookSpec::IterationGuard { .. }
            | HookSpec::Rebase { .. }
            | HookSpec::CreateDocument { .. } => None,
        }
    }

    /// Static checks run when the registry loads.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let label = self.label();
        match self {
            HookSpec::ContentPresent { pattern, .. } | HookSpec::IterationGuard { pattern, .. } => {
                if let Err(err) = Regex::new(pattern) {
                    errors.push(format!("{label}: invalid pattern: {err}"));
                }
            }
            HookSpec::CommitPresent {
                pattern: Some(pattern),
                ..
            } => {
                if let Err(err) = Regex::new(pattern) {
                    errors.push(format!("{label}: invalid pattern: {err}"));
                }
            }
            HookSpec::Command {
                command,
                timeout_secs,
                ..
            } => {
                if command.is_empty() || command[0].trim().is_empty() {
                    errors.push(format!("{label}: command must be a non-empty array"));
                }
                if *timeout_secs == Some(0) {
                    errors.push(format!("{label}: timeout_secs must be > 0"));
                }
            }
            HookSpec::ApprovalCheckbox { section, .. } if section.trim().is_empty() => {
                errors.push(format!("{label}: section must not be empty"));
            }
            _ => {}
        }
        if let HookSpec::IterationGuard { max: 0, .. } = self {
            errors.push(format!("{label}: max must be > 0"));
        }
        errors
    }
}

/// What a single hook reported, before redirect targets are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
    /// Iteration guard exceeded; never converted into a redirect.
    Tripped { count: u32, max: u32 },
}

/// Result of running a hook list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    Pass,
    Fail { hook: String, reason: String },
    Redirect {
        hook: String,
        target: String,
        reason: String,
    },
    Tripped { hook: String, count: u32, max: u32 },
}

impl HookResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, HookResult::Pass)
    }
}

/// Aggregated result plus one record per hook that actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRun {
    pub result: HookResult,
    pub records: Vec<HookRecord>,
}

impl HookRun {
    pub fn passed() -> Self {
        Self {
            result: HookResult::Pass,
            records: Vec::new(),
        }
    }
}

/// Run `hooks` in declaration order; the first failure, redirect or trip stops the list.
pub fn evaluate<E>(
    hooks: &[HookSpec],
    phase: HookPhase,
    mut eval: impl FnMut(&HookSpec) -> Result<Verdict, E>,
) -> Result<HookRun, E> {
    let mut records = Vec::with_capacity(hooks.len());
    for hook in hooks {
        let label = hook.label();
        let verdict = eval(hook)?;
        let (outcome, detail, result) = match verdict {
            Verdict::Pass => (HookOutcome::Pass, None, None),
            Verdict::Fail(reason) => match hook.on_fail_stage() {
                Some(target) => (
                    HookOutcome::Redirect,
                    Some(format!("{reason} (redirect to {target})")),
                    Some(HookResult::Redirect {
                        hook: label.clone(),
                        target: target.to_string(),
                        reason,
                    }),
                ),
                None => (
                    HookOutcome::Fail,
                    Some(reason.clone()),
                    Some(HookResult::Fail {
                        hook: label.clone(),
                        reason,
                    }),
                ),
            },
            Verdict::Tripped { count, max } => (
                HookOutcome::Tripped,
                Some(format!("{count} iterations exceed max {max}")),
                Some(HookResult::Tripped {
                    hook: label.clone(),
                    count,
                    max,
                }),
            ),
        };
        records.push(HookRecord::new(phase, label, outcome).with_detail(detail));
        if let Some(result) = result {
            return Ok(HookRun { result, records });
        }
    }
    Ok(HookRun {
        result: HookResult::Pass,
        records,
    })
}

/// State of an approval checkbox inside a markdown section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkbox {
    Checked,
    Unchecked,
    Absent,
}

/// Find `- [x] <marker>` (or `* [ ]`) under the heading named `section`.
///
/// The section runs until the next heading of the same or a higher level.
/// Heading and marker comparisons ignore ASCII case.
pub fn checkbox_state(document: &str, section: &str, marker: &str) -> Checkbox {
    let section = section.trim();
    let marker = marker.trim().to_ascii_lowercase();
    let mut level: Option<usize> = None;

    for line in document.lines() {
        let trimmed = line.trim_start();
        if let Some((depth, title)) = heading(trimmed) {
            match level {
                Some(current) if depth <= current => break,
                Some(_) => continue,
                None if title.eq_ignore_ascii_case(section) => {
                    level = Some(depth);
                    continue;
                }
                None => continue,
            }
        }
        if level.is_none() {
            continue;
        }
        let Some(rest) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        else {
            continue;
        };
        let rest = rest.trim_start();
        let (checked, label) = if let Some(label) = rest.strip_prefix("[ ]") {
            (false, label)
        } else if let Some(label) = rest
            .strip_prefix("[x]")
            .or_else(|| rest.strip_prefix("[X]"))
        {
            (true, label)
        } else {
            continue;
        };
        if label.trim().to_ascii_lowercase().starts_with(&marker) {
            return if checked {
                Checkbox::Checked
            } else {
                Checkbox::Unchecked
            };
        }
    }
    Checkbox::Absent
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let depth = line.chars().take_while(|c| *c == '#').count();
    if depth == 0 {
        return None;
    }
    let title = line[depth..].strip_prefix(' ')?;
    Some((depth, title.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(path: &str, on_fail: Option<&str>) -> HookSpec {
        HookSpec::ArtifactExists {
            path: path.to_string(),
            on_fail_stage: on_fail.map(str::to_string),
        }
    }

    #[test]
    fn evaluate_stops_at_first_failure() {
        let hooks = vec![artifact("a", None), artifact("b", None), artifact("c", None)];
        let mut seen = Vec::new();
        let run = evaluate::<()>(&hooks, HookPhase::Exit, |hook| {
            seen.push(hook.label());
            if hook.label().contains("(b)") {
                Ok(Verdict::Fail("missing b".to_string()))
            } else {
                Ok(Verdict::Pass)
            }
        })
        .expect("evaluate");

        assert_eq!(seen.len(), 2);
        assert_eq!(run.records.len(), 2);
        assert_eq!(
            run.result,
            HookResult::Fail {
                hook: "artifact_exists(b)".to_string(),
                reason: "missing b".to_string()
            }
        );
    }

    #[test]
    fn failing_check_with_target_redirects() {
        let hooks = vec![artifact("plan.md", Some("plan"))];
        let run = evaluate::<()>(&hooks, HookPhase::Exit, |_| {
            Ok(Verdict::Fail("absent".to_string()))
        })
        .expect("evaluate");
        assert!(matches!(run.result, HookResult::Redirect { ref target, .. } if target == "plan"));
        assert_eq!(run.records[0].outcome, HookOutcome::Redirect);
    }

    #[test]
    fn tripped_guard_is_never_a_redirect() {
        let hooks = vec![HookSpec::IterationGuard {
            pattern: "^review-v\\d+\\.md$".to_string(),
            max: 2,
            dir: None,
        }];
        let run = evaluate::<()>(&hooks, HookPhase::Exit, |_| {
            Ok(Verdict::Tripped { count: 3, max: 2 })
        })
        .expect("evaluate");
        assert!(matches!(run.result, HookResult::Tripped { count: 3, max: 2, .. }));
    }

    #[test]
    fn hook_specs_parse_from_tagged_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            hooks: Vec<HookSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
hooks = [
  { kind = "command", command = ["just", "ci"], timeout_secs = 60 },
  { kind = "approval_checkbox", document = "review.md", section = "Verdict", on_fail_stage = "revise" },
  { kind = "rebase" },
]
"#,
        )
        .expect("parse");
        assert_eq!(parsed.hooks.len(), 3);
        assert_eq!(parsed.hooks[1].on_fail_stage(), Some("revise"));
        assert_eq!(
            parsed.hooks[2],
            HookSpec::Rebase {
                onto: "main".to_string()
            }
        );
    }

    #[test]
    fn validate_reports_bad_patterns_and_empty_commands() {
        let bad = HookSpec::ContentPresent {
            document: "plan.md".to_string(),
            pattern: "(".to_string(),
            on_fail_stage: None,
        };
        assert_eq!(bad.validate().len(), 1);

        let empty = HookSpec::Command {
            command: Vec::new(),
            timeout_secs: None,
            expect_exit: 0,
            on_fail_stage: None,
        };
        assert!(empty.validate()[0].contains("non-empty"));
    }

    #[test]
    fn checkbox_found_only_inside_named_section() {
        let doc = "# Review\n\n## Notes\n- [x] Approved\n\n## Verdict\n- [ ] Approved\n";
        assert_eq!(checkbox_state(doc, "Verdict", "Approved"), Checkbox::Unchecked);

        let checked = "## Verdict\n\n* [X] approved by reviewer\n## Other\n- [ ] Approved\n";
        assert_eq!(checkbox_state(checked, "verdict", "Approved"), Checkbox::Checked);
    }

    #[test]
    fn checkbox_absent_when_section_missing() {
        let doc = "## Notes\n- [x] Approved\n";
        assert_eq!(checkbox_state(doc, "Verdict", "Approved"), Checkbox::Absent);
    }

    #[test]
    fn subsection_does_not_end_the_section() {
        let doc = "## Verdict\n### Details\n- [x] Approved\n## Next\n";
        assert_eq!(checkbox_state(doc, "Verdict", "Approved"), Checkbox::Checked);
    }
}
