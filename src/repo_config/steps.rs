//! Typed workflow steps and stages.
//!
//! Steps are parsed from YAML into a closed enum at load time, so an
//! unknown step name fails the config rather than a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::errors::ConfigError;

/// Arguments accepted by the built-in Terraform steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepArgs {
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A user-declared shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunStep {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Init(StepArgs),
    Plan(StepArgs),
    Apply(StepArgs),
    PolicyCheck(StepArgs),
    Run(RunStep),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Init(_) => "init",
            Step::Plan(_) => "plan",
            Step::Apply(_) => "apply",
            Step::PolicyCheck(_) => "policy_check",
            Step::Run(_) => "run",
        }
    }

    /// Environment declared on the step itself.
    pub fn env(&self) -> &BTreeMap<String, String> {
        match self {
            Step::Init(a) | Step::Plan(a) | Step::Apply(a) | Step::PolicyCheck(a) => &a.env,
            Step::Run(r) => &r.env,
        }
    }

    fn builtin(workflow: &str, name: &str, args: StepArgs) -> Result<Step, ConfigError> {
        match name {
            "init" => Ok(Step::Init(args)),
            "plan" => Ok(Step::Plan(args)),
            "apply" => Ok(Step::Apply(args)),
            "policy_check" => Ok(Step::PolicyCheck(args)),
            _ => Err(ConfigError::UnknownStep {
                workflow: workflow.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Parse one step in any of its YAML forms:
    /// `init`, `{plan: {extra_args: [..]}}`, `{run: "cmd"}` or `{run: {command, env}}`.
    pub fn parse(workflow: &str, value: &Value) -> Result<Step, ConfigError> {
        let invalid = |message: String| ConfigError::InvalidStep {
            workflow: workflow.to_string(),
            message,
        };

        match value {
            Value::String(name) if name == "run" => {
                Err(invalid("'run' step requires a command".to_string()))
            }
            Value::String(name) => Step::builtin(workflow, name, StepArgs::default()),
            Value::Mapping(map) => {
                if map.len() != 1 {
                    return Err(invalid(format!(
                        "a step must have exactly one key, found {}",
                        map.len()
                    )));
                }
                let Some((key, payload)) = map.iter().next() else {
                    return Err(invalid("empty step".to_string()));
                };
                let Some(name) = key.as_str() else {
                    return Err(invalid("step name must be a string".to_string()));
                };

                if name == "run" {
                    return match payload {
                        Value::String(command) => Ok(Step::Run(RunStep {
                            command: command.clone(),
                            env: BTreeMap::new(),
                        })),
                        Value::Mapping(_) => serde_yaml::from_value::<RunStep>(payload.clone())
                            .map(Step::Run)
                            .map_err(|e| invalid(format!("run: {}", e))),
                        _ => Err(invalid("'run' must be a string or a mapping".to_string())),
                    };
                }

                let args = match payload {
                    Value::Null => StepArgs::default(),
                    Value::Mapping(_) => serde_yaml::from_value::<StepArgs>(payload.clone())
                        .map_err(|e| invalid(format!("{}: {}", name, e)))?,
                    _ => {
                        return Err(invalid(format!(
                            "'{}' payload must be a mapping of extra_args/env",
                            name
                        )));
                    }
                };
                Step::builtin(workflow, name, args)
            }
            other => Err(invalid(format!("unsupported step value {:?}", other))),
        }
    }
}

/// The phases of a workflow. Plan runs on `plan`, policy_check follows a
/// successful plan when policy checks are enabled, apply runs on `apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    PolicyCheck,
    Apply,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::PolicyCheck => "policy_check",
            Stage::Apply => "apply",
        }
    }
}

/// A named set of stage step lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Workflow {
    pub name: String,
    pub plan: Vec<Step>,
    pub policy_check: Vec<Step>,
    pub apply: Vec<Step>,
}

impl Workflow {
    pub const DEFAULT_NAME: &'static str = "default";

    /// `plan: [init, plan]`, `policy_check: [policy_check]`, `apply: [apply]`.
    pub fn builtin_default() -> Self {
        Self::defaults_named(Self::DEFAULT_NAME)
    }

    fn defaults_named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            plan: vec![
                Step::Init(StepArgs::default()),
                Step::Plan(StepArgs::default()),
            ],
            policy_check: vec![Step::PolicyCheck(StepArgs::default())],
            apply: vec![Step::Apply(StepArgs::default())],
        }
    }

    pub fn stage(&self, stage: Stage) -> &[Step] {
        match stage {
            Stage::Plan => &self.plan,
            Stage::PolicyCheck => &self.policy_check,
            Stage::Apply => &self.apply,
        }
    }

    /// Parse a workflow body. Stages that are not mentioned keep the
    /// default steps.
    pub fn parse(name: &str, value: &Value) -> Result<Self, ConfigError> {
        let mut workflow = Self::defaults_named(name);
        let map = match value {
            Value::Null => return Ok(workflow),
            Value::Mapping(map) => map,
            _ => {
                return Err(ConfigError::InvalidStep {
                    workflow: name.to_string(),
                    message: "workflow must be a mapping of stages".to_string(),
                });
            }
        };

        for (key, body) in map {
            let stage_name = key.as_str().unwrap_or_default();
            let target = match stage_name {
                "plan" => &mut workflow.plan,
                "policy_check" => &mut workflow.policy_check,
                "apply" => &mut workflow.apply,
                _ => {
                    return Err(ConfigError::UnknownStage {
                        workflow: name.to_string(),
                        stage: key
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("{:?}", key)),
                    });
                }
            };
            *target = parse_stage(name, stage_name, body)?;
        }
        Ok(workflow)
    }
}

fn parse_stage(workflow: &str, stage: &str, body: &Value) -> Result<Vec<Step>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidStep {
        workflow: workflow.to_string(),
        message,
    };

    let steps = match body {
        Value::Null => return Ok(Vec::new()),
        Value::Mapping(map) => {
            for key in map.keys() {
                if key.as_str() != Some("steps") {
                    return Err(invalid(format!(
                        "stage '{}' only accepts 'steps', found {:?}",
                        stage, key
                    )));
                }
            }
            map.get("steps").cloned().unwrap_or(Value::Null)
        }
        _ => return Err(invalid(format!("stage '{}' must be a mapping", stage))),
    };

    match steps {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(items) => items.iter().map(|v| Step::parse(workflow, v)).collect(),
        _ => Err(invalid(format!("'{}.steps' must be a list", stage))),
    }
}
