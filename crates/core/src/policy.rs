//! Admission policy.

use crate::error::{CoreError, CoreResult};
use fg_protocol::config_models::{PolicyCheck, PolicyConfig};
use fg_protocol::process_models::ProcessInstance;
use regex::Regex;

enum CompiledCheck {
    DenyEntryPoint(Regex),
    DenyInitiator(Regex),
    RequireProject,
}

struct CompiledRule {
    name: String,
    check: CompiledCheck,
}

/// Ordered admission rules, evaluated while a process is PREPARING.
#[derive(Default)]
pub struct PolicyEngine {
    rules: Vec<CompiledRule>,
}

impl PolicyEngine {
    /// Compile the configured rules.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the rule whose pattern does not compile.
    pub fn new(config: &PolicyConfig) -> CoreResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let check = match &rule.check {
                    PolicyCheck::DenyEntryPoint { pattern } => {
                        CompiledCheck::DenyEntryPoint(full_match(&rule.name, pattern)?)
                    }
                    PolicyCheck::DenyInitiator { pattern } => {
                        CompiledCheck::DenyInitiator(full_match(&rule.name, pattern)?)
                    }
                    PolicyCheck::RequireProject => CompiledCheck::RequireProject,
                };
                Ok(CompiledRule {
                    name: rule.name.clone(),
                    check,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Check a process against every rule.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionDenied` for the first violated rule.
    pub fn check(&self, process: &ProcessInstance) -> CoreResult<()> {
        for rule in &self.rules {
            let violation = match &rule.check {
                CompiledCheck::DenyEntryPoint(re) => re
                    .is_match(&process.entry_point)
                    .then(|| format!("entry point '{}' is not allowed", process.entry_point)),
                CompiledCheck::DenyInitiator(re) => re
                    .is_match(&process.initiator)
                    .then(|| format!("initiator '{}' is not allowed", process.initiator)),
                CompiledCheck::RequireProject => process
                    .project
                    .is_none()
                    .then(|| "processes must belong to a project".to_string()),
            };
            if let Some(reason) = violation {
                return Err(CoreError::AdmissionDenied {
                    rule: rule.name.clone(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

fn full_match(rule: &str, pattern: &str) -> CoreResult<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| CoreError::Validation(format!("policy rule '{rule}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::process::new_instance;
    use fg_protocol::config_models::PolicyRule;
    use fg_protocol::process_models::ProcessSpec;

    fn engine(rules: Vec<(&str, PolicyCheck)>) -> PolicyEngine {
        let config = PolicyConfig {
            rules: rules
                .into_iter()
                .map(|(name, check)| PolicyRule {
                    name: name.to_string(),
                    check,
                })
                .collect(),
        };
        PolicyEngine::new(&config).unwrap()
    }

    fn process(entry_point: &str, project: Option<&str>) -> ProcessInstance {
        let spec = ProcessSpec {
            project: project.map(str::to_string),
            initiator: "alice".to_string(),
            ..Default::default()
        };
        new_instance(&spec, entry_point.to_string())
    }

    #[test]
    fn test_empty_policy_admits_everything() {
        assert!(PolicyEngine::default().check(&process("main", None)).is_ok());
    }

    #[test]
    fn test_first_violated_rule_is_reported() {
        let engine = engine(vec![
            ("project-only", PolicyCheck::RequireProject),
            (
                "no-admin",
                PolicyCheck::DenyEntryPoint {
                    pattern: "admin.*".to_string(),
                },
            ),
        ]);

        let err = engine.check(&process("adminTask", None)).unwrap_err();
        match err {
            CoreError::AdmissionDenied { rule, .. } => assert_eq!(rule, "project-only"),
            other => panic!("unexpected error: {other}"),
        }

        let err = engine.check(&process("adminTask", Some("p"))).unwrap_err();
        assert!(err.to_string().contains("no-admin"));

        assert!(engine.check(&process("main", Some("p"))).is_ok());
        // Full match: the pattern does not match a substring
        assert!(engine.check(&process("superadmin", Some("p"))).is_ok());
    }

    #[test]
    fn test_deny_initiator() {
        let engine = engine(vec![(
            "no-alice",
            PolicyCheck::DenyInitiator {
                pattern: "ali.e".to_string(),
            },
        )]);
        assert!(matches!(
            engine.check(&process("main", None)),
            Err(CoreError::AdmissionDenied { .. })
        ));
    }

    #[test]
    fn test_invalid_pattern() {
        let config = PolicyConfig {
            rules: vec![PolicyRule {
                name: "broken".to_string(),
                check: PolicyCheck::DenyInitiator {
                    pattern: "(".to_string(),
                },
            }],
        };
        let err = PolicyEngine::new(&config).err().unwrap();
        assert!(err.to_string().contains("broken"));
    }
}
