use crate::run::WorkflowState;

/// A pipeline state that runs an external capability and produces one artifact.
///
/// `Init` is a pass-through and the approval/terminal states never execute,
/// so they have no `Stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Spec,
    Plan,
    AppCode,
    Test,
    Security,
    Infra,
    Deploy,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Self::Spec,
        Self::Plan,
        Self::AppCode,
        Self::Test,
        Self::Security,
        Self::Infra,
        Self::Deploy,
    ];

    pub fn for_state(state: WorkflowState) -> Option<Stage> {
        match state {
            WorkflowState::Spec => Some(Self::Spec),
            WorkflowState::Plan => Some(Self::Plan),
            WorkflowState::AppCode => Some(Self::AppCode),
            WorkflowState::Test => Some(Self::Test),
            WorkflowState::Security => Some(Self::Security),
            WorkflowState::Infra => Some(Self::Infra),
            WorkflowState::Deploy => Some(Self::Deploy),
            WorkflowState::Init
            | WorkflowState::WaitingForApproval
            | WorkflowState::Done
            | WorkflowState::Fail => None,
        }
    }

    pub fn state(&self) -> WorkflowState {
        match self {
            Self::Spec => WorkflowState::Spec,
            Self::Plan => WorkflowState::Plan,
            Self::AppCode => WorkflowState::AppCode,
            Self::Test => WorkflowState::Test,
            Self::Security => WorkflowState::Security,
            Self::Infra => WorkflowState::Infra,
            Self::Deploy => WorkflowState::Deploy,
        }
    }

    /// Config key, identical to the state's wire name.
    pub fn name(&self) -> &'static str {
        self.state().as_str()
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        name.parse::<WorkflowState>().ok().and_then(Self::for_state)
    }

    /// Workspace path of the artifact this stage produces. Distinct per stage.
    pub fn artifact_path(&self) -> &'static str {
        match self {
            Self::Spec => "spec.json",
            Self::Plan => "plan.json",
            Self::AppCode => "app/README.md",
            Self::Test => "test-report.json",
            Self::Security => "security-report.json",
            Self::Infra => "infra/README.md",
            Self::Deploy => "deploy-report.json",
        }
    }

    /// Artifact type recorded on the run: the file name of the artifact path.
    pub fn artifact_type(&self) -> &'static str {
        let path = self.artifact_path();
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Test and Security validate rather than generate.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Test | Self::Security)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_executing_state_has_a_stage() {
        for state in WorkflowState::ALL {
            let stage = Stage::for_state(state);
            let expected = !matches!(
                state,
                WorkflowState::Init
                    | WorkflowState::WaitingForApproval
                    | WorkflowState::Done
                    | WorkflowState::Fail
            );
            assert_eq!(stage.is_some(), expected, "{}", state);
            if let Some(stage) = stage {
                assert_eq!(stage.state(), state);
            }
        }
    }

    #[test]
    fn test_artifact_paths_are_distinct() {
        let paths: HashSet<String> = Stage::ALL
            .iter()
            .map(|s| s.artifact_path().to_lowercase())
            .collect();
        assert_eq!(paths.len(), Stage::ALL.len());
    }

    #[test]
    fn test_artifact_type_is_file_name() {
        assert_eq!(Stage::Spec.artifact_type(), "spec.json");
        assert_eq!(Stage::AppCode.artifact_type(), "README.md");
        assert_eq!(Stage::Deploy.artifact_type(), "deploy-report.json");
    }

    #[test]
    fn test_name_roundtrip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(Stage::from_name("app_code"), Some(Stage::AppCode));
        assert_eq!(Stage::from_name("init"), None);
        assert_eq!(Stage::from_name("waiting_for_approval"), None);
        assert_eq!(Stage::from_name("bogus"), None);
    }

    #[test]
    fn test_validation_stages() {
        let validating: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.is_validation()).collect();
        assert_eq!(validating, vec![Stage::Test, Stage::Security]);
    }
}
