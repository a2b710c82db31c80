//! The fixed step sequence of the user deletion saga.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{Result, SagaError};
use crate::events::{EventType, Service};

pub const STEP_DELETE_AUTH_USER: &str = "delete_auth_user";
pub const STEP_DELETE_TEAM_USER: &str = "delete_team_user";
pub const STEP_DELETE_BOARD_USER: &str = "delete_board_user";
pub const STEP_DELETE_TASK_USER: &str = "delete_task_user";

/// One stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub service: Service,
    /// Topic the command and compensation events go to.
    pub topic: String,
    pub command_event_type: EventType,
    pub compensate_event_type: EventType,
    pub succeeded_event_type: EventType,
    pub failed_event_type: EventType,
    /// Deadline handed to the service with each command.
    pub timeout: Duration,
}

impl Step {
    /// Builds the step that deletes the user in `service`.
    pub fn delete_user_in(name: impl Into<String>, service: Service, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            service,
            topic: service.command_topic(),
            command_event_type: EventType::UserDeleteRequested(service),
            compensate_event_type: EventType::UserDeleteRollback(service),
            succeeded_event_type: EventType::UserDeleted(service),
            failed_event_type: EventType::UserDeleteFailed(service),
            timeout,
        }
    }
}

/// An ordered, immutable list of steps.
///
/// Built once at startup and shared by the orchestrator, so tests can run
/// the engine against a shorter or reordered pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// Validates and wraps a list of steps.
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(SagaError::InvalidPipeline("no steps".to_string()));
        }
        let mut names = HashSet::new();
        let mut results = HashSet::new();
        for step in &steps {
            if !names.insert(step.name.as_str()) {
                return Err(SagaError::InvalidPipeline(format!(
                    "duplicate step name {}",
                    step.name
                )));
            }
            if !results.insert(&step.succeeded_event_type) || !results.insert(&step.failed_event_type)
            {
                return Err(SagaError::InvalidPipeline(format!(
                    "result event of step {} is shared with another step",
                    step.name
                )));
            }
        }
        Ok(Self { steps })
    }

    /// The user deletion pipeline: auth, team, board, task.
    pub fn user_deletion(step_timeout: Duration) -> Self {
        Self {
            steps: vec![
                Step::delete_user_in(STEP_DELETE_AUTH_USER, Service::Auth, step_timeout),
                Step::delete_user_in(STEP_DELETE_TEAM_USER, Service::Team, step_timeout),
                Step::delete_user_in(STEP_DELETE_BOARD_USER, Service::Board, step_timeout),
                Step::delete_user_in(STEP_DELETE_TASK_USER, Service::Task, step_timeout),
            ],
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Index of the step in pipeline order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// First step, in pipeline order, that is not in `completed`.
    pub fn next_step(&self, completed: &[String]) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| !completed.iter().any(|c| *c == s.name))
    }

    /// The step a result event reports on, with whether it succeeded.
    pub fn step_for_result(&self, event_type: &EventType) -> Option<(&Step, bool)> {
        self.steps.iter().find_map(|s| {
            if s.succeeded_event_type == *event_type {
                Some((s, true))
            } else if s.failed_event_type == *event_type {
                Some((s, false))
            } else {
                None
            }
        })
    }

    /// Completed steps in reverse pipeline order, i.e. the order to undo them.
    pub fn compensation_plan(&self, completed: &[String]) -> Vec<&Step> {
        self.steps
            .iter()
            .rev()
            .filter(|s| completed.iter().any(|c| *c == s.name))
            .collect()
    }

    /// Topics the orchestrator must consume to see every result.
    pub fn inbound_topics(&self) -> Vec<String> {
        let mut topics = vec![crate::events::SAGA_TOPIC.to_string()];
        for step in &self.steps {
            let topic = step.service.result_topic();
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::user_deletion(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(steps: &[&Step]) -> Vec<String> {
        steps.iter().map(|s| s.name.clone()).collect()
    }

    fn completed(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_user_deletion_order() {
        let pipeline = Pipeline::default();
        let order: Vec<_> = pipeline.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            order,
            vec![
                STEP_DELETE_AUTH_USER,
                STEP_DELETE_TEAM_USER,
                STEP_DELETE_BOARD_USER,
                STEP_DELETE_TASK_USER
            ]
        );
        assert_eq!(pipeline.steps()[1].topic, "team-service-commands");
        assert_eq!(pipeline.steps()[0].timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_next_step_is_first_incomplete() {
        let pipeline = Pipeline::default();
        assert_eq!(
            pipeline.next_step(&[]).unwrap().name,
            STEP_DELETE_AUTH_USER
        );
        // Out-of-order completion still picks the earliest gap
        assert_eq!(
            pipeline
                .next_step(&completed(&[STEP_DELETE_TASK_USER, STEP_DELETE_TEAM_USER]))
                .unwrap()
                .name,
            STEP_DELETE_AUTH_USER
        );
        let all: Vec<String> = pipeline.steps().iter().map(|s| s.name.clone()).collect();
        assert!(pipeline.next_step(&all).is_none());
    }

    #[test]
    fn test_compensation_plan_is_reverse_pipeline_order() {
        let pipeline = Pipeline::default();
        let plan = pipeline.compensation_plan(&completed(&[
            STEP_DELETE_TEAM_USER,
            STEP_DELETE_AUTH_USER,
            STEP_DELETE_BOARD_USER,
        ]));
        assert_eq!(
            names(&plan),
            completed(&[
                STEP_DELETE_BOARD_USER,
                STEP_DELETE_TEAM_USER,
                STEP_DELETE_AUTH_USER
            ])
        );
        assert!(pipeline.compensation_plan(&[]).is_empty());
    }

    #[test]
    fn test_step_for_result() {
        let pipeline = Pipeline::default();
        let (step, ok) = pipeline
            .step_for_result(&EventType::UserDeleted(Service::Board))
            .unwrap();
        assert_eq!(step.name, STEP_DELETE_BOARD_USER);
        assert!(ok);

        let (step, ok) = pipeline
            .step_for_result(&EventType::UserDeleteFailed(Service::Team))
            .unwrap();
        assert_eq!(step.name, STEP_DELETE_TEAM_USER);
        assert!(!ok);

        assert!(
            pipeline
                .step_for_result(&EventType::UserDeleteRequested(Service::Auth))
                .is_none()
        );
    }

    #[test]
    fn test_inbound_topics() {
        assert_eq!(
            Pipeline::default().inbound_topics(),
            vec![
                "user-deletion-saga",
                "auth-service-events",
                "team-service-events",
                "board-service-events",
                "task-service-events"
            ]
        );
    }

    #[test]
    fn test_new_rejects_bad_pipelines() {
        assert!(matches!(
            Pipeline::new(vec![]),
            Err(SagaError::InvalidPipeline(_))
        ));

        let t = Duration::from_secs(1);
        let dup = vec![
            Step::delete_user_in("a", Service::Auth, t),
            Step::delete_user_in("a", Service::Team, t),
        ];
        assert!(Pipeline::new(dup).is_err());

        let shared = vec![
            Step::delete_user_in("a", Service::Auth, t),
            Step::delete_user_in("b", Service::Auth, t),
        ];
        assert!(Pipeline::new(shared).is_err());

        let short = Pipeline::new(vec![Step::delete_user_in("only", Service::Task, t)]).unwrap();
        assert_eq!(short.steps().len(), 1);
    }
}
