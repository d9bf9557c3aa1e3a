//! Lifecycle state machine of a pipeline definition.
//!
//! A definition is validated once and then serves instantiations until a
//! reload, a retirement, or a change to one of the models it references.
//! Model changes do not fail in-flight requests; they move the definition
//! into a requires-revalidation state that blocks new instantiations until
//! validation runs again.

use std::fmt;
use tracing::{debug, info};

/// Lifecycle states of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionStateCode {
    /// Defined, not yet validated.
    Begin,
    /// A reload is in progress.
    Reloading,
    /// Validated and serving instantiations.
    Available,
    /// Still loaded, but a referenced model changed; new instantiations are
    /// blocked until revalidation completes.
    AvailableRequiredRevalidation,
    /// Validation failed; unavailable until corrected.
    LoadingPreconditionFailed,
    /// Validation failed and a referenced model changed since.
    LoadingPreconditionFailedRequiredRevalidation,
    /// Removed from configuration.
    Retired,
}

impl fmt::Display for DefinitionStateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Reloading => write!(f, "reloading"),
            Self::Available => write!(f, "available"),
            Self::AvailableRequiredRevalidation => write!(f, "available_required_revalidation"),
            Self::LoadingPreconditionFailed => write!(f, "loading_precondition_failed"),
            Self::LoadingPreconditionFailedRequiredRevalidation => {
                write!(f, "loading_precondition_failed_required_revalidation")
            }
            Self::Retired => write!(f, "retired"),
        }
    }
}

/// Events driving the definition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionEvent {
    /// A reload of the definition started.
    Reload,
    /// Validation completed successfully.
    ValidationPassed,
    /// Validation found configuration errors.
    ValidationFailed,
    /// A model the definition references was reloaded or removed.
    UsedModelChanged,
    /// The definition was removed from configuration.
    Retire,
}

impl fmt::Display for DefinitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reload => write!(f, "reload"),
            Self::ValidationPassed => write!(f, "validation_passed"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::UsedModelChanged => write!(f, "used_model_changed"),
            Self::Retire => write!(f, "retire"),
        }
    }
}

/// The state machine tracking one definition's lifecycle.
#[derive(Debug)]
pub struct DefinitionStatus {
    name: String,
    state: DefinitionStateCode,
}

impl DefinitionStatus {
    /// Creates a status in the `Begin` state.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DefinitionStateCode::Begin,
        }
    }

    /// The current state.
    #[must_use]
    pub fn state_code(&self) -> DefinitionStateCode {
        self.state
    }

    /// Whether new pipelines may be instantiated right now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state == DefinitionStateCode::Available
    }

    /// Whether a referenced model changed since the last validation.
    #[must_use]
    pub fn requires_revalidation(&self) -> bool {
        matches!(
            self.state,
            DefinitionStateCode::AvailableRequiredRevalidation
                | DefinitionStateCode::LoadingPreconditionFailedRequiredRevalidation
        )
    }

    /// Applies one lifecycle event.
    pub fn handle(&mut self, event: DefinitionEvent) {
        use DefinitionEvent as E;
        use DefinitionStateCode as S;

        debug!(
            definition = %self.name,
            state = %self.state,
            event = %event,
            "handling definition event"
        );
        let next = match (self.state, event) {
            (S::Begin | S::Reloading, E::Reload) => S::Reloading,
            (S::Begin | S::Reloading, E::ValidationPassed) => S::Available,
            (S::Begin | S::Reloading, E::ValidationFailed) => S::LoadingPreconditionFailed,
            (S::Begin | S::Reloading, E::UsedModelChanged | E::Retire) => self.state,

            (S::Available, E::Reload) => S::Reloading,
            (S::Available, E::ValidationPassed | E::ValidationFailed) => self.state,
            (S::Available, E::UsedModelChanged) => S::AvailableRequiredRevalidation,
            (S::Available, E::Retire) => S::Retired,

            (S::AvailableRequiredRevalidation, E::Reload) => S::Reloading,
            (S::AvailableRequiredRevalidation, E::ValidationPassed) => S::Available,
            (S::AvailableRequiredRevalidation, E::ValidationFailed) => {
                S::LoadingPreconditionFailed
            }
            (S::AvailableRequiredRevalidation, E::UsedModelChanged) => self.state,
            (S::AvailableRequiredRevalidation, E::Retire) => S::Retired,

            (S::LoadingPreconditionFailed, E::Reload) => S::Reloading,
            (S::LoadingPreconditionFailed, E::ValidationPassed | E::ValidationFailed) => {
                self.state
            }
            (S::LoadingPreconditionFailed, E::UsedModelChanged) => {
                S::LoadingPreconditionFailedRequiredRevalidation
            }
            (S::LoadingPreconditionFailed, E::Retire) => S::Retired,

            (S::LoadingPreconditionFailedRequiredRevalidation, E::Reload) => S::Reloading,
            (S::LoadingPreconditionFailedRequiredRevalidation, E::ValidationPassed) => {
                S::Available
            }
            (S::LoadingPreconditionFailedRequiredRevalidation, E::ValidationFailed) => {
                S::LoadingPreconditionFailed
            }
            (S::LoadingPreconditionFailedRequiredRevalidation, E::UsedModelChanged) => self.state,
            (S::LoadingPreconditionFailedRequiredRevalidation, E::Retire) => S::Retired,

            (S::Retired, E::Reload) => S::Reloading,
            (S::Retired, E::ValidationPassed) => S::Available,
            (S::Retired, E::ValidationFailed) => S::LoadingPreconditionFailed,
            (S::Retired, E::UsedModelChanged | E::Retire) => self.state,
        };
        if next == self.state {
            debug!(definition = %self.name, state = %self.state, "keeping state");
        } else {
            info!(
                definition = %self.name,
                from = %self.state,
                to = %next,
                event = %event,
                "definition state changed"
            );
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DefinitionEvent as E;
    use DefinitionStateCode as S;

    fn status_after(events: &[E]) -> S {
        let mut status = DefinitionStatus::new("test");
        for &event in events {
            status.handle(event);
        }
        status.state_code()
    }

    #[test]
    fn test_validation_passed_makes_available() {
        assert_eq!(status_after(&[E::ValidationPassed]), S::Available);
    }

    #[test]
    fn test_validation_failed_blocks_loading() {
        assert_eq!(
            status_after(&[E::ValidationFailed]),
            S::LoadingPreconditionFailed
        );
    }

    #[test]
    fn test_model_change_requires_revalidation() {
        let state = status_after(&[E::ValidationPassed, E::UsedModelChanged]);
        assert_eq!(state, S::AvailableRequiredRevalidation);

        let mut status = DefinitionStatus::new("test");
        status.handle(E::ValidationPassed);
        status.handle(E::UsedModelChanged);
        assert!(status.requires_revalidation());
        assert!(!status.is_available());
    }

    #[test]
    fn test_revalidation_pass_restores_availability() {
        let state = status_after(&[
            E::ValidationPassed,
            E::UsedModelChanged,
            E::ValidationPassed,
        ]);
        assert_eq!(state, S::Available);
    }

    #[test]
    fn test_revalidation_failure_of_failed_definition() {
        let state = status_after(&[
            E::ValidationFailed,
            E::UsedModelChanged,
            E::ValidationFailed,
        ]);
        assert_eq!(state, S::LoadingPreconditionFailed);
    }

    #[test]
    fn test_retire_from_available() {
        assert_eq!(status_after(&[E::ValidationPassed, E::Retire]), S::Retired);
    }

    #[test]
    fn test_retire_before_validation_keeps_state() {
        assert_eq!(status_after(&[E::Retire]), S::Begin);
    }

    #[test]
    fn test_reload_then_revalidate() {
        let state = status_after(&[E::ValidationPassed, E::Reload, E::ValidationPassed]);
        assert_eq!(state, S::Available);
        assert_eq!(status_after(&[E::ValidationPassed, E::Reload]), S::Reloading);
    }
}
