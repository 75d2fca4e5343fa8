//! Domain models for gradeflow.
//!
//! Canonical definitions for the core entities:
//! - `GradingRequest`: a submission and the rubric criteria to grade it by
//! - `CriterionOutcome`: the graded, failed or deferred result of one criterion
//! - `ServiceEvent`: payloads exchanged over the event transport

pub mod criterion;
pub mod error;
pub mod events;
pub mod outcome;

pub use criterion::{Criterion, GradingRequest, Level};
pub use error::{GradeflowError, Result, ValidationError};
pub use events::{CriterionFailed, CriterionGraded, CriterionScore, ServiceEvent, SubmissionGraded};
pub use outcome::{CriterionOutcome, FeedbackItem, ScoreBreakdown};
