pub mod config;
pub mod judge;
pub mod sandbox;
pub mod worker;

pub use judge::JudgeEngine;
pub use judge::model::{
    Batch, BatchResult, ExecutionOutcome, ExecutionTime, JudgeResult, ResourceLimits,
    Submission, TestCase, TestCaseReport, Verdict, validate_submission,
};
pub use worker::JudgePool;
