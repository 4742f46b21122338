//! Synthetic post-condition steps reported for each crash.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CrashResult;
use crate::types::Device;

pub const POST_CONDITION_DESCRIPTION: &str = "post condition after test cases to check crashes";
pub const POST_CONDITION_EXPECTED: &str = "No crashes after test";
pub const POST_CONDITION_ACTION: &str = "Crashes will be queried from crash portal";
pub const POST_CONDITION_REMARKS: &str = "Box crashed during test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Pass,
    Fail,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pass => f.write_str("PASS"),
            StepStatus::Fail => f.write_str("FAIL"),
        }
    }
}

/// One step outcome handed to the run's report writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub device: Device,
    pub test_case_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub description: String,
    pub expected: String,
    pub actual: String,
    pub error_message: String,
}

impl StepResult {
    /// The failing post-condition step recorded for every crash analysis hit.
    pub fn crash_post_condition(device: &Device, test_case_id: &str, step_id: &str) -> Self {
        Self {
            device: device.clone(),
            test_case_id: test_case_id.to_string(),
            step_id: step_id.to_string(),
            status: StepStatus::Fail,
            description: POST_CONDITION_DESCRIPTION.to_string(),
            expected: POST_CONDITION_EXPECTED.to_string(),
            actual: POST_CONDITION_ACTION.to_string(),
            error_message: POST_CONDITION_REMARKS.to_string(),
        }
    }
}

#[async_trait]
pub trait StepReporter: Send + Sync {
    async fn report_step(&self, result: &StepResult) -> CrashResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_condition_step() {
        let device = Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2s1_VBN");
        let step = StepResult::crash_post_condition(&device, "TC-100", "s-ca_1");
        assert_eq!(step.status, StepStatus::Fail);
        assert_eq!(step.status.to_string(), "FAIL");
        assert_eq!(step.step_id, "s-ca_1");
        assert_eq!(step.expected, POST_CONDITION_EXPECTED);

        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"status\":\"FAIL\""));
    }
}
