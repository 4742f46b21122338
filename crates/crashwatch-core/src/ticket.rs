//! Issue tickets for crashes found during a test run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::artifacts::CRASH_FOLDER_NAME;
use crate::config::CrashAnalysisConfig;
use crate::error::CrashResult;
use crate::types::{CrashRecord, Device};

pub const REQUESTOR: &str = "CRASH_ANALYSIS";

pub const SUMMARY_TEMPLATE: &str =
    "[AUTO][<model>][<branch>]<app> crash with fingerprint <signature> due to <reason>";
pub const DESCRIPTION_TEMPLATE: &str = "Observed crash in below device during execution of <step> of test case <testcaseid>.\nExecution logs: <buildurl>\n\nDetails of crash is as below.\n\n*+Device Details+*\n<details>\n";
pub const STACKTRACE_TEMPLATE: &str = "{noformat}<stacktrace>{noformat}";
pub const FAILURE_SUMMARY: &str = "[MISSING CRASH][AUTO][CRASH_PORTAL]Crash obtained during test execution";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketRequest {
    pub requestor: String,
    pub summary: String,
    pub description: String,
    pub labels: Vec<String>,
    pub watchers: Vec<String>,
    pub search_keys: Vec<String>,
    pub priority: String,
    pub build_name: String,
    pub manual_id: String,
    pub automation_id: String,
    pub step_number: String,
    pub job_id: Option<u64>,
    pub job_url: String,
    pub build_appender: Option<String>,
    pub environment_type: Option<String>,
    pub attachments: Vec<String>,
}

/// The issue-tracking backend.
#[async_trait]
pub trait TicketSink: Send + Sync {
    /// Create or update a ticket; the returned id is opaque.
    async fn create_ticket(&self, request: &TicketRequest) -> CrashResult<String>;
}

/// Site-specific ticket enrichment. Every hook may contribute nothing.
#[async_trait]
pub trait EnrichmentHooks: Send + Sync {
    async fn labels(&self, _device: &Device, _crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn watchers(&self, _device: &Device, _crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn search_keys(&self, _device: &Device, _crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn device_details(&self, _device: &Device) -> CrashResult<String> {
        Ok(String::new())
    }

    async fn attachment_urls(
        &self,
        _base_url: &str,
        _device: &Device,
        _crash: &CrashRecord,
    ) -> CrashResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn firmware_branch(&self, _device: &Device) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

impl EnrichmentHooks for NoEnrichment {}

pub struct TicketComposer {
    hooks: Arc<dyn EnrichmentHooks>,
    config: Arc<CrashAnalysisConfig>,
}

impl TicketComposer {
    pub fn new(hooks: Arc<dyn EnrichmentHooks>, config: Arc<CrashAnalysisConfig>) -> Self {
        Self { hooks, config }
    }

    pub async fn compose_crash_ticket(
        &self,
        device: &Device,
        test_case_id: &str,
        step_number: &str,
        correlated_step: &str,
        crash: &CrashRecord,
    ) -> TicketRequest {
        let details = self.hooks.device_details(device).await.unwrap_or_else(|e| {
            warn!("Device details hook failed: {}", e);
            String::new()
        });
        let summary = self.summary(device, crash);
        info!("Summary : {}", summary);
        let description = self.description(test_case_id, correlated_step, &details, crash);
        info!("Description : \n{}", description);

        let base_url = format!(
            "{}ws/target/{}/{}/{}/",
            self.config.job_url,
            test_case_id,
            device.clean_mac(),
            CRASH_FOLDER_NAME
        );
        let attachments = self
            .hooks
            .attachment_urls(&base_url, device, crash)
            .await
            .unwrap_or_else(|e| {
                warn!("Attachment hook failed: {}", e);
                Vec::new()
            });

        let mut request = self.base_request(device, test_case_id, step_number);
        request.summary = summary;
        request.description = description;
        request.labels = self.labels(device, test_case_id, Some(crash)).await;
        request.watchers = self.watchers(device, Some(crash)).await;
        request.search_keys = self.search_keys(device, test_case_id, Some(crash)).await;
        request.attachments = attachments;
        request
    }

    /// Ticket for a crash seen on the device that the backend never produced.
    pub async fn compose_failure_ticket(&self, device: &Device, test_case_id: &str, step_number: &str) -> TicketRequest {
        let mut request = self.base_request(device, test_case_id, step_number);
        request.summary = FAILURE_SUMMARY.to_string();
        request.description = format!(
            "Observed crash in box logs during test execution of {} , but was unable to fetch its details from crash portal.\n JOB URL : {}\nImagename : {}",
            test_case_id,
            self.config.job_link(),
            device.firmware_version
        );
        request.labels = self.labels(device, test_case_id, None).await;
        request.watchers = self.watchers(device, None).await;
        request.search_keys = self.search_keys(device, test_case_id, None).await;
        request
    }

    pub fn summary(&self, device: &Device, crash: &CrashRecord) -> String {
        SUMMARY_TEMPLATE
            .replace("<model>", &crash.device_model)
            .replace("<branch>", &self.firmware_branch(device))
            .replace("<app>", &crash.app)
            .replace("<signature>", &crash.signature)
            .replace("<reason>", &crash.failed_reason)
    }

    pub fn description(&self, test_case_id: &str, correlated_step: &str, device_details: &str, crash: &CrashRecord) -> String {
        let mut description = DESCRIPTION_TEMPLATE
            .replace("<step>", correlated_step)
            .replace("<testcaseid>", test_case_id)
            .replace("<buildurl>", &self.config.console_url())
            .replace("<details>", device_details);

        description.push_str("*+Crash Details+*\n");
        let fields = [
            ("DEVICE MAC", crash.mac.as_str()),
            ("DEVICE MODEL", crash.device_model.as_str()),
            ("FIRMWARE VERSION", crash.version.as_str()),
            ("APP CRASHED", crash.app.as_str()),
            ("FINGERPRINT", crash.signature.as_str()),
            ("DATE CRASHED", crash.date_crashed.as_deref().unwrap_or("")),
            ("FAILURE REASON", crash.failed_reason.as_str()),
            ("FILE", crash.filename.as_str()),
        ];
        for (name, value) in fields {
            description.push_str(&format!("- {} : {}\n", name, value));
        }

        if let Some(trace) = crash.reportable_stack_trace() {
            description.push_str("\n\n*+STACKTRACE*+\n");
            description.push_str(&STACKTRACE_TEMPLATE.replace("<stacktrace>", trace));
        }
        description
    }

    /// `sprint`, `stable` or `release`, unless a hook knows better.
    pub fn firmware_branch(&self, device: &Device) -> String {
        if let Some(branch) = self.hooks.firmware_branch(device) {
            return branch;
        }
        let version = &device.firmware_version;
        let has = |keywords: &[String]| keywords.iter().any(|k| !k.is_empty() && version.contains(k.as_str()));
        if has(&self.config.sprint_keywords) {
            "sprint".to_string()
        } else if has(&self.config.stable_keywords) {
            "stable".to_string()
        } else {
            "release".to_string()
        }
    }

    fn base_request(&self, device: &Device, test_case_id: &str, step_number: &str) -> TicketRequest {
        TicketRequest {
            requestor: REQUESTOR.to_string(),
            priority: self.config.priority.clone(),
            build_name: device.firmware_version.clone(),
            manual_id: self.config.manual_id.clone(),
            automation_id: test_case_id.to_string(),
            step_number: step_number.to_string(),
            job_id: self.config.job_id,
            job_url: self.config.job_link(),
            build_appender: self.config.build_appender.clone(),
            environment_type: self.config.environment_type.clone(),
            ..Default::default()
        }
    }

    async fn labels(&self, device: &Device, test_case_id: &str, crash: Option<&CrashRecord>) -> Vec<String> {
        let mut labels = self.hooks.labels(device, crash).await.unwrap_or_else(|e| {
            warn!("Label hook failed: {}", e);
            Vec::new()
        });
        labels.push(test_case_id.to_string());
        dedup_in_order(labels)
    }

    async fn watchers(&self, device: &Device, crash: Option<&CrashRecord>) -> Vec<String> {
        let watchers = self.hooks.watchers(device, crash).await.unwrap_or_else(|e| {
            warn!("Watcher hook failed: {}", e);
            Vec::new()
        });
        dedup_in_order(watchers)
    }

    async fn search_keys(&self, device: &Device, test_case_id: &str, crash: Option<&CrashRecord>) -> Vec<String> {
        let mut keys = self.hooks.search_keys(device, crash).await.unwrap_or_else(|e| {
            warn!("Search key hook failed: {}", e);
            Vec::new()
        });
        keys.push(test_case_id.to_string());
        keys.push(device.firmware_version.clone());
        dedup_in_order(keys)
    }
}

fn dedup_in_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrashError;

    fn device() -> Device {
        Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2sprint_VBN")
    }

    fn crash(minidump: bool, trace: Option<&str>) -> CrashRecord {
        CrashRecord {
            id: "c-1".into(),
            app: "Receiver".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            version: "XG1_5.2sprint_VBN".into(),
            device_model: "XG1".into(),
            date_crashed: Some("Fri May 17 14:10:44 UTC 2019".into()),
            signature: "0xdeadbeef".into(),
            failed_reason: "SIGSEGV".into(),
            filename: "receiver.dmp".into(),
            stack_trace: trace.map(str::to_string),
            is_minidump: minidump,
            is_coredump: !minidump,
            ..Default::default()
        }
    }

    fn config() -> Arc<CrashAnalysisConfig> {
        Arc::new(CrashAnalysisConfig {
            job_url: "https://ci/job/nightly/".into(),
            build_number: "42".into(),
            build_url: "https://ci/job/nightly/42".into(),
            job_id: Some(7),
            sprint_keywords: vec!["sprint".into()],
            stable_keywords: vec!["stable".into()],
            ..Default::default()
        })
    }

    struct SiteHooks;

    #[async_trait]
    impl EnrichmentHooks for SiteHooks {
        async fn labels(&self, _device: &Device, crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
            Ok(crash
                .map(|c| vec![format!("cpeautoCrash_{}_Signature", c.app), "TC-100".to_string()])
                .unwrap_or_default())
        }

        async fn watchers(&self, _device: &Device, _crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
            Ok(vec!["triage".into()])
        }

        async fn search_keys(&self, _device: &Device, _crash: Option<&CrashRecord>) -> CrashResult<Vec<String>> {
            Err(CrashError::Ticketing("search service down".into()))
        }

        async fn device_details(&self, device: &Device) -> CrashResult<String> {
            Ok(format!("Model: {}", device.model))
        }

        async fn attachment_urls(&self, base: &str, _d: &Device, crash: &CrashRecord) -> CrashResult<Vec<String>> {
            Ok(vec![format!("{}{}", base, crash.filename)])
        }
    }

    #[tokio::test]
    async fn test_crash_ticket_fields() {
        let composer = TicketComposer::new(Arc::new(SiteHooks), config());
        let ticket = composer
            .compose_crash_ticket(&device(), "TC-100", "s-ca_1", "s3", &crash(true, Some("#0 main")))
            .await;

        assert_eq!(
            ticket.summary,
            "[AUTO][XG1][sprint]Receiver crash with fingerprint 0xdeadbeef due to SIGSEGV"
        );
        assert!(ticket.description.starts_with(
            "Observed crash in below device during execution of s3 of test case TC-100."
        ));
        assert!(ticket.description.contains("https://ci/job/nightly/42/consoleFull"));
        assert!(ticket.description.contains("Model: XG1"));
        assert!(ticket.description.contains("- FINGERPRINT : 0xdeadbeef"));
        assert!(ticket.description.contains("{noformat}#0 main{noformat}"));
        assert_eq!(ticket.labels, vec!["cpeautoCrash_Receiver_Signature", "TC-100"]);
        assert_eq!(ticket.watchers, vec!["triage"]);
        assert_eq!(ticket.search_keys, vec!["TC-100", "XG1_5.2sprint_VBN"]);
        assert_eq!(
            ticket.attachments,
            vec!["https://ci/job/nightly/ws/target/TC-100/AABBCCDDEEFF/Crash-Analysis/receiver.dmp"]
        );
        assert_eq!(ticket.priority, "P2");
        assert_eq!(ticket.manual_id, "_POSTCONDITION ");
        assert_eq!(ticket.automation_id, "TC-100");
        assert_eq!(ticket.step_number, "s-ca_1");
        assert_eq!(ticket.job_id, Some(7));
        assert_eq!(ticket.job_url, "https://ci/job/nightly/42");
        assert_eq!(ticket.requestor, REQUESTOR);
    }

    #[tokio::test]
    async fn test_stack_trace_only_for_minidump_with_trace() {
        let composer = TicketComposer::new(Arc::new(NoEnrichment), config());
        let cases = [
            (true, Some("#0 main"), true),
            (true, Some(""), false),
            (true, None, false),
            (false, Some("#0 main"), false),
        ];
        for (minidump, trace, expected) in cases {
            let description = composer.description("TC-100", "s1", "", &crash(minidump, trace));
            assert_eq!(description.contains("*+STACKTRACE*+"), expected, "{:?}", (minidump, trace));
        }
    }

    #[tokio::test]
    async fn test_failure_ticket_has_mandatory_entries() {
        let composer = TicketComposer::new(Arc::new(NoEnrichment), config());
        let ticket = composer.compose_failure_ticket(&device(), "TC-100", "ca_fail_1").await;
        assert_eq!(ticket.summary, FAILURE_SUMMARY);
        assert!(ticket.description.contains("TC-100"));
        assert!(ticket.description.contains("Imagename : XG1_5.2sprint_VBN"));
        assert_eq!(ticket.labels, vec!["TC-100"]);
        assert!(ticket.watchers.is_empty());
        assert_eq!(ticket.search_keys, vec!["TC-100", "XG1_5.2sprint_VBN"]);
        assert_eq!(ticket.step_number, "ca_fail_1");
        assert!(ticket.attachments.is_empty());
    }

    #[test]
    fn test_firmware_branch() {
        let composer = TicketComposer::new(Arc::new(NoEnrichment), config());
        assert_eq!(composer.firmware_branch(&device()), "sprint");
        let stable = Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2stable2_VBN");
        assert_eq!(composer.firmware_branch(&stable), "stable");
        let release = Device::new("AA:BB:CC:DD:EE:FF", "XG1", "XG1_5.2p1s1_PROD");
        assert_eq!(composer.firmware_branch(&release), "release");
    }
}
