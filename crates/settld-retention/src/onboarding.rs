//! Step machine over tenant onboarding milestones: each step fires at most
//! one successful delivery, keyed by `stepKey` (spec §4.13).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use settld_core::{SettldError, TimestampMs};

/// Running tally of tenant lifecycle milestones the sequencer's triggers
/// read from. Mirrors the persisted `profile.json` (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantProfile {
    #[serde(rename = "signedUpAt")]
    pub signed_up_at: Option<TimestampMs>,
    #[serde(rename = "firstUploadAt")]
    pub first_upload_at: Option<TimestampMs>,
    #[serde(rename = "firstDecisionAt")]
    pub first_decision_at: Option<TimestampMs>,
    #[serde(rename = "firstWebhookConfiguredAt")]
    pub first_webhook_configured_at: Option<TimestampMs>,
}

/// One onboarding step: when it fires and what it sends.
pub struct OnboardingStep {
    pub step_key: String,
    pub trigger: Box<dyn Fn(&TenantProfile) -> Option<TimestampMs> + Send + Sync>,
    pub subject: Box<dyn Fn(&TenantProfile) -> String + Send + Sync>,
    pub body: Box<dyn Fn(&TenantProfile) -> String + Send + Sync>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OnboardingState {
    #[serde(default)]
    sent: HashMap<String, TimestampMs>,
}

pub struct OnboardingSequencer {
    data_dir: PathBuf,
    steps: Vec<OnboardingStep>,
}

impl OnboardingSequencer {
    pub fn new(data_dir: impl Into<PathBuf>, steps: Vec<OnboardingStep>) -> Self {
        OnboardingSequencer { data_dir: data_dir.into(), steps }
    }

    fn state_path(&self, tenant_id: &str) -> PathBuf {
        self.data_dir.join("tenants").join(tenant_id).join("onboarding_email_sequence.json")
    }

    fn load_state(&self, tenant_id: &str) -> Result<OnboardingState, SettldError> {
        let path = self.state_path(tenant_id);
        if !path.exists() {
            return Ok(OnboardingState::default());
        }
        let raw = fs::read_to_string(&path).map_err(|e| SettldError::Storage(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| SettldError::Serialization(e.to_string()))
    }

    fn save_state(&self, tenant_id: &str, state: &OnboardingState) -> Result<(), SettldError> {
        let path = self.state_path(tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SettldError::Storage(e.to_string()))?;
        }
        let body = serde_json::to_vec_pretty(state).map_err(|e| SettldError::Serialization(e.to_string()))?;
        fs::write(&path, body).map_err(|e| SettldError::Storage(e.to_string()))
    }

    /// Evaluates every not-yet-sent step against `profile`. For each step
    /// whose `trigger` has fired (`triggerAt <= now`), `deliver` is called
    /// with `(stepKey, subject, body)`; the step is marked sent only if
    /// `deliver` reports success. Returns the step keys sent this tick.
    pub fn tick(
        &self,
        tenant_id: &str,
        profile: &TenantProfile,
        now_ms: TimestampMs,
        mut deliver: impl FnMut(&str, &str, &str) -> bool,
    ) -> Result<Vec<String>, SettldError> {
        let mut state = self.load_state(tenant_id)?;
        let mut sent_this_tick = Vec::new();

        for step in &self.steps {
            if state.sent.contains_key(&step.step_key) {
                continue;
            }
            let Some(trigger_at) = (step.trigger)(profile) else { continue };
            if now_ms < trigger_at {
                continue;
            }
            let subject = (step.subject)(profile);
            let body = (step.body)(profile);
            if deliver(&step.step_key, &subject, &body) {
                state.sent.insert(step.step_key.clone(), now_ms);
                sent_this_tick.push(step.step_key.clone());
            }
        }

        if !sent_this_tick.is_empty() {
            self.save_state(tenant_id, &state)?;
        }
        Ok(sent_this_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<OnboardingStep> {
        vec![
            OnboardingStep {
                step_key: "welcome".into(),
                trigger: Box::new(|p| p.signed_up_at),
                subject: Box::new(|_| "Welcome".into()),
                body: Box::new(|_| "Welcome aboard".into()),
            },
            OnboardingStep {
                step_key: "first-upload-nudge".into(),
                trigger: Box::new(|p| p.signed_up_at.map(|t| t + 86_400_000).filter(|_| p.first_upload_at.is_none())),
                subject: Box::new(|_| "Ready to verify your first bundle?".into()),
                body: Box::new(|_| "Here's how".into()),
            },
        ]
    }

    #[test]
    fn fires_steps_whose_trigger_has_passed() {
        let dir = tempfile::tempdir().unwrap();
        let seq = OnboardingSequencer::new(dir.path(), steps());
        let profile = TenantProfile { signed_up_at: Some(1000), ..Default::default() };

        let sent = seq.tick("acme", &profile, 1000, |_, _, _| true).unwrap();
        assert_eq!(sent, vec!["welcome".to_string()]);
    }

    #[test]
    fn each_step_delivers_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let seq = OnboardingSequencer::new(dir.path(), steps());
        let profile = TenantProfile { signed_up_at: Some(1000), ..Default::default() };

        seq.tick("acme", &profile, 1000, |_, _, _| true).unwrap();
        let second = seq.tick("acme", &profile, 2000, |_, _, _| true).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn failed_delivery_leaves_step_pending_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let seq = OnboardingSequencer::new(dir.path(), steps());
        let profile = TenantProfile { signed_up_at: Some(1000), ..Default::default() };

        let first = seq.tick("acme", &profile, 1000, |_, _, _| false).unwrap();
        assert!(first.is_empty());

        let second = seq.tick("acme", &profile, 1000, |_, _, _| true).unwrap();
        assert_eq!(second, vec!["welcome".to_string()]);
    }

    #[test]
    fn step_with_no_trigger_yet_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let seq = OnboardingSequencer::new(dir.path(), steps());
        let profile = TenantProfile::default();

        let sent = seq.tick("acme", &profile, 1000, |_, _, _| true).unwrap();
        assert!(sent.is_empty());
    }
}
