//! Customization Client — hands extracted resume text plus the job context to
//! the external AI endpoint and returns the tailored text.
//!
//! The timeout is enforced here, not by the transport: when it fires the
//! in-flight future is dropped, which abandons the HTTP request.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm_client::prompts::{GROUNDING_INSTRUCTION, MARKDOWN_ONLY_SYSTEM};
use crate::llm_client::{LlmClient, LlmError};
use crate::models::resume::JobContext;

pub mod prompts;

use prompts::CUSTOMIZE_PROMPT_TEMPLATE;

/// Longest job description forwarded to the model.
const MAX_JOB_DESCRIPTION_CHARS: usize = 20_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CustomizeError {
    #[error("customization timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Network failure, rate limiting or a 5xx from the endpoint.
    #[error("customization service unavailable: {0}")]
    Transport(String),

    /// The endpoint (or local validation) refused the input. Retrying won't help.
    #[error("customization rejected: {0}")]
    Rejected(String),
}

impl From<LlmError> for CustomizeError {
    fn from(e: LlmError) -> Self {
        if e.is_retryable() {
            CustomizeError::Transport(e.to_string())
        } else {
            CustomizeError::Rejected(e.to_string())
        }
    }
}

/// Callers go through [`Customizer::customize`], which validates the job
/// context and bounds the call by `timeout`. Implementors only supply the raw
/// [`Customizer::request`].
#[async_trait]
pub trait Customizer: Send + Sync {
    /// One unbounded call to the backend.
    async fn request(&self, resume_text: &str, job: &JobContext)
        -> Result<String, CustomizeError>;

    async fn customize(
        &self,
        resume_text: &str,
        job: &JobContext,
        timeout: Duration,
    ) -> Result<String, CustomizeError> {
        validate_job_context(job)?;

        match tokio::time::timeout(timeout, self.request(resume_text, job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Customization call abandoned after {}ms", timeout.as_millis());
                Err(CustomizeError::Timeout(timeout))
            }
        }
    }
}

/// Checks the job context before spending a call on it.
pub fn validate_job_context(job: &JobContext) -> Result<(), CustomizeError> {
    if job.job_description.trim().is_empty() {
        return Err(CustomizeError::Rejected(
            "job description is empty".to_string(),
        ));
    }
    if job.job_description.chars().count() > MAX_JOB_DESCRIPTION_CHARS {
        return Err(CustomizeError::Rejected(format!(
            "job description exceeds {MAX_JOB_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(())
}

pub fn build_customize_prompt(resume_text: &str, job: &JobContext) -> String {
    let or_unknown = |s: &str| {
        if s.trim().is_empty() {
            "(not provided)".to_string()
        } else {
            s.trim().to_string()
        }
    };

    CUSTOMIZE_PROMPT_TEMPLATE
        .replace("{grounding_instruction}", GROUNDING_INSTRUCTION)
        .replace("{job_title}", &or_unknown(&job.job_title))
        .replace("{company_name}", &or_unknown(&job.company_name))
        .replace("{job_description}", job.job_description.trim())
        .replace("{resume_text}", resume_text)
}

/// Production customizer backed by the Anthropic Messages API.
pub struct LlmCustomizer {
    llm: LlmClient,
}

impl LlmCustomizer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Customizer for LlmCustomizer {
    async fn request(
        &self,
        resume_text: &str,
        job: &JobContext,
    ) -> Result<String, CustomizeError> {
        let prompt = build_customize_prompt(resume_text, job);
        let text = self.llm.call_text(&prompt, MARKDOWN_ONLY_SYSTEM).await?;
        debug!("Customized resume: {} chars", text.len());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    fn job(description: &str) -> JobContext {
        JobContext {
            job_title: "Backend Engineer".to_string(),
            company_name: "Acme".to_string(),
            job_description: description.to_string(),
        }
    }

    /// Never answers; flags when its future is dropped.
    struct HangingCustomizer {
        dropped: Arc<AtomicBool>,
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Customizer for HangingCustomizer {
        async fn request(&self, _: &str, _: &JobContext) -> Result<String, CustomizeError> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct Echo;

    #[async_trait]
    impl Customizer for Echo {
        async fn request(&self, text: &str, _: &JobContext) -> Result<String, CustomizeError> {
            Ok(format!("tailored: {text}"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_the_call() {
        let dropped = Arc::new(AtomicBool::new(false));
        let customizer = HangingCustomizer {
            dropped: Arc::clone(&dropped),
        };

        let result = customizer
            .customize("resume", &job("Backend engineer role"), Duration::from_millis(500))
            .await;

        assert_eq!(result, Err(CustomizeError::Timeout(Duration::from_millis(500))));
        assert!(dropped.load(Ordering::SeqCst), "in-flight call must be dropped");
    }

    #[tokio::test]
    async fn test_success_within_timeout() {
        let result = Echo
            .customize("resume", &job("Backend engineer role"), Duration::from_secs(1))
            .await;
        assert_eq!(result.unwrap(), "tailored: resume");
    }

    #[tokio::test]
    async fn test_empty_job_description_is_rejected_before_calling() {
        let result = Echo
            .customize("resume", &job("   "), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CustomizeError::Rejected(_))));
    }

    #[test]
    fn test_oversized_job_description_is_rejected() {
        let long = "x".repeat(MAX_JOB_DESCRIPTION_CHARS + 1);
        assert!(matches!(
            validate_job_context(&job(&long)),
            Err(CustomizeError::Rejected(_))
        ));
    }

    #[test]
    fn test_prompt_contains_job_and_resume() {
        let mut context = job("Backend engineer role");
        context.company_name = String::new();
        let prompt = build_customize_prompt("## EXPERIENCE\n- Built APIs", &context);

        assert!(prompt.contains("Title: Backend Engineer"));
        assert!(prompt.contains("Company: (not provided)"));
        assert!(prompt.contains("Backend engineer role"));
        assert!(prompt.contains("- Built APIs"));
        assert!(prompt.contains("Do NOT invent"));
        assert!(!prompt.contains('{'));
    }

    #[test]
    fn test_llm_errors_map_to_retry_classes() {
        let transient: CustomizeError = LlmError::Api {
            status: 503,
            message: "overloaded".to_string(),
        }
        .into();
        let rejected: CustomizeError = LlmError::Api {
            status: 400,
            message: "bad".to_string(),
        }
        .into();
        assert!(matches!(transient, CustomizeError::Transport(_)));
        assert!(matches!(rejected, CustomizeError::Rejected(_)));
    }
}
