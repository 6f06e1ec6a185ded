//! Local agents: the policy a skeleton consults when the store has no verdict
//!
//! Deciding is total. Whatever goes wrong inside a policy is logged and
//! collapses to `Denied`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use trustd_core::ProcessInfo;

use crate::config::{LocalAgentKind, PromptConfig};
use crate::request::{Answer, TrustRequest};

/// A decision policy
#[async_trait]
pub trait LocalAgent: Send + Sync {
    async fn decide(&self, request: &TrustRequest) -> Answer;

    fn kind(&self) -> LocalAgentKind;
}

/// Build the agent selected on the command line
pub fn from_config(kind: LocalAgentKind, service: &str, prompt: &PromptConfig) -> Result<Box<dyn LocalAgent>> {
    Ok(match kind {
        LocalAgentKind::AlwaysDeny => Box::new(AlwaysDeny),
        LocalAgentKind::AlwaysGrant => Box::new(AlwaysGrant),
        LocalAgentKind::Interactive => Box::new(Interactive::new(service, prompt)?),
    })
}

pub struct AlwaysDeny;

#[async_trait]
impl LocalAgent for AlwaysDeny {
    async fn decide(&self, _request: &TrustRequest) -> Answer {
        Answer::Denied
    }

    fn kind(&self) -> LocalAgentKind {
        LocalAgentKind::AlwaysDeny
    }
}

pub struct AlwaysGrant;

#[async_trait]
impl LocalAgent for AlwaysGrant {
    async fn decide(&self, _request: &TrustRequest) -> Answer {
        Answer::Granted
    }

    fn kind(&self) -> LocalAgentKind {
        LocalAgentKind::AlwaysGrant
    }
}

/// Asks a human through an external prompt command.
///
/// The command sees the request in its environment:
/// - `TRUSTD_SERVICE`, `TRUSTD_PID`, `TRUSTD_UID`, `TRUSTD_FEATURE`
/// - `TRUSTD_APPLICATION`: the requesting process, described
///
/// Exit status 0 grants. Any other status, a failure to start, or no
/// answer within the prompt timeout denies.
pub struct Interactive {
    service: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Interactive {
    pub fn new(service: &str, prompt: &PromptConfig) -> Result<Self> {
        let Some((program, args)) = prompt.command.split_first() else {
            bail!("The interactive agent needs a prompt command (--prompt-command or prompt.command)");
        };

        Ok(Self {
            service: service.to_string(),
            program: program.clone(),
            args: args.to_vec(),
            timeout: prompt.timeout(),
        })
    }

    async fn prompt(&self, request: &TrustRequest) -> std::io::Result<Option<std::process::ExitStatus>> {
        let application = ProcessInfo::describe(request.pid);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TRUSTD_SERVICE", &self.service)
            .env("TRUSTD_PID", request.pid.to_string())
            .env("TRUSTD_UID", request.uid.to_string())
            .env("TRUSTD_FEATURE", request.feature.to_string())
            .env("TRUSTD_APPLICATION", &application)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                let _ = child.kill().await;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl LocalAgent for Interactive {
    async fn decide(&self, request: &TrustRequest) -> Answer {
        debug!("Prompting {} for {}", self.program, request);

        match self.prompt(request).await {
            Ok(Some(status)) if status.success() => Answer::Granted,
            Ok(Some(status)) => {
                info!("Prompt declined {} ({})", request, status);
                Answer::Denied
            }
            Ok(None) => {
                warn!("Prompt for {} timed out after {:?}", request, self.timeout);
                Answer::Denied
            }
            Err(e) => {
                warn!("Failed to run prompt command {}: {}", self.program, e);
                Answer::Denied
            }
        }
    }

    fn kind(&self) -> LocalAgentKind {
        LocalAgentKind::Interactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(command: &[&str], timeout_ms: u64) -> PromptConfig {
        PromptConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_fixed_policies() {
        let request = TrustRequest::new(1, 1000, 0);
        assert_eq!(AlwaysDeny.decide(&request).await, Answer::Denied);
        assert_eq!(AlwaysGrant.decide(&request).await, Answer::Granted);
    }

    #[test]
    fn test_interactive_requires_command() {
        let err = from_config(LocalAgentKind::Interactive, "camera", &PromptConfig::default()).err();
        assert!(err.is_some());

        let agent = from_config(LocalAgentKind::AlwaysDeny, "camera", &PromptConfig::default()).unwrap();
        assert_eq!(agent.kind(), LocalAgentKind::AlwaysDeny);
    }

    #[tokio::test]
    async fn test_exit_status_decides() {
        let request = TrustRequest::new(std::process::id(), 1000, 3);

        let agent = Interactive::new("camera", &prompt(&["true"], 5_000)).unwrap();
        assert_eq!(agent.decide(&request).await, Answer::Granted);

        let agent = Interactive::new("camera", &prompt(&["false"], 5_000)).unwrap();
        assert_eq!(agent.decide(&request).await, Answer::Denied);
    }

    #[tokio::test]
    async fn test_request_is_in_environment() {
        let script = r#"test "$TRUSTD_SERVICE" = camera && test "$TRUSTD_UID" = 1000 && test "$TRUSTD_FEATURE" = 7 && test -n "$TRUSTD_APPLICATION""#;
        let agent = Interactive::new("camera", &prompt(&["sh", "-c", script], 5_000)).unwrap();

        assert_eq!(
            agent.decide(&TrustRequest::new(std::process::id(), 1000, 7)).await,
            Answer::Granted
        );
        assert_eq!(
            agent.decide(&TrustRequest::new(std::process::id(), 1000, 8)).await,
            Answer::Denied
        );
    }

    #[tokio::test]
    async fn test_unanswered_prompt_denies() {
        let agent = Interactive::new("camera", &prompt(&["sleep", "10"], 100)).unwrap();
        let started = std::time::Instant::now();

        assert_eq!(agent.decide(&TrustRequest::new(1, 1000, 0)).await, Answer::Denied);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_prompt_binary_denies() {
        let agent = Interactive::new("camera", &prompt(&["/nonexistent/trustd-prompt"], 1_000)).unwrap();
        assert_eq!(agent.decide(&TrustRequest::new(1, 1000, 0)).await, Answer::Denied);
    }
}
