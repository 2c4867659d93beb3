use devhost_core::DevhostError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Timeout classes for external tool invocations. Every subprocess the
/// integrator starts goes through one of these; nothing runs unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutBucket {
    /// Version probes and other instant commands.
    Quick,
    /// Driver config validators.
    Validate,
    /// Reload commands.
    Standard,
    /// Slow one-shot operations.
    Long,
    /// Tunnel provider startup.
    Tunnel,
}

impl TimeoutBucket {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(match self {
            TimeoutBucket::Quick => 5,
            TimeoutBucket::Validate => 10,
            TimeoutBucket::Standard => 30,
            TimeoutBucket::Long => 60,
            TimeoutBucket::Tunnel => 120,
        })
    }
}

/// Captured result of a finished external command.
#[derive(Debug)]
pub struct ExternalOutcome {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExternalOutcome {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The most useful line to show an operator when the tool failed.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit status {}", self.status)
        } else {
            stderr.lines().last().unwrap_or(stderr).to_string()
        }
    }
}

/// Run `argv` with the bucket's timeout. The child is killed if the caller
/// gives up or the timeout fires.
pub async fn run_command(
    argv: &[String],
    bucket: TimeoutBucket,
) -> Result<ExternalOutcome, DevhostError> {
    let [program, args @ ..] = argv else {
        return Err(DevhostError::Validation("empty external command".into()));
    };
    debug!(command = %argv.join(" "), timeout = ?bucket.duration(), "Running external tool");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(bucket.duration(), cmd.output()).await {
        Ok(Ok(output)) => Ok(ExternalOutcome {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(DevhostError::ExternalTool(format!("{program}: {e}"))),
        Err(_) => Err(DevhostError::ExternalTool(format!(
            "{program} timed out after {:?}",
            bucket.duration()
        ))),
    }
}

/// Run an operator-supplied shell command line (reload commands).
pub async fn run_shell(
    command: &str,
    bucket: TimeoutBucket,
) -> Result<ExternalOutcome, DevhostError> {
    let argv = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ];
    run_command(&argv, bucket).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_durations() {
        assert_eq!(TimeoutBucket::Quick.duration().as_secs(), 5);
        assert_eq!(TimeoutBucket::Validate.duration().as_secs(), 10);
        assert_eq!(TimeoutBucket::Standard.duration().as_secs(), 30);
        assert_eq!(TimeoutBucket::Long.duration().as_secs(), 60);
        assert_eq!(TimeoutBucket::Tunnel.duration().as_secs(), 120);
    }

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let out = run_shell("echo hello; exit 0", TimeoutBucket::Quick)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let out = run_shell("echo oops >&2; exit 3", TimeoutBucket::Quick)
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.status, 3);
        assert_eq!(out.failure_detail(), "oops");
    }

    #[tokio::test]
    async fn missing_binary_is_an_external_tool_error() {
        let argv = vec!["devhost-test-no-such-binary".to_string()];
        assert!(matches!(
            run_command(&argv, TimeoutBucket::Quick).await,
            Err(DevhostError::ExternalTool(_))
        ));
    }

    #[tokio::test]
    async fn empty_command_is_a_validation_error() {
        assert!(matches!(
            run_command(&[], TimeoutBucket::Quick).await,
            Err(DevhostError::Validation(_))
        ));
    }
}
