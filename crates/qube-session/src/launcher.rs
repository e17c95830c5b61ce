use crate::error::SessionError;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{info, warn};

pub const CONTAINER_PLACEHOLDER: &str = "{container}";
pub const DEFAULT_EVAL_BIN: &str = "qube";

/// Program, arguments and environment used to start an eval process.
///
/// Every occurrence of `{container}` in an argument is replaced with the
/// container id at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// `<program> eval <container>` with a dumb terminal.
    pub fn eval(program: impl Into<String>) -> Self {
        Self::new(program)
            .arg("eval")
            .arg(CONTAINER_PLACEHOLDER)
            .env("TERM", "dumb")
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        self.env.retain(|(existing, _)| *existing != key);
        self.env.push((key, value));
        self
    }

    pub fn resolve_args(&self, container_id: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(CONTAINER_PLACEHOLDER, container_id))
            .collect()
    }
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self::eval(DEFAULT_EVAL_BIN)
    }
}

/// A freshly spawned eval process with its three pipes.
pub struct ProcessHandle {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

#[derive(Debug, Clone, Default)]
pub struct Launcher {
    spec: LaunchSpec,
}

impl Launcher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn launch(&self, container_id: &str) -> Result<ProcessHandle, SessionError> {
        let args = self.spec.resolve_args(container_id);
        let mut command = Command::new(&self.spec.program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|err| {
            warn!(
                event = "process_spawn_failed",
                container = container_id,
                program = %self.spec.program,
                error = %err
            );
            SessionError::Spawn {
                container: container_id.to_string(),
                message: err.to_string(),
            }
        })?;

        let missing = |stream: &str| SessionError::Spawn {
            container: container_id.to_string(),
            message: format!("{stream} was not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let pid = child.id();

        info!(
            event = "process_launched",
            container = container_id,
            program = %self.spec.program,
            pid = pid.unwrap_or_default()
        );

        Ok(ProcessHandle {
            child,
            pid,
            stdin,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn eval_spec_substitutes_container() {
        let spec = LaunchSpec::eval("/usr/local/bin/qube");
        assert_eq!(spec.resolve_args("web-1"), vec!["eval", "web-1"]);
        assert_eq!(spec.env, vec![("TERM".to_string(), "dumb".to_string())]);
    }

    #[test]
    fn placeholder_is_replaced_inside_arguments() {
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("exec nsenter --target-name={container} sh");
        assert_eq!(
            spec.resolve_args("db"),
            vec!["-c", "exec nsenter --target-name=db sh"]
        );
    }

    #[test]
    fn env_overrides_replace_previous_values() {
        let spec = LaunchSpec::eval("qube").env("TERM", "xterm");
        assert_eq!(spec.env, vec![("TERM".to_string(), "xterm".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn launch_wires_all_three_pipes() {
        let launcher = Launcher::new(LaunchSpec::new("cat"));
        let mut handle = launcher.launch("web-1").expect("launch cat");
        assert!(handle.pid.is_some());

        handle.stdin.write_all(b"ping\n").await.expect("write");
        drop(handle.stdin);
        let mut out = String::new();
        handle
            .stdout
            .read_to_string(&mut out)
            .await
            .expect("read stdout");
        assert_eq!(out, "ping\n");
        let status = handle.child.wait().await.expect("wait");
        assert!(status.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_binary_is_a_spawn_error() {
        let launcher = Launcher::new(LaunchSpec::eval("/nonexistent/qube-eval-binary"));
        let err = launcher.launch("web-1").err().expect("spawn should fail");
        match err {
            SessionError::Spawn { container, message } => {
                assert_eq!(container, "web-1");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
