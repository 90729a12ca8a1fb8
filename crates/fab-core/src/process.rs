use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Execute a program and capture stdout/stderr.
///
/// When `timeout` is set, the child is killed on expiry and an error is
/// returned.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned, the I/O streams
/// cannot be read entirely, or the deadline expires.
pub fn run_command(
    program: &Path,
    args: &[String],
    stdin: Option<&str>,
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let program_name = program.display().to_string();
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program_name}"))?;

    let stdin_handle = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_string();
            Some(thread::spawn(move || {
                // A closed pipe just means the child never read its input.
                let _ = pipe.write_all(input.as_bytes());
            }))
        }
        _ => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout missing for {program_name}"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr missing for {program_name}"))?;
    let stdout_handle = thread::spawn(move || read_to_string_lossy(stdout));
    let stderr_handle = thread::spawn(move || read_to_string_lossy(stderr));

    let deadline = timeout.map(|limit| Instant::now() + limit);
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed to wait for {program_name}"))?
        {
            break status;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "{program_name} timed out after {:?}",
                    timeout.unwrap_or_default()
                ));
            }
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let stdout = stdout_handle
        .join()
        .map_err(|_| anyhow!("stdout thread panicked"))?;
    let stderr = stderr_handle
        .join()
        .map_err(|_| anyhow!("stderr thread panicked"))?;

    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        stdout,
        stderr,
    })
}

fn read_to_string_lossy(mut reader: impl Read) -> String {
    let mut buffer = Vec::new();
    let _ = reader.read_to_end(&mut buffer);
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() -> Result<()> {
        let output = run_command(
            Path::new("sh"),
            &["-c".to_string(), "echo hello".to_string()],
            None,
            None,
            None,
        )?;
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        Ok(())
    }

    #[test]
    fn feeds_stdin() -> Result<()> {
        let output = run_command(
            Path::new("sh"),
            &["-c".to_string(), "cat".to_string()],
            Some("payload"),
            None,
            None,
        )?;
        assert_eq!(output.stdout, "payload");
        Ok(())
    }

    #[test]
    fn kills_on_deadline() {
        let result = run_command(
            Path::new("sh"),
            &["-c".to_string(), "sleep 5".to_string()],
            None,
            None,
            Some(Duration::from_millis(100)),
        );
        assert!(result.is_err());
    }
}
