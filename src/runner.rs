use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stderr if there is any, else stdout, for error messages
    pub fn diagnostics(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// A process invocation.
///
/// Values passed with [`Invocation::secret_env`] reach the child through its
/// environment only and never appear in the logged command line.
pub struct Invocation<'a> {
    program: &'a str,
    args: Vec<String>,
    env: Vec<(&'a str, String)>,
    timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a str) -> Self {
        Self {
            program,
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn secret_env(mut self, name: &'a str, value: &str) -> Self {
        self.env.push((name, value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Run to completion and capture output; a non-zero exit is not an error
    pub fn output(self) -> Result<Output> {
        log::debug!("Running: {}", self.display());

        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &self.env {
            cmd.env(name, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute: {}", self.display()))?;

        // Drain pipes concurrently so a chatty child cannot block on a full pipe
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout = std::thread::spawn(move || drain(stdout));
        let stderr = std::thread::spawn(move || drain(stderr));

        let status = match self.timeout {
            Some(limit) => wait_with_timeout(&mut child, limit)
                .with_context(|| format!("Command timed out: {}", self.display()))?,
            None => child
                .wait()
                .with_context(|| format!("Failed to wait for: {}", self.display()))?,
        };

        let output = Output {
            code: status.code().unwrap_or(-1),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        log::trace!("{} exited with {}", self.program, output.code);
        Ok(output)
    }

    /// Run and return trimmed stdout, failing on a non-zero exit
    pub fn capture(self) -> Result<String> {
        let output = self.output()?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            anyhow::bail!("Command failed: {}", output.diagnostics())
        }
    }
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            // Best effort; the process may have exited in between
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("no exit after {}s", limit.as_secs());
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn drain<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
