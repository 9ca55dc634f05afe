//! NASM backend.
//!
//! Runs `nasm <source> -O0 -o <output>` as a blocking subprocess with a
//! timeout.

use super::Assembler;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// The NASM assembler.
pub struct Nasm {
    program: PathBuf,
    timeout: Duration,
}

impl Nasm {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            child.kill().context("failed to kill assembler")?;
            child.wait()?;
            bail!("assembler timed out after {:?}", timeout);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

impl Assembler for Nasm {
    fn assemble(&self, source: &Path, output: &Path) -> Result<()> {
        // A stale output would hide a run that produced nothing.
        match std::fs::remove_file(output) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).with_context(|| format!("failed to remove {}", output.display()));
            }
            _ => {}
        }

        tracing::debug!(
            "running {} {} -O0 -o {}",
            self.program.display(),
            source.display(),
            output.display()
        );
        let mut child = Command::new(&self.program)
            .arg(source)
            .arg("-O0")
            .arg("-o")
            .arg(output)
            .spawn()
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        let status = wait_with_timeout(&mut child, self.timeout)?;
        if !status.success() {
            bail!("{} exited with {}", self.program.display(), status);
        }
        if !output.is_file() {
            bail!("assembler did not produce {}", output.display());
        }
        Ok(())
    }
}
