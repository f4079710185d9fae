//! Dependent runtime service that may hold handles on shared files. The
//! launcher only ever asks it to stop before an update and to start again if
//! the hand-off fails.

use crate::error::{DlcError, Result};
use async_trait::async_trait;
use tracing::{info, warn};

#[async_trait]
pub trait RuntimeService: Send + Sync {
    fn name(&self) -> &str;

    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;
}

/// Service controlled through external commands (`docker stop ...`,
/// `sc stop ...`). A missing start command makes `start` a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandService {
    name: String,
    stop: Vec<String>,
    start: Option<Vec<String>>,
}

impl CommandService {
    pub fn new(name: impl Into<String>, stop: Vec<String>, start: Option<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            stop,
            start,
        }
    }

    async fn run(&self, argv: &[String]) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| DlcError::io(program, e))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(service = %self.name, program = %program, status = %output.status, stderr = %stderr.trim(), "service command failed");
            Err(DlcError::Service(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl RuntimeService for CommandService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) -> Result<()> {
        info!(service = %self.name, "stopping runtime service");
        self.run(&self.stop).await
    }

    async fn start(&self) -> Result<()> {
        match &self.start {
            Some(argv) => {
                info!(service = %self.name, "starting runtime service");
                self.run(argv).await
            }
            None => Ok(()),
        }
    }
}
