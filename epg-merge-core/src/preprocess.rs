//! Pre-fetch stages: external commands that refresh local guide files before the
//! fetch phase (e.g. a generator writing `dummy.xml`). A stage failure is logged
//! and the run carries on with whatever files are on disk.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::StageConfig;
use crate::contract::{Stage, StageError};

/// Runs one program to completion and relays its output into the log: stdout
/// lines at info, stderr lines at warn.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandStage {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl From<&StageConfig> for CommandStage {
    fn from(config: &StageConfig) -> Self {
        let stage = CommandStage::new(&config.name, &config.program).with_args(&config.args);
        match &config.working_dir {
            Some(dir) => stage.with_working_dir(dir),
            None => stage,
        }
    }
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<(), StageError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        info!(stage = %self.name, program = %self.program, args = ?self.args, "[STAGE] Running");
        let output = command.output().await.map_err(|source| StageError::Launch {
            stage: self.name.clone(),
            source,
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            info!(stage = %self.name, "[STAGE] STDOUT: {line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            warn!(stage = %self.name, "[STAGE] STDERR: {line}");
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(StageError::Exit {
                stage: self.name.clone(),
                code: output.status.code(),
            })
        }
    }
}

/// Runs `stages` in order. Failures are logged and do not stop later stages;
/// returns how many succeeded.
pub async fn run_stages(stages: &[Box<dyn Stage>]) -> usize {
    let mut succeeded = 0;
    for stage in stages {
        let name = stage.name();
        match stage.run().await {
            Ok(()) => {
                info!(stage = %name, "[STAGE] Completed");
                succeeded += 1;
            }
            Err(e) => {
                error!(stage = %name, error = %e, "[STAGE] Failed, continuing with existing files");
            }
        }
    }
    succeeded
}
