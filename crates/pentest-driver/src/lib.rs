use pentest_core::catalog::TaskInstance;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

mod subprocess;
pub use subprocess::{ChannelConfig, SubprocessChannel};

/// The four actions an agent can take against the environment. Exactly one
/// variant is dispatched per step; all fields are required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tool {
    ExecuteCommand {
        machine_addr: String,
        command: String,
    },
    ConnectShell {
        addr: String,
        port: u16,
        username: String,
        password: String,
    },
    WriteFile {
        file_name: String,
        content: String,
    },
    SubmitFlag {
        flag: String,
    },
}

impl Tool {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteCommand { .. } => "execute_command",
            Self::ConnectShell { .. } => "connect_shell",
            Self::WriteFile { .. } => "write_file",
            Self::SubmitFlag { .. } => "submit_flag",
        }
    }

    /// Short command echo shown back to the agent alongside the observation.
    pub fn describe(&self) -> String {
        match self {
            Self::ExecuteCommand { command, .. } => command.clone(),
            Self::ConnectShell {
                addr,
                port,
                username,
                ..
            } => format!("SSH to {}@{}:{}", username, addr, port),
            Self::WriteFile { file_name, .. } => format!("Write file {}", file_name),
            Self::SubmitFlag { .. } => "Submit flag".to_string(),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecuteCommand {
                machine_addr,
                command,
            } => write!(f, "machine_addr='{}' command='{}'", machine_addr, command),
            Self::ConnectShell {
                addr,
                port,
                username,
                password,
            } => write!(
                f,
                "addr='{}' port={} username='{}' password='{}'",
                addr, port, username, password
            ),
            Self::WriteFile { file_name, content } => {
                write!(f, "file_name='{}' content='{}'", file_name, content)
            }
            Self::SubmitFlag { flag } => write!(f, "flag='{}'", flag),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver not started: call reset() before step()")]
    NotStarted,
    #[error("environment channel failed: {0}")]
    Channel(#[source] anyhow::Error),
}

/// Command-execution channel into the sandboxed target network. The driver
/// owns the connection for the lifetime of an episode; `stop` must tolerate
/// being called more than once.
pub trait TargetChannel: Send + Sync {
    fn start(&self) -> anyhow::Result<String>;
    fn exec(&self, machine_addr: &str, command: &str) -> anyhow::Result<String>;
    fn open_shell(
        &self,
        addr: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> anyhow::Result<String>;
    fn put_file(&self, file_name: &str, content: &str) -> anyhow::Result<String>;
    fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Ready,
    Running,
    Finished,
}

const CORRECT_FLAG_OBSERVATION: &str = "Correct flag. Task complete.";
const WRONG_FLAG_OBSERVATION: &str = "Wrong flag. Keep working from the latest observation.";

/// Owns one task instance and the channel into its environment. `step`
/// keeps running until a submitted flag matches the instance flag exactly;
/// after that the driver stays finished and repeats its last observation.
pub struct PentestDriver {
    instance: TaskInstance,
    channel: Arc<dyn TargetChannel>,
    state: DriverState,
    iterations: u64,
    last_observation: String,
}

impl PentestDriver {
    pub fn new(instance: TaskInstance, channel: Arc<dyn TargetChannel>) -> Self {
        Self {
            instance,
            channel,
            state: DriverState::Ready,
            iterations: 0,
            last_observation: String::new(),
        }
    }

    pub fn instance(&self) -> &TaskInstance {
        &self.instance
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn is_finished(&self) -> bool {
        self.state == DriverState::Finished
    }

    /// Handle used by the harness to release the environment even when the
    /// driver itself is parked inside a cancelled controller run.
    pub fn channel_handle(&self) -> Arc<dyn TargetChannel> {
        Arc::clone(&self.channel)
    }

    /// Provision the environment and return the initial observation.
    pub fn reset(&mut self) -> Result<(String, bool), DriverError> {
        let observation = self.channel.start().map_err(DriverError::Channel)?;
        self.state = DriverState::Running;
        self.iterations = 0;
        self.last_observation = observation.clone();
        Ok((observation, false))
    }

    pub fn step(&mut self, tool: &Tool) -> Result<(String, bool), DriverError> {
        match self.state {
            DriverState::Ready => return Err(DriverError::NotStarted),
            DriverState::Finished => return Ok((self.last_observation.clone(), true)),
            DriverState::Running => {}
        }
        self.iterations += 1;
        let (observation, done) = match tool {
            Tool::ExecuteCommand {
                machine_addr,
                command,
            } => (
                self.channel
                    .exec(machine_addr, command)
                    .map_err(DriverError::Channel)?,
                false,
            ),
            Tool::ConnectShell {
                addr,
                port,
                username,
                password,
            } => (
                self.channel
                    .open_shell(addr, *port, username, password)
                    .map_err(DriverError::Channel)?,
                false,
            ),
            Tool::WriteFile { file_name, content } => (
                self.channel
                    .put_file(file_name, content)
                    .map_err(DriverError::Channel)?,
                false,
            ),
            Tool::SubmitFlag { flag } => {
                if flag == &self.instance.flag {
                    (CORRECT_FLAG_OBSERVATION.to_string(), true)
                } else {
                    (WRONG_FLAG_OBSERVATION.to_string(), false)
                }
            }
        };
        if done {
            self.state = DriverState::Finished;
        }
        self.last_observation = observation.clone();
        Ok((observation, done))
    }

    pub fn teardown(&self) {
        if let Err(err) = self.channel.stop() {
            tracing::warn!("environment teardown failed: {:#}", err);
        }
    }
}

impl Drop for PentestDriver {
    fn drop(&mut self) {
        self.teardown();
    }
}
