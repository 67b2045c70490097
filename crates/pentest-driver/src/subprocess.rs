use crate::TargetChannel;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;

const DEFAULT_SCRIPTS_DIR: &str = "/root/scripts";
const DEFAULT_READY_OBSERVATION: &str =
    "Environment ready. You are root on the attacker machine.";

/// Argv templates for driving the sandbox through local subprocesses.
/// Placeholders `{addr}`, `{cmd}`, `{port}`, `{username}`, `{password}` are
/// substituted per call. The defaults assume a compose network with a
/// `kali_master` attacker container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub start: Option<Vec<String>>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    pub exec: Vec<String>,
    pub shell: Vec<String>,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
}

fn default_scripts_dir() -> String {
    DEFAULT_SCRIPTS_DIR.to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            start: Some(
                ["docker", "compose", "up", "-d", "--wait"]
                    .map(String::from)
                    .to_vec(),
            ),
            stop: Some(["docker", "compose", "down"].map(String::from).to_vec()),
            exec: ["docker", "exec", "kali_master", "sh", "-c", "{cmd}"]
                .map(String::from)
                .to_vec(),
            shell: [
                "docker",
                "exec",
                "kali_master",
                "sshpass",
                "-p",
                "{password}",
                "ssh",
                "-o",
                "StrictHostKeyChecking=no",
                "-p",
                "{port}",
                "{username}@{addr}",
                "echo connected",
            ]
            .map(String::from)
            .to_vec(),
            scripts_dir: default_scripts_dir(),
        }
    }
}

/// Channel that shells out for every environment effect. Stdout and stderr
/// are merged into the observation so the agent sees tool errors verbatim.
pub struct SubprocessChannel {
    config: ChannelConfig,
    stopped: Mutex<bool>,
}

impl SubprocessChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            stopped: Mutex::new(false),
        }
    }

    fn run(&self, argv: &[String], stdin: Option<&str>) -> Result<String> {
        let program = argv
            .first()
            .ok_or_else(|| anyhow!("empty channel command template"))?;
        let mut cmd = Command::new(program);
        cmd.args(&argv[1..]);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;
        if let Some(input) = stdin {
            child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("child stdin unavailable"))?
                .write_all(input.as_bytes())
                .context("failed to feed child stdin")?;
        }
        let output = child.wait_with_output()?;
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }
        Ok(text)
    }
}

fn apply(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|part| {
            let mut out = part.clone();
            for (name, value) in vars {
                out = out.replace(&format!("{{{}}}", name), value);
            }
            out
        })
        .collect()
}

impl TargetChannel for SubprocessChannel {
    fn start(&self) -> Result<String> {
        *self.stopped.lock().unwrap() = false;
        if let Some(start) = &self.config.start {
            self.run(start, None).context("environment start failed")?;
        }
        Ok(DEFAULT_READY_OBSERVATION.to_string())
    }

    fn exec(&self, machine_addr: &str, command: &str) -> Result<String> {
        let argv = apply(
            &self.config.exec,
            &[("addr", machine_addr), ("cmd", command)],
        );
        self.run(&argv, None)
    }

    fn open_shell(
        &self,
        addr: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<String> {
        let port = port.to_string();
        let argv = apply(
            &self.config.shell,
            &[
                ("addr", addr),
                ("port", port.as_str()),
                ("username", username),
                ("password", password),
            ],
        );
        self.run(&argv, None)
    }

    fn put_file(&self, file_name: &str, content: &str) -> Result<String> {
        let path = format!("{}/{}", self.config.scripts_dir.trim_end_matches('/'), file_name);
        let write_cmd = format!(
            "mkdir -p '{}' && cat > '{}'",
            self.config.scripts_dir.trim_end_matches('/'),
            path
        );
        let argv = apply(&self.config.exec, &[("addr", ""), ("cmd", write_cmd.as_str())]);
        self.run(&argv, Some(content))?;
        Ok(format!("File {} saved in {}", file_name, path))
    }

    fn stop(&self) -> Result<()> {
        let mut stopped = self.stopped.lock().unwrap();
        if *stopped {
            return Ok(());
        }
        if let Some(stop) = &self.config.stop {
            self.run(stop, None).context("environment stop failed")?;
        }
        *stopped = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pentest_channel_{}_{}", label, nanos));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn local_config(scripts_dir: &str) -> ChannelConfig {
        ChannelConfig {
            start: None,
            stop: None,
            exec: ["sh", "-c", "{cmd}"].map(String::from).to_vec(),
            shell: ["sh", "-c", "echo shell {username}@{addr}:{port}"]
                .map(String::from)
                .to_vec(),
            scripts_dir: scripts_dir.to_string(),
        }
    }

    #[test]
    fn exec_merges_stdout_and_stderr() {
        let channel = SubprocessChannel::new(local_config("/tmp"));
        let out = channel
            .exec("192.168.0.5", "echo out; echo err 1>&2")
            .expect("exec");
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[test]
    fn placeholders_are_substituted_per_call() {
        let channel = SubprocessChannel::new(local_config("/tmp"));
        let out = channel
            .open_shell("10.10.0.3", 2222, "student", "secret")
            .expect("shell");
        assert_eq!(out.trim(), "shell student@10.10.0.3:2222");
    }

    #[test]
    fn put_file_writes_through_stdin() {
        let dir = temp_dir("put_file");
        let channel = SubprocessChannel::new(local_config(dir.to_str().unwrap()));
        let observation = channel
            .put_file("exploit.py", "print('payload')\n")
            .expect("put_file");
        assert!(observation.contains("exploit.py"));
        let written = fs::read_to_string(dir.join("exploit.py")).expect("read back");
        assert_eq!(written, "print('payload')\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = temp_dir("stop");
        let marker = dir.join("stopped");
        let config = ChannelConfig {
            start: None,
            stop: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo once >> '{}'", marker.display()),
            ]),
            exec: ["sh", "-c", "{cmd}"].map(String::from).to_vec(),
            shell: ["sh", "-c", "true"].map(String::from).to_vec(),
            scripts_dir: "/tmp".to_string(),
        };
        let channel = SubprocessChannel::new(config);
        channel.stop().expect("first stop");
        channel.stop().expect("second stop");
        let lines = fs::read_to_string(&marker).expect("marker").lines().count();
        assert_eq!(lines, 1, "stop command must run once");
        let _ = fs::remove_dir_all(dir);
    }
}
