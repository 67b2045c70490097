use crate::bridge::{AgentAction, BridgeOutcome, ToolBridge, STATUS_CONTINUE, STATUS_TERMINAL};
use crate::{AgentController, ControllerRun, TokenUsage};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Controller adapter that drives an external agent process over JSON lines.
/// The harness sends one instruction object, then answers each action line
/// with an observation object until the episode turns terminal or the step
/// budget is spent. An interleaved `{"type":"stats", ...}` line (sent before
/// the final action) lets the agent report cost and token usage.
pub struct ProcessController {
    command: Vec<String>,
    max_iterations: usize,
}

impl ProcessController {
    pub fn new(command: Vec<String>, max_iterations: usize) -> Self {
        Self {
            command,
            max_iterations,
        }
    }
}

impl AgentController for ProcessController {
    fn run(&mut self, instruction: &str, bridge: &mut ToolBridge) -> Result<ControllerRun> {
        let program = self
            .command
            .first()
            .ok_or_else(|| anyhow!("empty agent command"))?;
        let mut child = Command::new(program)
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn agent {}", program))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("agent stdin unavailable"))?;
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("agent stdout unavailable"))?,
        );

        let hello = json!({"type": "instruction", "content": instruction});
        if let Err(err) = writeln!(stdin, "{}", hello) {
            tracing::warn!("could not deliver instruction to agent: {:#}", err);
        }

        let mut iterations = 0u64;
        let mut final_state = "finished".to_string();
        let mut accumulated_cost = 0.0;
        let mut token_usage = TokenUsage::default();

        for line in stdout.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!("agent emitted a non-JSON line, ignoring: {:#}", err);
                    continue;
                }
            };
            if value.get("type").and_then(Value::as_str) == Some("stats") {
                accumulated_cost = value
                    .get("accumulated_cost")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                token_usage.model = value
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                token_usage.prompt_tokens = value
                    .get("prompt_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                token_usage.completion_tokens = value
                    .get("completion_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                token_usage.total_tokens =
                    token_usage.prompt_tokens + token_usage.completion_tokens;
                continue;
            }

            iterations += 1;
            let (reply, terminal) = match bridge.dispatch(AgentAction::from_value(&value)) {
                BridgeOutcome::Handled(obs) => {
                    let terminal = obs.status_code == STATUS_TERMINAL;
                    (
                        json!({
                            "type": "observation",
                            "command": obs.command,
                            "content": obs.content,
                            "status_code": obs.status_code,
                        }),
                        terminal,
                    )
                }
                BridgeOutcome::Unhandled(action) => {
                    let kind = match &action {
                        AgentAction::Unhandled { kind, .. } => kind.clone(),
                        AgentAction::Tool(tool) => tool.kind().to_string(),
                    };
                    (
                        json!({
                            "type": "observation",
                            "command": kind,
                            "content": format!("action kind '{}' is not handled here", kind),
                            "status_code": STATUS_CONTINUE,
                        }),
                        false,
                    )
                }
            };
            if let Err(err) = writeln!(stdin, "{}", reply) {
                tracing::warn!("agent stopped reading observations: {:#}", err);
            }
            if terminal {
                break;
            }
            if iterations >= self.max_iterations as u64 {
                final_state = "max_iterations".to_string();
                break;
            }
        }

        drop(stdin);
        let _ = child.kill();
        let _ = child.wait();
        Ok(ControllerRun {
            iterations,
            final_state,
            accumulated_cost,
            token_usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullEventSink;
    use pentest_core::catalog::TaskInstance;
    use pentest_driver::{PentestDriver, TargetChannel};
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::Arc;

    struct EchoChannel;

    impl TargetChannel for EchoChannel {
        fn start(&self) -> Result<String> {
            Ok("ready".to_string())
        }

        fn exec(&self, _machine_addr: &str, command: &str) -> Result<String> {
            Ok(format!("ran: {}", command))
        }

        fn open_shell(
            &self,
            _addr: &str,
            _port: u16,
            _username: &str,
            _password: &str,
        ) -> Result<String> {
            Ok("shell".to_string())
        }

        fn put_file(&self, file_name: &str, _content: &str) -> Result<String> {
            Ok(format!("wrote {}", file_name))
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_bridge() -> ToolBridge {
        let instance = TaskInstance {
            task: "capture the flag".to_string(),
            flag: "flag{0123456789}".to_string(),
            target: "vm0".to_string(),
        };
        let mut driver = PentestDriver::new(instance, Arc::new(EchoChannel));
        driver.reset().expect("reset");
        ToolBridge::new(
            driver,
            None,
            Box::new(NullEventSink),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
        )
    }

    #[test]
    fn scripted_agent_process_drives_the_bridge_to_terminal() {
        let script = concat!(
            r#"printf '%s\n' "#,
            r#"'{"type":"stats","accumulated_cost":0.5,"model":"m","prompt_tokens":10,"completion_tokens":5}' "#,
            r#"'{"kind":"execute_command","machine_addr":"192.168.0.5","command":"id"}' "#,
            r#"'{"kind":"submit_flag","flag":"flag{0123456789}"}'"#,
        );
        let mut controller = ProcessController::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            30,
        );
        let mut bridge = test_bridge();
        let run = controller
            .run("instruction", &mut bridge)
            .expect("agent run");
        assert_eq!(run.iterations, 2);
        assert_eq!(run.final_state, "finished");
        assert!((run.accumulated_cost - 0.5).abs() < 1e-9);
        assert_eq!(run.token_usage.total_tokens, 15);
        assert!(bridge.is_done());
    }

    #[test]
    fn non_json_agent_output_is_ignored() {
        let script = concat!(
            r#"printf '%s\n' "#,
            r#"'starting up...' "#,
            r#"'{"kind":"submit_flag","flag":"flag{wrong-answer}"}'"#,
        );
        let mut controller = ProcessController::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            30,
        );
        let mut bridge = test_bridge();
        let run = controller
            .run("instruction", &mut bridge)
            .expect("agent run");
        assert_eq!(run.iterations, 1);
        assert!(!bridge.is_done());
    }
}

