use crate::sink::{EventRow, EventSink};
use chrono::Utc;
use pentest_driver::{PentestDriver, Tool};
use pentest_evaluator::Evaluator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const STATUS_CONTINUE: u8 = 0;
pub const STATUS_TERMINAL: u8 = 1;

/// An action as emitted by the external controller. The four tool kinds are
/// dispatched to the driver; anything else is handed back for the
/// controller's own default handling.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    Tool(Tool),
    Unhandled { kind: String, payload: Value },
}

impl AgentAction {
    /// Decode a controller action object by its `kind` tag.
    pub fn from_value(value: &Value) -> Self {
        if let Ok(tool) = serde_json::from_value::<Tool>(value.clone()) {
            return Self::Tool(tool);
        }
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Self::Unhandled {
            kind,
            payload: value.clone(),
        }
    }
}

/// What the controller gets back for a dispatched tool: the command echo,
/// the observation body and a binary status (0 continue, 1 terminal).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepObservation {
    pub command: String,
    pub content: String,
    pub status_code: u8,
}

pub enum BridgeOutcome {
    Handled(StepObservation),
    Unhandled(AgentAction),
}

/// Turns controller actions into environment effects. Owns the driver and
/// the evaluator for one episode; the sticky done flag and the dispatch
/// counter are shared with the harness through atomics.
pub struct ToolBridge {
    driver: PentestDriver,
    evaluator: Option<Evaluator>,
    sink: Box<dyn EventSink>,
    done: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    dispatched: Arc<AtomicU64>,
    seq: u64,
}

impl ToolBridge {
    pub fn new(
        driver: PentestDriver,
        evaluator: Option<Evaluator>,
        sink: Box<dyn EventSink>,
        done: Arc<AtomicBool>,
        cancelled: Arc<AtomicBool>,
        dispatched: Arc<AtomicU64>,
    ) -> Self {
        Self {
            driver,
            evaluator,
            sink,
            done,
            cancelled,
            dispatched,
            seq: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn status(&self) -> u8 {
        if self.is_done() {
            STATUS_TERMINAL
        } else {
            STATUS_CONTINUE
        }
    }

    fn record_event(&mut self, kind: &str, command: &str, observation: &str, status_code: u8) {
        let row = EventRow {
            seq: self.seq,
            ts: Utc::now().to_rfc3339(),
            action_kind: kind.to_string(),
            command: command.to_string(),
            observation: observation.to_string(),
            status_code,
            done: self.is_done(),
        };
        self.seq += 1;
        if let Err(err) = self.sink.append(&row) {
            tracing::warn!("failed to append event row: {:#}", err);
        }
    }

    pub fn dispatch(&mut self, action: AgentAction) -> BridgeOutcome {
        let tool = match action {
            AgentAction::Tool(tool) => tool,
            other @ AgentAction::Unhandled { .. } => return BridgeOutcome::Unhandled(other),
        };
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let command = tool.describe();

        if self.cancelled.load(Ordering::SeqCst) {
            let observation = StepObservation {
                command,
                content: "episode cancelled: deadline exceeded".to_string(),
                status_code: STATUS_TERMINAL,
            };
            self.record_event(tool.kind(), &observation.command, &observation.content, STATUS_TERMINAL);
            return BridgeOutcome::Handled(observation);
        }

        let observation = match self.driver.step(&tool) {
            Ok((text, done)) => {
                if done {
                    self.done.store(true, Ordering::SeqCst);
                }
                if let Some(evaluator) = &self.evaluator {
                    let step_text = format!("Action:{}\nObservation: {}", tool, text);
                    evaluator.evaluate_step(&step_text);
                }
                StepObservation {
                    command,
                    content: text,
                    status_code: self.status(),
                }
            }
            Err(err) => StepObservation {
                command,
                content: format!("Error executing {}: {}", tool.kind(), err),
                status_code: self.status(),
            },
        };
        self.record_event(
            tool.kind(),
            &observation.command,
            &observation.content,
            observation.status_code,
        );
        BridgeOutcome::Handled(observation)
    }
}
