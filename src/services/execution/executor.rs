//! Resilient Executor
//!
//! Drives one chunk through bounded attempts against the primary target,
//! then escalates across fallback targets in priority order.
//!
//! Each attempt is folded into an [`AttemptResult`]:
//! - `Ok`: the output passed every validator (possibly after a repair)
//! - `Retry`: empty output, validation failure or transient error; the next
//!   attempt re-sends the original request plus a correction naming the
//!   failed rule (the rejected answer is never echoed back)
//! - `Fatal`: the target rejected the request; move to the next target
//!
//! The executor never returns an error: every failure ends up in
//! [`ChunkExecutionOutcome::Failed`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use story_pipeline_llm::{LlmRequestOptions, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::{AttemptRecord, ExecutionLog, FailureClass, FallbackChain, GenerationTarget};
use super::validators::{ValidationReport, ValidatorSet};
use crate::models::attempt::{Attempt, AttemptResult};
use crate::models::settings::ExecutorSettings;

/// Attempt budgets and backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorPolicy {
    pub max_attempts_primary: u32,
    pub max_attempts_fallback: u32,
    /// Delay before retrying a transient failure is `backoff_base × attempt`
    pub backoff_base_ms: u64,
    /// Run one best-effort diagnostic call after terminal failure
    pub capture_diagnostics: bool,
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorPolicy {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            max_attempts_primary: settings.max_attempts_primary,
            max_attempts_fallback: settings.max_attempts_fallback,
            backoff_base_ms: settings.backoff_base_ms,
            capture_diagnostics: settings.capture_diagnostics,
        }
    }
}

impl ExecutorPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(attempt as u64))
    }
}

/// The request sent for one chunk
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Chunk index, for logs
    pub chunk: usize,
    pub system: Option<String>,
    /// Conversation to send on every attempt
    pub messages: Vec<Message>,
    /// Text the validators compare the output against
    pub input_text: String,
    pub options: LlmRequestOptions,
}

impl GenerationRequest {
    pub fn new(chunk: usize, input_text: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            chunk,
            system: None,
            messages: vec![Message::user(prompt)],
            input_text: input_text.into(),
            options: LlmRequestOptions::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_options(mut self, options: LlmRequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Original conversation, plus the correction from the last failure
    fn conversation(&self, correction: Option<&Correction>) -> Vec<Message> {
        let mut messages = self.messages.clone();
        if let Some(correction) = correction {
            messages.push(Message::user(format!(
                "Correction required ({}): {}",
                correction.rule, correction.instruction
            )));
        }
        messages
    }
}

#[derive(Debug, Clone)]
struct Correction {
    rule: String,
    instruction: String,
}

/// Terminal result for one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkExecutionOutcome {
    Succeeded {
        output: String,
        attempt: Attempt,
        /// Notes from validators that repaired the output
        repairs: Vec<String>,
    },
    Failed {
        reason: String,
        attempt: Option<Attempt>,
        /// Best-effort explanation from the primary target
        diagnostic: Option<String>,
    },
    Cancelled,
}

impl ChunkExecutionOutcome {
    pub fn output(&self) -> Option<&str> {
        match self {
            ChunkExecutionOutcome::Succeeded { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Target that produced the accepted output
    pub fn target(&self) -> Option<&str> {
        match self {
            ChunkExecutionOutcome::Succeeded { attempt, .. } => Some(&attempt.target),
            _ => None,
        }
    }

    pub fn used_fallback(&self) -> bool {
        matches!(self, ChunkExecutionOutcome::Succeeded { attempt, .. } if attempt.used_fallback)
    }
}

/// Outcome plus the full attempt log
#[derive(Debug, Clone)]
pub struct ChunkExecution {
    pub outcome: ChunkExecutionOutcome,
    pub log: ExecutionLog,
}

enum TargetResult {
    Accepted {
        output: String,
        attempt: Attempt,
        repairs: Vec<String>,
    },
    Exhausted {
        reason: String,
        attempt: Attempt,
    },
    Cancelled,
}

/// Retry-then-fallback executor
#[derive(Debug, Clone, Default)]
pub struct ResilientExecutor {
    policy: ExecutorPolicy,
}

impl ResilientExecutor {
    pub fn new(policy: ExecutorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ExecutorPolicy {
        &self.policy
    }

    /// Run one chunk to a terminal outcome.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        chain: &FallbackChain,
        validators: &ValidatorSet,
        cancel: &CancellationToken,
    ) -> ChunkExecution {
        let mut log = ExecutionLog::new();

        if request.input_text.trim().is_empty() {
            return ChunkExecution {
                outcome: ChunkExecutionOutcome::Failed {
                    reason: "chunk input is empty".to_string(),
                    attempt: None,
                    diagnostic: None,
                },
                log,
            };
        }

        let mut last_failure: Option<(String, Attempt)> = None;

        for (idx, target) in chain.all_targets().iter().enumerate() {
            let used_fallback = idx > 0;
            let budget = if used_fallback {
                self.policy.max_attempts_fallback
            } else {
                self.policy.max_attempts_primary
            };

            if used_fallback {
                info!(
                    chunk = request.chunk,
                    target = %target.name,
                    "escalating to fallback target"
                );
            }

            match self
                .run_target(request, target, used_fallback, budget, validators, cancel, &mut log)
                .await
            {
                TargetResult::Accepted {
                    output,
                    attempt,
                    repairs,
                } => {
                    info!(
                        chunk = request.chunk,
                        target = %target.name,
                        attempt = attempt.number,
                        used_fallback,
                        "chunk output accepted"
                    );
                    return ChunkExecution {
                        outcome: ChunkExecutionOutcome::Succeeded {
                            output,
                            attempt,
                            repairs,
                        },
                        log,
                    };
                }
                TargetResult::Exhausted { reason, attempt } => {
                    warn!(
                        chunk = request.chunk,
                        target = %target.name,
                        reason = %reason,
                        "target exhausted"
                    );
                    last_failure = Some((reason, attempt));
                }
                TargetResult::Cancelled => {
                    return ChunkExecution {
                        outcome: ChunkExecutionOutcome::Cancelled,
                        log,
                    };
                }
            }
        }

        let (reason, attempt) = match last_failure {
            Some((reason, attempt)) => (reason, Some(attempt)),
            None => ("no attempts were made".to_string(), None),
        };
        let diagnostic = if self.policy.capture_diagnostics {
            self.diagnose(request, chain.primary(), &reason, cancel).await
        } else {
            None
        };

        ChunkExecution {
            outcome: ChunkExecutionOutcome::Failed {
                reason,
                attempt,
                diagnostic,
            },
            log,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_target(
        &self,
        request: &GenerationRequest,
        target: &GenerationTarget,
        used_fallback: bool,
        budget: u32,
        validators: &ValidatorSet,
        cancel: &CancellationToken,
        log: &mut ExecutionLog,
    ) -> TargetResult {
        let mut correction: Option<Correction> = None;
        let mut last = Attempt {
            number: 0,
            text: String::new(),
            failure_reason: None,
            used_fallback,
            target: target.name.clone(),
        };

        for number in 1..=budget {
            if cancel.is_cancelled() {
                return TargetResult::Cancelled;
            }

            let started = Instant::now();
            debug!(
                chunk = request.chunk,
                target = %target.name,
                attempt = number,
                corrected = correction.is_some(),
                "sending generation request"
            );

            let call = target.provider.send_message(
                request.conversation(correction.as_ref()),
                request.system.clone(),
                request.options.clone(),
            );
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    log.add_attempt(AttemptRecord::failure(
                        &target.name,
                        number,
                        FailureClass::Cancelled,
                        "cancelled during generation call",
                        started.elapsed().as_millis() as u64,
                    ));
                    debug!(
                        chunk = request.chunk,
                        target = %target.name,
                        attempt = number,
                        "attempt cancelled"
                    );
                    return TargetResult::Cancelled;
                }
                response = call => response,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (result, class, text, repairs) = match response {
                Ok(response) => {
                    let text = response.text_or_empty().to_string();
                    if text.trim().is_empty() {
                        correction = Some(Correction {
                            rule: "non_empty".to_string(),
                            instruction: "Your previous reply was empty. Return the complete \
                                          result for the text above."
                                .to_string(),
                        });
                        (
                            AttemptResult::Retry("empty output".to_string()),
                            Some(FailureClass::EmptyOutput),
                            text,
                            Vec::new(),
                        )
                    } else {
                        match validators.run(&request.input_text, &text) {
                            ValidationReport::Accepted { output, repairs } => {
                                (AttemptResult::Ok(output.clone()), None, output, repairs)
                            }
                            ValidationReport::Rejected {
                                rule,
                                reason,
                                correction: instruction,
                            } => {
                                let reason = format!("{}: {}", rule, reason);
                                correction = Some(Correction { rule, instruction });
                                (
                                    AttemptResult::Retry(reason),
                                    Some(FailureClass::Validation),
                                    text,
                                    Vec::new(),
                                )
                            }
                        }
                    }
                }
                Err(err) => {
                    let class = FailureClass::from_llm_error(&err);
                    let result = if class.should_retry() {
                        AttemptResult::Retry(err.to_string())
                    } else {
                        AttemptResult::Fatal(err.to_string())
                    };
                    (result, Some(class), String::new(), Vec::new())
                }
            };

            last = Attempt {
                number,
                text,
                failure_reason: result.reason().map(str::to_string),
                used_fallback,
                target: target.name.clone(),
            };

            match result {
                AttemptResult::Ok(output) => {
                    log.add_attempt(AttemptRecord::success(&target.name, number, elapsed_ms));
                    return TargetResult::Accepted {
                        output,
                        attempt: last,
                        repairs,
                    };
                }
                AttemptResult::Retry(reason) => {
                    let class = class.unwrap_or(FailureClass::Validation);
                    log.add_attempt(AttemptRecord::failure(
                        &target.name,
                        number,
                        class,
                        &reason,
                        elapsed_ms,
                    ));
                    warn!(
                        chunk = request.chunk,
                        target = %target.name,
                        attempt = number,
                        class = %class,
                        reason = %reason,
                        "attempt failed"
                    );

                    if class == FailureClass::Transient && number < budget {
                        let delay = self.policy.backoff(number);
                        debug!(delay_ms = delay.as_millis() as u64, "backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return TargetResult::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                AttemptResult::Fatal(reason) => {
                    log.add_attempt(AttemptRecord::failure(
                        &target.name,
                        number,
                        FailureClass::Fatal,
                        &reason,
                        elapsed_ms,
                    ));
                    return TargetResult::Exhausted {
                        reason,
                        attempt: last,
                    };
                }
            }
        }

        let reason = last
            .failure_reason
            .clone()
            .unwrap_or_else(|| "attempt budget exhausted".to_string());
        TargetResult::Exhausted {
            reason,
            attempt: last,
        }
    }

    /// One free-text call explaining the failure. Errors are swallowed.
    async fn diagnose(
        &self,
        request: &GenerationRequest,
        target: &GenerationTarget,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut messages = request.messages.clone();
        messages.push(Message::user(format!(
            "Every attempt to process the text above failed with: {}. \
             In a few sentences, explain what makes this text hard to process.",
            reason
        )));

        let call = target
            .provider
            .send_message(messages, request.system.clone(), request.options.clone());
        let response = tokio::select! {
            _ = cancel.cancelled() => return None,
            response = call => response,
        };

        match response {
            Ok(response) => response.content.filter(|text| !text.trim().is_empty()),
            Err(err) => {
                debug!(chunk = request.chunk, error = %err, "diagnostic call failed");
                None
            }
        }
    }
}
