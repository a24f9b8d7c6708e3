//! Reasoning oracle for conflict adjudication.
//!
//! The oracle is consulted **only** to pick the correct fact among the
//! contenders of a single conflict. Detection, the fallback heuristic, and
//! the applier are fully deterministic and never touch it.
//!
//! The production implementation talks to a local Ollama server over its
//! REST API and demands strict JSON output. A scripted double lives here
//! too, so the decision engine's retry and fallback paths can be tested
//! without a server.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fact::FactId;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure modes of an oracle call. The decision engine retries
/// `Transient` and `Timeout`; `Permanent` and `Unavailable` abort the
/// consultation immediately.
#[derive(Debug, Error, Diagnostic)]
pub enum OracleFailure {
    /// Raised by the startup probe, before any adjudication.
    #[error("oracle is not available at {url}")]
    #[diagnostic(
        code(maat::oracle::unavailable),
        help("Start Ollama with `ollama serve`, or leave the oracle disabled to heal heuristically.")
    )]
    Unavailable { url: String },

    #[error("oracle request failed: {message}")]
    #[diagnostic(
        code(maat::oracle::transient),
        help("The request may succeed on retry; the decision engine backs off and tries again.")
    )]
    Transient { message: String },

    #[error("oracle rejected the request: {message}")]
    #[diagnostic(
        code(maat::oracle::permanent),
        help("Check the model name and the request payload; retrying will not help.")
    )]
    Permanent { message: String },

    #[error("oracle request timed out after {timeout_secs}s")]
    #[diagnostic(
        code(maat::oracle::timeout),
        help("Increase the timeout or use a smaller model.")
    )]
    Timeout { timeout_secs: u64 },
}

impl OracleFailure {
    /// Whether the decision engine should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OracleFailure::Transient { .. } | OracleFailure::Timeout { .. })
    }
}

// ---------------------------------------------------------------------------
// Payload and verdict
// ---------------------------------------------------------------------------

/// One contending fact, as presented to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub fact_id: FactId,
    /// Name of the object entity the fact points at.
    pub object: String,
    pub timestamp: u64,
    pub confidence: f32,
    /// Truncated excerpt of the source document backing the fact.
    pub source_excerpt: String,
}

/// Everything the oracle needs to adjudicate one conflict. Built once per
/// conflict and reused verbatim across retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjudicationPayload {
    pub conflict_id: String,
    /// Name of the subject entity.
    pub entity_name: String,
    pub predicate: String,
    /// Contenders, most recent first.
    pub candidates: Vec<Candidate>,
}

/// The oracle's answer: which candidate it believes, and how strongly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleVerdict {
    /// Index into the payload's candidate list.
    pub chosen_index: usize,
    /// Self-reported confidence in [0, 1].
    pub confidence: f32,
    /// Free-text justification, kept for the audit trail.
    pub reasoning: String,
    /// Tokens consumed by the call, for cost accounting.
    pub tokens_used: u32,
}

/// Anything that can adjudicate a conflict. The decision engine only sees
/// this trait, so the HTTP client and the test double are interchangeable.
pub trait ReasoningOracle: Send + Sync {
    /// Pick the correct fact among the payload's candidates.
    fn adjudicate(&self, payload: &AdjudicationPayload) -> Result<OracleVerdict, OracleFailure>;

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HTTP oracle (Ollama)
// ---------------------------------------------------------------------------

/// Configuration for the Ollama-backed oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL for the Ollama API.
    pub base_url: String,
    /// Model name to use.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// When false the decision engine never consults the oracle and heals
    /// heuristically.
    pub enabled: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "llama3.2".into(),
            timeout_secs: 120,
            enabled: false,
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a fact-checking assistant. \
    You are given several conflicting claims about the same subject and relationship. \
    Exactly one claim is correct. Prefer more recent, better-sourced claims. \
    Respond with a single JSON object and no other text, with fields: \
    chosen_index (0-based integer), confidence (number 0-1), reasoning (short string).";

/// Client for the Ollama REST API.
pub struct HttpOracle {
    config: OracleConfig,
}

impl HttpOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }

    /// Probe the server with a lightweight `/api/tags` request.
    pub fn probe(&self) -> Result<(), OracleFailure> {
        let url = format!("{}/api/tags", self.config.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(5))
            .build();
        match agent.get(&url).call() {
            Ok(resp) if resp.status() == 200 => Ok(()),
            _ => Err(OracleFailure::Unavailable {
                url: self.config.base_url.clone(),
            }),
        }
    }

    /// Transport-level failures are worth a retry. Only the timeout gets
    /// its own variant, carrying the configured limit.
    fn transport_failure(&self, message: String) -> OracleFailure {
        if message.contains("timed out") {
            OracleFailure::Timeout {
                timeout_secs: self.config.timeout_secs,
            }
        } else {
            OracleFailure::Transient { message }
        }
    }

    fn render_prompt(payload: &AdjudicationPayload) -> String {
        let mut prompt = format!(
            "Subject: {}\nRelationship: {}\nConflicting claims:\n",
            payload.entity_name, payload.predicate
        );
        for (i, c) in payload.candidates.iter().enumerate() {
            prompt.push_str(&format!(
                "{i}. object: {}, recorded_at: {}, extraction_confidence: {:.2}, source: {:?}\n",
                c.object, c.timestamp, c.confidence, c.source_excerpt
            ));
        }
        prompt.push_str("Which claim is correct? Answer with JSON only.");
        prompt
    }

    fn parse_verdict(body: &str, n_candidates: usize) -> Result<OracleVerdict, OracleFailure> {
        let json: serde_json::Value =
            serde_json::from_str(body).map_err(|e| OracleFailure::Transient {
                message: format!("response is not JSON: {e}"),
            })?;

        let text = json["response"]
            .as_str()
            .ok_or_else(|| OracleFailure::Transient {
                message: "missing 'response' field".into(),
            })?;

        // The model is told to emit bare JSON but may wrap it in prose.
        let trimmed = text.trim();
        let json_str = if trimmed.starts_with('{') {
            trimmed
        } else {
            let start = trimmed.find('{');
            let end = trimmed.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if e > s => &trimmed[s..=e],
                _ => {
                    return Err(OracleFailure::Transient {
                        message: "no JSON object found in response".into(),
                    })
                }
            }
        };

        let verdict: serde_json::Value =
            serde_json::from_str(json_str).map_err(|e| OracleFailure::Transient {
                message: format!("verdict JSON parse error: {e}"),
            })?;

        let chosen_index = verdict["chosen_index"]
            .as_u64()
            .ok_or_else(|| OracleFailure::Transient {
                message: "missing or non-integer 'chosen_index'".into(),
            })? as usize;
        if chosen_index >= n_candidates {
            return Err(OracleFailure::Transient {
                message: format!(
                    "chosen_index {chosen_index} out of range for {n_candidates} candidates"
                ),
            });
        }

        let confidence = verdict["confidence"].as_f64().unwrap_or(0.0) as f32;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(OracleFailure::Transient {
                message: format!("confidence {confidence} outside [0, 1]"),
            });
        }

        let reasoning = verdict["reasoning"].as_str().unwrap_or("").to_string();

        // Token accounting comes from the outer Ollama envelope.
        let tokens_used = json["prompt_eval_count"].as_u64().unwrap_or(0)
            + json["eval_count"].as_u64().unwrap_or(0);

        Ok(OracleVerdict {
            chosen_index,
            confidence,
            reasoning,
            tokens_used: tokens_used as u32,
        })
    }
}

impl ReasoningOracle for HttpOracle {
    fn adjudicate(&self, payload: &AdjudicationPayload) -> Result<OracleVerdict, OracleFailure> {
        let url = format!("{}/api/generate", self.config.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
            .build();

        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": Self::render_prompt(payload),
            "system": SYSTEM_PROMPT,
            "format": "json",
            "stream": false,
        });

        let body_str = serde_json::to_string(&body).map_err(|e| OracleFailure::Permanent {
            message: format!("JSON serialize error: {e}"),
        })?;

        let resp = agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body_str)
            .map_err(|e| match e {
                ureq::Error::Status(408, _) | ureq::Error::Status(429, _) => {
                    OracleFailure::Transient {
                        message: e.to_string(),
                    }
                }
                ureq::Error::Status(code, _) if (400..500).contains(&code) => {
                    OracleFailure::Permanent {
                        message: e.to_string(),
                    }
                }
                ureq::Error::Status(_, _) => OracleFailure::Transient {
                    message: e.to_string(),
                },
                ureq::Error::Transport(t) => self.transport_failure(t.to_string()),
            })?;

        let resp_str = resp.into_string().map_err(|e| OracleFailure::Transient {
            message: e.to_string(),
        })?;

        Self::parse_verdict(&resp_str, payload.candidates.len())
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

impl std::fmt::Debug for HttpOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOracle")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scripted oracle (test double)
// ---------------------------------------------------------------------------

/// Test double replaying a fixed queue of outcomes. Once the queue is
/// exhausted every further call fails permanently.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    script: std::sync::Mutex<std::collections::VecDeque<Result<OracleVerdict, OracleFailure>>>,
    calls: std::sync::atomic::AtomicU32,
}

impl ScriptedOracle {
    pub fn new(
        outcomes: impl IntoIterator<Item = Result<OracleVerdict, OracleFailure>>,
    ) -> Self {
        Self {
            script: std::sync::Mutex::new(outcomes.into_iter().collect()),
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Number of adjudication calls received so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl ReasoningOracle for ScriptedOracle {
    fn adjudicate(&self, _payload: &AdjudicationPayload) -> Result<OracleVerdict, OracleFailure> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        script.pop_front().unwrap_or_else(|| {
            Err(OracleFailure::Permanent {
                message: "script exhausted".into(),
            })
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(response: &str, prompt_tokens: u64, eval_tokens: u64) -> String {
        serde_json::json!({
            "response": response,
            "prompt_eval_count": prompt_tokens,
            "eval_count": eval_tokens,
        })
        .to_string()
    }

    #[test]
    fn parses_bare_json_verdict() {
        let body = envelope(
            r#"{"chosen_index": 1, "confidence": 0.85, "reasoning": "more recent"}"#,
            120,
            40,
        );
        let verdict = HttpOracle::parse_verdict(&body, 2).unwrap();
        assert_eq!(verdict.chosen_index, 1);
        assert!((verdict.confidence - 0.85).abs() < 1e-6);
        assert_eq!(verdict.tokens_used, 160);
    }

    #[test]
    fn parses_prose_wrapped_verdict() {
        let body = envelope(
            r#"Sure! Here is my answer: {"chosen_index": 0, "confidence": 0.9, "reasoning": "x"}"#,
            10,
            10,
        );
        let verdict = HttpOracle::parse_verdict(&body, 2).unwrap();
        assert_eq!(verdict.chosen_index, 0);
    }

    #[test]
    fn out_of_range_index_is_transient() {
        let body = envelope(r#"{"chosen_index": 5, "confidence": 0.9, "reasoning": "x"}"#, 0, 0);
        let err = HttpOracle::parse_verdict(&body, 2).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn out_of_range_confidence_is_transient() {
        let body = envelope(r#"{"chosen_index": 0, "confidence": 1.5, "reasoning": "x"}"#, 0, 0);
        let err = HttpOracle::parse_verdict(&body, 1).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn non_json_response_is_transient() {
        let body = envelope("I cannot decide.", 0, 0);
        let err = HttpOracle::parse_verdict(&body, 2).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn scripted_oracle_replays_in_order() {
        let oracle = ScriptedOracle::new([
            Err(OracleFailure::Transient {
                message: "flake".into(),
            }),
            Ok(OracleVerdict {
                chosen_index: 0,
                confidence: 0.9,
                reasoning: "ok".into(),
                tokens_used: 10,
            }),
        ]);
        let payload = AdjudicationPayload {
            conflict_id: "dup:1:CEO_OF".into(),
            entity_name: "John".into(),
            predicate: "CEO_OF".into(),
            candidates: vec![],
        };
        assert!(oracle.adjudicate(&payload).is_err());
        assert_eq!(oracle.adjudicate(&payload).unwrap().chosen_index, 0);
        assert_eq!(oracle.call_count(), 2);
        // Exhausted script fails permanently.
        assert!(!oracle.adjudicate(&payload).unwrap_err().is_retryable());
    }

    #[test]
    fn transport_errors_are_retryable() {
        let oracle = HttpOracle::new(OracleConfig::default());
        let reset = oracle.transport_failure("Connection reset by peer".into());
        assert!(matches!(reset, OracleFailure::Transient { .. }));
        assert!(reset.is_retryable());
        let timeout = oracle.transport_failure("io: timed out reading response".into());
        assert!(matches!(timeout, OracleFailure::Timeout { .. }));
        assert!(timeout.is_retryable());
    }

    #[test]
    fn probe_of_unreachable_server_is_unavailable() {
        let config = OracleConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..OracleConfig::default()
        };
        let err = HttpOracle::new(config).probe().unwrap_err();
        assert!(matches!(err, OracleFailure::Unavailable { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn default_config_values() {
        let config = OracleConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434");
        assert_eq!(config.model, "llama3.2");
        assert_eq!(config.timeout_secs, 120);
        assert!(!config.enabled);
    }
}
