//! LLM extraction provider: chunk text in, structured knowledge out.
//!
//! The [`Extractor`] trait turns a chunk plus the current vocabulary
//! snapshot into a validated [`Extraction`]: concepts, instances
//! (concept + verbatim quote), and typed relationships. The extractor may
//! emit type names not present in the vocabulary; those are handed to the
//! vocabulary manager downstream, never resolved here.
//!
//! The same provider also hosts the adjudication capability used by
//! vocabulary consolidation: given two type names and descriptions, decide
//! MERGE or REJECT (directional-inverse | semantic-distinction) via
//! [`Extractor::adjudicate`].
//!
//! Decoding is schema-validated: an instance referencing a concept that is
//! not in the same result, a relationship endpoint that does not resolve, or
//! a quote that is not a substring of the chunk (modulo whitespace
//! normalization) all reject the output. Rejected output surfaces as a
//! retryable provider error; the ingestion worker owns the retry budget.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::ExtractionConfig;
use crate::error::{KgError, KgResult};

/// A concept candidate emitted by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedConcept {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub search_terms: Vec<String>,
}

/// An attestation of a concept inside the chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedInstance {
    pub concept_label: String,
    pub quote: String,
}

/// A typed edge between two concepts emitted in the same result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub from_label: String,
    pub to_label: String,
    pub type_name: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The structured result of one extraction call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub concepts: Vec<ExtractedConcept>,
    #[serde(default)]
    pub instances: Vec<ExtractedInstance>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    /// Provider-reported token usage, for job cost accounting.
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
}

/// Adjudication outcome for a candidate vocabulary merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum MergeVerdict {
    /// Merge source into target.
    Merge { reason: String },
    /// Keep both types.
    Reject { reason: RejectReason },
}

/// Why a pair must not be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The two types are directional inverses (e.g. CAUSES / RESULTS_FROM).
    DirectionalInverse,
    /// The two types carry a real semantic distinction.
    SemanticDistinction,
}

/// Trait for LLM extraction backends.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract structured knowledge from one chunk. `vocabulary` is the
    /// snapshot of active type names offered to the model.
    async fn extract(&self, chunk_text: &str, vocabulary: &[String]) -> KgResult<Extraction>;

    /// Decide whether two vocabulary types are synonyms.
    async fn adjudicate(
        &self,
        a_name: &str,
        a_description: &str,
        b_name: &str,
        b_description: &str,
    ) -> KgResult<MergeVerdict>;
}

/// Create the extractor selected by configuration.
pub fn create_extractor(config: &ExtractionConfig) -> KgResult<Box<dyn Extractor>> {
    match config.provider.as_str() {
        "remote" => Ok(Box::new(RemoteExtractor::new(config)?)),
        "mock" => Ok(Box::new(MockExtractor::default())),
        other => Err(KgError::Validation(format!(
            "unknown extraction provider: {}",
            other
        ))),
    }
}

// ============ Validation ============

/// Collapse all whitespace runs to single spaces for quote comparison.
fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate a decoded extraction against its chunk.
///
/// Enforced invariants:
/// - every instance references a concept emitted in the same result
/// - every relationship references two concepts emitted in the same result
/// - every quote is a substring of the chunk modulo whitespace
pub fn validate_extraction(extraction: &Extraction, chunk_text: &str) -> KgResult<()> {
    let labels: HashSet<&str> = extraction.concepts.iter().map(|c| c.label.as_str()).collect();
    let normalized_chunk = normalize_ws(chunk_text);

    for inst in &extraction.instances {
        if !labels.contains(inst.concept_label.as_str()) {
            return Err(KgError::transient(format!(
                "instance references unknown concept '{}'",
                inst.concept_label
            )));
        }
        if !normalized_chunk.contains(&normalize_ws(&inst.quote)) {
            return Err(KgError::transient(format!(
                "quote is not a substring of the chunk: '{:.60}'",
                inst.quote
            )));
        }
    }

    for rel in &extraction.relationships {
        if !labels.contains(rel.from_label.as_str()) || !labels.contains(rel.to_label.as_str()) {
            return Err(KgError::transient(format!(
                "relationship references unknown concept '{}' -> '{}'",
                rel.from_label, rel.to_label
            )));
        }
        if let Some(c) = rel.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(KgError::transient(format!(
                    "relationship confidence out of range: {}",
                    c
                )));
            }
        }
    }

    Ok(())
}

/// Decode and validate raw model output.
pub fn decode_extraction(raw: &str, chunk_text: &str) -> KgResult<Extraction> {
    let extraction: Extraction = serde_json::from_str(raw)
        .map_err(|e| KgError::transient(format!("malformed extraction output: {}", e)))?;
    validate_extraction(&extraction, chunk_text)?;
    Ok(extraction)
}

// ============ Remote Extractor ============

const EXTRACTION_PROMPT: &str = "\
You extract a knowledge graph from text. Return ONLY a JSON object with keys \
\"concepts\" (label, description, search_terms[]), \"instances\" \
(concept_label, quote — quote must be copied verbatim from the text), and \
\"relationships\" (from_label, to_label, type_name, confidence). Prefer \
relationship types from the provided vocabulary; you may introduce a new \
UPPERCASE_SNAKE type name when none fits.";

const ADJUDICATION_PROMPT: &str = "\
You maintain a relationship-type vocabulary. Given two types with their \
descriptions, return ONLY a JSON object: {\"verdict\": \"merge\", \"reason\": \
\"...\"} if they are synonyms, or {\"verdict\": \"reject\", \"reason\": \
\"directional_inverse\" | \"semantic_distinction\"} otherwise. Directional \
inverses (A CAUSES B vs B RESULTS_FROM A) are never synonyms.";

/// Extraction provider calling an OpenAI-compatible chat-completions
/// endpoint. Retries transient failures with exponential backoff and honors
/// provider-advised rate-limit delays.
pub struct RemoteExtractor {
    model: String,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
    timeout: Duration,
}

impl RemoteExtractor {
    pub fn new(config: &ExtractionConfig) -> KgResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| KgError::Validation("extraction.model required for remote provider".into()))?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                KgError::Validation(format!("environment variable {} not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            model,
            base_url,
            api_key,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn chat(&self, system: &str, user: &str) -> KgResult<(String, u64, u64)> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| KgError::fatal(format!("http client: {}", e)))?;

        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
        });

        let mut last_err: Option<KgError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| KgError::fatal(format!("invalid response body: {}", e)))?;

                        let content = json
                            .pointer("/choices/0/message/content")
                            .and_then(|c| c.as_str())
                            .ok_or_else(|| {
                                KgError::transient("extraction response missing content")
                            })?;

                        let tokens_in = json
                            .pointer("/usage/prompt_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);
                        let tokens_out = json
                            .pointer("/usage/completion_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);

                        return Ok((content.to_string(), tokens_in, tokens_out));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let advised = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok());
                        if let Some(secs) = advised {
                            tokio::time::sleep(Duration::from_secs(secs.min(60))).await;
                        }
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(KgError::transient(format!(
                            "extraction API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(KgError::fatal(format!(
                        "extraction API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(KgError::transient(format!("network error: {}", e)));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| KgError::transient("extraction failed after retries")))
    }
}

#[async_trait]
impl Extractor for RemoteExtractor {
    async fn extract(&self, chunk_text: &str, vocabulary: &[String]) -> KgResult<Extraction> {
        let user = format!(
            "Vocabulary: {}\n\nText:\n{}",
            vocabulary.join(", "),
            chunk_text
        );
        let (content, tokens_in, tokens_out) = self.chat(EXTRACTION_PROMPT, &user).await?;
        let mut extraction = decode_extraction(&content, chunk_text)?;
        extraction.tokens_in = tokens_in;
        extraction.tokens_out = tokens_out;
        Ok(extraction)
    }

    async fn adjudicate(
        &self,
        a_name: &str,
        a_description: &str,
        b_name: &str,
        b_description: &str,
    ) -> KgResult<MergeVerdict> {
        let user = format!(
            "Type A: {} — {}\nType B: {} — {}",
            a_name, a_description, b_name, b_description
        );
        let (content, _, _) = self.chat(ADJUDICATION_PROMPT, &user).await?;
        serde_json::from_str(&content)
            .map_err(|e| KgError::transient(format!("malformed adjudication output: {}", e)))
    }
}

// ============ Mock Extractor ============

/// Deterministic extractor for tests and offline runs.
///
/// Concepts are the distinct capitalized words of the chunk (in order of
/// first appearance, capped at 12); each concept gets an instance quoting
/// the sentence it first appears in; consecutive concept pairs in the same
/// sentence get an ASSOCIATED_WITH edge, exercising vocabulary
/// auto-expansion.
#[derive(Default)]
pub struct MockExtractor {
    /// Adjudication verdicts keyed by `(a, b)` name pair; unmatched pairs
    /// are rejected as semantic distinctions.
    pub merges: std::collections::HashMap<(String, String), MergeVerdict>,
}

impl MockExtractor {
    fn sentences(text: &str) -> Vec<&str> {
        text.split_terminator(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn capitalized_words(sentence: &str) -> Vec<String> {
        sentence
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| {
                w.len() >= 3 && w.chars().next().is_some_and(|c| c.is_uppercase())
            })
            .map(|w| w.to_string())
            .collect()
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, chunk_text: &str, _vocabulary: &[String]) -> KgResult<Extraction> {
        let mut concepts: Vec<ExtractedConcept> = Vec::new();
        let mut instances: Vec<ExtractedInstance> = Vec::new();
        let mut relationships: Vec<ExtractedRelationship> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for sentence in Self::sentences(chunk_text) {
            let words = Self::capitalized_words(sentence);
            for w in &words {
                if seen.insert(w.clone()) && concepts.len() < 12 {
                    concepts.push(ExtractedConcept {
                        label: w.clone(),
                        description: sentence.to_string(),
                        search_terms: vec![w.to_lowercase()],
                    });
                    instances.push(ExtractedInstance {
                        concept_label: w.clone(),
                        quote: sentence.to_string(),
                    });
                }
            }
            let in_result: Vec<&String> =
                words.iter().filter(|w| seen.contains(*w)).collect();
            for pair in in_result.windows(2) {
                relationships.push(ExtractedRelationship {
                    from_label: pair[0].clone(),
                    to_label: pair[1].clone(),
                    type_name: "ASSOCIATED_WITH".to_string(),
                    confidence: Some(0.7),
                });
            }
        }

        // Keep only relationships whose endpoints survived the concept cap
        let labels: HashSet<&str> = concepts.iter().map(|c| c.label.as_str()).collect();
        relationships.retain(|r| {
            labels.contains(r.from_label.as_str()) && labels.contains(r.to_label.as_str())
        });
        instances.retain(|i| labels.contains(i.concept_label.as_str()));

        let extraction = Extraction {
            concepts,
            instances,
            relationships,
            tokens_in: (chunk_text.split_whitespace().count() as u64).max(1),
            tokens_out: 64,
        };
        validate_extraction(&extraction, chunk_text)?;
        Ok(extraction)
    }

    async fn adjudicate(
        &self,
        a_name: &str,
        _a_description: &str,
        b_name: &str,
        _b_description: &str,
    ) -> KgResult<MergeVerdict> {
        if let Some(v) = self
            .merges
            .get(&(a_name.to_string(), b_name.to_string()))
            .or_else(|| self.merges.get(&(b_name.to_string(), a_name.to_string())))
        {
            return Ok(v.clone());
        }
        Ok(MergeVerdict::Reject {
            reason: RejectReason::SemanticDistinction,
        })
    }
}
