use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{KnowledgeBaseSettings, RetrievalSettings};
use crate::institutions::Institution;

const MAX_QUERY_VARIATIONS: usize = 3;
const WEB_LOCATION_TYPE: &str = "WEB";

const ACRONYMS: &[(&str, &str)] = &[
    ("cse", "computer science engineering"),
    ("ece", "electronics and communication engineering"),
    ("ai", "artificial intelligence"),
    ("ml", "machine learning"),
];

const SYNONYMS: &[(&str, &[&str])] = &[
    (
        "lpu",
        &[
            "lovely professional university",
            "lpu university",
            "lovely university",
        ],
    ),
    ("fee", &["fees", "tuition", "cost", "payment"]),
    (
        "admission",
        &["admissions", "enrollment", "joining", "application"],
    ),
    ("course", &["program", "degree", "curriculum", "study"]),
];

static ACRONYM_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    ACRONYMS
        .iter()
        .filter_map(|(acronym, full_form)| {
            Regex::new(&format!(r"\b{}\b", regex::escape(acronym)))
                .ok()
                .map(|pattern| (pattern, *full_form))
        })
        .collect()
});

pub type RetrievalFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<RetrievalHit>, RetrievalError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalHit {
    pub text: String,
    pub score: Option<f64>,
    pub location_type: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("knowledge base request timed out")]
    Timeout,
    #[error("no knowledge base configured for institution {0}")]
    MissingKnowledgeBase(String),
    #[error("knowledge base request failed: {0}")]
    Backend(String),
    #[error("knowledge base returned an invalid payload: {0}")]
    InvalidPayload(String),
    #[error("failed to build knowledge base http client: {0}")]
    HttpClient(String),
}

/// Ranked passage lookup against one knowledge base.
pub trait KnowledgeBase: Send + Sync {
    fn retrieve<'a>(
        &'a self,
        knowledge_base_id: &'a str,
        query: &'a str,
        number_of_results: usize,
    ) -> RetrievalFuture<'a>;
}

/// Calls a `retrieve` endpoint speaking the Bedrock agent-runtime JSON shape.
#[derive(Clone)]
pub struct HttpKnowledgeBase {
    client: reqwest::Client,
    retrieve_url: String,
    api_key: Option<String>,
}

impl HttpKnowledgeBase {
    pub fn new(settings: &KnowledgeBaseSettings) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .map_err(|err| RetrievalError::HttpClient(err.to_string()))?;

        Ok(Self {
            client,
            retrieve_url: settings.retrieve_url.clone(),
            api_key: settings.api_key.clone(),
        })
    }

    async fn retrieve_once(
        &self,
        knowledge_base_id: &str,
        query: &str,
        number_of_results: usize,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let request_body = json!({
            "knowledgeBaseId": knowledge_base_id,
            "retrievalQuery": { "text": query },
            "retrievalConfiguration": {
                "vectorSearchConfiguration": { "numberOfResults": number_of_results }
            }
        });

        let mut request = self.client.post(&self.retrieve_url).json(&request_body);
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                RetrievalError::Timeout
            } else {
                RetrievalError::Backend("request_unavailable".to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Backend(format!("status={}", status.as_u16())));
        }

        let parsed: RetrieveResponse = response
            .json()
            .await
            .map_err(|err| RetrievalError::InvalidPayload(err.to_string()))?;

        Ok(parsed
            .retrieval_results
            .into_iter()
            .map(RetrieveResult::into_hit)
            .collect())
    }
}

impl KnowledgeBase for HttpKnowledgeBase {
    fn retrieve<'a>(
        &'a self,
        knowledge_base_id: &'a str,
        query: &'a str,
        number_of_results: usize,
    ) -> RetrievalFuture<'a> {
        Box::pin(self.retrieve_once(knowledge_base_id, query, number_of_results))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveResponse {
    #[serde(default)]
    retrieval_results: Vec<RetrieveResult>,
}

#[derive(Debug, Deserialize)]
struct RetrieveResult {
    content: RetrieveContent,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    location: Option<RetrieveLocation>,
}

impl RetrieveResult {
    fn into_hit(self) -> RetrievalHit {
        let (location_type, url) = match self.location {
            Some(location) => (
                location.location_type,
                location.web_location.and_then(|web| web.url),
            ),
            None => (None, None),
        };

        RetrievalHit {
            text: self.content.text,
            score: self.score,
            location_type,
            url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveContent {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveLocation {
    #[serde(rename = "type", default)]
    location_type: Option<String>,
    #[serde(default)]
    web_location: Option<WebLocation>,
}

#[derive(Debug, Deserialize)]
struct WebLocation {
    #[serde(default)]
    url: Option<String>,
}

/// Passages for the prompt plus reference links for the reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub passages: Vec<String>,
    pub references: Vec<String>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Trailing answer chunk listing the reference links, if any.
    pub fn references_block(&self) -> Option<String> {
        if self.references.is_empty() {
            return None;
        }
        Some(format!(
            "\n\n---\n**References:**\n{}",
            self.references.join("\n")
        ))
    }
}

#[derive(Clone)]
pub struct ContextRetriever {
    knowledge_base: Arc<dyn KnowledgeBase>,
    knowledge_base_settings: KnowledgeBaseSettings,
    settings: RetrievalSettings,
}

impl ContextRetriever {
    pub fn new(
        knowledge_base: Arc<dyn KnowledgeBase>,
        knowledge_base_settings: KnowledgeBaseSettings,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            knowledge_base,
            knowledge_base_settings,
            settings,
        }
    }

    /// Never fails: any retrieval problem degrades to an empty context.
    pub async fn retrieve_and_format_context(
        &self,
        query: &str,
        institution: &Institution,
    ) -> RetrievedContext {
        match self.try_retrieve(query, institution).await {
            Ok(context) => context,
            Err(err) => {
                warn!(
                    institution_id = institution.id,
                    error = %err,
                    "context retrieval failed; continuing without context"
                );
                RetrievedContext::default()
            }
        }
    }

    async fn try_retrieve(
        &self,
        query: &str,
        institution: &Institution,
    ) -> Result<RetrievedContext, RetrievalError> {
        let knowledge_base_id = self
            .knowledge_base_settings
            .kb_id_for(institution.id)
            .ok_or_else(|| RetrievalError::MissingKnowledgeBase(institution.id.to_string()))?;

        let processed = preprocess_query(query);
        let variations = expand_query(&processed);

        let outcomes = join_all(variations.iter().map(|variation| {
            self.knowledge_base
                .retrieve(knowledge_base_id, variation, self.settings.num_results)
        }))
        .await;

        let mut hits = Vec::new();
        let mut last_error = None;
        let mut any_success = false;
        for outcome in outcomes {
            match outcome {
                Ok(variation_hits) => {
                    any_success = true;
                    hits.extend(variation_hits);
                }
                Err(err) => {
                    debug!(error = %err, "query variation retrieval failed");
                    last_error = Some(err);
                }
            }
        }

        if !any_success && let Some(err) = last_error {
            return Err(err);
        }

        Ok(select_context(
            hits,
            self.settings.min_score,
            self.settings.num_results,
            institution,
        ))
    }
}

/// Lowercases, expands common acronyms and strips punctuation.
pub fn preprocess_query(query: &str) -> String {
    let mut processed = query.trim().to_lowercase();
    for (pattern, full_form) in ACRONYM_PATTERNS.iter() {
        processed = pattern.replace_all(&processed, *full_form).into_owned();
    }

    processed
        .chars()
        .filter(|ch| ch.is_alphanumeric() || *ch == '_' || ch.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The query itself followed by single-term synonym substitutions.
pub fn expand_query(query: &str) -> Vec<String> {
    let terms = query.split_whitespace().collect::<Vec<_>>();
    let mut variations = vec![query.to_string()];

    for (index, term) in terms.iter().enumerate() {
        let Some((_, synonyms)) = SYNONYMS.iter().find(|(word, _)| word == term) else {
            continue;
        };
        for synonym in synonyms.iter() {
            if variations.len() >= MAX_QUERY_VARIATIONS {
                return variations;
            }
            let mut substituted = terms.clone();
            substituted[index] = *synonym;
            variations.push(substituted.join(" "));
        }
    }

    variations
}

fn select_context(
    hits: Vec<RetrievalHit>,
    min_score: f64,
    num_results: usize,
    institution: &Institution,
) -> RetrievedContext {
    let mut seen_passages = HashSet::new();
    let mut seen_references = HashSet::new();
    let mut context = RetrievedContext::default();

    for hit in hits {
        if context.passages.len() >= num_results {
            break;
        }
        if hit.score.is_some_and(|score| score < min_score) {
            continue;
        }
        if !seen_passages.insert(hit.text.clone()) {
            continue;
        }

        if hit.location_type.as_deref() == Some(WEB_LOCATION_TYPE)
            && let Some(url) = hit.url.as_deref()
            && institution.owns_url(url)
            && seen_references.insert(url.to_string())
        {
            context.references.push(format!("- [View Document]({url})"));
        }

        context.passages.push(hit.text);
    }

    context
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{
        ContextRetriever, KnowledgeBase, RetrievalFuture, RetrievalHit, RetrievedContext,
        expand_query, preprocess_query, select_context,
    };
    use crate::config::{KnowledgeBaseSettings, RetrievalSettings};
    use crate::institutions::institution;

    /// Answers every lookup after a fixed delay with a hit echoing the query.
    struct SlowKnowledgeBase {
        delay: Duration,
    }

    impl KnowledgeBase for SlowKnowledgeBase {
        fn retrieve<'a>(
            &'a self,
            _knowledge_base_id: &'a str,
            query: &'a str,
            _number_of_results: usize,
        ) -> RetrievalFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(vec![RetrievalHit {
                    text: query.to_string(),
                    score: Some(0.9),
                    location_type: None,
                    url: None,
                }])
            })
        }
    }

    fn hit(text: &str, score: f64, url: Option<&str>) -> RetrievalHit {
        RetrievalHit {
            text: text.to_string(),
            score: Some(score),
            location_type: url.map(|_| "WEB".to_string()),
            url: url.map(ToString::to_string),
        }
    }

    #[test]
    fn preprocess_expands_acronyms_and_strips_punctuation() {
        assert_eq!(
            preprocess_query("  Is CSE better than AI/ML?  "),
            "is computer science engineering better than artificial intelligencemachine learning"
        );
        assert_eq!(preprocess_query("aim for mlops"), "aim for mlops");
    }

    #[test]
    fn expansion_is_capped_at_three_variations() {
        assert_eq!(
            expand_query("lpu fee details"),
            vec![
                "lpu fee details".to_string(),
                "lovely professional university fee details".to_string(),
                "lpu university fee details".to_string(),
            ]
        );
        assert_eq!(expand_query("hostel rooms"), vec!["hostel rooms".to_string()]);
    }

    #[test]
    fn selection_filters_dedupes_and_caps() {
        let lpu = institution("lpu").expect("lpu is registered");
        let hits = vec![
            hit("alpha", 0.9, Some("https://www.lpu.in/a")),
            hit("alpha", 0.8, Some("https://www.lpu.in/b")),
            hit("low", 0.1, None),
            hit("beta", 0.7, Some("https://www.lpu.in/a")),
            hit("gamma", 0.6, Some("https://elsewhere.example/x")),
            hit("delta", 0.6, None),
        ];

        let context = select_context(hits, 0.5, 3, lpu);

        assert_eq!(context.passages, vec!["alpha", "beta", "gamma"]);
        assert_eq!(
            context.references,
            vec!["- [View Document](https://www.lpu.in/a)"]
        );
    }

    #[test]
    fn references_block_renders_links() {
        let context = RetrievedContext {
            passages: vec!["p".to_string()],
            references: vec![
                "- [View Document](https://www.lpu.in/a)".to_string(),
                "- [View Document](https://www.lpu.in/b)".to_string(),
            ],
        };
        assert_eq!(
            context.references_block().as_deref(),
            Some(
                "\n\n---\n**References:**\n- [View Document](https://www.lpu.in/a)\n- [View Document](https://www.lpu.in/b)"
            )
        );
        assert!(RetrievedContext::default().references_block().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn query_variations_are_retrieved_concurrently() {
        let retriever = ContextRetriever::new(
            Arc::new(SlowKnowledgeBase {
                delay: Duration::from_secs(10),
            }),
            KnowledgeBaseSettings {
                retrieve_url: "http://127.0.0.1:1/retrieve".to_string(),
                api_key: None,
                timeout_ms: 10_000,
                default_kb_id: Some("kb".to_string()),
                institution_kb_ids: HashMap::new(),
                default_institution_id: "lpu".to_string(),
            },
            RetrievalSettings::default(),
        );
        let lpu = institution("lpu").expect("lpu is registered");

        let started = tokio::time::Instant::now();
        let context = retriever
            .retrieve_and_format_context("lpu fee details", lpu)
            .await;

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(
            context.passages,
            vec![
                "lpu fee details",
                "lovely professional university fee details",
                "lpu university fee details",
            ]
        );
    }
}
