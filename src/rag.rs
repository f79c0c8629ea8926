use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CompareError, Result};
use crate::session::HttpSession;

pub const DEFAULT_RAG_API_VERSION: &str = "2023-11-01";
/// Number of documents pulled into the prompt per search.
pub const DEFAULT_TOP: u32 = 3;

/// Search behavior requested from the document index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Simple,
    Semantic,
}

/// Settings for the retrieval augmentation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalConfig {
    /// Whether augmentation is requested. Orthogonal to readiness: an
    /// enabled but unconfigured index is still refused before any search.
    pub enabled: bool,
    pub index_endpoint: String,
    pub index_name: String,
    pub api_key: String,
    pub api_version: String,
    pub query_type: QueryMode,
    pub semantic_configuration: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            index_endpoint: String::new(),
            index_name: String::new(),
            api_key: String::new(),
            api_version: DEFAULT_RAG_API_VERSION.to_owned(),
            query_type: QueryMode::default(),
            semantic_configuration: None,
        }
    }
}

impl RetrievalConfig {
    /// All three connection fields are required before any search can run.
    pub fn is_ready(&self) -> bool {
        !self.index_endpoint.trim().is_empty()
            && !self.index_name.trim().is_empty()
            && !self.api_key.trim().is_empty()
    }
}

/// One retrieved snippet, normalized from the heterogeneous index schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub documents: Vec<RetrievedDocument>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelaySearchRequest<'a> {
    endpoint: &'a str,
    index_name: &'a str,
    api_key: &'a str,
    api_version: &'a str,
    query: &'a str,
    top: u32,
    query_type: QueryMode,
    semantic_configuration: Option<&'a str>,
}

/// Run one search against the document index via the relay.
///
/// Any failure here is fatal to the submission that requested augmentation.
pub async fn search_documents(
    session: &HttpSession,
    config: &RetrievalConfig,
    query: &str,
    top: u32,
) -> Result<SearchResults> {
    if !config.is_ready() {
        return Err(CompareError::Configuration(
            "retrieval configuration is incomplete: index endpoint, index name, and API key are required"
                .into(),
        ));
    }

    let url = session
        .relay_base()
        .join("api/rag/search")
        .map_err(|err| CompareError::Configuration(format!("invalid relay base URL: {err}")))?;

    let request = RelaySearchRequest {
        endpoint: &config.index_endpoint,
        index_name: &config.index_name,
        api_key: &config.api_key,
        api_version: &config.api_version,
        query,
        top,
        query_type: config.query_type,
        semantic_configuration: match config.query_type {
            QueryMode::Semantic => config.semantic_configuration.as_deref(),
            QueryMode::Simple => None,
        },
    };

    let response = session
        .client()
        .post(url)
        .json(&request)
        .send()
        .await
        .map_err(|err| CompareError::Retrieval(err.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(500).collect();
        return Err(CompareError::Retrieval(format!(
            "search returned http {status}: {snippet}"
        )));
    }

    let payload: Value = response
        .json()
        .await
        .map_err(|err| CompareError::Retrieval(err.to_string()))?;
    let items = payload
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| CompareError::Retrieval("search response has no `value` array".into()))?;

    let documents: Vec<RetrievedDocument> = items.iter().map(normalize_document).collect();
    for document in &documents {
        tracing::debug!(
            id = %document.id,
            title = %document.title,
            source = %document.source,
            url = %document.url,
            chars = document.content.len(),
            "retrieved document"
        );
    }

    Ok(SearchResults { documents })
}

/// Index schemas disagree on field names; fall back through the known ones.
fn normalize_document(item: &Value) -> RetrievedDocument {
    let text_field = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };

    let id = item
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| item.get("@search.score").map(Value::to_string))
        .unwrap_or_default();

    let content = item
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| item.get("text").and_then(Value::as_str))
        .map(str::to_owned)
        .unwrap_or_else(|| item.to_string());

    RetrievedDocument {
        id,
        title: text_field("title"),
        content,
        url: text_field("url"),
        source: text_field("source"),
    }
}

/// Build the grounded prompt sent to every model in an augmented round.
pub fn build_rag_prompt(query: &str, results: &SearchResults) -> String {
    let blocks: Vec<String> = results
        .documents
        .iter()
        .enumerate()
        .map(|(index, document)| {
            let source_info = if document.title.trim().is_empty() {
                String::new()
            } else {
                format!(" ({})", document.title)
            };
            format!(
                "[Document {}{}]\n{}\n",
                index + 1,
                source_info,
                document.content
            )
        })
        .collect();
    let documents = blocks.join("\n");

    format!(
        "You are an AI assistant answering questions based on the provided documents.\n\
         Use only the information in the documents to answer the question.\n\
         If the documents don't contain the answer, say \"I don't have enough information to answer that question.\"\n\
         \n\
         Important Instructions:\n\
         1. When you use information from the documents, cite the source like this: [Document X]\n\
         2. Include multiple citations if you use information from multiple documents\n\
         3. Don't make up information that isn't in the documents\n\
         4. Answer in a clear, concise manner\n\
         \n\
         DOCUMENTS:\n\
         {documents}\n\
         \n\
         QUESTION: {query}\n\
         \n\
         ANSWER (with citations):"
    )
}

/// Search the index and wrap the prompt with retrieved context.
///
/// Called once per submission; a failure here aborts the round before any
/// model pipeline starts.
pub async fn augment_prompt(
    session: &HttpSession,
    config: &RetrievalConfig,
    query: &str,
) -> Result<String> {
    let results = search_documents(session, config, query, DEFAULT_TOP).await?;
    tracing::info!(
        documents = results.documents.len(),
        "prompt augmented with retrieved context"
    );
    Ok(build_rag_prompt(query, &results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn session(relay_base: &str) -> HttpSession {
        HttpSession::new(&SessionConfig::new(
            relay_base.to_owned(),
            Duration::from_secs(5),
        ))
        .unwrap()
    }

    fn ready_config() -> RetrievalConfig {
        RetrievalConfig {
            enabled: true,
            index_endpoint: "https://search.example.net".to_owned(),
            index_name: "docs".to_owned(),
            api_key: "search-key".to_owned(),
            ..RetrievalConfig::default()
        }
    }

    #[tokio::test]
    async fn refuses_incomplete_configuration_without_network() {
        let session = session("http://127.0.0.1:9");
        let mut config = ready_config();
        config.api_key = String::new();

        let err = search_documents(&session, &config, "q", DEFAULT_TOP)
            .await
            .unwrap_err();
        assert_matches!(err, CompareError::Configuration(message) => {
            assert!(message.contains("incomplete"));
        });
    }

    #[tokio::test]
    async fn surfaces_search_failure_as_retrieval_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/rag/search");
                then.status(500).body("index offline");
            })
            .await;

        let session = session(&server.base_url());
        let err = augment_prompt(&session, &ready_config(), "q")
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert_matches!(err, CompareError::Retrieval(message) => {
            assert!(message.contains("500"));
        });
    }

    #[tokio::test]
    async fn maps_search_hits_through_field_fallbacks() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/rag/search")
                    .json_body_partial(r#"{"indexName": "docs", "queryType": "simple", "top": 3}"#);
                then.status(200).json_body(json!({
                    "value": [
                        { "id": "doc-1", "title": "Setup Guide", "content": "install steps" },
                        { "@search.score": 0.42, "text": "fallback body" }
                    ]
                }));
            })
            .await;

        let session = session(&server.base_url());
        let results = search_documents(&session, &ready_config(), "install", DEFAULT_TOP)
            .await
            .unwrap();

        assert_eq!(results.documents.len(), 2);
        assert_eq!(results.documents[0].id, "doc-1");
        assert_eq!(results.documents[0].content, "install steps");
        assert_eq!(results.documents[1].id, "0.42");
        assert_eq!(results.documents[1].content, "fallback body");
        assert!(results.documents[1].title.is_empty());
    }

    #[tokio::test]
    async fn rejects_payload_without_value_array() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/rag/search");
                then.status(200).json_body(json!({ "results": [] }));
            })
            .await;

        let session = session(&server.base_url());
        let err = search_documents(&session, &ready_config(), "q", DEFAULT_TOP)
            .await
            .unwrap_err();
        assert_matches!(err, CompareError::Retrieval(_));
    }

    #[test]
    fn semantic_configuration_only_sent_in_semantic_mode() {
        let request = RelaySearchRequest {
            endpoint: "https://search.example.net",
            index_name: "docs",
            api_key: "k",
            api_version: DEFAULT_RAG_API_VERSION,
            query: "q",
            top: 3,
            query_type: QueryMode::Semantic,
            semantic_configuration: Some("default"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["queryType"], "semantic");
        assert_eq!(value["semanticConfiguration"], "default");
        assert_eq!(value["apiVersion"], DEFAULT_RAG_API_VERSION);

        let request = RelaySearchRequest {
            query_type: QueryMode::Simple,
            semantic_configuration: None,
            ..request
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["semanticConfiguration"], serde_json::Value::Null);
    }

    #[test]
    fn prompt_numbers_documents_and_keeps_citation_scaffold() {
        let results = SearchResults {
            documents: vec![
                RetrievedDocument {
                    id: "1".into(),
                    title: "Setup Guide".into(),
                    content: "install with the bootstrap script".into(),
                    url: String::new(),
                    source: String::new(),
                },
                RetrievedDocument {
                    id: "2".into(),
                    title: String::new(),
                    content: "restart after upgrading".into(),
                    url: String::new(),
                    source: String::new(),
                },
            ],
        };

        let prompt = build_rag_prompt("how do I install?", &results);
        assert!(prompt.contains("[Document 1 (Setup Guide)]\ninstall with the bootstrap script"));
        assert!(prompt.contains("[Document 2]\nrestart after upgrading"));
        assert!(prompt.contains("cite the source like this: [Document X]"));
        assert!(prompt.contains("QUESTION: how do I install?"));
        assert!(prompt.ends_with("ANSWER (with citations):"));
    }

    #[test]
    fn readiness_requires_all_connection_fields() {
        let mut config = ready_config();
        assert!(config.is_ready());
        config.index_name = "  ".to_owned();
        assert!(!config.is_ready());
    }
}
