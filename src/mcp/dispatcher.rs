//! Tool table, argument validation and routing.
//!
//! Validation is pure: [`validate`] turns raw `tools/call` params into a
//! typed [`ToolCall`] or a `Validation` error without touching the cache or
//! any service. [`Dispatcher::execute`] then routes `web_search` to
//! [`WebSearch`] and `document_question_answering` to the [`Pipeline`].

use super::protocol::{Tool, ToolCallParams, ToolCallResult};
use crate::cache::ContentCache;
use crate::config::ServerConfig;
use crate::error::DocQaError;
use crate::orchestrator::{Collaborators, Pipeline, PipelineRequest, RunContext};
use crate::pipeline::document::Document;
use crate::search::WebSearch;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// The tools this server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    WebSearch,
    DocumentQuestionAnswering,
}

impl ToolName {
    pub const ALL: [ToolName; 2] = [ToolName::WebSearch, ToolName::DocumentQuestionAnswering];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::WebSearch => "web_search",
            ToolName::DocumentQuestionAnswering => "document_question_answering",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn definition(&self) -> Tool {
        match self {
            ToolName::WebSearch => Tool {
                name: self.as_str().into(),
                description: "Run a Google-grounded web search via Gemini and return the \
                              answer text with its sources."
                    .into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "Search query to send to the Gemini web search tool."
                        }
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }),
            },
            ToolName::DocumentQuestionAnswering => Tool {
                name: self.as_str().into(),
                description: "Answer a question about a document (PDF, Word, PowerPoint, \
                              Excel, HWP, OpenDocument, RTF, PNG, JPEG) by converting it to \
                              Markdown, captioning its figures and asking Gemini."
                    .into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "document_path": {
                            "type": "string",
                            "description": "Path to the document to analyze."
                        },
                        "document_base64": {
                            "type": "string",
                            "description": "Document bytes, base64-encoded. Use instead of document_path."
                        },
                        "media_type": {
                            "type": "string",
                            "description": "MIME type or file extension of the document. Detected when omitted."
                        },
                        "question": {
                            "type": "string",
                            "description": "Question to answer using the document content."
                        }
                    },
                    "required": ["question"],
                    "additionalProperties": false
                }),
            },
        }
    }
}

/// Definitions for `tools/list`.
pub fn tool_definitions() -> Vec<Tool> {
    ToolName::ALL.iter().map(ToolName::definition).collect()
}

/// Where the document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    Path(PathBuf),
    Base64(String),
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    WebSearch {
        query: String,
    },
    DocumentQuestionAnswering {
        source: DocumentSource,
        media_type: Option<String>,
        question: String,
    },
}

impl ToolCall {
    pub fn tool(&self) -> ToolName {
        match self {
            ToolCall::WebSearch { .. } => ToolName::WebSearch,
            ToolCall::DocumentQuestionAnswering { .. } => ToolName::DocumentQuestionAnswering,
        }
    }
}

/// Check a `tools/call` request against the tool table.
pub fn validate(params: &ToolCallParams) -> Result<ToolCall, DocQaError> {
    let tool = ToolName::parse(&params.name)
        .ok_or_else(|| DocQaError::Validation(format!("unknown tool '{}'", params.name)))?;

    let empty = Map::new();
    let args = match &params.arguments {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(DocQaError::Validation(
                "arguments must be a JSON object".into(),
            ))
        }
    };

    let allowed: &[&str] = match tool {
        ToolName::WebSearch => &["query"],
        ToolName::DocumentQuestionAnswering => {
            &["document_path", "document_base64", "media_type", "question"]
        }
    };
    if let Some(unknown) = args.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(DocQaError::Validation(format!(
            "{}: unexpected argument '{}'",
            tool.as_str(),
            unknown
        )));
    }

    match tool {
        ToolName::WebSearch => Ok(ToolCall::WebSearch {
            query: required_text(args, "query")?,
        }),
        ToolName::DocumentQuestionAnswering => {
            let path = optional_text(args, "document_path")?;
            let inline = optional_text(args, "document_base64")?;
            let source = match (path, inline) {
                (Some(p), None) => DocumentSource::Path(PathBuf::from(p)),
                (None, Some(b)) => DocumentSource::Base64(b),
                (Some(_), Some(_)) => {
                    return Err(DocQaError::Validation(
                        "give either document_path or document_base64, not both".into(),
                    ))
                }
                (None, None) => {
                    return Err(DocQaError::Validation(
                        "missing required argument 'document_path' (or 'document_base64')"
                            .into(),
                    ))
                }
            };
            Ok(ToolCall::DocumentQuestionAnswering {
                source,
                media_type: optional_text(args, "media_type")?,
                question: required_text(args, "question")?,
            })
        }
    }
}

fn optional_text(args: &Map<String, Value>, name: &str) -> Result<Option<String>, DocQaError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(DocQaError::Validation(format!(
            "argument '{name}' must be a string"
        ))),
    }
}

fn required_text(args: &Map<String, Value>, name: &str) -> Result<String, DocQaError> {
    optional_text(args, name)?
        .ok_or_else(|| DocQaError::Validation(format!("missing required argument '{name}'")))
}

/// Routes validated calls to the search client or the pipeline.
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    search: WebSearch,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, search: WebSearch) -> Self {
        Self { pipeline, search }
    }

    /// Production wiring from a validated config.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, DocQaError> {
        let cache = Arc::new(ContentCache::open(&config.cache_dir, config.cache_max_bytes).await?);
        let services = Collaborators::from_config(config)?;
        let search = WebSearch::new(
            services.generator.clone(),
            config.search_model.clone(),
            config.max_output_tokens,
        );
        let pipeline = Arc::new(Pipeline::new(config, cache, services));
        info!("Cache root: {}", config.cache_dir.display());
        Ok(Self::new(pipeline, search))
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Budget for one call.
    pub fn request_timeout(&self) -> std::time::Duration {
        self.pipeline.request_timeout()
    }

    /// Run a validated call to completion.
    pub async fn execute(
        &self,
        call: ToolCall,
        ctx: &RunContext,
    ) -> Result<ToolCallResult, DocQaError> {
        match call {
            ToolCall::WebSearch { query } => {
                info!("web_search: {}", query);
                let text = self.search.search(&query, ctx).await?;
                Ok(ToolCallResult::text(text, None))
            }
            ToolCall::DocumentQuestionAnswering {
                source,
                media_type,
                question,
            } => {
                let document = match source {
                    DocumentSource::Path(path) => {
                        Document::load(&path, media_type.as_deref()).await?
                    }
                    DocumentSource::Base64(data) => {
                        Document::from_base64(&data, media_type.as_deref())?
                    }
                };
                info!(
                    "document_question_answering: {} ({}, {} bytes)",
                    document.source,
                    document.media_type,
                    document.bytes.len()
                );
                let output = self
                    .pipeline
                    .run(PipelineRequest::new(document, question), ctx)
                    .await?;
                let structured = json!({
                    "answer": output.answer,
                    "report": output.report,
                });
                Ok(ToolCallResult::text(output.answer, Some(structured)))
            }
        }
    }
}

/// Render an execution outcome as a `tools/call` result.
pub fn into_tool_result(outcome: Result<ToolCallResult, DocQaError>) -> ToolCallResult {
    match outcome {
        Ok(result) => result,
        Err(e) => ToolCallResult::error(e.code(), &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str, arguments: Value) -> ToolCallParams {
        serde_json::from_value(json!({ "name": name, "arguments": arguments })).unwrap()
    }

    #[test]
    fn tool_names_round_trip() {
        for t in ToolName::ALL {
            assert_eq!(ToolName::parse(t.as_str()), Some(t));
        }
        assert_eq!(ToolName::parse("shell"), None);
        assert_eq!(tool_definitions().len(), 2);
    }

    #[test]
    fn accepts_web_search() {
        let call = validate(&params("web_search", json!({ "query": " rust 2024 " }))).unwrap();
        assert_eq!(
            call,
            ToolCall::WebSearch {
                query: "rust 2024".into()
            }
        );
    }

    #[test]
    fn accepts_document_by_path_or_bytes() {
        let call = validate(&params(
            "document_question_answering",
            json!({ "document_path": "/tmp/r.pdf", "question": "Revenue?" }),
        ))
        .unwrap();
        assert_eq!(call.tool(), ToolName::DocumentQuestionAnswering);

        let call = validate(&params(
            "document_question_answering",
            json!({ "document_base64": "JVBERg==", "media_type": "pdf", "question": "q" }),
        ))
        .unwrap();
        assert!(matches!(
            call,
            ToolCall::DocumentQuestionAnswering {
                source: DocumentSource::Base64(_),
                media_type: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn rejects_malformed_calls() {
        let cases = [
            params("unknown_tool", json!({})),
            params("web_search", json!({})),
            params("web_search", json!({ "query": "   " })),
            params("web_search", json!({ "query": 42 })),
            params("web_search", json!({ "query": "x", "extra": 1 })),
            params("web_search", json!(["query"])),
            params("document_question_answering", json!({ "question": "q" })),
            params("document_question_answering", json!({ "document_path": "a.pdf" })),
            params(
                "document_question_answering",
                json!({ "document_path": "a.pdf", "document_base64": "JVBERg==", "question": "q" }),
            ),
        ];
        for p in cases {
            let err = validate(&p).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR", "{:?}", p);
        }
    }

    #[test]
    fn errors_render_as_tool_errors() {
        let r = into_tool_result(Err(DocQaError::Cancelled));
        assert!(r.is_error);
        assert_eq!(
            r.structured_content.unwrap()["error"]["code"],
            "CANCELLED"
        );
    }
}
