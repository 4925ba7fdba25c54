use std::sync::Arc;

use ks_store::TensionSignal;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::service::{Document, KernelService, ServiceError, ServiceResult, parse_direction};

const DEFAULT_TENSION_LIMIT: usize = 20;

#[derive(Clone)]
pub struct KsServer {
    service: Arc<KernelService>,
    /// Kernel used when a tool call names none.
    default_kernel: Option<String>,
    tool_router: ToolRouter<Self>,
}

impl KsServer {
    pub fn new(service: Arc<KernelService>, default_kernel: Option<String>) -> Self {
        Self {
            service,
            default_kernel,
            tool_router: Self::tool_router(),
        }
    }

    fn kernel(&self, requested: Option<String>) -> Result<String, McpError> {
        requested
            .or_else(|| self.default_kernel.clone())
            .ok_or_else(|| McpError::invalid_params("kernel_id is required", None))
    }

    /// Run a blocking service call off the async executor.
    async fn run<T, F>(&self, f: F) -> Result<T, McpError>
    where
        T: Send + 'static,
        F: FnOnce(&KernelService) -> ServiceResult<T> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| McpError::internal_error(format!("task failed: {e}"), None))?
            .map_err(to_mcp_error)
    }
}

fn to_mcp_error(e: ServiceError) -> McpError {
    match e {
        ServiceError::NotFound(_) | ServiceError::Invalid(_) => {
            McpError::invalid_params(e.to_string(), None)
        }
        ServiceError::Upstream(_) | ServiceError::Internal(_) => {
            tracing::error!("tool call failed: {e}");
            McpError::internal_error(e.to_string(), None)
        }
    }
}

fn json_result(value: &impl Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateKernelRequest {
    /// Display name of the person the kernel models
    name: String,
    /// Short biography
    bio: Option<String>,
    /// Era or lifetime, e.g. "121-180"
    era: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct IngestRequest {
    /// Target kernel; defaults to the server's --kernel
    kernel_id: Option<String>,
    /// Document text
    text: String,
    /// Source label for the document
    name: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryRequest {
    /// Target kernel; defaults to the server's --kernel
    kernel_id: Option<String>,
    /// The question to put to the kernel
    text: String,
    /// Optional masks (e.g. "control", "authenticity") that boost matching tensions
    #[serde(default)]
    masks: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KernelRequest {
    /// Target kernel; defaults to the server's --kernel
    kernel_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TensionsRequest {
    /// Target kernel; defaults to the server's --kernel
    kernel_id: Option<String>,
    /// Maximum tensions to return, highest scar first (default 20)
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct MarkRequest {
    /// Target kernel; defaults to the server's --kernel
    kernel_id: Option<String>,
    /// Id of the tension to update
    tension_id: String,
    /// Remembered cost in [0, 1]
    scar_valence: Option<f64>,
    /// Whether this tension marks something the person refused to do
    refusal: Option<bool>,
    /// "toward_a", "toward_b", "balanced" or "unknown"
    collapse_direction: Option<String>,
}

#[tool_router]
impl KsServer {
    #[tool(description = "Create a new persona kernel. Returns its id, which every other tool takes as kernel_id.")]
    async fn ks_create_kernel(
        &self,
        Parameters(req): Parameters<CreateKernelRequest>,
    ) -> Result<CallToolResult, McpError> {
        let record = self
            .run(move |svc| {
                svc.create_kernel(
                    &req.name,
                    req.bio.as_deref().unwrap_or_default(),
                    req.era.as_deref().unwrap_or_default(),
                )
            })
            .await?;
        json_result(&record)
    }

    #[tool(description = "List all kernels with their status.")]
    async fn ks_list_kernels(&self) -> Result<CallToolResult, McpError> {
        let kernels = self.run(|svc| svc.list_kernels()).await?;
        json_result(&serde_json::json!({ "kernels": kernels }))
    }

    #[tool(
        description = "Ingest a text document (letters, diaries, speeches) into a kernel. The text is segmented into passages and scanned for opposing concept pairs (tensions); the tension graph is rebuilt afterwards."
    )]
    async fn ks_ingest(
        &self,
        Parameters(req): Parameters<IngestRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let doc = Document::new(req.name.unwrap_or_else(|| "document".to_string()), req.text);
        let report = self.run(move |svc| svc.ingest(&kernel, &[doc])).await?;
        json_result(&report)
    }

    #[tool(
        description = "Ask a kernel a question. Retrieves the most relevant tensions and passages, then either answers in the person's voice or refuses with a reason code (insufficient_context, prior_scars, extreme_cost, strictness_exceeded). Refusals are normal results, not errors."
    )]
    async fn ks_query(
        &self,
        Parameters(req): Parameters<QueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let outcome = self
            .run(move |svc| svc.chat(&kernel, &req.text, &req.masks))
            .await?;
        json_result(&serde_json::json!({
            "answer": outcome.answer,
            "refused": outcome.refused,
            "refusal": outcome.refusal,
            "trace": outcome.trace,
            "context": outcome.pack.render(),
        }))
    }

    #[tool(description = "List a kernel's tensions, highest remembered cost first.")]
    async fn ks_tensions(
        &self,
        Parameters(req): Parameters<TensionsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let limit = req.limit.unwrap_or(DEFAULT_TENSION_LIMIT);
        let tensions = self.run(move |svc| svc.tensions(&kernel, limit)).await?;
        json_result(&serde_json::json!({ "tensions": tensions }))
    }

    #[tool(description = "Get the kernel's concept graph: poles as nodes, aggregated tensions as edges.")]
    async fn ks_graph(
        &self,
        Parameters(req): Parameters<KernelRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let graph = self.run(move |svc| svc.graph(&kernel)).await?;
        json_result(&graph)
    }

    #[tool(description = "Get chunk, tension and graph counts for a kernel.")]
    async fn ks_stats(
        &self,
        Parameters(req): Parameters<KernelRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let stats = self.run(move |svc| svc.stats(&kernel)).await?;
        json_result(&stats)
    }

    #[tool(
        description = "Update a tension's signals: scar_valence (remembered cost), refusal flag, or collapse_direction. The graph is refreshed afterwards."
    )]
    async fn ks_mark(
        &self,
        Parameters(req): Parameters<MarkRequest>,
    ) -> Result<CallToolResult, McpError> {
        let kernel = self.kernel(req.kernel_id)?;
        let signal = TensionSignal {
            scar_valence: req.scar_valence,
            refusal: req.refusal,
            collapse_direction: req
                .collapse_direction
                .as_deref()
                .map(parse_direction)
                .transpose()
                .map_err(to_mcp_error)?,
        };
        let tension_id = req.tension_id;
        let tension = self
            .run(move |svc| svc.mark_tension(&kernel, &tension_id, &signal))
            .await?;
        json_result(&tension)
    }
}

#[tool_handler]
impl ServerHandler for KsServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Kernel Studio: persona kernels built from a person's own writings.\n\n\
                 1. Create a kernel with ks_create_kernel, then feed it texts with ks_ingest.\n\
                 2. Ask questions with ks_query. An answer starting with \"Ω_clear:\" is a refusal; \
                    report its reason instead of inventing an answer.\n\
                 3. Inspect the person's contradictions with ks_tensions and ks_graph.\n\
                 4. Record what you learn about a tension (its cost, whether it was refused, \
                    which side won) with ks_mark."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_core::{HashingEmbedder, Settings};
    use ks_store::Store;

    fn make_server() -> KsServer {
        let service = KernelService::new(
            Store::open_in_memory().unwrap(),
            Box::new(HashingEmbedder::new(64).unwrap()),
            None,
            Settings::default(),
        )
        .unwrap();
        KsServer::new(Arc::new(service), None)
    }

    fn text_from_result(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn parse_result(result: &CallToolResult) -> serde_json::Value {
        let text = text_from_result(result);
        serde_json::from_str(&text).expect("handler should return valid JSON")
    }

    async fn create(server: &KsServer) -> String {
        let result = server
            .ks_create_kernel(Parameters(CreateKernelRequest {
                name: "Marcus".to_string(),
                bio: None,
                era: Some("121-180".to_string()),
            }))
            .await
            .unwrap();
        parse_result(&result)["id"].as_str().unwrap().to_string()
    }

    async fn ingest(server: &KsServer, kernel: &str, text: &str) -> serde_json::Value {
        let result = server
            .ks_ingest(Parameters(IngestRequest {
                kernel_id: Some(kernel.to_string()),
                text: text.to_string(),
                name: Some("letters.txt".to_string()),
            }))
            .await
            .unwrap();
        parse_result(&result)
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let server = make_server();
        let id = create(&server).await;
        assert_eq!(id.len(), 8);

        let json = parse_result(&server.ks_list_kernels().await.unwrap());
        assert_eq!(json["kernels"][0]["name"], "Marcus");
        assert_eq!(json["kernels"][0]["status"], "empty");
    }

    #[tokio::test]
    async fn test_ingest_then_stats() {
        let server = make_server();
        let id = create(&server).await;
        let report = ingest(&server, &id, "The conflict between duty and desire consumed him.").await;
        assert_eq!(report["documents"][0]["tensions"], 1);

        let stats = parse_result(
            &server
                .ks_stats(Parameters(KernelRequest { kernel_id: Some(id) }))
                .await
                .unwrap(),
        );
        assert_eq!(stats["tensions"], 1);
        assert_eq!(stats["edges"], 1);
        assert!(stats["chunks"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_query_refuses_on_empty_kernel() {
        let server = make_server();
        let id = create(&server).await;
        let json = parse_result(
            &server
                .ks_query(Parameters(QueryRequest {
                    kernel_id: Some(id),
                    text: "What is duty?".to_string(),
                    masks: vec![],
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["refused"], true);
        assert_eq!(json["refusal"]["code"], "insufficient_context");
    }

    #[tokio::test]
    async fn test_query_answers_with_context() {
        let server = make_server();
        let id = create(&server).await;
        ingest(&server, &id, "The conflict between duty and desire consumed him.").await;
        let json = parse_result(
            &server
                .ks_query(Parameters(QueryRequest {
                    kernel_id: Some(id),
                    text: "Should duty outweigh desire?".to_string(),
                    masks: vec![],
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["refused"], false);
        assert_eq!(json["trace"]["method"], "template");
        assert!(json["context"].as_str().unwrap().contains("duty"));
    }

    #[tokio::test]
    async fn test_default_kernel_is_used() {
        let server = make_server();
        let id = create(&server).await;
        let server = KsServer::new(Arc::clone(&server.service), Some(id));
        let result = server
            .ks_graph(Parameters(KernelRequest { kernel_id: None }))
            .await
            .unwrap();
        assert_eq!(parse_result(&result)["edges"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_kernel_is_invalid_params() {
        let server = make_server();
        assert!(
            server
                .ks_stats(Parameters(KernelRequest { kernel_id: None }))
                .await
                .is_err()
        );
        assert!(
            server
                .ks_stats(Parameters(KernelRequest {
                    kernel_id: Some("nope".to_string())
                }))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_mark_updates_tension() {
        let server = make_server();
        let id = create(&server).await;
        ingest(&server, &id, "Between duty and desire.").await;
        let tensions = parse_result(
            &server
                .ks_tensions(Parameters(TensionsRequest {
                    kernel_id: Some(id.clone()),
                    limit: None,
                }))
                .await
                .unwrap(),
        );
        let tension_id = tensions["tensions"][0]["id"].as_str().unwrap().to_string();

        let marked = parse_result(
            &server
                .ks_mark(Parameters(MarkRequest {
                    kernel_id: Some(id.clone()),
                    tension_id: tension_id.clone(),
                    scar_valence: Some(0.9),
                    refusal: Some(true),
                    collapse_direction: Some("toward_a".to_string()),
                }))
                .await
                .unwrap(),
        );
        assert_eq!(marked["scar_valence"], 0.9);
        assert_eq!(marked["refusal"], true);
        assert_eq!(marked["collapse_direction"], "toward_a");

        let bad = server
            .ks_mark(Parameters(MarkRequest {
                kernel_id: Some(id),
                tension_id,
                scar_valence: None,
                refusal: None,
                collapse_direction: Some("sideways".to_string()),
            }))
            .await;
        assert!(bad.is_err());
    }

    #[test]
    fn test_tool_registration() {
        let server = make_server();
        let info = server.get_info();

        assert!(info.instructions.is_some());
        assert!(info.capabilities.tools.is_some());
    }
}
