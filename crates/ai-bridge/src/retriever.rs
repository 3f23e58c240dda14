//! A retrieval tool backed by a Databricks Vector Search index, advertised to
//! models as a [`ToolSpec`] and executed when the model calls it.
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::adapters::utils::{post_json, send};
use crate::errors::{BridgeError, BridgeResult};
use crate::models::message::Message;
use crate::models::tool::{ToolCall, ToolSpec};

const MAX_TOOL_NAME_LEN: usize = 64;
const DEFAULT_NUM_RESULTS: usize = 5;

/// Produces query embeddings for indexes that do not embed on their own
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, model: &str, input: &str) -> BridgeResult<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexType {
    DeltaSync,
    DirectAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSourceColumn {
    pub name: String,
    #[serde(default)]
    pub embedding_model_endpoint_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVectorColumn {
    pub name: String,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
}

/// What the retriever needs to know about an index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDetails {
    pub name: String,
    pub index_type: IndexType,
    pub primary_key: String,
    pub embedding_source_column: Option<EmbeddingSourceColumn>,
    pub embedding_vector_column: Option<EmbeddingVectorColumn>,
    /// Table a delta sync index is kept in sync with
    pub source_table: Option<String>,
}

impl IndexDetails {
    /// Delta sync indexes with a source column compute embeddings themselves
    pub fn is_databricks_managed_embeddings(&self) -> bool {
        self.index_type == IndexType::DeltaSync && self.embedding_source_column.is_some()
    }

    pub fn default_tool_description(&self) -> String {
        let base = "A vector search-based retrieval tool for querying indexed embeddings.";
        match (&self.index_type, &self.source_table) {
            (IndexType::DeltaSync, Some(table)) => {
                format!("{} The queried index uses the source table {}", base, table)
            }
            _ => base.to_string(),
        }
    }

    /// Parse the index description returned by the vector search API
    pub fn from_api(description: &Value) -> BridgeResult<Self> {
        let field = |key: &str| {
            description[key].as_str().map(str::to_string).ok_or_else(|| {
                BridgeError::Protocol(format!("index description is missing '{}'", key))
            })
        };
        let name = field("name")?;
        let primary_key = field("primary_key")?;
        let index_type: IndexType = serde_json::from_value(description["index_type"].clone())
            .map_err(|e| BridgeError::Protocol(format!("unknown index type: {}", e)))?;

        let spec = match index_type {
            IndexType::DeltaSync => &description["delta_sync_index_spec"],
            IndexType::DirectAccess => &description["direct_access_index_spec"],
        };
        let first_column = |key: &str| spec[key].get(0).cloned();

        Ok(Self {
            name,
            index_type,
            primary_key,
            embedding_source_column: first_column("embedding_source_columns")
                .map(serde_json::from_value::<EmbeddingSourceColumn>)
                .transpose()
                .map_err(|e| BridgeError::Protocol(e.to_string()))?,
            embedding_vector_column: first_column("embedding_vector_columns")
                .map(serde_json::from_value::<EmbeddingVectorColumn>)
                .transpose()
                .map_err(|e| BridgeError::Protocol(e.to_string()))?,
            source_table: spec["source_table"].as_str().map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilaritySearchQuery {
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_vector: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    pub num_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
}

/// The slice of a vector search index the retriever uses
#[async_trait]
pub trait VectorSearchIndex: Send + Sync {
    async fn describe(&self) -> BridgeResult<IndexDetails>;

    /// Run a query, returning the raw `{manifest, result}` response
    async fn similarity_search(&self, query: &SimilaritySearchQuery) -> BridgeResult<Value>;
}

/// Index reached through the Databricks REST API
pub struct DatabricksVectorSearchIndex {
    client: Client,
    host: String,
    token: String,
    index_name: String,
}

impl DatabricksVectorSearchIndex {
    pub fn new<H, T, N>(host: H, token: T, index_name: N) -> BridgeResult<Self>
    where
        H: Into<String>,
        T: Into<String>,
        N: Into<String>,
    {
        let host = host.into();
        url::Url::parse(&host)?;
        Ok(Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
            token: token.into(),
            index_name: index_name.into(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/2.0/vector-search/indexes/{}{}",
            self.host, self.index_name, suffix
        )
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[async_trait]
impl VectorSearchIndex for DatabricksVectorSearchIndex {
    async fn describe(&self) -> BridgeResult<IndexDetails> {
        let response = send(
            self.client
                .get(self.url(""))
                .header("Authorization", self.auth_header()),
        )
        .await?;
        let description: Value = response
            .json()
            .await
            .map_err(|e| BridgeError::Protocol(format!("invalid index description: {}", e)))?;
        IndexDetails::from_api(&description)
    }

    async fn similarity_search(&self, query: &SimilaritySearchQuery) -> BridgeResult<Value> {
        let mut payload = json!({
            "columns": query.columns,
            "num_results": query.num_results,
        });
        if let Some(text) = &query.query_text {
            payload["query_text"] = json!(text);
        }
        if let Some(vector) = &query.query_vector {
            payload["query_vector"] = json!(vector);
        }
        if let Some(filters) = &query.filters {
            payload["filters_json"] = json!(filters.to_string());
        }
        if let Some(query_type) = &query.query_type {
            payload["query_type"] = json!(query_type);
        }
        post_json(
            &self.client,
            &self.url("/query"),
            &self.auth_header(),
            &payload,
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieverOptions {
    /// Three part name: `catalog.schema.index`
    pub index_name: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_description: Option<String>,
    /// Required unless the index computes its own embeddings
    #[serde(default)]
    pub text_column: Option<String>,
    /// Required unless the index computes its own embeddings
    #[serde(default)]
    pub embedding_model_name: Option<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    /// `ANN` or `HYBRID`
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub filters: Option<Value>,
}

impl RetrieverOptions {
    pub fn new<S: Into<String>>(index_name: S) -> Self {
        Self {
            index_name: index_name.into(),
            tool_name: None,
            tool_description: None,
            text_column: None,
            embedding_model_name: None,
            columns: Vec::new(),
            num_results: DEFAULT_NUM_RESULTS,
            query_type: None,
            filters: None,
        }
    }
}

fn default_num_results() -> usize {
    DEFAULT_NUM_RESULTS
}

/// One retrieved row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub page_content: String,
    pub metadata: Map<String, Value>,
}

pub struct VectorSearchRetrieverTool {
    options: RetrieverOptions,
    index: Arc<dyn VectorSearchIndex>,
    details: IndexDetails,
    text_column: String,
    columns: Vec<String>,
    tool_name: String,
    tool_description: String,
}

impl VectorSearchRetrieverTool {
    pub async fn new(
        options: RetrieverOptions,
        index: Arc<dyn VectorSearchIndex>,
    ) -> BridgeResult<Self> {
        if options.index_name.split('.').count() != 3 {
            return Err(BridgeError::Validation(format!(
                "Index name {} is not in the expected format 'catalog.schema.index'.",
                options.index_name
            )));
        }

        let details = index.describe().await?;
        let text_column = text_column(options.text_column.as_deref(), &details)?;
        let columns = return_columns(&options.columns, &text_column, &details);

        if !details.is_databricks_managed_embeddings() && options.embedding_model_name.is_none() {
            return Err(BridgeError::Validation(
                "The embedding model name is required for non-Databricks-managed embeddings \
                 Vector Search indexes in order to generate embeddings for retrieval queries."
                    .to_string(),
            ));
        }

        let tool_name = derive_tool_name(&options.index_name, options.tool_name.as_deref());
        let tool_description = options
            .tool_description
            .clone()
            .unwrap_or_else(|| details.default_tool_description());

        Ok(Self {
            options,
            index,
            details,
            text_column,
            columns,
            tool_name,
            tool_description,
        })
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            self.tool_name.clone(),
            self.tool_description.clone(),
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The string used to query the index and retrieve the most similar documents."
                    }
                },
                "required": ["query"]
            }),
        )
    }

    /// Retrieve the documents most similar to `query`. Indexes without managed
    /// embeddings need an `embedder` to turn the query into a vector.
    pub async fn execute(
        &self,
        query: &str,
        embedder: Option<&dyn Embedder>,
    ) -> BridgeResult<Vec<Document>> {
        let (query_text, query_vector) = if self.details.is_databricks_managed_embeddings() {
            (Some(query.to_string()), None)
        } else {
            let embedder = embedder.ok_or_else(|| {
                BridgeError::Config(
                    "an embedder is required to generate embeddings for retrieval queries"
                        .to_string(),
                )
            })?;
            let model = self.options.embedding_model_name.as_deref().unwrap_or_default();
            let vector = embedder.embed(model, query).await?;

            let expected = self
                .details
                .embedding_vector_column
                .as_ref()
                .and_then(|column| column.embedding_dimension);
            if let Some(expected) = expected {
                if vector.len() != expected {
                    return Err(BridgeError::Protocol(format!(
                        "Expected embedding dimension {} but got {}",
                        expected,
                        vector.len()
                    )));
                }
            }

            let hybrid = self
                .options
                .query_type
                .as_deref()
                .is_some_and(|query_type| query_type.eq_ignore_ascii_case("HYBRID"));
            (hybrid.then(|| query.to_string()), Some(vector))
        };

        let search = SimilaritySearchQuery {
            columns: self.columns.clone(),
            query_text,
            query_vector,
            filters: self.options.filters.clone(),
            num_results: self.options.num_results,
            query_type: self.options.query_type.clone(),
        };
        tracing::debug!(index = %self.options.index_name, num_results = search.num_results, "vector search");
        let response = self.index.similarity_search(&search).await?;
        parse_search_response(&response, &self.text_column)
    }

    /// Answer a model's call to this tool with a tool result message
    pub async fn execute_tool_call(
        &self,
        call: &ToolCall,
        embedder: Option<&dyn Embedder>,
    ) -> BridgeResult<Message> {
        let query = call.arguments["query"].as_str().ok_or_else(|| {
            BridgeError::Protocol(format!("tool call {} has no string 'query' argument", call.id))
        })?;
        let documents = self.execute(query, embedder).await?;
        let content = serde_json::to_string(&documents)
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;
        Message::tool_result(call.id.clone(), content)
    }
}

/// Tool names may not contain dots and are limited to 64 characters; longer
/// names keep their tail
pub fn derive_tool_name(index_name: &str, tool_name: Option<&str>) -> String {
    let name = tool_name
        .map(str::to_string)
        .unwrap_or_else(|| index_name.replace('.', "__"));
    let len = name.chars().count();
    if len <= MAX_TOOL_NAME_LEN {
        return name;
    }
    let truncated: String = name.chars().skip(len - MAX_TOOL_NAME_LEN).collect();
    tracing::warn!(
        "Tool name {} is too long, truncating to {} characters {}.",
        name,
        MAX_TOOL_NAME_LEN,
        truncated
    );
    truncated
}

fn text_column(requested: Option<&str>, details: &IndexDetails) -> BridgeResult<String> {
    if details.is_databricks_managed_embeddings() {
        let source = details
            .embedding_source_column
            .as_ref()
            .map(|column| column.name.clone())
            .unwrap_or_default();
        return match requested {
            Some(column) if column != source => Err(BridgeError::Validation(format!(
                "text_column '{}' does not match the index's embedding source column '{}'",
                column, source
            ))),
            _ => Ok(source),
        };
    }
    requested.map(str::to_string).ok_or_else(|| {
        BridgeError::Validation(
            "The text_column is required for indexes with self-managed embeddings".to_string(),
        )
    })
}

/// Requested columns plus the primary key and text column
fn return_columns(requested: &[String], text_column: &str, details: &IndexDetails) -> Vec<String> {
    let mut columns = requested.to_vec();
    for required in [details.primary_key.as_str(), text_column] {
        if !columns.iter().any(|column| column == required) {
            columns.push(required.to_string());
        }
    }
    columns
}

/// Turn a `{manifest, result}` response into documents. The last column of
/// every row is the similarity score and is dropped.
pub fn parse_search_response(response: &Value, text_column: &str) -> BridgeResult<Vec<Document>> {
    let columns: Vec<&str> = response["manifest"]["columns"]
        .as_array()
        .ok_or_else(|| BridgeError::Protocol("search response has no manifest".to_string()))?
        .iter()
        .filter_map(|column| column["name"].as_str())
        .collect();
    let Some((_score, columns)) = columns.split_last() else {
        return Ok(Vec::new());
    };

    let rows = match response["result"]["data_array"].as_array() {
        Some(rows) => rows,
        None => return Ok(Vec::new()),
    };

    rows.iter()
        .map(|row| {
            let mut page_content = String::new();
            let mut metadata = Map::new();
            for (name, value) in columns.iter().zip(row.as_array().into_iter().flatten()) {
                if *name == text_column {
                    page_content = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                } else {
                    metadata.insert(name.to_string(), value.clone());
                }
            }
            Ok(Document {
                page_content,
                metadata,
            })
        })
        .collect()
}
