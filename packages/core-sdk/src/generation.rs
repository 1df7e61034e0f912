use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::{
    config::AppConfig,
    llm::{Credentials, Dispatcher},
    models::{ProviderId, QuerySuggestions, SchemaAnalysis, SqlResponse},
    telemetry,
};

const SQL_GUIDELINES: &str = "Follow these guidelines when generating SQL queries:
1. Use standard SQL syntax that works with PostgreSQL
2. Include appropriate JOINs when querying across multiple tables
3. Use meaningful aliases for tables and columns
4. Add comments for complex parts of the query
5. Consider performance by using appropriate indexes and avoiding unnecessary operations
6. Format the SQL query with proper indentation and line breaks for readability
7. Use parameterized queries with placeholders where appropriate
8. Include appropriate WHERE clauses to filter data as needed
9. For aggregations, include appropriate GROUP BY clauses
10. For sorting, use ORDER BY with clear direction (ASC/DESC)

Provide both the SQL query and a clear explanation of what the query does in plain English.";

const SCHEMA_ANALYSIS_PROMPT: &str = "You are a database expert specializing in schema analysis. Your task is to analyze a SQL schema and provide insights about the tables, columns, and relationships.

Analyze the following database schema and provide:
1. A description of each table and its purpose
2. A description of each column, including its data type and purpose
3. Identify primary and foreign keys
4. Describe relationships between tables

Format your response as a structured JSON object.";

const SUGGESTIONS_PROMPT: &str = "You are a business intelligence analyst. Given a SQL schema, propose questions a business user could answer with it.

Each suggestion must be a single plain-English question that can be answered with one SQL query against the schema. Prefer questions about revenue, trends, rankings and customer behaviour. Return between 3 and 8 suggestions.";

/**
 * \brief 自然语言转 SQL，以及 schema 分析与问题推荐。
 * \details 始终使用服务端的 OpenAI Key 与模型，不读取用户保存的 Provider 设置。
 */
#[derive(Clone)]
pub struct QueryGenerationService {
    dispatcher: Arc<Dispatcher>,
    api_key: Option<String>,
    model: String,
}

impl QueryGenerationService {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &AppConfig) -> Self {
        Self {
            dispatcher,
            api_key: config.openai_api_key.clone(),
            model: config.generation_model.clone(),
        }
    }

    /**
     * \brief 为 `prompt` 生成 SQL 与解释，可选以 `schema` 为依据。
     */
    pub async fn generate(&self, prompt: &str, schema: Option<&str>) -> Result<SqlResponse> {
        if prompt.trim().is_empty() {
            bail!("Prompt must not be empty");
        }
        let system = sql_system_prompt(schema);
        let user = format!("Generate a SQL query for the following request: {}", prompt);
        let response = self
            .dispatcher
            .generate_typed::<SqlResponse>(ProviderId::OpenAi, &self.credentials(), &system, &user)
            .await
            .map_err(|e| {
                telemetry::log_error("generation.sql", &e.to_string());
                anyhow!("Failed to generate SQL query")
            })?;
        telemetry::log_event(
            "generation.sql",
            &format!(
                "model={} prompt_len={} schema={}",
                self.model,
                prompt.len(),
                schema.is_some()
            ),
        );
        Ok(response)
    }

    pub async fn analyze_schema(&self, schema: &str) -> Result<SchemaAnalysis> {
        if schema.trim().is_empty() {
            bail!("Schema must not be empty");
        }
        let user = format!("Analyze this database schema:\n```sql\n{}\n```", schema);
        self.dispatcher
            .generate_typed::<SchemaAnalysis>(
                ProviderId::OpenAi,
                &self.credentials(),
                SCHEMA_ANALYSIS_PROMPT,
                &user,
            )
            .await
            .map_err(|e| {
                telemetry::log_error("generation.schema", &e.to_string());
                anyhow!("Failed to analyze schema")
            })
    }

    /**
     * \brief 针对 `schema` 推荐业务人员可提出的问题。
     */
    pub async fn suggest_queries(&self, schema: &str) -> Result<Vec<String>> {
        if schema.trim().is_empty() {
            bail!("Schema must not be empty");
        }
        let user = format!(
            "Suggest questions for this database schema:\n```sql\n{}\n```",
            schema
        );
        let suggestions = self
            .dispatcher
            .generate_typed::<QuerySuggestions>(
                ProviderId::OpenAi,
                &self.credentials(),
                SUGGESTIONS_PROMPT,
                &user,
            )
            .await
            .map_err(|e| {
                telemetry::log_error("generation.suggestions", &e.to_string());
                anyhow!("Failed to generate query suggestions")
            })?;
        Ok(suggestions
            .queries
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect())
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(self.api_key.clone().unwrap_or_default(), &self.model)
    }
}

pub fn sql_system_prompt(schema: Option<&str>) -> String {
    let context = match schema.map(str::trim).filter(|s| !s.is_empty()) {
        Some(schema) => format!(
            "Here is the database schema provided by the user:\n```sql\n{}\n```",
            schema
        ),
        None => "If no schema is provided, make reasonable assumptions about table and column names based on the query description.".to_string(),
    };
    format!(
        "You are an expert SQL query generator with deep knowledge of database design, optimization, and SQL best practices. Your task is to generate SQL queries based on natural language descriptions.\n\n{}\n\n{}",
        context, SQL_GUIDELINES
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{
        history::{MemoryStorage, QueryHistory, QueryHistoryItem},
        llm::{testing::scripted_dispatcher, LlmError},
    };

    fn service(object: std::result::Result<serde_json::Value, LlmError>, key: Option<&str>) -> (QueryGenerationService, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = scripted_dispatcher(Ok(String::new()), object, calls.clone());
        let config = AppConfig {
            openai_api_key: key.map(str::to_string),
            ..AppConfig::default()
        };
        (
            QueryGenerationService::new(Arc::new(dispatcher), &config),
            calls,
        )
    }

    #[test]
    fn test_system_prompt_with_and_without_schema() {
        let with = sql_system_prompt(Some("CREATE TABLE customers (id INT);"));
        assert!(with.contains("```sql\nCREATE TABLE customers (id INT);\n```"));
        assert!(!with.contains("make reasonable assumptions"));
        let without = sql_system_prompt(Some("   "));
        assert!(without.contains("make reasonable assumptions"));
        assert!(without.contains("PostgreSQL"));
    }

    #[tokio::test]
    async fn test_top_customers_scenario_feeds_history() {
        let explanation = "This query joins customers with their orders, sums the order totals per customer, and returns the five customers with the highest total revenue in descending order.";
        let (svc, calls) = service(
            Ok(json!({
                "sqlQuery": "SELECT c.name, SUM(o.total) AS revenue\nFROM customers c\nJOIN orders o ON o.customer_id = c.id\nGROUP BY c.name\nORDER BY revenue DESC\nLIMIT 5;",
                "explanation": explanation
            })),
            Some("sk-server"),
        );
        let prompt = "Show me the top 5 customers by revenue";
        let result = svc.generate(prompt, None).await.expect("generate");
        assert!(result.sql_query.contains("LIMIT"));
        assert!(!result.explanation.is_empty());
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["openai:sk-server:gpt-4o-mini".to_string()]
        );

        let mut history = QueryHistory::load(MemoryStorage::default());
        history
            .append(QueryHistoryItem::new(prompt, &result))
            .expect("append");
        assert_eq!(history.items().len(), 1);
        let summary = &history.items()[0].summary;
        assert!(summary.chars().count() <= 103);
        assert!(summary.ends_with("..."));
    }

    #[tokio::test]
    async fn test_missing_server_key_is_generic_failure() {
        let (svc, calls) = service(Ok(json!({})), None);
        let err = svc.generate("count orders", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to generate SQL query");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_output_is_generic_failure() {
        let (svc, _) = service(Ok(json!({"query": "SELECT 1"})), Some("k"));
        let err = svc.generate("anything", Some("CREATE TABLE t (id INT);")).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to generate SQL query");
    }

    #[tokio::test]
    async fn test_analyze_schema() {
        let (svc, _) = service(
            Ok(json!({
                "tables": [{
                    "name": "orders",
                    "description": "Customer orders",
                    "columns": [
                        {"name": "id", "type": "INT", "description": "Order id", "isPrimary": true},
                        {"name": "customer_id", "type": "INT", "description": "Buyer", "isForeign": true, "references": "customers.id"}
                    ]
                }],
                "relationships": [{"from": "orders.customer_id", "to": "customers.id", "type": "many-to-one", "description": "Each order belongs to a customer"}]
            })),
            Some("k"),
        );
        let analysis = svc
            .analyze_schema("CREATE TABLE orders (id INT PRIMARY KEY, customer_id INT);")
            .await
            .expect("analysis");
        assert_eq!(analysis.tables[0].columns[1].references.as_deref(), Some("customers.id"));
        assert_eq!(analysis.relationships.map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn test_suggestions_drop_blank_entries() {
        let (svc, _) = service(
            Ok(json!({"queries": ["Which products sell best?", "  ", " Monthly revenue trend? "]})),
            Some("k"),
        );
        let suggestions = svc.suggest_queries("CREATE TABLE sales (id INT);").await.expect("suggest");
        assert_eq!(
            suggestions,
            vec!["Which products sell best?".to_string(), "Monthly revenue trend?".to_string()]
        );
        let err = svc.suggest_queries("").await.unwrap_err();
        assert_eq!(err.to_string(), "Schema must not be empty");
    }
}
