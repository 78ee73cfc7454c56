use async_trait::async_trait;

/// Column-stored query results as the store driver hands them back. Values
/// are JSON-encoded: numbers stay numbers, CLOBs are strings, BLOBs are
/// hex strings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Rows {
    pub fn single_count(&self) -> anyhow::Result<u64> {
        let value = self
            .rows
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_u64());
        value.ok_or_else(|| anyhow::anyhow!("Query did not return a single count"))
    }
}

/// The interface the task layer consumes from the SQL-capable columnar
/// store on this worker. The store itself (driver, connection pooling,
/// the embedded UDF runtime) is an external collaborator.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// Run one or more `;`-separated statements in a single transaction.
    async fn execute(&self, sql: &str) -> anyhow::Result<()>;

    async fn query(&self, sql: &str) -> anyhow::Result<Rows>;

    /// Names of all tables and views whose name contains `fragment`.
    async fn list_tables(&self, fragment: &str) -> anyhow::Result<Vec<String>>;

    /// Column names and types of an existing table or view.
    async fn table_schema(&self, table_name: &str) -> anyhow::Result<common::TableSchema>;
}
