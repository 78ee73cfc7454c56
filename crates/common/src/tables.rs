//! Table metadata DTOs and the generated table name grammar.
//!
//! Every table created within an algorithm run is named
//! `{type_prefix}_{node_id}_{context_id}_{command_id}_{result_id}` with
//! alphanumeric segments. The grammar is injective: parsing a name recovers
//! the exact five-tuple, which is what lets any participant construct, find
//! and drop tables without cross-worker coordination.

use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    dtype::DType,
    ids::{
        CommandId,
        ContextId,
        NodeId,
    },
};

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TableType {
    Normal,
    View,
    Remote,
    Merge,
}

impl TableType {
    pub fn prefix(self) -> &'static str {
        match self {
            TableType::Normal => "normal",
            TableType::View => "view",
            TableType::Remote => "remote",
            TableType::Merge => "merge",
        }
    }

    fn from_prefix(prefix: &str) -> anyhow::Result<Self> {
        let table_type = match prefix {
            "normal" => TableType::Normal,
            "view" => TableType::View,
            "remote" => TableType::Remote,
            "merge" => TableType::Merge,
            _ => anyhow::bail!("Unknown table type prefix: {prefix}"),
        };
        Ok(table_type)
    }

    /// Drop order during cleanup. Merge tables depend on remote tables and
    /// views may be stacked on normal tables, so the batch must drop in
    /// MERGE, REMOTE, VIEW, NORMAL order.
    pub fn drop_order() -> [TableType; 4] {
        [
            TableType::Merge,
            TableType::Remote,
            TableType::View,
            TableType::Normal,
        ]
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub dtype: DType,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Worker-side convention for transfer artifacts: one CLOB column.
    pub fn transfer() -> Self {
        Self::new(vec![ColumnInfo::new("transfer", DType::Json)])
    }

    /// Worker-side convention for state artifacts: one BLOB column.
    pub fn state() -> Self {
        Self::new(vec![ColumnInfo::new("state", DType::Binary)])
    }

    /// Worker-side convention for secure-transfer artifacts: one CLOB
    /// column.
    pub fn secure_transfer() -> Self {
        Self::new(vec![ColumnInfo::new("secure_transfer", DType::Json)])
    }
}

/// The parsed form of a generated table name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName {
    pub table_type: TableType,
    pub node_id: NodeId,
    pub context_id: ContextId,
    pub command_id: CommandId,
    pub result_id: String,
}

impl TableName {
    pub fn new(
        table_type: TableType,
        node_id: NodeId,
        context_id: ContextId,
        command_id: CommandId,
        result_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let result_id = result_id.into();
        anyhow::ensure!(
            !result_id.is_empty() && result_id.bytes().all(|b| b.is_ascii_alphanumeric()),
            "result id {result_id} must be ASCII alphanumeric"
        );
        Ok(Self {
            table_type,
            node_id,
            context_id,
            command_id,
            result_id,
        })
    }

    /// Whether this name belongs to the given context. Cleanup matches on
    /// the context segment alone.
    pub fn in_context(&self, context_id: &ContextId) -> bool {
        self.context_id == *context_id
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.table_type.prefix(),
            self.node_id,
            self.context_id,
            self.command_id,
            self.result_id,
        )
    }
}

impl FromStr for TableName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('_').collect();
        anyhow::ensure!(
            parts.len() == 5,
            "Table name {s} does not have exactly five segments"
        );
        Self::new(
            TableType::from_prefix(parts[0])?,
            parts[1].parse()?,
            parts[2].parse()?,
            parts[3].parse()?,
            parts[4],
        )
    }
}

#[cfg(any(test, feature = "testing"))]
impl proptest::arbitrary::Arbitrary for TableName {
    type Parameters = ();
    type Strategy = proptest::strategy::BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        use proptest::prelude::*;
        (
            any::<TableType>(),
            any::<NodeId>(),
            any::<ContextId>(),
            any::<CommandId>(),
            "[a-z0-9]{1,8}",
        )
            .prop_map(|(table_type, node_id, context_id, command_id, result_id)| Self {
                table_type,
                node_id,
                context_id,
                command_id,
                result_id,
            })
            .boxed()
    }
}

/// A table as exchanged between controller and workers: its (possibly
/// generated, possibly primary) name, schema and type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub schema: TableSchema,
    #[serde(rename = "type")]
    pub table_type: TableType,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, schema: TableSchema, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            schema,
            table_type,
        }
    }
}

/// Column-stored table contents, as returned by the table data task. Values
/// are JSON: numbers for INT/DOUBLE columns, strings for everything else
/// (state blobs are hex-encoded).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnData {
    pub name: String,
    pub dtype: DType,
    pub values: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub name: String,
    pub columns: Vec<ColumnData>,
}

impl TableData {
    pub fn column(&self, name: &str) -> anyhow::Result<&ColumnData> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| anyhow::anyhow!("Table {} has no column {name}", self.name))
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|c| c.values.len()).unwrap_or(0)
    }
}
