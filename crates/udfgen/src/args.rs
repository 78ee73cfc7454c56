//! Runtime arguments of one UDF call, inferred from the physical shape of
//! the tables the algorithm flow passed in.

use std::collections::BTreeMap;

use common::{
    task_dtos::{
        SmpcTablesInfo,
        UdfArgument,
    },
    DType,
    TableType,
};
use errors::ErrorMetadata;

/// The physical kind of one runtime argument.
#[derive(Clone, Debug, PartialEq)]
pub enum UdfArg {
    Literal(serde_json::Value),
    Relation(RelationArg),
    Tensor(TensorArg),
    Transfer(TransferArg),
    State(StateArg),
    SecureTransfer(SecureTransferArg),
    SmpcSecureTransfer(SmpcArg),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationArg {
    pub table_name: String,
    pub schema: Vec<(String, DType)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TensorArg {
    pub table_name: String,
    pub dtype: DType,
    pub ndims: usize,
    /// Merge and remote tensors are unions of per-worker tensors; they are
    /// read as lists instead of joined.
    pub is_merge: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferArg {
    pub table_name: String,
    /// Remote and merge transfer tables hold one blob per worker.
    pub is_merge: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StateArg {
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SecureTransferArg {
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SmpcArg {
    pub template_name: String,
    pub sum_op_name: Option<String>,
    pub min_op_name: Option<String>,
    pub max_op_name: Option<String>,
}

fn contract_violation(msg: String) -> anyhow::Error {
    ErrorMetadata::udf_contract_violation("UdfBadCall", msg).into()
}

/// Infer the physical kind of a table from its schema, per the worker-side
/// schema conventions: a single `transfer` CLOB column is a transfer, a
/// single `state` BLOB column is a state, a single `secure_transfer` CLOB
/// column is a secure transfer, `dim0..dimN` INT plus `val` is a tensor,
/// anything else is a relation. `row_id` is a surrogate column and never
/// participates in the decision.
fn convert_table(info: &common::TableInfo) -> anyhow::Result<UdfArg> {
    let columns = &info.schema.columns;
    let is_merge = matches!(info.table_type, TableType::Remote | TableType::Merge);
    if let [column] = columns.as_slice() {
        match (column.name.as_str(), column.dtype) {
            ("transfer", DType::Json) => {
                return Ok(UdfArg::Transfer(TransferArg {
                    table_name: info.name.clone(),
                    is_merge,
                }));
            },
            ("state", DType::Binary) => {
                // State never crosses the worker boundary, so a remote or
                // merge state table cannot exist legitimately.
                if is_merge {
                    return Err(contract_violation(format!(
                        "State table {} is not local to the worker",
                        info.name
                    )));
                }
                return Ok(UdfArg::State(StateArg {
                    table_name: info.name.clone(),
                }));
            },
            ("secure_transfer", DType::Json) => {
                return Ok(UdfArg::SecureTransfer(SecureTransferArg {
                    table_name: info.name.clone(),
                }));
            },
            _ => {},
        }
    }
    if let Some((ndims, dtype)) = tensor_shape(columns) {
        return Ok(UdfArg::Tensor(TensorArg {
            table_name: info.name.clone(),
            dtype,
            ndims,
            is_merge,
        }));
    }
    Ok(UdfArg::Relation(RelationArg {
        table_name: info.name.clone(),
        schema: columns
            .iter()
            .map(|c| (c.name.clone(), c.dtype))
            .collect(),
    }))
}

fn tensor_shape(columns: &[common::ColumnInfo]) -> Option<(usize, DType)> {
    let mut dims = 0;
    let mut val_dtype = None;
    for column in columns {
        if column.name == "row_id" {
            continue;
        }
        if column.name == format!("dim{dims}") && column.dtype == DType::Int {
            dims += 1;
        } else if column.name == "val" && val_dtype.is_none() {
            val_dtype = Some(column.dtype);
        } else {
            return None;
        }
    }
    match (dims, val_dtype) {
        (1.., Some(dtype)) => Some((dims, dtype)),
        _ => None,
    }
}

fn convert_smpc(info: &SmpcTablesInfo) -> SmpcArg {
    SmpcArg {
        template_name: info.template.name.clone(),
        sum_op_name: info.sum_op.as_ref().map(|t| t.name.clone()),
        min_op_name: info.min_op.as_ref().map(|t| t.name.clone()),
        max_op_name: info.max_op.as_ref().map(|t| t.name.clone()),
    }
}

fn convert_argument(arg: &UdfArgument) -> anyhow::Result<UdfArg> {
    match arg {
        UdfArgument::Literal { value } => Ok(UdfArg::Literal(value.clone())),
        UdfArgument::Table { info } => convert_table(info),
        UdfArgument::SmpcTables { info } => Ok(UdfArg::SmpcSecureTransfer(convert_smpc(info))),
    }
}

pub fn convert_arguments(
    positional_args: &[UdfArgument],
    keyword_args: &BTreeMap<String, UdfArgument>,
) -> anyhow::Result<(Vec<UdfArg>, BTreeMap<String, UdfArg>)> {
    let positional = positional_args
        .iter()
        .map(convert_argument)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let keyword = keyword_args
        .iter()
        .map(|(name, arg)| Ok((name.clone(), convert_argument(arg)?)))
        .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
    Ok((positional, keyword))
}

#[cfg(test)]
mod tests {
    use common::{
        ColumnInfo,
        TableInfo,
        TableSchema,
    };

    use super::*;

    fn table(name: &str, columns: Vec<ColumnInfo>, table_type: TableType) -> common::TableInfo {
        TableInfo::new(name, TableSchema::new(columns), table_type)
    }

    #[test]
    fn test_relation_table_converts_to_relation_arg() {
        let info = table(
            "tab",
            vec![
                ColumnInfo::new("c1", DType::Int),
                ColumnInfo::new("c2", DType::Float),
                ColumnInfo::new("c3", DType::Str),
            ],
            TableType::Normal,
        );
        let arg = convert_table(&info).unwrap();
        assert_eq!(
            arg,
            UdfArg::Relation(RelationArg {
                table_name: "tab".to_owned(),
                schema: vec![
                    ("c1".to_owned(), DType::Int),
                    ("c2".to_owned(), DType::Float),
                    ("c3".to_owned(), DType::Str),
                ],
            })
        );
    }

    #[test]
    fn test_tensor_table_converts_to_tensor_arg() {
        let info = table(
            "tab",
            vec![
                ColumnInfo::new("dim0", DType::Int),
                ColumnInfo::new("dim1", DType::Int),
                ColumnInfo::new("val", DType::Float),
            ],
            TableType::Normal,
        );
        let arg = convert_table(&info).unwrap();
        assert_eq!(
            arg,
            UdfArg::Tensor(TensorArg {
                table_name: "tab".to_owned(),
                dtype: DType::Float,
                ndims: 2,
                is_merge: false,
            })
        );
    }

    #[test]
    fn test_tensor_sniffing_ignores_row_id() {
        let info = table(
            "merge_table",
            vec![
                ColumnInfo::new("row_id", DType::Int),
                ColumnInfo::new("dim0", DType::Int),
                ColumnInfo::new("val", DType::Int),
            ],
            TableType::Merge,
        );
        let arg = convert_table(&info).unwrap();
        assert_eq!(
            arg,
            UdfArg::Tensor(TensorArg {
                table_name: "merge_table".to_owned(),
                dtype: DType::Int,
                ndims: 1,
                is_merge: true,
            })
        );
    }

    #[test]
    fn test_transfer_table_converts_to_transfer_arg() {
        let info = table("tab", TableSchema::transfer().columns, TableType::Remote);
        let arg = convert_table(&info).unwrap();
        assert_eq!(
            arg,
            UdfArg::Transfer(TransferArg {
                table_name: "tab".to_owned(),
                is_merge: true,
            })
        );
    }

    #[test]
    fn test_remote_state_table_is_rejected() {
        let info = table("tab", TableSchema::state().columns, TableType::Remote);
        assert!(convert_table(&info).is_err());
    }

    #[test]
    fn test_local_state_table_converts_to_state_arg() {
        let info = table("tab", TableSchema::state().columns, TableType::Normal);
        let arg = convert_table(&info).unwrap();
        assert_eq!(
            arg,
            UdfArg::State(StateArg {
                table_name: "tab".to_owned(),
            })
        );
    }
}
