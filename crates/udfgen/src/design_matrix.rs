//! Dummy-encoding design-matrix builder.
//!
//! Regression-style algorithms expand categorical variables into indicator
//! columns. That expansion is pure SQL (`CASE WHEN col = level THEN 1 ELSE
//! 0 END`), so instead of a generated function it is emitted as a plain
//! select into the output table, together with the matching schema.

use std::collections::BTreeMap;

use common::DType;
use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    generator::{
        UdfExecutionQueries,
        UdfGenResult,
        UdfGenTableResult,
        MAIN_OUTPUT_PLACEHOLDER,
    },
    templates::Template,
};

/// The registry-level name the worker's UDF task recognizes as the design
/// matrix builder instead of a generated function.
pub const DESIGN_MATRIX_FUNC_NAME: &str = "create_dummy_encoded_design_matrix";

/// One categorical level and the indicator column it expands into.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DummyEnum {
    pub code: String,
    pub dummy: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DesignMatrixArgs {
    /// The relation holding the raw variables.
    pub x_table_name: String,
    /// Categorical variables with their levels, in output column order.
    pub enums: BTreeMap<String, Vec<DummyEnum>>,
    /// Numerical variables appended after the indicator columns.
    pub numerical_vars: Vec<String>,
    /// Whether to prepend a constant intercept column.
    pub intercept: bool,
}

pub fn get_create_dummy_encoded_design_matrix_execution_queries(
    args: &DesignMatrixArgs,
) -> UdfExecutionQueries {
    let mut select_cols = vec!["\"row_id\"".to_owned()];
    let mut schema = vec![("row_id".to_owned(), DType::Int)];
    if args.intercept {
        select_cols.push("1 AS \"intercept\"".to_owned());
        schema.push(("intercept".to_owned(), DType::Float));
    }
    for (var, levels) in &args.enums {
        for level in levels {
            select_cols.push(format!(
                "CASE WHEN {var} = '{}' THEN 1 ELSE 0 END AS \"{}\"",
                level.code, level.dummy
            ));
            schema.push((level.dummy.clone(), DType::Float));
        }
    }
    for var in &args.numerical_vars {
        select_cols.push(format!("\"{var}\""));
        schema.push((var.clone(), DType::Float));
    }

    let select = format!(
        "INSERT INTO ${MAIN_OUTPUT_PLACEHOLDER}\nSELECT\n{}\nFROM\n    {};",
        select_cols
            .iter()
            .map(|col| format!("    {col}"))
            .join(",\n"),
        args.x_table_name,
    );
    let create = format!(
        "CREATE TABLE ${MAIN_OUTPUT_PLACEHOLDER}({});",
        schema
            .iter()
            .map(|(name, dtype)| format!("\"{name}\" {}", dtype.to_sql()))
            .join(","),
    );

    UdfExecutionQueries {
        udf_definition_query: Template::new(""),
        udf_select_query: Template::new(select),
        udf_results: vec![UdfGenResult::Table(UdfGenTableResult {
            tablename_placeholder: MAIN_OUTPUT_PLACEHOLDER.to_owned(),
            table_schema: schema,
            drop_query: Template::new(format!("DROP TABLE IF EXISTS ${MAIN_OUTPUT_PLACEHOLDER};")),
            create_query: Template::new(create),
        })],
    }
}
