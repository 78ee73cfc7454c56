//! The `run_udf` task: turn one step call into concrete SQL and execute it.
//!
//! The contract layer produces templated artifacts; this module allocates
//! the concrete output table names, binds every placeholder and drives the
//! store. `get_run_udf_query` does everything except the driving, for
//! debugging.

use std::{
    collections::BTreeMap,
    str::FromStr,
};

use common::{
    knobs::MINIMUM_ROW_COUNT,
    task_dtos::{
        RunUdfParams,
        SmpcTablesInfo,
        UdfArgument,
        UdfResult,
    },
    CommandId,
    ContextId,
    NodeId,
    RequestId,
    TableInfo,
    TableName,
    TableSchema,
    TableType,
};
use udfgen::{
    convert_arguments,
    generate_udf_queries,
    get_create_dummy_encoded_design_matrix_execution_queries,
    DesignMatrixArgs,
    Template,
    UdfExecutionQueries,
    UdfGenRequest,
    UdfGenResult,
    UdfGenTableResult,
    UdfRegistry,
    DESIGN_MATRIX_FUNC_NAME,
    MIN_ROW_COUNT_PLACEHOLDER,
    REQUEST_ID_PLACEHOLDER,
    UDF_NAME_PLACEHOLDER,
};

/// `{func_name}_{command_id}_{context_id}`: unique per step invocation, so
/// re-running a retried command under a fresh command id never collides.
fn create_udf_name(func_name: &str, command_id: &CommandId, context_id: &ContextId) -> String {
    format!("{func_name}_{command_id}_{context_id}")
}

struct BoundStatements {
    statements: Vec<String>,
    results: Vec<UdfResult>,
}

fn validate_table_types(args: &[UdfArgument]) -> anyhow::Result<()> {
    for arg in args {
        if let UdfArgument::Table { info } = arg {
            if let Ok(parsed) = TableName::from_str(&info.name) {
                anyhow::ensure!(
                    parsed.table_type == info.table_type,
                    "Table {} is not of type {:?}",
                    info.name,
                    info.table_type,
                );
            }
        }
    }
    Ok(())
}

fn generate(registry: &UdfRegistry, params: &RunUdfParams) -> anyhow::Result<UdfExecutionQueries> {
    if params.func_name == DESIGN_MATRIX_FUNC_NAME {
        let args = design_matrix_args(params)?;
        return Ok(get_create_dummy_encoded_design_matrix_execution_queries(
            &args,
        ));
    }
    let (positional_args, keyword_args) =
        convert_arguments(&params.positional_args, &params.keyword_args)?;
    generate_udf_queries(UdfGenRequest {
        registry,
        func_name: &params.func_name,
        positional_args,
        keyword_args,
        smpc_used: params.use_smpc,
        output_schema: params
            .output_schema
            .as_ref()
            .map(|s| s.columns.iter().map(|c| (c.name.clone(), c.dtype)).collect()),
    })
}

/// The design matrix builder is not a generated function; its arguments
/// come through the regular keyword channel.
fn design_matrix_args(params: &RunUdfParams) -> anyhow::Result<DesignMatrixArgs> {
    let table_name = match params.keyword_args.get("x") {
        Some(UdfArgument::Table { info }) => info.name.clone(),
        _ => anyhow::bail!("The design matrix builder needs a table argument named x"),
    };
    let literal = |name: &str| -> anyhow::Result<serde_json::Value> {
        match params.keyword_args.get(name) {
            Some(UdfArgument::Literal { value }) => Ok(value.clone()),
            _ => anyhow::bail!("The design matrix builder needs a literal argument named {name}"),
        }
    };
    Ok(DesignMatrixArgs {
        x_table_name: table_name,
        enums: serde_json::from_value(literal("enums")?)?,
        numerical_vars: serde_json::from_value(literal("numerical_vars")?)?,
        intercept: serde_json::from_value(literal("intercept")?)?,
    })
}

fn bind_statements(
    queries: &UdfExecutionQueries,
    node_id: &NodeId,
    request_id: &RequestId,
    context_id: &ContextId,
    command_id: &CommandId,
    func_name: &str,
) -> anyhow::Result<BoundStatements> {
    let mut mapping = BTreeMap::new();
    mapping.insert(
        UDF_NAME_PLACEHOLDER.to_owned(),
        create_udf_name(func_name, command_id, context_id),
    );
    mapping.insert(REQUEST_ID_PLACEHOLDER.to_owned(), request_id.to_string());
    mapping.insert(
        MIN_ROW_COUNT_PLACEHOLDER.to_owned(),
        MINIMUM_ROW_COUNT.to_string(),
    );

    let make_name = |result_id: String| -> anyhow::Result<String> {
        Ok(TableName::new(
            TableType::Normal,
            node_id.clone(),
            context_id.clone(),
            command_id.clone(),
            result_id,
        )?
        .to_string())
    };

    // Allocate concrete names for every output table, then pre-create them
    // so the loopback inserts in the generated function have somewhere to
    // write.
    let mut statements = Vec::new();
    let mut results = Vec::new();
    let bind_part = |part: &UdfGenTableResult,
                     result_id: String,
                     mapping: &mut BTreeMap<String, String>|
     -> anyhow::Result<TableInfo> {
        let name = make_name(result_id)?;
        mapping.insert(part.tablename_placeholder.clone(), name.clone());
        let schema = TableSchema::new(
            part.table_schema
                .iter()
                .map(|(n, d)| common::ColumnInfo::new(n.clone(), *d))
                .collect(),
        );
        Ok(TableInfo::new(name, schema, TableType::Normal))
    };
    let mut creates: Vec<&Template> = Vec::new();
    for (index, result) in queries.udf_results.iter().enumerate() {
        match result {
            UdfGenResult::Table(part) => {
                let info = bind_part(part, index.to_string(), &mut mapping)?;
                creates.extend([&part.drop_query, &part.create_query]);
                results.push(UdfResult::Table { info });
            },
            UdfGenResult::Smpc(smpc) => {
                let template = bind_part(&smpc.template, index.to_string(), &mut mapping)?;
                creates.extend([&smpc.template.drop_query, &smpc.template.create_query]);
                let op_info = |part: &Option<UdfGenTableResult>,
                               op: &str,
                               mapping: &mut BTreeMap<String, String>|
                 -> anyhow::Result<Option<TableInfo>> {
                    // Companion tables stay inside the grammar by using an
                    // operation-suffixed result id.
                    part.as_ref()
                        .map(|p| bind_part(p, format!("{index}{op}op"), mapping))
                        .transpose()
                };
                let sum_op = op_info(&smpc.sum_op_values, "sum", &mut mapping)?;
                let min_op = op_info(&smpc.min_op_values, "min", &mut mapping)?;
                let max_op = op_info(&smpc.max_op_values, "max", &mut mapping)?;
                for part in [&smpc.sum_op_values, &smpc.min_op_values, &smpc.max_op_values]
                    .into_iter()
                    .flatten()
                {
                    creates.extend([&part.drop_query, &part.create_query]);
                }
                results.push(UdfResult::SmpcTables {
                    info: SmpcTablesInfo {
                        template,
                        sum_op,
                        min_op,
                        max_op,
                    },
                });
            },
        }
    }

    for create in creates {
        statements.push(create.substitute(&mapping)?);
    }
    if !queries.udf_definition_query.text().is_empty() {
        statements.push(queries.udf_definition_query.substitute(&mapping)?);
    }
    statements.push(queries.udf_select_query.substitute(&mapping)?);

    Ok(BoundStatements {
        statements,
        results,
    })
}

pub async fn run_udf(
    store: &dyn crate::store::StoreClient,
    registry: &UdfRegistry,
    node_id: &NodeId,
    request_id: &RequestId,
    params: RunUdfParams,
) -> anyhow::Result<Vec<UdfResult>> {
    validate_table_types(&params.positional_args)?;
    validate_table_types(&params.keyword_args.values().cloned().collect::<Vec<_>>())?;
    let queries = generate(registry, &params)?;
    let bound = bind_statements(
        &queries,
        node_id,
        request_id,
        &params.context_id,
        &params.command_id,
        &params.func_name,
    )?;
    for statement in &bound.statements {
        store.execute(statement).await?;
    }
    Ok(bound.results)
}

pub fn get_run_udf_query(
    registry: &UdfRegistry,
    node_id: &NodeId,
    request_id: &RequestId,
    params: RunUdfParams,
) -> anyhow::Result<Vec<String>> {
    let queries = generate(registry, &params)?;
    let bound = bind_statements(
        &queries,
        node_id,
        request_id,
        &params.context_id,
        &params.command_id,
        &params.func_name,
    )?;
    Ok(bound.statements)
}
