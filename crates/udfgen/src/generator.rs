//! Artifact generation for one UDF call.
//!
//! Given a registered step definition and the concrete runtime arguments,
//! this module type-checks the call, resolves the output schemas and emits
//! the three database artifacts: the function definition text, the
//! invocation statement, and the drop/create statements for every output
//! table. All three are [`Template`]s: the worker binds `$udf_name`,
//! `$request_id`, `$min_row_count` and the output table names at execution
//! time.

use std::collections::BTreeMap;

use common::DType;
use errors::ErrorMetadata;
use itertools::Itertools;

use crate::{
    args::UdfArg,
    iotypes::{
        DTypeSpec,
        InputType,
        OutputType,
        SchemaSpec,
        SecureOps,
    },
    registry::{
        UdfDefinition,
        UdfRegistry,
    },
    templates::Template,
};

pub const MAIN_OUTPUT_PLACEHOLDER: &str = "main_output_table_name";
pub const UDF_NAME_PLACEHOLDER: &str = "udf_name";
pub const REQUEST_ID_PLACEHOLDER: &str = "request_id";
pub const MIN_ROW_COUNT_PLACEHOLDER: &str = "min_row_count";

const PRFX: &str = "    ";

pub struct UdfGenRequest<'a> {
    pub registry: &'a UdfRegistry,
    pub func_name: &'a str,
    pub positional_args: Vec<UdfArg>,
    pub keyword_args: BTreeMap<String, UdfArg>,
    pub smpc_used: bool,
    /// Caller-supplied schema for a deferred relation output.
    pub output_schema: Option<Vec<(String, DType)>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UdfGenTableResult {
    pub tablename_placeholder: String,
    pub table_schema: Vec<(String, DType)>,
    pub drop_query: Template,
    pub create_query: Template,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UdfGenSmpcResult {
    pub template: UdfGenTableResult,
    pub sum_op_values: Option<UdfGenTableResult>,
    pub min_op_values: Option<UdfGenTableResult>,
    pub max_op_values: Option<UdfGenTableResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UdfGenResult {
    Table(UdfGenTableResult),
    Smpc(UdfGenSmpcResult),
}

impl UdfGenResult {
    /// The placeholder-to-schema pairs this result needs tables created
    /// for, template first.
    pub fn table_parts(&self) -> Vec<&UdfGenTableResult> {
        match self {
            UdfGenResult::Table(t) => vec![t],
            UdfGenResult::Smpc(s) => [
                Some(&s.template),
                s.sum_op_values.as_ref(),
                s.min_op_values.as_ref(),
                s.max_op_values.as_ref(),
            ]
            .into_iter()
            .flatten()
            .collect(),
        }
    }
}

#[derive(Debug)]
pub struct UdfExecutionQueries {
    pub udf_definition_query: Template,
    pub udf_select_query: Template,
    pub udf_results: Vec<UdfGenResult>,
}

fn violation(msg: String) -> anyhow::Error {
    ErrorMetadata::udf_contract_violation("UdfBadCall", msg).into()
}

/// Type-check one UDF call against its registered definition and emit the
/// execution artifacts. Pure: no database activity happens here.
pub fn generate_udf_queries(request: UdfGenRequest) -> anyhow::Result<UdfExecutionQueries> {
    let def = request.registry.get(request.func_name)?.clone();
    let assigned = assign_arguments(&def, request.positional_args, request.keyword_args)?;
    let bindings = check_arguments(&def, &assigned, request.smpc_used)?;
    let outputs = resolve_outputs(&def, &bindings, request.output_schema)?;

    let definition = generate_definition(&def, &assigned, &outputs, request.smpc_used)?;
    let select = generate_exec_stmt(&assigned);
    let results = generate_results(&outputs, request.smpc_used);

    Ok(UdfExecutionQueries {
        udf_definition_query: Template::new(definition),
        udf_select_query: Template::new(select),
        udf_results: results,
    })
}

// ---------------------------------------------------------------------------
// Argument assignment
// ---------------------------------------------------------------------------

/// One parameter together with the runtime argument bound to it. Logger and
/// placeholder parameters carry no argument.
struct AssignedParam<'d> {
    name: &'d str,
    ptype: &'d InputType,
    arg: Option<UdfArg>,
}

fn assign_arguments(
    def: &UdfDefinition,
    positional_args: Vec<UdfArg>,
    mut keyword_args: BTreeMap<String, UdfArg>,
) -> anyhow::Result<Vec<AssignedParam<'_>>> {
    let supplied_count = def.supplied_parameters().count();
    let given_count = positional_args.len() + keyword_args.len();
    if given_count != supplied_count {
        return Err(violation(format!(
            "Udf {} takes {supplied_count} arguments, {given_count} were given",
            def.name
        )));
    }

    let mut positional = positional_args.into_iter();
    let mut assigned = Vec::with_capacity(def.parameters.len());
    for (name, ptype) in &def.parameters {
        if !ptype.is_supplied_by_caller() {
            if keyword_args.remove(name).is_some() {
                return Err(violation(format!(
                    "Parameter {name} of udf {} is not supplied from the algorithm flow",
                    def.name
                )));
            }
            assigned.push(AssignedParam {
                name,
                ptype,
                arg: None,
            });
            continue;
        }
        let arg = match keyword_args.remove(name) {
            Some(arg) => arg,
            None => positional.next().ok_or_else(|| {
                violation(format!("No argument provided for parameter {name} of udf {}", def.name))
            })?,
        };
        assigned.push(AssignedParam {
            name,
            ptype,
            arg: Some(arg),
        });
    }
    if let Some(name) = keyword_args.keys().next() {
        return Err(violation(format!(
            "Udf {} has no parameter named {name}",
            def.name
        )));
    }
    if positional.next().is_some() {
        return Err(violation(format!(
            "Udf {} was given more positional arguments than it has parameters",
            def.name
        )));
    }
    Ok(assigned)
}

// ---------------------------------------------------------------------------
// Type checking and type-variable unification
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Bindings {
    schemas: BTreeMap<&'static str, Vec<(String, DType)>>,
    dtypes: BTreeMap<&'static str, DType>,
}

impl Bindings {
    fn unify_schema(&mut self, var: &'static str, schema: &[(String, DType)]) -> anyhow::Result<()> {
        match self.schemas.get(var) {
            Some(bound) if bound.as_slice() != schema => Err(violation(format!(
                "Inconsistent bindings for type variable {var}: {bound:?} vs {schema:?}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.schemas.insert(var, schema.to_vec());
                Ok(())
            },
        }
    }

    fn unify_dtype(&mut self, var: &'static str, dtype: DType) -> anyhow::Result<()> {
        match self.dtypes.get(var) {
            Some(bound) if *bound != dtype => Err(violation(format!(
                "Inconsistent bindings for type variable {var}: {bound} vs {dtype}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.dtypes.insert(var, dtype);
                Ok(())
            },
        }
    }
}

fn kind_of(arg: &UdfArg) -> &'static str {
    match arg {
        UdfArg::Literal(_) => "literal",
        UdfArg::Relation(_) => "relation",
        UdfArg::Tensor(_) => "tensor",
        UdfArg::Transfer(_) => "transfer",
        UdfArg::State(_) => "state",
        UdfArg::SecureTransfer(_) => "secure_transfer",
        UdfArg::SmpcSecureTransfer(_) => "smpc secure_transfer tables",
    }
}

fn check_arguments(
    def: &UdfDefinition,
    assigned: &[AssignedParam<'_>],
    smpc_used: bool,
) -> anyhow::Result<Bindings> {
    let mut bindings = Bindings::default();
    for param in assigned {
        let Some(arg) = &param.arg else {
            continue;
        };
        let mismatch = || {
            violation(format!(
                "Parameter {} of udf {} is declared {:?} but was given a {} argument",
                param.name,
                def.name,
                param.ptype,
                kind_of(arg),
            ))
        };
        match (param.ptype, arg) {
            (InputType::Relation { schema }, UdfArg::Relation(rel)) => match schema {
                SchemaSpec::Known(known) if known != &rel.schema => {
                    return Err(violation(format!(
                        "Argument for parameter {} has schema {:?}, declared {known:?}",
                        param.name, rel.schema
                    )));
                },
                SchemaSpec::Known(_) => {},
                SchemaSpec::Var(var) => bindings.unify_schema(var.0, &rel.schema)?,
                SchemaSpec::Deferred => {
                    return Err(violation(format!(
                        "Parameter {} of udf {} cannot declare a deferred schema",
                        param.name, def.name
                    )));
                },
            },
            (
                InputType::Tensor { dtype, ndims } | InputType::MergeTensor { dtype, ndims },
                UdfArg::Tensor(tens),
            ) => {
                if *ndims != tens.ndims {
                    return Err(violation(format!(
                        "Argument for parameter {} has {} dimensions, declared {ndims}",
                        param.name, tens.ndims
                    )));
                }
                match dtype {
                    DTypeSpec::Known(known) if *known != tens.dtype => {
                        return Err(violation(format!(
                            "Argument for parameter {} has dtype {}, declared {known}",
                            param.name, tens.dtype
                        )));
                    },
                    DTypeSpec::Known(_) => {},
                    DTypeSpec::Var(var) => bindings.unify_dtype(var.0, tens.dtype)?,
                }
            },
            (InputType::Transfer, UdfArg::Transfer(_)) => {},
            (InputType::MergeTransfer, UdfArg::Transfer(_)) => {},
            (InputType::State, UdfArg::State(_)) => {},
            (InputType::SecureTransfer { .. }, UdfArg::SecureTransfer(_)) => {
                if smpc_used {
                    return Err(violation(format!(
                        "SMPC is used, parameter {} requires the template and operation \
                         tables, not a plain secure-transfer table",
                        param.name
                    )));
                }
            },
            (InputType::SecureTransfer { ops }, UdfArg::SmpcSecureTransfer(smpc)) => {
                if !smpc_used {
                    return Err(violation(format!(
                        "SMPC is not used, parameter {} takes a plain secure-transfer \
                         table, not an SMPC bundle",
                        param.name
                    )));
                }
                let declared = [
                    (ops.sum, smpc.sum_op_name.is_some(), "sum"),
                    (ops.min, smpc.min_op_name.is_some(), "min"),
                    (ops.max, smpc.max_op_name.is_some(), "max"),
                ];
                for (wanted, given, op) in declared {
                    if wanted != given {
                        return Err(violation(format!(
                            "Parameter {} declares {op}_op={wanted} but the SMPC bundle \
                             {} a {op} table",
                            param.name,
                            if given { "carries" } else { "lacks" },
                        )));
                    }
                }
            },
            (InputType::Literal, UdfArg::Literal(_)) => {},
            _ => return Err(mismatch()),
        }
    }
    Ok(bindings)
}

// ---------------------------------------------------------------------------
// Output resolution
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum OutputFlavor {
    Relation,
    Tensor,
    Transfer,
    State,
    SecureTransfer(SecureOps),
}

#[derive(Clone, Debug)]
struct ResolvedOutput {
    flavor: OutputFlavor,
    schema: Vec<(String, DType)>,
}

fn resolve_outputs(
    def: &UdfDefinition,
    bindings: &Bindings,
    output_schema: Option<Vec<(String, DType)>>,
) -> anyhow::Result<Vec<ResolvedOutput>> {
    def.output_types
        .iter()
        .map(|otype| {
            let resolved = match otype {
                OutputType::Relation { schema } => {
                    let schema = match schema {
                        SchemaSpec::Known(known) => known.clone(),
                        SchemaSpec::Var(var) => bindings
                            .schemas
                            .get(var.0)
                            .ok_or_else(|| {
                                violation(format!(
                                    "Type variable {} of udf {} is not bound by any input",
                                    var.0, def.name
                                ))
                            })?
                            .clone(),
                        SchemaSpec::Deferred => output_schema.clone().ok_or_else(|| {
                            violation(format!(
                                "Udf {} has a deferred output schema; the caller must \
                                 supply one",
                                def.name
                            ))
                        })?,
                    };
                    ResolvedOutput {
                        flavor: OutputFlavor::Relation,
                        schema,
                    }
                },
                OutputType::Tensor { dtype, ndims } => {
                    let dtype = match dtype {
                        DTypeSpec::Known(known) => *known,
                        DTypeSpec::Var(var) => *bindings.dtypes.get(var.0).ok_or_else(|| {
                            violation(format!(
                                "Type variable {} of udf {} is not bound by any input",
                                var.0, def.name
                            ))
                        })?,
                    };
                    let mut schema: Vec<(String, DType)> = (0..*ndims)
                        .map(|d| (format!("dim{d}"), DType::Int))
                        .collect();
                    schema.push(("val".to_owned(), dtype));
                    ResolvedOutput {
                        flavor: OutputFlavor::Tensor,
                        schema,
                    }
                },
                OutputType::Transfer => ResolvedOutput {
                    flavor: OutputFlavor::Transfer,
                    schema: vec![("transfer".to_owned(), DType::Json)],
                },
                OutputType::State => ResolvedOutput {
                    flavor: OutputFlavor::State,
                    schema: vec![("state".to_owned(), DType::Binary)],
                },
                OutputType::SecureTransfer { ops } => ResolvedOutput {
                    flavor: OutputFlavor::SecureTransfer(*ops),
                    schema: vec![("secure_transfer".to_owned(), DType::Json)],
                },
            };
            Ok(resolved)
        })
        .collect()
}

fn output_placeholder(index: usize) -> String {
    if index == 0 {
        MAIN_OUTPUT_PLACEHOLDER.to_owned()
    } else {
        format!("loopback_table_name_{}", index - 1)
    }
}

// ---------------------------------------------------------------------------
// Definition text
// ---------------------------------------------------------------------------

fn quote_cols(schema: &[(String, DType)]) -> String {
    schema
        .iter()
        .map(|(name, dtype)| format!("\"{name}\" {}", dtype.to_sql()))
        .join(",")
}

fn py_list(items: &[String]) -> String {
    format!("[{}]", items.iter().map(|s| format!("'{s}'")).join(", "))
}

/// Render a JSON value the way the store's embedded language spells it.
fn python_repr(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "None".to_owned(),
        serde_json::Value::Bool(true) => "True".to_owned(),
        serde_json::Value::Bool(false) => "False".to_owned(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f == f.trunc() && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
        },
        serde_json::Value::String(s) => {
            format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
        },
        serde_json::Value::Array(items) => {
            format!("[{}]", items.iter().map(python_repr).join(", "))
        },
        serde_json::Value::Object(entries) => {
            format!(
                "{{{}}}",
                entries
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", python_repr(v)))
                    .join(", ")
            )
        },
    }
}

fn table_def_line(kind: &str, param: &str, names: &[String]) -> String {
    let prefixed: Vec<String> = names.iter().map(|n| format!("{param}_{n}")).collect();
    let zip = format!(
        "{{name: _columns[name_w_prefix] for name, name_w_prefix in zip({}, {})}}",
        py_list(names),
        py_list(&prefixed),
    );
    match kind {
        "relation" => format!("{param} = udfio.from_relational_table({zip}, 'row_id')"),
        "tensor" => format!("{param} = udfio.from_tensor_table({zip})"),
        "merge_tensor" => format!("{param} = udfio.merge_tensor_to_list({zip})"),
        _ => unreachable!("table kinds are fixed"),
    }
}

fn param_setup_lines(param: &AssignedParam<'_>, smpc_used: bool) -> Vec<String> {
    let name = param.name;
    match (param.ptype, &param.arg) {
        (InputType::Relation { .. }, Some(UdfArg::Relation(rel))) => {
            let names: Vec<String> = rel.schema.iter().map(|(n, _)| n.clone()).collect();
            vec![table_def_line("relation", name, &names)]
        },
        (InputType::Tensor { .. }, Some(UdfArg::Tensor(tens))) => {
            let names = tensor_column_names(tens.ndims);
            vec![table_def_line("tensor", name, &names)]
        },
        (InputType::MergeTensor { .. }, Some(UdfArg::Tensor(tens))) => {
            let names = tensor_column_names(tens.ndims);
            vec![table_def_line("merge_tensor", name, &names)]
        },
        (InputType::Transfer, Some(UdfArg::Transfer(t))) => vec![
            format!(
                "__transfer_str = _conn.execute(\"SELECT transfer from {};\")[\"transfer\"][0]",
                t.table_name
            ),
            format!("{name} = json.loads(__transfer_str)"),
        ],
        (InputType::MergeTransfer, Some(UdfArg::Transfer(t))) => vec![
            format!(
                "__transfer_strs = _conn.execute(\"SELECT transfer from {};\")[\"transfer\"]",
                t.table_name
            ),
            format!("{name} = [json.loads(str) for str in __transfer_strs]"),
        ],
        (InputType::State, Some(UdfArg::State(s))) => vec![
            format!(
                "__state_str = _conn.execute(\"SELECT state from {};\")[\"state\"][0]",
                s.table_name
            ),
            format!("{name} = pickle.loads(__state_str)"),
        ],
        (InputType::SecureTransfer { .. }, Some(UdfArg::SecureTransfer(t))) => vec![
            format!(
                "__transfer_strs = _conn.execute(\"SELECT secure_transfer from {};\")\
                 [\"secure_transfer\"]",
                t.table_name
            ),
            "__transfers = [json.loads(str) for str in __transfer_strs]".to_owned(),
            format!("{name} = udfio.secure_transfers_to_merged_dict(__transfers)"),
        ],
        (InputType::SecureTransfer { .. }, Some(UdfArg::SmpcSecureTransfer(smpc))) => {
            debug_assert!(smpc_used);
            let mut lines = vec![
                format!(
                    "__template_str = _conn.execute(\"SELECT secure_transfer from {};\")\
                     [\"secure_transfer\"][0]",
                    smpc.template_name
                ),
                "__template = json.loads(__template_str)".to_owned(),
            ];
            for (op, table) in [
                ("sum", &smpc.sum_op_name),
                ("min", &smpc.min_op_name),
                ("max", &smpc.max_op_name),
            ] {
                match table {
                    Some(table) => {
                        lines.push(format!(
                            "__{op}_op_values_str = _conn.execute(\"SELECT secure_transfer \
                             from {table};\")[\"secure_transfer\"][0]"
                        ));
                        lines.push(format!("__{op}_op_values = json.loads(__{op}_op_values_str)"));
                    },
                    None => lines.push(format!("__{op}_op_values = None")),
                }
            }
            lines.push(format!(
                "{name} = udfio.construct_secure_transfer_dict(__template,__sum_op_values,\
                 __min_op_values,__max_op_values)"
            ));
            lines
        },
        (InputType::Literal, Some(UdfArg::Literal(value))) => {
            vec![format!("{name} = {}", python_repr(value))]
        },
        (InputType::Placeholder { name: ph }, None) => vec![format!("{name} = ${ph}")],
        (InputType::Logger, None) => {
            vec![format!(
                "{name} = udfio.get_logger('$udf_name', '$request_id')"
            )]
        },
        _ => unreachable!("arguments were checked before generation"),
    }
}

fn tensor_column_names(ndims: usize) -> Vec<String> {
    let mut names: Vec<String> = (0..ndims).map(|d| format!("dim{d}")).collect();
    names.push("val".to_owned());
    names
}

fn secondary_output_lines(
    index: usize,
    output: &ResolvedOutput,
    return_name: &str,
    smpc_used: bool,
) -> Vec<String> {
    let placeholder = output_placeholder(index);
    match &output.flavor {
        OutputFlavor::Transfer => vec![format!(
            "_conn.execute(f\"INSERT INTO ${placeholder} VALUES ('{{json.dumps({return_name})}}');\")"
        )],
        OutputFlavor::State => vec![format!(
            "_conn.execute(f\"INSERT INTO ${placeholder} VALUES \
             ('{{pickle.dumps({return_name}).hex()}}');\")"
        )],
        OutputFlavor::SecureTransfer(ops) if smpc_used => {
            let mut lines = vec![
                format!(
                    "template, sum_op, min_op, max_op = \
                     udfio.split_secure_transfer_dict({return_name})"
                ),
                format!(
                    "_conn.execute(f\"INSERT INTO ${placeholder} VALUES \
                     ('{{json.dumps(template)}}');\")"
                ),
            ];
            lines.extend(op_insert_lines(&placeholder, ops));
            lines
        },
        OutputFlavor::SecureTransfer(_) => vec![format!(
            "_conn.execute(f\"INSERT INTO ${placeholder} VALUES ('{{json.dumps({return_name})}}');\")"
        )],
        OutputFlavor::Relation | OutputFlavor::Tensor => {
            unreachable!("tabular secondary outputs are rejected at definition time")
        },
    }
}

fn op_insert_lines(placeholder: &str, ops: &SecureOps) -> Vec<String> {
    [("sum", ops.sum), ("min", ops.min), ("max", ops.max)]
        .into_iter()
        .filter(|(_, declared)| *declared)
        .map(|(op, _)| {
            format!(
                "_conn.execute(f\"INSERT INTO ${placeholder}_{op}_op VALUES \
                 ('{{json.dumps({op}_op)}}');\")"
            )
        })
        .collect()
}

fn return_lines(output: &ResolvedOutput, return_name: &str, smpc_used: bool) -> Vec<String> {
    match &output.flavor {
        OutputFlavor::Relation => vec![format!(
            "return udfio.as_relational_table({return_name}, 'row_id')"
        )],
        OutputFlavor::Tensor => vec![format!(
            "return udfio.as_tensor_table(numpy.array({return_name}))"
        )],
        OutputFlavor::Transfer => vec![format!("return json.dumps({return_name})")],
        OutputFlavor::State => vec![format!("return pickle.dumps({return_name})")],
        OutputFlavor::SecureTransfer(ops) if smpc_used => {
            let mut lines = vec![format!(
                "template, sum_op, min_op, max_op = \
                 udfio.split_secure_transfer_dict({return_name})"
            )];
            lines.extend(op_insert_lines(MAIN_OUTPUT_PLACEHOLDER, ops));
            lines.push("return json.dumps(template)".to_owned());
            lines
        },
        OutputFlavor::SecureTransfer(_) => vec![format!("return json.dumps({return_name})")],
    }
}

fn generate_definition(
    def: &UdfDefinition,
    assigned: &[AssignedParam<'_>],
    outputs: &[ResolvedOutput],
    smpc_used: bool,
) -> anyhow::Result<String> {
    let signature = assigned
        .iter()
        .filter_map(|param| match (&param.ptype, &param.arg) {
            (InputType::Relation { .. }, Some(UdfArg::Relation(rel))) => Some(
                rel.schema
                    .iter()
                    .map(|(col, dtype)| {
                        format!("\"{}_{col}\" {}", param.name, dtype.to_sql())
                    })
                    .join(","),
            ),
            (
                InputType::Tensor { .. } | InputType::MergeTensor { .. },
                Some(UdfArg::Tensor(tens)),
            ) => {
                let mut cols: Vec<String> = (0..tens.ndims)
                    .map(|d| format!("\"{}_dim{d}\" INT", param.name))
                    .collect();
                cols.push(format!("\"{}_val\" {}", param.name, tens.dtype.to_sql()));
                Some(cols.join(","))
            },
            _ => None,
        })
        .join(",");

    let needs_pickle = has_state(def);
    let needs_json = has_json_artifacts(def);

    let mut body_lines: Vec<String> = vec!["import pandas as pd".to_owned(), "import udfio".to_owned()];
    if needs_pickle {
        body_lines.push("import pickle".to_owned());
    }
    if needs_json {
        body_lines.push("import json".to_owned());
    }
    for param in assigned {
        body_lines.extend(param_setup_lines(param, smpc_used));
    }
    body_lines.extend(
        def.body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.to_owned()),
    );
    for (index, (output, return_name)) in
        outputs.iter().zip(&def.return_names).enumerate().skip(1)
    {
        body_lines.extend(secondary_output_lines(index, output, return_name, smpc_used));
    }
    body_lines.extend(return_lines(&outputs[0], &def.return_names[0], smpc_used));

    let mut text = String::new();
    text.push_str("CREATE OR REPLACE FUNCTION\n");
    text.push_str(&format!("${UDF_NAME_PLACEHOLDER}({signature})\n"));
    text.push_str("RETURNS\n");
    text.push_str(&format!("TABLE({})\n", quote_cols(&outputs[0].schema)));
    text.push_str("LANGUAGE PYTHON\n");
    text.push_str("{\n");
    for line in &body_lines {
        text.push_str(PRFX);
        text.push_str(line);
        text.push('\n');
    }
    text.push('}');
    Ok(text)
}

fn has_state(def: &UdfDefinition) -> bool {
    def.parameters
        .iter()
        .any(|(_, p)| matches!(p, InputType::State))
        || def
            .output_types
            .iter()
            .any(|o| matches!(o, OutputType::State))
}

fn has_json_artifacts(def: &UdfDefinition) -> bool {
    def.parameters.iter().any(|(_, p)| {
        matches!(
            p,
            InputType::Transfer | InputType::MergeTransfer | InputType::SecureTransfer { .. }
        )
    }) || def.output_types.iter().any(|o| {
        matches!(
            o,
            OutputType::Transfer | OutputType::SecureTransfer { .. }
        )
    })
}

// ---------------------------------------------------------------------------
// Invocation statement
// ---------------------------------------------------------------------------

fn generate_exec_stmt(assigned: &[AssignedParam<'_>]) -> String {
    struct TableArg {
        table_name: String,
        columns: Vec<String>,
        joins: bool,
        join_columns: Vec<String>,
    }

    let table_args: Vec<TableArg> = assigned
        .iter()
        .filter_map(|param| match (&param.ptype, &param.arg) {
            (InputType::Relation { .. }, Some(UdfArg::Relation(rel))) => Some(TableArg {
                table_name: rel.table_name.clone(),
                columns: rel.schema.iter().map(|(n, _)| n.clone()).collect(),
                joins: true,
                join_columns: vec!["row_id".to_owned()],
            }),
            (InputType::Tensor { .. }, Some(UdfArg::Tensor(tens))) => Some(TableArg {
                table_name: tens.table_name.clone(),
                columns: tensor_column_names(tens.ndims),
                joins: true,
                join_columns: (0..tens.ndims).map(|d| format!("dim{d}")).collect(),
            }),
            (InputType::MergeTensor { .. }, Some(UdfArg::Tensor(tens))) => Some(TableArg {
                table_name: tens.table_name.clone(),
                columns: tensor_column_names(tens.ndims),
                joins: false,
                join_columns: Vec::new(),
            }),
            _ => None,
        })
        .collect();

    if table_args.is_empty() {
        return format!(
            "INSERT INTO ${MAIN_OUTPUT_PLACEHOLDER}\nSELECT\n    *\nFROM\n    \
             ${UDF_NAME_PLACEHOLDER}();"
        );
    }

    let select_cols = table_args
        .iter()
        .flat_map(|t| {
            t.columns
                .iter()
                .map(move |col| format!("{}.\"{col}\"", t.table_name))
        })
        .map(|col| format!("            {col}"))
        .join(",\n");

    let from_tables = table_args
        .iter()
        .map(|t| t.table_name.clone())
        .unique()
        .map(|t| format!("            {t}"))
        .join(",\n");

    let joining: Vec<&TableArg> = table_args.iter().filter(|t| t.joins).collect();
    let mut join_clauses = Vec::new();
    if let Some((head, tail)) = joining.split_first() {
        for other in tail {
            for col in &head.join_columns {
                join_clauses.push(format!(
                    "{}.\"{col}\"={}.\"{col}\"",
                    head.table_name, other.table_name
                ));
            }
        }
    }

    let mut stmt = format!(
        "INSERT INTO ${MAIN_OUTPUT_PLACEHOLDER}\nSELECT\n    *\nFROM\n    \
         ${UDF_NAME_PLACEHOLDER}((\n        SELECT\n{select_cols}\n        FROM\n{from_tables}"
    );
    if !join_clauses.is_empty() {
        stmt.push_str("\n        WHERE\n");
        stmt.push_str(
            &join_clauses
                .iter()
                .map(|clause| format!("            {clause}"))
                .join(" AND\n"),
        );
    }
    stmt.push_str("\n    ));");
    stmt
}

// ---------------------------------------------------------------------------
// Output table artifacts
// ---------------------------------------------------------------------------

fn table_result(placeholder: String, schema: Vec<(String, DType)>) -> UdfGenTableResult {
    let drop_query = Template::new(format!("DROP TABLE IF EXISTS ${placeholder};"));
    let create_query = Template::new(format!(
        "CREATE TABLE ${placeholder}({});",
        quote_cols(&schema)
    ));
    UdfGenTableResult {
        tablename_placeholder: placeholder,
        table_schema: schema,
        drop_query,
        create_query,
    }
}

fn generate_results(outputs: &[ResolvedOutput], smpc_used: bool) -> Vec<UdfGenResult> {
    outputs
        .iter()
        .enumerate()
        .map(|(index, output)| {
            let placeholder = output_placeholder(index);
            match &output.flavor {
                OutputFlavor::SecureTransfer(ops) if smpc_used => {
                    let op_result = |declared: bool, op: &str| {
                        declared.then(|| {
                            table_result(format!("{placeholder}_{op}_op"), output.schema.clone())
                        })
                    };
                    UdfGenResult::Smpc(UdfGenSmpcResult {
                        sum_op_values: op_result(ops.sum, "sum"),
                        min_op_values: op_result(ops.min, "min"),
                        max_op_values: op_result(ops.max, "max"),
                        template: table_result(placeholder, output.schema.clone()),
                    })
                },
                _ => UdfGenResult::Table(table_result(placeholder, output.schema.clone())),
            }
        })
        .collect()
}
