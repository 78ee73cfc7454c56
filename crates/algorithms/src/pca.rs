//! Principal component analysis, with optional per-column data
//! transformations applied as a local pre-processing step.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::DType;
use errors::ErrorMetadata;
use udfgen::{
    literal,
    relation,
    relation_out,
    schema_var,
    secure_transfer,
    secure_transfer_out,
    state,
    state_out,
    transfer,
    transfer_out,
    SchemaSpec,
    UdfDefinition,
    UdfRegistry,
};

use crate::{
    plan::{
        get_transfer_data,
        AlgorithmInput,
        AlgorithmPlan,
        Step,
        StepInput,
        StepTarget,
    },
    registry::{
        AlgorithmDef,
        AlgorithmRegistry,
        AlgorithmSpecification,
        ParameterSpec,
    },
};

pub const ALGORITHM_NAME: &str = "pca_with_transformation";
const TRANSFORM_UDF: &str = "pca_local_data_processing";
const LOCAL1_UDF: &str = "pca_local1";
const GLOBAL1_UDF: &str = "pca_global1";
const LOCAL2_UDF: &str = "pca_local2";
const GLOBAL2_UDF: &str = "pca_global2";

const KNOWN_TRANSFORMATIONS: [&str; 4] = ["log", "exp", "center", "standardize"];

pub fn register(
    algorithms: &mut AlgorithmRegistry,
    udfs: &mut UdfRegistry,
) -> anyhow::Result<()> {
    udfs.register(
        UdfDefinition::builder(TRANSFORM_UDF)
            .parameter("data", relation(schema_var("S")))
            .parameter("data_transformation_dict", literal())
            .output(relation_out(SchemaSpec::Deferred))
            .body(
                r#"import numpy as np
for transformation, variables in data_transformation_dict.items():
    if transformation == 'log':
        for variable in variables:
            if (data[variable] <= 0).any():
                raise ValueError(f"Log transformation cannot be applied to non-positive values in column '{variable}'.")
            data[variable] = np.log(data[variable])
    elif transformation == 'exp':
        for variable in variables:
            data[variable] = np.exp(data[variable])
    elif transformation == 'center':
        for variable in variables:
            data[variable] = data[variable] - np.mean(data[variable])
    elif transformation == 'standardize':
        for variable in variables:
            std = np.std(data[variable])
            if std == 0:
                raise ValueError(f"Standardization cannot be applied to column '{variable}' because the standard deviation is zero.")
            data[variable] = (data[variable] - np.mean(data[variable])) / std
    else:
        raise ValueError(f'Unknown transformation: {transformation}')
data_res = pd.DataFrame(data=data, index=data.index, columns=data.columns)"#,
            )
            .returns(["data_res"])
            .build()?,
    )?;

    udfs.register(
        UdfDefinition::builder(LOCAL1_UDF)
            .parameter("x", relation(schema_var("S")))
            .output(secure_transfer_out(true, false, false))
            .body(
                r#"n_obs = len(x)
sx = numpy.einsum('ij->j', x)
sxx = numpy.einsum('ij,ij->j', x, x)
transfer_ = {}
transfer_['n_obs'] = {'data': n_obs, 'operation': 'sum', 'type': 'int'}
transfer_['sx'] = {'data': sx.tolist(), 'operation': 'sum', 'type': 'float'}
transfer_['sxx'] = {'data': sxx.tolist(), 'operation': 'sum', 'type': 'float'}"#,
            )
            .returns(["transfer_"])
            .build()?,
    )?;

    udfs.register(
        UdfDefinition::builder(GLOBAL1_UDF)
            .parameter("local_transfers", secure_transfer(true, false, false))
            .output(state_out())
            .output(transfer_out())
            .body(
                r#"n_obs = local_transfers['n_obs']
sx = numpy.array(local_transfers['sx'])
sxx = numpy.array(local_transfers['sxx'])
means = sx / n_obs
sigmas = ((sxx - n_obs * means ** 2) / (n_obs - 1)) ** 0.5
state_ = dict(n_obs=n_obs)
transfer_ = dict(means=means.tolist(), sigmas=sigmas.tolist())"#,
            )
            .returns(["state_", "transfer_"])
            .build()?,
    )?;

    udfs.register(
        UdfDefinition::builder(LOCAL2_UDF)
            .parameter("x", relation(schema_var("S")))
            .parameter("global_transfer", transfer())
            .output(secure_transfer_out(true, false, false))
            .body(
                r#"means = numpy.array(global_transfer['means'])
sigmas = numpy.array(global_transfer['sigmas'])
x = x.values
out = numpy.empty(x.shape)
numpy.subtract(x, means, out=out)
numpy.divide(out, sigmas, out=out)
gramian = numpy.einsum('ji,jk->ik', out, out)
transfer_ = {'gramian': {'data': gramian.tolist(), 'operation': 'sum', 'type': 'float'}}"#,
            )
            .returns(["transfer_"])
            .build()?,
    )?;

    udfs.register(
        UdfDefinition::builder(GLOBAL2_UDF)
            .parameter("local_transfers", secure_transfer(true, false, false))
            .parameter("prev_state", state())
            .output(transfer_out())
            .body(
                r#"gramian = numpy.array(local_transfers['gramian'])
n_obs = prev_state['n_obs']
covariance = gramian / (n_obs - 1)
eigenvalues, eigenvectors = numpy.linalg.eig(covariance)
idx = eigenvalues.argsort()[::-1]
eigenvalues = eigenvalues[idx]
eigenvectors = eigenvectors[:, idx]
eigenvectors = eigenvectors.T
transfer_ = dict(n_obs=n_obs, eigenvalues=eigenvalues.tolist(), eigenvectors=eigenvectors.tolist())"#,
            )
            .returns(["transfer_"])
            .build()?,
    )?;

    algorithms.register(AlgorithmDef {
        specification: AlgorithmSpecification {
            name: ALGORITHM_NAME.to_owned(),
            label: "PCA with data transformation".to_owned(),
            description: "Principal component analysis with optional log/exp/center/standardize \
                          pre-processing"
                .to_owned(),
            parameters: vec![ParameterSpec {
                name: "data_transformation".to_owned(),
                label: "Per-transformation variable lists".to_owned(),
                enums: Some(KNOWN_TRANSFORMATIONS.iter().map(|s| s.to_string()).collect()),
                min: None,
                max: None,
                notblank: false,
            }],
        },
        build_plan: Arc::new(build_plan),
    })
}

fn build_plan(input: &AlgorithmInput) -> anyhow::Result<AlgorithmPlan> {
    if input.y.is_empty() {
        return Err(ErrorMetadata::bad_user_input(
            "InvalidAlgorithmParameters",
            "y variables are required",
        )
        .into());
    }

    let mut steps = Vec::new();
    let transformation = match input.parameters.get("data_transformation") {
        Some(value) => Some(validate_transformations(value, &input.y)?),
        None => None,
    };

    // When pre-processing runs, its output replaces the primary view as
    // every later local step's input.
    let x_input = if let Some(transformation) = transformation {
        let output_schema: Vec<(String, DType)> = std::iter::once(("row_id".to_owned(), DType::Int))
            .chain(input.y.iter().map(|v| (v.clone(), DType::Float)))
            .collect();
        steps.push(Step {
            func_name: TRANSFORM_UDF.to_owned(),
            target: StepTarget::LocalWorkers,
            keyword_args: vec![
                ("data".to_owned(), StepInput::DataView { group: 0 }),
                (
                    "data_transformation_dict".to_owned(),
                    StepInput::Literal(transformation),
                ),
            ],
            share_outputs: vec![false],
            output_schema: Some(output_schema),
        });
        StepInput::Previous { step: 0, output: 0 }
    } else {
        StepInput::DataView { group: 0 }
    };
    let offset = steps.len();

    steps.push(Step {
        func_name: LOCAL1_UDF.to_owned(),
        target: StepTarget::LocalWorkers,
        keyword_args: vec![("x".to_owned(), x_input.clone())],
        share_outputs: vec![true],
        output_schema: None,
    });
    steps.push(Step {
        func_name: GLOBAL1_UDF.to_owned(),
        target: StepTarget::GlobalWorker,
        keyword_args: vec![(
            "local_transfers".to_owned(),
            StepInput::Previous { step: offset, output: 0 },
        )],
        share_outputs: vec![false, true],
        output_schema: None,
    });
    steps.push(Step {
        func_name: LOCAL2_UDF.to_owned(),
        target: StepTarget::LocalWorkers,
        keyword_args: vec![
            ("x".to_owned(), x_input),
            (
                "global_transfer".to_owned(),
                StepInput::Previous { step: offset + 1, output: 1 },
            ),
        ],
        share_outputs: vec![true],
        output_schema: None,
    });
    steps.push(Step {
        func_name: GLOBAL2_UDF.to_owned(),
        target: StepTarget::GlobalWorker,
        keyword_args: vec![
            (
                "local_transfers".to_owned(),
                StepInput::Previous { step: offset + 2, output: 0 },
            ),
            (
                "prev_state".to_owned(),
                StepInput::Previous { step: offset + 1, output: 0 },
            ),
        ],
        share_outputs: vec![false],
        output_schema: None,
    });

    Ok(AlgorithmPlan {
        variable_groups: vec![input.y.clone()],
        dropna: true,
        check_min_rows: true,
        steps,
        result: Arc::new(|table_data| {
            let data = get_transfer_data(table_data)?;
            Ok(serde_json::json!({
                "title": "Eigenvalues and Eigenvectors",
                "n_obs": data["n_obs"],
                "eigenvalues": data["eigenvalues"],
                "eigenvectors": data["eigenvectors"],
            }))
        }),
    })
}

/// The transformation dict is user input: unknown transformation names and
/// variables outside the requested y list are rejected before any worker
/// is contacted. (Value-dependent problems, like a log of a non-positive
/// column, can only surface when the step runs.)
fn validate_transformations(
    value: &serde_json::Value,
    y: &[String],
) -> anyhow::Result<serde_json::Value> {
    let user_error = |msg: String| -> anyhow::Error {
        ErrorMetadata::bad_user_input("InvalidAlgorithmParameters", msg).into()
    };
    let map: BTreeMap<String, Vec<String>> = serde_json::from_value(value.clone())
        .map_err(|_| {
            user_error(
                "data_transformation must map transformation names to variable lists".to_owned(),
            )
        })?;
    for (transformation, variables) in &map {
        if !KNOWN_TRANSFORMATIONS.contains(&transformation.as_str()) {
            return Err(user_error(format!("Unknown transformation: {transformation}")));
        }
        for variable in variables {
            if !y.contains(variable) {
                return Err(user_error(format!(
                    "Transformation {transformation} references variable {variable}, which is \
                     not among the requested variables"
                )));
            }
        }
    }
    Ok(value.clone())
}
