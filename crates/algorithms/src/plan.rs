//! The step-plan model the executor interprets.
//!
//! An algorithm is an explicit value: which data views it needs, a
//! sequence of steps over registered UDFs, and an extractor mapping the
//! terminal table to the response payload. Building the plan happens once
//! per request, before any worker is contacted, so parameter problems
//! surface as user errors without touching the federation.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    DType,
    TableData,
};

/// Where one step runs: fanned out to every participating local worker, or
/// on the single global worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepTarget {
    LocalWorkers,
    GlobalWorker,
}

/// A value fed into a step parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum StepInput {
    /// The data view created from variable group `group`.
    DataView { group: usize },
    /// Output `output` of the earlier step `step`.
    Previous { step: usize, output: usize },
    /// A constant from the request parameters.
    Literal(serde_json::Value),
}

#[derive(Clone, Debug)]
pub struct Step {
    /// Name in the UDF registry.
    pub func_name: String,
    pub target: StepTarget,
    /// Keyword arguments, in the declared parameter order.
    pub keyword_args: Vec<(String, StepInput)>,
    /// Per output: whether it is shared to the opposite side after this
    /// step (locals to global, or global to locals).
    pub share_outputs: Vec<bool>,
    /// Concrete schema for a step whose output schema is deferred.
    pub output_schema: Option<Vec<(String, DType)>>,
}

/// Maps the terminal step's fetched table to the algorithm's JSON result.
pub type ResultExtractor =
    Arc<dyn Fn(&TableData) -> anyhow::Result<serde_json::Value> + Send + Sync>;

#[derive(Clone)]
pub struct AlgorithmPlan {
    /// One data view is created per variable group, on every local worker.
    pub variable_groups: Vec<Vec<String>>,
    pub dropna: bool,
    pub check_min_rows: bool,
    pub steps: Vec<Step>,
    pub result: ResultExtractor,
}

impl std::fmt::Debug for AlgorithmPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmPlan")
            .field("variable_groups", &self.variable_groups)
            .field("dropna", &self.dropna)
            .field("check_min_rows", &self.check_min_rows)
            .field("steps", &self.steps)
            .field("result", &"<result extractor fn>")
            .finish()
    }
}

/// The request-derived inputs a plan is built from.
#[derive(Clone, Debug, Default)]
pub struct AlgorithmInput {
    pub x: Vec<String>,
    pub y: Vec<String>,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Read the single JSON blob out of a fetched transfer table.
pub fn get_transfer_data(table_data: &TableData) -> anyhow::Result<serde_json::Value> {
    let column = table_data.column("transfer")?;
    let value = column
        .values
        .first()
        .ok_or_else(|| anyhow::anyhow!("Transfer table {} is empty", table_data.name))?;
    let text = value
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Transfer column of {} is not text", table_data.name))?;
    Ok(serde_json::from_str(text)?)
}
