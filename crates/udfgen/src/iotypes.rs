//! The declared I/O kinds of step functions.
//!
//! A step's signature is a static value built at algorithm-load time: every
//! parameter carries one of the kinds below, and the generator checks the
//! runtime arguments against them before any database activity.

use common::DType;

/// A type variable shared between parameters and outputs, e.g. "all
/// relation inputs and the relation output have schema S".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeVar(pub &'static str);

/// A relation schema: statically known, shared through a type variable, or
/// deferred until call time (used by steps whose schema is computed from
/// enumerations, like the dummy-encoding pre-processing).
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaSpec {
    Known(Vec<(String, DType)>),
    Var(TypeVar),
    Deferred,
}

/// A tensor element dtype: statically known or shared through a variable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DTypeSpec {
    Known(DType),
    Var(TypeVar),
}

/// Which aggregation operations a secure-transfer artifact declares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecureOps {
    pub sum: bool,
    pub min: bool,
    pub max: bool,
}

impl SecureOps {
    pub fn any(&self) -> bool {
        self.sum || self.min || self.max
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InputType {
    /// Tabular input with a schema; relation arguments are joined on
    /// `row_id` in the invocation.
    Relation { schema: SchemaSpec },
    /// Integer dimension columns plus one value column; tensor arguments
    /// are joined on their dimension columns.
    Tensor { dtype: DTypeSpec, ndims: usize },
    /// A union of per-worker tensors; read as a list, never joined.
    MergeTensor { dtype: DTypeSpec, ndims: usize },
    /// One JSON blob.
    Transfer,
    /// A list of JSON blobs aggregated across workers.
    MergeTransfer,
    /// One opaque binary blob, private to the producing worker.
    State,
    /// A JSON blob with declared aggregation operations; fed either by a
    /// union of per-worker outputs (SMPC off) or by a template plus
    /// per-operation value tables (SMPC on).
    SecureTransfer { ops: SecureOps },
    /// A scalar materialized as a constant in the generated body.
    Literal,
    /// A named hole bound by the worker at execution time.
    Placeholder { name: &'static str },
    /// A synthetic parameter giving the step a tagged logger; never
    /// supplied by the caller.
    Logger,
}

impl InputType {
    /// Whether the caller supplies a value for this parameter.
    pub fn is_supplied_by_caller(&self) -> bool {
        !matches!(self, InputType::Placeholder { .. } | InputType::Logger)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputType {
    Relation { schema: SchemaSpec },
    Tensor { dtype: DTypeSpec, ndims: usize },
    Transfer,
    State,
    SecureTransfer { ops: SecureOps },
}

// Constructors named after the original decorator DSL, so algorithm
// signatures read the way their authors wrote them.

pub fn relation(schema: SchemaSpec) -> InputType {
    InputType::Relation { schema }
}

pub fn tensor(dtype: DTypeSpec, ndims: usize) -> InputType {
    InputType::Tensor { dtype, ndims }
}

pub fn merge_tensor(dtype: DTypeSpec, ndims: usize) -> InputType {
    InputType::MergeTensor { dtype, ndims }
}

pub fn transfer() -> InputType {
    InputType::Transfer
}

pub fn merge_transfer() -> InputType {
    InputType::MergeTransfer
}

pub fn state() -> InputType {
    InputType::State
}

pub fn secure_transfer(sum_op: bool, min_op: bool, max_op: bool) -> InputType {
    InputType::SecureTransfer {
        ops: SecureOps {
            sum: sum_op,
            min: min_op,
            max: max_op,
        },
    }
}

pub fn literal() -> InputType {
    InputType::Literal
}

pub fn placeholder(name: &'static str) -> InputType {
    InputType::Placeholder { name }
}

pub fn udf_logger() -> InputType {
    InputType::Logger
}

pub fn relation_out(schema: SchemaSpec) -> OutputType {
    OutputType::Relation { schema }
}

pub fn tensor_out(dtype: DTypeSpec, ndims: usize) -> OutputType {
    OutputType::Tensor { dtype, ndims }
}

pub fn transfer_out() -> OutputType {
    OutputType::Transfer
}

pub fn state_out() -> OutputType {
    OutputType::State
}

pub fn secure_transfer_out(sum_op: bool, min_op: bool, max_op: bool) -> OutputType {
    OutputType::SecureTransfer {
        ops: SecureOps {
            sum: sum_op,
            min: min_op,
            max: max_op,
        },
    }
}

pub fn schema_var(name: &'static str) -> SchemaSpec {
    SchemaSpec::Var(TypeVar(name))
}

pub fn known_schema<S: Into<String>>(columns: Vec<(S, DType)>) -> SchemaSpec {
    SchemaSpec::Known(
        columns
            .into_iter()
            .map(|(name, dtype)| (name.into(), dtype))
            .collect(),
    )
}

pub fn dtype_var(name: &'static str) -> DTypeSpec {
    DTypeSpec::Var(TypeVar(name))
}

pub fn known_dtype(dtype: DType) -> DTypeSpec {
    DTypeSpec::Known(dtype)
}
