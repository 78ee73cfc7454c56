//! The UDF contract layer.
//!
//! Step functions carry a declarative signature associating every parameter
//! with an I/O kind and a return description. Given the concrete runtime
//! arguments of one call, this crate checks the call against the signature,
//! unifies type variables, resolves the output schemas and generates the
//! database-executable artifacts. It is pure: nothing here touches the
//! network or a database.

pub mod args;
pub mod design_matrix;
pub mod generator;
pub mod iotypes;
pub mod registry;
pub mod templates;


pub use args::{
    convert_arguments,
    RelationArg,
    SecureTransferArg,
    SmpcArg,
    StateArg,
    TensorArg,
    TransferArg,
    UdfArg,
};
pub use design_matrix::{
    get_create_dummy_encoded_design_matrix_execution_queries,
    DesignMatrixArgs,
    DummyEnum,
    DESIGN_MATRIX_FUNC_NAME,
};
pub use generator::{
    generate_udf_queries,
    UdfExecutionQueries,
    UdfGenRequest,
    UdfGenResult,
    UdfGenSmpcResult,
    UdfGenTableResult,
    MAIN_OUTPUT_PLACEHOLDER,
    MIN_ROW_COUNT_PLACEHOLDER,
    REQUEST_ID_PLACEHOLDER,
    UDF_NAME_PLACEHOLDER,
};
pub use iotypes::{
    dtype_var,
    known_dtype,
    known_schema,
    literal,
    merge_tensor,
    merge_transfer,
    placeholder,
    relation,
    relation_out,
    schema_var,
    secure_transfer,
    secure_transfer_out,
    state,
    state_out,
    tensor,
    tensor_out,
    transfer,
    transfer_out,
    udf_logger,
    DTypeSpec,
    InputType,
    OutputType,
    SchemaSpec,
    SecureOps,
    TypeVar,
};
pub use registry::{
    UdfDefinition,
    UdfRegistry,
};
pub use templates::Template;
