/*!
 * Error types.
 *
 * Every fallible operation in this crate returns a [`TensorDictError`]. The variants follow
 * the kind of mistake made rather than the operation that noticed it, so a missing key reads
 * the same whether it was hit by [`get`](crate::TensorDict::get), by
 * [`apply_with`](crate::TensorDict::apply_with) or while loading a state dict.
 *
 * No operation returns a partially constructed result on failure, and structural mutations
 * are checked before anything is written.
 */

use thiserror::Error;

/**
 * The errors that can be returned by operations on tensors and tensordicts.
 */
#[derive(Debug, Error)]
pub enum TensorDictError {
    /**
     * A key was looked up that is not present.
     */
    #[error("key {key} not found, existing keys are {available:?}")]
    KeyNotFound { key: String, available: Vec<String> },
    /**
     * A key was empty or otherwise malformed.
     */
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /**
     * Flattening nested keys would alias distinct paths to the same string.
     */
    #[error("Flattening keys in tensordict causes keys {keys:?} to collide.")]
    KeyCollision { keys: Vec<String> },
    /**
     * Unflattening keys or renaming a key would overwrite an existing entry.
     */
    #[error("Unflattening key(s) in tensordict will override an existing for unflattened key {0}.")]
    KeyOverride(String),
    /**
     * A real key uses one of the names reserved by state dicts.
     */
    #[error("Cannot create a state dict from a tensordict with a {0} key, this name is reserved")]
    ReservedKey(String),
    /**
     * A strict state dict load found keys present on only one side.
     */
    #[error(
        "Cannot load state-dict because the key sets don't match: got state_dict extra keys \
         {state_dict_extra:?} and tensordict extra keys {tensordict_extra:?}"
    )]
    KeySetMismatch {
        state_dict_extra: Vec<String>,
        tensordict_extra: Vec<String>,
    },
    /**
     * A value's leading dimensions do not match the batch size of the container it was set on.
     */
    #[error(
        "batch dimension mismatch for key {key}: got a value of shape {found:?} which is not \
         compatible with the batch size {expected:?}"
    )]
    BatchSizeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    /**
     * Shapes are incompatible for a reshape, stack, concatenation or broadcast.
     */
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /**
     * A dimension is out of range for the number of dimensions available.
     */
    #[error("dimension {dim} is out of range for {ndim} dimensions")]
    InvalidDimension { dim: isize, ndim: usize },
    /**
     * An index is out of range for the length of the dimension it indexes.
     */
    #[error("index {index} is out of range for dimension {dim} of length {length}")]
    IndexOutOfRange {
        index: isize,
        dim: usize,
        length: usize,
    },
    /**
     * A structural mutation was attempted on a locked container.
     */
    #[error(
        "Cannot modify locked TensorDict. For in-place modification, consider using the \
         `set_()` method and make sure the key is present."
    )]
    Locked,
    /**
     * An unlock was attempted while a container that owns the lock is still locked.
     */
    #[error(
        "Cannot unlock a tensordict that is part of a locked graph. Unlock the root tensordict \
         first. Locked parent: {0}"
    )]
    LockedGraph(String),
    /**
     * A value was of a different kind than the operation requires.
     */
    #[error("expected {expected} but received {found}")]
    TypeMismatch { expected: String, found: String },
    /**
     * A value lives on a different device than the container expects.
     */
    #[error("device mismatch: expected {expected} but received {found}")]
    DeviceMismatch { expected: String, found: String },
    /**
     * A persisted directory names a type that has no registered loader.
     */
    #[error("the type {0} is not registered, cannot load it from disk")]
    UnregisteredType(String),
    /**
     * A single data value was requested from a stack of differing non-tensor values.
     */
    #[error(
        "cannot read a single data value from a stack of non-tensor data with differing \
         contents, use tolist() or index into it instead"
    )]
    NonTensorStackData,
    /**
     * The operation is not supported for this kind of value.
     */
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    /**
     * A worker of a map operation failed.
     */
    #[error("worker failed: {0}")]
    Worker(String),
    /**
     * A point to point transfer failed.
     */
    #[error("transport error: {0}")]
    Transport(String),
}

/**
 * A specialised Result type for operations that can return a [`TensorDictError`].
 */
pub type Result<T> = std::result::Result<T, TensorDictError>;

impl TensorDictError {
    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        TensorDictError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        TensorDictError::ShapeMismatch(message.into())
    }
}

#[test]
fn error_messages_name_the_offending_key() {
    let error = TensorDictError::KeyNotFound {
        key: "\"a\"".to_string(),
        available: vec!["b".to_string()],
    };
    assert_eq!(
        error.to_string(),
        "key \"a\" not found, existing keys are [\"b\"]"
    );
    let error = TensorDictError::KeyCollision {
        keys: vec!["(\"a\", \"b\")".to_string(), "\"a.b\"".to_string()],
    };
    assert!(error.to_string().contains("a.b"));
}
