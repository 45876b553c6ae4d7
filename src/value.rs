/*!
 * The values a tensordict holds.
 *
 * Every entry is one of the variants of [`Value`]: a tensor, a nested tensordict, or
 * non-tensor data. Traversals dispatch on [`Value::kind`] rather than on the concrete variant
 * so that the decision of what counts as a leaf stays pluggable, see [`keys`](crate::keys).
 *
 * Anything that can be stored implements [`IntoValue`]. Numbers and booleans become 0
 * dimensional tensors, strings and JSON become non-tensor data, and lists of key value pairs
 * become nested tensordicts.
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::{NestedKey, ValueKind};
use crate::nontensor::{NonTensorData, NonTensorStack, Payload};
use crate::tensordict::TensorDict;
use crate::tensors::indexing::Index;
use crate::tensors::{DType, Device, Tensor, normalize_dim};

/**
 * A value held by a tensordict.
 */
#[derive(Clone, Debug)]
pub enum Value {
    Tensor(Tensor),
    Dict(TensorDict),
    NonTensor(NonTensorData),
    NonTensorStack(NonTensorStack),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Tensor(_) => ValueKind::Tensor,
            Value::Dict(td) => td.kind(),
            Value::NonTensor(_) => ValueKind::NonTensor,
            Value::NonTensorStack(_) => ValueKind::NonTensorStack,
        }
    }

    /**
     * The shape of a tensor, or the batch size of anything else.
     */
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Tensor(tensor) => tensor.shape().to_vec(),
            Value::Dict(td) => td.batch_size(),
            Value::NonTensor(data) => data.batch_size().to_vec(),
            Value::NonTensorStack(stack) => stack.batch_size().to_vec(),
        }
    }

    pub fn device(&self) -> Option<Device> {
        match self {
            Value::Tensor(tensor) => Some(tensor.device()),
            Value::Dict(td) => td.device(),
            Value::NonTensor(data) => data.device(),
            Value::NonTensorStack(stack) => stack.device(),
        }
    }

    /**
     * Copies tensors into new storage and containers into new nodes.
     */
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Tensor(tensor) => Value::Tensor(tensor.deep_clone()),
            Value::Dict(td) => Value::Dict(td.deep_clone()),
            other => other.clone(),
        }
    }

    /**
     * Moves this value to a device, or clears the device of containers and non-tensor data
     * if None. Tensors always keep a device.
     */
    pub fn to_device(&self, device: Option<Device>) -> Result<Value> {
        Ok(match (self, device) {
            (Value::Tensor(tensor), Some(device)) => Value::Tensor(tensor.to(device)),
            (Value::Tensor(_), None) => self.clone(),
            (Value::Dict(td), Some(device)) => Value::Dict(td.to(device)?),
            (Value::Dict(td), None) => {
                let copy = td.clone_structure();
                copy.clear_device_()?;
                Value::Dict(copy)
            }
            (Value::NonTensor(data), device) => Value::NonTensor(data.clone().with_device(device)),
            (Value::NonTensorStack(stack), device) => {
                Value::NonTensorStack(stack.clone().with_device(device))
            }
        })
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&TensorDict> {
        match self {
            Value::Dict(td) => Some(td),
            _ => None,
        }
    }

    pub fn as_non_tensor(&self) -> Option<&NonTensorData> {
        match self {
            Value::NonTensor(data) => Some(data),
            _ => None,
        }
    }

    /**
     * The payload of non-tensor data.
     */
    pub fn as_payload(&self) -> Option<&Payload> {
        self.as_non_tensor().map(NonTensorData::data)
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        match self {
            Value::Tensor(tensor) => Ok(tensor),
            other => Err(TensorDictError::type_mismatch(
                "Tensor",
                other.kind().to_string(),
            )),
        }
    }

    pub fn into_dict(self) -> Result<TensorDict> {
        match self {
            Value::Dict(td) => Ok(td),
            other => Err(TensorDictError::type_mismatch(
                "TensorDict",
                other.kind().to_string(),
            )),
        }
    }

    /**
     * Indexes the batch dimensions of this value. The indexes must already have had any
     * ellipsis expanded against the batch size of the container holding the value.
     */
    pub(crate) fn index_batch(&self, indexes: &[Index]) -> Result<Value> {
        Ok(match self {
            Value::Tensor(tensor) => Value::Tensor(tensor.index(indexes)?),
            Value::Dict(td) => Value::Dict(td.index(indexes)?),
            Value::NonTensor(data) => {
                let batch_size =
                    crate::tensors::indexing::indexed_shape(data.batch_size(), indexes)?;
                Value::NonTensor(data.with_batch_size(batch_size))
            }
            Value::NonTensorStack(stack) => stack.index(indexes)?,
        })
    }

    /**
     * Removes a batch dimension, returning each slice along it.
     */
    pub fn unbind(&self, dim: isize) -> Result<Vec<Value>> {
        match self {
            Value::Tensor(tensor) => Ok(tensor.unbind(dim)?.into_iter().map(Value::Tensor).collect()),
            Value::Dict(td) => Ok(td.unbind(dim)?.into_iter().map(Value::Dict).collect()),
            Value::NonTensor(data) => {
                let dim = normalize_dim(dim, data.batch_size().len())?;
                let mut batch_size = data.batch_size().to_vec();
                let length = batch_size.remove(dim);
                Ok((0..length)
                    .map(|_| Value::NonTensor(data.with_batch_size(batch_size.clone())))
                    .collect())
            }
            Value::NonTensorStack(stack) => {
                let dim = normalize_dim(dim, stack.batch_size().len())?;
                (0..stack.batch_size()[dim])
                    .map(|i| {
                        let mut indexes = vec![Index::full(); dim];
                        indexes.push(Index::At(i as isize));
                        stack.index(&indexes)
                    })
                    .collect()
            }
        }
    }

    // True if both values are the same tensor storage or the same container.
    pub(crate) fn same_identity(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => a.same_storage(b) && a.shape() == b.shape(),
            (Value::Dict(a), Value::Dict(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/**
 * Values are equal if they are the same kind of value with equal contents. Tensors compare
 * by shape and elements, containers by keys, batch size and entries.
 */
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Tensor(a), Value::Tensor(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::NonTensor(a), Value::NonTensor(b)) => a == b,
            (Value::NonTensorStack(a), Value::NonTensorStack(b)) => a == b,
            _ => false,
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Value {
        Value::Tensor(tensor)
    }
}

impl From<TensorDict> for Value {
    fn from(td: TensorDict) -> Value {
        Value::Dict(td)
    }
}

impl From<NonTensorData> for Value {
    fn from(data: NonTensorData) -> Value {
        Value::NonTensor(data)
    }
}

impl From<NonTensorStack> for Value {
    fn from(stack: NonTensorStack) -> Value {
        Value::NonTensorStack(stack)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Tensor(Tensor::scalar(x, DType::Float32))
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::Tensor(Tensor::scalar(x as f64, DType::Float32))
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Value {
        Value::Tensor(Tensor::scalar(x as f64, DType::Int64))
    }
}

impl From<i32> for Value {
    fn from(x: i32) -> Value {
        Value::Tensor(Tensor::scalar(x as f64, DType::Int64))
    }
}

impl From<bool> for Value {
    fn from(x: bool) -> Value {
        Value::Tensor(Tensor::scalar(x as u8 as f64, DType::Bool))
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Value {
        Value::NonTensor(NonTensorData::new(payload, []))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::from(Payload::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::from(Payload::from(s))
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Value {
        Value::from(Payload::Json(json))
    }
}

/**
 * Conversion into a [`Value`] that may fail, such as building a nested tensordict from a
 * list of key value pairs with an invalid key.
 */
pub trait IntoValue {
    fn into_value(self) -> Result<Value>;
}

macro_rules! into_value_from {
    ($($t:ty),*) => {
        $(
            impl IntoValue for $t {
                fn into_value(self) -> Result<Value> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

into_value_from!(
    Value,
    Tensor,
    TensorDict,
    NonTensorData,
    NonTensorStack,
    Payload,
    f64,
    f32,
    i64,
    i32,
    bool,
    &str,
    String,
    serde_json::Value
);

/**
 * A list of key value pairs becomes a nested tensordict with an empty batch size, which
 * takes on the batch size of the container it is set on.
 */
impl<K, V> IntoValue for Vec<(K, V)>
where
    K: Into<NestedKey>,
    V: IntoValue,
{
    fn into_value(self) -> Result<Value> {
        Ok(Value::Dict(TensorDict::from_entries(self, [])?))
    }
}

#[test]
fn scalars_become_zero_dimensional_tensors() {
    let value = 3i64.into_value().unwrap();
    assert_eq!(value.kind(), ValueKind::Tensor);
    assert_eq!(value.shape(), Vec::<usize>::new());
    assert_eq!(value.as_tensor().and_then(Tensor::item), Some(3.0));
    assert_eq!(value.as_tensor().map(Tensor::dtype), Some(DType::Int64));
    let text = "hello".into_value().unwrap();
    assert_eq!(text.kind(), ValueKind::NonTensor);
    assert_eq!(text.as_payload().and_then(Payload::as_str), Some("hello"));
}

#[test]
fn non_tensor_values_unbind_along_their_batch() {
    let value = Value::from(NonTensorData::new("x", [2, 3]));
    let pieces = value.unbind(1).unwrap();
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[0].shape(), vec![2]);
    assert!(Value::from(1.0).into_dict().is_err());
}
