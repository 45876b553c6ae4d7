/*!
 * Non-tensor data.
 *
 * A tensordict can hold values that are not tensors, such as strings, configuration or
 * arbitrary user objects, addressed through the same keys as its tensors. Such a value is
 * wrapped in a [`NonTensorData`], which carries a batch size like any other entry and
 * describes the whole batch with a single [`Payload`].
 *
 * When values that differ are stacked, there is no longer one value that describes the whole
 * batch, so the result is a [`NonTensorStack`] holding one payload per batch element.
 * Stacking values that are all equal keeps the single payload and only extends the batch
 * size.
 *
 * ```
 * use easy_tensordict::nontensor::{stack_non_tensor, NonTensorData};
 * use easy_tensordict::Value;
 * let same = vec![Value::from(NonTensorData::new("cat", [])); 3];
 * let stacked = stack_non_tensor(&same, 0).unwrap();
 * assert_eq!(stacked.shape(), vec![3]);
 * assert!(matches!(stacked, Value::NonTensor(_)));
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensors::indexing::{Index, index_offsets};
use crate::tensors::operations::{cat_flat, stack_flat};
use crate::tensors::{
    DType, Device, Tensor, broadcast_offsets, elements, normalize_dim, permute_offsets,
};
use crate::value::Value;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/**
 * The content of a non-tensor entry.
 *
 * JSON values and bytes are compared by content and can be persisted to disk. Arbitrary
 * objects are compared by identity and can only live in memory.
 */
#[derive(Clone)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
    Object(Arc<dyn Any + Send + Sync>),
}

impl Payload {
    /**
     * Wraps an arbitrary value.
     */
    pub fn object<T: Any + Send + Sync>(value: T) -> Payload {
        Payload::Object(Arc::new(value))
    }

    /**
     * Returns a reference to the wrapped object if it is of type T.
     */
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Payload::Object(object) => object.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(json) => Some(json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(|json| json.as_str())
    }

    fn as_number(&self) -> Option<(f64, DType)> {
        match self.as_json()? {
            serde_json::Value::Bool(b) => Some((*b as u8 as f64, DType::Bool)),
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => {
                Some((n.as_f64()?, DType::Int64))
            }
            serde_json::Value::Number(n) => Some((n.as_f64()?, DType::Float32)),
            _ => None,
        }
    }

    fn combine(&self, other: &Payload, operation: &str) -> Result<Payload> {
        use serde_json::Value as Json;
        let combined = match (self.as_json(), other.as_json()) {
            (Some(Json::Bool(a)), Some(Json::Bool(b))) => Some(Json::Bool(match operation {
                "or" => a | b,
                _ => a ^ b,
            })),
            (Some(Json::Number(a)), Some(Json::Number(b))) => {
                match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) => Some(Json::from(match operation {
                        "or" => a | b,
                        _ => a ^ b,
                    })),
                    _ => None,
                }
            }
            _ => None,
        };
        combined.map(Payload::Json).ok_or_else(|| {
            TensorDictError::Unsupported(format!(
                "bitwise {} between {:?} and {:?}",
                operation, self, other
            ))
        })
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Json(a), Payload::Json(b)) => a == b,
            (Payload::Binary(a), Payload::Binary(b)) => a == b,
            (Payload::Object(a), Payload::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Json(json) => write!(f, "{}", json),
            Payload::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Payload::Object(_) => write!(f, "Object(..)"),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Payload {
        Payload::Json(serde_json::Value::from(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Payload {
        Payload::Json(serde_json::Value::from(value))
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Payload {
        Payload::Json(value)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Payload {
        Payload::Json(serde_json::Value::from(value))
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Payload {
        Payload::Json(serde_json::Value::from(value))
    }
}

impl From<f64> for Payload {
    fn from(value: f64) -> Payload {
        Payload::Json(serde_json::Value::from(value))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Payload {
        Payload::Binary(value)
    }
}

/**
 * Payloads laid out in nested lists following a batch size, one list level per batch
 * dimension.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum PayloadTree {
    Leaf(Payload),
    List(Vec<PayloadTree>),
}

impl PayloadTree {
    fn build(shape: &[usize], items: &[Payload]) -> PayloadTree {
        match shape.split_first() {
            None => match items.first() {
                Some(item) => PayloadTree::Leaf(item.clone()),
                None => PayloadTree::List(Vec::new()),
            },
            Some((&length, rest)) => {
                let inner = elements(rest);
                PayloadTree::List(
                    (0..length)
                        .map(|i| PayloadTree::build(rest, &items[i * inner..(i + 1) * inner]))
                        .collect(),
                )
            }
        }
    }

    /**
     * Every payload in row major order.
     */
    pub fn leaves(&self) -> Vec<&Payload> {
        match self {
            PayloadTree::Leaf(payload) => vec![payload],
            PayloadTree::List(list) => list.iter().flat_map(|t| t.leaves()).collect(),
        }
    }
}

/**
 * A single payload describing a whole batch.
 */
#[derive(Clone, Debug)]
pub struct NonTensorData {
    data: Payload,
    batch_size: Vec<usize>,
    device: Option<Device>,
}

impl NonTensorData {
    pub fn new(data: impl Into<Payload>, batch_size: impl Into<Vec<usize>>) -> NonTensorData {
        NonTensorData {
            data: data.into(),
            batch_size: batch_size.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: Option<Device>) -> NonTensorData {
        self.device = device;
        self
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    pub fn device(&self) -> Option<Device> {
        self.device
    }

    pub(crate) fn with_batch_size(&self, batch_size: Vec<usize>) -> NonTensorData {
        NonTensorData {
            data: self.data.clone(),
            batch_size,
            device: self.device,
        }
    }

    fn full(&self, value: f64, dtype: DType) -> Tensor {
        let tensor = Tensor::full(self.batch_size.clone(), value, dtype);
        match self.device {
            Some(device) => tensor.to(device),
            None => tensor,
        }
    }

    /**
     * Compares the payloads, returning a Bool tensor of the batch size filled with the result.
     * With an empty batch size the result is a 0 dimensional tensor.
     */
    pub fn equals(&self, other: &NonTensorData) -> Tensor {
        self.full((self.data == other.data) as u8 as f64, DType::Bool)
    }

    /**
     * The negation of [`equals`](NonTensorData::equals).
     */
    pub fn not_equals(&self, other: &NonTensorData) -> Tensor {
        self.full((self.data != other.data) as u8 as f64, DType::Bool)
    }

    /**
     * Bitwise or of boolean or integer payloads, broadcast to the batch size.
     */
    pub fn or(&self, other: &NonTensorData) -> Result<Tensor> {
        self.bitwise(other, "or")
    }

    /**
     * Bitwise xor of boolean or integer payloads, broadcast to the batch size.
     */
    pub fn xor(&self, other: &NonTensorData) -> Result<Tensor> {
        self.bitwise(other, "xor")
    }

    fn bitwise(&self, other: &NonTensorData, operation: &str) -> Result<Tensor> {
        let combined = self.data.combine(&other.data, operation)?;
        let (value, dtype) = combined.as_number().ok_or_else(|| {
            TensorDictError::Unsupported(format!("bitwise {} result {:?}", operation, combined))
        })?;
        Ok(self.full(value, dtype))
    }

    /**
     * The payload repeated in nested lists following the batch size.
     */
    pub fn tolist(&self) -> PayloadTree {
        PayloadTree::build(&self.batch_size, &self.grid())
    }

    /**
     * Converts this value into a stack holding one copy of the payload per batch element,
     * unless the batch size is empty in which case there is nothing to stack.
     */
    pub fn maybe_to_stack(&self) -> Value {
        if self.batch_size.is_empty() {
            return Value::NonTensor(self.clone());
        }
        Value::NonTensorStack(NonTensorStack {
            items: self.grid(),
            batch_size: self.batch_size.clone(),
            device: self.device,
        })
    }

    pub(crate) fn grid(&self) -> Vec<Payload> {
        vec![self.data.clone(); elements(&self.batch_size)]
    }
}

/**
 * Plain comparison of the payload against another payload.
 */
impl PartialEq<Payload> for NonTensorData {
    fn eq(&self, other: &Payload) -> bool {
        self.data == *other
    }
}

impl PartialEq for NonTensorData {
    fn eq(&self, other: &NonTensorData) -> bool {
        self.data == other.data && self.batch_size == other.batch_size
    }
}

/**
 * One payload per batch element, stored in row major order.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct NonTensorStack {
    items: Vec<Payload>,
    batch_size: Vec<usize>,
    device: Option<Device>,
}

impl NonTensorStack {
    /**
     * Creates a stack from payloads in row major order. The batch size must have at least
     * one dimension and match the number of payloads.
     */
    pub fn from_items(items: Vec<Payload>, batch_size: impl Into<Vec<usize>>) -> Result<NonTensorStack> {
        let batch_size = batch_size.into();
        if batch_size.is_empty() || elements(&batch_size) != items.len() {
            return Err(TensorDictError::shape(format!(
                "{} items cannot fill a stack of batch size {:?}",
                items.len(),
                batch_size
            )));
        }
        Ok(NonTensorStack {
            items,
            batch_size,
            device: None,
        })
    }

    pub fn with_device(mut self, device: Option<Device>) -> NonTensorStack {
        self.device = device;
        self
    }

    pub fn batch_size(&self) -> &[usize] {
        &self.batch_size
    }

    pub fn device(&self) -> Option<Device> {
        self.device
    }

    pub fn items(&self) -> &[Payload] {
        &self.items
    }

    /**
     * The length of the first batch dimension.
     */
    pub fn len(&self) -> usize {
        self.batch_size.first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
     * A stack has no single value, so this always returns
     * [`NonTensorStackData`](TensorDictError::NonTensorStackData).
     */
    pub fn data(&self) -> Result<&Payload> {
        Err(TensorDictError::NonTensorStackData)
    }

    /**
     * Returns the entry at a position along the first batch dimension.
     */
    pub fn get(&self, index: usize) -> Result<Value> {
        self.index(&[Index::At(index as isize)])
    }

    pub fn tolist(&self) -> PayloadTree {
        PayloadTree::build(&self.batch_size, &self.items)
    }

    /**
     * Indexes the batch dimensions. Selecting a single element returns it as non-tensor data.
     */
    pub fn index(&self, indexes: &[Index]) -> Result<Value> {
        let (shape, offsets) = index_offsets(&self.batch_size, indexes)?;
        let items: Vec<Payload> = offsets.iter().map(|&o| self.items[o].clone()).collect();
        Ok(NonTensorStack::layout(items, shape, self.device))
    }

    pub(crate) fn permute(&self, dims: &[usize]) -> NonTensorStack {
        let offsets = permute_offsets(&self.batch_size, dims);
        NonTensorStack {
            items: offsets.iter().map(|&o| self.items[o].clone()).collect(),
            batch_size: dims.iter().map(|&d| self.batch_size[d]).collect(),
            device: self.device,
        }
    }

    pub(crate) fn reshape(&self, batch_size: Vec<usize>) -> Result<Value> {
        if elements(&batch_size) != self.items.len() {
            return Err(TensorDictError::shape(format!(
                "cannot reshape a stack of batch size {:?} to {:?}",
                self.batch_size, batch_size
            )));
        }
        Ok(NonTensorStack::layout(self.items.clone(), batch_size, self.device))
    }

    fn layout(items: Vec<Payload>, batch_size: Vec<usize>, device: Option<Device>) -> Value {
        if batch_size.is_empty() {
            if let Some(item) = items.into_iter().next() {
                return Value::NonTensor(NonTensorData::new(item, []).with_device(device));
            }
            return Value::NonTensorStack(NonTensorStack {
                items: Vec::new(),
                batch_size,
                device,
            });
        }
        Value::NonTensorStack(NonTensorStack {
            items,
            batch_size,
            device,
        })
    }
}

fn grid_of(value: &Value) -> Result<Vec<Payload>> {
    match value {
        Value::NonTensor(data) => Ok(data.grid()),
        Value::NonTensorStack(stack) => Ok(stack.items.clone()),
        other => Err(TensorDictError::type_mismatch(
            "NonTensorData or NonTensorStack",
            other.kind().to_string(),
        )),
    }
}

fn all_same_data(values: &[Value]) -> Option<&NonTensorData> {
    let first = match values.first()? {
        Value::NonTensor(data) => data,
        _ => return None,
    };
    values
        .iter()
        .all(|v| matches!(v, Value::NonTensor(d) if d.data == first.data))
        .then_some(first)
}

/**
 * Stacks non-tensor values of the same batch size along a new dimension.
 *
 * If every value is non-tensor data with an equal payload, the result is one non-tensor
 * data with the stacked batch size. Otherwise the result is a [`NonTensorStack`] with one
 * payload per element.
 */
pub fn stack_non_tensor(values: &[Value], dim: isize) -> Result<Value> {
    let Some(first) = values.first() else {
        return Err(TensorDictError::shape("cannot stack an empty list"));
    };
    let batch_size = first.shape();
    for value in values {
        if value.shape() != batch_size {
            return Err(TensorDictError::shape(format!(
                "cannot stack non-tensor values of batch sizes {:?} and {:?}",
                batch_size,
                value.shape()
            )));
        }
    }
    let dim = normalize_dim(dim, batch_size.len() + 1)?;
    let mut stacked_size = batch_size.clone();
    stacked_size.insert(dim, values.len());
    if let Some(data) = all_same_data(values) {
        return Ok(Value::NonTensor(data.with_batch_size(stacked_size)));
    }
    let grids = values.iter().map(grid_of).collect::<Result<Vec<_>>>()?;
    let parts: Vec<&[Payload]> = grids.iter().map(|g| g.as_slice()).collect();
    Ok(Value::NonTensorStack(NonTensorStack {
        items: stack_flat(&parts, &batch_size, dim),
        batch_size: stacked_size,
        device: first.device(),
    }))
}

/**
 * Concatenates non-tensor values along an existing batch dimension, keeping a single
 * payload when they are all equal.
 */
pub fn cat_non_tensor(values: &[Value], dim: usize) -> Result<Value> {
    let Some(first) = values.first() else {
        return Err(TensorDictError::shape("cannot cat an empty list"));
    };
    let shapes: Vec<Vec<usize>> = values.iter().map(Value::shape).collect();
    let mut batch_size = shapes[0].clone();
    if dim >= batch_size.len() {
        return Err(TensorDictError::InvalidDimension {
            dim: dim as isize,
            ndim: batch_size.len(),
        });
    }
    batch_size[dim] = shapes.iter().map(|s| s[dim]).sum();
    if let Some(data) = all_same_data(values) {
        return Ok(Value::NonTensor(data.with_batch_size(batch_size)));
    }
    let grids = values.iter().map(grid_of).collect::<Result<Vec<_>>>()?;
    let parts: Vec<(&[usize], &[Payload])> = shapes
        .iter()
        .zip(grids.iter())
        .map(|(s, g)| (s.as_slice(), g.as_slice()))
        .collect();
    Ok(Value::NonTensorStack(NonTensorStack {
        items: cat_flat(&parts, dim),
        batch_size,
        device: first.device(),
    }))
}

/**
 * Writes non-tensor data into the elements of a non-tensor value selected by indexes.
 * The result is a single non-tensor data again if every element ends up equal.
 */
pub(crate) fn write_at(existing: &Value, indexes: &[Index], value: &Value) -> Result<Value> {
    let batch_size = existing.shape();
    let mut items = grid_of(existing)?;
    let (shape, offsets) = index_offsets(&batch_size, indexes)?;
    match value {
        Value::NonTensor(data) => {
            for &offset in &offsets {
                items[offset] = data.data.clone();
            }
        }
        _ => {
            let source = grid_of(value)?;
            let source_offsets = broadcast_offsets(&value.shape(), &shape)?;
            for (&offset, s) in offsets.iter().zip(source_offsets) {
                items[offset] = source[s].clone();
            }
        }
    }
    let device = existing.device();
    if let Some(first) = items.first() {
        if items.iter().all(|item| item == first) {
            return Ok(Value::NonTensor(
                NonTensorData::new(first.clone(), batch_size).with_device(device),
            ));
        }
    }
    Ok(Value::NonTensorStack(NonTensorStack {
        items,
        batch_size,
        device,
    }))
}

#[test]
fn comparisons_broadcast_to_the_batch_size() {
    let a = NonTensorData::new("x", [2, 3]);
    let b = NonTensorData::new("x", [2, 3]);
    let equal = a.equals(&b);
    assert_eq!(equal.shape(), &[2, 3]);
    assert!(equal.all());
    assert!(!a.not_equals(&b).any());
    let scalar = NonTensorData::new(true, []).or(&NonTensorData::new(false, [])).unwrap();
    assert_eq!(scalar.shape(), &[] as &[usize]);
    assert_eq!(scalar.item(), Some(1.0));
    let bits = NonTensorData::new(6i64, [2]).xor(&NonTensorData::new(3i64, [2])).unwrap();
    assert_eq!(bits.to_vec(), vec![5.0, 5.0]);
    assert_eq!(bits.dtype(), DType::Int64);
    assert!(NonTensorData::new("a", []).or(&NonTensorData::new("b", [])).is_err());
    assert!(a == Payload::from("x"));
}

#[test]
fn objects_compare_by_identity() {
    let object = Payload::object(vec![1, 2, 3]);
    assert_eq!(object, object.clone());
    assert_ne!(object, Payload::object(vec![1, 2, 3]));
    assert_eq!(object.downcast_ref::<Vec<i32>>(), Some(&vec![1, 2, 3]));
}

#[test]
fn differing_values_stack_per_element() {
    let values = vec![
        Value::from(NonTensorData::new("a", [])),
        Value::from(NonTensorData::new("b", [])),
    ];
    let stacked = stack_non_tensor(&values, 0).unwrap();
    let Value::NonTensorStack(stack) = stacked else {
        panic!("expected a stack");
    };
    assert!(stack.data().is_err());
    assert_eq!(
        stack.get(1).unwrap(),
        Value::from(NonTensorData::new("b", []))
    );
    let transposed = stack_non_tensor(&[stack.clone().into(), stack.clone().into()], 1).unwrap();
    assert_eq!(transposed.shape(), vec![2, 2]);
    let Value::NonTensorStack(transposed) = transposed else {
        panic!("expected a stack");
    };
    assert_eq!(
        transposed.tolist(),
        PayloadTree::List(vec![
            PayloadTree::List(vec![
                PayloadTree::Leaf("a".into()),
                PayloadTree::Leaf("a".into())
            ]),
            PayloadTree::List(vec![
                PayloadTree::Leaf("b".into()),
                PayloadTree::Leaf("b".into())
            ]),
        ])
    );
    let joined = cat_non_tensor(&[stack.clone().into(), stack.into()], 0).unwrap();
    assert_eq!(joined.shape(), vec![4]);
}

#[test]
fn partial_writes_split_into_a_stack() {
    let existing = Value::from(NonTensorData::new("a", [3]));
    let written = write_at(&existing, &[Index::At(1)], &NonTensorData::new("b", []).into()).unwrap();
    let Value::NonTensorStack(stack) = &written else {
        panic!("expected a stack");
    };
    assert_eq!(stack.items()[1], Payload::from("b"));
    let restored = write_at(&written, &[Index::full()], &NonTensorData::new("a", []).into()).unwrap();
    assert_eq!(restored, Value::from(NonTensorData::new("a", [3])));
}
