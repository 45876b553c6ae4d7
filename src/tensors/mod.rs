/*!
 * Dense tensors, the leaves of a tensordict.
 *
 * A [`Tensor`] is a handle to row major storage plus a shape, a [`DType`] and a [`Device`].
 * Cloning a Tensor clones the handle, so both clones alias the same storage and writes
 * through one, such as [`copy_`](Tensor::copy_) or [`index_put`](Tensor::index_put), are seen
 * through the other. [`deep_clone`](Tensor::deep_clone) copies the data, and
 * [`same_storage`](Tensor::same_storage) tells the two apart.
 *
 * Values are stored as `f64` whatever the dtype, and are cast to the dtype on every write, so
 * an `Int64` tensor only ever holds whole numbers and a `Bool` tensor only ever holds 0 and 1.
 *
 * The device is a label. Moving a tensor to another device copies its data, which is enough
 * for containers to check that all of their leaves agree on where they live.
 */

use crate::errors::{Result, TensorDictError};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod dimensions;
mod display;
pub mod indexing;
pub mod operations;

pub use dimensions::*;
pub use indexing::Index;
pub use operations::{cat, stack};

/**
 * The element type of a tensor.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /**
     * The type two operands of these types are promoted to for an elementwise operation.
     */
    pub fn promote(self, other: DType) -> DType {
        self.max(other)
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    pub(crate) fn cast(self, value: f64) -> f64 {
        match self {
            DType::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Int64 => value.trunc(),
            DType::Float32 => value as f32 as f64,
            DType::Float64 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/**
 * Where a tensor lives.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
        }
    }
}

impl FromStr for Device {
    type Err = TensorDictError;

    fn from_str(s: &str) -> Result<Device> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| TensorDictError::type_mismatch("a device such as cpu or cuda:0", s)),
        }
    }
}

impl From<Device> for String {
    fn from(device: Device) -> String {
        device.to_string()
    }
}

impl TryFrom<String> for Device {
    type Error = TensorDictError;

    fn try_from(s: String) -> Result<Device> {
        s.parse()
    }
}

/**
 * A dense, row major tensor of numbers.
 *
 * ```
 * use easy_tensordict::tensors::{DType, Tensor};
 * let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
 * assert_eq!(tensor.shape(), &[2, 3]);
 * assert_eq!(tensor.dtype(), DType::Float32);
 * let alias = tensor.clone();
 * tensor.fill_(0.0);
 * assert_eq!(alias.sum(), 0.0);
 * ```
 */
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl Tensor {
    /**
     * Creates a Float32 tensor on the cpu from data in row major order.
     *
     * # Panics
     *
     * If the number of elements does not match the shape.
     */
    #[track_caller]
    pub fn new(data: Vec<f64>, shape: impl Into<Vec<usize>>) -> Tensor {
        match Tensor::try_new(data, shape) {
            Err(error) => panic!("{}", error),
            Ok(success) => success,
        }
    }

    /**
     * Creates a Float32 tensor on the cpu from data in row major order, returning an error
     * if the number of elements does not match the shape.
     */
    pub fn try_new(data: Vec<f64>, shape: impl Into<Vec<usize>>) -> Result<Tensor> {
        Tensor::try_with_dtype(data, shape, DType::Float32)
    }

    /**
     * Creates a tensor of some type on the cpu from data in row major order, returning an
     * error if the number of elements does not match the shape.
     */
    pub fn try_with_dtype(
        data: Vec<f64>,
        shape: impl Into<Vec<usize>>,
        dtype: DType,
    ) -> Result<Tensor> {
        let shape = shape.into();
        if data.len() != elements(&shape) {
            return Err(TensorDictError::shape(format!(
                "{} elements cannot fill a tensor of shape {:?}",
                data.len(),
                shape
            )));
        }
        let data = data.into_iter().map(|x| dtype.cast(x)).collect();
        Ok(Tensor::from_parts(data, shape, dtype, Device::Cpu))
    }

    pub(crate) fn from_parts(data: Vec<f64>, shape: Vec<usize>, dtype: DType, device: Device) -> Tensor {
        Tensor {
            storage: Arc::new(RwLock::new(data)),
            shape,
            dtype,
            device,
        }
    }

    /**
     * Creates a 0 dimensional tensor holding a single value.
     */
    pub fn scalar(value: f64, dtype: DType) -> Tensor {
        Tensor::full([], value, dtype)
    }

    /**
     * Creates a tensor of a shape with every element set to the value.
     */
    pub fn full(shape: impl Into<Vec<usize>>, value: f64, dtype: DType) -> Tensor {
        let shape = shape.into();
        let data = vec![dtype.cast(value); elements(&shape)];
        Tensor::from_parts(data, shape, dtype, Device::Cpu)
    }

    /**
     * Creates a Float32 tensor of zeros.
     */
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Tensor {
        Tensor::full(shape, 0.0, DType::Float32)
    }

    /**
     * Creates a Float32 tensor of ones.
     */
    pub fn ones(shape: impl Into<Vec<usize>>) -> Tensor {
        Tensor::full(shape, 1.0, DType::Float32)
    }

    /**
     * Creates a 1 dimensional Int64 tensor counting from 0 to `n - 1`.
     */
    pub fn arange(n: usize) -> Tensor {
        Tensor::from_parts((0..n).map(|x| x as f64).collect(), vec![n], DType::Int64, Device::Cpu)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        elements(&self.shape)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /**
     * Copies out the elements in row major order.
     */
    pub fn to_vec(&self) -> Vec<f64> {
        self.storage.read().clone()
    }

    /**
     * Returns the single value of a tensor with exactly one element.
     */
    pub fn item(&self) -> Option<f64> {
        if self.numel() == 1 {
            self.storage.read().first().copied()
        } else {
            None
        }
    }

    /**
     * Returns the element at an index, or None if the index is out of range.
     */
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.ndim() || index.iter().zip(self.shape.iter()).any(|(i, l)| i >= l) {
            return None;
        }
        let strides = compute_strides(&self.shape);
        let offset: usize = index.iter().zip(strides.iter()).map(|(i, s)| i * s).sum();
        self.storage.read().get(offset).copied()
    }

    /**
     * True if both tensors are handles to the same storage.
     */
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /**
     * Copies this tensor into new storage.
     */
    pub fn deep_clone(&self) -> Tensor {
        Tensor::from_parts(self.to_vec(), self.shape.clone(), self.dtype, self.device)
    }

    /**
     * Returns this tensor on a device. If it is already on that device the returned tensor
     * shares its storage, otherwise the data is copied.
     */
    pub fn to(&self, device: Device) -> Tensor {
        if device == self.device {
            return self.clone();
        }
        Tensor::from_parts(self.to_vec(), self.shape.clone(), self.dtype, device)
    }

    /**
     * Returns a copy of this tensor converted to a dtype.
     */
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        let data = self.storage.read().iter().map(|&x| dtype.cast(x)).collect();
        Tensor::from_parts(data, self.shape.clone(), dtype, self.device)
    }

    pub(crate) fn read_data<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        f(&self.storage.read())
    }

    pub(crate) fn write_data<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        f(&mut self.storage.write())
    }

    pub(crate) fn with_shape(&self, shape: Vec<usize>) -> Tensor {
        Tensor {
            storage: self.storage.clone(),
            shape,
            dtype: self.dtype,
            device: self.device,
        }
    }
}

/**
 * Two tensors are equal if they have the same shape and the same elements, regardless of
 * dtype, device or whether they share storage.
 */
impl PartialEq for Tensor {
    fn eq(&self, other: &Tensor) -> bool {
        if self.shape != other.shape {
            return false;
        }
        if self.same_storage(other) {
            return true;
        }
        let left = self.storage.read();
        let right = other.storage.read();
        *left == *right
    }
}

#[test]
fn clones_alias_storage() {
    let tensor = Tensor::new(vec![1.0, 2.0], [2]);
    let alias = tensor.clone();
    let copy = tensor.deep_clone();
    tensor.fill_(3.0);
    assert!(alias.same_storage(&tensor));
    assert!(!copy.same_storage(&tensor));
    assert_eq!(alias.to_vec(), vec![3.0, 3.0]);
    assert_eq!(copy.to_vec(), vec![1.0, 2.0]);
}

#[test]
fn values_are_cast_to_the_dtype() {
    let tensor = Tensor::try_with_dtype(vec![1.7, -2.2, 0.0], [3], DType::Int64).unwrap();
    assert_eq!(tensor.to_vec(), vec![1.0, -2.0, 0.0]);
    let mask = tensor.to_dtype(DType::Bool);
    assert_eq!(mask.to_vec(), vec![1.0, 1.0, 0.0]);
    assert!(Tensor::try_new(vec![1.0], [2]).is_err());
}

#[test]
fn devices_parse_and_display() {
    assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
    assert_eq!(Device::Cpu.to_string(), "cpu");
    assert!("tpu".parse::<Device>().is_err());
    let tensor = Tensor::zeros([2]);
    assert!(tensor.to(Device::Cpu).same_storage(&tensor));
    assert!(!tensor.to(Device::Cuda(0)).same_storage(&tensor));
}
