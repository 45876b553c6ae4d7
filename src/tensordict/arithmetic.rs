/*!
 * Elementwise arithmetic and comparisons over every tensor.
 *
 * The right hand side of a binary operation can be another tensordict with the same keys,
 * a single tensor broadcast against every leaf, or a scalar. Non-tensor data is carried
 * through arithmetic unchanged.
 *
 * Methods return a [`Result`](crate::errors::Result), while the operator traits on references
 * panic on mismatched shapes or keys in the same way as the operators on
 * [`Tensor`](crate::tensors::Tensor).
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let td = TensorDict::new([2]);
 * td.set("x", Tensor::new(vec![1.0, 2.0], [2])).unwrap();
 * let doubled = &td + &td;
 * assert_eq!(doubled.get_tensor("x").unwrap().to_vec(), vec![2.0, 4.0]);
 * td.lock_();
 * td.mul_(3.0).unwrap();
 * assert_eq!(td.get_tensor("x").unwrap().to_vec(), vec![3.0, 6.0]);
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::is_leaf_nontensor;
use crate::tensordict::apply::ApplyOptions;
use crate::tensordict::items::KeysOptions;
use crate::tensordict::TensorDict;
use crate::tensors::{DType, Tensor};
use crate::value::Value;

use std::ops::{Add, Div, Mul, Neg, Sub};

/**
 * The right hand side of an arithmetic operation on a tensordict.
 */
#[derive(Clone, Debug)]
pub enum Operand {
    /**
     * Combined leaf by leaf with the entries at the same keys.
     */
    Dict(TensorDict),
    /**
     * Broadcast against every leaf.
     */
    Tensor(Tensor),
    Scalar(f64),
}

impl From<TensorDict> for Operand {
    fn from(td: TensorDict) -> Operand {
        Operand::Dict(td)
    }
}

impl From<&TensorDict> for Operand {
    fn from(td: &TensorDict) -> Operand {
        Operand::Dict(td.clone())
    }
}

impl From<Tensor> for Operand {
    fn from(tensor: Tensor) -> Operand {
        Operand::Tensor(tensor)
    }
}

impl From<&Tensor> for Operand {
    fn from(tensor: &Tensor) -> Operand {
        Operand::Tensor(tensor.clone())
    }
}

impl From<f64> for Operand {
    fn from(scalar: f64) -> Operand {
        Operand::Scalar(scalar)
    }
}

impl From<i64> for Operand {
    fn from(scalar: i64) -> Operand {
        Operand::Scalar(scalar as f64)
    }
}

// Whole numbers keep integer tensors integer.
fn scalar_tensor(scalar: f64) -> Tensor {
    if scalar.fract() == 0.0 {
        Tensor::scalar(scalar, DType::Int64)
    } else {
        Tensor::scalar(scalar, DType::Float32)
    }
}

type TensorOp = fn(&Tensor, &Tensor) -> Result<Tensor>;

impl TensorDict {
    fn binary(&self, other: Operand, op: TensorOp, options: ApplyOptions) -> Result<TensorDict> {
        match other {
            Operand::Dict(other) => {
                self.apply_with_options(&[&other], options, |tensor, others| {
                    op(tensor, &others[0]).map(Some)
                })
            }
            Operand::Tensor(other) => {
                self.apply_with_options(&[], options, |tensor, _| op(tensor, &other).map(Some))
            }
            Operand::Scalar(scalar) => {
                let other = scalar_tensor(scalar);
                self.apply_with_options(&[], options, |tensor, _| op(tensor, &other).map(Some))
            }
        }
    }

    // Every result is computed and checked before the first one is written.
    fn binary_(&self, other: Operand, op: TensorOp) -> Result<&TensorDict> {
        let scalar = match &other {
            Operand::Scalar(scalar) => Some(scalar_tensor(*scalar)),
            _ => None,
        };
        let mut results = Vec::new();
        for (key, value) in self.items_with(KeysOptions::leaves())? {
            let Value::Tensor(tensor) = value else {
                continue;
            };
            let result = match (&other, &scalar) {
                (Operand::Dict(other), _) => op(&tensor, &other.get_tensor(&key)?)?,
                (Operand::Tensor(other), _) => op(&tensor, other)?,
                (_, Some(scalar)) => op(&tensor, scalar)?,
                (Operand::Scalar(_), None) => continue,
            };
            if result.shape() != tensor.shape() {
                return Err(TensorDictError::shape(format!(
                    "cannot write a result of shape {:?} in place into the entry {} of shape {:?}",
                    result.shape(),
                    key,
                    tensor.shape()
                )));
            }
            results.push((key, result));
        }
        for (key, result) in results {
            self.set_inplace(&key, result)?;
        }
        Ok(self)
    }

    pub fn add(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.binary(other.into(), Tensor::try_add, ApplyOptions::new())
    }

    pub fn sub(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.binary(other.into(), Tensor::try_sub, ApplyOptions::new())
    }

    pub fn mul(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.binary(other.into(), Tensor::try_mul, ApplyOptions::new())
    }

    /**
     * True division, every tensor in the result is floating point.
     */
    pub fn div(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.binary(other.into(), Tensor::try_div, ApplyOptions::new())
    }

    /**
     * Adds in place. Since no keys change this is permitted while locked, as long as every
     * result has the shape of the tensor it is written into.
     */
    pub fn add_(&self, other: impl Into<Operand>) -> Result<&TensorDict> {
        self.binary_(other.into(), Tensor::try_add)
    }

    pub fn sub_(&self, other: impl Into<Operand>) -> Result<&TensorDict> {
        self.binary_(other.into(), Tensor::try_sub)
    }

    pub fn mul_(&self, other: impl Into<Operand>) -> Result<&TensorDict> {
        self.binary_(other.into(), Tensor::try_mul)
    }

    pub fn div_(&self, other: impl Into<Operand>) -> Result<&TensorDict> {
        self.binary_(other.into(), Tensor::try_div)
    }

    pub fn neg(&self) -> Result<TensorDict> {
        self.apply(|tensor| Ok(tensor.map(|x| -x)))
    }

    pub fn abs(&self) -> Result<TensorDict> {
        self.apply(|tensor| Ok(tensor.abs()))
    }

    /**
     * Elementwise equality as boolean tensors. Non-tensor data compared against non-tensor
     * data gives a boolean tensor of its batch size, and is dropped otherwise.
     */
    pub fn elementwise_eq(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.compare(other.into(), false)
    }

    /**
     * Elementwise inequality, see [`elementwise_eq`](TensorDict::elementwise_eq).
     */
    pub fn elementwise_ne(&self, other: impl Into<Operand>) -> Result<TensorDict> {
        self.compare(other.into(), true)
    }

    fn compare(&self, other: Operand, negate: bool) -> Result<TensorDict> {
        let tensor_op: TensorOp = if negate {
            Tensor::ne_elementwise
        } else {
            Tensor::eq_elementwise
        };
        let leaves = ApplyOptions::new().is_leaf(is_leaf_nontensor);
        let compare_values = |value: &Value, other: &Value| -> Result<Option<Value>> {
            Ok(match (value, other) {
                (Value::Tensor(a), Value::Tensor(b)) => Some(Value::Tensor(tensor_op(a, b)?)),
                (Value::NonTensor(a), Value::NonTensor(b)) => Some(Value::Tensor(if negate {
                    a.not_equals(b)
                } else {
                    a.equals(b)
                })),
                _ => None,
            })
        };
        match other {
            Operand::Dict(other) => self.apply_values(&[&other], leaves, |value, others| {
                compare_values(value, &others[0])
            }),
            Operand::Tensor(other) => {
                let other = Value::Tensor(other);
                self.apply_values(&[], leaves, |value, _| compare_values(value, &other))
            }
            Operand::Scalar(scalar) => {
                let other = Value::Tensor(scalar_tensor(scalar));
                self.apply_values(&[], leaves, |value, _| compare_values(value, &other))
            }
        }
    }

    fn tensor_leaves(&self) -> Result<Vec<Tensor>> {
        Ok(self
            .values_with(KeysOptions::leaves())?
            .into_iter()
            .filter_map(|value| value.into_tensor().ok())
            .collect())
    }

    /**
     * True if every element of every tensor is non zero.
     */
    pub fn all(&self) -> Result<bool> {
        Ok(self.tensor_leaves()?.iter().all(Tensor::all))
    }

    /**
     * True if any element of any tensor is non zero.
     */
    pub fn any(&self) -> Result<bool> {
        Ok(self.tensor_leaves()?.iter().any(Tensor::any))
    }

    pub fn zero_(&self) -> Result<&TensorDict> {
        self.fill_(0.0)
    }

    /**
     * Writes a value into every element of every tensor, permitted while locked.
     */
    pub fn fill_(&self, value: f64) -> Result<&TensorDict> {
        self.apply_(|tensor| {
            let filled = tensor.deep_clone();
            filled.fill_(value);
            Ok(filled)
        })?;
        Ok(self)
    }
}

macro_rules! tensordict_operator {
    ($trait:ident, $method:ident) => {
        impl $trait<&TensorDict> for &TensorDict {
            type Output = TensorDict;

            #[track_caller]
            fn $method(self, rhs: &TensorDict) -> TensorDict {
                match TensorDict::$method(self, rhs) {
                    Err(error) => panic!("{}", error),
                    Ok(success) => success,
                }
            }
        }

        impl $trait<&Tensor> for &TensorDict {
            type Output = TensorDict;

            #[track_caller]
            fn $method(self, rhs: &Tensor) -> TensorDict {
                match TensorDict::$method(self, rhs) {
                    Err(error) => panic!("{}", error),
                    Ok(success) => success,
                }
            }
        }

        impl $trait<f64> for &TensorDict {
            type Output = TensorDict;

            #[track_caller]
            fn $method(self, rhs: f64) -> TensorDict {
                match TensorDict::$method(self, rhs) {
                    Err(error) => panic!("{}", error),
                    Ok(success) => success,
                }
            }
        }
    };
}

tensordict_operator!(Add, add);
tensordict_operator!(Sub, sub);
tensordict_operator!(Mul, mul);
tensordict_operator!(Div, div);

impl Neg for &TensorDict {
    type Output = TensorDict;

    #[track_caller]
    fn neg(self) -> TensorDict {
        match TensorDict::neg(self) {
            Err(error) => panic!("{}", error),
            Ok(success) => success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TensorDictError;

    fn sample() -> TensorDict {
        let td = TensorDict::new([2]);
        td.set("x", Tensor::new(vec![1.0, -2.0], [2])).unwrap();
        td.set(("n", "y"), Tensor::try_with_dtype(vec![3.0, 4.0], [2], DType::Int64).unwrap())
            .unwrap();
        td.set_non_tensor("text", "hello").unwrap();
        td
    }

    #[test]
    fn binary_operations() {
        let td = sample();
        let sum = TensorDict::add(&td, &td).unwrap();
        assert_eq!(sum.get_tensor("x").unwrap().to_vec(), vec![2.0, -4.0]);
        assert_eq!(sum.get_non_tensor("text").unwrap().as_str(), Some("hello"));
        let shifted = TensorDict::add(&td, 1.0).unwrap();
        assert_eq!(shifted.get_tensor(("n", "y")).unwrap().dtype(), DType::Int64);
        let halved = TensorDict::div(&td, 2.0).unwrap();
        assert!(halved.get_tensor(("n", "y")).unwrap().dtype().is_floating_point());
        assert_eq!(halved.get_tensor(("n", "y")).unwrap().to_vec(), vec![1.5, 2.0]);
        let scaled = TensorDict::mul(&td, &Tensor::new(vec![10.0, 0.0], [2])).unwrap();
        assert_eq!(scaled.get_tensor("x").unwrap().to_vec(), vec![10.0, 0.0]);
        let difference = &td - &td;
        assert!(!difference.any().unwrap());
        assert_eq!((-&td).get_tensor("x").unwrap().to_vec(), vec![-1.0, 2.0]);
        assert_eq!(td.abs().unwrap().get_tensor("x").unwrap().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn missing_keys_are_errors() {
        let td = sample();
        let other = TensorDict::new([2]);
        other.set("x", Tensor::zeros([2])).unwrap();
        assert!(matches!(
            TensorDict::add(&td, &other),
            Err(TensorDictError::KeyNotFound { .. })
        ));
    }

    #[test]
    fn in_place_operations_under_lock() {
        let td = sample();
        td.lock_();
        td.add_(1.0).unwrap();
        assert_eq!(td.get_tensor("x").unwrap().to_vec(), vec![2.0, -1.0]);
        td.zero_().unwrap();
        assert!(!td.any().unwrap());
        td.fill_(1.0).unwrap();
        assert!(td.all().unwrap());
        // results that would change the shape of a leaf are refused, locked or not
        assert!(matches!(
            td.add_(&Tensor::zeros([3, 2])),
            Err(TensorDictError::ShapeMismatch(_))
        ));
        assert_eq!(td.get_tensor("x").unwrap().shape(), &[2]);
        assert!(td.all().unwrap());
        td.unlock_().unwrap();
        assert!(matches!(
            td.mul_(&Tensor::zeros([3, 2])),
            Err(TensorDictError::ShapeMismatch(_))
        ));
        assert!(td.all().unwrap());
    }

    #[test]
    fn in_place_operations_against_a_tensordict() {
        let td = sample();
        let other = td.deep_clone();
        td.sub_(&other).unwrap();
        assert!(!td.any().unwrap());
        let missing = TensorDict::new([2]);
        missing.set("x", Tensor::ones([2])).unwrap();
        assert!(matches!(td.add_(&missing), Err(TensorDictError::KeyNotFound { .. })));
        // nothing was written before the missing key was found
        assert!(!td.any().unwrap());
    }

    #[test]
    fn comparisons_give_boolean_tensors() {
        let td = sample();
        let equal = td.elementwise_eq(&td.deep_clone()).unwrap();
        assert!(equal.all().unwrap());
        assert_eq!(equal.get_tensor("text").unwrap().dtype(), DType::Bool);
        let unequal = td.elementwise_ne(1.0).unwrap();
        assert_eq!(unequal.get_tensor("x").unwrap().to_vec(), vec![0.0, 1.0]);
        assert!(!unequal.contains("text"));
    }
}
