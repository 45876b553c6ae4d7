/*!
 * Typed structs backed by a tensordict.
 *
 * A tensor class is a struct with a fixed set of named fields whose values are held in a
 * [`TensorDict`]. The tensordict provides the batch size, indexing, device moves and
 * everything else, while the struct gives each field a typed getter. The
 * [`tensorclass!`](crate::tensorclass!) macro writes the struct and its [`TensorClass`]
 * implementation.
 *
 * ```
 * use easy_tensordict::tensorclass;
 * use easy_tensordict::tensorclass::TensorClass;
 * use easy_tensordict::tensors::{Index, Tensor};
 * use easy_tensordict::nontensor::Payload;
 *
 * tensorclass! {
 *     pub struct Transition {
 *         observation: Tensor,
 *         reward: Tensor,
 *         label: Payload,
 *     }
 * }
 *
 * let transition = Transition::new(
 *     [3],
 *     Tensor::zeros([3, 4]),
 *     Tensor::ones([3]),
 *     Payload::from("episode 1"),
 * ).unwrap();
 * assert_eq!(transition.batch_size(), vec![3]);
 * let first = transition.index(&[Index::At(0)]).unwrap();
 * assert_eq!(first.observation().unwrap().shape(), &[4]);
 * assert_eq!(first.label().unwrap().as_str(), Some("episode 1"));
 * assert!(transition.set("unknown", Tensor::zeros([3])).is_err());
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::nontensor::{NonTensorData, Payload};
use crate::tensordict::TensorDict;
use crate::tensors::{Device, Index, Tensor};
use crate::value::{IntoValue, Value};

/**
 * A struct of named fields stored in a [`TensorDict`].
 *
 * Implementors only say which fields exist and how to get at the tensordict. Everything
 * else is provided and returns the same type of struct.
 */
pub trait TensorClass: Sized {
    /**
     * The names of the fields, which are the keys of the tensordict.
     */
    fn fields() -> &'static [&'static str];

    fn as_tensordict(&self) -> &TensorDict;

    /**
     * Wraps a tensordict, which may not hold keys other than the fields.
     */
    fn from_tensordict(tensordict: TensorDict) -> Result<Self>;

    fn batch_size(&self) -> Vec<usize> {
        self.as_tensordict().batch_size()
    }

    fn device(&self) -> Option<Device> {
        self.as_tensordict().device()
    }

    fn index(&self, index: &[Index]) -> Result<Self> {
        Self::from_tensordict(self.as_tensordict().index(index)?)
    }

    /**
     * Calls a function on every tensor of every field.
     */
    fn apply(&self, f: impl FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Self::from_tensordict(self.as_tensordict().apply(f)?)
    }

    fn to(&self, device: Device) -> Result<Self> {
        Self::from_tensordict(self.as_tensordict().to(device)?)
    }

    fn get(&self, field: &str) -> Result<Value> {
        check_field::<Self>(field)?;
        self.as_tensordict().get(field)
    }

    /**
     * Sets the value of a field, which must be one of [`fields`](TensorClass::fields).
     */
    fn set(&self, field: &str, value: impl IntoValue) -> Result<()> {
        check_field::<Self>(field)?;
        self.as_tensordict().set(field, value)
    }

    fn stack(items: &[Self], dim: isize) -> Result<Self> {
        let tensordicts: Vec<TensorDict> = items
            .iter()
            .map(|item| item.as_tensordict().clone())
            .collect();
        Self::from_tensordict(TensorDict::stack(&tensordicts, dim)?)
    }
}

fn check_field<T: TensorClass>(field: &str) -> Result<()> {
    if T::fields().contains(&field) {
        Ok(())
    } else {
        Err(TensorDictError::InvalidKey(format!(
            "{:?} is not one of the fields {:?}",
            field,
            T::fields()
        )))
    }
}

/**
 * Checks that a tensordict only holds the fields of a tensor class.
 */
#[doc(hidden)]
pub fn check_fields<T: TensorClass>(tensordict: &TensorDict) -> Result<()> {
    tensordict
        .keys()
        .iter()
        .try_for_each(|key| check_field::<T>(key))
}

/**
 * Conversion out of a [`Value`] for the typed getters of a tensor class.
 */
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Value> {
        Ok(value)
    }
}

impl FromValue for Tensor {
    fn from_value(value: Value) -> Result<Tensor> {
        value.into_tensor()
    }
}

impl FromValue for TensorDict {
    fn from_value(value: Value) -> Result<TensorDict> {
        value.into_dict()
    }
}

impl FromValue for NonTensorData {
    fn from_value(value: Value) -> Result<NonTensorData> {
        match value {
            Value::NonTensor(data) => Ok(data),
            other => Err(TensorDictError::type_mismatch(
                "NonTensorData",
                other.kind().to_string(),
            )),
        }
    }
}

impl FromValue for Payload {
    fn from_value(value: Value) -> Result<Payload> {
        match value {
            Value::NonTensor(data) => Ok(data.data().clone()),
            Value::NonTensorStack(stack) => stack.data().cloned(),
            other => Err(TensorDictError::type_mismatch(
                "non-tensor data",
                other.kind().to_string(),
            )),
        }
    }
}

/**
 * Defines a struct backed by a [`TensorDict`](crate::TensorDict) with one typed getter
 * per field, a `new` constructor taking the batch size followed by every field, and an
 * implementation of [`TensorClass`](crate::tensorclass::TensorClass).
 *
 * Field types must be [`IntoValue`](crate::value::IntoValue) to be set and
 * [`FromValue`](crate::tensorclass::FromValue) to be read back.
 */
#[macro_export]
macro_rules! tensorclass {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        $vis struct $name {
            tensordict: $crate::TensorDict,
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            pub fn new(
                batch_size: impl Into<Vec<usize>>,
                $($field: $ty),*
            ) -> $crate::errors::Result<$name> {
                let tensordict = $crate::TensorDict::new(batch_size);
                $(tensordict.set(stringify!($field), $field)?;)*
                Ok($name { tensordict })
            }

            $(
                pub fn $field(&self) -> $crate::errors::Result<$ty> {
                    <$ty as $crate::tensorclass::FromValue>::from_value(
                        self.tensordict.get(stringify!($field))?,
                    )
                }
            )*
        }

        impl $crate::tensorclass::TensorClass for $name {
            fn fields() -> &'static [&'static str] {
                &[$(stringify!($field)),*]
            }

            fn as_tensordict(&self) -> &$crate::TensorDict {
                &self.tensordict
            }

            fn from_tensordict(
                tensordict: $crate::TensorDict,
            ) -> $crate::errors::Result<$name> {
                $crate::tensorclass::check_fields::<$name>(&tensordict)?;
                Ok($name { tensordict })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::tensorclass! {
        struct Pair {
            left: Tensor,
            right: TensorDict,
        }
    }

    fn pair() -> Pair {
        let right = TensorDict::new([2]);
        right.set("inner", Tensor::arange(2)).unwrap();
        Pair::new([2], Tensor::zeros([2, 3]), right).unwrap()
    }

    #[test]
    fn getters_are_typed() {
        let pair = pair();
        assert_eq!(pair.left().unwrap().shape(), &[2, 3]);
        assert_eq!(pair.right().unwrap().get_tensor("inner").unwrap().to_vec(), vec![
            0.0, 1.0
        ]);
        assert_eq!(Pair::fields(), &["left", "right"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let td = TensorDict::new([]);
        td.set("other", 1.0).unwrap();
        assert!(matches!(
            Pair::from_tensordict(td),
            Err(TensorDictError::InvalidKey(_))
        ));
        assert!(pair().get("other").is_err());
    }

    #[test]
    fn operations_return_the_class() {
        let pair = pair();
        let stacked = Pair::stack(&[pair.clone(), pair.clone()], 0).unwrap();
        assert_eq!(stacked.batch_size(), vec![2, 2]);
        let shifted = pair.apply(|tensor| tensor.try_add(&Tensor::ones([]))).unwrap();
        assert_eq!(shifted.left().unwrap().sum(), 6.0);
        assert_eq!(shifted.index(&[Index::At(1)]).unwrap().batch_size(), Vec::<usize>::new());
    }
}
