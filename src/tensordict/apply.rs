/*!
 * Applying functions to every entry.
 *
 * Every traversal that rebuilds a tensordict from its entries goes through the same engine:
 * it walks the keys in insertion order, recurses into nested containers, calls the function
 * on each leaf together with the entries at the same key in any other tensordicts, and
 * assembles the results into a container of the same shape. A function returning `None`
 * drops the entry from the result.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let a = TensorDict::new([]);
 * a.set("a", 0.0).unwrap();
 * a.set(("b", "c"), 1.0).unwrap();
 * let b = TensorDict::new([]);
 * b.set("a", 9.0).unwrap();
 * b.set(("b", "c"), 9.0).unwrap();
 * let sum = a.apply_with(&[&b], |x, others| x.try_add(&others[0])).unwrap();
 * assert_eq!(sum.get_tensor("a").unwrap().item(), Some(9.0));
 * assert_eq!(sum.get_tensor(("b", "c")).unwrap().item(), Some(10.0));
 * ```
 */

use crate::config::Config;
use crate::errors::{Result, TensorDictError};
use crate::keys::{IsLeaf, NestedKey, default_is_leaf, is_leaf_nontensor};
use crate::tensordict::items::KeysOptions;
use crate::tensordict::{Layout, Names, SetMode, TensorDict, UpdateOptions};
use crate::tensors::{Device, Tensor};
use crate::value::Value;

type LeafFn<'a> = dyn FnMut(&NestedKey, &Value, &[Value]) -> Result<Option<Value>> + 'a;

/**
 * Options for the traversal engine, built up from [`ApplyOptions::new`].
 */
#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub(crate) batch_size: Option<Vec<usize>>,
    pub(crate) device: Option<Option<Device>>,
    pub(crate) names: Option<Option<Names>>,
    pub(crate) inplace: bool,
    pub(crate) default: Option<Value>,
    pub(crate) filter_empty: bool,
    pub(crate) call_on_nested: bool,
    pub(crate) is_leaf: IsLeaf,
    pub(crate) checked: bool,
    pub(crate) nested_keys: bool,
    pub(crate) propagate_lock: bool,
}

impl Default for ApplyOptions {
    fn default() -> ApplyOptions {
        ApplyOptions {
            batch_size: None,
            device: None,
            names: None,
            inplace: false,
            default: None,
            filter_empty: false,
            call_on_nested: false,
            is_leaf: default_is_leaf,
            checked: false,
            nested_keys: false,
            propagate_lock: false,
        }
    }
}

impl ApplyOptions {
    pub fn new() -> ApplyOptions {
        ApplyOptions::default()
    }

    /**
     * Takes the defaults that can be configured from a [`Config`].
     */
    pub fn from_config(config: &Config) -> ApplyOptions {
        ApplyOptions {
            filter_empty: config.filter_empty,
            ..ApplyOptions::default()
        }
    }

    /**
     * The batch size of the result. Nested containers keep their extra batch dimensions
     * after the new batch size, and lose their names.
     */
    pub fn batch_size(mut self, batch_size: impl Into<Vec<usize>>) -> ApplyOptions {
        self.batch_size = Some(batch_size.into());
        self
    }

    /**
     * The device of the result, None clearing it.
     */
    pub fn device(mut self, device: Option<Device>) -> ApplyOptions {
        self.device = Some(device);
        self
    }

    pub fn names(mut self, names: Option<Names>) -> ApplyOptions {
        self.names = Some(names);
        self
    }

    /**
     * Write the results back into the tensordict the function was applied to.
     */
    pub fn inplace(mut self, inplace: bool) -> ApplyOptions {
        self.inplace = inplace;
        self
    }

    /**
     * The value passed for keys missing from one of the other tensordicts. Without a
     * default a missing key is an error.
     */
    pub fn default_value(mut self, default: impl Into<Value>) -> ApplyOptions {
        self.default = Some(default.into());
        self
    }

    /**
     * Drop nested containers that have no leaves left after the function was applied.
     */
    pub fn filter_empty(mut self, filter_empty: bool) -> ApplyOptions {
        self.filter_empty = filter_empty;
        self
    }

    /**
     * Call the function on nested containers instead of recursing into them.
     */
    pub fn call_on_nested(mut self, call_on_nested: bool) -> ApplyOptions {
        self.call_on_nested = call_on_nested;
        self
    }

    pub fn is_leaf(mut self, is_leaf: IsLeaf) -> ApplyOptions {
        self.is_leaf = is_leaf;
        self
    }

    /**
     * Promise that the function returns values that already fit the result, so they are
     * stored without checking their shape or moving them to the result's device.
     */
    pub fn checked(mut self, checked: bool) -> ApplyOptions {
        self.checked = checked;
        self
    }

    /**
     * Pass the full nested key of each entry to a named function rather than only its key
     * in the container holding it.
     */
    pub fn nested_keys(mut self, nested_keys: bool) -> ApplyOptions {
        self.nested_keys = nested_keys;
        self
    }

    /**
     * Lock the result if the tensordict the function was applied to is locked.
     */
    pub fn propagate_lock(mut self, propagate_lock: bool) -> ApplyOptions {
        self.propagate_lock = propagate_lock;
        self
    }
}

impl TensorDict {
    /**
     * Returns a tensordict with a function applied to every tensor.
     */
    pub fn apply(&self, mut f: impl FnMut(&Tensor) -> Result<Tensor>) -> Result<TensorDict> {
        self.apply_values(&[], ApplyOptions::new(), |value, _| match value {
            Value::Tensor(tensor) => Ok(Some(Value::Tensor(f(tensor)?))),
            other => Ok(Some(other.clone())),
        })
    }

    /**
     * Returns a tensordict with a function applied to every tensor and the tensors at the
     * same keys in other tensordicts.
     */
    pub fn apply_with(
        &self,
        others: &[&TensorDict],
        mut f: impl FnMut(&Tensor, &[Tensor]) -> Result<Tensor>,
    ) -> Result<TensorDict> {
        self.apply_with_options(others, ApplyOptions::new(), |tensor, others| {
            f(tensor, others).map(Some)
        })
    }

    /**
     * Applies a function to every tensor in place. Writing a result of the same shape into
     * an existing tensor is allowed while locked.
     */
    pub fn apply_(&self, mut f: impl FnMut(&Tensor) -> Result<Tensor>) -> Result<()> {
        self.apply_values(&[], ApplyOptions::new().inplace(true), |value, _| match value {
            Value::Tensor(tensor) => Ok(Some(Value::Tensor(f(tensor)?))),
            other => Ok(Some(other.clone())),
        })?;
        Ok(())
    }

    /**
     * Applies a function to every tensor and the tensors at the same keys in other
     * tensordicts. Returning None drops the entry. With
     * [`inplace`](ApplyOptions::inplace) the results are written back and this tensordict
     * is returned.
     */
    pub fn apply_with_options(
        &self,
        others: &[&TensorDict],
        options: ApplyOptions,
        mut f: impl FnMut(&Tensor, &[Tensor]) -> Result<Option<Tensor>>,
    ) -> Result<TensorDict> {
        self.apply_values(others, options, |value, others| {
            let tensor = match value {
                Value::Tensor(tensor) => tensor,
                other => return Ok(Some(other.clone())),
            };
            let others = others
                .iter()
                .map(|v| v.clone().into_tensor())
                .collect::<Result<Vec<_>>>()?;
            Ok(f(tensor, &others)?.map(Value::Tensor))
        })
    }

    /**
     * Applies a function to every leaf value, whatever its kind, and the values at the
     * same keys in other tensordicts.
     */
    pub fn apply_values(
        &self,
        others: &[&TensorDict],
        options: ApplyOptions,
        mut f: impl FnMut(&Value, &[Value]) -> Result<Option<Value>>,
    ) -> Result<TensorDict> {
        self.named_apply(others, options, |_, value, others| f(value, others))
    }

    /**
     * Like [`apply_values`](TensorDict::apply_values) but the function is also given the
     * key of each entry, see [`nested_keys`](ApplyOptions::nested_keys).
     *
     * ```
     * use easy_tensordict::TensorDict;
     * use easy_tensordict::tensordict::ApplyOptions;
     * use easy_tensordict::Value;
     * let td = TensorDict::new([]);
     * td.set(("a", "b"), 1.0).unwrap();
     * td.set("c", 2.0).unwrap();
     * let mut seen = Vec::new();
     * td.named_apply(&[], ApplyOptions::new().nested_keys(true), |key, value, _| {
     *     seen.push(key.to_string());
     *     Ok(Some(value.clone()))
     * }).unwrap();
     * assert_eq!(seen, vec!["(\"a\", \"b\")", "\"c\""]);
     * ```
     */
    pub fn named_apply(
        &self,
        others: &[&TensorDict],
        options: ApplyOptions,
        mut f: impl FnMut(&NestedKey, &Value, &[Value]) -> Result<Option<Value>>,
    ) -> Result<TensorDict> {
        let others: Vec<Option<TensorDict>> = others.iter().map(|td| Some((*td).clone())).collect();
        let result = self.apply_nest(&mut f, &others, &options, &NestedKey::root())?;
        if options.inplace {
            self.write_back(&result)?;
            return Ok(self.clone());
        }
        if options.propagate_lock && self.is_locked() {
            result.lock_();
        }
        Ok(result)
    }

    fn apply_nest(
        &self,
        f: &mut LeafFn<'_>,
        others: &[Option<TensorDict>],
        options: &ApplyOptions,
        prefix: &NestedKey,
    ) -> Result<TensorDict> {
        let reshaped = options.batch_size.is_some() || options.names.is_some();
        match self.layout() {
            Layout::Stacked(stacked) if !reshaped => {
                let dim = stacked.stack_dim;
                let mut member_others: Vec<Vec<Option<TensorDict>>> =
                    vec![Vec::with_capacity(others.len()); stacked.tensordicts.len()];
                for other in others {
                    match other {
                        Some(td) => {
                            let pieces = td.unbind(dim as isize)?;
                            if pieces.len() != stacked.tensordicts.len() {
                                return Err(TensorDictError::shape(format!(
                                    "cannot apply a function to a lazy stack of {} tensordicts \
                                     with another tensordict of {} along dimension {}",
                                    stacked.tensordicts.len(),
                                    pieces.len(),
                                    dim
                                )));
                            }
                            for (list, piece) in member_others.iter_mut().zip(pieces) {
                                list.push(Some(piece));
                            }
                        }
                        None => member_others.iter_mut().for_each(|list| list.push(None)),
                    }
                }
                let mut results = Vec::with_capacity(stacked.tensordicts.len());
                for (td, others) in stacked.tensordicts.iter().zip(member_others) {
                    results.push(td.apply_nest(f, &others, options, prefix)?);
                }
                TensorDict::lazy_stack(&results, dim as isize)
            }
            Layout::Dense => self.apply_dense(f, others, options, prefix),
            _ => self.to_tensordict()?.apply_dense(f, others, options, prefix),
        }
    }

    fn apply_dense(
        &self,
        f: &mut LeafFn<'_>,
        others: &[Option<TensorDict>],
        options: &ApplyOptions,
        prefix: &NestedKey,
    ) -> Result<TensorDict> {
        let batch_dims = self.batch_dims();
        let batch_size = options.batch_size.clone().unwrap_or_else(|| self.batch_size());
        let device = options.device.unwrap_or_else(|| self.device());
        let names = match (&options.names, &options.batch_size) {
            (Some(names), _) => names.clone(),
            (None, Some(_)) => None,
            (None, None) => self.names(),
        };
        let result = TensorDict::from_dense(batch_size.clone(), device, None);
        if names.is_some() {
            result.rename_(names)?;
        }
        for (key, value) in self.items()? {
            let path = prefix.join(&key);
            let kind = value.kind();
            let leaf = (options.is_leaf)(kind);
            let found = others
                .iter()
                .map(|other| match other {
                    Some(td) => td.get_local_opt(&key),
                    None => Ok(None),
                })
                .collect::<Result<Vec<_>>>()?;
            let new_value = if !leaf && kind.is_container() && !options.call_on_nested {
                let Value::Dict(td) = value else {
                    continue;
                };
                let nested_others = found
                    .into_iter()
                    .zip(others)
                    .map(|(value, other)| match value {
                        Some(Value::Dict(td)) => Ok(Some(td)),
                        Some(other_value) => Err(TensorDictError::type_mismatch(
                            format!("a TensorDict at {}", path),
                            other_value.kind().to_string(),
                        )),
                        None if options.default.is_some() => Ok(None),
                        None => Err(missing_other(other, &path)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let nested_options = match &options.batch_size {
                    Some(new) => {
                        let nested_batch = td.batch_size();
                        let mut batch_size = new.clone();
                        batch_size.extend_from_slice(&nested_batch[batch_dims.min(nested_batch.len())..]);
                        ApplyOptions {
                            batch_size: Some(batch_size),
                            names: Some(None),
                            ..options.clone()
                        }
                    }
                    None => ApplyOptions {
                        names: None,
                        ..options.clone()
                    },
                };
                let nested = td.apply_nest(f, &nested_others, &nested_options, &path)?;
                if options.filter_empty && nested.is_empty() {
                    continue;
                }
                Some(Value::Dict(nested))
            } else if !leaf && kind.is_non_tensor() {
                Some(passthrough(&value, batch_dims, options)?)
            } else {
                let other_values = found
                    .into_iter()
                    .zip(others)
                    .map(|(value, other)| match value {
                        Some(value) => Ok(value),
                        None => options.default.clone().ok_or_else(|| missing_other(other, &path)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let name = if options.nested_keys {
                    path.clone()
                } else {
                    NestedKey::from(key.as_str())
                };
                f(&name, &value, &other_values)?
            };
            let Some(new_value) = new_value else {
                continue;
            };
            if options.checked {
                result.put_entry(&key, new_value);
            } else {
                result.set_local(&key, new_value, SetMode::Replace, false)?;
            }
        }
        Ok(result)
    }

    // Writes the results of an in place traversal back. Everything that would need a
    // structural change is checked before anything is written.
    fn write_back(&self, result: &TensorDict) -> Result<()> {
        let leaves = result.items_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor))?;
        for (key, value) in &leaves {
            let writable = match (self.get_nested_opt(key)?, value) {
                (Some(Value::Tensor(existing)), Value::Tensor(new)) => existing.shape() == new.shape(),
                (Some(existing), value) => {
                    existing.same_identity(value)
                        || (existing.kind().is_non_tensor()
                            && value.kind().is_non_tensor()
                            && existing.shape() == value.shape())
                }
                (None, _) => false,
            };
            if writable {
                continue;
            }
            let locked = match self.holder(key) {
                Ok(holder) => holder.is_locked(),
                Err(_) => self.is_locked(),
            };
            if locked {
                return Err(TensorDictError::Locked);
            }
        }
        if self.ptr_eq(result) {
            return Ok(());
        }
        self.update_with(
            result,
            UpdateOptions {
                inplace: true,
                ..UpdateOptions::default()
            },
        )
    }
}

fn missing_other(other: &Option<TensorDict>, path: &NestedKey) -> TensorDictError {
    TensorDictError::KeyNotFound {
        key: path.to_string(),
        available: other.as_ref().map(TensorDict::keys).unwrap_or_default(),
    }
}

// Non-tensor data that is not a leaf is carried over, following any change of batch size or
// device.
fn passthrough(value: &Value, batch_dims: usize, options: &ApplyOptions) -> Result<Value> {
    let value = match (&options.batch_size, value) {
        (Some(new), Value::NonTensor(data)) => {
            let mut batch_size = new.clone();
            batch_size.extend_from_slice(&data.batch_size()[batch_dims.min(data.batch_size().len())..]);
            Value::NonTensor(data.with_batch_size(batch_size))
        }
        (Some(new), Value::NonTensorStack(stack)) => {
            let mut batch_size = new.clone();
            batch_size.extend_from_slice(&stack.batch_size()[batch_dims.min(stack.batch_size().len())..]);
            stack.reshape(batch_size)?
        }
        (_, value) => value.clone(),
    };
    match options.device {
        Some(device) => value.to_device(device),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::DType;

    fn pair() -> (TensorDict, TensorDict) {
        let a = TensorDict::new([2]);
        a.set("x", Tensor::zeros([2, 3])).unwrap();
        a.set(("n", "y"), Tensor::ones([2])).unwrap();
        a.set_non_tensor("text", "hi").unwrap();
        let b = TensorDict::new([2]);
        b.set("x", Tensor::ones([2, 3])).unwrap();
        b.set(("n", "y"), Tensor::ones([2])).unwrap();
        (a, b)
    }

    #[test]
    fn results_keep_the_structure() {
        let (a, b) = pair();
        let sum = a.apply_with(&[&b], |x, others| x.try_add(&others[0])).unwrap();
        assert_eq!(sum.get_tensor("x").unwrap().to_vec(), vec![1.0; 6]);
        assert_eq!(sum.get_tensor(("n", "y")).unwrap().to_vec(), vec![2.0, 2.0]);
        assert_eq!(sum.get_non_tensor("text").unwrap(), crate::nontensor::Payload::from("hi"));
        assert_eq!(sum.batch_size(), vec![2]);
    }

    #[test]
    fn missing_keys_need_a_default() {
        let (a, _) = pair();
        let other = TensorDict::new([2]);
        other.set("x", Tensor::ones([2, 3])).unwrap();
        assert!(matches!(
            a.apply_with(&[&other], |x, others| x.try_add(&others[0])),
            Err(TensorDictError::KeyNotFound { .. })
        ));
        let options = ApplyOptions::new().default_value(Tensor::full([2], 5.0, DType::Float32));
        let sum = a
            .apply_with_options(&[&other], options, |x, others| x.try_add(&others[0]).map(Some))
            .unwrap();
        assert_eq!(sum.get_tensor(("n", "y")).unwrap().to_vec(), vec![6.0, 6.0]);
    }

    #[test]
    fn none_drops_entries_and_empty_containers() {
        let (a, _) = pair();
        let options = ApplyOptions::new().filter_empty(true);
        let result = a
            .apply_with_options(&[], options, |x, _| Ok((x.ndim() > 1).then(|| x.clone())))
            .unwrap();
        assert!(result.contains("x"));
        assert!(!result.contains("n"));
        let kept = a
            .apply_with_options(&[], ApplyOptions::new(), |x, _| Ok((x.ndim() > 1).then(|| x.clone())))
            .unwrap();
        assert!(kept.get_dict("n").unwrap().is_empty());
    }

    #[test]
    fn batch_size_can_be_changed() {
        let (a, _) = pair();
        let options = ApplyOptions::new().batch_size([]);
        let result = a
            .apply_with_options(&[], options, |x, _| Ok(Some(x.clone())))
            .unwrap();
        assert_eq!(result.batch_size(), Vec::<usize>::new());
        assert_eq!(result.get("text").unwrap().shape(), Vec::<usize>::new());
        assert_eq!(result.get_dict("n").unwrap().batch_size(), Vec::<usize>::new());
        assert!(
            a.apply_with_options(&[], ApplyOptions::new().batch_size([3]), |x, _| Ok(Some(x.clone())))
                .is_err()
        );
    }

    #[test]
    fn inplace_application_respects_the_lock() {
        let (a, _) = pair();
        let x = a.get_tensor("x").unwrap();
        a.lock_();
        a.apply_(|t| Ok(t.map(|v| v + 1.0))).unwrap();
        assert_eq!(x.to_vec(), vec![1.0; 6]);
        let resized = a.apply_values(&[], ApplyOptions::new().inplace(true), |value, _| {
            Ok(Some(match value {
                Value::Tensor(t) => Value::Tensor(Tensor::zeros([2, 7]).to_dtype(t.dtype())),
                other => other.clone(),
            }))
        });
        assert!(matches!(resized, Err(TensorDictError::Locked)));
        assert_eq!(x.to_vec(), vec![1.0; 6]);
    }

    #[test]
    fn locks_can_follow_the_result() {
        let (a, _) = pair();
        a.lock_();
        let options = ApplyOptions::new().propagate_lock(true);
        let copy = a.apply_values(&[], options, |v, _| Ok(Some(v.clone()))).unwrap();
        assert!(copy.is_locked());
        let unlocked = a.apply(|t| Ok(t.clone())).unwrap();
        assert!(!unlocked.is_locked());
    }
}
