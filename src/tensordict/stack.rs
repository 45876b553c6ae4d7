/*!
 * Stacking and concatenating tensordicts.
 *
 * Stacking tensordicts whose entries agree in keys and shapes builds a dense tensordict
 * with a new batch dimension. When the entries do not agree, for example when one member
 * holds a tensor of a different trailing shape, the members are kept as they are in a lazy
 * stack that assembles entries when they are read and sends writes to the member they
 * belong to.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let a = TensorDict::new([2]);
 * a.set("x", Tensor::zeros([2, 3])).unwrap();
 * let b = TensorDict::new([2]);
 * b.set("x", Tensor::zeros([2, 4])).unwrap();
 * let stacked = TensorDict::stack(&[a.clone(), b], 0).unwrap();
 * assert!(stacked.is_lazy_stack());
 * assert_eq!(stacked.batch_size(), vec![2, 2]);
 * assert!(stacked.get("x").is_err());
 * assert!(stacked.tensordicts().unwrap()[0].ptr_eq(&a));
 * ```
 */

use crate::config::Config;
use crate::errors::{Result, TensorDictError};
use crate::nontensor::{cat_non_tensor, stack_non_tensor};
use crate::tensordict::{Body, Layout, Stacked, TensorDict};
use crate::tensors::{self, Device, Tensor, normalize_dim};
use crate::value::Value;

use tracing::debug;

/**
 * Stacks the values a lazy stack's members hold under one key.
 */
pub(crate) fn stack_values(values: &[Value], dim: usize, key: &str) -> Result<Value> {
    let Some(first) = values.first() else {
        return Err(TensorDictError::shape(format!(
            "cannot stack the entry {} of an empty lazy stack",
            key
        )));
    };
    match first {
        Value::Tensor(_) => {
            let tensors = values
                .iter()
                .map(|value| match value {
                    Value::Tensor(tensor) => Ok(tensor.clone()),
                    other => Err(TensorDictError::type_mismatch(
                        format!("a tensor at {} in every member", key),
                        other.kind().to_string(),
                    )),
                })
                .collect::<Result<Vec<Tensor>>>()?;
            if tensors.iter().any(|t| t.shape() != tensors[0].shape()) {
                let shapes: Vec<&[usize]> = tensors.iter().map(Tensor::shape).collect();
                return Err(TensorDictError::shape(format!(
                    "the members of the lazy stack hold tensors of differing shapes {:?} at {}, \
                     use tensordicts() to read them one by one",
                    shapes, key
                )));
            }
            Ok(Value::Tensor(tensors::stack(&tensors, dim as isize)?))
        }
        Value::Dict(_) => {
            let tds = values
                .iter()
                .map(|value| match value {
                    Value::Dict(td) => Ok(td.clone()),
                    other => Err(TensorDictError::type_mismatch(
                        format!("a tensordict at {} in every member", key),
                        other.kind().to_string(),
                    )),
                })
                .collect::<Result<Vec<TensorDict>>>()?;
            Ok(Value::Dict(TensorDict::lazy_stack(&tds, dim as isize)?))
        }
        Value::NonTensor(_) | Value::NonTensorStack(_) => {
            if let Some(other) = values.iter().find(|v| !v.kind().is_non_tensor()) {
                return Err(TensorDictError::type_mismatch(
                    format!("non-tensor data at {} in every member", key),
                    other.kind().to_string(),
                ));
            }
            stack_non_tensor(values, dim as isize)
        }
    }
}

/**
 * Stacks tensordicts into a dense tensordict, or returns None if the entries they hold
 * are not compatible for that.
 *
 * With `exact_keys` the members must hold the same keys at every level of nesting. Without
 * it only keys present in every member are stacked, which is what a lazy stack of the
 * members shows.
 */
pub(crate) fn dense_stack(
    tds: &[TensorDict],
    dim: usize,
    exact_keys: bool,
) -> Result<Option<TensorDict>> {
    let batch_size = check_members(tds)?;
    if exact_keys && !same_key_sets(tds) {
        return Ok(None);
    }
    let first = &tds[0];
    let mut stacked_size = batch_size;
    stacked_size.insert(dim, tds.len());
    let names = first.names().map(|mut names| {
        names.insert(dim, None);
        names
    });
    let result = TensorDict::from_dense(stacked_size, common_device(tds), names);
    for key in common_keys(tds) {
        let values = tds
            .iter()
            .map(|td| td.get_local(&key))
            .collect::<Result<Vec<Value>>>()?;
        let stacked = match &values[0] {
            Value::Tensor(first) => {
                let mut tensors = Vec::with_capacity(values.len());
                for value in &values {
                    match value {
                        Value::Tensor(tensor)
                            if tensor.shape() == first.shape()
                                && tensor.device() == first.device() =>
                        {
                            tensors.push(tensor.clone())
                        }
                        _ => return Ok(None),
                    }
                }
                Value::Tensor(tensors::stack(&tensors, dim as isize)?)
            }
            Value::Dict(_) => {
                let mut nested = Vec::with_capacity(values.len());
                for value in &values {
                    match value {
                        Value::Dict(td) => nested.push(td.clone()),
                        _ => return Ok(None),
                    }
                }
                match dense_stack(&nested, dim, exact_keys)? {
                    Some(td) => Value::Dict(td),
                    None => return Ok(None),
                }
            }
            Value::NonTensor(_) | Value::NonTensorStack(_) => {
                if values.iter().any(|v| !v.kind().is_non_tensor()) {
                    return Ok(None);
                }
                stack_non_tensor(&values, dim as isize)?
            }
        };
        result.put_entry(&key, stacked);
    }
    Ok(Some(result))
}

// The shared batch size of the members of a stack or concatenation.
fn check_members(tds: &[TensorDict]) -> Result<Vec<usize>> {
    let Some(first) = tds.first() else {
        return Err(TensorDictError::shape("cannot stack an empty list of tensordicts"));
    };
    let batch_size = first.batch_size();
    for td in tds {
        if td.batch_size() != batch_size {
            return Err(TensorDictError::shape(format!(
                "cannot stack tensordicts of batch sizes {:?} and {:?}",
                batch_size,
                td.batch_size()
            )));
        }
    }
    Ok(batch_size)
}

fn common_keys(tds: &[TensorDict]) -> Vec<String> {
    let mut keys = tds.first().map(TensorDict::keys).unwrap_or_default();
    for td in tds.iter().skip(1) {
        let present = td.keys();
        keys.retain(|key| present.contains(key));
    }
    keys
}

fn same_key_sets(tds: &[TensorDict]) -> bool {
    let mut sets = tds.iter().map(|td| {
        let mut keys = td.keys();
        keys.sort();
        keys
    });
    match sets.next() {
        Some(first) => sets.all(|keys| keys == first),
        None => true,
    }
}

fn common_device(tds: &[TensorDict]) -> Option<Device> {
    let first = tds.first()?.device();
    tds.iter().all(|td| td.device() == first).then_some(first).flatten()
}

impl TensorDict {
    /**
     * Stacks tensordicts of the same batch size along a new batch dimension.
     *
     * The result is dense when every member holds the same keys with entries of matching
     * shapes, and a lazy stack of the members otherwise.
     */
    pub fn stack(tds: &[TensorDict], dim: isize) -> Result<TensorDict> {
        TensorDict::stack_with(tds, dim, &Config::default())
    }

    /**
     * Stacks tensordicts like [`stack`](TensorDict::stack), returning an error instead of a
     * lazy stack when the configuration disallows falling back to one.
     */
    pub fn stack_with(tds: &[TensorDict], dim: isize, config: &Config) -> Result<TensorDict> {
        let batch_size = check_members(tds)?;
        let dim = normalize_dim(dim, batch_size.len() + 1)?;
        if let Some(stacked) = dense_stack(tds, dim, true)? {
            return Ok(stacked);
        }
        if !config.lazy_stack_fallback {
            return Err(TensorDictError::shape(format!(
                "cannot densely stack {} tensordicts with keys {:?}, their entries differ in \
                 keys or shapes",
                tds.len(),
                tds[0].keys()
            )));
        }
        debug!(members = tds.len(), dim, "falling back to a lazy stack");
        TensorDict::lazy_stack(tds, dim as isize)
    }

    /**
     * Keeps tensordicts of the same batch size as the members of a lazy stack along a new
     * batch dimension. Nothing is copied, reads assemble entries from the members and
     * writes go to them.
     */
    pub fn lazy_stack(tds: &[TensorDict], dim: isize) -> Result<TensorDict> {
        let batch_size = check_members(tds)?;
        let stack_dim = normalize_dim(dim, batch_size.len() + 1)?;
        Ok(TensorDict::from_body(Body::Stacked(Stacked {
            tensordicts: tds.to_vec(),
            stack_dim,
        })))
    }

    /**
     * Stacks densely if every member is a dense tensordict with compatible entries, and
     * lazily otherwise.
     */
    pub fn maybe_dense_stack(tds: &[TensorDict], dim: isize) -> Result<TensorDict> {
        let batch_size = check_members(tds)?;
        let dim = normalize_dim(dim, batch_size.len() + 1)?;
        let all_dense = tds.iter().all(|td| matches!(td.layout(), Layout::Dense));
        if all_dense {
            if let Some(stacked) = dense_stack(tds, dim, true)? {
                return Ok(stacked);
            }
        }
        TensorDict::lazy_stack(tds, dim as isize)
    }

    /**
     * Concatenates tensordicts along an existing batch dimension. The tensordicts must
     * agree on every other batch dimension, and only keys present in all of them are kept.
     *
     * Lazy stacks concatenated along their stack dimension are joined into one lazy stack
     * of all their members.
     */
    pub fn cat(tds: &[TensorDict], dim: isize) -> Result<TensorDict> {
        let Some(first) = tds.first() else {
            return Err(TensorDictError::shape("cannot cat an empty list of tensordicts"));
        };
        let first_batch = first.batch_size();
        let dim = normalize_dim(dim, first_batch.len())?;
        let mut batch_size = first_batch.clone();
        batch_size[dim] = 0;
        for td in tds {
            let other = td.batch_size();
            let compatible = other.len() == first_batch.len()
                && (0..other.len()).all(|d| d == dim || other[d] == first_batch[d]);
            if !compatible {
                return Err(TensorDictError::shape(format!(
                    "cannot cat tensordicts of batch sizes {:?} and {:?} along dimension {}",
                    first_batch, other, dim
                )));
            }
            batch_size[dim] += other[dim];
        }
        let stacks: Option<Vec<Stacked>> = tds
            .iter()
            .map(|td| match td.layout() {
                Layout::Stacked(stacked) if stacked.stack_dim == dim => Some(stacked),
                _ => None,
            })
            .collect();
        if let Some(stacks) = stacks {
            let members: Vec<TensorDict> = stacks.into_iter().flat_map(|s| s.tensordicts).collect();
            return TensorDict::lazy_stack(&members, dim as isize);
        }
        let result = TensorDict::from_dense(batch_size, common_device(tds), first.names());
        for key in common_keys(tds) {
            let values = tds
                .iter()
                .map(|td| td.get_local(&key))
                .collect::<Result<Vec<Value>>>()?;
            let joined = match &values[0] {
                Value::Tensor(_) => {
                    let tensors = values
                        .iter()
                        .map(|value| value.clone().into_tensor())
                        .collect::<Result<Vec<Tensor>>>()?;
                    Value::Tensor(tensors::cat(&tensors, dim as isize)?)
                }
                Value::Dict(_) => {
                    let nested = values
                        .iter()
                        .map(|value| value.clone().into_dict())
                        .collect::<Result<Vec<TensorDict>>>()?;
                    Value::Dict(TensorDict::cat(&nested, dim as isize)?)
                }
                Value::NonTensor(_) | Value::NonTensorStack(_) => {
                    if let Some(other) = values.iter().find(|v| !v.kind().is_non_tensor()) {
                        return Err(TensorDictError::type_mismatch(
                            format!("non-tensor data at {} in every tensordict", key),
                            other.kind().to_string(),
                        ));
                    }
                    cat_non_tensor(&values, dim)?
                }
            };
            result.put_entry(&key, joined);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nontensor::Payload;
    use crate::tensors::Index;

    fn member(value: f64) -> TensorDict {
        let td = TensorDict::new([2]);
        td.set("x", Tensor::full([2, 3], value, tensors::DType::Float64))
            .unwrap();
        td.set(("n", "y"), Tensor::full([2], value, tensors::DType::Float64))
            .unwrap();
        td
    }

    #[test]
    fn compatible_members_stack_densely() {
        let stacked = TensorDict::stack(&[member(1.0), member(2.0)], 1).unwrap();
        assert!(!stacked.is_lazy_stack());
        assert_eq!(stacked.batch_size(), vec![2, 2]);
        assert_eq!(stacked.get_tensor("x").unwrap().shape(), &[2, 2, 3]);
        assert_eq!(
            stacked.get_tensor(("n", "y")).unwrap().to_vec(),
            vec![1.0, 2.0, 1.0, 2.0]
        );
    }

    #[test]
    fn lazy_stacks_write_to_their_members() {
        let a = member(1.0);
        let b = member(2.0);
        b.set("extra", Tensor::zeros([2])).unwrap();
        let stacked = TensorDict::stack(&[a.clone(), b.clone()], 0).unwrap();
        assert!(stacked.is_lazy_stack());
        assert_eq!(stacked.keys(), vec!["x", "n"]);
        stacked.set("z", Tensor::ones([2, 2])).unwrap();
        assert_eq!(a.get_tensor("z").unwrap().to_vec(), vec![1.0, 1.0]);
        let second = stacked.index(&[Index::At(1)]).unwrap();
        assert!(second.ptr_eq(&b));
        let config = Config {
            lazy_stack_fallback: false,
            ..Config::default()
        };
        assert!(TensorDict::stack_with(&[a, b], 0, &config).is_err());
    }

    #[test]
    fn nested_key_sets_must_match_to_stack_densely() {
        let a = member(1.0);
        a.set(("n", "only_a"), Tensor::zeros([2])).unwrap();
        let b = member(2.0);
        b.set(("n", "only_b"), Tensor::ones([2])).unwrap();
        let stacked = TensorDict::stack(&[a.clone(), b.clone()], 0).unwrap();
        assert!(stacked.is_lazy_stack());
        let members = stacked.tensordicts().unwrap();
        assert!(members[0].get_dict("n").unwrap().contains("only_a"));
        assert!(members[1].get_dict("n").unwrap().contains("only_b"));
        assert_eq!(stacked.get_dict("n").unwrap().keys(), vec!["y"]);
        assert!(TensorDict::maybe_dense_stack(&[a, b], 0).unwrap().is_lazy_stack());
    }

    #[test]
    fn members_must_share_a_batch_size() {
        assert!(TensorDict::stack(&[member(1.0), TensorDict::new([3])], 0).is_err());
        assert!(TensorDict::lazy_stack(&[], 0).is_err());
        assert!(TensorDict::stack(&[member(1.0)], 2).is_err());
    }

    #[test]
    fn stacking_non_tensor_data() {
        let tds: Vec<TensorDict> = ["a", "a", "a"]
            .iter()
            .map(|text| {
                let td = TensorDict::new([]);
                td.set_non_tensor("text", *text).unwrap();
                td
            })
            .collect();
        let stacked = TensorDict::stack(&tds, 0).unwrap();
        assert_eq!(stacked.get("text").unwrap().shape(), vec![3]);
        assert_eq!(stacked.get_non_tensor("text").unwrap(), Payload::from("a"));
        tds[1].set_non_tensor("text", "b").unwrap();
        let stacked = TensorDict::stack(&tds, 0).unwrap();
        match stacked.get("text").unwrap() {
            Value::NonTensorStack(stack) => {
                assert_eq!(stack.items()[1], Payload::from("b"));
            }
            other => panic!("expected a stack of non-tensor data, got {:?}", other.kind()),
        }
    }

    #[test]
    fn concatenation() {
        let joined = TensorDict::cat(&[member(1.0), member(2.0)], 0).unwrap();
        assert_eq!(joined.batch_size(), vec![4]);
        assert_eq!(
            joined.get_tensor(("n", "y")).unwrap().to_vec(),
            vec![1.0, 1.0, 2.0, 2.0]
        );
        let lazy = TensorDict::lazy_stack(&[member(1.0), member(2.0)], 0).unwrap();
        let longer = TensorDict::cat(&[lazy.clone(), lazy], 0).unwrap();
        assert_eq!(longer.tensordicts().unwrap().len(), 4);
        assert!(TensorDict::cat(&[member(1.0), TensorDict::new([2, 2])], 0).is_err());
    }

    #[test]
    fn maybe_dense_keeps_lazy_members_lazy() {
        let lazy = TensorDict::lazy_stack(&[member(1.0), member(2.0)], 0).unwrap();
        let dense = lazy.to_tensordict().unwrap();
        let stacked = TensorDict::maybe_dense_stack(&[lazy.clone(), lazy], 0).unwrap();
        assert!(stacked.is_lazy_stack());
        let stacked = TensorDict::maybe_dense_stack(&[dense.clone(), dense], 0).unwrap();
        assert!(!stacked.is_lazy_stack());
        assert_eq!(stacked.batch_size(), vec![2, 2, 2]);
    }
}
