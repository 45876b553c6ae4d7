/*!
 * State dicts, an ordered mapping of every entry along with the metadata needed to rebuild
 * a tensordict.
 *
 * Each level of a state dict holds its entries under their keys, nested tensordicts as
 * nested state dicts, and two reserved entries recording the batch size and device of that
 * level. A tensordict with a real key using either reserved name cannot produce a state
 * dict.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let data = TensorDict::new([]);
 * data.set("a", 1.0).unwrap();
 * data.set(("b", "c"), 3.0).unwrap();
 * let zeroed = TensorDict::new([]);
 * zeroed.set("a", 0.0).unwrap();
 * zeroed.set(("b", "c"), 0.0).unwrap();
 * zeroed.load_state_dict(&data.state_dict(false, false).unwrap(), true, false, false).unwrap();
 * assert_eq!(zeroed.get_tensor(("b", "c")).unwrap().item(), Some(3.0));
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::NestedKey;
use crate::tensordict::{Body, Dense, Layout, TensorDict};
use crate::tensors::{Device, Tensor};
use crate::value::Value;

use tracing::warn;

/**
 * The reserved key recording the batch size of each level.
 */
pub const BATCH_SIZE_KEY: &str = "__batch_size";

/**
 * The reserved key recording the device of each level.
 */
pub const DEVICE_KEY: &str = "__device";

const DOT_ERROR: &str = "Cannot use load_state_dict(..., from_flatten=True, assign=True) when \
                         some keys contain a dot character.";

/**
 * An entry of a [`StateDict`].
 */
#[derive(Clone, Debug, PartialEq)]
pub enum StateValue {
    /**
     * A tensor or non-tensor entry.
     */
    Leaf(Value),
    Nested(StateDict),
    BatchSize(Vec<usize>),
    Device(Option<Device>),
}

/**
 * An insertion ordered mapping from keys to [`StateValue`]s, produced by
 * [`state_dict`](TensorDict::state_dict).
 */
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDict {
    entries: Vec<(String, StateValue)>,
}

impl StateDict {
    pub fn new() -> StateDict {
        StateDict::default()
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /**
     * Inserts an entry, replacing the value of an existing key in place.
     */
    pub fn insert(&mut self, key: impl Into<String>, value: StateValue) -> Option<StateValue> {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        let position = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(position).1)
    }

    /**
     * Every key in order, including the reserved ones.
     */
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // The entries that are not reserved.
    fn content(&self) -> impl Iterator<Item = (&str, &StateValue)> {
        self.iter().filter(|(k, _)| !is_reserved(k))
    }

    // A state dict with no leaves, only nested state dicts that have none either.
    fn has_no_leaves(&self) -> bool {
        self.content().all(|(_, value)| match value {
            StateValue::Nested(nested) => nested.has_no_leaves(),
            _ => false,
        })
    }
}

fn is_reserved(key: &str) -> bool {
    key == BATCH_SIZE_KEY || key == DEVICE_KEY
}

impl TensorDict {
    /**
     * Produces a state dict of this tensordict. Leaves are deep cloned unless `keep_vars`
     * is set, and with `flatten` nested keys are joined with `.` into a single level.
     */
    pub fn state_dict(&self, keep_vars: bool, flatten: bool) -> Result<StateDict> {
        let source = if flatten {
            self.flatten_keys(".")?
        } else {
            self.clone()
        };
        let mut out = StateDict::new();
        for (key, value) in source.items()? {
            if is_reserved(&key) {
                return Err(TensorDictError::ReservedKey(key));
            }
            let entry = match value {
                Value::Dict(td) => StateValue::Nested(td.state_dict(keep_vars, false)?),
                leaf if keep_vars => StateValue::Leaf(leaf),
                leaf => StateValue::Leaf(leaf.deep_clone()),
            };
            out.insert(key, entry);
        }
        out.insert(BATCH_SIZE_KEY, StateValue::BatchSize(source.batch_size()));
        out.insert(DEVICE_KEY, StateValue::Device(source.device()));
        Ok(out)
    }

    /**
     * Loads a state dict produced by [`state_dict`](TensorDict::state_dict).
     *
     * With `strict` the keys of the state dict must match the keys of this tensordict,
     * except for keys on either side that only hold empty containers. With `assign` the
     * values of the state dict replace the entries, otherwise they are copied into the
     * existing tensors in place. `from_flatten` loads a state dict produced with `flatten`.
     *
     * A load that fails leaves this tensordict as it was before the call.
     */
    pub fn load_state_dict(
        &self,
        state_dict: &StateDict,
        strict: bool,
        assign: bool,
        from_flatten: bool,
    ) -> Result<&TensorDict> {
        let mut journal = Journal::default();
        journal.keep_structure(self);
        match self.load_journaled(state_dict, strict, assign, from_flatten, &mut journal) {
            Ok(()) => Ok(self),
            Err(error) => {
                journal.roll_back();
                Err(error)
            }
        }
    }

    fn load_journaled(
        &self,
        state_dict: &StateDict,
        strict: bool,
        assign: bool,
        from_flatten: bool,
        journal: &mut Journal,
    ) -> Result<()> {
        if from_flatten {
            let flat = self.flatten_keys(".")?;
            flat.load_journaled(state_dict, strict, assign, false, journal)?;
            if !assign {
                // The flat container shares its tensors with this one.
                return Ok(());
            }
            let has_dot = self
                .keys_with(crate::tensordict::KeysOptions::nested())?
                .iter()
                .any(|key| key.parts().iter().any(|part| part.contains('.')));
            if has_dot {
                return Err(TensorDictError::Unsupported(DOT_ERROR.to_string()));
            }
            self.update(&flat.unflatten_keys(".")?)?;
            return Ok(());
        }
        let batch_size = match state_dict.get(BATCH_SIZE_KEY) {
            Some(StateValue::BatchSize(batch_size)) => batch_size.clone(),
            _ => {
                return Err(TensorDictError::KeyNotFound {
                    key: NestedKey::from(BATCH_SIZE_KEY).to_string(),
                    available: state_dict.keys().iter().map(|k| k.to_string()).collect(),
                });
            }
        };
        let device = match state_dict.get(DEVICE_KEY) {
            Some(StateValue::Device(device)) => *device,
            _ => None,
        };
        if strict {
            self.check_key_sets(state_dict)?;
        }
        if let (Some(incoming), Some(own)) = (device, self.device()) {
            if incoming != own {
                return Err(TensorDictError::DeviceMismatch {
                    expected: own.to_string(),
                    found: incoming.to_string(),
                });
            }
        }
        if batch_size != self.batch_size() {
            self.set_batch_size(batch_size)?;
        }
        for (key, item) in state_dict.content() {
            match item {
                StateValue::Nested(nested) => {
                    let dest = match self.get_local_opt(key)? {
                        Some(Value::Dict(td)) => td,
                        _ => self.empty_like(),
                    };
                    dest.load_journaled(nested, strict, assign, false, journal)?;
                    if assign {
                        self.set(key, dest)?;
                    } else {
                        self.set_inplace(key, dest)?;
                    }
                }
                StateValue::Leaf(value) => {
                    if assign {
                        self.set(key, value.clone())?;
                    } else {
                        journal.keep_data(self, key);
                        self.set_inplace(key, value.clone())?;
                    }
                }
                StateValue::BatchSize(_) | StateValue::Device(_) => {
                    return Err(TensorDictError::type_mismatch(
                        "an entry or nested state dict",
                        format!("metadata at the key {}", key),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_key_sets(&self, state_dict: &StateDict) -> Result<()> {
        let own = self.keys();
        let incoming: Vec<&str> = state_dict.content().map(|(k, _)| k).collect();
        let tensordict_extra: Vec<String> = own
            .iter()
            .filter(|key| !incoming.contains(&key.as_str()))
            .cloned()
            .collect();
        let state_dict_extra: Vec<String> = incoming
            .iter()
            .filter(|key| !own.iter().any(|k| k == *key))
            .map(|key| key.to_string())
            .collect();
        // Keys that only hold empty containers on either side are harmless.
        let harmless_own = tensordict_extra.iter().all(|key| {
            matches!(self.get_local_opt(key), Ok(Some(Value::Dict(td))) if td.is_empty())
        });
        let harmless_incoming = state_dict_extra.iter().all(|key| {
            matches!(state_dict.get(key), Some(StateValue::Nested(nested)) if nested.has_no_leaves())
        });
        if harmless_own && harmless_incoming {
            return Ok(());
        }
        Err(TensorDictError::KeySetMismatch {
            state_dict_extra,
            tensordict_extra,
        })
    }
}

/**
 * What a load is about to change, recorded before it changes it, so that a load failing
 * part way can be undone.
 */
#[derive(Default)]
struct Journal {
    bodies: Vec<(TensorDict, Dense)>,
    data: Vec<(Tensor, Tensor)>,
}

impl Journal {
    // Keeps the entries, batch size and names of every dense container in the tree.
    fn keep_structure(&mut self, td: &TensorDict) {
        match td.layout() {
            Layout::Dense => {
                let Some(dense) = td.with_dense(Dense::clone) else {
                    return;
                };
                for (_, value) in dense.entries.iter() {
                    if let Value::Dict(nested) = value {
                        self.keep_structure(nested);
                    }
                }
                self.bodies.push((td.clone(), dense));
            }
            Layout::Stacked(stacked) => {
                for member in &stacked.tensordicts {
                    self.keep_structure(member);
                }
            }
            Layout::View(view) => self.keep_structure(&view.source),
        }
    }

    // Keeps the data of every tensor an in place write at the key can reach.
    fn keep_data(&mut self, td: &TensorDict, key: &str) {
        match td.layout() {
            Layout::Dense => match td.with_dense(|dense| dense.entries.get(key).cloned()).flatten() {
                Some(Value::Tensor(tensor)) => {
                    let copy = tensor.deep_clone();
                    self.data.push((tensor, copy));
                }
                Some(Value::Dict(nested)) => {
                    for nested_key in nested.keys() {
                        self.keep_data(&nested, &nested_key);
                    }
                }
                _ => {}
            },
            Layout::Stacked(stacked) => {
                for member in &stacked.tensordicts {
                    self.keep_data(member, key);
                }
            }
            Layout::View(view) => self.keep_data(&view.source, key),
        }
    }

    fn roll_back(self) {
        for (tensor, copy) in self.data.into_iter().rev() {
            if let Err(error) = tensor.copy_(&copy) {
                warn!(%error, "could not restore a tensor after a failed state dict load");
            }
        }
        for (td, dense) in self.bodies.into_iter().rev() {
            let mut node = td.write();
            node.body = Body::Dense(dense);
            node.cache.bump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    fn sample() -> TensorDict {
        let td = TensorDict::new([2]);
        td.set("a", Tensor::new(vec![1.0, 2.0], [2])).unwrap();
        td.set(("b", "c"), Tensor::new(vec![3.0, 4.0], [2])).unwrap();
        td
    }

    #[test]
    fn state_dicts_record_metadata_per_level() {
        let sd = sample().state_dict(false, false).unwrap();
        assert_eq!(sd.keys(), vec!["a", "b", BATCH_SIZE_KEY, DEVICE_KEY]);
        assert_eq!(sd.get(BATCH_SIZE_KEY), Some(&StateValue::BatchSize(vec![2])));
        match sd.get("b") {
            Some(StateValue::Nested(nested)) => {
                assert_eq!(nested.keys(), vec!["c", BATCH_SIZE_KEY, DEVICE_KEY]);
            }
            other => panic!("expected a nested state dict, got {:?}", other),
        }
        let flat = sample().state_dict(false, true).unwrap();
        assert_eq!(flat.keys(), vec!["a", "b.c", BATCH_SIZE_KEY, DEVICE_KEY]);
    }

    #[test]
    fn state_dict_leaves_are_copies_unless_kept() {
        let td = sample();
        let sd = td.state_dict(false, false).unwrap();
        td.get_tensor("a").unwrap().fill_(0.0);
        match sd.get("a") {
            Some(StateValue::Leaf(Value::Tensor(tensor))) => {
                assert_eq!(tensor.to_vec(), vec![1.0, 2.0])
            }
            other => panic!("expected a tensor, got {:?}", other),
        }
        let kept = td.state_dict(true, false).unwrap();
        match kept.get("a") {
            Some(StateValue::Leaf(Value::Tensor(tensor))) => {
                assert!(tensor.same_storage(&td.get_tensor("a").unwrap()))
            }
            other => panic!("expected a tensor, got {:?}", other),
        }
    }

    #[test]
    fn reserved_keys_are_rejected() {
        let td = TensorDict::new([]);
        td.set(BATCH_SIZE_KEY, 1.0).unwrap();
        assert!(matches!(
            td.state_dict(false, false),
            Err(TensorDictError::ReservedKey(_))
        ));
    }

    #[test]
    fn loading_copies_in_place() {
        let source = sample();
        let target = sample().deep_clone();
        target.zero_().unwrap();
        let before = target.get_tensor(("b", "c")).unwrap();
        target.lock_();
        target
            .load_state_dict(&source.state_dict(false, false).unwrap(), true, false, false)
            .unwrap();
        assert_eq!(before.to_vec(), vec![3.0, 4.0]);
        let flat = source.state_dict(false, true).unwrap();
        target.zero_().unwrap();
        target.load_state_dict(&flat, true, false, true).unwrap();
        assert_eq!(before.to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn loading_with_assign_replaces_entries() {
        let source = sample();
        let target = TensorDict::new([2]);
        target.set("empty", TensorDict::new([2])).unwrap();
        let sd = source.state_dict(false, false).unwrap();
        assert!(target.load_state_dict(&sd, true, true, false).is_err());
        target.load_state_dict(&sd, false, true, false).unwrap();
        assert!(target.contains("empty"));
        assert_eq!(target.get_tensor(("b", "c")).unwrap().to_vec(), vec![3.0, 4.0]);
        let flat_target = TensorDict::new([2]);
        flat_target
            .load_state_dict(&source.state_dict(false, true).unwrap(), false, true, true)
            .unwrap();
        assert_eq!(flat_target.get_tensor(("b", "c")).unwrap().to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn strict_loading_needs_matching_keys() {
        let source = sample();
        let target = TensorDict::new([2]);
        target.set("a", Tensor::zeros([2])).unwrap();
        let error = target
            .load_state_dict(&source.state_dict(false, false).unwrap(), true, false, false)
            .unwrap_err();
        assert!(error.to_string().contains("key sets don't match"));
        assert!(matches!(
            error,
            TensorDictError::KeySetMismatch { ref state_dict_extra, .. } if state_dict_extra == &vec!["b".to_string()]
        ));
    }
}
