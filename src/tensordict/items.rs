/*!
 * Enumerating, selecting and restructuring keys.
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::{IsLeaf, NestedKey, default_is_leaf, is_leaf_nontensor, normalize};
use crate::tensordict::{ApplyOptions, Body, Layout, SetMode, TensorDict, View};
use crate::value::Value;

use std::collections::HashMap;

/**
 * Which keys an enumeration visits.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::keys::NestedKey;
 * use easy_tensordict::tensordict::KeysOptions;
 * let td = TensorDict::new([]);
 * td.set("a", 1.0).unwrap();
 * td.set(("b", "c"), 2.0).unwrap();
 * let keys = td.keys_with(KeysOptions::leaves()).unwrap();
 * assert_eq!(keys, vec![NestedKey::from("a"), NestedKey::from(("b", "c"))]);
 * ```
 */
#[derive(Clone, Copy, Debug)]
pub struct KeysOptions {
    /**
     * Visit the entries of nested containers as well.
     */
    pub include_nested: bool,
    /**
     * Only return entries that are leaves.
     */
    pub leaves_only: bool,
    /**
     * Decides which kinds of value are leaves. Anything that is not a leaf is recursed into
     * if it is a container.
     */
    pub is_leaf: IsLeaf,
    /**
     * Sort the result by key.
     */
    pub sort: bool,
}

impl Default for KeysOptions {
    fn default() -> KeysOptions {
        KeysOptions {
            include_nested: false,
            leaves_only: false,
            is_leaf: default_is_leaf,
            sort: false,
        }
    }
}

impl KeysOptions {
    /**
     * Every key, nested keys included.
     */
    pub fn nested() -> KeysOptions {
        KeysOptions {
            include_nested: true,
            ..KeysOptions::default()
        }
    }

    /**
     * The keys of every leaf, nested keys included.
     */
    pub fn leaves() -> KeysOptions {
        KeysOptions {
            include_nested: true,
            leaves_only: true,
            ..KeysOptions::default()
        }
    }

    pub fn is_leaf(mut self, is_leaf: IsLeaf) -> KeysOptions {
        self.is_leaf = is_leaf;
        self
    }

    pub fn sort(mut self, sort: bool) -> KeysOptions {
        self.sort = sort;
        self
    }
}

impl TensorDict {
    /**
     * The top level keys in insertion order. A lazy stack has the keys shared by all of its
     * members.
     */
    pub fn keys(&self) -> Vec<String> {
        match self.layout() {
            Layout::Dense => self
                .with_dense(|dense| dense.entries.keys().to_vec())
                .unwrap_or_default(),
            Layout::Stacked(stacked) => {
                let members: Vec<Vec<String>> =
                    stacked.tensordicts.iter().map(TensorDict::keys).collect();
                match members.split_first() {
                    Some((first, rest)) => first
                        .iter()
                        .filter(|key| rest.iter().all(|keys| keys.contains(key)))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                }
            }
            Layout::View(view) => view.source.keys(),
        }
    }

    /**
     * The top level entries in insertion order.
     */
    pub fn items(&self) -> Result<Vec<(String, Value)>> {
        if let Some(entries) = self.with_dense(|dense| {
            dense
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
        }) {
            return Ok(entries);
        }
        self.keys()
            .into_iter()
            .map(|key| {
                let value = self.get_local(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    pub fn keys_with(&self, options: KeysOptions) -> Result<Vec<NestedKey>> {
        Ok(self
            .items_with(options)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /**
     * The entries visited by an enumeration, depth first in insertion order unless sorted.
     */
    pub fn items_with(&self, options: KeysOptions) -> Result<Vec<(NestedKey, Value)>> {
        let mut items = Vec::new();
        self.collect_items(&NestedKey::root(), options, &mut items)?;
        if options.sort {
            items.sort_by(|a, b| a.0.cmp(&b.0));
        }
        Ok(items)
    }

    pub fn values_with(&self, options: KeysOptions) -> Result<Vec<Value>> {
        Ok(self
            .items_with(options)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn collect_items(
        &self,
        prefix: &NestedKey,
        options: KeysOptions,
        items: &mut Vec<(NestedKey, Value)>,
    ) -> Result<()> {
        for (key, value) in self.items()? {
            let path = prefix.join(&key);
            let leaf = (options.is_leaf)(value.kind());
            let nested = match (&value, options.include_nested && !leaf) {
                (Value::Dict(td), true) => Some(td.clone()),
                _ => None,
            };
            if leaf || !options.leaves_only {
                items.push((path.clone(), value));
            }
            if let Some(td) = nested {
                td.collect_items(&path, options, items)?;
            }
        }
        Ok(())
    }

    /**
     * The top level keys in sorted order. Cached while the container is locked.
     */
    pub fn sorted_keys(&self) -> Vec<String> {
        {
            let node = self.read();
            if let Some((version, keys)) = &node.cache.sorted_keys {
                if node.lock.locked && *version == node.cache.version {
                    return keys.clone();
                }
            }
        }
        let mut keys = self.keys();
        keys.sort();
        let mut node = self.write();
        if node.lock.locked {
            let version = node.cache.version;
            node.cache.sorted_keys = Some((version, keys.clone()));
        }
        keys
    }

    /**
     * The number of levels of nested containers below this one. Cached while the container
     * is locked.
     */
    pub fn depth(&self) -> usize {
        {
            let node = self.read();
            if let Some((version, depth)) = node.cache.depth {
                if node.lock.locked && version == node.cache.version {
                    return depth;
                }
            }
        }
        let depth = self
            .children()
            .iter()
            .map(|td| td.depth() + 1)
            .max()
            .unwrap_or(0);
        let depth = match self.layout() {
            // The members of a stack are not a level of nesting of their own.
            Layout::Stacked(_) | Layout::View(_) => depth.saturating_sub(1),
            Layout::Dense => depth,
        };
        let mut node = self.write();
        if node.lock.locked {
            let version = node.cache.version;
            node.cache.depth = Some((version, depth));
        }
        depth
    }

    /**
     * Returns a container with only the selected keys, sharing their values. A nested key
     * selects part of a nested container. With `strict`, a missing key is an error,
     * otherwise it is skipped. The result is locked if this container is.
     *
     * A locked result shares the nested containers it selected whole with this container
     * and holds their lock as well. Until the result is dropped neither it nor this
     * container can be unlocked, [`unlock_`](TensorDict::unlock_) returns
     * [`LockedGraph`](TensorDictError::LockedGraph) naming the other one.
     */
    pub fn select<K, I>(&self, keys: I, strict: bool) -> Result<TensorDict>
    where
        K: Into<NestedKey>,
        I: IntoIterator<Item = K>,
    {
        let keys = keys
            .into_iter()
            .map(normalize)
            .collect::<Result<Vec<_>>>()?;
        self.select_keys(&keys, strict)
    }

    fn select_keys(&self, keys: &[NestedKey], strict: bool) -> Result<TensorDict> {
        let result = match self.layout() {
            Layout::Stacked(stacked) => TensorDict::lazy_stack(
                &stacked
                    .tensordicts
                    .iter()
                    .map(|td| td.select_keys(keys, strict))
                    .collect::<Result<Vec<_>>>()?,
                stacked.stack_dim as isize,
            )?,
            Layout::View(view) => TensorDict::from_body(Body::View(View {
                source: view.source.select_keys(keys, strict)?,
                ..view
            })),
            Layout::Dense => {
                let result = self.empty_like();
                for (key, nested) in group_keys(keys) {
                    let value = match self.get_local_opt(&key)? {
                        Some(value) => value,
                        None if strict => return Err(self.missing(&NestedKey::from(key))),
                        None => continue,
                    };
                    let value = match (nested, value) {
                        (None, value) => value,
                        (Some(rest), Value::Dict(td)) => Value::Dict(td.select_keys(&rest, strict)?),
                        (Some(_), other) if strict => {
                            return Err(TensorDictError::type_mismatch(
                                format!("a TensorDict at {:?}", key),
                                other.kind().to_string(),
                            ));
                        }
                        (Some(_), _) => continue,
                    };
                    result.put_entry(&key, value);
                }
                result
            }
        };
        if self.is_locked() {
            result.lock_();
        }
        Ok(result)
    }

    /**
     * Returns a container without the given keys, sharing the remaining values. A nested
     * key excludes part of a nested container. Missing keys are ignored. The result is
     * locked if this container is, with the same effect on unlocking as for
     * [`select`](TensorDict::select).
     */
    pub fn exclude<K, I>(&self, keys: I) -> Result<TensorDict>
    where
        K: Into<NestedKey>,
        I: IntoIterator<Item = K>,
    {
        let keys = keys
            .into_iter()
            .map(normalize)
            .collect::<Result<Vec<_>>>()?;
        self.exclude_keys(&keys)
    }

    fn exclude_keys(&self, keys: &[NestedKey]) -> Result<TensorDict> {
        let result = match self.layout() {
            Layout::Stacked(stacked) => TensorDict::lazy_stack(
                &stacked
                    .tensordicts
                    .iter()
                    .map(|td| td.exclude_keys(keys))
                    .collect::<Result<Vec<_>>>()?,
                stacked.stack_dim as isize,
            )?,
            Layout::View(view) => TensorDict::from_body(Body::View(View {
                source: view.source.exclude_keys(keys)?,
                ..view
            })),
            Layout::Dense => {
                let groups: HashMap<String, Option<Vec<NestedKey>>> =
                    group_keys(keys).into_iter().collect();
                let result = self.empty_like();
                for (key, value) in self.items()? {
                    let value = match (groups.get(&key), value) {
                        (Some(None), _) => continue,
                        (Some(Some(rest)), Value::Dict(td)) => Value::Dict(td.exclude_keys(rest)?),
                        (_, value) => value,
                    };
                    result.put_entry(&key, value);
                }
                result
            }
        };
        if self.is_locked() {
            result.lock_();
        }
        Ok(result)
    }

    /**
     * Deletes the given keys. Missing keys are ignored.
     */
    pub fn exclude_<K, I>(&self, keys: I) -> Result<()>
    where
        K: Into<NestedKey>,
        I: IntoIterator<Item = K>,
    {
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        for key in keys {
            let key = normalize(key)?;
            if self.contains(&key) {
                self.del_(&key)?;
            }
        }
        Ok(())
    }

    /**
     * Returns a container with no nesting, where each leaf's nested key is joined with a
     * separator. Non-tensor data counts as a leaf. Two paths that join to the same string
     * are a [`KeyCollision`](TensorDictError::KeyCollision).
     *
     * ```
     * use easy_tensordict::TensorDict;
     * let td = TensorDict::new([]);
     * td.set(("a", "b"), 1.0).unwrap();
     * td.set("c", 2.0).unwrap();
     * let flat = td.flatten_keys(".").unwrap();
     * assert_eq!(flat.keys(), vec!["a.b", "c"]);
     * assert_eq!(flat.unflatten_keys(".").unwrap(), td);
     * ```
     */
    pub fn flatten_keys(&self, separator: &str) -> Result<TensorDict> {
        let leaves = self.items_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor))?;
        let result = TensorDict::from_dense(self.batch_size(), self.device(), self.names());
        let mut seen: HashMap<String, NestedKey> = HashMap::new();
        for (key, value) in leaves {
            let flat = key.flatten(separator);
            if let Some(previous) = seen.get(&flat) {
                return Err(TensorDictError::KeyCollision {
                    keys: vec![previous.to_string(), key.to_string()],
                });
            }
            result.set_local(&flat, value, SetMode::Replace, false)?;
            seen.insert(flat, key);
        }
        Ok(result)
    }

    /**
     * Flattens the keys of this container in place, see
     * [`flatten_keys`](TensorDict::flatten_keys).
     */
    pub fn flatten_keys_(&self, separator: &str) -> Result<()> {
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        if !matches!(self.layout(), Layout::Dense) {
            return Err(TensorDictError::Unsupported(
                "flattening the keys of a lazy tensordict in place".to_string(),
            ));
        }
        let flat = self.flatten_keys(separator)?;
        let entries = flat
            .with_dense(|dense| dense.entries.clone())
            .unwrap_or_default();
        let mut node = self.write();
        if let Body::Dense(dense) = &mut node.body {
            dense.entries = entries;
        }
        node.cache.bump();
        Ok(())
    }

    /**
     * Splits top level keys containing a separator into nested keys, the inverse of
     * [`flatten_keys`](TensorDict::flatten_keys). Keys without the separator are kept as
     * they are. A nested key that would overwrite an existing entry is a
     * [`KeyOverride`](TensorDictError::KeyOverride).
     */
    pub fn unflatten_keys(&self, separator: &str) -> Result<TensorDict> {
        let result = TensorDict::from_dense(self.batch_size(), self.device(), self.names());
        let (plain, split): (Vec<_>, Vec<_>) = self
            .items()?
            .into_iter()
            .partition(|(key, _)| !key.contains(separator));
        for (key, value) in plain {
            let value = match value {
                // Unflattened keys may be written into this container later.
                Value::Dict(td) => Value::Dict(td.clone_structure()),
                other => other,
            };
            result.set_local(&key, value, SetMode::Replace, false)?;
        }
        for (key, value) in split {
            let nested = NestedKey::new(key.split(separator).map(str::to_string).collect())?;
            if result.contains(&nested) {
                return Err(TensorDictError::KeyOverride(nested.to_string()));
            }
            result.set_nested(&nested, value, SetMode::Replace, false)?;
        }
        Ok(result)
    }

    /**
     * Every non-tensor entry, nested ones included.
     */
    pub fn non_tensor_items(&self) -> Result<Vec<(NestedKey, Value)>> {
        Ok(self
            .items_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor))?
            .into_iter()
            .filter(|(_, value)| value.kind().is_non_tensor())
            .collect())
    }

    /**
     * Returns a container without any non-tensor data.
     */
    pub fn filter_non_tensor_data(&self) -> Result<TensorDict> {
        let options = ApplyOptions::new().is_leaf(is_leaf_nontensor);
        self.apply_values(&[], options, |value, _| {
            if value.kind().is_non_tensor() {
                Ok(None)
            } else {
                Ok(Some(value.clone()))
            }
        })
    }
}

// Groups keys by their first part in order of appearance. None selects the whole entry,
// otherwise the rest of each key is listed.
fn group_keys(keys: &[NestedKey]) -> Vec<(String, Option<Vec<NestedKey>>)> {
    let mut groups: Vec<(String, Option<Vec<NestedKey>>)> = Vec::new();
    for key in keys {
        let (first, rest) = key.split_first();
        let position = match groups.iter().position(|(k, _)| k == first) {
            Some(position) => position,
            None => {
                groups.push((first.to_string(), Some(Vec::new())));
                groups.len() - 1
            }
        };
        match (rest, &mut groups[position].1) {
            (None, whole) => *whole = None,
            (Some(rest), Some(list)) => list.push(rest),
            (Some(_), None) => {}
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    fn sample() -> TensorDict {
        let td = TensorDict::new([2]);
        td.set("a", Tensor::zeros([2])).unwrap();
        td.set(("b", "c"), Tensor::zeros([2, 3])).unwrap();
        td.set(("b", "d"), Tensor::zeros([2])).unwrap();
        td.set_non_tensor("text", "hello").unwrap();
        td
    }

    #[test]
    fn enumerations_respect_the_leaf_predicate() {
        let td = sample();
        assert_eq!(td.keys(), vec!["a", "b", "text"]);
        let nested = td.keys_with(KeysOptions::nested()).unwrap();
        assert_eq!(nested.len(), 5);
        let leaves = td.keys_with(KeysOptions::leaves()).unwrap();
        assert_eq!(
            leaves,
            vec![
                NestedKey::from("a"),
                NestedKey::from(("b", "c")),
                NestedKey::from(("b", "d"))
            ]
        );
        let with_text = td
            .keys_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor).sort(true))
            .unwrap();
        assert_eq!(with_text.last(), Some(&NestedKey::from("text")));
        assert_eq!(td.non_tensor_items().unwrap().len(), 1);
        assert!(!td.filter_non_tensor_data().unwrap().contains("text"));
    }

    #[test]
    fn selections_share_values() {
        let td = sample();
        let selected = td.select([("b", "c")], true).unwrap();
        assert_eq!(selected.keys(), vec!["b"]);
        assert_eq!(selected.get_dict("b").unwrap().keys(), vec!["c"]);
        assert!(
            selected
                .get_tensor(("b", "c"))
                .unwrap()
                .same_storage(&td.get_tensor(("b", "c")).unwrap())
        );
        assert!(td.select(["missing"], true).is_err());
        assert!(td.select(["missing"], false).unwrap().keys().is_empty());
        let excluded = td.exclude([NestedKey::from("a"), NestedKey::from(("b", "d"))]).unwrap();
        assert_eq!(excluded.keys(), vec!["b", "text"]);
        assert_eq!(excluded.get_dict("b").unwrap().keys(), vec!["c"]);
        td.exclude_(["a"]).unwrap();
        assert!(!td.contains("a"));
    }

    #[test]
    fn flattening_detects_collisions() {
        let td = TensorDict::new([]);
        td.set(("a", "b"), 1.0).unwrap();
        td.set("a.b", 2.0).unwrap();
        assert!(matches!(
            td.flatten_keys("."),
            Err(TensorDictError::KeyCollision { .. })
        ));
        let clash = TensorDict::new([]);
        clash.set("a", 1.0).unwrap();
        clash.set("a.b", 2.0).unwrap();
        assert!(clash.unflatten_keys(".").is_err());
    }

    #[test]
    fn sorted_keys_and_depth_are_cached_while_locked() {
        let td = sample();
        assert_eq!(td.depth(), 1);
        td.lock_();
        assert_eq!(td.sorted_keys(), vec!["a", "b", "text"]);
        assert_eq!(td.sorted_keys(), vec!["a", "b", "text"]);
        assert_eq!(td.depth(), 1);
        td.unlock_().unwrap();
        td.set(("b", "e", "f"), Tensor::zeros([2])).unwrap();
        assert_eq!(td.depth(), 2);
    }
}
