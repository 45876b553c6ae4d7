/*!
 * Reading, writing and deleting entries.
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::{NestedKey, ValueKind, is_leaf_nontensor, normalize};
use crate::nontensor::{NonTensorData, Payload};
use crate::tensordict::items::KeysOptions;
use crate::tensordict::{Body, Layout, Names, TensorDict, stack};
use crate::tensors::indexing::{Index, expand_ellipsis};
use crate::tensors::{Device, Tensor};
use crate::value::{IntoValue, Value};

use tracing::trace;

/**
 * How a write treats an entry that already exists.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SetMode {
    // Replace the entry, which is a structural change.
    Replace,
    // Write into the existing entry if it is compatible, otherwise replace it.
    Inplace,
    // Write into the existing entry, failing if it is missing or incompatible.
    Strict,
}

/**
 * Options for [`update_with`](TensorDict::update_with).
 */
#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    /**
     * Write into existing entries where possible instead of replacing them.
     */
    pub inplace: bool,
    /**
     * Deep clone the values taken from the other container first.
     */
    pub clone: bool,
    /**
     * Only update these keys, if given. A nested key selects an entry of a nested container
     * and leaves its other entries untouched.
     */
    pub keys_to_update: Option<Vec<NestedKey>>,
}

// Which part of a nested container an update touches: everything or a list of sub keys.
fn sub_keys(keys: &Option<Vec<NestedKey>>, key: &str) -> Option<Option<Vec<NestedKey>>> {
    let Some(keys) = keys else {
        return Some(None);
    };
    let mut nested = Vec::new();
    let mut selected = false;
    for candidate in keys.iter().filter(|k| k.first() == key) {
        selected = true;
        match candidate.split_first() {
            (_, None) => return Some(None),
            (_, Some(rest)) => nested.push(rest),
        }
    }
    selected.then_some(Some(nested))
}

impl TensorDict {
    /**
     * Returns the value at a key, which may be a nested key.
     *
     * Reading a tensor returns a handle to its storage, so writing into the returned tensor
     * in place modifies the entry. Reading a nested container returns a handle to it.
     */
    pub fn get<K: Into<NestedKey>>(&self, key: K) -> Result<Value> {
        let key = normalize(key)?;
        self.get_nested_opt(&key)?
            .ok_or_else(|| self.missing(&key))
    }

    /**
     * Returns the value at a key, or a default if the key is missing. An invalid key is
     * still an error.
     */
    pub fn get_or<K: Into<NestedKey>>(&self, key: K, default: Value) -> Result<Value> {
        let key = normalize(key)?;
        Ok(self.get_nested_opt(&key)?.unwrap_or(default))
    }

    /**
     * Returns the tensor at a key.
     */
    pub fn get_tensor<K: Into<NestedKey>>(&self, key: K) -> Result<Tensor> {
        self.get(key)?.into_tensor()
    }

    /**
     * Returns the nested container at a key.
     */
    pub fn get_dict<K: Into<NestedKey>>(&self, key: K) -> Result<TensorDict> {
        self.get(key)?.into_dict()
    }

    /**
     * Returns the payload of the non-tensor data at a key.
     *
     * If the key holds a stack of differing non-tensor values there is no single payload,
     * and [`NonTensorStackData`](TensorDictError::NonTensorStackData) is returned.
     */
    pub fn get_non_tensor<K: Into<NestedKey>>(&self, key: K) -> Result<Payload> {
        match self.get(key)? {
            Value::NonTensor(data) => Ok(data.data().clone()),
            Value::NonTensorStack(_) => Err(TensorDictError::NonTensorStackData),
            other => Err(TensorDictError::type_mismatch(
                "NonTensorData",
                other.kind().to_string(),
            )),
        }
    }

    /**
     * Returns the value at a key indexed along the batch dimensions.
     */
    pub fn get_at<K: Into<NestedKey>>(&self, key: K, index: &[Index]) -> Result<Value> {
        let indexes = expand_ellipsis(index, self.batch_dims())?;
        self.get(key)?.index_batch(&indexes)
    }

    /**
     * True if the key is present. Invalid keys are never present.
     */
    pub fn contains<K: Into<NestedKey>>(&self, key: K) -> bool {
        match normalize(key) {
            Ok(key) => matches!(self.get_nested_opt(&key), Ok(Some(_))),
            Err(_) => false,
        }
    }

    /**
     * The shape of the value at a key. For lazy stacks whose members hold values of
     * differing shapes, dimensions that differ are reported as -1.
     */
    pub fn get_item_shape<K: Into<NestedKey>>(&self, key: K) -> Result<Vec<isize>> {
        let key = normalize(key)?;
        let (first, rest) = key.split_first();
        match self.layout() {
            Layout::Stacked(stacked) => {
                let shapes = stacked
                    .tensordicts
                    .iter()
                    .map(|td| td.get_item_shape(&key))
                    .collect::<Result<Vec<_>>>()?;
                let mut shape = shapes.first().cloned().unwrap_or_default();
                for other in &shapes[1..] {
                    if other.len() != shape.len() {
                        return Err(TensorDictError::shape(format!(
                            "the members of a lazy stack hold values of differing numbers of \
                             dimensions at {}",
                            key
                        )));
                    }
                    for (dim, length) in shape.iter_mut().enumerate() {
                        if *length != other[dim] {
                            *length = -1;
                        }
                    }
                }
                let dim = stacked.stack_dim.min(shape.len());
                shape.insert(dim, stacked.tensordicts.len() as isize);
                Ok(shape)
            }
            _ => match rest {
                Some(rest) => self.get_local(first)?.into_dict()?.get_item_shape(rest),
                None => Ok(self
                    .get_local(first)?
                    .shape()
                    .into_iter()
                    .map(|d| d as isize)
                    .collect()),
            },
        }
    }

    pub(crate) fn missing(&self, key: &NestedKey) -> TensorDictError {
        TensorDictError::KeyNotFound {
            key: key.to_string(),
            available: self.keys(),
        }
    }

    pub(crate) fn get_nested_opt(&self, key: &NestedKey) -> Result<Option<Value>> {
        let mut current = self.clone();
        let parts = key.parts();
        for (i, part) in parts.iter().enumerate() {
            let Some(value) = current.get_local_opt(part)? else {
                return Ok(None);
            };
            if i + 1 == parts.len() {
                return Ok(Some(value));
            }
            match value {
                Value::Dict(td) => current = td,
                other => {
                    return Err(TensorDictError::type_mismatch(
                        format!("a TensorDict at {}", NestedKey::from(parts[..=i].to_vec())),
                        other.kind().to_string(),
                    ));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn get_local_opt(&self, key: &str) -> Result<Option<Value>> {
        match self.layout() {
            Layout::Dense => Ok(self
                .with_dense(|dense| dense.entries.get(key).cloned())
                .flatten()),
            Layout::Stacked(stacked) => {
                let mut values = Vec::with_capacity(stacked.tensordicts.len());
                for td in &stacked.tensordicts {
                    match td.get_local_opt(key)? {
                        Some(value) => values.push(value),
                        None => return Ok(None),
                    }
                }
                Ok(Some(stack::stack_values(&values, stacked.stack_dim, key)?))
            }
            Layout::View(view) => match view.source.get_local_opt(key)? {
                Some(value) => Ok(Some(view.op.view_value(&value)?)),
                None => Ok(None),
            },
        }
    }

    pub(crate) fn get_local(&self, key: &str) -> Result<Value> {
        self.get_local_opt(key)?
            .ok_or_else(|| self.missing(&NestedKey::from(key)))
    }

    /**
     * The container holding the entry a nested key addresses.
     */
    pub(crate) fn holder(&self, key: &NestedKey) -> Result<TensorDict> {
        let mut current = self.clone();
        let parts = key.parts();
        for part in &parts[..parts.len().saturating_sub(1)] {
            current = match current.get_local_opt(part)? {
                Some(value) => value.into_dict()?,
                None => return Err(self.missing(key)),
            };
        }
        Ok(current)
    }

    /**
     * Sets a value at a key, replacing any existing entry. Intermediate containers of a
     * nested key are created as needed.
     *
     * The value's leading dimensions must match the batch size. Nested tensordicts with a
     * shorter batch size are given the container's batch size on a copy, leaving the one
     * passed in unchanged. Values are moved to the container's device if it has one, and
     * non-tensor data takes the container's batch size.
     *
     * Replacing or adding an entry is a structural change, rejected while locked.
     */
    pub fn set<K: Into<NestedKey>, V: IntoValue>(&self, key: K, value: V) -> Result<()> {
        let key = normalize(key)?;
        self.set_nested(&key, value.into_value()?, SetMode::Replace, false)
    }

    /**
     * Sets a value at a key, writing it into the existing entry if the shapes agree and
     * replacing the entry otherwise. Writing into an existing tensor keeps any other handle
     * to it up to date, and is allowed while locked.
     */
    pub fn set_inplace<K: Into<NestedKey>, V: IntoValue>(&self, key: K, value: V) -> Result<()> {
        let key = normalize(key)?;
        self.set_nested(&key, value.into_value()?, SetMode::Inplace, false)
    }

    /**
     * Writes a value into an existing entry in place. The key must already be present and
     * the value's shape must be compatible with the entry.
     */
    pub fn set_<K: Into<NestedKey>, V: IntoValue>(&self, key: K, value: V) -> Result<()> {
        let key = normalize(key)?;
        if !self.contains(&key) {
            return Err(self.missing(&key));
        }
        self.set_nested(&key, value.into_value()?, SetMode::Strict, false)
    }

    /**
     * Sets a payload as non-tensor data with the container's batch size.
     */
    pub fn set_non_tensor<K: Into<NestedKey>>(&self, key: K, payload: impl Into<Payload>) -> Result<()> {
        let data = NonTensorData::new(payload, self.batch_size()).with_device(self.device());
        self.set(key, data)
    }

    /**
     * Returns the value at a key, first setting it to a default if the key is missing.
     */
    pub fn setdefault<K: Into<NestedKey>, V: IntoValue>(&self, key: K, default: V) -> Result<Value> {
        let key = normalize(key)?;
        if let Some(value) = self.get_nested_opt(&key)? {
            return Ok(value);
        }
        self.set_nested(&key, default.into_value()?, SetMode::Replace, false)?;
        self.get(key)
    }

    /**
     * Creates an empty nested container at a key, with the batch size, device and names of
     * this container, and returns it.
     */
    pub fn create_nested<K: Into<NestedKey>>(&self, key: K) -> Result<TensorDict> {
        let key = normalize(key)?;
        let holder = self.holder_creating(&key)?;
        holder.create_nested_local(key.last())
    }

    fn holder_creating(&self, key: &NestedKey) -> Result<TensorDict> {
        let mut current = self.clone();
        let parts = key.parts();
        for part in &parts[..parts.len().saturating_sub(1)] {
            current = match current.get_local_opt(part)? {
                Some(value) => value.into_dict()?,
                None => current.create_nested_local(part)?,
            };
        }
        Ok(current)
    }

    fn create_nested_local(&self, key: &str) -> Result<TensorDict> {
        let nested = self.empty_like();
        self.set_local(key, Value::Dict(nested), SetMode::Replace, true)?;
        self.get_local(key)?.into_dict()
    }

    pub(crate) fn set_nested(
        &self,
        key: &NestedKey,
        value: Value,
        mode: SetMode,
        validated: bool,
    ) -> Result<()> {
        let holder = match mode {
            SetMode::Strict => self.holder(key)?,
            _ => self.holder_creating(key)?,
        };
        holder.set_local(key.last(), value, mode, validated)
    }

    pub(crate) fn set_local(
        &self,
        key: &str,
        value: Value,
        mode: SetMode,
        validated: bool,
    ) -> Result<()> {
        match self.layout() {
            Layout::Dense => self.set_dense(key, value, mode, validated),
            Layout::Stacked(stacked) => {
                self.check_structural(key, mode)?;
                let value = if validated {
                    value
                } else {
                    self.validate_value(key, value)?
                };
                let pieces = value.unbind(stacked.stack_dim as isize)?;
                // every member must accept its slice before any of them is written
                for (td, piece) in stacked.tensordicts.iter().zip(&pieces) {
                    td.check_write(key, piece, mode)?;
                }
                for (td, piece) in stacked.tensordicts.iter().zip(pieces) {
                    td.set_local(key, piece, mode, false)?;
                }
                self.write().cache.bump();
                Ok(())
            }
            Layout::View(view) => {
                self.check_structural(key, mode)?;
                let value = if validated {
                    value
                } else {
                    self.validate_value(key, value)?
                };
                let mapped = view.inverse.apply_value(&value)?;
                view.source.set_local(key, mapped, mode, false)
            }
        }
    }

    /**
     * Runs every check [`set_local`](TensorDict::set_local) makes for a write without
     * changing anything.
     */
    pub(crate) fn check_write(&self, key: &str, value: &Value, mode: SetMode) -> Result<()> {
        match self.layout() {
            Layout::Dense => self.check_dense_write(key, value, mode),
            Layout::Stacked(stacked) => {
                self.check_structural(key, mode)?;
                let value = self.validate_value(key, value.clone())?;
                let pieces = value.unbind(stacked.stack_dim as isize)?;
                for (td, piece) in stacked.tensordicts.iter().zip(&pieces) {
                    td.check_write(key, piece, mode)?;
                }
                Ok(())
            }
            Layout::View(view) => {
                self.check_structural(key, mode)?;
                let value = self.validate_value(key, value.clone())?;
                let mapped = view.inverse.apply_value(&value)?;
                view.source.check_write(key, &mapped, mode)
            }
        }
    }

    fn check_dense_write(&self, key: &str, value: &Value, mode: SetMode) -> Result<()> {
        let value = self.validate_value(key, value.clone())?;
        let existing = self
            .with_dense(|dense| dense.entries.get(key).cloned())
            .flatten();
        let locked = self.is_locked();
        match (existing, mode) {
            (None, SetMode::Strict) => Err(self.missing(&NestedKey::from(key))),
            (Some(existing), SetMode::Inplace | SetMode::Strict) => {
                if self.can_write_inplace(&existing, &value, mode)? {
                    Ok(())
                } else if mode == SetMode::Strict {
                    Err(TensorDictError::shape(format!(
                        "cannot write a value of shape {:?} into the entry {:?} of shape {:?} \
                         in place",
                        value.shape(),
                        key,
                        existing.shape()
                    )))
                } else if locked {
                    Err(TensorDictError::Locked)
                } else {
                    Ok(())
                }
            }
            (Some(existing), _) if existing.same_identity(&value) => Ok(()),
            _ if locked => Err(TensorDictError::Locked),
            _ => Ok(()),
        }
    }

    // Mirrors write_inplace without writing.
    fn can_write_inplace(&self, existing: &Value, value: &Value, mode: SetMode) -> Result<bool> {
        match (existing, value) {
            (Value::Tensor(dest), Value::Tensor(source)) => Ok(dest.shape() == source.shape()),
            (Value::Dict(dest), Value::Dict(source)) => {
                if !dest.ptr_eq(source) {
                    for (key, nested) in source.items()? {
                        dest.check_write(&key, &nested, mode)?;
                    }
                }
                Ok(true)
            }
            (existing, value) => Ok(existing.kind().is_non_tensor()
                && value.kind().is_non_tensor()
                && existing.shape() == value.shape()),
        }
    }

    // Lazy representations forward writes to the containers they are built from, so the
    // lock of the lazy container itself is checked up front.
    fn check_structural(&self, key: &str, mode: SetMode) -> Result<()> {
        let exists = self.keys().iter().any(|k| k == key);
        match mode {
            SetMode::Strict if !exists => Err(self.missing(&NestedKey::from(key))),
            SetMode::Replace if self.is_locked() => Err(TensorDictError::Locked),
            SetMode::Inplace if self.is_locked() && !exists => Err(TensorDictError::Locked),
            _ => Ok(()),
        }
    }

    fn set_dense(&self, key: &str, value: Value, mode: SetMode, validated: bool) -> Result<()> {
        let value = if validated {
            value
        } else {
            self.validate_value(key, value)?
        };
        let existing = self
            .with_dense(|dense| dense.entries.get(key).cloned())
            .flatten();
        if mode != SetMode::Replace {
            match &existing {
                Some(existing) => {
                    if self.write_inplace(key, existing, &value, mode)? {
                        return Ok(());
                    }
                    if mode == SetMode::Strict {
                        return Err(TensorDictError::shape(format!(
                            "cannot write a value of shape {:?} into the entry {:?} of shape {:?} \
                             in place",
                            value.shape(),
                            key,
                            existing.shape()
                        )));
                    }
                }
                None if mode == SetMode::Strict => {
                    return Err(self.missing(&NestedKey::from(key)));
                }
                None => {}
            }
        }
        if let Some(existing) = &existing {
            if existing.same_identity(&value) {
                return Ok(());
            }
        }
        let mut node = self.write();
        if node.lock.locked {
            return Err(TensorDictError::Locked);
        }
        if let Body::Dense(dense) = &mut node.body {
            dense.entries.insert(key.to_string(), value);
        }
        node.cache.bump();
        trace!(key, "set entry");
        Ok(())
    }

    // Returns true if the value was written into the existing entry, leaving the set of
    // keys and the identity of the entry unchanged.
    fn write_inplace(&self, key: &str, existing: &Value, value: &Value, mode: SetMode) -> Result<bool> {
        match (existing, value) {
            (Value::Tensor(dest), Value::Tensor(source)) if dest.shape() == source.shape() => {
                dest.copy_(source)?;
                Ok(true)
            }
            (Value::Dict(dest), Value::Dict(source)) => {
                if !dest.ptr_eq(source) {
                    match mode {
                        SetMode::Strict => dest.update_(source)?,
                        _ => dest.update_with(
                            source,
                            UpdateOptions {
                                inplace: true,
                                ..UpdateOptions::default()
                            },
                        )?,
                    }
                }
                Ok(true)
            }
            (existing, value)
                if existing.kind().is_non_tensor()
                    && value.kind().is_non_tensor()
                    && existing.shape() == value.shape() =>
            {
                // Payloads have no storage to write into, swapping them keeps the keys.
                self.put_entry(key, value.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /**
     * Checks a value against the batch size of this container, returning the value as it
     * should be stored.
     */
    pub(crate) fn validate_value(&self, key: &str, value: Value) -> Result<Value> {
        let batch_size = self.batch_size();
        let device = self.device();
        let batch_dims = batch_size.len();
        let has_prefix = |shape: &[usize]| shape.len() >= batch_dims && shape[..batch_dims] == batch_size[..];
        let mismatch = |found: Vec<usize>| TensorDictError::BatchSizeMismatch {
            key: key.to_string(),
            expected: batch_size.clone(),
            found,
        };
        Ok(match value {
            Value::Tensor(tensor) => {
                if !has_prefix(tensor.shape()) {
                    return Err(mismatch(tensor.shape().to_vec()));
                }
                match device {
                    Some(device) => Value::Tensor(tensor.to(device)),
                    None => Value::Tensor(tensor),
                }
            }
            Value::Dict(td) => Value::Dict(self.validate_dict(key, td)?),
            Value::NonTensor(data) => {
                let data = if has_prefix(data.batch_size()) {
                    data
                } else {
                    data.with_batch_size(batch_size.clone())
                };
                match device {
                    Some(_) => Value::NonTensor(data.with_device(device)),
                    None => Value::NonTensor(data),
                }
            }
            Value::NonTensorStack(stack) => {
                if !has_prefix(stack.batch_size()) {
                    return Err(mismatch(stack.batch_size().to_vec()));
                }
                match device {
                    Some(_) => Value::NonTensorStack(stack.with_device(device)),
                    None => Value::NonTensorStack(stack),
                }
            }
        })
    }

    fn validate_dict(&self, key: &str, td: TensorDict) -> Result<TensorDict> {
        let batch_size = self.batch_size();
        let batch_dims = batch_size.len();
        let nested_batch = td.batch_size();
        let mut td = td;
        if nested_batch.len() < batch_dims || nested_batch[..batch_dims] != batch_size[..] {
            let copy = td.to_tensordict()?;
            copy.set_batch_size(batch_size.clone()).map_err(|_| {
                TensorDictError::BatchSizeMismatch {
                    key: key.to_string(),
                    expected: batch_size.clone(),
                    found: nested_batch.clone(),
                }
            })?;
            td = copy;
        }
        if let Some(device) = self.device() {
            if td.device() != Some(device) {
                td = td.to(device)?;
            }
        }
        if let Some(names) = self.names() {
            let agrees = td
                .names()
                .map(|nested| nested[..batch_dims] == names[..])
                .unwrap_or(false);
            if !agrees {
                let copy = td.to_tensordict()?;
                let mut nested: Names = copy.names().unwrap_or_else(|| vec![None; copy.batch_dims()]);
                nested[..batch_dims].clone_from_slice(&names);
                copy.rename_(Some(nested))?;
                td = copy;
            }
        }
        Ok(td)
    }

    /**
     * Writes a value into the part of the entry at a key selected by indexing the batch
     * dimensions. The key must be present. Writing into tensors happens in place and is
     * allowed while locked.
     */
    pub fn set_at_<K: Into<NestedKey>, V: IntoValue>(&self, key: K, value: V, index: &[Index]) -> Result<()> {
        let key = normalize(key)?;
        let value = value.into_value()?;
        let indexes = expand_ellipsis(index, self.batch_dims())?;
        let holder = self.holder(&key)?;
        let last = key.last();
        let existing = holder
            .get_local_opt(last)?
            .ok_or_else(|| self.missing(&key))?;
        match (&existing, value) {
            (Value::Tensor(tensor), Value::Tensor(source)) => {
                tensor.index_put(&indexes, &source)?;
                if holder.kind() != ValueKind::TensorDict {
                    // The tensor was assembled on read, so it is written back.
                    holder.set_local(last, existing.clone(), SetMode::Strict, false)?;
                }
                Ok(())
            }
            (Value::Dict(td), Value::Dict(source)) => td.update_at_(&source, &indexes),
            (existing, value) if existing.kind().is_non_tensor() && value.kind().is_non_tensor() => {
                let written = crate::nontensor::write_at(existing, &indexes, &value)?;
                holder.set_local(last, written, SetMode::Strict, false)
            }
            (existing, value) => Err(TensorDictError::type_mismatch(
                existing.kind().to_string(),
                value.kind().to_string(),
            )),
        }
    }

    /**
     * Writes every leaf of another container into the part of the matching entry selected
     * by indexing the batch dimensions. Every key must already be present.
     */
    pub fn update_at_(&self, other: &TensorDict, index: &[Index]) -> Result<()> {
        for (key, value) in other.items_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor))? {
            self.set_at_(&key, value, index)?;
        }
        Ok(())
    }

    /**
     * Sets every entry of another container on this one, replacing existing entries.
     * Nested containers present in both are updated recursively rather than replaced.
     */
    pub fn update(&self, other: &TensorDict) -> Result<()> {
        self.update_with(other, UpdateOptions::default())
    }

    pub fn update_with(&self, other: &TensorDict, options: UpdateOptions) -> Result<()> {
        if self.ptr_eq(other) {
            return Ok(());
        }
        let mode = if options.inplace {
            SetMode::Inplace
        } else {
            SetMode::Replace
        };
        for (key, value) in other.items()? {
            let Some(nested_keys) = sub_keys(&options.keys_to_update, &key) else {
                continue;
            };
            let value = if options.clone {
                value.deep_clone()
            } else {
                value
            };
            match (&value, self.get_local_opt(&key)?) {
                (Value::Dict(source), Some(Value::Dict(dest))) => {
                    dest.update_with(
                        source,
                        UpdateOptions {
                            keys_to_update: nested_keys,
                            ..options.clone()
                        },
                    )?;
                }
                _ => {
                    if nested_keys.is_some_and(|keys| !keys.is_empty()) {
                        // Only part of this entry was asked for, but it is not a container.
                        continue;
                    }
                    self.set_local(&key, value, mode, false)?;
                }
            }
        }
        Ok(())
    }

    /**
     * Writes every leaf of another container into the matching entry of this one in place.
     * Every key must already be present.
     */
    pub fn update_(&self, other: &TensorDict) -> Result<()> {
        if self.ptr_eq(other) {
            return Ok(());
        }
        for (key, value) in other.items_with(KeysOptions::leaves().is_leaf(is_leaf_nontensor))? {
            self.set_(&key, value)?;
        }
        Ok(())
    }

    /**
     * Deletes the entry at a key. This is a structural change, rejected while locked.
     */
    pub fn del_<K: Into<NestedKey>>(&self, key: K) -> Result<()> {
        let key = normalize(key)?;
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        if !self.contains(&key) {
            return Err(self.missing(&key));
        }
        self.holder(&key)?.del_local(key.last())
    }

    pub(crate) fn del_local(&self, key: &str) -> Result<()> {
        match self.layout() {
            Layout::Dense => {
                let mut node = self.write();
                if node.lock.locked {
                    return Err(TensorDictError::Locked);
                }
                let Body::Dense(dense) = &mut node.body else {
                    return Ok(());
                };
                if dense.entries.remove(key).is_none() {
                    return Err(TensorDictError::KeyNotFound {
                        key: NestedKey::from(key).to_string(),
                        available: dense.entries.keys().to_vec(),
                    });
                }
                node.cache.bump();
                Ok(())
            }
            Layout::Stacked(stacked) => {
                if self.is_locked() {
                    return Err(TensorDictError::Locked);
                }
                for td in &stacked.tensordicts {
                    td.del_local(key)?;
                }
                self.write().cache.bump();
                Ok(())
            }
            Layout::View(view) => {
                if self.is_locked() {
                    return Err(TensorDictError::Locked);
                }
                view.source.del_local(key)
            }
        }
    }

    /**
     * Removes and returns the entry at a key.
     */
    pub fn pop<K: Into<NestedKey>>(&self, key: K) -> Result<Value> {
        let key = normalize(key)?;
        let value = self.get(&key)?;
        self.del_(&key)?;
        Ok(value)
    }

    /**
     * Removes and returns the entry at a key, or returns a default if it is missing.
     */
    pub fn pop_or<K: Into<NestedKey>>(&self, key: K, default: Value) -> Result<Value> {
        let key = normalize(key)?;
        match self.get_nested_opt(&key)? {
            Some(value) => {
                self.del_(&key)?;
                Ok(value)
            }
            None => Ok(default),
        }
    }

    /**
     * Removes and returns the most recently inserted top level entry.
     */
    pub fn popitem(&self) -> Result<(String, Value)> {
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        let key = self.keys().pop().ok_or_else(|| TensorDictError::KeyNotFound {
            key: "popitem(): dictionary is empty".to_string(),
            available: Vec::new(),
        })?;
        let value = self.get_local(&key)?;
        self.del_local(&key)?;
        Ok((key, value))
    }

    /**
     * Removes every entry.
     */
    pub fn clear(&self) -> Result<()> {
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        match self.layout() {
            Layout::Dense => {
                let mut node = self.write();
                if let Body::Dense(dense) = &mut node.body {
                    dense.entries.clear();
                }
                node.cache.bump();
                Ok(())
            }
            Layout::Stacked(stacked) => stacked.tensordicts.iter().try_for_each(TensorDict::clear),
            Layout::View(view) => view.source.clear(),
        }
    }

    /**
     * Moves the entry at one key to another. With `safe`, an existing entry at the new key
     * is an error rather than being overwritten.
     */
    pub fn rename_key_<K: Into<NestedKey>, N: Into<NestedKey>>(&self, old: K, new: N, safe: bool) -> Result<()> {
        let old = normalize(old)?;
        let new = normalize(new)?;
        if old == new {
            return Ok(());
        }
        if self.is_locked() {
            return Err(TensorDictError::Locked);
        }
        if safe && self.contains(&new) {
            return Err(TensorDictError::KeyOverride(new.to_string()));
        }
        let value = self.get(&old)?;
        self.set_nested(&new, value, SetMode::Replace, false)?;
        self.del_(&old)
    }

    /**
     * Changes the batch size. Every entry must have the new batch size as its leading
     * dimensions. Nested containers whose batch size no longer fits are given the new batch
     * size, and non-tensor data follows it.
     *
     * Lazy stacks and views derive their batch size from the containers they are built on,
     * so changing it is not supported.
     */
    pub fn set_batch_size(&self, batch_size: impl Into<Vec<usize>>) -> Result<()> {
        let batch_size = batch_size.into();
        if !matches!(self.layout(), Layout::Dense) {
            return Err(TensorDictError::Unsupported(
                "Modifying the batch size of a lazy representation of a tensordict is not \
                 permitted. Consider instantiating the tensordict first by calling \
                 `td = td.to_tensordict()` before resetting the batch size."
                    .to_string(),
            ));
        }
        self.check_batch_size(&batch_size)?;
        self.apply_batch_size(batch_size);
        Ok(())
    }

    fn check_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        let batch_dims = batch_size.len();
        let has_prefix = |shape: &[usize]| shape.len() >= batch_dims && shape[..batch_dims] == batch_size[..];
        for (key, value) in self.items()? {
            let mismatch = || TensorDictError::BatchSizeMismatch {
                key: key.clone(),
                expected: batch_size.to_vec(),
                found: value.shape(),
            };
            match &value {
                Value::Tensor(tensor) if !has_prefix(tensor.shape()) => return Err(mismatch()),
                Value::NonTensorStack(stack) if !has_prefix(stack.batch_size()) => {
                    return Err(mismatch());
                }
                Value::Dict(td) if !has_prefix(&td.batch_size()) => {
                    if td.batch_dims() > batch_dims || td.kind() != ValueKind::TensorDict {
                        return Err(mismatch());
                    }
                    td.check_batch_size(batch_size)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply_batch_size(&self, batch_size: Vec<usize>) {
        let batch_dims = batch_size.len();
        let entries = self
            .with_dense(|dense| dense.entries.clone())
            .unwrap_or_default();
        for (key, value) in entries.iter() {
            match value {
                Value::Dict(td) => {
                    let nested = td.batch_size();
                    if nested.len() < batch_dims || nested[..batch_dims] != batch_size[..] {
                        td.apply_batch_size(batch_size.clone());
                    }
                }
                Value::NonTensor(data) => {
                    let nested = data.batch_size();
                    if nested.len() < batch_dims || nested[..batch_dims] != batch_size[..] {
                        self.put_entry(key, Value::NonTensor(data.with_batch_size(batch_size.clone())));
                    }
                }
                _ => {}
            }
        }
        self.with_dense_mut(|dense| {
            if dense.names.as_ref().is_some_and(|names| names.len() != batch_dims) {
                dense.names = None;
            }
            dense.batch_size = batch_size;
        });
    }

    /**
     * Moves every entry to a device, returning a new container. Entries already on the
     * device are shared with this container.
     */
    pub fn to(&self, device: Device) -> Result<TensorDict> {
        let options = crate::tensordict::ApplyOptions::new().device(Some(device));
        self.apply_values(&[], options, |value, _| match value {
            Value::Tensor(tensor) => Ok(Some(Value::Tensor(tensor.to(device)))),
            other => Ok(Some(other.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    #[test]
    fn nested_set_creates_intermediate_containers() {
        let td = TensorDict::new([3]);
        td.set(("a", "b", "c"), Tensor::zeros([3, 2])).unwrap();
        let a = td.get_dict("a").unwrap();
        assert_eq!(a.batch_size(), vec![3]);
        assert_eq!(td.get_item_shape(("a", "b", "c")).unwrap(), vec![3, 2]);
        assert!(td.contains(("a", "b")));
        assert!(!td.contains(("a", "x")));
        assert!(!td.contains(""));
    }

    #[test]
    fn values_must_match_the_batch_size() {
        let td = TensorDict::new([3, 4]);
        let error = td.set("x", Tensor::zeros([4, 3])).unwrap_err();
        assert!(matches!(error, TensorDictError::BatchSizeMismatch { .. }));
        assert!(td.is_empty());
        let nested = TensorDict::new([3]);
        nested.set("y", Tensor::zeros([3, 4])).unwrap();
        td.set("nested", nested.clone()).unwrap();
        assert_eq!(td.get_dict("nested").unwrap().batch_size(), vec![3, 4]);
        assert_eq!(nested.batch_size(), vec![3]);
    }

    #[test]
    fn inplace_writes_keep_the_storage() {
        let td = TensorDict::new([2]);
        let tensor = Tensor::zeros([2]);
        td.set("x", tensor.clone()).unwrap();
        td.set_inplace("x", Tensor::ones([2])).unwrap();
        assert_eq!(tensor.to_vec(), vec![1.0, 1.0]);
        td.set_("x", Tensor::full([2], 2.0, crate::tensors::DType::Float32))
            .unwrap();
        assert_eq!(tensor.to_vec(), vec![2.0, 2.0]);
        assert!(td.set_("x", Tensor::zeros([2, 3])).is_err());
        assert!(td.set_("missing", Tensor::zeros([2])).is_err());
        td.set("x", Tensor::zeros([2])).unwrap();
        assert_eq!(tensor.to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn partial_writes_go_through_indexes() {
        let td = TensorDict::new([4]);
        td.set("x", Tensor::zeros([4, 2])).unwrap();
        td.set_at_("x", Tensor::ones([2]), &[Index::At(1)]).unwrap();
        assert_eq!(
            td.get_tensor("x").unwrap().to_vec(),
            vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]
        );
        let update = TensorDict::new([]);
        update.set("x", Tensor::full([2], 5.0, crate::tensors::DType::Float32)).unwrap();
        td.update_at_(&update, &[Index::At(-1)]).unwrap();
        assert_eq!(td.get_at("x", &[Index::At(3)]).unwrap().as_tensor().unwrap().to_vec(), vec![5.0, 5.0]);
    }

    #[test]
    fn deleting_and_renaming() {
        let td = TensorDict::from_entries([("a", 1.0), ("b", 2.0)], []).unwrap();
        td.rename_key_("a", "c", true).unwrap();
        assert_eq!(td.keys(), vec!["b", "c"]);
        assert!(matches!(
            td.rename_key_("b", "c", true),
            Err(TensorDictError::KeyOverride(_))
        ));
        assert_eq!(td.pop("b").unwrap(), Value::from(2.0));
        assert_eq!(td.pop_or("b", Value::from(0.0)).unwrap(), Value::from(0.0));
        assert!(matches!(td.del_("b"), Err(TensorDictError::KeyNotFound { .. })));
        assert_eq!(td.popitem().unwrap().0, "c");
        assert!(td.popitem().is_err());
    }

    #[test]
    fn updates_merge_nested_containers() {
        let td = TensorDict::new([]);
        td.set(("n", "a"), 1.0).unwrap();
        td.set(("n", "b"), 2.0).unwrap();
        let other = TensorDict::new([]);
        other.set(("n", "a"), 3.0).unwrap();
        other.set(("n", "b"), 4.0).unwrap();
        td.update_with(
            &other,
            UpdateOptions {
                keys_to_update: Some(vec![NestedKey::from(("n", "a"))]),
                ..UpdateOptions::default()
            },
        )
        .unwrap();
        assert_eq!(td.get(("n", "a")).unwrap(), Value::from(3.0));
        assert_eq!(td.get(("n", "b")).unwrap(), Value::from(2.0));
        td.update(&other).unwrap();
        assert_eq!(td.get(("n", "b")).unwrap(), Value::from(4.0));
    }

    #[test]
    fn batch_size_changes_are_checked() {
        let td = TensorDict::new([3, 4]);
        td.set("x", Tensor::zeros([3, 4, 5])).unwrap();
        td.set_non_tensor("text", "hi").unwrap();
        td.set_batch_size([3]).unwrap();
        assert_eq!(td.get("text").unwrap().shape(), vec![3, 4]);
        assert!(td.set_batch_size([4]).is_err());
        assert_eq!(td.batch_size(), vec![3]);
        td.set_batch_size([3, 4, 5]).unwrap();
        assert_eq!(td.get("text").unwrap().shape(), vec![3, 4, 5]);
        assert_eq!(td.get_non_tensor("text").unwrap(), Payload::from("hi"));
    }
}
