/*!
 * The tensordict container.
 *
 * A [`TensorDict`] is a string keyed mapping of tensors, nested tensordicts and non-tensor
 * data that all share a common set of leading dimensions, the batch size. Operations on the
 * batch dimensions, such as indexing, reshaping or stacking, are applied to every entry at
 * once, and entries can be addressed through nested containers with a
 * [`NestedKey`](crate::keys::NestedKey).
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let td = TensorDict::new([3, 4]);
 * td.set("a", Tensor::zeros([3, 4, 5])).unwrap();
 * td.set(("b", "c"), Tensor::ones([3, 4])).unwrap();
 * assert_eq!(td.get(("b", "c")).unwrap().shape(), vec![3, 4]);
 * let row = td.index(&[1.into()]).unwrap();
 * assert_eq!(row.batch_size(), vec![4]);
 * assert_eq!(row.get("a").unwrap().shape(), vec![4, 5]);
 * ```
 *
 * # Handles
 *
 * A TensorDict is a handle to a node. Cloning it clones the handle, so the clone sees every
 * entry that is set or deleted through the original, much like cloning a
 * [`Tensor`](crate::tensors::Tensor) aliases its storage. Storing a tensordict inside another
 * stores the handle, which is how nested containers are shared between their parents.
 * [`clone_structure`](TensorDict::clone_structure) duplicates the containers while still
 * sharing the tensors, and [`deep_clone`](TensorDict::deep_clone) duplicates both.
 *
 * # Representations
 *
 * Besides the plain dense representation, a TensorDict can be a lazy stack of other
 * tensordicts, which keeps its members and assembles entries on read, or a lazy view of
 * another tensordict through a shape operation, which maps reads forward and writes back.
 * All three answer to the same methods, see [`stack`](TensorDict::stack) and
 * [`shaped`](TensorDict::shaped).
 *
 * # Locking
 *
 * A locked TensorDict rejects structural changes: adding, deleting or renaming keys, or
 * replacing an entry with a value that is not written in place. Writing into existing
 * tensors stays allowed. Locks propagate to every nested container, see
 * [`lock_`](TensorDict::lock_).
 */

use crate::errors::{Result, TensorDictError};
use crate::keys::{NestedKey, ValueKind};
use crate::tensors::{Device, elements};
use crate::value::{IntoValue, Value};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use std::path::PathBuf;
use std::sync::{Arc, Weak};

mod apply;
mod arithmetic;
mod display;
mod entries;
mod items;
mod lock;
mod shape;
mod stack;
mod state_dict;
mod store;

pub use apply::ApplyOptions;
pub use arithmetic::Operand;
pub use items::KeysOptions;
pub use lock::LockGuard;
pub use shape::{ShapeMode, ShapeOp, Shaper};
pub use state_dict::{BATCH_SIZE_KEY, DEVICE_KEY, StateDict, StateValue};
pub use store::UpdateOptions;

pub(crate) use entries::Entries;
pub(crate) use store::SetMode;

/**
 * Optional names for each batch dimension.
 */
pub type Names = Vec<Option<String>>;

pub(crate) type NodeRef = Arc<RwLock<Node>>;

/**
 * A nested, batched, key addressed container of tensors.
 *
 * See the [module level documentation](crate::tensordict) for an overview.
 */
#[derive(Clone)]
pub struct TensorDict {
    node: NodeRef,
}

pub(crate) struct Node {
    pub(crate) body: Body,
    pub(crate) lock: LockState,
    pub(crate) cache: Cache,
}

pub(crate) enum Body {
    Dense(Dense),
    Stacked(Stacked),
    View(View),
}

#[derive(Clone)]
pub(crate) struct Dense {
    pub(crate) entries: Entries,
    pub(crate) batch_size: Vec<usize>,
    pub(crate) device: Option<Device>,
    pub(crate) names: Option<Names>,
}

#[derive(Clone)]
pub(crate) struct Stacked {
    pub(crate) tensordicts: Vec<TensorDict>,
    pub(crate) stack_dim: usize,
}

#[derive(Clone)]
pub(crate) struct View {
    pub(crate) source: TensorDict,
    pub(crate) op: ShapeOp,
    pub(crate) inverse: ShapeOp,
    pub(crate) batch_size: Vec<usize>,
}

#[derive(Default)]
pub(crate) struct LockState {
    pub(crate) locked: bool,
    // Containers whose lock this one inherited. Held weakly so a child never keeps its
    // parents alive.
    pub(crate) parents: Vec<Weak<RwLock<Node>>>,
    pub(crate) shared: bool,
    pub(crate) memmap: bool,
    pub(crate) saved_path: Option<PathBuf>,
}

/**
 * Results derived from the structure of a node, valid while the structural version they
 * were computed at is current. Only filled in while the node is locked.
 */
#[derive(Default)]
pub(crate) struct Cache {
    pub(crate) version: u64,
    pub(crate) sorted_keys: Option<(u64, Vec<String>)>,
    pub(crate) depth: Option<(u64, usize)>,
}

impl Cache {
    pub(crate) fn bump(&mut self) {
        self.version += 1;
        self.sorted_keys = None;
        self.depth = None;
    }
}

/**
 * An owned copy of how a node is represented, taken so that no guard on the node is held
 * while other nodes are visited.
 */
pub(crate) enum Layout {
    Dense,
    Stacked(Stacked),
    View(View),
}

impl TensorDict {
    pub(crate) fn from_body(body: Body) -> TensorDict {
        TensorDict {
            node: Arc::new(RwLock::new(Node {
                body,
                lock: LockState::default(),
                cache: Cache::default(),
            })),
        }
    }

    pub(crate) fn from_dense(
        batch_size: Vec<usize>,
        device: Option<Device>,
        names: Option<Names>,
    ) -> TensorDict {
        TensorDict::from_body(Body::Dense(Dense {
            entries: Entries::default(),
            batch_size,
            device,
            names,
        }))
    }

    /**
     * Creates an empty TensorDict with a batch size and no device.
     */
    pub fn new(batch_size: impl Into<Vec<usize>>) -> TensorDict {
        TensorDict::from_dense(batch_size.into(), None, None)
    }

    /**
     * Creates an empty TensorDict with a batch size whose entries are all moved to a device
     * when they are set.
     */
    pub fn with_device(batch_size: impl Into<Vec<usize>>, device: Option<Device>) -> TensorDict {
        TensorDict::from_dense(batch_size.into(), device, None)
    }

    /**
     * Creates a TensorDict from key value pairs, validating each value against the batch
     * size as if it was [`set`](TensorDict::set) in order.
     *
     * ```
     * use easy_tensordict::TensorDict;
     * use easy_tensordict::tensors::Tensor;
     * let td = TensorDict::from_entries(
     *     [("obs", Tensor::zeros([4, 3])), ("reward", Tensor::zeros([4]))],
     *     [4],
     * ).unwrap();
     * assert_eq!(td.keys(), vec!["obs", "reward"]);
     * assert!(TensorDict::from_entries([("obs", Tensor::zeros([3]))], [4]).is_err());
     * ```
     */
    pub fn from_entries<K, V, I>(entries: I, batch_size: impl Into<Vec<usize>>) -> Result<TensorDict>
    where
        K: Into<NestedKey>,
        V: IntoValue,
        I: IntoIterator<Item = (K, V)>,
    {
        let td = TensorDict::new(batch_size);
        for (key, value) in entries {
            td.set(key, value)?;
        }
        Ok(td)
    }

    /**
     * Creates an empty dense TensorDict with the same batch size, device and names.
     */
    pub fn empty_like(&self) -> TensorDict {
        TensorDict::from_dense(self.batch_size(), self.device(), self.names())
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Node> {
        self.node.write()
    }

    pub(crate) fn downgrade(&self) -> Weak<RwLock<Node>> {
        Arc::downgrade(&self.node)
    }

    pub(crate) fn from_node(node: NodeRef) -> TensorDict {
        TensorDict { node }
    }

    pub(crate) fn layout(&self) -> Layout {
        match &self.read().body {
            Body::Dense(_) => Layout::Dense,
            Body::Stacked(stacked) => Layout::Stacked(stacked.clone()),
            Body::View(view) => Layout::View(view.clone()),
        }
    }

    pub(crate) fn with_dense<R>(&self, f: impl FnOnce(&Dense) -> R) -> Option<R> {
        match &self.read().body {
            Body::Dense(dense) => Some(f(dense)),
            _ => None,
        }
    }

    pub(crate) fn with_dense_mut<R>(&self, f: impl FnOnce(&mut Dense) -> R) -> Option<R> {
        match &mut self.write().body {
            Body::Dense(dense) => Some(f(dense)),
            _ => None,
        }
    }

    /**
     * True if both handles refer to the same container.
     */
    pub fn ptr_eq(&self, other: &TensorDict) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn kind(&self) -> ValueKind {
        match &self.read().body {
            Body::Dense(_) => ValueKind::TensorDict,
            Body::Stacked(_) => ValueKind::LazyStack,
            Body::View(_) => ValueKind::View,
        }
    }

    pub fn is_lazy_stack(&self) -> bool {
        self.kind() == ValueKind::LazyStack
    }

    pub fn is_view(&self) -> bool {
        self.kind() == ValueKind::View
    }

    /**
     * The leading dimensions shared by every entry.
     */
    pub fn batch_size(&self) -> Vec<usize> {
        match self.layout() {
            Layout::Dense => self
                .with_dense(|dense| dense.batch_size.clone())
                .unwrap_or_default(),
            Layout::Stacked(stacked) => {
                let mut batch_size = stacked
                    .tensordicts
                    .first()
                    .map(TensorDict::batch_size)
                    .unwrap_or_default();
                let dim = stacked.stack_dim.min(batch_size.len());
                batch_size.insert(dim, stacked.tensordicts.len());
                batch_size
            }
            Layout::View(view) => view.batch_size,
        }
    }

    pub fn batch_dims(&self) -> usize {
        self.batch_size().len()
    }

    /**
     * The number of batch dimensions, the same as [`batch_dims`](TensorDict::batch_dims).
     */
    pub fn ndim(&self) -> usize {
        self.batch_dims()
    }

    /**
     * The number of elements in the batch.
     */
    pub fn numel(&self) -> usize {
        elements(&self.batch_size())
    }

    /**
     * The device every entry lives on, if the container has one. A lazy stack has a device
     * only if all of its members agree on it.
     */
    pub fn device(&self) -> Option<Device> {
        match self.layout() {
            Layout::Dense => self.with_dense(|dense| dense.device).flatten(),
            Layout::Stacked(stacked) => {
                let devices: Vec<Option<Device>> =
                    stacked.tensordicts.iter().map(TensorDict::device).collect();
                let first = devices.first().copied().flatten();
                devices.iter().all(|d| *d == first).then_some(first).flatten()
            }
            Layout::View(view) => view.source.device(),
        }
    }

    /**
     * The names of the batch dimensions, if any have been given.
     */
    pub fn names(&self) -> Option<Names> {
        match self.layout() {
            Layout::Dense => self.with_dense(|dense| dense.names.clone()).flatten(),
            Layout::Stacked(stacked) => {
                let mut names = stacked.tensordicts.first()?.names()?;
                let dim = stacked.stack_dim.min(names.len());
                names.insert(dim, None);
                Some(names)
            }
            Layout::View(view) => view.op.apply_names(view.source.names().as_ref()),
        }
    }

    /**
     * Names the batch dimensions, or clears the names with None. The leading dimensions of
     * nested containers are renamed to match.
     */
    pub fn rename_(&self, names: Option<Names>) -> Result<()> {
        let batch_dims = self.batch_dims();
        if let Some(names) = &names {
            if names.len() != batch_dims {
                return Err(TensorDictError::shape(format!(
                    "{} names given for {} batch dimensions",
                    names.len(),
                    batch_dims
                )));
            }
            let given: Vec<&String> = names.iter().flatten().collect();
            if crate::tensors::has_duplicates(&given) {
                return Err(TensorDictError::shape(format!(
                    "names must be unique, got {:?}",
                    names
                )));
            }
        }
        let updated = self.with_dense_mut(|dense| dense.names = names.clone());
        if updated.is_none() {
            return Err(TensorDictError::Unsupported(
                "renaming the dimensions of a lazy tensordict, call to_tensordict() first"
                    .to_string(),
            ));
        }
        for (_, value) in self.items()? {
            if let Value::Dict(td) = value {
                if td.kind() != ValueKind::TensorDict {
                    continue;
                }
                let nested = match &names {
                    Some(names) => {
                        let mut nested = td.names().unwrap_or_else(|| vec![None; td.batch_dims()]);
                        nested[..batch_dims].clone_from_slice(names);
                        Some(nested)
                    }
                    None => None,
                };
                td.rename_(nested)?;
            }
        }
        Ok(())
    }

    /**
     * Returns a copy of this container with renamed batch dimensions, see
     * [`rename_`](TensorDict::rename_).
     */
    pub fn rename(&self, names: Option<Names>) -> Result<TensorDict> {
        let copy = self.to_tensordict()?;
        copy.rename_(names)?;
        Ok(copy)
    }

    /**
     * Fills in the names of unnamed batch dimensions. A dimension that already has a name
     * must be given the same name or None.
     */
    pub fn refine_names(&self, names: Names) -> Result<()> {
        let mut current = self.names().unwrap_or_else(|| vec![None; self.batch_dims()]);
        if names.len() != current.len() {
            return Err(TensorDictError::shape(format!(
                "{} names given for {} batch dimensions",
                names.len(),
                current.len()
            )));
        }
        for (dim, given) in names.into_iter().enumerate() {
            let Some(given) = given else {
                continue;
            };
            if let Some(existing) = &current[dim] {
                if *existing != given {
                    return Err(TensorDictError::shape(format!(
                        "cannot refine the name {:?} of dimension {} to {:?}",
                        existing, dim, given
                    )));
                }
                continue;
            }
            current[dim] = Some(given);
        }
        self.rename_(Some(current))
    }

    /**
     * The batch dimension with a name, if any.
     */
    pub fn dim_of(&self, name: &str) -> Option<usize> {
        self.names()?
            .iter()
            .position(|n| n.as_deref() == Some(name))
    }

    /**
     * Sets the batch size to the longest leading shape shared by every entry, after doing
     * the same for every nested container. Non-tensor data does not constrain the result.
     */
    pub fn auto_batch_size_(&self) -> Result<()> {
        let mut common: Option<Vec<usize>> = None;
        for (_, value) in self.items()? {
            let shape = match &value {
                Value::Tensor(tensor) => tensor.shape().to_vec(),
                Value::Dict(td) => {
                    if td.kind() == ValueKind::TensorDict {
                        td.auto_batch_size_()?;
                    }
                    td.batch_size()
                }
                _ => continue,
            };
            common = Some(match common {
                None => shape,
                Some(common) => common
                    .iter()
                    .zip(shape.iter())
                    .take_while(|(a, b)| a == b)
                    .map(|(a, _)| *a)
                    .collect(),
            });
        }
        match common {
            Some(batch_size) => self.set_batch_size(batch_size),
            None => Ok(()),
        }
    }

    /**
     * The number of keys at the top level of this container.
     */
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /**
     * True if there are no leaves anywhere in this container, counting non-tensor data as
     * leaves. A container holding only empty nested containers is empty.
     */
    pub fn is_empty(&self) -> bool {
        self.keys_with(KeysOptions::leaves().is_leaf(crate::keys::is_leaf_nontensor))
            .map(|keys| keys.is_empty())
            .unwrap_or(false)
    }

    /**
     * The members of a lazy stack, or None for any other representation.
     */
    pub fn tensordicts(&self) -> Option<Vec<TensorDict>> {
        match self.layout() {
            Layout::Stacked(stacked) => Some(stacked.tensordicts),
            _ => None,
        }
    }

    /**
     * The dimension a lazy stack stacks its members along.
     */
    pub fn stack_dim(&self) -> Option<usize> {
        match self.layout() {
            Layout::Stacked(stacked) => Some(stacked.stack_dim),
            _ => None,
        }
    }

    /**
     * Returns a dense TensorDict with the same entries. Lazy stacks are stacked densely and
     * views are applied to their source, so the result no longer writes through to the
     * containers it was built from. A dense TensorDict returns new containers that share
     * the same tensors.
     */
    pub fn to_tensordict(&self) -> Result<TensorDict> {
        match self.layout() {
            Layout::Dense => Ok(self.clone_structure()),
            Layout::Stacked(stacked) => {
                let members = stacked
                    .tensordicts
                    .iter()
                    .map(TensorDict::to_tensordict)
                    .collect::<Result<Vec<_>>>()?;
                stack::dense_stack(&members, stacked.stack_dim, false)?.ok_or_else(|| {
                    TensorDictError::shape(
                        "cannot densely stack tensordicts whose entries have differing shapes, \
                         use tensordicts() to access the members",
                    )
                })
            }
            Layout::View(view) => view.source.apply_shape_op(&view.op),
        }
    }

    /**
     * Duplicates every container while sharing the tensors they hold. Setting or deleting
     * keys on the copy leaves this container unchanged, but writing into a tensor in place
     * is seen by both.
     */
    pub fn clone_structure(&self) -> TensorDict {
        match self.layout() {
            Layout::Dense => {
                let (entries, batch_size, device, names) = self
                    .with_dense(|dense| {
                        (
                            dense.entries.clone(),
                            dense.batch_size.clone(),
                            dense.device,
                            dense.names.clone(),
                        )
                    })
                    .unwrap_or_default();
                let copy = TensorDict::from_dense(batch_size, device, names);
                for (key, value) in entries.iter() {
                    let value = match value {
                        Value::Dict(td) => Value::Dict(td.clone_structure()),
                        other => other.clone(),
                    };
                    copy.put_entry(key, value);
                }
                copy
            }
            Layout::Stacked(stacked) => TensorDict::from_body(Body::Stacked(Stacked {
                tensordicts: stacked
                    .tensordicts
                    .iter()
                    .map(TensorDict::clone_structure)
                    .collect(),
                stack_dim: stacked.stack_dim,
            })),
            Layout::View(view) => TensorDict::from_body(Body::View(View {
                source: view.source.clone_structure(),
                ..view
            })),
        }
    }

    /**
     * Duplicates every container and copies every tensor into new storage.
     */
    pub fn deep_clone(&self) -> TensorDict {
        match self.layout() {
            Layout::Dense => {
                let (entries, batch_size, device, names) = self
                    .with_dense(|dense| {
                        (
                            dense.entries.clone(),
                            dense.batch_size.clone(),
                            dense.device,
                            dense.names.clone(),
                        )
                    })
                    .unwrap_or_default();
                let copy = TensorDict::from_dense(batch_size, device, names);
                for (key, value) in entries.iter() {
                    copy.put_entry(key, value.deep_clone());
                }
                copy
            }
            Layout::Stacked(stacked) => TensorDict::from_body(Body::Stacked(Stacked {
                tensordicts: stacked.tensordicts.iter().map(TensorDict::deep_clone).collect(),
                stack_dim: stacked.stack_dim,
            })),
            Layout::View(view) => TensorDict::from_body(Body::View(View {
                source: view.source.deep_clone(),
                ..view
            })),
        }
    }

    /**
     * Removes the device of this container and every nested container, so that values of
     * any device can be set.
     */
    pub fn clear_device_(&self) -> Result<()> {
        match self.layout() {
            Layout::Dense => {
                self.with_dense_mut(|dense| dense.device = None);
                for (_, value) in self.items()? {
                    if let Value::Dict(td) = value {
                        td.clear_device_()?;
                    }
                }
                Ok(())
            }
            Layout::Stacked(stacked) => stacked
                .tensordicts
                .iter()
                .try_for_each(TensorDict::clear_device_),
            Layout::View(view) => view.source.clear_device_(),
        }
    }

    /**
     * Inserts a value without validating it or checking the lock. Only for containers
     * built by this crate and not yet handed out, or for replacing an entry without
     * changing the set of keys.
     */
    pub(crate) fn put_entry(&self, key: &str, value: Value) {
        let mut node = self.write();
        let added = match &mut node.body {
            Body::Dense(dense) => dense.entries.insert(key.to_string(), value).is_none(),
            _ => false,
        };
        if added {
            node.cache.bump();
        }
    }

    /**
     * A short description for error messages.
     */
    pub(crate) fn describe(&self) -> String {
        format!(
            "{}(batch_size={:?}, keys={:?})",
            self.kind(),
            self.batch_size(),
            self.keys()
        )
    }
}

/**
 * Two tensordicts are equal if they have the same batch size, the same keys and equal
 * entries, regardless of representation or key order.
 */
impl PartialEq for TensorDict {
    fn eq(&self, other: &TensorDict) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.batch_size() != other.batch_size() {
            return false;
        }
        let mut keys = self.keys();
        let mut other_keys = other.keys();
        keys.sort();
        other_keys.sort();
        if keys != other_keys {
            return false;
        }
        keys.iter().all(|key| {
            match (self.get_local_opt(key), other.get_local_opt(key)) {
                (Ok(Some(a)), Ok(Some(b))) => a == b,
                _ => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    #[test]
    fn clones_share_the_container() {
        let td = TensorDict::new([2]);
        let alias = td.clone();
        td.set("a", Tensor::zeros([2])).unwrap();
        assert!(alias.contains("a"));
        assert!(alias.ptr_eq(&td));
        let copy = td.clone_structure();
        copy.set("b", Tensor::zeros([2])).unwrap();
        assert!(!td.contains("b"));
        copy.get_tensor("a").unwrap().fill_(1.0);
        assert_eq!(td.get_tensor("a").unwrap().to_vec(), vec![1.0, 1.0]);
        let deep = td.deep_clone();
        deep.get_tensor("a").unwrap().fill_(2.0);
        assert_eq!(td.get_tensor("a").unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn names_follow_the_batch_dimensions() {
        let td = TensorDict::new([2, 3]);
        td.set("nested", TensorDict::new([2, 3, 4])).unwrap();
        td.rename_(Some(vec![Some("env".to_string()), None])).unwrap();
        assert_eq!(
            td.get_dict("nested").unwrap().names(),
            Some(vec![Some("env".to_string()), None, None])
        );
        assert!(td.rename_(Some(vec![None])).is_err());
        assert!(
            td.rename_(Some(vec![Some("x".to_string()), Some("x".to_string())]))
                .is_err()
        );
        td.refine_names(vec![None, Some("time".to_string())]).unwrap();
        assert_eq!(td.dim_of("time"), Some(1));
        assert!(td.refine_names(vec![Some("other".to_string()), None]).is_err());
    }

    #[test]
    fn batch_size_is_inferred_from_the_leaves() {
        let td = TensorDict::new([]);
        td.set("a", Tensor::zeros([3, 4, 5])).unwrap();
        td.set("b", Tensor::zeros([3, 4])).unwrap();
        td.set(("c", "d"), Tensor::zeros([3, 2])).unwrap();
        td.auto_batch_size_().unwrap();
        assert_eq!(td.batch_size(), vec![3]);
        assert_eq!(td.get_dict("c").unwrap().batch_size(), vec![3, 2]);
    }

    #[test]
    fn empty_counts_leaves() {
        let td = TensorDict::new([]);
        assert!(td.is_empty());
        td.set("nested", TensorDict::new([])).unwrap();
        assert!(td.is_empty());
        assert_eq!(td.len(), 1);
        td.set(("nested", "text"), "hello").unwrap();
        assert!(!td.is_empty());
    }
}
