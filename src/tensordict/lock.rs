/*!
 * Locking containers against structural changes.
 *
 * Locking a container locks every container nested inside it, and each nested container
 * remembers, through a weak reference, which containers it inherited the lock from. A
 * container can only be unlocked once none of those parents outside of what is being
 * unlocked are still locked, so a nested container can not be unlocked out from under a
 * locked root.
 *
 * Containers added to an unlocked tree after it was locked and unlocked again are not
 * locked until the tree is locked again, since locking only visits what is present.
 */

use crate::errors::{Result, TensorDictError};
use crate::tensordict::{Layout, NodeRef, TensorDict};
use crate::value::Value;

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

impl TensorDict {
    pub fn is_locked(&self) -> bool {
        self.read().lock.locked
    }

    /**
     * True if this container was marked as placed in shared memory.
     */
    pub fn is_shared(&self) -> bool {
        self.read().lock.shared
    }

    /**
     * True if this container was written to disk in place, see
     * [`memmap_`](TensorDict::memmap_).
     */
    pub fn is_memmap(&self) -> bool {
        self.read().lock.memmap
    }

    /**
     * Locks this container and every container nested inside it. Returns self for chaining.
     */
    pub fn lock_(&self) -> &TensorDict {
        self.lock_from(None);
        debug!(batch_size = ?self.batch_size(), "locked tensordict");
        self
    }

    fn lock_from(&self, parent: Option<Weak<parking_lot::RwLock<crate::tensordict::Node>>>) {
        {
            let mut node = self.write();
            node.lock.parents.retain(|p| p.strong_count() > 0);
            let known_parent = match &parent {
                Some(parent) => node.lock.parents.iter().any(|p| p.ptr_eq(parent)),
                None => false,
            };
            if node.lock.locked && (parent.is_none() || known_parent) {
                // Everything below was locked along with this container already.
                return;
            }
            if let Some(parent) = parent {
                if !known_parent {
                    node.lock.parents.push(parent);
                }
            }
            node.lock.locked = true;
        }
        let weak = self.downgrade();
        for child in self.children() {
            child.lock_from(Some(weak.clone()));
        }
    }

    /**
     * Unlocks this container and every container nested inside it.
     *
     * If any container in that tree inherited its lock from a container outside of it that
     * is still locked, nothing is unlocked and
     * [`LockedGraph`](TensorDictError::LockedGraph) is returned. Unlocking also clears the
     * shared and memory mapped flags.
     */
    pub fn unlock_(&self) -> Result<&TensorDict> {
        let subtree = self.subtree();
        let members: HashSet<*const parking_lot::RwLock<crate::tensordict::Node>> =
            subtree.iter().map(|td| Arc::as_ptr(&td.node)).collect();
        for td in &subtree {
            let parents: Vec<NodeRef> = td
                .read()
                .lock
                .parents
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for parent in parents {
                if members.contains(&Arc::as_ptr(&parent)) {
                    continue;
                }
                let parent = TensorDict::from_node(parent);
                if parent.is_locked() {
                    return Err(TensorDictError::LockedGraph(parent.describe()));
                }
            }
        }
        for td in &subtree {
            let mut node = td.write();
            node.lock.locked = false;
            node.lock.shared = false;
            node.lock.memmap = false;
            node.lock.parents.clear();
            node.cache.bump();
        }
        debug!(containers = subtree.len(), "unlocked tensordict");
        Ok(self)
    }

    /**
     * Marks this container as placed in shared memory and locks it, since its structure
     * can no longer change once other processes hold it.
     */
    pub fn share_memory_(&self) -> &TensorDict {
        for td in self.subtree() {
            td.write().lock.shared = true;
        }
        self.lock_()
    }

    /**
     * Locks this container until the returned guard is dropped. If the container was
     * already locked it stays locked after the guard is dropped, so guards nest.
     *
     * ```
     * use easy_tensordict::TensorDict;
     * use easy_tensordict::tensors::Tensor;
     * let td = TensorDict::new([2]);
     * {
     *     let locked = td.lock_guard();
     *     assert!(locked.set("x", Tensor::zeros([2])).is_err());
     * }
     * assert!(td.set("x", Tensor::zeros([2])).is_ok());
     * ```
     */
    pub fn lock_guard(&self) -> LockGuard<'_> {
        let was_locked = self.is_locked();
        self.lock_();
        LockGuard {
            td: self,
            was_locked,
        }
    }

    /**
     * Runs a function with this container locked, see [`lock_guard`](TensorDict::lock_guard).
     */
    pub fn with_lock<R>(&self, f: impl FnOnce(&TensorDict) -> R) -> R {
        let guard = self.lock_guard();
        f(&guard)
    }

    /**
     * The nested containers directly below this one.
     */
    pub(crate) fn children(&self) -> Vec<TensorDict> {
        match self.layout() {
            Layout::Dense => self
                .with_dense(|dense| {
                    dense
                        .entries
                        .iter()
                        .filter_map(|(_, value)| match value {
                            Value::Dict(td) => Some(td.clone()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Layout::Stacked(stacked) => stacked.tensordicts,
            Layout::View(view) => vec![view.source],
        }
    }

    // This container and everything nested in it, each container once.
    pub(crate) fn subtree(&self) -> Vec<TensorDict> {
        let mut seen = HashSet::new();
        let mut pending = vec![self.clone()];
        let mut subtree = Vec::new();
        while let Some(td) = pending.pop() {
            if !seen.insert(Arc::as_ptr(&td.node)) {
                continue;
            }
            pending.extend(td.children());
            subtree.push(td);
        }
        subtree
    }
}

/**
 * A scope during which a tensordict is locked, created by
 * [`lock_guard`](TensorDict::lock_guard). Dereferences to the tensordict.
 */
pub struct LockGuard<'a> {
    td: &'a TensorDict,
    was_locked: bool,
}

impl Deref for LockGuard<'_> {
    type Target = TensorDict;

    fn deref(&self) -> &TensorDict {
        self.td
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.was_locked {
            return;
        }
        if let Err(error) = self.td.unlock_() {
            warn!(%error, "could not unlock a tensordict at the end of a locked scope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    #[test]
    fn locks_propagate_to_nested_containers() {
        let root = TensorDict::new([]);
        root.set(("a", "b"), 1.0).unwrap();
        root.lock_();
        let nested = root.get_dict("a").unwrap();
        assert!(nested.is_locked());
        assert!(matches!(nested.set("c", 2.0), Err(TensorDictError::Locked)));
        nested.set_inplace("b", 3.0).unwrap();
        assert!(matches!(
            nested.unlock_(),
            Err(TensorDictError::LockedGraph(_))
        ));
        assert!(nested.is_locked());
        root.unlock_().unwrap();
        assert!(!nested.is_locked());
        nested.set("c", 2.0).unwrap();
    }

    #[test]
    fn guards_nest() {
        let td = TensorDict::new([2]);
        {
            let _outer = td.lock_guard();
            {
                let _inner = td.lock_guard();
            }
            assert!(td.is_locked());
        }
        assert!(!td.is_locked());
        let result = td.with_lock(|td| td.set("x", Tensor::zeros([2])).is_err());
        assert!(result);
        assert!(!td.is_locked());
    }

    #[test]
    fn a_container_held_by_two_parents() {
        let shared = TensorDict::new([]);
        let first = TensorDict::new([]);
        let second = TensorDict::new([]);
        first.set("shared", shared.clone()).unwrap();
        second.set("shared", shared.clone()).unwrap();
        first.lock_();
        second.lock_();
        first.unlock_().unwrap_err();
        second.unlock_().unwrap_err();
        assert!(shared.is_locked());
        assert_eq!(shared.subtree().len(), 1);
    }

    #[test]
    fn sharing_memory_locks() {
        let td = TensorDict::new([]);
        td.share_memory_();
        assert!(td.is_shared());
        assert!(td.is_locked());
        td.unlock_().unwrap();
        assert!(!td.is_shared());
    }
}
