extern crate easy_tensordict;

#[cfg(test)]
mod locking {
    use easy_tensordict::tensors::Tensor;
    use easy_tensordict::{TensorDict, TensorDictError};

    fn tree() -> TensorDict {
        let td = TensorDict::new([2]);
        td.set(("a", "b", "c"), Tensor::zeros([2])).unwrap();
        td.set("d", Tensor::zeros([2, 3])).unwrap();
        td
    }

    #[test]
    fn locking_reaches_every_present_descendant() {
        let td = tree();
        td.lock_();
        let a = td.get_dict("a").unwrap();
        let b = td.get_dict(("a", "b")).unwrap();
        assert!(a.is_locked());
        assert!(b.is_locked());
        match b.unlock_() {
            Err(TensorDictError::LockedGraph(_)) => {}
            other => panic!("expected a locked graph error, got {:?}", other.map(|_| ())),
        }
        // the failed unlock left everything locked
        assert!(b.is_locked());
        assert!(a.is_locked());
        td.unlock_().unwrap();
        assert!(!a.is_locked());
        assert!(!b.is_locked());
        b.set("new", Tensor::ones([2])).unwrap();
    }

    #[test]
    fn locked_selections_hold_the_containers_they_share() {
        let td = tree();
        td.lock_();
        let selection = td.select(["a"], true).unwrap();
        assert!(selection.is_locked());
        assert!(selection.get_dict("a").unwrap().ptr_eq(&td.get_dict("a").unwrap()));
        assert!(matches!(td.unlock_(), Err(TensorDictError::LockedGraph(_))));
        assert!(matches!(selection.unlock_(), Err(TensorDictError::LockedGraph(_))));
        assert!(td.get_dict("a").unwrap().is_locked());
        drop(selection);
        td.unlock_().unwrap();

        td.lock_();
        let rest = td.exclude(["d"]).unwrap();
        assert!(matches!(td.unlock_(), Err(TensorDictError::LockedGraph(_))));
        drop(rest);
        td.unlock_().unwrap();
        assert!(!td.get_dict(("a", "b")).unwrap().is_locked());
    }

    #[test]
    fn relocking_is_a_no_op() {
        let td = tree();
        td.lock_();
        td.lock_();
        td.unlock_().unwrap();
        assert!(!td.get_dict("a").unwrap().is_locked());
    }

    #[test]
    fn locks_cover_the_containers_present_when_locking() {
        let td = tree();
        let b = td.get_dict(("a", "b")).unwrap();
        b.lock_();
        assert!(!td.is_locked());
        let late = TensorDict::new([2]);
        td.set(("a", "late"), late.clone()).unwrap();
        assert!(!late.is_locked());
        td.lock_();
        assert!(late.is_locked());
        td.unlock_().unwrap();
        assert!(!late.is_locked());
        assert!(!b.is_locked());
    }

    #[test]
    fn structural_changes_are_rejected_while_locked() {
        let td = tree();
        td.lock_();
        assert!(matches!(td.set("e", Tensor::zeros([2])), Err(TensorDictError::Locked)));
        assert!(matches!(td.pop("d"), Err(TensorDictError::Locked)));
        assert!(matches!(td.rename_key_("d", "e", true), Err(TensorDictError::Locked)));
        assert!(matches!(td.clear(), Err(TensorDictError::Locked)));
        assert!(matches!(td.create_nested("x"), Err(TensorDictError::Locked)));
        assert!(matches!(
            td.set(("a", "b", "x"), Tensor::zeros([2])),
            Err(TensorDictError::Locked)
        ));
        td.set_("d", Tensor::ones([2, 3])).unwrap();
        td.add_(1.0).unwrap();
        assert_eq!(td.get_tensor("d").unwrap().sum(), 12.0);
        assert_eq!(td.keys(), vec!["a", "d"]);
    }

    #[test]
    fn guards_only_unlock_what_they_locked() {
        let td = tree();
        {
            let outer = td.lock_guard();
            {
                let inner = outer.lock_guard();
                assert!(inner.is_locked());
            }
            assert!(td.is_locked());
        }
        assert!(!td.is_locked());
        let keys = td.with_lock(|locked| {
            assert!(locked.set("z", 1.0).is_err());
            locked.keys()
        });
        assert_eq!(keys, vec!["a", "d"]);
        assert!(!td.is_locked());
    }

    #[test]
    fn sharing_memory_locks_the_tree() {
        let td = tree();
        td.share_memory_();
        assert!(td.is_shared());
        assert!(td.is_locked());
        assert!(td.get_dict(("a", "b")).unwrap().is_locked());
    }

    #[test]
    fn sorted_keys_follow_unlocked_changes() {
        let td = TensorDict::new([]);
        td.set("b", 1.0).unwrap();
        td.set("a", 1.0).unwrap();
        td.lock_();
        assert_eq!(td.sorted_keys(), vec!["a", "b"]);
        td.unlock_().unwrap();
        td.set("0", 1.0).unwrap();
        assert_eq!(td.sorted_keys(), vec!["0", "a", "b"]);
    }
}
