extern crate easy_tensordict;

#[cfg(test)]
mod scenarios {
    use easy_tensordict::keys::NestedKey;
    use easy_tensordict::nontensor::{NonTensorData, stack_non_tensor};
    use easy_tensordict::tensordict::{ApplyOptions, KeysOptions, ShapeMode};
    use easy_tensordict::tensors::{Index, Tensor};
    use easy_tensordict::{TensorDict, TensorDictError, Value};

    #[test]
    fn unsqueeze_inserts_a_batch_dimension() {
        let td = TensorDict::new([3, 4]);
        td.set("x", Tensor::zeros([3, 4, 5])).unwrap();
        let unsqueezed = td.unsqueeze(-2).unwrap();
        assert_eq!(unsqueezed.batch_size(), vec![3, 1, 4]);
        assert_eq!(unsqueezed.get_tensor("x").unwrap().shape(), &[3, 1, 4, 5]);
    }

    #[test]
    fn apply_with_pairs_leaves_by_key() {
        let a = TensorDict::new([]);
        a.set("a", 0).unwrap();
        a.set(("b", "c"), 1).unwrap();
        let b = TensorDict::new([]);
        b.set("a", 9).unwrap();
        b.set(("b", "c"), 9).unwrap();
        let summed = a.apply_with(&[&b], |x, ys| x.try_add(&ys[0])).unwrap();
        assert_eq!(summed.get_tensor("a").unwrap().item(), Some(9.0));
        assert_eq!(summed.get_tensor(("b", "c")).unwrap().item(), Some(10.0));
    }

    #[test]
    fn locked_containers_allow_writes_in_place() {
        let td = TensorDict::new([2]);
        td.set("key", Tensor::zeros([2])).unwrap();
        td.lock_();
        assert!(matches!(td.del_("key"), Err(TensorDictError::Locked)));
        td.set_inplace("key", Tensor::ones([2])).unwrap();
        assert_eq!(td.get_tensor("key").unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn flattening_and_unflattening_keys() {
        let td = TensorDict::new([]);
        td.set("a", 1).unwrap();
        td.set(("b", "c"), 2).unwrap();
        let flat = td.flatten_keys(".").unwrap();
        assert_eq!(flat.keys(), vec!["a", "b.c"]);
        assert_eq!(flat.get_tensor("b.c").unwrap().item(), Some(2.0));
        let restored = flat.unflatten_keys(".").unwrap();
        assert_eq!(restored, td);
        assert!(restored.get("b").unwrap().as_dict().is_some());
    }

    #[test]
    fn select_shares_the_selected_values() {
        let td = TensorDict::new([]);
        td.set("a", 0).unwrap();
        td.set(("b", "c"), 1).unwrap();
        td.set(("b", "d"), 2).unwrap();
        let selected = td
            .select([NestedKey::from("a"), NestedKey::from(("b", "c"))], true)
            .unwrap();
        assert_eq!(
            selected.keys_with(KeysOptions::leaves()).unwrap(),
            vec![NestedKey::from("a"), NestedKey::from(("b", "c"))]
        );
        assert!(
            selected
                .get_tensor("a")
                .unwrap()
                .same_storage(&td.get_tensor("a").unwrap())
        );
        assert!(td.contains(("b", "d")));
    }

    #[test]
    fn stacking_non_tensor_data() {
        let same: Vec<Value> = (0..3)
            .map(|_| Value::from(NonTensorData::new("label", Vec::new())))
            .collect();
        match stack_non_tensor(&same, 0).unwrap() {
            Value::NonTensor(data) => {
                assert_eq!(data.batch_size(), &[3]);
                assert_eq!(data.data().as_str(), Some("label"));
            }
            other => panic!("expected a single non-tensor value, got {:?}", other.kind()),
        }
        let different: Vec<Value> = ["x", "y", "z"]
            .iter()
            .map(|&s| Value::from(NonTensorData::new(s, Vec::new())))
            .collect();
        match stack_non_tensor(&different, 0).unwrap() {
            Value::NonTensorStack(stack) => {
                assert_eq!(stack.batch_size(), &[3]);
                assert!(matches!(stack.data(), Err(TensorDictError::NonTensorStackData)));
                for (i, expected) in ["x", "y", "z"].iter().enumerate() {
                    let item = stack.get(i).unwrap();
                    assert_eq!(item.as_payload().and_then(|p| p.as_str()), Some(*expected));
                }
            }
            other => panic!("expected a non-tensor stack, got {:?}", other.kind()),
        }
    }

    #[test]
    fn stacking_tensordicts_stacks_their_non_tensor_data() {
        let members: Vec<TensorDict> = ["x", "x", "y"]
            .iter()
            .map(|&label| {
                let td = TensorDict::new([]);
                td.set_non_tensor("label", label).unwrap();
                td.set("value", 1.0).unwrap();
                td
            })
            .collect();
        let stacked = TensorDict::stack(&members[..2], 0).unwrap();
        assert_eq!(stacked.get_non_tensor("label").unwrap().as_str(), Some("x"));
        let stacked = TensorDict::stack(&members, 0).unwrap();
        assert!(stacked.get_non_tensor("label").is_err());
        let last = stacked.index(&[Index::At(2)]).unwrap();
        assert_eq!(last.get_non_tensor("label").unwrap().as_str(), Some("y"));
    }

    #[test]
    fn lazy_inverse_returns_the_source() {
        let td = TensorDict::new([2, 3]);
        td.set("x", Tensor::arange(6).reshape(&[2, 3]).unwrap()).unwrap();
        let transposed = td.shaped(ShapeMode::Lazy).transpose(0, 1).unwrap();
        assert!(transposed.is_view());
        assert_eq!(transposed.batch_size(), vec![3, 2]);
        let back = transposed.shaped(ShapeMode::Lazy).transpose(0, 1).unwrap();
        assert!(back.ptr_eq(&td));

        let eager = td.transpose(0, 1).unwrap().transpose(0, 1).unwrap();
        assert!(!eager.ptr_eq(&td));
        assert_eq!(eager, td);
    }

    #[test]
    fn full_slices_return_the_same_container() {
        let td = TensorDict::new([2, 3]);
        td.set("x", Tensor::zeros([2, 3])).unwrap();
        assert!(td.index(&[Index::full()]).unwrap().ptr_eq(&td));
        assert!(td.index(&[Index::Ellipsis]).unwrap().ptr_eq(&td));
        assert!(!td.index(&[Index::At(0)]).unwrap().ptr_eq(&td));
    }

    #[test]
    fn filtered_keys_are_dropped_from_apply_results() {
        let a = TensorDict::new([2]);
        a.set("keep", Tensor::zeros([2])).unwrap();
        a.set(("nested", "drop"), Tensor::zeros([2])).unwrap();
        let b = a.deep_clone();
        let result = a
            .apply_with_options(&[&b], ApplyOptions::new().filter_empty(true), |x, ys| {
                if x.shape() == ys[0].shape() && x.same_storage(&a.get_tensor("keep")?) {
                    Ok(Some(x.clone()))
                } else {
                    Ok(None)
                }
            })
            .unwrap();
        assert_eq!(
            result.keys_with(KeysOptions::leaves()).unwrap(),
            vec![NestedKey::from("keep")]
        );
        assert!(!result.contains("nested"));
    }

    #[test]
    fn missing_keys_in_other_containers_need_a_default() {
        let a = TensorDict::new([]);
        a.set("x", 1.0).unwrap();
        a.set("y", 2.0).unwrap();
        let b = TensorDict::new([]);
        b.set("x", 3.0).unwrap();
        assert!(a.apply_with(&[&b], |x, ys| x.try_add(&ys[0])).is_err());
        let summed = a
            .apply_with_options(&[&b], ApplyOptions::new().default_value(10.0), |x, ys| {
                x.try_add(&ys[0]).map(Some)
            })
            .unwrap();
        assert_eq!(summed.get_tensor("y").unwrap().item(), Some(12.0));
    }
}
