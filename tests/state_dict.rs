extern crate easy_tensordict;

#[cfg(test)]
mod state_dict {
    use easy_tensordict::tensordict::{BATCH_SIZE_KEY, DEVICE_KEY, StateDict, StateValue};
    use easy_tensordict::tensors::{DType, Device, Tensor};
    use easy_tensordict::{TensorDict, TensorDictError, Value};

    fn model() -> TensorDict {
        let td = TensorDict::new([3]);
        td.set("weight", Tensor::new(vec![1.0, 2.0, 3.0], [3])).unwrap();
        td.set(("layer", "bias"), Tensor::new(vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0], [3, 2]))
            .unwrap();
        td
    }

    #[test]
    fn copying_a_state_dict_keeps_the_storage() {
        let source = model();
        let sd = source.state_dict(false, false).unwrap();
        assert_eq!(sd.get(BATCH_SIZE_KEY), Some(&StateValue::BatchSize(vec![3])));
        // detached by default
        source.zero_().unwrap();
        let target = model().clone_structure();
        target.zero_().unwrap();
        let weight = target.get_tensor("weight").unwrap();
        target.lock_();
        target.load_state_dict(&sd, true, false, false).unwrap();
        assert_eq!(weight.to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(target.get_tensor(("layer", "bias")).unwrap().sum(), 39.0);
    }

    #[test]
    fn flat_state_dicts_join_keys_with_dots() {
        let sd = model().state_dict(false, true).unwrap();
        assert_eq!(sd.keys(), vec!["weight", "layer.bias", "__batch_size", "__device"]);
        let target = model();
        target.zero_().unwrap();
        target.load_state_dict(&sd, true, false, true).unwrap();
        assert_eq!(target, model());
    }

    #[test]
    fn assigning_adopts_the_incoming_entries() {
        let sd = model().state_dict(true, false).unwrap();
        let target = TensorDict::new([]);
        match target.load_state_dict(&sd, true, true, false) {
            Err(TensorDictError::KeySetMismatch { state_dict_extra, tensordict_extra }) => {
                assert_eq!(state_dict_extra, vec!["weight", "layer"]);
                assert!(tensordict_extra.is_empty());
            }
            other => panic!("expected mismatched key sets, got {:?}", other.map(|_| ())),
        }
        target.load_state_dict(&sd, false, true, false).unwrap();
        assert_eq!(target.batch_size(), vec![3]);
        assert_eq!(target, model());
    }

    #[test]
    fn reserved_names_and_devices_are_checked() {
        let td = TensorDict::new([]);
        td.set(BATCH_SIZE_KEY, 1.0).unwrap();
        assert!(matches!(
            td.state_dict(false, false),
            Err(TensorDictError::ReservedKey(_))
        ));
        let sd = model().to(Device::Cuda(0)).unwrap().state_dict(false, false).unwrap();
        let target = TensorDict::with_device([3], Some(Device::Cpu));
        target.set("weight", Tensor::zeros([3])).unwrap();
        target.set(("layer", "bias"), Tensor::zeros([3, 2])).unwrap();
        match target.load_state_dict(&sd, true, false, false) {
            Err(TensorDictError::DeviceMismatch { expected, found }) => {
                assert_eq!(expected, Device::Cpu.to_string());
                assert_eq!(found, Device::Cuda(0).to_string());
            }
            other => panic!("expected a device mismatch, got {:?}", other.map(|_| ())),
        }
    }

    fn nested_state(sd: &StateDict, key: &str) -> StateDict {
        match sd.get(key) {
            Some(StateValue::Nested(nested)) => nested.clone(),
            other => panic!("expected a nested state dict at {}, got {:?}", key, other),
        }
    }

    #[test]
    fn a_failed_load_changes_nothing() {
        let target = model();
        let weight = target.get_tensor("weight").unwrap();
        let mut sd = model().state_dict(false, false).unwrap();
        sd.insert(
            "weight",
            StateValue::Leaf(Value::Tensor(Tensor::full([3], 9.0, DType::Float32))),
        );
        let mut layer = nested_state(&sd, "layer");
        layer.insert("bias", StateValue::Leaf(Value::Tensor(Tensor::zeros([4, 2]))));
        sd.insert("layer", StateValue::Nested(layer));
        // the weight is written before the bias is found not to fit
        assert!(matches!(
            target.load_state_dict(&sd, true, false, false),
            Err(TensorDictError::BatchSizeMismatch { .. })
        ));
        assert_eq!(weight.to_vec(), vec![1.0, 2.0, 3.0]);
        assert!(target.get_tensor("weight").unwrap().same_storage(&weight));
        assert_eq!(target, model());
    }

    #[test]
    fn a_failed_load_restores_the_batch_size() {
        let target = TensorDict::with_device([3], Some(Device::Cpu));
        target.set("weight", Tensor::zeros([3])).unwrap();
        target.set(("layer", "bias"), Tensor::zeros([3, 2])).unwrap();
        let source = TensorDict::new([]);
        source.set("weight", Tensor::ones([3])).unwrap();
        source.set(("layer", "bias"), Tensor::ones([3, 2])).unwrap();
        let mut sd = source.state_dict(false, false).unwrap();
        let mut layer = nested_state(&sd, "layer");
        layer.insert(DEVICE_KEY, StateValue::Device(Some(Device::Cuda(0))));
        sd.insert("layer", StateValue::Nested(layer));
        assert!(matches!(
            target.load_state_dict(&sd, false, false, false),
            Err(TensorDictError::DeviceMismatch { .. })
        ));
        assert_eq!(target.batch_size(), vec![3]);
        assert_eq!(target.get_dict("layer").unwrap().batch_size(), vec![3]);
        assert!(!target.any().unwrap());
    }
}
