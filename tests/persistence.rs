extern crate easy_tensordict;

#[cfg(test)]
mod persistence {
    use easy_tensordict::config::Config;
    use easy_tensordict::keys::ValueKind;
    use easy_tensordict::nontensor::Payload;
    use easy_tensordict::persistence::MemmapOptions;
    use easy_tensordict::tensors::{DType, Device, Tensor};
    use easy_tensordict::{TensorDict, TensorDictError};

    use std::fs;

    fn sample() -> TensorDict {
        let td = TensorDict::with_device([2], Some(Device::Cpu));
        td.set("obs", Tensor::new(vec![0.5, 1.5, 2.5, 3.5], [2, 2])).unwrap();
        td.set(("next", "done"), Tensor::full([2], 1.0, DType::Bool)).unwrap();
        td.set_non_tensor("label", "episode").unwrap();
        td.set_non_tensor("raw", vec![1_u8, 2, 3]).unwrap();
        td
    }

    #[test]
    fn directories_mirror_the_structure() {
        let dir = tempfile::tempdir().unwrap();
        sample().memmap(dir.path()).unwrap();
        let root = dir.path();
        assert!(root.join("meta.json").is_file());
        assert!(root.join("obs.memmap").is_file());
        assert_eq!(fs::metadata(root.join("obs.memmap")).unwrap().len(), 4 * 8);
        assert!(root.join("next").join("meta.json").is_file());
        assert!(root.join("next").join("done.memmap").is_file());
        assert!(root.join("raw").join("data.bin").is_file());
        let meta: serde_json::Value =
            serde_json::from_slice(&fs::read(root.join("label").join("meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["_type"], "NonTensorData");
        assert_eq!(meta["data"]["json"], "episode");
    }

    #[test]
    fn loading_restores_values_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let td = sample();
        let saved = td.save(dir.path()).unwrap();
        assert_eq!(saved, td);
        let loaded = TensorDict::load_memmap(dir.path()).unwrap();
        assert_eq!(loaded, td);
        assert!(loaded.is_memmap());
        assert!(loaded.is_locked());
        assert_eq!(loaded.device(), Some(Device::Cpu));
        assert_eq!(loaded.get_tensor(("next", "done")).unwrap().dtype(), DType::Bool);
        assert_eq!(loaded.get_non_tensor("raw").unwrap(), Payload::Binary(vec![1, 2, 3]));
        assert_eq!(loaded.saved_path().as_deref(), Some(dir.path()));
    }

    #[test]
    fn memmapping_in_place_and_syncing() {
        let dir = tempfile::tempdir().unwrap();
        let td = sample();
        td.memmap_(dir.path()).unwrap();
        assert!(td.is_memmap());
        assert!(matches!(td.set("new", Tensor::zeros([2])), Err(TensorDictError::Locked)));
        td.set_("obs", Tensor::zeros([2, 2])).unwrap();
        let before = TensorDict::load_memmap(dir.path()).unwrap();
        assert_eq!(before.get_tensor("obs").unwrap().sum(), 8.0);
        td.sync_memmap().unwrap();
        let after = TensorDict::load_memmap(dir.path()).unwrap();
        assert_eq!(after.get_tensor("obs").unwrap().sum(), 0.0);
        td.unlock_().unwrap();
        assert!(!td.is_memmap());
    }

    #[test]
    fn syncing_needs_a_directory() {
        assert!(matches!(
            sample().sync_memmap(),
            Err(TensorDictError::Unsupported(_))
        ));
    }

    #[test]
    fn writing_on_a_thread_pool() {
        let dir = tempfile::tempdir().unwrap();
        let td = TensorDict::new([8]);
        for i in 0..16 {
            td.set(format!("leaf_{}", i), Tensor::full([8, 4], i as f64, DType::Float64))
                .unwrap();
        }
        let config = Config::from_toml_str(
            "[memmap]\nnum_threads = 4\nreturn_early = true\n",
        )
        .unwrap();
        let options = MemmapOptions::from_config(&config);
        assert_eq!(options, MemmapOptions {
            num_threads: 4,
            return_early: true
        });
        let future = td.memmap_with(dir.path(), options).unwrap();
        // later writes do not reach the disk
        td.get_tensor("leaf_3").unwrap().fill_(-1.0);
        let loaded = future.wait().unwrap();
        assert_eq!(loaded.get_tensor("leaf_3").unwrap().sum(), 3.0 * 32.0);
        assert_eq!(loaded.get_tensor("leaf_15").unwrap().sum(), 15.0 * 32.0);
    }

    #[test]
    fn lazy_stacks_keep_their_members() {
        let dir = tempfile::tempdir().unwrap();
        let a = TensorDict::new([]);
        a.set("x", Tensor::zeros([2])).unwrap();
        let b = TensorDict::new([]);
        b.set("x", Tensor::ones([3])).unwrap();
        let stacked = TensorDict::lazy_stack(&[a, b], 0).unwrap();
        stacked.memmap(dir.path()).unwrap();
        assert!(dir.path().join("0").join("x.memmap").is_file());
        assert!(dir.path().join("1").join("x.memmap").is_file());
        let loaded = TensorDict::load_memmap(dir.path()).unwrap();
        assert_eq!(loaded.kind(), ValueKind::LazyStack);
        let members = loaded.tensordicts().unwrap();
        assert_eq!(members[1].get_tensor("x").unwrap().to_vec(), vec![1.0; 3]);
    }

    #[test]
    fn keys_must_be_usable_as_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let td = TensorDict::new([]);
        td.set("a/b", 1.0).unwrap();
        assert!(matches!(td.memmap(dir.path()), Err(TensorDictError::InvalidKey(_))));
    }
}
