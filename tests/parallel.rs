extern crate easy_tensordict;

#[cfg(test)]
mod parallel {
    use easy_tensordict::config::Config;
    use easy_tensordict::distributed::{LocalTransport, Transport};
    use easy_tensordict::map::MapOptions;
    use easy_tensordict::tensors::{DType, Tensor};
    use easy_tensordict::{TensorDict, TensorDictError};

    use std::thread;
    use std::time::Duration;

    fn batch(length: usize) -> TensorDict {
        let td = TensorDict::new([length]);
        td.set("x", Tensor::arange(length)).unwrap();
        td.set(("nested", "y"), Tensor::ones([length, 2])).unwrap();
        td
    }

    #[test]
    fn map_reassembles_in_chunk_order() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let td = batch(10);
        let config = Config::from_toml_str("[map]\nnum_workers = 3\nchunksize = 3\n").unwrap();
        let mapped = td
            .map(
                |chunk| {
                    // make later chunks finish first
                    let first = chunk.get_tensor("x")?.to_vec()[0];
                    thread::sleep(Duration::from_millis(20 - first as u64 * 2));
                    TensorDict::mul(&chunk, 2.0)
                },
                MapOptions::from_config(&config),
            )
            .unwrap();
        assert_eq!(
            mapped.get_tensor("x").unwrap().to_vec(),
            (0..10).map(|x| 2.0 * x as f64).collect::<Vec<_>>()
        );
        assert_eq!(mapped.get_tensor(("nested", "y")).unwrap().sum(), 40.0);
    }

    #[test]
    fn map_writes_into_existing_slices() {
        let td = batch(6);
        let out = td.deep_clone();
        out.share_memory_();
        td.map(
            |chunk| TensorDict::neg(&chunk),
            MapOptions::new().num_workers(2).out(out.clone()),
        )
        .unwrap();
        assert_eq!(out.get_tensor("x").unwrap().to_vec(), vec![
            0.0, -1.0, -2.0, -3.0, -4.0, -5.0
        ]);
        assert!(out.is_locked());
        // results may not add keys to a shared output
        let result = td.map(
            |chunk| {
                let grown = chunk.clone_structure();
                grown.set("extra", Tensor::zeros(chunk.batch_size()))?;
                Ok(grown)
            },
            MapOptions::new().out(out.clone()),
        );
        assert!(result.is_err());
        assert!(!out.contains("extra"));
    }

    #[test]
    fn map_along_an_inner_dimension() {
        let td = TensorDict::new([2, 4]);
        td.set("x", Tensor::zeros([2, 4])).unwrap();
        let mapped = td
            .map(
                |chunk| {
                    assert_eq!(chunk.batch_size()[0], 2);
                    TensorDict::add(&chunk, 1.0)
                },
                MapOptions::new().dim(1).num_chunks(4),
            )
            .unwrap();
        assert_eq!(mapped.batch_size(), vec![2, 4]);
        assert_eq!(mapped.get_tensor("x").unwrap().sum(), 8.0);
    }

    #[test]
    fn send_and_recv_between_threads() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut group = LocalTransport::group(2).into_iter();
        let (server, client) = (group.next().unwrap(), group.next().unwrap());
        let client_thread = thread::spawn(move || {
            let td = TensorDict::new([2]);
            td.set(("a", "b"), Tensor::new(vec![1.0, 2.0], [2])).unwrap();
            td.set("c", Tensor::full([2, 3], 3.0, DType::Float32)).unwrap();
            td.set("_", Tensor::ones([2, 1, 5])).unwrap();
            td.send(&client, 0, 5, true)
        });
        let td = TensorDict::new([2]);
        td.set(("a", "b"), Tensor::zeros([2])).unwrap();
        td.set("c", Tensor::zeros([2, 3])).unwrap();
        td.set("_", Tensor::zeros([2, 1, 5])).unwrap();
        let received = td.recv(&server, 1, 5, true).unwrap();
        let sent = client_thread.join().unwrap().unwrap();
        assert_eq!(sent, received);
        assert!(td.elementwise_ne(0.0).unwrap().all().unwrap());
        assert_eq!(td.get_tensor("c").unwrap().sum(), 18.0);
    }

    #[test]
    fn mismatched_tags_are_not_delivered() {
        let mut group = LocalTransport::group(2).into_iter();
        let server = group.next().unwrap().with_timeout(Duration::from_millis(50));
        let client = group.next().unwrap();
        let td = TensorDict::new([]);
        td.set("x", 1.0).unwrap();
        td.send(&client, 0, 0, false).unwrap();
        let receiver = TensorDict::new([]);
        receiver.set("x", 0.0).unwrap();
        assert!(matches!(
            receiver.recv(&server, 1, 1, false),
            Err(TensorDictError::Transport(_))
        ));
        let tensor = server.recv(&Tensor::zeros([]), 1, 0).unwrap();
        assert_eq!(tensor.item(), Some(1.0));
    }
}
