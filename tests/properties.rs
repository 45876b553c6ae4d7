extern crate rand;
extern crate rand_chacha;

extern crate easy_tensordict;

#[cfg(test)]
mod properties {
    use rand::{Rng, SeedableRng};

    use easy_tensordict::tensordict::{ShapeMode, ShapeOp};
    use easy_tensordict::tensors::{Index, Tensor};
    use easy_tensordict::{TensorDict, Value};

    // Builds a tree of up to three levels with leaves of random trailing shapes.
    fn random_tree<R: Rng>(random_generator: &mut R, batch_size: &[usize], depth: usize) -> TensorDict {
        let td = TensorDict::new(batch_size.to_vec());
        let entries = random_generator.random_range(1..4);
        for i in 0..entries {
            if depth < 2 && random_generator.random_bool(0.3) {
                let nested = random_tree(random_generator, batch_size, depth + 1);
                td.set(format!("nested_{}", i), nested).unwrap();
            } else {
                let mut shape = batch_size.to_vec();
                for _ in 0..random_generator.random_range(0..3) {
                    shape.push(random_generator.random_range(1..4));
                }
                let length = shape.iter().product();
                let data = (0..length)
                    .map(|_| random_generator.random_range(-10.0..10.0))
                    .collect();
                td.set(format!("leaf_{}", i), Tensor::new(data, shape)).unwrap();
            }
        }
        td
    }

    fn random_batch_size<R: Rng>(random_generator: &mut R) -> Vec<usize> {
        (0..random_generator.random_range(1..4))
            .map(|_| random_generator.random_range(1..5))
            .collect()
    }

    fn assert_consistent(td: &TensorDict) {
        let batch_size = td.batch_size();
        for (key, value) in td.items().unwrap() {
            let shape = value.shape();
            assert!(
                shape.len() >= batch_size.len() && shape[..batch_size.len()] == batch_size[..],
                "{} has shape {:?} under batch size {:?}",
                key,
                shape,
                batch_size
            );
            if let Value::Dict(nested) = value {
                assert_consistent(&nested);
            }
        }
    }

    #[test]
    fn leaves_always_start_with_the_batch_size() {
        let mut random_generator = rand_chacha::ChaCha8Rng::seed_from_u64(16);
        for _ in 0..20 {
            let batch_size = random_batch_size(&mut random_generator);
            let td = random_tree(&mut random_generator, &batch_size, 0);
            assert_consistent(&td);
            assert_consistent(&td.index(&[Index::At(0)]).unwrap());
            assert_consistent(&td.unsqueeze(0).unwrap());
            assert_consistent(&td.flatten(0, -1).unwrap());
            let reversed: Vec<isize> = (0..batch_size.len() as isize).rev().collect();
            assert_consistent(&td.permute(&reversed).unwrap());
            let stacked = TensorDict::stack(&[td.clone(), td.deep_clone()], 1).unwrap();
            assert_consistent(&stacked);
            for piece in td.split(2, 0).unwrap() {
                assert_consistent(&piece);
            }
        }
    }

    #[test]
    fn flattening_keys_round_trips() {
        let mut random_generator = rand_chacha::ChaCha8Rng::seed_from_u64(10);
        for _ in 0..20 {
            let batch_size = random_batch_size(&mut random_generator);
            let td = random_tree(&mut random_generator, &batch_size, 0);
            let flat = td.flatten_keys(".").unwrap();
            assert_eq!(flat.depth(), 0);
            assert_eq!(flat.unflatten_keys(".").unwrap(), td);
        }
    }

    fn signed(values: &[usize]) -> Vec<isize> {
        values.iter().map(|&v| v as isize).collect()
    }

    fn lazily(td: &TensorDict, op: &ShapeOp) -> TensorDict {
        let shaper = td.shaped(ShapeMode::Lazy);
        match op {
            ShapeOp::Unsqueeze { dim } => shaper.unsqueeze(*dim as isize),
            ShapeOp::Squeeze { dim } => shaper.squeeze(Some(*dim as isize)),
            ShapeOp::Permute { dims } => shaper.permute(&signed(dims)),
            ShapeOp::Reshape { to, .. } => shaper.reshape(&signed(to)),
            other => panic!("no lazy form for {:?} in this test", other),
        }
        .unwrap()
    }

    #[test]
    fn inverse_operations_restore_the_container() {
        let mut random_generator = rand_chacha::ChaCha8Rng::seed_from_u64(4);
        for _ in 0..20 {
            let batch_size = random_batch_size(&mut random_generator);
            let td = random_tree(&mut random_generator, &batch_size, 0);
            let ndim = batch_size.len();
            let mut dims: Vec<usize> = (0..ndim).collect();
            dims.rotate_left(1);
            let ops = vec![
                ShapeOp::Unsqueeze { dim: ndim },
                ShapeOp::Permute { dims },
                ShapeOp::Reshape {
                    from: batch_size.clone(),
                    to: vec![batch_size.iter().product()],
                },
            ];
            for op in ops {
                let applied = td.apply_shape_op(&op).unwrap();
                let restored = applied.apply_shape_op(&op.inverse()).unwrap();
                assert_eq!(restored.batch_size(), batch_size);
                assert_eq!(restored, td);

                let view = lazily(&td, &op);
                assert_eq!(view.batch_size(), op.apply_shape(&batch_size).unwrap());
                assert_consistent(&view.to_tensordict().unwrap());
                assert!(lazily(&view, &op.inverse()).ptr_eq(&td));
            }
        }
    }
}
