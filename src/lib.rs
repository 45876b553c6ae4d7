/*!
 * If this is your first time using Easy TensorDict you should start with the
 * [TensorDict](./tensordict/struct.TensorDict.html) type, a container of tensors that share
 * leading batch dimensions, then look at how [keys](./keys/index.html) address nested
 * entries.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::{Index, Tensor};
 * let td = TensorDict::new([4]);
 * td.set("observation", Tensor::zeros([4, 3])).unwrap();
 * td.set(("next", "reward"), Tensor::ones([4, 1])).unwrap();
 * let first_two = td.index(&[Index::range(0, 2)]).unwrap();
 * assert_eq!(first_two.batch_size(), vec![2]);
 * assert_eq!(first_two.get_tensor(("next", "reward")).unwrap().shape(), &[2, 1]);
 * ```
 *
 * # Beyond a single process
 * - [Writing to and reading from disk](./persistence/index.html)
 * - [Mapping over chunks with a worker pool](./map/index.html)
 * - [Sending tensordicts between workers](./distributed/index.html)
 * - [Typed structs backed by a tensordict](./tensorclass/index.html)
 */

pub mod config;
pub mod errors;
pub mod keys;
pub mod nontensor;
pub mod tensordict;
pub mod tensors;
pub mod value;

pub mod distributed;
pub mod map;
pub mod persistence;
pub mod tensorclass;

pub use errors::TensorDictError;
pub use tensordict::TensorDict;
pub use value::Value;
