use crate::tensors::Tensor;

use std::fmt;

// Tensors with more elements than this only print their metadata.
const MAX_PRINTED_ELEMENTS: usize = 16;

/**
 * Prints the shape, device and dtype of a tensor followed by its elements if there are few
 * enough of them.
 *
 * ```
 * use easy_tensordict::tensors::Tensor;
 * let tensor = Tensor::new(vec![1.0, 2.0], [2]);
 * assert_eq!(
 *     tensor.to_string(),
 *     "Tensor(shape=[2], device=cpu, dtype=float32, data=[1.0, 2.0])"
 * );
 * ```
 */
impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={:?}, device={}, dtype={}",
            self.shape(),
            self.device(),
            self.dtype()
        )?;
        if self.numel() <= MAX_PRINTED_ELEMENTS {
            write!(f, ", data={:?}", self.to_vec())?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[test]
fn large_tensors_only_print_metadata() {
    let tensor = Tensor::zeros([5, 5]);
    assert_eq!(
        tensor.to_string(),
        "Tensor(shape=[5, 5], device=cpu, dtype=float32)"
    );
}
