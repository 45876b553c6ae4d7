/*!
 * Tensor operations.
 *
 * Shape changing operations, joining and splitting, and broadcasting elementwise arithmetic.
 *
 * Each operation that can fail on mismatched shapes has a method returning a [`Result`], and
 * the arithmetic operators are also implemented on references to tensors for convenience.
 * The operators panic on mismatched shapes, matching the behaviour of the `try_` free
 * methods they wrap.
 *
 * ```
 * use easy_tensordict::tensors::Tensor;
 * let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
 * let y = Tensor::new(vec![10.0, 20.0], [2]);
 * // y is broadcast along the first dimension
 * let z = &x + &y;
 * assert_eq!(z.to_vec(), vec![11.0, 22.0, 13.0, 24.0]);
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensors::dimensions::{
    broadcast_offsets, broadcast_shapes, compute_strides, elements, normalize_dim, permute_offsets,
    unflatten,
};
use crate::tensors::indexing::{Index, index_offsets};
use crate::tensors::{DType, Tensor};

use std::ops::{Add, Div, Mul, Neg, Sub};

// Stacks row major blocks of the same shape along a new dimension.
pub(crate) fn stack_flat<T: Clone>(parts: &[&[T]], shape: &[usize], dim: usize) -> Vec<T> {
    let outer = elements(&shape[..dim]);
    let inner = elements(&shape[dim..]);
    let mut data = Vec::with_capacity(outer * inner * parts.len());
    for o in 0..outer {
        for part in parts {
            data.extend_from_slice(&part[o * inner..(o + 1) * inner]);
        }
    }
    data
}

// Concatenates row major blocks whose shapes agree except along `dim`.
pub(crate) fn cat_flat<T: Clone>(parts: &[(&[usize], &[T])], dim: usize) -> Vec<T> {
    let Some((first, _)) = parts.first() else {
        return Vec::new();
    };
    let outer = elements(&first[..dim]);
    let mut data = Vec::with_capacity(parts.iter().map(|(_, d)| d.len()).sum());
    for o in 0..outer {
        for (shape, part) in parts {
            let block = elements(&shape[dim..]);
            data.extend_from_slice(&part[o * block..(o + 1) * block]);
        }
    }
    data
}

fn check_same_shapes(tensors: &[Tensor], operation: &str) -> Result<()> {
    let Some(first) = tensors.first() else {
        return Err(TensorDictError::shape(format!(
            "cannot {} an empty list of tensors",
            operation
        )));
    };
    for tensor in tensors {
        if tensor.shape() != first.shape() {
            return Err(TensorDictError::shape(format!(
                "cannot {} tensors of shapes {:?} and {:?}",
                operation,
                first.shape(),
                tensor.shape()
            )));
        }
    }
    Ok(())
}

fn promoted(tensors: &[Tensor]) -> DType {
    tensors
        .iter()
        .map(|t| t.dtype())
        .fold(DType::Bool, DType::promote)
}

/**
 * Stacks tensors of the same shape along a new dimension.
 */
pub fn stack(tensors: &[Tensor], dim: isize) -> Result<Tensor> {
    check_same_shapes(tensors, "stack")?;
    let shape = tensors[0].shape().to_vec();
    let dim = normalize_dim(dim, shape.len() + 1)?;
    let data: Vec<Vec<f64>> = tensors.iter().map(Tensor::to_vec).collect();
    let parts: Vec<&[f64]> = data.iter().map(|d| d.as_slice()).collect();
    let stacked = stack_flat(&parts, &shape, dim);
    let mut new_shape = shape;
    new_shape.insert(dim, tensors.len());
    let dtype = promoted(tensors);
    Ok(Tensor::from_parts(
        stacked.into_iter().map(|x| dtype.cast(x)).collect(),
        new_shape,
        dtype,
        tensors[0].device(),
    ))
}

/**
 * Concatenates tensors along an existing dimension. The tensors must agree on every other
 * dimension.
 */
pub fn cat(tensors: &[Tensor], dim: isize) -> Result<Tensor> {
    let Some(first) = tensors.first() else {
        return Err(TensorDictError::shape("cannot cat an empty list of tensors"));
    };
    let dim = normalize_dim(dim, first.ndim())?;
    for tensor in tensors {
        let compatible = tensor.ndim() == first.ndim()
            && (0..first.ndim()).all(|d| d == dim || tensor.shape()[d] == first.shape()[d]);
        if !compatible {
            return Err(TensorDictError::shape(format!(
                "cannot cat tensors of shapes {:?} and {:?} along dimension {}",
                first.shape(),
                tensor.shape(),
                dim
            )));
        }
    }
    let data: Vec<Vec<f64>> = tensors.iter().map(Tensor::to_vec).collect();
    let parts: Vec<(&[usize], &[f64])> = tensors
        .iter()
        .zip(data.iter())
        .map(|(t, d)| (t.shape(), d.as_slice()))
        .collect();
    let joined = cat_flat(&parts, dim);
    let mut shape = first.shape().to_vec();
    shape[dim] = tensors.iter().map(|t| t.shape()[dim]).sum();
    let dtype = promoted(tensors);
    Ok(Tensor::from_parts(
        joined.into_iter().map(|x| dtype.cast(x)).collect(),
        shape,
        dtype,
        first.device(),
    ))
}

/**
 * Shape changing operations, joining, splitting and elementwise arithmetic.
 */
impl Tensor {
    /**
     * Returns a tensor with a new shape of the same number of elements, sharing storage.
     */
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        if elements(shape) != self.numel() {
            return Err(TensorDictError::shape(format!(
                "cannot reshape a tensor of shape {:?} to {:?}",
                self.shape(),
                shape
            )));
        }
        Ok(self.with_shape(shape.to_vec()))
    }

    /**
     * Returns a copy of this tensor with its dimensions reordered. `dims[i]` is the source
     * dimension that becomes dimension `i`.
     */
    pub fn permute(&self, dims: &[usize]) -> Result<Tensor> {
        let mut sorted = dims.to_vec();
        sorted.sort_unstable();
        if sorted != (0..self.ndim()).collect::<Vec<usize>>() {
            return Err(TensorDictError::shape(format!(
                "{:?} is not a permutation of the {} dimensions of shape {:?}",
                dims,
                self.ndim(),
                self.shape()
            )));
        }
        let offsets = permute_offsets(self.shape(), dims);
        let data = self.read_data(|data| offsets.iter().map(|&o| data[o]).collect());
        let shape = dims.iter().map(|&d| self.shape()[d]).collect();
        Ok(Tensor::from_parts(data, shape, self.dtype(), self.device()))
    }

    /**
     * Returns a copy of this tensor with two dimensions swapped.
     */
    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<Tensor> {
        let dim0 = normalize_dim(dim0, self.ndim())?;
        let dim1 = normalize_dim(dim1, self.ndim())?;
        let mut dims: Vec<usize> = (0..self.ndim()).collect();
        dims.swap(dim0, dim1);
        self.permute(&dims)
    }

    /**
     * Inserts a dimension of length 1, sharing storage.
     */
    pub fn unsqueeze(&self, dim: isize) -> Result<Tensor> {
        let dim = normalize_dim(dim, self.ndim() + 1)?;
        let mut shape = self.shape().to_vec();
        shape.insert(dim, 1);
        Ok(self.with_shape(shape))
    }

    /**
     * Removes a dimension of length 1, sharing storage.
     */
    pub fn squeeze(&self, dim: isize) -> Result<Tensor> {
        let dim = normalize_dim(dim, self.ndim())?;
        if self.shape()[dim] != 1 {
            return Err(TensorDictError::shape(format!(
                "cannot squeeze dimension {} of length {} in shape {:?}",
                dim,
                self.shape()[dim],
                self.shape()
            )));
        }
        let mut shape = self.shape().to_vec();
        shape.remove(dim);
        Ok(self.with_shape(shape))
    }

    /**
     * Returns a copy of this tensor broadcast to a larger shape.
     */
    pub fn expand(&self, shape: &[usize]) -> Result<Tensor> {
        if shape == self.shape() {
            return Ok(self.clone());
        }
        let offsets = broadcast_offsets(self.shape(), shape)?;
        let data = self.read_data(|data| offsets.iter().map(|&o| data[o]).collect());
        Ok(Tensor::from_parts(data, shape.to_vec(), self.dtype(), self.device()))
    }

    /**
     * Returns a copy of the elements selected by a list of indexes. Dimensions not covered
     * by the indexes are kept whole.
     */
    pub fn index(&self, indexes: &[Index]) -> Result<Tensor> {
        let (shape, offsets) = index_offsets(self.shape(), indexes)?;
        let data = self.read_data(|data| offsets.iter().map(|&o| data[o]).collect());
        Ok(Tensor::from_parts(data, shape, self.dtype(), self.device()))
    }

    /**
     * Writes a value into the elements selected by a list of indexes, in place. The value
     * is broadcast to the shape of the selection.
     */
    pub fn index_put(&self, indexes: &[Index], value: &Tensor) -> Result<()> {
        let (shape, offsets) = index_offsets(self.shape(), indexes)?;
        let source = broadcast_offsets(value.shape(), &shape)?;
        let values: Vec<f64> = value.read_data(|data| source.iter().map(|&o| data[o]).collect());
        let dtype = self.dtype();
        self.write_data(|data| {
            for (offset, value) in offsets.iter().zip(values) {
                data[*offset] = dtype.cast(value);
            }
        });
        Ok(())
    }

    /**
     * Copies the elements of another tensor into this one's storage, broadcasting the
     * source to this tensor's shape.
     */
    pub fn copy_(&self, source: &Tensor) -> Result<()> {
        if self.same_storage(source) && self.shape() == source.shape() {
            return Ok(());
        }
        let offsets = broadcast_offsets(source.shape(), self.shape())?;
        let values: Vec<f64> = source.read_data(|data| offsets.iter().map(|&o| data[o]).collect());
        let dtype = self.dtype();
        self.write_data(|data| {
            for (slot, value) in data.iter_mut().zip(values) {
                *slot = dtype.cast(value);
            }
        });
        Ok(())
    }

    /**
     * Sets every element to a value, in place.
     */
    pub fn fill_(&self, value: f64) {
        let value = self.dtype().cast(value);
        self.write_data(|data| data.iter_mut().for_each(|x| *x = value));
    }

    /**
     * Splits this tensor into pieces of the given lengths along a dimension.
     */
    pub fn split(&self, sizes: &[usize], dim: isize) -> Result<Vec<Tensor>> {
        let dim = normalize_dim(dim, self.ndim())?;
        let total: usize = sizes.iter().sum();
        if total != self.shape()[dim] {
            return Err(TensorDictError::shape(format!(
                "split sizes {:?} do not add up to the length {} of dimension {}",
                sizes,
                self.shape()[dim],
                dim
            )));
        }
        let mut start = 0;
        let mut pieces = Vec::with_capacity(sizes.len());
        for &size in sizes {
            let mut indexes = vec![Index::full(); dim];
            indexes.push(Index::range(start as isize, (start + size) as isize));
            pieces.push(self.index(&indexes)?);
            start += size;
        }
        Ok(pieces)
    }

    /**
     * Removes a dimension, returning each slice along it.
     */
    pub fn unbind(&self, dim: isize) -> Result<Vec<Tensor>> {
        let dim = normalize_dim(dim, self.ndim())?;
        (0..self.shape()[dim])
            .map(|i| {
                let mut indexes = vec![Index::full(); dim];
                indexes.push(Index::At(i as isize));
                self.index(&indexes)
            })
            .collect()
    }

    /**
     * Gathers values along a dimension. The index has the same number of dimensions as this
     * tensor and for each of its elements selects the position along `dim` to read from,
     * keeping the element's position in every other dimension.
     */
    pub fn gather(&self, dim: isize, index: &Tensor) -> Result<Tensor> {
        let dim = normalize_dim(dim, self.ndim())?;
        if index.ndim() != self.ndim()
            || (0..self.ndim()).any(|d| d != dim && index.shape()[d] > self.shape()[d])
        {
            return Err(TensorDictError::shape(format!(
                "cannot gather with an index of shape {:?} from shape {:?} along dimension {}",
                index.shape(),
                self.shape(),
                dim
            )));
        }
        let strides = compute_strides(self.shape());
        let index_strides = compute_strides(index.shape());
        let positions = index.to_vec();
        let length = self.shape()[dim];
        let mut offsets = Vec::with_capacity(positions.len());
        for (n, &position) in positions.iter().enumerate() {
            let position = position as isize;
            let resolved = if position < 0 {
                position + length as isize
            } else {
                position
            };
            if resolved < 0 || resolved >= length as isize {
                return Err(TensorDictError::IndexOutOfRange {
                    index: position,
                    dim,
                    length,
                });
            }
            let mut multi = unflatten(n, &index_strides);
            multi[dim] = resolved as usize;
            offsets.push(multi.iter().zip(strides.iter()).map(|(i, s)| i * s).sum::<usize>());
        }
        let data = self.read_data(|data| offsets.iter().map(|&o| data[o]).collect());
        Ok(Tensor::from_parts(
            data,
            index.shape().to_vec(),
            self.dtype(),
            self.device(),
        ))
    }

    /**
     * Applies a function to every element, returning a new tensor of the same type.
     */
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        let dtype = self.dtype();
        let data = self.read_data(|data| data.iter().map(|&x| dtype.cast(f(x))).collect());
        Tensor::from_parts(data, self.shape().to_vec(), dtype, self.device())
    }

    /**
     * Combines two tensors elementwise after broadcasting them to a common shape. The result
     * has the given dtype.
     */
    pub fn zip_with(
        &self,
        other: &Tensor,
        dtype: DType,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Tensor> {
        let shape = broadcast_shapes(self.shape(), other.shape()).ok_or_else(|| {
            TensorDictError::shape(format!(
                "shapes {:?} and {:?} are not broadcastable",
                self.shape(),
                other.shape()
            ))
        })?;
        let left = broadcast_offsets(self.shape(), &shape)?;
        let right = broadcast_offsets(other.shape(), &shape)?;
        let left_data = self.to_vec();
        let right_data = other.to_vec();
        let data = left
            .iter()
            .zip(right.iter())
            .map(|(&l, &r)| dtype.cast(f(left_data[l], right_data[r])))
            .collect();
        Ok(Tensor::from_parts(data, shape, dtype, self.device()))
    }

    fn arithmetic(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        let dtype = self.dtype().promote(other.dtype()).max(DType::Int64);
        self.zip_with(other, dtype, f)
    }

    pub fn try_add(&self, other: &Tensor) -> Result<Tensor> {
        self.arithmetic(other, |x, y| x + y)
    }

    pub fn try_sub(&self, other: &Tensor) -> Result<Tensor> {
        self.arithmetic(other, |x, y| x - y)
    }

    pub fn try_mul(&self, other: &Tensor) -> Result<Tensor> {
        self.arithmetic(other, |x, y| x * y)
    }

    /**
     * True division, the result is always floating point.
     */
    pub fn try_div(&self, other: &Tensor) -> Result<Tensor> {
        let dtype = self.dtype().promote(other.dtype()).max(DType::Float32);
        self.zip_with(other, dtype, |x, y| x / y)
    }

    /**
     * Elementwise equality as a Bool tensor.
     */
    pub fn eq_elementwise(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, DType::Bool, |x, y| if x == y { 1.0 } else { 0.0 })
    }

    /**
     * Elementwise inequality as a Bool tensor.
     */
    pub fn ne_elementwise(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, DType::Bool, |x, y| if x != y { 1.0 } else { 0.0 })
    }

    pub fn logical_or(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, DType::Bool, |x, y| ((x != 0.0) || (y != 0.0)) as u8 as f64)
    }

    pub fn logical_xor(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, DType::Bool, |x, y| ((x != 0.0) != (y != 0.0)) as u8 as f64)
    }

    pub fn abs(&self) -> Tensor {
        self.map(f64::abs)
    }

    /**
     * True if every element is non zero.
     */
    pub fn all(&self) -> bool {
        self.read_data(|data| data.iter().all(|&x| x != 0.0))
    }

    /**
     * True if any element is non zero.
     */
    pub fn any(&self) -> bool {
        self.read_data(|data| data.iter().any(|&x| x != 0.0))
    }

    pub fn sum(&self) -> f64 {
        self.read_data(|data| data.iter().sum())
    }
}

macro_rules! tensor_operator {
    ($trait:ident, $method:ident, $try:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;

            #[track_caller]
            fn $method(self, rhs: &Tensor) -> Tensor {
                match self.$try(rhs) {
                    Err(error) => panic!("{}", error),
                    Ok(success) => success,
                }
            }
        }

        impl $trait<f64> for &Tensor {
            type Output = Tensor;

            #[track_caller]
            fn $method(self, rhs: f64) -> Tensor {
                match self.$try(&Tensor::scalar(rhs, DType::Float32)) {
                    Err(error) => panic!("{}", error),
                    Ok(success) => success,
                }
            }
        }
    };
}

tensor_operator!(Add, add, try_add);
tensor_operator!(Sub, sub, try_sub);
tensor_operator!(Mul, mul, try_mul);
tensor_operator!(Div, div, try_div);

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        self.map(|x| -x)
    }
}

#[test]
fn stacking_and_concatenating() {
    let a = Tensor::new(vec![1.0, 2.0], [2]);
    let b = Tensor::new(vec![3.0, 4.0], [2]);
    let stacked = stack(&[a.clone(), b.clone()], 1).unwrap();
    assert_eq!(stacked.shape(), &[2, 2]);
    assert_eq!(stacked.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    let joined = cat(&[stacked.clone(), stacked.clone()], 1).unwrap();
    assert_eq!(joined.shape(), &[2, 4]);
    assert_eq!(joined.to_vec(), vec![1.0, 3.0, 1.0, 3.0, 2.0, 4.0, 2.0, 4.0]);
    assert!(stack(&[a, Tensor::zeros([3])], 0).is_err());
}

#[test]
fn writes_through_reshapes_share_storage() {
    let x = Tensor::zeros([2, 3]);
    let flat = x.reshape(&[6]).unwrap();
    flat.index_put(&[Index::At(4)], &Tensor::scalar(7.0, DType::Float32))
        .unwrap();
    assert_eq!(x.get(&[1, 1]), Some(7.0));
    let transposed = x.transpose(0, 1).unwrap();
    assert!(!transposed.same_storage(&x));
    assert_eq!(transposed.get(&[1, 1]), Some(7.0));
}

#[test]
fn gather_selects_along_a_dimension() {
    let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], [2, 2]);
    let index = Tensor::try_with_dtype(vec![1.0, 0.0, 0.0, 0.0], [2, 2], DType::Int64).unwrap();
    let gathered = x.gather(1, &index).unwrap();
    assert_eq!(gathered.to_vec(), vec![2.0, 1.0, 3.0, 3.0]);
    let pieces = x.split(&[1, 1], 0).unwrap();
    assert_eq!(pieces[1].to_vec(), vec![3.0, 4.0]);
    assert_eq!(x.unbind(1).unwrap()[0].to_vec(), vec![1.0, 3.0]);
}
