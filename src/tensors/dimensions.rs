/*!
 * Utilities to manipulate dimensions.
 *
 * Contains a number of utility functions for manipulating the shapes of tensors and the batch
 * sizes of tensordicts.
 *
 * # Terminology
 *
 * A **shape** is a list of lengths, one per dimension, stored in row major order. A tensor
 * with some shape will have data ranging from 0 to the length - 1 along each dimension.
 * A 0 dimensional shape describes exactly one element.
 *
 * Dimensions are usually given to public APIs as `isize` so that negative dimensions can count
 * backwards from the last dimension, `-1` being the last. Such dimensions are resolved against
 * the number of dimensions available with [`normalize_dim`] before use.
 */

use crate::errors::{Result, TensorDictError};

/**
 * Returns the product of the provided dimension lengths
 *
 * This is equal to the number of elements that will be stored for this shape.
 * A 0 dimensional tensor stores exactly 1 element, a 1 dimensional tensor stores N elements,
 * a 2 dimensional tensor stores NxM elements and so on.
 */
pub fn elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/**
 * Computes the row major strides of a shape, such that the flat offset of an index is the
 * sum of each index multiplied by its stride.
 */
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for d in (0..shape.len()).rev() {
        strides[d] = stride;
        stride *= shape[d].max(1);
    }
    strides
}

// Converts a flat offset back into an index in each dimension, given the strides of the shape
// the offset was computed from.
pub(crate) fn unflatten(nth: usize, strides: &[usize]) -> Vec<usize> {
    let mut steps_remaining = nth;
    let mut index = vec![0; strides.len()];
    for d in 0..strides.len() {
        let stride = strides[d];
        // If the stride was 20, then 0-19 for indexes would be 0, 20-39 would be 1
        // and so on
        index[d] = steps_remaining / stride;
        // Given such a stride of 20, we then need to look at what was rounded off
        steps_remaining %= stride;
    }
    index
}

/**
 * Resolves a possibly negative dimension against a number of dimensions.
 *
 * Returns an error naming the dimension if it is out of range.
 */
pub fn normalize_dim(dim: isize, ndim: usize) -> Result<usize> {
    let resolved = if dim < 0 { dim + ndim as isize } else { dim };
    if resolved < 0 || resolved >= ndim as isize {
        return Err(TensorDictError::InvalidDimension { dim, ndim });
    }
    Ok(resolved as usize)
}

/**
 * Resolves a list of possibly negative dimensions, checking that they are all distinct.
 */
pub fn normalize_dims(dims: &[isize], ndim: usize) -> Result<Vec<usize>> {
    let resolved = dims
        .iter()
        .map(|&d| normalize_dim(d, ndim))
        .collect::<Result<Vec<usize>>>()?;
    if has_duplicates(&resolved) {
        return Err(TensorDictError::shape(format!(
            "dimensions {:?} contain duplicates",
            dims
        )));
    }
    Ok(resolved)
}

/**
 * Returns true if the list contains any element more than once.
 */
pub fn has_duplicates<T: PartialEq>(list: &[T]) -> bool {
    for i in 1..list.len() {
        if list[..i].contains(&list[i]) {
            return true;
        }
    }
    false
}

/**
 * Resolves a requested shape which may contain a single `-1` placeholder into a concrete
 * shape with the given number of elements.
 */
pub fn infer_shape(requested: &[isize], numel: usize) -> Result<Vec<usize>> {
    let mut inferred = None;
    let mut known = 1usize;
    for (d, &length) in requested.iter().enumerate() {
        if length == -1 {
            if inferred.is_some() {
                return Err(TensorDictError::shape(format!(
                    "only one dimension can be inferred in {:?}",
                    requested
                )));
            }
            inferred = Some(d);
        } else if length < 0 {
            return Err(TensorDictError::shape(format!(
                "invalid length {} in {:?}",
                length, requested
            )));
        } else {
            known *= length as usize;
        }
    }
    let mut shape: Vec<usize> = requested.iter().map(|&l| l.max(0) as usize).collect();
    match inferred {
        Some(d) => {
            if known == 0 || numel % known != 0 {
                return Err(TensorDictError::shape(format!(
                    "shape {:?} is invalid for {} elements",
                    requested, numel
                )));
            }
            shape[d] = numel / known;
        }
        None => {
            if known != numel {
                return Err(TensorDictError::shape(format!(
                    "shape {:?} is invalid for {} elements",
                    requested, numel
                )));
            }
        }
    }
    Ok(shape)
}

/**
 * Computes the shape two shapes broadcast to, aligning them from their last dimension.
 *
 * Returns None if the shapes are not broadcastable.
 */
pub fn broadcast_shapes(left: &[usize], right: &[usize]) -> Option<Vec<usize>> {
    let ndim = left.len().max(right.len());
    let mut shape = vec![0; ndim];
    for d in 0..ndim {
        let l = if d < ndim - left.len() {
            1
        } else {
            left[d - (ndim - left.len())]
        };
        let r = if d < ndim - right.len() {
            1
        } else {
            right[d - (ndim - right.len())]
        };
        shape[d] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(shape)
}

// For each element of the target shape, the offset of the element in a source of the given
// shape that broadcasts to it.
pub(crate) fn broadcast_offsets(source: &[usize], target: &[usize]) -> Result<Vec<usize>> {
    if source.len() > target.len() {
        return Err(TensorDictError::shape(format!(
            "cannot broadcast shape {:?} to {:?}",
            source, target
        )));
    }
    let padding = target.len() - source.len();
    let source_strides = compute_strides(source);
    let mut strides = vec![0; target.len()];
    for d in 0..source.len() {
        let length = source[d];
        let wanted = target[d + padding];
        if length == wanted {
            strides[d + padding] = source_strides[d];
        } else if length != 1 {
            return Err(TensorDictError::shape(format!(
                "cannot broadcast shape {:?} to {:?}",
                source, target
            )));
        }
    }
    let target_strides = compute_strides(target);
    Ok((0..elements(target))
        .map(|n| {
            unflatten(n, &target_strides)
                .iter()
                .zip(strides.iter())
                .map(|(i, s)| i * s)
                .sum()
        })
        .collect())
}

// For each element of the permuted shape, the offset of that element in the source.
pub(crate) fn permute_offsets(source: &[usize], dims: &[usize]) -> Vec<usize> {
    let source_strides = compute_strides(source);
    let permuted: Vec<usize> = dims.iter().map(|&d| source[d]).collect();
    let permuted_strides = compute_strides(&permuted);
    (0..elements(&permuted))
        .map(|n| {
            unflatten(n, &permuted_strides)
                .iter()
                .zip(dims.iter())
                .map(|(i, &d)| i * source_strides[d])
                .sum()
        })
        .collect()
}

#[test]
fn unflatten_produces_indices_in_n_dimensions() {
    let strides = compute_strides(&[2, 2]);
    assert_eq!(vec![0, 0], unflatten(0, &strides));
    assert_eq!(vec![0, 1], unflatten(1, &strides));
    assert_eq!(vec![1, 0], unflatten(2, &strides));
    assert_eq!(vec![1, 1], unflatten(3, &strides));

    let strides = compute_strides(&[3, 2]);
    assert_eq!(vec![1, 1], unflatten(3, &strides));
    assert_eq!(vec![2, 0], unflatten(4, &strides));

    let strides = compute_strides(&[2, 3, 1]);
    assert_eq!(vec![0, 1, 0], unflatten(1, &strides));
    assert_eq!(vec![1, 2, 0], unflatten(5, &strides));
}

#[test]
fn negative_dimensions_count_from_the_end() {
    assert_eq!(normalize_dim(-1, 3).unwrap(), 2);
    assert_eq!(normalize_dim(0, 3).unwrap(), 0);
    assert!(normalize_dim(3, 3).is_err());
    assert!(normalize_dim(-4, 3).is_err());
    assert!(normalize_dims(&[0, -3], 3).is_err());
}

#[test]
fn shapes_are_inferred_and_broadcast() {
    assert_eq!(infer_shape(&[-1, 4], 12).unwrap(), vec![3, 4]);
    assert!(infer_shape(&[-1, 5], 12).is_err());
    assert!(infer_shape(&[-1, -1], 12).is_err());
    assert_eq!(broadcast_shapes(&[3, 1], &[4]), Some(vec![3, 4]));
    assert_eq!(broadcast_shapes(&[3, 2], &[4]), None);
    assert_eq!(broadcast_offsets(&[1, 2], &[2, 2]).unwrap(), vec![0, 1, 0, 1]);
    assert_eq!(permute_offsets(&[2, 3], &[1, 0]), vec![0, 3, 1, 4, 2, 5]);
}
