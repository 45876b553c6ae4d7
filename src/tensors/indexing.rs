/*!
 * # Indexing
 *
 * Tensors and tensordicts are indexed with a list of [`Index`]es, one per dimension consumed,
 * in the same spirit as multi dimensional indexing in array libraries. Integer positions
 * remove a dimension, slices keep it with fewer elements, [`Index::NewAxis`] inserts a
 * dimension of length 1 and [`Index::Ellipsis`] stands for as many full slices as needed.
 *
 * A tensordict applies the same list of indexes to every leaf it holds. Indexes only ever
 * address the batch dimensions, so after the ellipsis is expanded against the batch size any
 * trailing dimensions a leaf has are left untouched.
 *
 * ```
 * use easy_tensordict::tensors::{Index, Tensor};
 * let tensor = Tensor::new((0..12).map(|x| x as f64).collect(), [3, 4]);
 * let row = tensor.index(&[Index::At(-1)]).unwrap();
 * assert_eq!(row.shape(), &[4]);
 * assert_eq!(row.to_vec(), vec![8.0, 9.0, 10.0, 11.0]);
 * let column = tensor.index(&[Index::Ellipsis, Index::At(1)]).unwrap();
 * assert_eq!(column.to_vec(), vec![1.0, 5.0, 9.0]);
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensors::dimensions::{compute_strides, elements, unflatten};

use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/**
 * An index into a single dimension, or a marker that changes how the remaining indexes line
 * up with dimensions.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Index {
    /**
     * A single position, negative positions count from the end. Removes the dimension.
     */
    At(isize),
    /**
     * A range of positions with a positive step. Missing bounds extend to the ends of the
     * dimension, negative bounds count from the end, and bounds past the ends are clamped.
     */
    Slice {
        start: Option<isize>,
        stop: Option<isize>,
        step: usize,
    },
    /**
     * Inserts a new dimension of length 1 without consuming one.
     */
    NewAxis,
    /**
     * Expands to as many full slices as are needed to address every dimension.
     */
    Ellipsis,
    /**
     * An arbitrary list of positions along the dimension.
     */
    Array(Vec<isize>),
    /**
     * A boolean mask the same length as the dimension, selecting the true positions.
     */
    Mask(Vec<bool>),
}

impl Index {
    /**
     * A slice over the whole dimension.
     */
    pub fn full() -> Index {
        Index::Slice {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /**
     * A slice from `start` up to but not including `stop`.
     */
    pub fn range(start: isize, stop: isize) -> Index {
        Index::Slice {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    /**
     * True if this index selects the entire dimension unchanged.
     */
    pub fn is_full(&self) -> bool {
        matches!(
            self,
            Index::Slice {
                start: None | Some(0),
                stop: None,
                step: 1
            }
        )
    }

    fn consumes_dimension(&self) -> bool {
        !matches!(self, Index::NewAxis | Index::Ellipsis)
    }

    fn is_advanced(&self) -> bool {
        matches!(self, Index::Array(_) | Index::Mask(_))
    }
}

impl From<isize> for Index {
    fn from(position: isize) -> Index {
        Index::At(position)
    }
}

impl From<i32> for Index {
    fn from(position: i32) -> Index {
        Index::At(position as isize)
    }
}

impl From<usize> for Index {
    fn from(position: usize) -> Index {
        Index::At(position as isize)
    }
}

impl From<Range<usize>> for Index {
    fn from(range: Range<usize>) -> Index {
        Index::range(range.start as isize, range.end as isize)
    }
}

impl From<RangeFrom<usize>> for Index {
    fn from(range: RangeFrom<usize>) -> Index {
        Index::Slice {
            start: Some(range.start as isize),
            stop: None,
            step: 1,
        }
    }
}

impl From<RangeTo<usize>> for Index {
    fn from(range: RangeTo<usize>) -> Index {
        Index::Slice {
            start: None,
            stop: Some(range.end as isize),
            step: 1,
        }
    }
}

impl From<RangeFull> for Index {
    fn from(_: RangeFull) -> Index {
        Index::full()
    }
}

/**
 * Replaces an ellipsis in the indexes with enough full slices to address `ndim` dimensions,
 * and pads the end with full slices if fewer than `ndim` dimensions are consumed.
 *
 * Returns an error if more than one ellipsis is present or if the indexes consume more
 * dimensions than are available.
 */
pub fn expand_ellipsis(indexes: &[Index], ndim: usize) -> Result<Vec<Index>> {
    let consumed = indexes.iter().filter(|i| i.consumes_dimension()).count();
    if consumed > ndim {
        return Err(TensorDictError::shape(format!(
            "too many indices: {} dimensions indexed but only {} are available",
            consumed, ndim
        )));
    }
    let ellipses = indexes.iter().filter(|i| **i == Index::Ellipsis).count();
    if ellipses > 1 {
        return Err(TensorDictError::shape(
            "an index can only have a single ellipsis",
        ));
    }
    if indexes.iter().filter(|i| i.is_advanced()).count() > 1 {
        return Err(TensorDictError::Unsupported(
            "indexing with more than one array or mask index".to_string(),
        ));
    }
    let mut expanded = Vec::with_capacity(indexes.len() + ndim - consumed);
    for index in indexes {
        if *index == Index::Ellipsis {
            expanded.extend((0..ndim - consumed).map(|_| Index::full()));
        } else {
            expanded.push(index.clone());
        }
    }
    if ellipses == 0 {
        expanded.extend((0..ndim - consumed).map(|_| Index::full()));
    }
    Ok(expanded)
}

/**
 * True if the already expanded indexes leave every dimension unchanged.
 */
pub fn is_noop(indexes: &[Index]) -> bool {
    indexes.iter().all(Index::is_full)
}

// How each index maps onto the source dimensions.
enum Selection {
    // A source dimension pinned to a single position, producing no output dimension.
    Fixed { dim: usize, position: usize },
    // A source dimension producing an output dimension of the listed positions.
    Pick { dim: usize, positions: Vec<usize> },
    // An output dimension of length 1 with no source dimension.
    New,
}

pub(crate) fn resolve_position(position: isize, dim: usize, length: usize) -> Result<usize> {
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
    Ok(resolved as usize)
}

pub(crate) fn slice_positions(
    start: Option<isize>,
    stop: Option<isize>,
    step: usize,
    length: usize,
) -> Result<Vec<usize>> {
    if step == 0 {
        return Err(TensorDictError::shape("slice step cannot be zero"));
    }
    let clamp = |bound: isize| -> usize {
        let resolved = if bound < 0 {
            bound + length as isize
        } else {
            bound
        };
        resolved.clamp(0, length as isize) as usize
    };
    let start = start.map(clamp).unwrap_or(0);
    let stop = stop.map(clamp).unwrap_or(length);
    Ok((start..stop.max(start)).step_by(step).collect())
}

fn selections(shape: &[usize], indexes: &[Index]) -> Result<Vec<Selection>> {
    let indexes = expand_ellipsis(indexes, shape.len())?;
    let mut dim = 0;
    let mut selections = Vec::with_capacity(indexes.len());
    for index in indexes {
        let selection = match index {
            Index::NewAxis => Selection::New,
            Index::Ellipsis => continue,
            Index::At(position) => Selection::Fixed {
                dim,
                position: resolve_position(position, dim, shape[dim])?,
            },
            Index::Slice { start, stop, step } => Selection::Pick {
                dim,
                positions: slice_positions(start, stop, step, shape[dim])?,
            },
            Index::Array(positions) => Selection::Pick {
                dim,
                positions: positions
                    .iter()
                    .map(|&p| resolve_position(p, dim, shape[dim]))
                    .collect::<Result<Vec<usize>>>()?,
            },
            Index::Mask(mask) => {
                if mask.len() != shape[dim] {
                    return Err(TensorDictError::shape(format!(
                        "mask of length {} does not match dimension {} of length {}",
                        mask.len(),
                        dim,
                        shape[dim]
                    )));
                }
                Selection::Pick {
                    dim,
                    positions: mask
                        .iter()
                        .enumerate()
                        .filter(|(_, m)| **m)
                        .map(|(i, _)| i)
                        .collect(),
                }
            }
        };
        if !matches!(selection, Selection::New) {
            dim += 1;
        }
        selections.push(selection);
    }
    Ok(selections)
}

/**
 * Computes the shape that results from indexing a shape, without computing any offsets.
 */
pub fn indexed_shape(shape: &[usize], indexes: &[Index]) -> Result<Vec<usize>> {
    Ok(selections(shape, indexes)?
        .iter()
        .filter_map(|s| match s {
            Selection::Fixed { .. } => None,
            Selection::Pick { positions, .. } => Some(positions.len()),
            Selection::New => Some(1),
        })
        .collect())
}

/**
 * Computes the shape that results from indexing a shape, along with the flat offset into
 * the source of every element of the result in row major order.
 *
 * The same offsets serve both reading (gathering a new tensor) and writing (scattering values
 * into the selected elements of the source).
 */
pub(crate) fn index_offsets(shape: &[usize], indexes: &[Index]) -> Result<(Vec<usize>, Vec<usize>)> {
    let selections = selections(shape, indexes)?;
    let strides = compute_strides(shape);
    let mut base = 0;
    let mut picks = Vec::new();
    let mut output_shape = Vec::new();
    for selection in &selections {
        match selection {
            Selection::Fixed { dim, position } => base += position * strides[*dim],
            Selection::Pick { dim, positions } => {
                output_shape.push(positions.len());
                picks.push(Some((strides[*dim], positions)));
            }
            Selection::New => {
                output_shape.push(1);
                picks.push(None);
            }
        }
    }
    let output_strides = compute_strides(&output_shape);
    let offsets = (0..elements(&output_shape))
        .map(|n| {
            let index = unflatten(n, &output_strides);
            base + index
                .iter()
                .zip(picks.iter())
                .map(|(i, pick)| match pick {
                    Some((stride, positions)) => positions[*i] * stride,
                    None => 0,
                })
                .sum::<usize>()
        })
        .collect();
    Ok((output_shape, offsets))
}

#[test]
fn ellipsis_expands_to_full_slices() {
    let expanded = expand_ellipsis(&[Index::Ellipsis, Index::At(0)], 3).unwrap();
    assert_eq!(expanded, vec![Index::full(), Index::full(), Index::At(0)]);
    let expanded = expand_ellipsis(&[Index::At(0)], 2).unwrap();
    assert_eq!(expanded, vec![Index::At(0), Index::full()]);
    let expanded = expand_ellipsis(&[Index::NewAxis, Index::Ellipsis], 1).unwrap();
    assert_eq!(expanded, vec![Index::NewAxis, Index::full()]);
    assert!(expand_ellipsis(&[Index::Ellipsis, Index::Ellipsis], 2).is_err());
    assert!(expand_ellipsis(&[Index::At(0), Index::At(0)], 1).is_err());
}

#[test]
fn offsets_follow_row_major_order() {
    let (shape, offsets) = index_offsets(&[3, 4], &[Index::range(1, 3), Index::At(-1)]).unwrap();
    assert_eq!(shape, vec![2]);
    assert_eq!(offsets, vec![7, 11]);
    let (shape, offsets) = index_offsets(&[2, 2], &[Index::NewAxis, Index::Mask(vec![false, true])])
        .unwrap();
    assert_eq!(shape, vec![1, 1, 2]);
    assert_eq!(offsets, vec![2, 3]);
    let (shape, offsets) = index_offsets(
        &[5],
        &[Index::Slice {
            start: None,
            stop: None,
            step: 2,
        }],
    )
    .unwrap();
    assert_eq!(shape, vec![3]);
    assert_eq!(offsets, vec![0, 2, 4]);
    assert!(index_offsets(&[2], &[Index::At(2)]).is_err());
}
