/*!
 * Shape operations on the batch dimensions, and indexing.
 *
 * A shape operation such as a reshape or a transpose changes the batch dimensions of a
 * tensordict, and is applied to the leading dimensions of every entry while any trailing
 * dimensions an entry has are left as they are.
 *
 * Every shape operation can run in one of two [modes](ShapeMode). Eager operations build a
 * new tensordict straight away. Lazy operations return a view that keeps the source and the
 * operation, reapplies the operation to the source on every read and maps writes back onto
 * the source through the inverse operation. Viewing a view through its own inverse returns
 * the source again.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensordict::ShapeMode;
 * use easy_tensordict::tensors::Tensor;
 * let td = TensorDict::new([3, 4]);
 * td.set("x", Tensor::zeros([3, 4, 5])).unwrap();
 * let view = td.shaped(ShapeMode::Lazy).transpose(0, 1).unwrap();
 * assert_eq!(view.batch_size(), vec![4, 3]);
 * view.set_("x", Tensor::ones([4, 3, 5])).unwrap();
 * assert!(td.get_tensor("x").unwrap().all());
 * let back = view.shaped(ShapeMode::Lazy).transpose(0, 1).unwrap();
 * assert!(back.ptr_eq(&td));
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensordict::apply::ApplyOptions;
use crate::tensordict::{Body, Layout, Names, Stacked, TensorDict, View};
use crate::tensors::indexing::{
    Index, expand_ellipsis, index_offsets, indexed_shape, is_noop, resolve_position,
};
use crate::tensors::{
    Tensor, broadcast_shapes, elements, has_duplicates, infer_shape, normalize_dim, normalize_dims,
};
use crate::value::Value;

use serde::{Deserialize, Serialize};

/**
 * A change to the batch dimensions of a tensordict, with every dimension already resolved
 * against the batch size it was created for.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShapeOp {
    /**
     * Replaces the leading dimensions `from` with `to`, keeping the element order.
     */
    Reshape { from: Vec<usize>, to: Vec<usize> },
    /**
     * Removes a dimension of length 1.
     */
    Squeeze { dim: usize },
    /**
     * Inserts a dimension of length 1.
     */
    Unsqueeze { dim: usize },
    Transpose { dim0: usize, dim1: usize },
    /**
     * Reorders the leading dimensions, `dims[i]` becoming dimension `i`.
     */
    Permute { dims: Vec<usize> },
    /**
     * Merges the dimensions `start..=end`, which had the given sizes.
     */
    Flatten {
        start: usize,
        end: usize,
        sizes: Vec<usize>,
    },
    /**
     * Splits a dimension into several of the given sizes.
     */
    Unflatten { dim: usize, sizes: Vec<usize> },
}

impl ShapeOp {
    /**
     * The operation that undoes this one.
     */
    pub fn inverse(&self) -> ShapeOp {
        match self {
            ShapeOp::Reshape { from, to } => ShapeOp::Reshape {
                from: to.clone(),
                to: from.clone(),
            },
            ShapeOp::Squeeze { dim } => ShapeOp::Unsqueeze { dim: *dim },
            ShapeOp::Unsqueeze { dim } => ShapeOp::Squeeze { dim: *dim },
            ShapeOp::Transpose { dim0, dim1 } => ShapeOp::Transpose {
                dim0: *dim0,
                dim1: *dim1,
            },
            ShapeOp::Permute { dims } => {
                let mut inverse = vec![0; dims.len()];
                for (i, &d) in dims.iter().enumerate() {
                    inverse[d] = i;
                }
                ShapeOp::Permute { dims: inverse }
            }
            ShapeOp::Flatten { start, sizes, .. } => ShapeOp::Unflatten {
                dim: *start,
                sizes: sizes.clone(),
            },
            ShapeOp::Unflatten { dim, sizes } => ShapeOp::Flatten {
                start: *dim,
                end: dim + sizes.len() - 1,
                sizes: sizes.clone(),
            },
        }
    }

    /**
     * The permutation of `ndim` dimensions this operation performs, if it only reorders
     * dimensions.
     */
    pub fn permutation(&self, ndim: usize) -> Option<Vec<usize>> {
        match self {
            ShapeOp::Transpose { dim0, dim1 } => {
                let mut dims: Vec<usize> = (0..ndim).collect();
                dims.swap(*dim0, *dim1);
                Some(dims)
            }
            ShapeOp::Permute { dims } => {
                let mut full = dims.clone();
                full.extend(dims.len()..ndim);
                Some(full)
            }
            _ => None,
        }
    }

    /**
     * Applies this operation to the leading dimensions of a shape.
     */
    pub fn apply_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        match self {
            ShapeOp::Reshape { from, to } => {
                if !shape.starts_with(from) {
                    return Err(TensorDictError::shape(format!(
                        "cannot reshape the leading dimensions {:?} of shape {:?}",
                        from, shape
                    )));
                }
                let mut result = to.clone();
                result.extend_from_slice(&shape[from.len()..]);
                Ok(result)
            }
            ShapeOp::Squeeze { dim } => {
                self.check_rank(shape, dim + 1)?;
                if shape[*dim] != 1 {
                    return Err(TensorDictError::shape(format!(
                        "cannot squeeze dimension {} of length {} in shape {:?}",
                        dim, shape[*dim], shape
                    )));
                }
                let mut result = shape.to_vec();
                result.remove(*dim);
                Ok(result)
            }
            ShapeOp::Unsqueeze { dim } => {
                self.check_rank(shape, *dim)?;
                let mut result = shape.to_vec();
                result.insert(*dim, 1);
                Ok(result)
            }
            ShapeOp::Transpose { dim0, dim1 } => {
                self.check_rank(shape, dim0.max(dim1) + 1)?;
                let mut result = shape.to_vec();
                result.swap(*dim0, *dim1);
                Ok(result)
            }
            ShapeOp::Permute { dims } => {
                self.check_rank(shape, dims.len())?;
                let mut result: Vec<usize> = dims.iter().map(|&d| shape[d]).collect();
                result.extend_from_slice(&shape[dims.len()..]);
                Ok(result)
            }
            ShapeOp::Flatten { start, end, sizes } => {
                self.check_rank(shape, end + 1)?;
                if shape[*start..=*end] != sizes[..] {
                    return Err(TensorDictError::shape(format!(
                        "cannot flatten dimensions {} to {} of shape {:?}, expected sizes {:?}",
                        start, end, shape, sizes
                    )));
                }
                let mut result = shape[..*start].to_vec();
                result.push(elements(sizes));
                result.extend_from_slice(&shape[end + 1..]);
                Ok(result)
            }
            ShapeOp::Unflatten { dim, sizes } => {
                self.check_rank(shape, dim + 1)?;
                if shape[*dim] != elements(sizes) {
                    return Err(TensorDictError::shape(format!(
                        "cannot unflatten dimension {} of length {} into sizes {:?}",
                        dim, shape[*dim], sizes
                    )));
                }
                let mut result = shape[..*dim].to_vec();
                result.extend_from_slice(sizes);
                result.extend_from_slice(&shape[dim + 1..]);
                Ok(result)
            }
        }
    }

    fn check_rank(&self, shape: &[usize], needed: usize) -> Result<()> {
        if shape.len() < needed {
            return Err(TensorDictError::shape(format!(
                "{:?} cannot be applied to a shape of {} dimensions {:?}",
                self,
                shape.len(),
                shape
            )));
        }
        Ok(())
    }

    pub fn apply_tensor(&self, tensor: &Tensor) -> Result<Tensor> {
        match self.permutation(tensor.ndim()) {
            Some(dims) => {
                self.apply_shape(tensor.shape())?;
                tensor.permute(&dims)
            }
            None => tensor.reshape(&self.apply_shape(tensor.shape())?),
        }
    }

    /**
     * The names of the batch dimensions after this operation. Dimensions that are created
     * or merged lose their names.
     */
    pub fn apply_names(&self, names: Option<&Names>) -> Option<Names> {
        let names = names?;
        let result: Names = match self {
            ShapeOp::Reshape { from, to } => {
                if from == to {
                    names.clone()
                } else {
                    let mut result = vec![None; to.len()];
                    result.extend(names.iter().skip(from.len()).cloned());
                    result
                }
            }
            ShapeOp::Squeeze { dim } => {
                let mut result = names.clone();
                if *dim < result.len() {
                    result.remove(*dim);
                }
                result
            }
            ShapeOp::Unsqueeze { dim } => {
                let mut result = names.clone();
                result.insert((*dim).min(result.len()), None);
                result
            }
            ShapeOp::Transpose { .. } | ShapeOp::Permute { .. } => self
                .permutation(names.len())?
                .iter()
                .map(|&d| names.get(d).cloned().flatten())
                .collect(),
            ShapeOp::Flatten { start, end, .. } => {
                let mut result: Names = names.iter().take(*start).cloned().collect();
                result.push(None);
                result.extend(names.iter().skip(end + 1).cloned());
                result
            }
            ShapeOp::Unflatten { dim, sizes } => {
                let mut result: Names = names.iter().take(*dim).cloned().collect();
                result.extend(sizes.iter().map(|_| None));
                result.extend(names.iter().skip(dim + 1).cloned());
                result
            }
        };
        result.iter().any(Option::is_some).then_some(result)
    }

    /**
     * Applies this operation to a value straight away.
     */
    pub fn apply_value(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::Tensor(tensor) => Value::Tensor(self.apply_tensor(tensor)?),
            Value::Dict(td) => Value::Dict(td.apply_shape_op(self)?),
            Value::NonTensor(data) => {
                Value::NonTensor(data.with_batch_size(self.apply_shape(data.batch_size())?))
            }
            Value::NonTensorStack(stack) => {
                let batch_size = self.apply_shape(stack.batch_size())?;
                match self.permutation(stack.batch_size().len()) {
                    Some(dims) => Value::NonTensorStack(stack.permute(&dims)),
                    None => stack.reshape(batch_size)?,
                }
            }
        })
    }

    /**
     * Applies this operation to a value read through a view. Nested containers become views
     * themselves so that writes into them reach the source.
     */
    pub fn view_value(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Dict(td) => Ok(Value::Dict(lazy_view(td, self.clone())?)),
            other => self.apply_value(other),
        }
    }
}

/**
 * Whether shape operations build a new tensordict or a view of the source.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeMode {
    #[default]
    Eager,
    Lazy,
}

pub(crate) fn lazy_view(source: &TensorDict, op: ShapeOp) -> Result<TensorDict> {
    if let Layout::View(view) = source.layout() {
        if view.inverse == op {
            return Ok(view.source);
        }
    }
    let batch_size = op.apply_shape(&source.batch_size())?;
    Ok(TensorDict::from_body(Body::View(View {
        source: source.clone(),
        inverse: op.inverse(),
        op,
        batch_size,
    })))
}

/**
 * Shape operations on a tensordict in a chosen [`ShapeMode`], created by
 * [`TensorDict::shaped`].
 *
 * Every operation checks the requested change against the batch size and returns an error
 * naming the offending dimension before any entry is touched.
 */
pub struct Shaper<'a> {
    td: &'a TensorDict,
    mode: ShapeMode,
}

impl Shaper<'_> {
    fn run(&self, op: ShapeOp) -> Result<TensorDict> {
        match self.mode {
            ShapeMode::Eager => self.td.apply_shape_op(&op),
            ShapeMode::Lazy => lazy_view(self.td, op),
        }
    }

    /**
     * Changes the batch size to one with the same number of elements. A single -1 is
     * inferred from the others.
     */
    pub fn reshape(&self, shape: &[isize]) -> Result<TensorDict> {
        let from = self.td.batch_size();
        let to = infer_shape(shape, elements(&from))?;
        self.run(ShapeOp::Reshape { from, to })
    }

    /**
     * The same as [`reshape`](Shaper::reshape).
     */
    pub fn view(&self, shape: &[isize]) -> Result<TensorDict> {
        self.reshape(shape)
    }

    /**
     * Removes a batch dimension of length 1, or every batch dimension of length 1 if no
     * dimension is given.
     */
    pub fn squeeze(&self, dim: Option<isize>) -> Result<TensorDict> {
        let batch_size = self.td.batch_size();
        match dim {
            Some(dim) => {
                let dim = normalize_dim(dim, batch_size.len())?;
                if batch_size[dim] != 1 {
                    return Err(TensorDictError::shape(format!(
                        "cannot squeeze batch dimension {} of length {} in batch size {:?}",
                        dim, batch_size[dim], batch_size
                    )));
                }
                self.run(ShapeOp::Squeeze { dim })
            }
            None => {
                let mut current = self.td.clone();
                for dim in (0..batch_size.len()).rev().filter(|&d| batch_size[d] == 1) {
                    current = current.shaped(self.mode).run(ShapeOp::Squeeze { dim })?;
                }
                Ok(current)
            }
        }
    }

    pub fn unsqueeze(&self, dim: isize) -> Result<TensorDict> {
        let dim = normalize_dim(dim, self.td.batch_dims() + 1)?;
        self.run(ShapeOp::Unsqueeze { dim })
    }

    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<TensorDict> {
        let batch_dims = self.td.batch_dims();
        let dim0 = normalize_dim(dim0, batch_dims)?;
        let dim1 = normalize_dim(dim1, batch_dims)?;
        self.run(ShapeOp::Transpose {
            dim0: dim0.min(dim1),
            dim1: dim0.max(dim1),
        })
    }

    /**
     * Reorders the batch dimensions, `dims[i]` becoming dimension `i`. Every batch
     * dimension must be named exactly once.
     */
    pub fn permute(&self, dims: &[isize]) -> Result<TensorDict> {
        let batch_dims = self.td.batch_dims();
        let dims = normalize_dims(dims, batch_dims)?;
        if dims.len() != batch_dims || has_duplicates(&dims) {
            return Err(TensorDictError::shape(format!(
                "{:?} is not a permutation of {} batch dimensions",
                dims, batch_dims
            )));
        }
        self.run(ShapeOp::Permute { dims })
    }

    /**
     * Merges the batch dimensions from `start` to `end` inclusive into one.
     */
    pub fn flatten(&self, start: isize, end: isize) -> Result<TensorDict> {
        let batch_size = self.td.batch_size();
        let start = normalize_dim(start, batch_size.len())?;
        let end = normalize_dim(end, batch_size.len())?;
        if start > end {
            return Err(TensorDictError::shape(format!(
                "cannot flatten from dimension {} to the earlier dimension {}",
                start, end
            )));
        }
        self.run(ShapeOp::Flatten {
            start,
            end,
            sizes: batch_size[start..=end].to_vec(),
        })
    }

    /**
     * Splits a batch dimension into several. A single -1 in the sizes is inferred.
     */
    pub fn unflatten(&self, dim: isize, sizes: &[isize]) -> Result<TensorDict> {
        let batch_size = self.td.batch_size();
        let dim = normalize_dim(dim, batch_size.len())?;
        if sizes.is_empty() {
            return Err(TensorDictError::shape("cannot unflatten into no dimensions"));
        }
        let sizes = infer_shape(sizes, batch_size[dim])?;
        self.run(ShapeOp::Unflatten { dim, sizes })
    }
}

impl TensorDict {
    /**
     * Shape operations in a chosen mode. The shape methods directly on a tensordict are
     * eager.
     */
    pub fn shaped(&self, mode: ShapeMode) -> Shaper<'_> {
        Shaper { td: self, mode }
    }

    pub fn reshape(&self, shape: &[isize]) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).reshape(shape)
    }

    pub fn view(&self, shape: &[isize]) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).view(shape)
    }

    pub fn squeeze(&self, dim: Option<isize>) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).squeeze(dim)
    }

    /**
     * Inserts a batch dimension of length 1.
     *
     * ```
     * use easy_tensordict::TensorDict;
     * use easy_tensordict::tensors::Tensor;
     * let td = TensorDict::new([3, 4]);
     * td.set("x", Tensor::zeros([3, 4, 5])).unwrap();
     * let unsqueezed = td.unsqueeze(-2).unwrap();
     * assert_eq!(unsqueezed.batch_size(), vec![3, 1, 4]);
     * assert_eq!(unsqueezed.get_tensor("x").unwrap().shape(), &[3, 1, 4, 5]);
     * ```
     */
    pub fn unsqueeze(&self, dim: isize) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).unsqueeze(dim)
    }

    pub fn transpose(&self, dim0: isize, dim1: isize) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).transpose(dim0, dim1)
    }

    pub fn permute(&self, dims: &[isize]) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).permute(dims)
    }

    pub fn flatten(&self, start: isize, end: isize) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).flatten(start, end)
    }

    pub fn unflatten(&self, dim: isize, sizes: &[isize]) -> Result<TensorDict> {
        self.shaped(ShapeMode::Eager).unflatten(dim, sizes)
    }

    /**
     * Builds a new tensordict with a shape operation applied to every entry.
     */
    pub fn apply_shape_op(&self, op: &ShapeOp) -> Result<TensorDict> {
        let batch_size = op.apply_shape(&self.batch_size())?;
        let names = op.apply_names(self.names().as_ref());
        let result = TensorDict::from_dense(batch_size, self.device(), names);
        for (key, value) in self.items()? {
            result.put_entry(&key, op.apply_value(&value)?);
        }
        Ok(result)
    }

    /**
     * Indexes the batch dimensions of every entry. Trailing dimensions of the entries are
     * kept whole.
     *
     * An index that selects everything returns this same tensordict rather than a copy.
     * Indexing a lazy stack along its stack dimension selects members, so the result still
     * writes through to them.
     */
    pub fn index(&self, index: &[Index]) -> Result<TensorDict> {
        let indexes = expand_ellipsis(index, self.batch_dims())?;
        if is_noop(&indexes) {
            return Ok(self.clone());
        }
        match self.layout() {
            Layout::Dense => {
                let batch_size = indexed_shape(&self.batch_size(), &indexes)?;
                let names = indexed_names(self.names(), &indexes);
                let result = TensorDict::from_dense(batch_size, self.device(), names);
                for (key, value) in self.items()? {
                    result.put_entry(&key, value.index_batch(&indexes)?);
                }
                Ok(result)
            }
            Layout::Stacked(stacked) => self.index_stacked(stacked, &indexes),
            Layout::View(_) => self.to_tensordict()?.index(&indexes),
        }
    }

    fn index_stacked(&self, stacked: Stacked, indexes: &[Index]) -> Result<TensorDict> {
        let mut dim = 0;
        let mut out_dim = 0;
        let mut found = None;
        for (i, index) in indexes.iter().enumerate() {
            match index {
                Index::NewAxis => out_dim += 1,
                Index::Ellipsis => {}
                _ => {
                    if dim == stacked.stack_dim {
                        found = Some((i, out_dim));
                        break;
                    }
                    dim += 1;
                    if !matches!(index, Index::At(_)) {
                        out_dim += 1;
                    }
                }
            }
        }
        let Some((position, new_dim)) = found else {
            return self.to_tensordict()?.index(indexes);
        };
        let mut rest = indexes.to_vec();
        let selector = rest.remove(position);
        let count = stacked.tensordicts.len();
        match selector {
            Index::At(i) => {
                let i = resolve_position(i, stacked.stack_dim, count)?;
                stacked.tensordicts[i].index(&rest)
            }
            selector => {
                let (_, selected) = index_offsets(&[count], &[selector])?;
                if selected.is_empty() {
                    return self.to_tensordict()?.index(indexes);
                }
                let members = selected
                    .iter()
                    .map(|&i| stacked.tensordicts[i].index(&rest))
                    .collect::<Result<Vec<_>>>()?;
                TensorDict::lazy_stack(&members, new_dim as isize)
            }
        }
    }

    /**
     * Writes every leaf of another tensordict into the part of this one selected by an
     * index, see [`update_at_`](TensorDict::update_at_).
     */
    pub fn set_index(&self, index: &[Index], value: &TensorDict) -> Result<()> {
        self.update_at_(value, index)
    }

    /**
     * Broadcasts the batch dimensions to a larger batch size. Existing dimensions must
     * either match or have length 1.
     */
    pub fn expand(&self, shape: &[usize]) -> Result<TensorDict> {
        let batch_size = self.batch_size();
        if shape.len() < batch_size.len()
            || broadcast_shapes(&batch_size, shape).as_deref() != Some(shape)
        {
            return Err(TensorDictError::shape(format!(
                "cannot expand a tensordict of batch size {:?} to {:?}",
                batch_size, shape
            )));
        }
        let batch_dims = batch_size.len();
        let target = shape.to_vec();
        let options = ApplyOptions::new().batch_size(target.clone());
        self.apply_values(&[], options, |value, _| match value {
            Value::Tensor(tensor) => {
                let mut expanded = target.clone();
                expanded.extend_from_slice(&tensor.shape()[batch_dims..]);
                Ok(Some(Value::Tensor(tensor.expand(&expanded)?)))
            }
            other => Ok(Some(other.clone())),
        })
    }

    /**
     * Gathers entries along a batch dimension. The index has one dimension per batch
     * dimension and becomes the new batch size, and is broadcast over the trailing
     * dimensions of each entry.
     */
    pub fn gather(&self, dim: isize, index: &Tensor) -> Result<TensorDict> {
        let batch_dims = self.batch_dims();
        let dim = normalize_dim(dim, batch_dims)?;
        if index.ndim() != batch_dims {
            return Err(TensorDictError::shape(format!(
                "the index of a gather must have {} dimensions, got shape {:?}",
                batch_dims,
                index.shape()
            )));
        }
        let new_batch = index.shape().to_vec();
        let options = ApplyOptions::new().batch_size(new_batch.clone());
        self.apply_values(&[], options, |value, _| match value {
            Value::Tensor(tensor) => {
                let trailing = &tensor.shape()[batch_dims..];
                let mut unit = new_batch.clone();
                unit.extend(trailing.iter().map(|_| 1));
                let mut expanded = new_batch.clone();
                expanded.extend_from_slice(trailing);
                let index = index.reshape(&unit)?.expand(&expanded)?;
                Ok(Some(Value::Tensor(tensor.gather(dim as isize, &index)?)))
            }
            other => Ok(Some(other.clone())),
        })
    }

    /**
     * Removes a batch dimension, returning each slice along it. Unbinding a lazy stack
     * along its stack dimension returns its members.
     */
    pub fn unbind(&self, dim: isize) -> Result<Vec<TensorDict>> {
        let dim = normalize_dim(dim, self.batch_dims())?;
        if let Layout::Stacked(stacked) = self.layout() {
            if stacked.stack_dim == dim {
                return Ok(stacked.tensordicts);
            }
        }
        let length = self.batch_size()[dim];
        (0..length)
            .map(|i| {
                let mut indexes = vec![Index::full(); dim];
                indexes.push(Index::At(i as isize));
                self.index(&indexes)
            })
            .collect()
    }

    /**
     * Splits along a batch dimension into pieces of `split_size`, the last piece being
     * smaller if the length does not divide evenly.
     */
    pub fn split(&self, split_size: usize, dim: isize) -> Result<Vec<TensorDict>> {
        if split_size == 0 {
            return Err(TensorDictError::shape("split size must be positive"));
        }
        let dim = normalize_dim(dim, self.batch_dims())?;
        let length = self.batch_size()[dim];
        let sections: Vec<usize> = (0..length)
            .step_by(split_size)
            .map(|start| split_size.min(length - start))
            .collect();
        self.split_sections(&sections, dim as isize)
    }

    /**
     * Splits along a batch dimension into pieces of the given lengths, which must add up to
     * the length of the dimension.
     */
    pub fn split_sections(&self, sections: &[usize], dim: isize) -> Result<Vec<TensorDict>> {
        let dim = normalize_dim(dim, self.batch_dims())?;
        let length = self.batch_size()[dim];
        if sections.iter().sum::<usize>() != length {
            return Err(TensorDictError::shape(format!(
                "split sections {:?} do not add up to the length {} of batch dimension {}",
                sections, length, dim
            )));
        }
        let mut start = 0;
        let mut pieces = Vec::with_capacity(sections.len());
        for &size in sections {
            let mut indexes = vec![Index::full(); dim];
            indexes.push(Index::range(start as isize, (start + size) as isize));
            pieces.push(self.index(&indexes)?);
            start += size;
        }
        Ok(pieces)
    }

    /**
     * Splits along a batch dimension into at most `chunks` pieces of equal length, the last
     * piece being smaller if the length does not divide evenly.
     */
    pub fn chunk(&self, chunks: usize, dim: isize) -> Result<Vec<TensorDict>> {
        if chunks == 0 {
            return Err(TensorDictError::shape("number of chunks must be positive"));
        }
        let dim = normalize_dim(dim, self.batch_dims())?;
        let length = self.batch_size()[dim];
        if length == 0 {
            return Ok(vec![self.clone()]);
        }
        self.split(length.div_ceil(chunks), dim as isize)
    }
}

// The names left after indexing. Integer positions remove their dimension and new axes
// are unnamed.
fn indexed_names(names: Option<Names>, indexes: &[Index]) -> Option<Names> {
    let names = names?;
    let mut result = Vec::with_capacity(names.len());
    let mut dim = 0;
    for index in indexes {
        match index {
            Index::NewAxis => result.push(None),
            Index::Ellipsis => {}
            Index::At(_) => dim += 1,
            _ => {
                result.push(names.get(dim).cloned().flatten());
                dim += 1;
            }
        }
    }
    result.iter().any(Option::is_some).then_some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TensorDict {
        let td = TensorDict::new([2, 3]);
        td.set("x", Tensor::new((0..24).map(|x| x as f64).collect(), [2, 3, 4]))
            .unwrap();
        td.set(("n", "y"), Tensor::new((0..6).map(|x| x as f64).collect(), [2, 3]))
            .unwrap();
        td.set_non_tensor("text", "hi").unwrap();
        td
    }

    #[test]
    fn inverses_round_trip() {
        let ops = vec![
            ShapeOp::Reshape {
                from: vec![2, 3],
                to: vec![6],
            },
            ShapeOp::Unsqueeze { dim: 1 },
            ShapeOp::Transpose { dim0: 0, dim1: 1 },
            ShapeOp::Permute { dims: vec![1, 0] },
            ShapeOp::Flatten {
                start: 0,
                end: 1,
                sizes: vec![2, 3],
            },
        ];
        let td = sample();
        for op in ops {
            let forward = td.apply_shape_op(&op).unwrap();
            let back = forward.apply_shape_op(&op.inverse()).unwrap();
            assert_eq!(back.batch_size(), td.batch_size());
            assert_eq!(back, td);
        }
    }

    #[test]
    fn eager_operations_reshape_every_entry() {
        let td = sample();
        let flat = td.flatten(0, 1).unwrap();
        assert_eq!(flat.batch_size(), vec![6]);
        assert_eq!(flat.get_tensor("x").unwrap().shape(), &[6, 4]);
        assert_eq!(flat.get(("n", "y")).unwrap().shape(), vec![6]);
        assert_eq!(flat.get("text").unwrap().shape(), vec![6]);
        let unflat = flat.unflatten(0, &[-1, 3]).unwrap();
        assert_eq!(unflat, td);
        let permuted = td.permute(&[1, 0]).unwrap();
        assert_eq!(permuted.get_tensor("x").unwrap().get(&[2, 1, 0]), Some(20.0));
        assert!(td.squeeze(Some(0)).is_err());
        assert_eq!(td.unsqueeze(0).unwrap().squeeze(None).unwrap().batch_size(), vec![2, 3]);
        assert!(td.reshape(&[4, -1]).is_err());
        assert!(td.transpose(0, 2).is_err());
    }

    #[test]
    fn names_follow_shape_operations() {
        let td = sample();
        td.rename_(Some(vec![Some("a".to_string()), Some("b".to_string())]))
            .unwrap();
        let transposed = td.transpose(0, 1).unwrap();
        assert_eq!(
            transposed.names(),
            Some(vec![Some("b".to_string()), Some("a".to_string())])
        );
        assert_eq!(td.flatten(0, 1).unwrap().names(), None);
        assert_eq!(
            td.unsqueeze(0).unwrap().names(),
            Some(vec![None, Some("a".to_string()), Some("b".to_string())])
        );
        assert_eq!(
            td.index(&[Index::At(0)]).unwrap().names(),
            Some(vec![Some("b".to_string())])
        );
    }

    #[test]
    fn full_indexes_return_the_same_container() {
        let td = sample();
        assert!(td.index(&[Index::Ellipsis]).unwrap().ptr_eq(&td));
        assert!(td.index(&[Index::full(), Index::full()]).unwrap().ptr_eq(&td));
        let row = td.index(&[Index::At(1), Index::range(0, 2)]).unwrap();
        assert_eq!(row.batch_size(), vec![2]);
        assert_eq!(row.get_tensor(("n", "y")).unwrap().to_vec(), vec![3.0, 4.0]);
        let masked = td.index(&[Index::Mask(vec![false, true])]).unwrap();
        assert_eq!(masked.batch_size(), vec![1, 3]);
    }

    #[test]
    fn lazy_views_write_back() {
        let td = sample();
        let view = td.shaped(ShapeMode::Lazy).reshape(&[6]).unwrap();
        assert!(view.is_view());
        assert_eq!(view.get_tensor("x").unwrap().shape(), &[6, 4]);
        view.set_at_("x", Tensor::zeros([4]), &[Index::At(5)]).unwrap();
        assert_eq!(td.get_tensor("x").unwrap().get(&[1, 2, 3]), Some(0.0));
        let nested = view.get_dict("n").unwrap();
        assert!(nested.is_view());
        nested.set_("y", Tensor::ones([6])).unwrap();
        assert_eq!(td.get_tensor(("n", "y")).unwrap().to_vec(), vec![1.0; 6]);
        assert!(view.set_batch_size([6]).is_err());
        assert_eq!(view.to_tensordict().unwrap().batch_size(), vec![6]);
    }

    #[test]
    fn splitting_along_the_batch() {
        let td = sample();
        let pieces = td.split(2, 1).unwrap();
        assert_eq!(
            pieces.iter().map(TensorDict::batch_size).collect::<Vec<_>>(),
            vec![vec![2, 2], vec![2, 1]]
        );
        assert!(td.split_sections(&[1, 1], 1).is_err());
        assert_eq!(td.chunk(2, 0).unwrap().len(), 2);
        let rows = td.unbind(0).unwrap();
        assert_eq!(rows[1].get_tensor(("n", "y")).unwrap().to_vec(), vec![3.0, 4.0, 5.0]);
        let expanded = td.index(&[Index::At(0)]).unwrap().unsqueeze(0).unwrap().expand(&[4, 3]).unwrap();
        assert_eq!(expanded.get_tensor("x").unwrap().shape(), &[4, 3, 4]);
        let index = Tensor::new(vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0], [2, 3]);
        let gathered = td.gather(0, &index).unwrap();
        assert_eq!(gathered.get_tensor(("n", "y")).unwrap().to_vec(), vec![3.0, 1.0, 2.0, 0.0, 4.0, 5.0]);
    }
}
