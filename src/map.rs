/*!
 * Chunked data parallel mapping over a batch dimension.
 *
 * [`TensorDict::map`] splits a tensordict into chunks along one batch dimension, calls a
 * function on every chunk from a pool of worker threads, and puts the results back
 * together in the order the chunks were taken, whichever worker finishes first.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::map::MapOptions;
 * use easy_tensordict::tensors::Tensor;
 * let td = TensorDict::new([6]);
 * td.set("x", Tensor::new(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], [6])).unwrap();
 * let doubled = td
 *     .map(|chunk| TensorDict::mul(&chunk, 2.0), MapOptions::new().chunksize(2))
 *     .unwrap();
 * assert_eq!(
 *     doubled.get_tensor("x").unwrap().to_vec(),
 *     vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]
 * );
 * ```
 */

use crate::config::Config;
use crate::errors::{Result, TensorDictError};
use crate::tensordict::TensorDict;
use crate::tensors::{Index, normalize_dim};

use rayon::prelude::*;
use tracing::debug;

/**
 * Options for [`TensorDict::map`], built up from [`MapOptions::new`].
 *
 * Chunks are `chunksize` long if that is set, otherwise the dimension is split into
 * `num_chunks` chunks, falling back to one chunk per worker.
 */
#[derive(Clone, Debug, Default)]
pub struct MapOptions {
    pub(crate) dim: isize,
    pub(crate) num_workers: Option<usize>,
    pub(crate) chunksize: Option<usize>,
    pub(crate) num_chunks: Option<usize>,
    pub(crate) out: Option<TensorDict>,
}

impl MapOptions {
    pub fn new() -> MapOptions {
        MapOptions::default()
    }

    /**
     * Takes the number of workers and chunk size from a [`Config`].
     */
    pub fn from_config(config: &Config) -> MapOptions {
        MapOptions {
            num_workers: config.map.num_workers,
            chunksize: config.map.chunksize,
            ..MapOptions::default()
        }
    }

    /**
     * The batch dimension to split along, 0 by default.
     */
    pub fn dim(mut self, dim: isize) -> MapOptions {
        self.dim = dim;
        self
    }

    /**
     * The number of worker threads. Without one the size of rayon's global pool is used.
     */
    pub fn num_workers(mut self, num_workers: usize) -> MapOptions {
        self.num_workers = Some(num_workers);
        self
    }

    pub fn chunksize(mut self, chunksize: usize) -> MapOptions {
        self.chunksize = Some(chunksize);
        self
    }

    pub fn num_chunks(mut self, num_chunks: usize) -> MapOptions {
        self.num_chunks = Some(num_chunks);
        self
    }

    /**
     * A tensordict to write each result into, at the slice its chunk was taken from.
     * Only existing entries are written to, so `out` may be locked, shared or memory
     * mapped.
     */
    pub fn out(mut self, out: TensorDict) -> MapOptions {
        self.out = Some(out);
        self
    }
}

impl TensorDict {
    /**
     * Calls a function on chunks of this tensordict in parallel and concatenates the
     * results along the dimension they were split on, or writes them into
     * [`MapOptions::out`] and returns that.
     *
     * The first error returned by any chunk is returned as a
     * [`Worker`](TensorDictError::Worker) error naming the chunk. Chunks already running
     * are left to finish.
     */
    pub fn map<F>(&self, f: F, options: MapOptions) -> Result<TensorDict>
    where
        F: Fn(TensorDict) -> Result<TensorDict> + Send + Sync,
    {
        let dim = normalize_dim(options.dim, self.batch_dims())?;
        let length = self.batch_size()[dim];
        let num_workers = options
            .num_workers
            .unwrap_or_else(rayon::current_num_threads)
            .max(1);
        let chunks = match (options.chunksize, options.num_chunks) {
            (Some(chunksize), _) => self.split(chunksize, dim as isize)?,
            (None, Some(num_chunks)) => self.chunk(num_chunks, dim as isize)?,
            (None, None) => self.chunk(num_workers, dim as isize)?,
        };
        let lengths: Vec<usize> = chunks.iter().map(|chunk| chunk.batch_size()[dim]).collect();
        debug!(
            length,
            dim,
            chunks = chunks.len(),
            num_workers,
            "mapping over tensordict chunks"
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .map_err(|error| TensorDictError::Worker(error.to_string()))?;
        // collect on an indexed parallel iterator keeps the order chunks were taken in
        let results = pool.install(|| {
            chunks
                .into_par_iter()
                .enumerate()
                .map(|(i, chunk)| {
                    debug!(chunk = i, "dispatching chunk");
                    f(chunk).map_err(|error| {
                        TensorDictError::Worker(format!("chunk {} failed: {}", i, error))
                    })
                })
                .collect::<Result<Vec<TensorDict>>>()
        })?;
        match options.out {
            Some(out) => {
                let mut start = 0;
                for (result, length) in results.iter().zip(lengths) {
                    let mut indexes = vec![Index::full(); dim];
                    indexes.push(Index::range(start as isize, (start + length) as isize));
                    out.set_index(&indexes, result)?;
                    start += length;
                }
                Ok(out)
            }
            None => TensorDict::cat(&results, dim as isize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    fn sample(length: usize) -> TensorDict {
        let td = TensorDict::new([length]);
        let data: Vec<f64> = (0..length * 2).map(|x| x as f64).collect();
        td.set("x", Tensor::new(data, [length, 2])).unwrap();
        td.set(("nested", "y"), Tensor::arange(length)).unwrap();
        td
    }

    #[test]
    fn results_keep_chunk_order() {
        let td = sample(7);
        let mapped = td
            .map(
                |chunk| TensorDict::add(&chunk, 1.0),
                MapOptions::new().num_workers(3).chunksize(2),
            )
            .unwrap();
        assert_eq!(mapped.batch_size(), vec![7]);
        assert_eq!(
            mapped.get_tensor(("nested", "y")).unwrap().to_vec(),
            (1..=7).map(|x| x as f64).collect::<Vec<_>>()
        );
    }

    #[test]
    fn writing_into_a_locked_output() {
        let td = sample(5);
        let out = td.deep_clone();
        out.zero_().unwrap();
        out.lock_();
        let returned = td
            .map(
                |chunk| TensorDict::mul(&chunk, 10.0),
                MapOptions::new().num_chunks(2).out(out.clone()),
            )
            .unwrap();
        assert!(returned.ptr_eq(&out));
        assert_eq!(out.get_tensor(("nested", "y")).unwrap().to_vec(), vec![
            0.0, 10.0, 20.0, 30.0, 40.0
        ]);
    }

    #[test]
    fn worker_errors_name_the_chunk() {
        let td = sample(4);
        let result = td.map(
            |chunk| {
                if chunk.get_tensor(("nested", "y"))?.to_vec()[0] >= 2.0 {
                    chunk.get("missing")?;
                }
                Ok(chunk)
            },
            MapOptions::new().chunksize(2),
        );
        match result {
            Err(TensorDictError::Worker(message)) => assert!(message.starts_with("chunk 1")),
            other => panic!("expected a worker error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn mapping_needs_a_batch_dimension() {
        let td = TensorDict::new([]);
        assert!(td.map(Ok, MapOptions::new()).is_err());
    }
}
