/*!
 * Writing tensordicts to disk and reading them back.
 *
 * Every container is written to its own directory:
 *
 * - `meta.json` records the type of the container under `_type`, its batch size and
 *   device, and the metadata of every entry in order.
 * - Every tensor is written to `<key>.memmap` as its elements in row major order, each a
 *   little endian `f64`.
 * - Every nested container, and every piece of non-tensor data, is written to a
 *   subdirectory named by its key. Non-tensor data keeps JSON payloads in its
 *   `meta.json` and writes binary payloads to a sibling `data.bin`. Opaque object payloads
 *   only exist in memory and can not be written.
 * - A lazy stack writes each member to a subdirectory named by its position.
 *
 * Reading a directory back looks up a loader for the `_type` its `meta.json` records.
 * Loaders for the types of this crate are always present, and more can be added with
 * [`register_loader`]. A directory of any other type is an
 * [`UnregisteredType`](TensorDictError::UnregisteredType) error.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::tensors::Tensor;
 * let dir = tempfile::tempdir().unwrap();
 * let td = TensorDict::new([2]);
 * td.set(("a", "b"), Tensor::new(vec![1.0, 2.0], [2])).unwrap();
 * td.set_non_tensor("text", "hello").unwrap();
 * let saved = td.memmap(dir.path()).unwrap();
 * assert!(saved.is_memmap());
 * assert!(saved.is_locked());
 * let loaded = TensorDict::load_memmap(dir.path()).unwrap();
 * assert_eq!(loaded, td);
 * ```
 */

use crate::config::Config;
use crate::errors::{Result, TensorDictError};
use crate::keys::ValueKind;
use crate::nontensor::{NonTensorData, NonTensorStack, Payload};
use crate::tensordict::{Names, TensorDict};
use crate::tensors::{DType, Device, Tensor, elements};
use crate::value::Value;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::thread::JoinHandle;

pub const TENSORDICT_TYPE: &str = "TensorDict";
pub const LAZY_STACK_TYPE: &str = "LazyStackedTensorDict";
pub const NON_TENSOR_TYPE: &str = "NonTensorData";
pub const NON_TENSOR_STACK_TYPE: &str = "NonTensorStack";

const META_FILE: &str = "meta.json";
const BINARY_FILE: &str = "data.bin";

/**
 * Reads a value from the directory it was written to, given the parsed contents of its
 * `meta.json`.
 */
pub type Loader = fn(&Path, &serde_json::Value) -> Result<Value>;

static LOADERS: LazyLock<RwLock<HashMap<String, Loader>>> = LazyLock::new(|| {
    let mut loaders: HashMap<String, Loader> = HashMap::new();
    loaders.insert(TENSORDICT_TYPE.to_string(), load_dict);
    loaders.insert(LAZY_STACK_TYPE.to_string(), load_lazy_stack);
    loaders.insert(NON_TENSOR_TYPE.to_string(), load_non_tensor);
    loaders.insert(NON_TENSOR_STACK_TYPE.to_string(), load_non_tensor_stack);
    RwLock::new(loaders)
});

/**
 * Registers the loader for directories whose `meta.json` records a type, replacing any
 * loader previously registered for it.
 */
pub fn register_loader(type_tag: impl Into<String>, loader: Loader) {
    let type_tag = type_tag.into();
    debug!(type_tag = %type_tag, "registered a loader");
    LOADERS.write().insert(type_tag, loader);
}

/**
 * Reads whatever was written to a directory, dispatching on the type its `meta.json`
 * records.
 */
pub fn load_value(path: &Path) -> Result<Value> {
    let meta: serde_json::Value = serde_json::from_slice(&fs::read(path.join(META_FILE))?)?;
    let type_tag = meta
        .get("_type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("<missing>")
        .to_string();
    let loader = LOADERS.read().get(&type_tag).copied();
    match loader {
        Some(loader) => loader(path, &meta),
        None => Err(TensorDictError::UnregisteredType(type_tag)),
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EntryMeta {
    Tensor {
        key: String,
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    },
    Directory {
        key: String,
    },
}

#[derive(Serialize, Deserialize)]
struct DictMeta {
    #[serde(rename = "_type")]
    type_tag: String,
    batch_size: Vec<usize>,
    #[serde(default)]
    device: Option<Device>,
    #[serde(default)]
    names: Option<Names>,
    entries: Vec<EntryMeta>,
}

#[derive(Serialize, Deserialize)]
struct LazyStackMeta {
    #[serde(rename = "_type")]
    type_tag: String,
    stack_dim: usize,
    members: usize,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredPayload {
    Json(serde_json::Value),
    // The name of the sibling file holding the bytes.
    Binary(String),
}

#[derive(Serialize, Deserialize)]
struct NonTensorMeta {
    #[serde(rename = "_type")]
    type_tag: String,
    batch_size: Vec<usize>,
    #[serde(default)]
    device: Option<Device>,
    data: StoredPayload,
}

#[derive(Serialize, Deserialize)]
struct NonTensorStackMeta {
    #[serde(rename = "_type")]
    type_tag: String,
    batch_size: Vec<usize>,
    #[serde(default)]
    device: Option<Device>,
    items: Vec<StoredPayload>,
}

// A tensor waiting to be written, copied out of its storage when the write was planned.
struct Blob {
    path: PathBuf,
    data: Vec<f64>,
}

impl Blob {
    fn write(&self) -> Result<()> {
        let bytes: Vec<u8> = self.data.iter().flat_map(|x| x.to_le_bytes()).collect();
        fs::write(&self.path, &bytes)?;
        trace!(path = %self.path.display(), bytes = bytes.len(), "wrote tensor");
        Ok(())
    }
}

fn read_blob(path: &Path, shape: &[usize]) -> Result<Vec<f64>> {
    let bytes = fs::read(path)?;
    let expected = elements(shape) * 8;
    if bytes.len() != expected {
        return Err(TensorDictError::shape(format!(
            "{} holds {} bytes but a tensor of shape {:?} needs {}",
            path.display(),
            bytes.len(),
            shape,
            expected
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            f64::from_le_bytes(le)
        })
        .collect())
}

fn check_file_name(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key == META_FILE
        || key.contains('/')
        || key.contains('\\');
    if invalid {
        return Err(TensorDictError::InvalidKey(format!(
            "the key {:?} can not be written to disk as a file name",
            key
        )));
    }
    Ok(())
}

fn write_meta(dir: &Path, meta: &impl Serialize) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(meta)?)?;
    Ok(())
}

fn store_payload(dir: &Path, payload: &Payload, file_name: &str) -> Result<StoredPayload> {
    match payload {
        Payload::Json(json) => Ok(StoredPayload::Json(json.clone())),
        Payload::Binary(bytes) => {
            fs::write(dir.join(file_name), bytes)?;
            Ok(StoredPayload::Binary(file_name.to_string()))
        }
        Payload::Object(_) => Err(TensorDictError::Unsupported(format!(
            "cannot write an opaque object payload to {}, only JSON and binary payloads can be \
             persisted",
            dir.display()
        ))),
    }
}

fn read_payload(dir: &Path, stored: &StoredPayload) -> Result<Payload> {
    match stored {
        StoredPayload::Json(json) => Ok(Payload::Json(json.clone())),
        StoredPayload::Binary(file_name) => Ok(Payload::Binary(fs::read(dir.join(file_name))?)),
    }
}

// Writes the metadata of a container and everything nested in it, collecting the tensors
// to write afterwards.
fn plan(td: &TensorDict, dir: &Path, blobs: &mut Vec<Blob>) -> Result<()> {
    match td.kind() {
        ValueKind::LazyStack => {
            let members = td.tensordicts().unwrap_or_default();
            for (i, member) in members.iter().enumerate() {
                plan(member, &dir.join(i.to_string()), blobs)?;
            }
            write_meta(
                dir,
                &LazyStackMeta {
                    type_tag: LAZY_STACK_TYPE.to_string(),
                    stack_dim: td.stack_dim().unwrap_or(0),
                    members: members.len(),
                },
            )
        }
        ValueKind::View => plan(&td.to_tensordict()?, dir, blobs),
        _ => {
            fs::create_dir_all(dir)?;
            let mut entries = Vec::new();
            for (key, value) in td.items()? {
                check_file_name(&key)?;
                match value {
                    Value::Tensor(tensor) => {
                        blobs.push(Blob {
                            path: dir.join(format!("{}.memmap", key)),
                            data: tensor.to_vec(),
                        });
                        entries.push(EntryMeta::Tensor {
                            key,
                            shape: tensor.shape().to_vec(),
                            dtype: tensor.dtype(),
                            device: tensor.device(),
                        });
                    }
                    Value::Dict(nested) => {
                        plan(&nested, &dir.join(&key), blobs)?;
                        entries.push(EntryMeta::Directory { key });
                    }
                    Value::NonTensor(data) => {
                        let nested = dir.join(&key);
                        fs::create_dir_all(&nested)?;
                        let meta = NonTensorMeta {
                            type_tag: NON_TENSOR_TYPE.to_string(),
                            batch_size: data.batch_size().to_vec(),
                            device: data.device(),
                            data: store_payload(&nested, data.data(), BINARY_FILE)?,
                        };
                        write_meta(&nested, &meta)?;
                        entries.push(EntryMeta::Directory { key });
                    }
                    Value::NonTensorStack(stack) => {
                        let nested = dir.join(&key);
                        fs::create_dir_all(&nested)?;
                        let items = stack
                            .items()
                            .iter()
                            .enumerate()
                            .map(|(i, item)| store_payload(&nested, item, &format!("data_{}.bin", i)))
                            .collect::<Result<Vec<_>>>()?;
                        let meta = NonTensorStackMeta {
                            type_tag: NON_TENSOR_STACK_TYPE.to_string(),
                            batch_size: stack.batch_size().to_vec(),
                            device: stack.device(),
                            items,
                        };
                        write_meta(&nested, &meta)?;
                        entries.push(EntryMeta::Directory { key });
                    }
                }
            }
            write_meta(
                dir,
                &DictMeta {
                    type_tag: TENSORDICT_TYPE.to_string(),
                    batch_size: td.batch_size(),
                    device: td.device(),
                    names: td.names(),
                    entries,
                },
            )
        }
    }
}

fn write_blobs(blobs: Vec<Blob>, num_threads: usize) -> Result<()> {
    if num_threads == 0 {
        return blobs.iter().try_for_each(Blob::write);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|error| TensorDictError::Worker(error.to_string()))?;
    pool.install(|| blobs.par_iter().try_for_each(Blob::write))
}

fn load_dict(dir: &Path, meta: &serde_json::Value) -> Result<Value> {
    let meta: DictMeta = serde_json::from_value(meta.clone())?;
    let td = TensorDict::with_device(meta.batch_size, meta.device);
    for entry in meta.entries {
        match entry {
            EntryMeta::Tensor {
                key,
                shape,
                dtype,
                device,
            } => {
                let data = read_blob(&dir.join(format!("{}.memmap", key)), &shape)?;
                td.set(key, Tensor::from_parts(data, shape, dtype, device))?;
            }
            EntryMeta::Directory { key } => {
                let value = load_value(&dir.join(&key))?;
                td.set(key, value)?;
            }
        }
    }
    if meta.names.is_some() {
        td.rename_(meta.names)?;
    }
    Ok(Value::Dict(td))
}

fn load_lazy_stack(dir: &Path, meta: &serde_json::Value) -> Result<Value> {
    let meta: LazyStackMeta = serde_json::from_value(meta.clone())?;
    let members = (0..meta.members)
        .map(|i| load_value(&dir.join(i.to_string()))?.into_dict())
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Dict(TensorDict::lazy_stack(
        &members,
        meta.stack_dim as isize,
    )?))
}

fn load_non_tensor(dir: &Path, meta: &serde_json::Value) -> Result<Value> {
    let meta: NonTensorMeta = serde_json::from_value(meta.clone())?;
    let payload = read_payload(dir, &meta.data)?;
    Ok(Value::NonTensor(
        NonTensorData::new(payload, meta.batch_size).with_device(meta.device),
    ))
}

fn load_non_tensor_stack(dir: &Path, meta: &serde_json::Value) -> Result<Value> {
    let meta: NonTensorStackMeta = serde_json::from_value(meta.clone())?;
    let items = meta
        .items
        .iter()
        .map(|item| read_payload(dir, item))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::NonTensorStack(
        NonTensorStack::from_items(items, meta.batch_size)?.with_device(meta.device),
    ))
}

/**
 * Options for [`memmap_with`](TensorDict::memmap_with).
 */
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemmapOptions {
    /**
     * The number of threads writing tensors, 0 writing them on the calling thread.
     */
    pub num_threads: usize,
    /**
     * Return as soon as the metadata is written, leaving the tensors to be written in the
     * background.
     */
    pub return_early: bool,
}

impl MemmapOptions {
    pub fn from_config(config: &Config) -> MemmapOptions {
        MemmapOptions {
            num_threads: config.memmap.num_threads,
            return_early: config.memmap.return_early,
        }
    }
}

/**
 * A tensordict being written to disk, returned by
 * [`memmap_with`](TensorDict::memmap_with).
 */
pub struct MemmapFuture {
    prefix: PathBuf,
    writer: Option<JoinHandle<Result<()>>>,
}

impl MemmapFuture {
    /**
     * True once every tensor has been written.
     */
    pub fn is_done(&self) -> bool {
        self.writer
            .as_ref()
            .is_none_or(|writer| writer.is_finished())
    }

    /**
     * Waits for every tensor to be written, then reads the tensordict back from disk.
     */
    pub fn wait(self) -> Result<TensorDict> {
        if let Some(writer) = self.writer {
            writer
                .join()
                .map_err(|_| TensorDictError::Worker("the memmap writer panicked".to_string()))??;
        }
        TensorDict::load_memmap(&self.prefix)
    }
}

impl TensorDict {
    /**
     * Writes this tensordict to a directory and returns the copy read back from it, which
     * is locked and marked as memory mapped.
     */
    pub fn memmap(&self, prefix: impl AsRef<Path>) -> Result<TensorDict> {
        self.memmap_with(prefix, MemmapOptions::default())?.wait()
    }

    /**
     * The same as [`memmap`](TensorDict::memmap).
     */
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<TensorDict> {
        self.memmap(prefix)
    }

    /**
     * Writes this tensordict to a directory, spreading the tensor writes over a pool of
     * threads and optionally returning before they finish.
     *
     * The metadata is always written before this returns, and the tensors are copied when
     * this is called, so later writes to this tensordict do not reach the disk.
     */
    pub fn memmap_with(
        &self,
        prefix: impl AsRef<Path>,
        options: MemmapOptions,
    ) -> Result<MemmapFuture> {
        let prefix = prefix.as_ref().to_path_buf();
        let mut blobs = Vec::new();
        plan(self, &prefix, &mut blobs)?;
        debug!(
            path = %prefix.display(),
            tensors = blobs.len(),
            num_threads = options.num_threads,
            return_early = options.return_early,
            "writing tensordict to disk"
        );
        if options.return_early {
            let num_threads = options.num_threads;
            let writer = std::thread::spawn(move || write_blobs(blobs, num_threads));
            return Ok(MemmapFuture {
                prefix,
                writer: Some(writer),
            });
        }
        write_blobs(blobs, options.num_threads)?;
        Ok(MemmapFuture {
            prefix,
            writer: None,
        })
    }

    /**
     * Writes this tensordict to a directory, then marks it as memory mapped and locks it.
     * Later in place writes reach the disk with [`sync_memmap`](TensorDict::sync_memmap).
     */
    pub fn memmap_(&self, prefix: impl AsRef<Path>) -> Result<&TensorDict> {
        let prefix = prefix.as_ref().to_path_buf();
        let mut blobs = Vec::new();
        plan(self, &prefix, &mut blobs)?;
        write_blobs(blobs, 0)?;
        self.mark_memmap(prefix);
        Ok(self)
    }

    /**
     * Reads a tensordict from a directory written by [`memmap`](TensorDict::memmap). The
     * result is locked and marked as memory mapped.
     */
    pub fn load_memmap(prefix: impl AsRef<Path>) -> Result<TensorDict> {
        let prefix = prefix.as_ref().to_path_buf();
        let td = load_value(&prefix)?.into_dict()?;
        debug!(path = %prefix.display(), "loaded tensordict from disk");
        td.mark_memmap(prefix);
        Ok(td)
    }

    /**
     * Writes the current contents of a memory mapped tensordict back to its directory.
     */
    pub fn sync_memmap(&self) -> Result<()> {
        let prefix = self.read().lock.saved_path.clone().ok_or_else(|| {
            TensorDictError::Unsupported(
                "cannot sync a tensordict that was not written to disk, call memmap_ first"
                    .to_string(),
            )
        })?;
        let mut blobs = Vec::new();
        plan(self, &prefix, &mut blobs)?;
        write_blobs(blobs, 0)
    }

    /**
     * The directory this tensordict was written to or read from, if any.
     */
    pub fn saved_path(&self) -> Option<PathBuf> {
        self.read().lock.saved_path.clone()
    }

    fn mark_memmap(&self, prefix: PathBuf) {
        for td in self.subtree() {
            td.write().lock.memmap = true;
        }
        self.write().lock.saved_path = Some(prefix);
        self.lock_();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_are_little_endian_f64() {
        let dir = tempfile::tempdir().unwrap();
        let blob = Blob {
            path: dir.path().join("x.memmap"),
            data: vec![1.5, -2.0],
        };
        blob.write().unwrap();
        let bytes = fs::read(&blob.path).unwrap();
        assert_eq!(&bytes[..8], &1.5f64.to_le_bytes());
        assert_eq!(read_blob(&blob.path, &[2]).unwrap(), vec![1.5, -2.0]);
        assert!(read_blob(&blob.path, &[3]).is_err());
    }

    #[test]
    fn unusable_file_names_are_rejected() {
        assert!(check_file_name("obs").is_ok());
        assert!(check_file_name("a/b").is_err());
        assert!(check_file_name("..").is_err());
        assert!(check_file_name(META_FILE).is_err());
    }

    #[test]
    fn unknown_types_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), r#"{"_type": "Mystery"}"#).unwrap();
        match TensorDict::load_memmap(dir.path()) {
            Err(TensorDictError::UnregisteredType(name)) => assert_eq!(name, "Mystery"),
            other => panic!("expected an unregistered type, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn registered_loaders_are_used() {
        fn load_constant(_: &Path, _: &serde_json::Value) -> Result<Value> {
            let td = TensorDict::new([]);
            td.set("constant", 7.0)?;
            Ok(Value::Dict(td))
        }
        register_loader("Constant", load_constant);
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(META_FILE), r#"{"_type": "Constant"}"#).unwrap();
        let td = TensorDict::load_memmap(dir.path()).unwrap();
        assert_eq!(td.get_tensor("constant").unwrap().item(), Some(7.0));
    }

    #[test]
    fn object_payloads_can_not_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let td = TensorDict::new([]);
        td.set_non_tensor("object", Payload::object(5_u32)).unwrap();
        assert!(matches!(
            td.memmap(dir.path()),
            Err(TensorDictError::Unsupported(_))
        ));
    }
}
