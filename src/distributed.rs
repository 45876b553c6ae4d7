/*!
 * Point to point transfer of tensordicts between workers.
 *
 * Sending and receiving walk the leaves of a tensordict in sorted key order, recursing into
 * nested containers in place, and give every tensor its own tag. Both sides must walk
 * tensordicts with the same keys and agree on the first tag and on whether tags are
 * pseudo random, otherwise tensors arrive at the wrong keys.
 *
 * The wire itself is a [`Transport`]. [`LocalTransport`] connects workers within one
 * process.
 *
 * ```
 * use easy_tensordict::TensorDict;
 * use easy_tensordict::distributed::LocalTransport;
 * use easy_tensordict::tensors::Tensor;
 * let mut workers = LocalTransport::group(2).into_iter();
 * let (first, second) = (workers.next().unwrap(), workers.next().unwrap());
 * let sent = TensorDict::new([2]);
 * sent.set(("a", "b"), Tensor::new(vec![1.0, 2.0], [2])).unwrap();
 * sent.set("c", Tensor::ones([2, 3])).unwrap();
 * let sender = std::thread::spawn(move || sent.send(&first, 1, 0, false).unwrap());
 * let received = TensorDict::new([2]);
 * received.set(("a", "b"), Tensor::zeros([2])).unwrap();
 * received.set("c", Tensor::zeros([2, 3])).unwrap();
 * let last_tag = received.recv(&second, 0, 0, false).unwrap();
 * assert_eq!(sender.join().unwrap(), last_tag);
 * assert_eq!(received.get_tensor("c").unwrap().sum(), 6.0);
 * ```
 */

use crate::errors::{Result, TensorDictError};
use crate::tensordict::TensorDict;
use crate::tensors::Tensor;
use crate::value::Value;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/**
 * Moves tensors between workers identified by their rank.
 */
pub trait Transport {
    /**
     * Sends a tensor to the worker of rank `dst`, marked with a tag.
     */
    fn send(&self, tensor: &Tensor, dst: usize, tag: i64) -> Result<()>;

    /**
     * Receives the tensor the worker of rank `src` sent with a tag. The received tensor
     * must have the shape of `like`.
     */
    fn recv(&self, like: &Tensor, src: usize, tag: i64) -> Result<Tensor>;
}

/**
 * The tag following the previous one. Pseudo random tags are a deterministic function of
 * the previous tag, so both sides of a transfer produce the same sequence.
 */
fn next_tag(previous: i64, pseudo_rand: bool) -> Result<i64> {
    let following = previous.checked_add(1).ok_or_else(|| {
        TensorDictError::Transport(format!("no tag follows {}, the tags are exhausted", previous))
    })?;
    if pseudo_rand {
        let mut generator = StdRng::seed_from_u64(following as u64);
        Ok(generator.random_range(0..i64::MAX))
    } else {
        Ok(following)
    }
}

// The tag before the first one, from which next_tag counts.
fn before_first(init_tag: i64) -> Result<i64> {
    init_tag.checked_sub(1).ok_or_else(|| {
        TensorDictError::Transport(format!("the initial tag must be above {}", init_tag))
    })
}

impl TensorDict {
    /**
     * Sends every tensor to the worker of rank `dst`, returning the last tag used. The
     * first tensor is tagged `init_tag` unless `pseudo_rand` is set.
     *
     * Non-tensor data can not be sent, and sequential tags may not run past `i64::MAX`.
     */
    pub fn send(
        &self,
        transport: &impl Transport,
        dst: usize,
        init_tag: i64,
        pseudo_rand: bool,
    ) -> Result<i64> {
        self.send_from(transport, dst, before_first(init_tag)?, pseudo_rand)
    }

    fn send_from(
        &self,
        transport: &impl Transport,
        dst: usize,
        mut tag: i64,
        pseudo_rand: bool,
    ) -> Result<i64> {
        for key in self.sorted_keys() {
            match self.get_local(&key)? {
                Value::Tensor(tensor) => {
                    tag = next_tag(tag, pseudo_rand)?;
                    debug!(key = %key, dst, tag, "sending tensor");
                    transport.send(&tensor, dst, tag)?;
                }
                Value::Dict(nested) => {
                    tag = nested.send_from(transport, dst, tag, pseudo_rand)?;
                }
                other => return Err(unsendable(&key, &other)),
            }
        }
        Ok(tag)
    }

    /**
     * Receives every tensor from the worker of rank `src`, writing each into the existing
     * entry at its key, and returns the last tag used. `init_tag` and `pseudo_rand` must
     * match what the sender used.
     */
    pub fn recv(
        &self,
        transport: &impl Transport,
        src: usize,
        init_tag: i64,
        pseudo_rand: bool,
    ) -> Result<i64> {
        self.recv_from(transport, src, before_first(init_tag)?, pseudo_rand)
    }

    fn recv_from(
        &self,
        transport: &impl Transport,
        src: usize,
        mut tag: i64,
        pseudo_rand: bool,
    ) -> Result<i64> {
        for key in self.sorted_keys() {
            match self.get_local(&key)? {
                Value::Tensor(tensor) => {
                    tag = next_tag(tag, pseudo_rand)?;
                    debug!(key = %key, src, tag, "receiving tensor");
                    let received = transport.recv(&tensor, src, tag)?;
                    self.set_inplace(key.as_str(), received)?;
                }
                Value::Dict(nested) => {
                    tag = nested.recv_from(transport, src, tag, pseudo_rand)?;
                }
                other => return Err(unsendable(&key, &other)),
            }
        }
        Ok(tag)
    }
}

fn unsendable(key: &str, value: &Value) -> TensorDictError {
    TensorDictError::Unsupported(format!(
        "cannot transfer the {} at key {:?}, only tensors and tensordicts can be sent",
        value.kind(),
        key
    ))
}

// Tensors in flight, keyed by (src, dst, tag).
#[derive(Default)]
struct Mailbox {
    messages: Mutex<HashMap<(usize, usize, i64), VecDeque<Tensor>>>,
    delivered: Condvar,
}

/**
 * A transport between workers of the same process, typically one per thread.
 *
 * Sending never blocks. Receiving blocks until the matching tensor arrives or the timeout
 * passes.
 */
#[derive(Clone)]
pub struct LocalTransport {
    rank: usize,
    world_size: usize,
    timeout: Duration,
    mailbox: Arc<Mailbox>,
}

impl LocalTransport {
    /**
     * Creates connected transports for the workers of ranks 0 to `world_size - 1`.
     */
    pub fn group(world_size: usize) -> Vec<LocalTransport> {
        let mailbox = Arc::new(Mailbox::default());
        (0..world_size)
            .map(|rank| LocalTransport {
                rank,
                world_size,
                timeout: Duration::from_secs(30),
                mailbox: mailbox.clone(),
            })
            .collect()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> LocalTransport {
        self.timeout = timeout;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.world_size {
            return Err(TensorDictError::Transport(format!(
                "rank {} is out of range for a group of {} workers",
                rank, self.world_size
            )));
        }
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn send(&self, tensor: &Tensor, dst: usize, tag: i64) -> Result<()> {
        self.check_rank(dst)?;
        let mut messages = self.mailbox.messages.lock();
        messages
            .entry((self.rank, dst, tag))
            .or_default()
            .push_back(tensor.deep_clone());
        self.mailbox.delivered.notify_all();
        Ok(())
    }

    fn recv(&self, like: &Tensor, src: usize, tag: i64) -> Result<Tensor> {
        self.check_rank(src)?;
        let key = (src, self.rank, tag);
        let mut messages = self.mailbox.messages.lock();
        loop {
            let arrived = messages.get_mut(&key).and_then(|queue| {
                let tensor = queue.pop_front();
                Some((tensor?, queue.is_empty()))
            });
            if let Some((tensor, drained)) = arrived {
                if drained {
                    messages.remove(&key);
                }
                if tensor.shape() != like.shape() {
                    return Err(TensorDictError::shape(format!(
                        "received a tensor of shape {:?} with tag {} but expected shape {:?}",
                        tensor.shape(),
                        tag,
                        like.shape()
                    )));
                }
                return Ok(tensor);
            }
            if self
                .mailbox
                .delivered
                .wait_for(&mut messages, self.timeout)
                .timed_out()
            {
                return Err(TensorDictError::Transport(format!(
                    "timed out after {:?} waiting for tag {} from rank {}",
                    self.timeout, tag, src
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (LocalTransport, LocalTransport) {
        let mut group = LocalTransport::group(2).into_iter();
        let first = group.next().unwrap();
        let second = group.next().unwrap();
        (first, second.with_timeout(Duration::from_secs(5)))
    }

    #[test]
    fn tags_follow_sorted_keys() {
        let (first, second) = pair();
        let td = TensorDict::new([]);
        td.set("z", 1.0).unwrap();
        td.set(("a", "inner"), 2.0).unwrap();
        td.set("m", 3.0).unwrap();
        assert_eq!(td.send(&first, 1, 10, false).unwrap(), 12);
        // a.inner is first in sorted order so it carries the initial tag
        let inner = second.recv(&Tensor::zeros([]), 0, 10).unwrap();
        assert_eq!(inner.item(), Some(2.0));
        let last = second.recv(&Tensor::zeros([]), 0, 12).unwrap();
        assert_eq!(last.item(), Some(1.0));
    }

    #[test]
    fn pseudo_random_tags_are_reproducible() {
        let tags: Vec<i64> = (0..3).scan(-1, |tag, _| {
            *tag = next_tag(*tag, true).unwrap();
            Some(*tag)
        }).collect();
        let again: Vec<i64> = (0..3).scan(-1, |tag, _| {
            *tag = next_tag(*tag, true).unwrap();
            Some(*tag)
        }).collect();
        assert_eq!(tags, again);
        assert!(tags.iter().all(|&tag| tag >= 0));
        assert_ne!(tags[0], tags[1]);
    }

    #[test]
    fn tags_at_the_ends_of_the_range() {
        let (first, second) = pair();
        let td = TensorDict::new([]);
        td.set("a", 1.0).unwrap();
        td.set("b", 2.0).unwrap();
        assert!(matches!(
            td.send(&first, 1, i64::MIN, false),
            Err(TensorDictError::Transport(_))
        ));
        // the second tensor would need a tag after i64::MAX
        assert!(matches!(
            td.send(&first, 1, i64::MAX, false),
            Err(TensorDictError::Transport(_))
        ));
        assert_eq!(second.recv(&Tensor::zeros([]), 0, i64::MAX).unwrap().item(), Some(1.0));
        assert_eq!(td.send(&first, 1, i64::MAX - 1, false).unwrap(), i64::MAX);
    }

    #[test]
    fn delivered_tensors_leave_the_mailbox() {
        let (first, second) = pair();
        for tag in 0..5 {
            first.send(&Tensor::ones([2]), 1, tag).unwrap();
            first.send(&Tensor::ones([2]), 1, tag).unwrap();
        }
        assert_eq!(first.mailbox.messages.lock().len(), 5);
        for tag in 0..5 {
            second.recv(&Tensor::zeros([2]), 0, tag).unwrap();
            assert_eq!(first.mailbox.messages.lock().len(), 5 - tag as usize);
            second.recv(&Tensor::zeros([2]), 0, tag).unwrap();
        }
        assert!(first.mailbox.messages.lock().is_empty());
    }

    #[test]
    fn received_tensors_are_written_in_place() {
        let (first, second) = pair();
        let sent = TensorDict::new([2]);
        sent.set("x", Tensor::new(vec![4.0, 5.0], [2])).unwrap();
        sent.send(&first, 1, 0, true).unwrap();
        let received = TensorDict::new([2]);
        let storage = Tensor::zeros([2]);
        received.set("x", storage.clone()).unwrap();
        received.lock_();
        received.recv(&second, 0, 0, true).unwrap();
        assert_eq!(storage.to_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn failures_are_reported() {
        let (first, second) = pair();
        let td = TensorDict::new([]);
        td.set_non_tensor("text", "hi").unwrap();
        assert!(matches!(
            td.send(&first, 1, 0, false),
            Err(TensorDictError::Unsupported(_))
        ));
        assert!(first.send(&Tensor::zeros([1]), 2, 0).is_err());
        first.send(&Tensor::zeros([3]), 1, 7).unwrap();
        assert!(matches!(
            second.recv(&Tensor::zeros([2]), 0, 7),
            Err(TensorDictError::ShapeMismatch(_))
        ));
        let impatient = second.with_timeout(Duration::from_millis(10));
        assert!(matches!(
            impatient.recv(&Tensor::zeros([1]), 0, 99),
            Err(TensorDictError::Transport(_))
        ));
    }
}
