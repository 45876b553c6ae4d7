/*!
 * Keys and leaves.
 *
 * Every entry of a tensordict is addressed by a string key local to its container. Entries of
 * nested containers are addressed by a [`NestedKey`], an ordered path of string keys, one per
 * level. A nested key of a single part is exactly the same as the plain string key, so
 * `"a"`, `("a",)` style single element paths and `["a"]` all address the same entry.
 *
 * ```
 * use easy_tensordict::keys::NestedKey;
 * let key = NestedKey::from(("b", "c"));
 * assert_eq!(key.len(), 2);
 * assert_eq!(key.to_string(), "(\"b\", \"c\")");
 * assert_eq!(NestedKey::from(["a"]), NestedKey::from("a"));
 * ```
 *
 * Keys are validated when they are used rather than when they are built, so constructing an
 * empty key is possible but passing it to any tensordict operation returns
 * [`InvalidKey`](crate::TensorDictError::InvalidKey).
 *
 * The second half of this module decides what counts as a leaf. Traversals recurse into
 * anything that is not a leaf, and the predicate that decides this can be swapped out, for
 * instance to treat non-tensor data as a leaf when enumerating keys.
 */

use crate::errors::{Result, TensorDictError};

use std::fmt;

/**
 * A path of string keys through nested containers.
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NestedKey {
    parts: Vec<String>,
}

impl NestedKey {
    /**
     * Creates a nested key from its parts, returning an error if there are no parts or any
     * part is empty.
     */
    pub fn new(parts: Vec<String>) -> Result<NestedKey> {
        normalize(NestedKey { parts })
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /**
     * True if this key addresses an entry of the container it is used on, rather than an
     * entry of a nested container.
     */
    pub fn is_local(&self) -> bool {
        self.parts.len() == 1
    }

    pub fn first(&self) -> &str {
        self.parts.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn last(&self) -> &str {
        self.parts.last().map(|s| s.as_str()).unwrap_or("")
    }

    /**
     * Splits off the first part, returning it and the key of the rest of the path if there
     * is any.
     */
    pub fn split_first(&self) -> (&str, Option<NestedKey>) {
        match self.parts.split_first() {
            Some((first, rest)) if !rest.is_empty() => (
                first.as_str(),
                Some(NestedKey {
                    parts: rest.to_vec(),
                }),
            ),
            Some((first, _)) => (first.as_str(), None),
            None => ("", None),
        }
    }

    /**
     * Returns this key extended by one more part.
     */
    pub fn join(&self, key: &str) -> NestedKey {
        let mut parts = self.parts.clone();
        parts.push(key.to_string());
        NestedKey { parts }
    }

    /**
     * The parts joined with a separator.
     */
    pub fn flatten(&self, separator: &str) -> String {
        self.parts.join(separator)
    }

    pub(crate) fn root() -> NestedKey {
        NestedKey { parts: Vec::new() }
    }
}

/**
 * Validates a key, rejecting empty paths and empty parts.
 */
pub fn normalize(key: impl Into<NestedKey>) -> Result<NestedKey> {
    let key = key.into();
    if key.parts.is_empty() || key.parts.iter().any(|p| p.is_empty()) {
        return Err(TensorDictError::InvalidKey(format!(
            "a key must be a non-empty string or tuple of strings, got {}",
            key
        )));
    }
    Ok(key)
}

/**
 * Displays single part keys as a quoted string and longer paths as a tuple of quoted strings.
 */
impl fmt::Display for NestedKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.parts.len() == 1 {
            return write!(f, "{:?}", self.parts[0]);
        }
        write!(f, "(")?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", part)?;
        }
        write!(f, ")")
    }
}

impl From<&str> for NestedKey {
    fn from(key: &str) -> NestedKey {
        NestedKey {
            parts: vec![key.to_string()],
        }
    }
}

impl From<String> for NestedKey {
    fn from(key: String) -> NestedKey {
        NestedKey { parts: vec![key] }
    }
}

impl From<&String> for NestedKey {
    fn from(key: &String) -> NestedKey {
        NestedKey::from(key.as_str())
    }
}

impl From<&NestedKey> for NestedKey {
    fn from(key: &NestedKey) -> NestedKey {
        key.clone()
    }
}

impl From<(&str, &str)> for NestedKey {
    fn from((a, b): (&str, &str)) -> NestedKey {
        NestedKey::from([a, b])
    }
}

impl From<(&str, &str, &str)> for NestedKey {
    fn from((a, b, c): (&str, &str, &str)) -> NestedKey {
        NestedKey::from([a, b, c])
    }
}

impl From<(&str, &str, &str, &str)> for NestedKey {
    fn from((a, b, c, d): (&str, &str, &str, &str)) -> NestedKey {
        NestedKey::from([a, b, c, d])
    }
}

impl<const N: usize> From<[&str; N]> for NestedKey {
    fn from(parts: [&str; N]) -> NestedKey {
        NestedKey::from(&parts[..])
    }
}

impl From<&[&str]> for NestedKey {
    fn from(parts: &[&str]) -> NestedKey {
        NestedKey {
            parts: parts.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl From<Vec<&str>> for NestedKey {
    fn from(parts: Vec<&str>) -> NestedKey {
        NestedKey::from(parts.as_slice())
    }
}

impl From<Vec<String>> for NestedKey {
    fn from(parts: Vec<String>) -> NestedKey {
        NestedKey { parts }
    }
}

/**
 * The kind of a value held by a tensordict, used to decide leaf or container membership
 * without inspecting the value itself.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Tensor,
    TensorDict,
    LazyStack,
    View,
    NonTensor,
    NonTensorStack,
}

impl ValueKind {
    /**
     * True for every kind other than plain tensors. Non-tensor data is a tensor collection
     * as well, since it carries a batch size of its own.
     */
    pub fn is_tensor_collection(self) -> bool {
        !matches!(self, ValueKind::Tensor)
    }

    /**
     * True for containers that can be recursed into.
     */
    pub fn is_container(self) -> bool {
        matches!(
            self,
            ValueKind::TensorDict | ValueKind::LazyStack | ValueKind::View
        )
    }

    pub fn is_non_tensor(self) -> bool {
        matches!(self, ValueKind::NonTensor | ValueKind::NonTensorStack)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::Tensor => "Tensor",
            ValueKind::TensorDict => "TensorDict",
            ValueKind::LazyStack => "LazyStackedTensorDict",
            ValueKind::View => "a lazy view of a TensorDict",
            ValueKind::NonTensor => "NonTensorData",
            ValueKind::NonTensorStack => "NonTensorStack",
        };
        write!(f, "{}", name)
    }
}

/**
 * A predicate deciding which kinds of value are leaves.
 */
pub type IsLeaf = fn(ValueKind) -> bool;

/**
 * The default leaf predicate: anything that is not a tensor collection. Under this predicate
 * non-tensor data is neither a leaf nor something to recurse into, so leaves only
 * enumerations skip it and traversals pass it through untouched.
 */
pub fn default_is_leaf(kind: ValueKind) -> bool {
    !kind.is_tensor_collection()
}

/**
 * A leaf predicate that also treats non-tensor data as leaves.
 */
pub fn is_leaf_nontensor(kind: ValueKind) -> bool {
    !kind.is_container()
}

#[test]
fn empty_keys_are_rejected() {
    assert!(normalize("").is_err());
    assert!(normalize(Vec::<String>::new()).is_err());
    assert!(normalize(("a", "")).is_err());
    assert!(NestedKey::new(vec!["a".to_string()]).is_ok());
}

#[test]
fn nested_keys_split_and_join() {
    let key = NestedKey::from(("a", "b", "c"));
    let (first, rest) = key.split_first();
    assert_eq!(first, "a");
    assert_eq!(rest, Some(NestedKey::from(("b", "c"))));
    assert_eq!(NestedKey::from("a").split_first(), ("a", None));
    assert_eq!(NestedKey::from("a").join("b"), NestedKey::from(("a", "b")));
    assert_eq!(key.flatten("."), "a.b.c");
    assert_eq!(NestedKey::from("a").to_string(), "\"a\"");
}

#[test]
fn leaf_predicates() {
    assert!(default_is_leaf(ValueKind::Tensor));
    assert!(!default_is_leaf(ValueKind::NonTensor));
    assert!(is_leaf_nontensor(ValueKind::NonTensor));
    assert!(is_leaf_nontensor(ValueKind::NonTensorStack));
    assert!(!is_leaf_nontensor(ValueKind::LazyStack));
}
