//! Data structures for passing keys into a batch function and values back
//! out of it.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::mem;

use thiserror::Error;

/// Position of a key in its [`KeySet`]. The batch that built the key set
/// uses it to find the value for each waiting promise.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(usize);

impl Token {
    /// Position of the key among the unique keys of its set.
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// What to do when a batch result contains more than one value for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnDuplicate {
    /// Fail the conversion with [`IntoValuesError::DuplicateKey`].
    #[default]
    Error,
    /// Keep the first value seen for the key.
    Ignore,
    /// Keep the last value seen for the key.
    Replace,
}

/// Implemented by values that know which key they were loaded for. This lets
/// [`KeySet::values_from_iter`] pair a flat list of results with the
/// requested keys.
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

/// Errors returned when batch results don't line up with the requested keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntoValuesError<Key> {
    /// The results contained a value for a key that wasn't requested.
    #[error("batch result contains a value for a key that was not requested")]
    UnrecognizedKey,
    /// The results contained more than one value for the same key, and the
    /// conversion was configured with [`OnDuplicate::Error`].
    #[error("batch result contains more than one value for the same key")]
    DuplicateKey,
    /// Some requested keys have no value in the results.
    #[error("batch result is missing {} requested key(s)", .0.len())]
    MissingKeys(Vec<Key>),
}

/// The set of keys passed into a batch function. The keys are unique and are
/// yielded in the order they were first requested. Once you've completed your
/// request, use one of the conversion methods (`into_values`,
/// `values_from_iter`, ...) to pair each key with its value; this is the only
/// way to create a [`ValueSet`], which is handed back to the batch.
///
/// The conversion you choose is also where your loader decides what happens
/// to keys the backend didn't return. `values_from_iter` and
/// `values_from_pairs` fail the whole batch; `fill_values` computes a
/// fallback (typically `None` for an `Option` value) for each missing key.
#[derive(Debug, Clone)]
pub struct KeySet<Key> {
    // Each key is associated with a token, which is its position in `keys`.
    // Keys are never removed, so tokens stay valid for the lifetime of the
    // set.
    keys: Vec<Key>,
    tokens: HashMap<Key, Token>,
}

impl<Key: Eq + Hash + Clone> KeySet<Key> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            tokens: HashMap::new(),
        }
    }

    /// Add a key to this KeySet, and return the token associated with that
    /// key. The second element is true if the key was not already present.
    pub(crate) fn add_key(&mut self, key: Key) -> (Token, bool) {
        if let Some(&token) = self.tokens.get(&key) {
            return (token, false);
        }

        let token = Token(self.keys.len());
        self.tokens.insert(key.clone(), token);
        self.keys.push(key);
        (token, true)
    }

    /// Check if there are any keys in this keyset
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Get the number of unique keys in this keyset.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Get an iterator over all the keys in this keyset. These are guaranteed
    /// to be unique, and are in the order they were first added to the
    /// batch.
    pub fn keys(&self) -> impl ExactSizeIterator<Item = &Key> + Clone {
        self.keys.iter()
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.tokens.contains_key(key)
    }

    /// Pair each key with the value computed by `get_value`.
    pub fn into_values<Value>(self, mut get_value: impl FnMut(&Key) -> Value) -> ValueSet<Value> {
        ValueSet {
            values: self.keys.iter().map(|key| Some(get_value(key))).collect(),
        }
    }

    /// Fallible version of into_values. Same as into_values, but will return
    /// an error the first time `get_value` returns an error.
    pub fn try_into_values<Value, Error>(
        self,
        get_value: impl FnMut(&Key) -> Result<Value, Error>,
    ) -> Result<ValueSet<Value>, Error> {
        let values: Result<Vec<Value>, Error> = self.keys.iter().map(get_value).collect();

        values.map(|values| ValueSet {
            values: values.into_iter().map(Some).collect(),
        })
    }

    /// Pair a collection of values with their keys, using the [`KeyedEntry`]
    /// trait to find each value's key. Every requested key must have a value,
    /// and every value must belong to a requested key.
    pub fn values_from_iter<Q, Value>(
        self,
        on_duplicate: OnDuplicate,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<ValueSet<Value>, IntoValuesError<Key>>
    where
        Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        Value: KeyedEntry<Q>,
    {
        let mut slots = self.empty_slots();

        for value in values {
            let token = *self
                .tokens
                .get(value.get_key())
                .ok_or(IntoValuesError::UnrecognizedKey)?;
            place(&mut slots, token, value, on_duplicate)?;
        }

        self.complete(slots)
    }

    /// Same as [`values_from_iter`](Self::values_from_iter), for results
    /// that come as explicit key-value pairs (such as a `HashMap`).
    pub fn values_from_pairs<Value>(
        self,
        on_duplicate: OnDuplicate,
        pairs: impl IntoIterator<Item = (Key, Value)>,
    ) -> Result<ValueSet<Value>, IntoValuesError<Key>> {
        let slots = self.assign_pairs(on_duplicate, pairs)?;
        self.complete(slots)
    }

    /// Pair key-value results with their keys, and compute a value with
    /// `missing` for every requested key that has no result. Values for keys
    /// that weren't requested are still an error.
    pub fn fill_values<Value>(
        self,
        on_duplicate: OnDuplicate,
        pairs: impl IntoIterator<Item = (Key, Value)>,
        mut missing: impl FnMut(&Key) -> Value,
    ) -> Result<ValueSet<Value>, IntoValuesError<Key>> {
        let slots = self.assign_pairs(on_duplicate, pairs)?;

        let values = slots
            .into_iter()
            .zip(self.keys.iter())
            .map(|(slot, key)| Some(slot.unwrap_or_else(|| missing(key))))
            .collect();

        Ok(ValueSet { values })
    }

    fn empty_slots<Value>(&self) -> Vec<Option<Value>> {
        self.keys.iter().map(|_| None).collect()
    }

    fn assign_pairs<Value>(
        &self,
        on_duplicate: OnDuplicate,
        pairs: impl IntoIterator<Item = (Key, Value)>,
    ) -> Result<Vec<Option<Value>>, IntoValuesError<Key>> {
        let mut slots = self.empty_slots();

        for (key, value) in pairs {
            let token = *self
                .tokens
                .get(&key)
                .ok_or(IntoValuesError::UnrecognizedKey)?;
            place(&mut slots, token, value, on_duplicate)?;
        }

        Ok(slots)
    }

    fn complete<Value>(
        self,
        slots: Vec<Option<Value>>,
    ) -> Result<ValueSet<Value>, IntoValuesError<Key>> {
        let missing: Vec<Key> = self
            .keys
            .into_iter()
            .zip(slots.iter())
            .filter(|(_key, slot)| slot.is_none())
            .map(|(key, _slot)| key)
            .collect();

        if missing.is_empty() {
            Ok(ValueSet { values: slots })
        } else {
            Err(IntoValuesError::MissingKeys(missing))
        }
    }
}

fn place<Key, Value>(
    slots: &mut [Option<Value>],
    Token(index): Token,
    value: Value,
    on_duplicate: OnDuplicate,
) -> Result<(), IntoValuesError<Key>> {
    let slot = &mut slots[index];
    match (slot.is_some(), on_duplicate) {
        (false, _) | (true, OnDuplicate::Replace) => *slot = Some(value),
        (true, OnDuplicate::Ignore) => {}
        (true, OnDuplicate::Error) => return Err(IntoValuesError::DuplicateKey),
    }
    Ok(())
}

/// A value set is an opaque data structure that contains the result of a batch
/// operation. It is created from a [`KeySet`], and is used by the batch to
/// distribute the values to the correct waiting promises.
#[derive(Debug)]
pub struct ValueSet<Value> {
    values: Vec<Option<Value>>,
}

impl<Value> ValueSet<Value> {
    /// Take the value associated with a token out of this ValueSet. Each
    /// token is associated with exactly one promise, so values are moved
    /// out rather than cloned.
    pub(crate) fn take(&mut self, Token(index): Token) -> Option<Value> {
        self.values.get_mut(index).and_then(mem::take)
    }

    /// Number of values still held in this set.
    pub fn len(&self) -> usize {
        self.values.iter().filter(|value| value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
