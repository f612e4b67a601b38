//! By-name lookup of user supplied strategies.
//!
//! Initializers, regularizers and constraints come with a fixed set of built-ins.
//! Anything else is a [`Custom`] strategy: a callable registered under a name,
//! which is what gets serialized and what gets looked up again on deserialization.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use displaydoc::Display;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Unknown {kind} identifier: {name}
#[derive(Debug, Display, Error, PartialEq)]
pub struct UnknownIdentifier {
    kind: &'static str,
    name: String,
}

impl UnknownIdentifier {
    pub(crate) fn new(kind: &'static str, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// A thread safe table of named strategies of one kind.
pub struct Registry<T: ?Sized> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the function under given name, returns the function previously registered under it.
    pub fn register(&self, name: impl Into<String>, function: Arc<T>) -> Option<Arc<T>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), function)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// A kind of strategy with a process wide registry.
pub trait Registered: 'static {
    /// Human readable name of the kind, used in errors.
    const KIND: &'static str;

    fn registry() -> &'static Registry<Self>;
}

/// A named, user supplied strategy.
pub struct Custom<T: ?Sized> {
    name: String,
    function: Arc<T>,
}

impl<T> Custom<T>
where
    T: ?Sized + Registered,
{
    /// Registers the function under given name and returns a handle to it.
    pub fn register(name: impl Into<String>, function: Arc<T>) -> Self {
        let name = name.into();
        T::registry().register(name.clone(), function.clone());
        Self { name, function }
    }

    /// Looks up a previously registered function.
    pub fn lookup(name: &str) -> Result<Self, UnknownIdentifier> {
        T::registry()
            .get(name)
            .map(|function| Self {
                name: name.to_owned(),
                function,
            })
            .ok_or_else(|| UnknownIdentifier::new(T::KIND, name))
    }
}

impl<T: ?Sized> Custom<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> &T {
        &self.function
    }
}

impl<T: ?Sized> Clone for Custom<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            function: self.function.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Custom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Custom").field(&self.name).finish()
    }
}

/// Custom strategies are identified by their name.
impl<T: ?Sized> PartialEq for Custom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T: ?Sized> Serialize for Custom<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.name)
    }
}

impl<'de, T> Deserialize<'de> for Custom<T>
where
    T: ?Sized + Registered,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Self::lookup(&name).map_err(de::Error::custom)
    }
}
