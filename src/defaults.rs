//! Default values for absent payload fields.
//!
//! Pair a [`Defaulted`] field with `#[serde(default)]`: a missing key or an
//! explicit `null` yields the policy's value, while a present value of the
//! wrong type remains a decode error.
//!
//! ```
//! use reqflight::defaults::{DefaultEmpty, DefaultTrue, DefaultZero};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Profile {
//!     #[serde(default)]
//!     visible: DefaultTrue,
//!     #[serde(default)]
//!     followers: DefaultZero<u32>,
//!     #[serde(default)]
//!     tags: DefaultEmpty<Vec<String>>,
//! }
//!
//! let profile: Profile = serde_json::from_str("{}").unwrap();
//! assert!(*profile.visible);
//! assert_eq!(*profile.followers, 0);
//! assert!(profile.tags.is_empty());
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub trait DefaultPolicy {
    type Value;

    fn default_value() -> Self::Value;
}

pub struct True;

impl DefaultPolicy for True {
    type Value = bool;

    fn default_value() -> bool {
        true
    }
}

pub struct False;

impl DefaultPolicy for False {
    type Value = bool;

    fn default_value() -> bool {
        false
    }
}

/// Numeric zero.
pub struct Zero<T>(PhantomData<T>);

impl<T: Default> DefaultPolicy for Zero<T> {
    type Value = T;

    fn default_value() -> T {
        T::default()
    }
}

/// Empty string, collection, or the zero value of a nested object.
pub struct Empty<T>(PhantomData<T>);

impl<T: Default> DefaultPolicy for Empty<T> {
    type Value = T;

    fn default_value() -> T {
        T::default()
    }
}

pub struct Defaulted<P: DefaultPolicy> {
    value: P::Value,
    _policy: PhantomData<P>,
}

pub type DefaultTrue = Defaulted<True>;
pub type DefaultFalse = Defaulted<False>;
pub type DefaultZero<T> = Defaulted<Zero<T>>;
pub type DefaultEmpty<T> = Defaulted<Empty<T>>;

impl<P: DefaultPolicy> Defaulted<P> {
    pub fn new(value: P::Value) -> Self {
        Self {
            value,
            _policy: PhantomData,
        }
    }

    pub fn into_inner(self) -> P::Value {
        self.value
    }
}

impl<P: DefaultPolicy> Default for Defaulted<P> {
    fn default() -> Self {
        Self::new(P::default_value())
    }
}

impl<P: DefaultPolicy> Deref for Defaulted<P> {
    type Target = P::Value;

    fn deref(&self) -> &P::Value {
        &self.value
    }
}

impl<P: DefaultPolicy> DerefMut for Defaulted<P> {
    fn deref_mut(&mut self) -> &mut P::Value {
        &mut self.value
    }
}

impl<P> Clone for Defaulted<P>
where
    P: DefaultPolicy,
    P::Value: Clone,
{
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<P> fmt::Debug for Defaulted<P>
where
    P: DefaultPolicy,
    P::Value: fmt::Debug,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(formatter)
    }
}

impl<P> PartialEq for Defaulted<P>
where
    P: DefaultPolicy,
    P::Value: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<P> Serialize for Defaulted<P>
where
    P: DefaultPolicy,
    P::Value: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.value.serialize(serializer)
    }
}

impl<'de, P> Deserialize<'de> for Defaulted<P>
where
    P: DefaultPolicy,
    P::Value: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<P::Value>::deserialize(deserializer)?;
        Ok(Self::new(value.unwrap_or_else(P::default_value)))
    }
}
