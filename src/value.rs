//! Slot values and the string immutability layer consumed by `share`.
//!
//! A [`JsString`] starts out mutable: whoever can reach it may append in
//! place. Once a domain holding it becomes shared, the string is frozen, and
//! appending to a frozen string produces a fresh mutable copy instead. Any
//! other thread holding the frozen handle therefore never observes a change.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{DomainError, Result};

#[derive(Debug, Default)]
struct StringCell {
    text: RwLock<String>,
    frozen: AtomicBool,
}

/// A reference-counted string that can be frozen in place.
#[derive(Clone, Default)]
pub struct JsString(Arc<StringCell>);

impl JsString {
    /// A new mutable string.
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::new(StringCell {
            text: RwLock::new(text.into()),
            frozen: AtomicBool::new(false),
        }))
    }

    /// A string that is immutable from the start.
    pub fn frozen(text: impl Into<String>) -> Self {
        let s = Self::new(text);
        s.0.frozen.store(true, Ordering::Release);
        s
    }

    /// `true` once the string can no longer be changed in place.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    /// Copies out the current text.
    pub fn text(&self) -> String {
        self.0
            .text
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.text.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// `true` for the empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `tail`, in place if still mutable.
    ///
    /// Returns the handle holding the result: `self` when mutated in place, a
    /// new mutable string when `self` is frozen.
    pub fn append(&self, tail: &str) -> JsString {
        let mut text = self.0.text.write().unwrap_or_else(PoisonError::into_inner);
        if self.0.frozen.load(Ordering::Acquire) {
            let mut copy = String::with_capacity(text.len() + tail.len());
            copy.push_str(&text);
            copy.push_str(tail);
            return JsString::new(copy);
        }
        text.push_str(tail);
        self.clone()
    }

    /// `true` if both handles name the same storage.
    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Moves the text into an exact-size buffer and marks the string frozen.
    fn freeze(&self, max_len: usize) -> Result<()> {
        let mut text = self.0.text.write().unwrap_or_else(PoisonError::into_inner);
        if self.0.frozen.load(Ordering::Acquire) {
            return Ok(());
        }
        if text.len() > max_len {
            return Err(DomainError::StringTooLong {
                len: text.len(),
                max: max_len,
            });
        }
        let mut exact = String::new();
        exact.try_reserve_exact(text.len())?;
        exact.push_str(&text);
        *text = exact;
        self.0.frozen.store(true, Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsString")
            .field("text", &self.text())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        JsString::ptr_eq(self, other) || self.text() == other.text()
    }
}

impl From<&str> for JsString {
    fn from(text: &str) -> Self {
        JsString::new(text)
    }
}

/// A property slot value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// No value. Also the placeholder substituted when freezing fails.
    #[default]
    Undefined,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// String, possibly still mutable.
    Str(JsString),
}

impl Value {
    /// `true` for a string that has not been frozen yet.
    pub fn is_mutable_string(&self) -> bool {
        matches!(self, Value::Str(s) if !s.is_frozen())
    }

    /// The string payload, if any.
    pub fn as_str(&self) -> Option<&JsString> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<JsString> for Value {
    fn from(s: JsString) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(JsString::new(s))
    }
}

/// The string layer's half of the share transition.
///
/// Invoked once per mutable string-like slot while a domain turns shared. An
/// error makes the caller substitute [`Value::Undefined`] for that slot.
pub trait Immutability: Send + Sync {
    /// Converts `value` to its immutable representation.
    fn make_immutable(&self, value: &Value) -> Result<()>;
}

/// Default immutability layer: freezes strings up to a length limit.
#[derive(Debug, Clone, Copy)]
pub struct FreezeStrings {
    max_len: usize,
}

impl FreezeStrings {
    /// Refuses strings longer than `max_len` bytes.
    pub const fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Immutability for FreezeStrings {
    fn make_immutable(&self, value: &Value) -> Result<()> {
        match value {
            Value::Str(s) => s.freeze(self.max_len),
            _ => Ok(()),
        }
    }
}
