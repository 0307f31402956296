//! Settled outcomes and their hydration wire format.
//!
//! A finished attempt serializes to
//! `{"value": .., "input": .., "time": ..}` or `{"reason": .., ..}`.
//! The registry keeps restore records type-erased as
//! [`SerializedOutcome`] and decodes them into the concrete operation types
//! when an entry is first created.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signal::CancelReason;

/// Why an attempt was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection<E> {
    /// The operation itself returned an error.
    Failed(E),
    /// The attempt was cancelled before it settled.
    Cancelled(CancelReason),
    /// The operation panicked while running.
    Panicked(String),
}

impl<E> Rejection<E> {
    /// Whether this rejection came from cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// The operation's own error, if that is what this is.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for Rejection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(err) => write!(f, "operation failed: {}", err),
            Self::Cancelled(reason) => write!(f, "operation cancelled: {}", reason),
            Self::Panicked(message) => write!(f, "operation panicked: {}", message),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for Rejection<E> {}

/// How an attempt settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeResult<T, E> {
    Value(T),
    Reason(Rejection<E>),
}

impl<T, E> From<Result<T, Rejection<E>>> for OutcomeResult<T, E> {
    fn from(result: Result<T, Rejection<E>>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(reason) => Self::Reason(reason),
        }
    }
}

impl<T, E> From<OutcomeResult<T, E>> for Result<T, Rejection<E>> {
    fn from(result: OutcomeResult<T, E>) -> Self {
        match result {
            OutcomeResult::Value(value) => Ok(value),
            OutcomeResult::Reason(reason) => Err(reason),
        }
    }
}

/// A settled attempt, as transferred from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome<I = Value, T = Value, E = Value> {
    /// The value or the rejection reason.
    #[serde(flatten)]
    pub result: OutcomeResult<T, E>,
    /// Input the attempt ran with.
    // A bare `default` here would add an `I: Default` bound to `Deserialize`.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub input: Option<I>,
    /// When the attempt last changed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// A type-erased outcome, as held by the registry's restore table.
pub type SerializedOutcome = Outcome<Value, Value, Value>;

impl<I, T, E> Outcome<I, T, E> {
    /// A resolved outcome.
    pub fn resolved(value: T) -> Self {
        Self {
            result: OutcomeResult::Value(value),
            input: None,
            time: None,
        }
    }

    /// A rejected outcome.
    pub fn rejected(reason: Rejection<E>) -> Self {
        Self {
            result: OutcomeResult::Reason(reason),
            input: None,
            time: None,
        }
    }

    /// Attach the input used.
    pub fn with_input(mut self, input: I) -> Self {
        self.input = Some(input);
        self
    }

    /// Attach the settlement time.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<&T> {
        match &self.result {
            OutcomeResult::Value(value) => Some(value),
            OutcomeResult::Reason(_) => None,
        }
    }

    /// The rejection reason, if any.
    pub fn reason(&self) -> Option<&Rejection<E>> {
        match &self.result {
            OutcomeResult::Value(_) => None,
            OutcomeResult::Reason(reason) => Some(reason),
        }
    }

    /// Whether this outcome is a rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self.result, OutcomeResult::Reason(_))
    }
}

impl<I: Serialize, T: Serialize, E: Serialize> Outcome<I, T, E> {
    /// Erase the concrete types for storage in a registry.
    pub fn erase(&self) -> Result<SerializedOutcome, serde_json::Error> {
        transcode(self)
    }
}

impl SerializedOutcome {
    /// Decode into concrete operation types.
    pub fn decode<I, T, E>(&self) -> Result<Outcome<I, T, E>, serde_json::Error>
    where
        I: DeserializeOwned,
        T: DeserializeOwned,
        E: DeserializeOwned,
    {
        transcode(self)
    }
}

fn transcode<A: Serialize, B: DeserializeOwned>(from: &A) -> Result<B, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(from)?)
}
