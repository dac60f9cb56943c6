//! Generation methods and the per-call field selection.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of computation requested from a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Free-text generation; one or more input fields.
    Generate,
    /// Log-likelihood of a continuation given a context; exactly two input fields.
    #[serde(rename = "loglikelihood")]
    LogLikelihood,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Generate => "generate",
            Method::LogLikelihood => "loglikelihood",
        }
    }

    /// Check the number of selected input fields against what the method needs.
    pub fn check_arity(&self, count: usize) -> Result<()> {
        let (ok, expected) = match self {
            Method::Generate => (count >= 1, "at least 1"),
            Method::LogLikelihood => (count == 2, "exactly 2"),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::MethodMismatch {
                method: self.as_str().to_string(),
                expected: expected.to_string(),
                actual: count,
            })
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate" => Ok(Method::Generate),
            "loglikelihood" => Ok(Method::LogLikelihood),
            other => Err(Error::configuration_with_context(
                format!("unknown method '{}'", other),
                ErrorContext::new().with_details("expected 'generate' or 'loglikelihood'"),
            )),
        }
    }
}

/// A validated generation call: which method, which input fields (in order),
/// and which result slot receives the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationCall {
    method: Method,
    field_names: Vec<String>,
    result_slot: String,
}

impl GenerationCall {
    /// Build a call, failing with [`Error::MethodMismatch`] when the field
    /// count does not fit the method.
    pub fn new<I, S>(method: Method, field_names: I, result_slot: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let field_names: Vec<String> = field_names.into_iter().map(Into::into).collect();
        method.check_arity(field_names.len())?;
        Ok(Self {
            method,
            field_names,
            result_slot: result_slot.into(),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn result_slot(&self) -> &str {
        &self.result_slot
    }
}
