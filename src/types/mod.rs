//! # Types Module
//!
//! Core data types flowing through the generation layer.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Request`] | Identity-stable record of input fields plus named result slots |
//! | [`RequestBatch`] | Ordered collection of requests |
//! | [`GenerationOutput`] | Result of one work item (text or log-likelihood) |
//! | [`Method`] | Kind of computation requested |
//! | [`GenerationCall`] | Validated (method, input fields, result slot) triple |
//!
//! ## Example
//!
//! ```rust
//! use dgt_lm::types::{GenerationCall, Method, Request};
//!
//! let batch = vec![
//!     Request::new().with_field("prompt", "Question: x = 1 + 1\nAnswer: x ="),
//!     Request::new().with_field("prompt", "Question: x = 2 + 1\nAnswer: x ="),
//! ];
//! let call = GenerationCall::new(Method::Generate, ["prompt"], "output").unwrap();
//! assert_eq!(call.field_names(), ["prompt"]);
//! assert_eq!(batch.len(), 2);
//! ```

pub mod method;
pub mod request;

pub use method::{GenerationCall, Method};
pub use request::{GenerationOutput, Request, RequestBatch};
