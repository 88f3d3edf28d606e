//! Retrieval core for a bridge service between a conversational LLM gateway
//! and a smart-home platform: given an utterance and dialog history,
//! returns a ranked set of smart-home entities plus a formatted context
//! block, via an eight-component pipeline (analysis, rewriting, memory,
//! scope detection, clustering, retrieval, reranking, formatting)
//! coordinated by a single orchestrator.

pub mod analyzer;
pub mod clusters;
pub mod config;
pub mod error;
pub mod formatter;
pub mod memory;
pub mod orchestrator;
pub mod providers;
pub mod reranker;
pub mod retriever;
pub mod rewriter;
pub mod scope;
pub mod store;
pub mod types;

pub use config::RetrievalConfig;
pub use error::{CoreError, CoreResult};
pub use orchestrator::Orchestrator;
pub use types::{CoreRequest, CoreResponse};

pub use anyhow::{Error, Result};
