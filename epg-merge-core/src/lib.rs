#![doc = "epg-merge-core: core logic library for epg-merge."]

//! Fetches remote and local XMLTV guides, merges their channels and programmes into
//! one document and saves it, with retry, gzip handling and structured logging.
//!
//! # Usage
//! Build a [`pipeline::PipelineContext`] (from a [`config::PipelineConfig`], or by
//! hand with mock collaborators) and pass it to [`pipeline::run`].

pub mod accumulate;
pub mod archive;
pub mod config;
pub mod contract;
pub mod document;
pub mod download;
pub mod lock;
pub mod persist;
pub mod pipeline;
pub mod preprocess;
pub mod publish;
pub mod retry;
pub mod source;
