//! Pipeline stages for document question answering.
//!
//! Each submodule implements exactly one transformation step and knows
//! nothing about caching; [`crate::orchestrator`] decides when a stage runs.
//!
//! ## Data Flow
//!
//! ```text
//! document ──▶ normalize ──▶ extract ──▶ enrich ──▶ synthesize
//! (bytes+type)  (soffice)    (pdfium)    (vision)   (answer)
//! ```
//!
//! 1. [`document`] : input bytes, media-type detection, canonical PDF newtype
//! 2. [`normalize`]: any supported format to PDF through a converter
//! 3. [`extract`]  : Markdown plus an ordered image manifest; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 4. [`enrich`]   : concurrent captioning, rewritten in document order
//! 5. [`synthesize`]: one low-temperature answer call
//!
//! [`markdown`] holds the pure text helpers shared by extract and enrich.

pub mod document;
pub mod enrich;
pub mod extract;
pub mod markdown;
pub mod normalize;
pub mod synthesize;
