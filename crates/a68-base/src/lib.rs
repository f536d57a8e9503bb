#![cfg_attr(docsrs, feature(doc_cfg))]

//! # a68-base
//!
//! Pure structural atoms for the `a68` interpreter core.
//!
//! This crate provides the foundational types the rest of the workspace
//! builds on:
//!
//! - [`Arena`] — Bump allocation for stable node/mode references
//! - [`Interner`]/[`Symbol`] — String interning for O(1) identifier equality
//! - [`Span`] — Source location tracking
//! - [`SpannedError`]/[`Result`] — Errors with source positions
//!
//! # Design Principles
//!
//! This crate has **no knowledge of Algol 68 grammar or semantics**. It
//! provides only generic, reusable infrastructure that `a68-core` builds
//! upon — the mode table, coercion engine, scope resolver, runtime memory,
//! evaluator, and operator set all live one layer up.

pub mod arena;
pub mod intern;
pub mod span;
pub mod error;

pub use arena::Arena;
pub use intern::{Interner, Symbol, SymbolEq};
pub use span::Span;
pub use error::{SpannedError, Result};
