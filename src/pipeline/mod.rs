//! Pipeline stages for document rasterisation.
//!
//! Each submodule implements one step and can fail on its own without
//! taking the others down; [`crate::process`] decides which of them run.
//!
//! ## Data Flow
//!
//! ```text
//!            ┌──▶ embedded ─────────────────────────────┐
//! document ──┤                                          ├──▶ assemble
//!            └──▶ convert ──▶ render ──▶ (vector) ──────┘
//!                 (office)    (pdfium)   (EMF/WMF)
//! ```
//!
//! 1. [`embedded`]: pull original images (and EMF/WMF drawings) out of the
//!    container
//! 2. [`text`]: per-slide text and speaker notes for decks
//! 3. [`convert`]: office document → PDF under a hard deadline
//! 4. [`render`]: PDF pages → images, stopping at the budget's limits;
//!    runs in `spawn_blocking`
//! 5. [`vector`]: EMF/WMF → PNG through a fallback chain
//! 6. [`assemble`]: order, cap, and shape everything into content blocks
//!
//! [`encode`] is shared by the rendering stages.

pub mod assemble;
pub mod convert;
pub mod embedded;
pub mod encode;
pub mod render;
pub mod text;
pub mod vector;
