//! # Shape-Tracker View Algebra
//!
//! Describes how logical tensor indices map to buffer offsets. A [`View`]
//! is one strided (optionally masked) layout; a [`ShapeTracker`] is an
//! ordered stack of views composed innermost-first. Movement operations
//! (reshape/permute/pad/shrink/expand) rewrite the outermost view, falling
//! back to pushing a fresh view when the rewrite cannot be expressed on
//! one layout.

pub mod tracker;
pub mod view;

pub use tracker::ShapeTracker;
pub use view::{strides_for_shape, View};
