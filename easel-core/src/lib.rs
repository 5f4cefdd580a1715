//! # easel-core: Shared data model for Easel collaboration
//!
//! Shape documents, identifiers, the error taxonomy and the deterministic
//! cursor palette. No I/O lives here; `easel-collab` builds the stores,
//! lock coordination and presence on top of these types.
//!
//! ## Modules
//!
//! - [`ids`]: `ShapeId`, `UserId`, millisecond timestamps
//! - [`shape`]: Shape documents, kinds and field-level patches
//! - [`error`]: `CollabError`
//! - [`color`]: Per-user cursor colors

pub mod color;
pub mod error;
pub mod ids;
pub mod shape;

pub use color::CursorColor;
pub use error::{CollabError, CollabResult};
pub use ids::{now_millis, ShapeId, Timestamp, UserId};
pub use shape::{Shape, ShapeKind, ShapeLock, ShapePatch, Style};
