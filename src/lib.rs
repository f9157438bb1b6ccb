//! A writer for HPCToolkit's `meta.db` format: the static, per-execution
//! metadata half of an `hpctoolkit-database` (the other half, `profile.db`,
//! carries the actual sampled metric values and is out of scope here).
//!
//! A caller builds a [`Model`] describing one profiled execution — its
//! metrics, display attributes, and calling-context tree — and hands it to
//! a [`Writer`] configured with a [`Config`]. The writer discovers files,
//! load modules and functions by walking the context tree, interns every
//! string it writes exactly once, and emits a single self-referential
//! `meta.db` file.
//!
//! ```no_run
//! use hpctoolkit_metadb::{Config, Context, Writer};
//! use hpctoolkit_metadb::model::{Attributes, Metric, Model};
//!
//! struct Empty {
//!     attributes: Attributes,
//!     root: Context,
//! }
//!
//! impl Model for Empty {
//!     fn attributes(&self) -> &Attributes {
//!         &self.attributes
//!     }
//!     fn metrics(&self) -> &[Metric] {
//!         &[]
//!     }
//!     fn global_context(&self) -> &Context {
//!         &self.root
//!     }
//! }
//!
//! let model = Empty {
//!     attributes: Attributes::default(),
//!     root: Context::global(Vec::new()),
//! };
//! let writer = Writer::new(Config::new("/tmp/my-run"));
//! writer.write(&model)?;
//! # Ok::<(), hpctoolkit_metadb::Error>(())
//! ```

#![warn(missing_docs)]

mod codec;
mod config;
mod error;
mod formula;
mod layout;
pub mod model;
mod raw;
mod registry;
mod scope;
mod strings;
mod writer;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use formula::{Expression, LeafKind, OpKind};
pub use model::{Context, Model};
pub use raw::{Combinator, PropagationScope, Relation};
pub use writer::Writer;
