//! The read-only input model handed to a [`crate::Writer`].
//!
//! Everything here is produced by upstream pipeline stages (classification,
//! symbolization, source-file resolution, identifier assignment —
//! `spec.md` §1) and is only ever read by this crate, never mutated. The
//! context tree owns its own children (`Vec<Context>`), matching the "no
//! cycles, contexts can become slab indices" note in `spec.md` §9: there is
//! no shared mutable state to thread through a trait-object model, so a
//! plain owned tree is simplest.

use std::path::PathBuf;

use crate::formula::Expression;
use crate::raw::{Combinator, PropagationScope, Relation};

/// A logical source file, identified by its original (logical) path.
///
/// Two `File`s are the same entity iff their fields compare equal —
/// registration in [`crate::Writer`] is content-keyed (`spec.md` §4.E), not
/// keyed by any numeric id the model happens to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct File {
    /// The path as it appeared in the profiled binary's debug info.
    pub path: String,
    /// The resolved, absolute filesystem path, if the pipeline was able to
    /// find the file on disk. Required for `copy_sources` to do anything.
    pub resolved_path: Option<PathBuf>,
}

impl File {
    /// Creates a file known only by its logical path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            resolved_path: None,
        }
    }

    /// Attaches a resolved filesystem path, enabling source copying.
    pub fn with_resolved_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolved_path = Some(path.into());
        self
    }
}

/// A logical binary (shared library, executable), identified by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Module {
    /// The module's path, as reported by the sampling runtime.
    pub path: String,
}

impl Module {
    /// Creates a module with the given path.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// A distinct called unit: a function, identified by name and owning
/// module, with optional machine offset and source origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Function {
    /// The function's (possibly demangled) name.
    pub name: String,
    /// The module the function's code lives in, if known.
    pub module: Option<Module>,
    /// The function's entry offset within its module, if known.
    pub offset: Option<u64>,
    /// The (file, line) the function is defined at, if known.
    pub location: Option<(File, u32)>,
}

impl Function {
    /// Creates a function known only by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            offset: None,
            location: None,
        }
    }

    /// Attaches the owning module and machine offset.
    pub fn with_module(mut self, module: Module, offset: u64) -> Self {
        self.module = Some(module);
        self.offset = Some(offset);
        self
    }

    /// Attaches the (file, line) origin location.
    pub fn with_location(mut self, file: File, line: u32) -> Self {
        self.location = Some((file, line));
        self
    }
}

/// A synthetic marker context, treated as a kind of function.
///
/// `spec.md` names two examples abstractly ("program root", "gpu kernel");
/// `original_source/` resolves the two *top-level* placeholders concretely
/// to `hpcrun_placeholder_fence_main`/`_thread`. The other two variants
/// here generalize the spec's "e.g." examples for placeholders that appear
/// elsewhere in the tree (never at top level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// The entry point of the process's main thread. Legal at top level.
    MainThread,
    /// The entry point of a non-main application thread. Legal at top level.
    ApplicationThread,
    /// A synthetic root standing in for "the whole program", used as a
    /// non-top-level marker (e.g. under a sampled idle frame).
    ProgramRoot,
    /// A synthetic marker for an opaque accelerator (GPU) kernel invocation.
    GpuKernel,
}

impl Placeholder {
    /// The pretty (human-facing) name written for this placeholder.
    pub fn pretty_name(self) -> &'static str {
        match self {
            Placeholder::MainThread => "main thread",
            Placeholder::ApplicationThread => "application thread",
            Placeholder::ProgramRoot => "program root",
            Placeholder::GpuKernel => "gpu kernel",
        }
    }
}

/// The lexical classification of a [`Context`].
///
/// Mirrors `spec.md` §3's `Scope` tagged union. `File`/`Module` values are
/// cloned into the variant rather than referenced by id, consistent with
/// content-keyed registration (`spec.md` §4.E).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The root of the calling-context tree. Only legal on the context with
    /// id 0.
    Global,
    /// A context whose lexical classification could not be determined.
    Unknown,
    /// A synthetic marker context.
    Placeholder(Placeholder),
    /// A single source line, with no further code-address precision.
    Line { file: File, line: u32 },
    /// A loop, either purely lexical (source-level only) or anchored to a
    /// specific binary range.
    Loop(LoopScope),
    /// An instruction-granularity context (module + code offset).
    Point { module: Module, offset: u64 },
    /// A named function.
    Function(Function),
}

/// A loop [`Scope`], distinguishing a purely lexical loop from one also
/// anchored to a binary instruction range.
///
/// Both map to `lexicalType = loop` on the wire (`spec.md` §4.H); the
/// distinction only changes whether `pModule`/`offset` are also written.
/// Whether a reader treats the two identically downstream is explicitly
/// left unspecified (`spec.md` §9).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoopScope {
    /// A loop known only by its source location.
    Lexical { file: File, line: u32 },
    /// A loop additionally anchored to a binary instruction range.
    Binary {
        file: File,
        line: u32,
        module: Module,
        offset: u64,
    },
}

/// A node of the calling-context tree.
#[derive(Debug, Clone)]
pub struct Context {
    /// This context's stable identifier. The global root always has id 0
    /// (`spec.md` §3 invariant 7).
    pub id: u32,
    /// This context's lexical classification.
    pub scope: Scope,
    /// This context's relation to its parent. Meaningless (and ignored) on
    /// the global root.
    pub relation: Relation,
    /// This context's children, in model order.
    pub children: Vec<Context>,
}

impl Context {
    /// Creates the global root context (id 0).
    pub fn global(children: Vec<Context>) -> Self {
        Self {
            id: 0,
            scope: Scope::Global,
            relation: Relation::Global,
            children,
        }
    }

    /// Creates a non-root context.
    pub fn new(id: u32, scope: Scope, relation: Relation, children: Vec<Context>) -> Self {
        Self {
            id,
            scope,
            relation,
            children,
        }
    }
}

/// A combinator + accumulate-expression pair: an intermediate per-context
/// metric value contribution.
#[derive(Debug, Clone)]
pub struct Partial {
    /// How per-context contributions are combined while propagating up the
    /// tree.
    pub combinator: Combinator,
    /// The expression used to fold a raw sample into this partial.
    ///
    /// Not written to `meta.db` directly (`spec.md` §4.G only emits formula
    /// strings for *statistics*; accumulation is the concern of the
    /// per-metric-value writer this crate treats as an external
    /// collaborator, `spec.md` §1) but kept on the model for completeness
    /// and so the formula serializer (`spec.md` §4.F) can be exercised
    /// against it in tests.
    pub accumulate: Expression,
    /// Per enabled propagation scope, the stable identifier-assignment
    /// slot id for this partial (`spec.md` §3's "identifier assignment").
    pub ids: std::collections::HashMap<PropagationScope, u16>,
}

/// A finalize expression combining partials into a user-visible value.
#[derive(Debug, Clone)]
pub struct Statistic {
    /// A short, display-facing suffix (e.g. `"Sum"`, `"Mean"`) appended to
    /// the metric's name to form the statistic's full display name. Not
    /// itself written into the summary-statistic record (`spec.md` §4.G
    /// does not give that record a name pointer), but useful for callers
    /// building metric names and for tests to describe scenarios.
    pub suffix: String,
    /// The expression combining one or more partials into this statistic's
    /// value.
    pub finalize: Expression,
    /// The combinator the summary-statistic record reports. In practice
    /// this mirrors the [`Partial::combinator`] of the partial(s) this
    /// statistic summarizes — `spec.md` itself only states that partials
    /// carry a combinator, but the summary-statistic *record* in §4.G has
    /// its own combinator field, so we carry one on `Statistic` too and
    /// document the correspondence in `DESIGN.md`.
    pub combinator: Combinator,
    /// Per enabled propagation scope, the stable identifier-assignment
    /// slot id for this statistic.
    pub ids: std::collections::HashMap<PropagationScope, u16>,
}

/// A metric: a named, described quantity propagated through the context
/// tree according to a set of enabled [`PropagationScope`]s.
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric's name (e.g. `"cycles"`).
    pub name: String,
    /// A longer, human-facing description.
    pub description: String,
    /// The propagation scopes this metric is enabled for, a subset of
    /// [`crate::raw::ALL_PROPAGATION_SCOPES`]. Order here is irrelevant —
    /// the writer always emits scope-instance/summary-statistic entries in
    /// the fixed canonical order.
    pub scopes: Vec<PropagationScope>,
    /// This metric's partials, in model order.
    pub partials: Vec<Partial>,
    /// This metric's statistics, in model order.
    pub statistics: Vec<Statistic>,
}

/// Identifier-kind names and the database's display title/description.
#[derive(Debug, Clone, Default)]
pub struct Attributes {
    /// The model's display name, or `None` for the default `<unnamed>`.
    pub name: Option<String>,
    /// A description of the model. Currently ignored by the general
    /// properties section writer, which always emits the literal
    /// `"TODO database description"` (`spec.md` §4.G, §9) — kept here so
    /// the field exists for when that becomes configurable.
    pub description: Option<String>,
    /// Human names for each identifier kind, indexed by kind id. A `None`
    /// entry is a gap, written as a pointer to a shared empty string.
    pub id_kind_names: Vec<Option<String>>,
}

/// The read-only input to a [`crate::Writer`]: metrics, files, modules and
/// the calling-context tree for one profiled execution.
///
/// `spec.md` §6 additionally lists source files, load modules and
/// functions as entities the model exposes; this crate discovers all three
/// purely by walking the context tree's [`Scope`] values (content-keyed
/// registration, `spec.md` §4.E), so `Model` itself only needs to expose
/// what isn't reachable that way.
pub trait Model {
    /// The database's display attributes.
    fn attributes(&self) -> &Attributes;
    /// The model's metrics, in model order.
    fn metrics(&self) -> &[Metric];
    /// The root of the calling-context tree (always `Scope::Global`, id 0).
    fn global_context(&self) -> &Context;
}
