//! The `meta.db` writer proper: entity registration during the
//! notification phase, and the single-pass section-by-section `write()`
//! that follows it.
//!
//! Grounded in `hpcprof::sinks::MetaDB` (`original_source/src/hpcprof/sinks/metadb.cpp`):
//! `notify_context` mirrors `MetaDB::notifyContext`, and `write` mirrors
//! `MetaDB::write`'s section-by-section drive through `formats::*`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::codec::{pad_by, pad_to, put_u16, put_u32, put_u64, put_u8};
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::formula;
use crate::layout::{FileSink, Layout, NullSink, Sink};
use crate::model::{Context, File, Function, LoopScope, Metric, Model, Module, Placeholder, Scope};
use crate::raw::{
    self, Combinator, EntryPointKind, LexicalType, PropagationScope, Relation,
    ALL_PROPAGATION_SCOPES, CONTEXTS_HEADER_SIZE, CONTEXT_BASE_SIZE, DESCRIPTION_LITERAL,
    ENTRY_POINT_RECORD_SIZE, FILES_HEADER_SIZE, FILE_HEADER_SIZE, FILE_RECORD_SIZE,
    FUNCTIONS_HEADER_SIZE, FUNCTION_RECORD_SIZE, GENERAL_SIZE, IDNAMES_HEADER_SIZE,
    IDNAMES_RECORD_SIZE, METRICS_HEADER_SIZE, METRIC_DESCRIPTOR_SIZE, MODULES_HEADER_SIZE,
    MODULE_RECORD_SIZE, PROPAGATION_SCOPE_RECORD_SIZE, SCOPE_INSTANCE_SIZE,
    SUMMARY_STATISTIC_SIZE,
};
use crate::registry::Registry;
use crate::scope::{Written, WriteGuard};
use crate::strings::StringIntern;

/// A file record's side-table entry.
struct FileEntry {
    path_rel: u64,
    copied: bool,
    final_offset: OnceLock<u64>,
}

/// A module record's side-table entry.
struct ModuleEntry {
    path_rel: u64,
    final_offset: OnceLock<u64>,
}

/// A function (or placeholder) record's side-table entry.
struct FunctionEntry {
    name_rel: u64,
    module: Option<Arc<ModuleEntry>>,
    code_offset: u64,
    file: Option<Arc<FileEntry>>,
    line: u32,
    final_offset: OnceLock<u64>,
}

/// The resolved entity references a context's [`Scope`] carries, cached at
/// notification time so `write()`'s context-tree emitter never needs to
/// re-walk the model or re-register anything (`spec.md` §4.H "Unseen" ->
/// "Prepared" transition).
enum ScopeData {
    /// `Scope::Global` or `Scope::Unknown`: no entity is referenced.
    None,
    Function(Arc<FunctionEntry>),
    Line {
        file: Arc<FileEntry>,
        line: u32,
    },
    LoopLexical {
        file: Arc<FileEntry>,
        line: u32,
    },
    LoopBinary {
        file: Arc<FileEntry>,
        line: u32,
        module: Arc<ModuleEntry>,
        offset: u64,
    },
    Point {
        module: Arc<ModuleEntry>,
        offset: u64,
    },
}

/// Per-context decoration populated by `notify_context`, read back by the
/// context-tree emitter in `write()`.
struct ContextSlot {
    scope_data: ScopeData,
    relation: Relation,
    propagation: u8,
    entry_point: Option<EntryPointKind>,
    pretty_name_rel: Option<u64>,
    /// `(size, offset)` of this context's children block. Unset until the
    /// reverse-DFS visits this node during `write()`.
    children: OnceLock<(u64, u64)>,
}

/// Builds a `meta.db` file from a [`Model`].
///
/// A `Writer` is the owned, long-lived home for the side tables `spec.md`
/// §3 describes: the string intern table, the four entity registries, and
/// the per-context decoration map. `notify_context` may be called
/// concurrently from multiple threads while the embedding pipeline
/// discovers contexts (`spec.md` §5); `write` is single-threaded and is
/// called exactly once, after every context has been notified.
pub struct Writer {
    config: Config,
    strings: StringIntern,
    files: Registry<File, Arc<FileEntry>>,
    modules: Registry<Module, Arc<ModuleEntry>>,
    functions: Registry<Function, Arc<FunctionEntry>>,
    placeholders: Registry<Placeholder, Arc<FunctionEntry>>,
    contexts: Mutex<HashMap<u32, ContextSlot>>,
}

impl Writer {
    /// Creates a writer for the given configuration. No I/O happens until
    /// [`write`](Self::write) is called.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            strings: StringIntern::new(),
            files: Registry::new(),
            modules: Registry::new(),
            functions: Registry::new(),
            placeholders: Registry::new(),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a single context, discovered by the embedding pipeline.
    ///
    /// May be called concurrently for distinct contexts (`spec.md` §5).
    /// Calling it twice for the same context id is harmless (idempotent
    /// side effects, last write wins on the decoration slot) but is never
    /// necessary: [`write`](Self::write) also walks the whole tree itself
    /// before emitting any bytes, as a defensive completeness check, since
    /// this crate has no real external pipeline driving it incrementally.
    #[tracing::instrument(level = "trace", name = "Writer::notify_context", skip_all, fields(ctx_id = ctx.id))]
    pub fn notify_context(&self, ctx: &Context, is_top_level: bool) -> crate::Result<()> {
        if matches!(ctx.scope, Scope::Global) {
            return Ok(());
        }

        let scope_data = self.register_scope(&ctx.scope);
        let propagation = if ctx.relation == Relation::Enclosure { 0x1 } else { 0 };

        let (entry_point, pretty_name_rel) = if is_top_level {
            let kind = match &ctx.scope {
                Scope::Unknown => EntryPointKind::Unknown,
                Scope::Placeholder(Placeholder::MainThread) => EntryPointKind::MainThread,
                Scope::Placeholder(Placeholder::ApplicationThread) => {
                    EntryPointKind::ApplicationThread
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::Invariant,
                        io::Error::other(format!(
                            "top-level context {} has an unsupported scope for an entry point: {other:?}",
                            ctx.id
                        )),
                    ));
                }
            };
            let rel = self.strings.intern(kind.pretty_name());
            (Some(kind), Some(rel))
        } else {
            (None, None)
        };

        let slot = ContextSlot {
            scope_data,
            relation: ctx.relation,
            propagation,
            entry_point,
            pretty_name_rel,
            children: OnceLock::new(),
        };
        self.contexts.lock().insert(ctx.id, slot);
        Ok(())
    }

    /// Walks `ctx` and every descendant, calling [`notify_context`](Self::notify_context)
    /// on each.
    fn notify_tree(&self, ctx: &Context, is_top_level: bool) -> crate::Result<()> {
        self.notify_context(ctx, is_top_level)?;
        let children_are_top_level = matches!(ctx.scope, Scope::Global);
        for child in &ctx.children {
            self.notify_tree(child, children_are_top_level)?;
        }
        Ok(())
    }

    fn register_scope(&self, scope: &Scope) -> ScopeData {
        match scope {
            Scope::Global | Scope::Unknown => ScopeData::None,
            Scope::Placeholder(placeholder) => {
                let entry = self.placeholders.get_or_init(*placeholder, || {
                    let name_rel = self.strings.intern(placeholder.pretty_name());
                    Arc::new(FunctionEntry {
                        name_rel,
                        module: None,
                        code_offset: 0,
                        file: None,
                        line: 0,
                        final_offset: OnceLock::new(),
                    })
                });
                ScopeData::Function(entry)
            }
            Scope::Function(function) => {
                let entry = self
                    .functions
                    .get_or_init(function.clone(), || self.build_function_entry(function));
                ScopeData::Function(entry)
            }
            Scope::Line { file, line } => ScopeData::Line {
                file: self.register_file(file),
                line: *line,
            },
            Scope::Loop(LoopScope::Lexical { file, line }) => ScopeData::LoopLexical {
                file: self.register_file(file),
                line: *line,
            },
            Scope::Loop(LoopScope::Binary {
                file,
                line,
                module,
                offset,
            }) => ScopeData::LoopBinary {
                file: self.register_file(file),
                line: *line,
                module: self.register_module(module),
                offset: *offset,
            },
            Scope::Point { module, offset } => ScopeData::Point {
                module: self.register_module(module),
                offset: *offset,
            },
        }
    }

    fn build_function_entry(&self, function: &Function) -> Arc<FunctionEntry> {
        let name_rel = self.strings.intern(&function.name);
        let module = function.module.as_ref().map(|m| self.register_module(m));
        let file = function
            .location
            .as_ref()
            .map(|(file, _)| self.register_file(file));
        let line = function.location.as_ref().map_or(0, |(_, line)| *line);
        Arc::new(FunctionEntry {
            name_rel,
            module,
            code_offset: function.offset.unwrap_or(0),
            file,
            line,
            final_offset: OnceLock::new(),
        })
    }

    fn register_module(&self, module: &Module) -> Arc<ModuleEntry> {
        self.modules.get_or_init(module.clone(), || {
            let path_rel = self.strings.intern(&module.path);
            Arc::new(ModuleEntry {
                path_rel,
                final_offset: OnceLock::new(),
            })
        })
    }

    fn register_file(&self, file: &File) -> Arc<FileEntry> {
        self.files.get_or_init(file.clone(), || {
            let (record_path, copied) = self.copy_file_if_configured(file);
            let path_rel = self.strings.intern(&record_path);
            Arc::new(FileEntry {
                path_rel,
                copied,
                final_offset: OnceLock::new(),
            })
        })
    }

    /// Attempts to copy `file`'s resolved path into the output directory's
    /// `src/` tree, if configured to do so (`spec.md` §4.E "Special case —
    /// file copying"). Returns the path string the file's record should
    /// carry, and whether the copy succeeded.
    ///
    /// A copy failure is logged and demoted to `copied = false`; it is
    /// never fatal (`spec.md` §7).
    fn copy_file_if_configured(&self, file: &File) -> (String, bool) {
        if self.config.copy_sources {
            if let (Some(output_dir), Some(resolved)) =
                (&self.config.output_directory, &file.resolved_path)
            {
                let normalized = normalize_relative(resolved);
                let dest_rel = format!("./src/{}", normalized.display());
                let dest = output_dir.join("src").join(&normalized);
                let result = dest
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|()| std::fs::copy(resolved, &dest).map(|_| ()));
                match result {
                    Ok(()) => return (dest_rel, true),
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            path = %resolved.display(),
                            "failed to copy source file into meta.db output directory"
                        );
                    }
                }
            }
        }
        (file.path.clone(), false)
    }

    fn is_elided(ctx: &Context) -> bool {
        ctx.relation == Relation::Enclosure && matches!(ctx.scope, Scope::Point { .. })
    }

    /// Runs the full write pass: ensures every context has been notified,
    /// then emits every section in the fixed order `spec.md` §4.G and §6
    /// describe, finishing with the footer.
    ///
    /// With [`Config::output_directory`] set to `None`, the model is still
    /// walked and every invariant still checked, but no bytes reach disk
    /// (`spec.md` §8 property 10).
    #[tracing::instrument(level = "trace", name = "Writer::write", skip_all)]
    pub fn write(&self, model: &dyn Model) -> crate::Result<()> {
        self.notify_tree(model.global_context(), false)?;

        let mut layout = Layout::new();
        let mut sink: Box<dyn Sink> = match &self.config.output_directory {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = std::fs::File::create(dir.join("meta.db"))?;
                Box::new(FileSink::new(file))
            }
            None => Box::new(NullSink),
        };

        let mut header: WriteGuard<HeaderFields> =
            WriteGuard::new(&mut layout, FILE_HEADER_SIZE, 8, HeaderFields::default());

        // Pieces written *before* the strings section (general, id-names,
        // metrics) but whose bytes embed string pointers can't be finished
        // until the strings section is committed and its base offset is
        // known. Each closure captures everything it needs and is run once
        // that's true.
        let mut pending: Vec<(u64, Box<dyn FnOnce(u64) -> Vec<u8>>)> = Vec::new();

        // --- General properties ---
        let attrs = model.attributes();
        let title = attrs
            .name
            .clone()
            .unwrap_or_else(|| "<unnamed>".to_string());
        let title_rel = self.strings.intern(&title);
        let desc_rel = self.strings.intern(DESCRIPTION_LITERAL);
        let general_offset = layout.allocate(GENERAL_SIZE, 8);
        header.data.general = (general_offset, GENERAL_SIZE);
        pending.push((
            general_offset,
            Box::new(move |base| {
                let mut buf = Vec::with_capacity(GENERAL_SIZE as usize);
                put_u64(&mut buf, base + title_rel);
                put_u64(&mut buf, base + desc_rel);
                buf
            }),
        ));

        // --- Identifier names ---
        let empty_rel = self.strings.intern("");
        let id_rel: Vec<u64> = attrs
            .id_kind_names
            .iter()
            .map(|name| {
                name.as_deref()
                    .map(|n| self.strings.intern(n))
                    .unwrap_or(empty_rel)
            })
            .collect();
        let id_count = id_rel.len() as u64;
        let id_array_offset = layout.allocate(id_count * IDNAMES_RECORD_SIZE, 8);
        pending.push((
            id_array_offset,
            Box::new(move |base| {
                let mut buf = Vec::with_capacity(id_rel.len() * IDNAMES_RECORD_SIZE as usize);
                for rel in id_rel {
                    put_u64(&mut buf, base + rel);
                }
                buf
            }),
        ));
        let id_header_offset = layout.allocate(IDNAMES_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(IDNAMES_HEADER_SIZE as usize);
            put_u64(&mut buf, id_array_offset);
            put_u64(&mut buf, id_count);
            sink.write_at(id_header_offset, &buf)?;
        }
        header.data.id_names = (id_header_offset, IDNAMES_HEADER_SIZE);

        // --- Performance metrics ---
        let prop_array_offset =
            layout.allocate(ALL_PROPAGATION_SCOPES.len() as u64 * PROPAGATION_SCOPE_RECORD_SIZE, 8);
        let prop_name_rel: Vec<u64> = ALL_PROPAGATION_SCOPES
            .iter()
            .map(|scope| self.strings.intern(scope.name()))
            .collect();
        {
            let prop_name_rel = prop_name_rel.clone();
            pending.push((
                prop_array_offset,
                Box::new(move |base| {
                    let mut buf = Vec::with_capacity(
                        ALL_PROPAGATION_SCOPES.len() * PROPAGATION_SCOPE_RECORD_SIZE as usize,
                    );
                    for (scope, rel) in ALL_PROPAGATION_SCOPES.iter().zip(prop_name_rel) {
                        put_u64(&mut buf, base + rel);
                        put_u8(&mut buf, scope.type_code());
                        put_u8(&mut buf, scope.propagation_index());
                        pad_to(&mut buf, PROPAGATION_SCOPE_RECORD_SIZE as usize);
                    }
                    buf
                }),
            ));
        }
        let prop_record_address =
            |scope: PropagationScope| -> u64 {
                let index = ALL_PROPAGATION_SCOPES
                    .iter()
                    .position(|s| *s == scope)
                    .expect("PropagationScope is always one of ALL_PROPAGATION_SCOPES");
                prop_array_offset + index as u64 * PROPAGATION_SCOPE_RECORD_SIZE
            };

        let metrics = model.metrics();
        let mut descriptor_inputs = Vec::with_capacity(metrics.len());
        for metric in metrics {
            let input = self.layout_metric(metric, &prop_record_address, &mut layout, &mut sink)?;
            let summary_rows = input.summary_rows.clone();
            pending.push((
                input.summary_statistics_offset,
                Box::new(move |base| {
                    let mut buf =
                        Vec::with_capacity(summary_rows.len() * SUMMARY_STATISTIC_SIZE as usize);
                    for (scope_addr, formula_rel, combinator, id) in summary_rows {
                        put_u64(&mut buf, scope_addr);
                        put_u64(&mut buf, base + formula_rel);
                        put_u8(&mut buf, combinator.code());
                        pad_by(&mut buf, 1);
                        put_u16(&mut buf, id);
                        pad_by(&mut buf, 4);
                    }
                    buf
                }),
            ));
            descriptor_inputs.push(input);
        }
        let descriptor_array_offset =
            layout.allocate(metrics.len() as u64 * METRIC_DESCRIPTOR_SIZE, 8);
        pending.push((
            descriptor_array_offset,
            Box::new(move |base| {
                let mut buf =
                    Vec::with_capacity(descriptor_inputs.len() * METRIC_DESCRIPTOR_SIZE as usize);
                for input in descriptor_inputs {
                    put_u64(&mut buf, base + input.name_rel);
                    put_u64(&mut buf, input.scope_instances_offset);
                    put_u16(&mut buf, input.scope_instances_count);
                    pad_by(&mut buf, 2);
                    put_u64(&mut buf, input.summary_statistics_offset);
                    put_u16(&mut buf, input.summary_statistics_count);
                    pad_by(&mut buf, 2);
                }
                buf
            }),
        ));
        let metrics_header_offset = layout.allocate(METRICS_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(METRICS_HEADER_SIZE as usize);
            put_u64(&mut buf, prop_array_offset);
            put_u32(&mut buf, ALL_PROPAGATION_SCOPES.len() as u32);
            pad_by(&mut buf, 4);
            put_u64(&mut buf, descriptor_array_offset);
            put_u32(&mut buf, metrics.len() as u32);
            pad_by(&mut buf, 4);
            sink.write_at(metrics_header_offset, &buf)?;
        }
        header.data.metrics = (metrics_header_offset, METRICS_HEADER_SIZE);

        // --- Strings (committed here so everything above can resolve) ---
        let strings_bytes = self.strings.emit();
        let strings_written = Written::write(&mut layout, &mut *sink, &strings_bytes, 1)?;
        let strings_base = strings_written.offset();
        header.data.strings = (strings_written.offset(), strings_written.size());

        for (offset, build) in pending {
            let bytes = build(strings_base);
            sink.write_at(offset, &bytes)?;
        }

        // --- Load modules ---
        let module_entries = self.modules.drain();
        let modules_array_offset =
            layout.allocate(module_entries.len() as u64 * MODULE_RECORD_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(module_entries.len() * MODULE_RECORD_SIZE as usize);
            for (_, entry) in &module_entries {
                put_u64(&mut buf, strings_base + entry.path_rel);
                pad_by(&mut buf, MODULE_RECORD_SIZE as usize - 8);
            }
            sink.write_at(modules_array_offset, &buf)?;
        }
        for (index, (_, entry)) in module_entries.iter().enumerate() {
            let _ = entry
                .final_offset
                .set(modules_array_offset + index as u64 * MODULE_RECORD_SIZE);
        }
        let modules_header_offset = layout.allocate(MODULES_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(MODULES_HEADER_SIZE as usize);
            put_u64(&mut buf, modules_array_offset);
            put_u64(&mut buf, module_entries.len() as u64);
            sink.write_at(modules_header_offset, &buf)?;
        }
        header.data.modules = (modules_header_offset, MODULES_HEADER_SIZE);

        // --- Source files ---
        let file_entries = self.files.drain();
        let files_array_offset = layout.allocate(file_entries.len() as u64 * FILE_RECORD_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(file_entries.len() * FILE_RECORD_SIZE as usize);
            for (_, entry) in &file_entries {
                put_u8(&mut buf, entry.copied as u8);
                pad_by(&mut buf, 7);
                put_u64(&mut buf, strings_base + entry.path_rel);
            }
            sink.write_at(files_array_offset, &buf)?;
        }
        for (index, (_, entry)) in file_entries.iter().enumerate() {
            let _ = entry
                .final_offset
                .set(files_array_offset + index as u64 * FILE_RECORD_SIZE);
        }
        let files_header_offset = layout.allocate(FILES_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(FILES_HEADER_SIZE as usize);
            put_u64(&mut buf, files_array_offset);
            put_u64(&mut buf, file_entries.len() as u64);
            sink.write_at(files_header_offset, &buf)?;
        }
        header.data.files = (files_header_offset, FILES_HEADER_SIZE);

        // --- Functions (registered functions first, then placeholders) ---
        let mut function_entries: Vec<Arc<FunctionEntry>> = self
            .functions
            .drain()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();
        function_entries.extend(self.placeholders.drain().into_iter().map(|(_, entry)| entry));
        let functions_array_offset =
            layout.allocate(function_entries.len() as u64 * FUNCTION_RECORD_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(function_entries.len() * FUNCTION_RECORD_SIZE as usize);
            for entry in &function_entries {
                put_u64(&mut buf, strings_base + entry.name_rel);
                put_u64(
                    &mut buf,
                    entry
                        .module
                        .as_ref()
                        .map_or(0, |m| *m.final_offset.get().expect("module offset not set")),
                );
                put_u64(&mut buf, entry.code_offset);
                put_u64(
                    &mut buf,
                    entry
                        .file
                        .as_ref()
                        .map_or(0, |f| *f.final_offset.get().expect("file offset not set")),
                );
                put_u32(&mut buf, entry.line);
                pad_by(&mut buf, 4);
            }
            sink.write_at(functions_array_offset, &buf)?;
        }
        for (index, entry) in function_entries.iter().enumerate() {
            let _ = entry
                .final_offset
                .set(functions_array_offset + index as u64 * FUNCTION_RECORD_SIZE);
        }
        let functions_header_offset = layout.allocate(FUNCTIONS_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(FUNCTIONS_HEADER_SIZE as usize);
            put_u64(&mut buf, functions_array_offset);
            put_u64(&mut buf, function_entries.len() as u64);
            sink.write_at(functions_header_offset, &buf)?;
        }
        header.data.functions = (functions_header_offset, FUNCTIONS_HEADER_SIZE);

        // --- Contexts ---
        let root = model.global_context();
        let mut entry_points = Vec::with_capacity(root.children.len());
        for top in &root.children {
            self.visit(top, &mut layout, &mut *sink)?;
            let slots = self.contexts.lock();
            let slot = slots
                .get(&top.id)
                .expect("top-level context was not notified");
            let (children_size, children_offset) = slot.children.get().copied().unwrap_or((0, 0));
            entry_points.push(EntryPointInput {
                ctx_id: top.id,
                children_size,
                children_offset,
                entry_point: slot
                    .entry_point
                    .expect("top-level context missing an entry point kind"),
                pretty_name_rel: slot
                    .pretty_name_rel
                    .expect("top-level context missing a pretty name"),
            });
        }
        let entry_array_offset =
            layout.allocate(entry_points.len() as u64 * ENTRY_POINT_RECORD_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(entry_points.len() * ENTRY_POINT_RECORD_SIZE as usize);
            for ep in &entry_points {
                put_u64(&mut buf, ep.children_size);
                put_u64(&mut buf, ep.children_offset);
                put_u32(&mut buf, ep.ctx_id);
                put_u16(&mut buf, ep.entry_point.code());
                pad_by(&mut buf, 2);
                put_u64(&mut buf, strings_base + ep.pretty_name_rel);
            }
            sink.write_at(entry_array_offset, &buf)?;
        }
        let contexts_header_offset = layout.allocate(CONTEXTS_HEADER_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(CONTEXTS_HEADER_SIZE as usize);
            put_u64(&mut buf, entry_array_offset);
            put_u64(&mut buf, entry_points.len() as u64);
            sink.write_at(contexts_header_offset, &buf)?;
        }
        header.data.contexts = (contexts_header_offset, CONTEXTS_HEADER_SIZE);

        // --- Footer ---
        Written::write(&mut layout, &mut *sink, &raw::FOOTER, 8)?;

        header.finish(&mut *sink, serialize_header)?;
        Ok(())
    }

    /// Lays out one metric's scope-instance and summary-statistic arrays
    /// and returns the inputs its descriptor record needs.
    ///
    /// Scope-instance records carry no string pointers (only propagation
    /// scope record addresses and small integer ids), so they're committed
    /// immediately; summary-statistic records carry a formula string
    /// pointer and so must wait for the strings section — that array is
    /// reserved here but filled in by the caller once the strings base is
    /// known.
    fn layout_metric(
        &self,
        metric: &Metric,
        prop_record_address: &impl Fn(PropagationScope) -> u64,
        layout: &mut Layout,
        sink: &mut dyn Sink,
    ) -> crate::Result<MetricDescriptorInput> {
        let name_rel = self.strings.intern(&metric.name);

        let mut scope_instance_rows = Vec::new();
        for partial in &metric.partials {
            for scope in &metric.scopes {
                let id = *partial.ids.get(scope).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Invariant,
                        io::Error::other(format!(
                            "metric {:?} has no identifier assignment for partial in scope {scope:?}",
                            metric.name
                        )),
                    )
                })?;
                scope_instance_rows.push((prop_record_address(*scope), id));
            }
        }
        let scope_instances_offset =
            layout.allocate(scope_instance_rows.len() as u64 * SCOPE_INSTANCE_SIZE, 8);
        {
            let mut buf = Vec::with_capacity(scope_instance_rows.len() * SCOPE_INSTANCE_SIZE as usize);
            for (scope_addr, id) in &scope_instance_rows {
                put_u64(&mut buf, *scope_addr);
                put_u16(&mut buf, *id);
                pad_by(&mut buf, 6);
            }
            sink.write_at(scope_instances_offset, &buf)?;
        }

        let mut summary_rows = Vec::new();
        for statistic in &metric.statistics {
            let formula = formula::serialize(&statistic.finalize)?;
            let formula_rel = self.strings.intern(&formula);
            for scope in &metric.scopes {
                let id = *statistic.ids.get(scope).ok_or_else(|| {
                    Error::new(
                        ErrorKind::Invariant,
                        io::Error::other(format!(
                            "metric {:?} has no identifier assignment for a statistic in scope {scope:?}",
                            metric.name
                        )),
                    )
                })?;
                summary_rows.push((
                    prop_record_address(*scope),
                    formula_rel,
                    statistic.combinator,
                    id,
                ));
            }
        }
        let summary_statistics_offset =
            layout.allocate(summary_rows.len() as u64 * SUMMARY_STATISTIC_SIZE, 8);

        Ok(MetricDescriptorInput {
            name_rel,
            scope_instances_offset,
            scope_instances_count: scope_instance_rows.len() as u16,
            summary_statistics_offset,
            summary_statistics_count: summary_rows.len() as u16,
            summary_rows,
        })
    }

    /// Reverse-DFS over `ctx`'s children: materializes each non-elided
    /// child's (and, for an elided child, each grandchild's) record into
    /// `ctx`'s children block, then commits that block and records its
    /// coordinates in `ctx`'s slot (`spec.md` §4.H).
    fn visit(&self, ctx: &Context, layout: &mut Layout, sink: &mut dyn Sink) -> crate::Result<()> {
        let mut block = Vec::new();
        for child in &ctx.children {
            if Self::is_elided(child) {
                for grandchild in &child.children {
                    if Self::is_elided(grandchild) {
                        return Err(Error::new(
                            ErrorKind::Invariant,
                            io::Error::other(format!(
                                "context {} is elided but so is its parent {} (elision is single-level only)",
                                grandchild.id, child.id
                            )),
                        ));
                    }
                    self.visit(grandchild, layout, sink)?;
                    block.extend(self.compose(grandchild)?);
                }
            } else {
                self.visit(child, layout, sink)?;
                block.extend(self.compose(child)?);
            }
        }
        let (size, offset) = if block.is_empty() {
            (0, 0)
        } else {
            let written = Written::write(layout, sink, &block, 8)?;
            (written.size(), written.offset())
        };
        let mut slots = self.contexts.lock();
        let slot = slots
            .get_mut(&ctx.id)
            .expect("context was not notified before write()");
        slot.children
            .set((size, offset))
            .map_err(|_| ())
            .expect("a context's children block was committed twice");
        Ok(())
    }

    /// Produces the bytes of an ordinary (non-top-level) context record.
    fn compose(&self, ctx: &Context) -> crate::Result<Vec<u8>> {
        let slots = self.contexts.lock();
        let slot = slots
            .get(&ctx.id)
            .expect("context was not notified before write()");
        let (children_size, children_offset) = slot.children.get().copied().unwrap_or((0, 0));
        let relation_code = slot.relation.code().ok_or_else(|| {
            Error::new(
                ErrorKind::Invariant,
                io::Error::other(format!(
                    "context {} uses the Global relation but is not the root",
                    ctx.id
                )),
            )
        })?;
        let (lexical_type, flex) = scope_fields(&slot.scope_data);

        let mut buf = Vec::with_capacity(CONTEXT_BASE_SIZE as usize + flex.len() * 8);
        put_u64(&mut buf, children_size);
        put_u64(&mut buf, children_offset);
        put_u32(&mut buf, ctx.id);
        put_u8(&mut buf, slot.propagation);
        put_u8(&mut buf, relation_code);
        put_u8(&mut buf, lexical_type as u8);
        pad_by(&mut buf, 1);
        put_u64(&mut buf, 0); // reserved, pads the fixed header to CONTEXT_BASE_SIZE
        for word in flex {
            put_u64(&mut buf, word);
        }
        Ok(buf)
    }
}

/// The absolute address of an entity's committed record, read back after
/// its section has been written.
fn final_of<T>(entry: &Arc<T>, get: impl Fn(&T) -> &OnceLock<u64>) -> u64 {
    *get(entry)
        .get()
        .expect("entity final offset was not resolved before the context section was written")
}

/// Builds the `(lexicalType, flex words)` pair for a context's scope, per
/// `spec.md` §4.H's positional-prefix flex-word scheme: the flex region is
/// always a prefix of `[pFunction, pFile, line, pModule, offset]`.
fn scope_fields(data: &ScopeData) -> (LexicalType, Vec<u64>) {
    match data {
        ScopeData::None => (LexicalType::Function, vec![0]),
        ScopeData::Function(f) => (
            LexicalType::Function,
            vec![final_of(f, |e| &e.final_offset)],
        ),
        ScopeData::Line { file, line } => (
            LexicalType::Line,
            vec![0, final_of(file, |e| &e.final_offset), *line as u64],
        ),
        ScopeData::LoopLexical { file, line } => (
            LexicalType::Loop,
            vec![0, final_of(file, |e| &e.final_offset), *line as u64],
        ),
        ScopeData::LoopBinary {
            file,
            line,
            module,
            offset,
        } => (
            LexicalType::Loop,
            vec![
                0,
                final_of(file, |e| &e.final_offset),
                *line as u64,
                final_of(module, |e| &e.final_offset),
                *offset,
            ],
        ),
        ScopeData::Point { module, offset } => (
            LexicalType::Instruction,
            vec![0, 0, 0, final_of(module, |e| &e.final_offset), *offset],
        ),
    }
}

/// Strips root/prefix components from a path, leaving only its `Normal`
/// components — used to place a copied source file under
/// `<output_directory>/src/` without walking outside it.
fn normalize_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect()
}

#[derive(Default)]
struct HeaderFields {
    general: (u64, u64),
    id_names: (u64, u64),
    metrics: (u64, u64),
    modules: (u64, u64),
    files: (u64, u64),
    functions: (u64, u64),
    contexts: (u64, u64),
    strings: (u64, u64),
}

fn serialize_header(h: &HeaderFields) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FILE_HEADER_SIZE as usize);
    buf.extend_from_slice(&raw::MAGIC);
    pad_by(&mut buf, 2);
    put_u32(&mut buf, raw::VERSION);
    pad_by(&mut buf, 4);
    for (offset, size) in [
        h.general,
        h.id_names,
        h.metrics,
        h.modules,
        h.files,
        h.functions,
        h.contexts,
        h.strings,
    ] {
        put_u64(&mut buf, offset);
        put_u64(&mut buf, size);
    }
    buf
}

struct MetricDescriptorInput {
    name_rel: u64,
    scope_instances_offset: u64,
    scope_instances_count: u16,
    summary_statistics_offset: u64,
    summary_statistics_count: u16,
    summary_rows: Vec<(u64, u64, Combinator, u16)>,
}

struct EntryPointInput {
    ctx_id: u32,
    children_size: u64,
    children_offset: u64,
    entry_point: EntryPointKind,
    pretty_name_rel: u64,
}
