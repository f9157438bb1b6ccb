//! End-to-end coverage of [`Writer`] against a handful of small, explicit
//! models: the file header and footer are always well-formed, entry points
//! and elision behave per `spec.md` §4.H, copy-on-reference for source
//! files works and tolerates failure, and a model that skips an identifier
//! assignment is rejected rather than silently mis-written.

use std::collections::HashMap;

use hpctoolkit_metadb::model::{Attributes, Context, LoopScope, Metric, Model, Partial, Placeholder, Scope, Statistic};
use hpctoolkit_metadb::{Combinator, Config, Error, ErrorKind, Expression, PropagationScope, Relation, Writer};

struct FixedModel {
    attributes: Attributes,
    metrics: Vec<Metric>,
    root: Context,
}

impl FixedModel {
    fn new(root: Context) -> Self {
        Self {
            attributes: Attributes::default(),
            metrics: Vec::new(),
            root,
        }
    }

    fn with_metrics(mut self, metrics: Vec<Metric>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Model for FixedModel {
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    fn global_context(&self) -> &Context {
        &self.root
    }
}

fn ids_for(scopes: &[PropagationScope]) -> HashMap<PropagationScope, u16> {
    scopes
        .iter()
        .enumerate()
        .map(|(i, scope)| (*scope, i as u16))
        .collect()
}

fn read_meta_db(dir: &std::path::Path) -> Vec<u8> {
    std::fs::read(dir.join("meta.db")).expect("meta.db was not written")
}

#[test]
fn empty_model_has_a_well_formed_header_and_footer() {
    let dir = tempfile::tempdir().unwrap();
    let model = FixedModel::new(Context::global(Vec::new()));
    Writer::new(Config::new(dir.path())).write(&model).unwrap();

    let bytes = read_meta_db(dir.path());
    assert_eq!(&bytes[0..6], b"metadb");
    assert_eq!(&bytes[bytes.len() - 8..], b"_metadb\0");
    assert!(bytes.len() >= 144, "file must be at least as long as the fixed header");
}

#[test]
fn single_placeholder_entry_point_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        Vec::new(),
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));
    Writer::new(Config::new(dir.path())).write(&model).unwrap();

    let bytes = read_meta_db(dir.path());
    assert_eq!(&bytes[bytes.len() - 8..], b"_metadb\0");
}

#[test]
fn a_non_placeholder_top_level_scope_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    // A bare function at top level has no entry-point kind to report.
    let stray = Context::new(
        1,
        Scope::Function(hpctoolkit_metadb::model::Function::new("main")),
        Relation::Call,
        Vec::new(),
    );
    let model = FixedModel::new(Context::global(vec![stray]));
    let err = Writer::new(Config::new(dir.path())).write(&model).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Invariant));
}

#[test]
fn single_level_elision_promotes_grandchildren() {
    let dir = tempfile::tempdir().unwrap();

    let line = Context::new(
        4,
        Scope::Line {
            file: hpctoolkit_metadb::model::File::new("main.c"),
            line: 42,
        },
        Relation::Call,
        Vec::new(),
    );
    let point = Context::new(
        3,
        Scope::Point {
            module: hpctoolkit_metadb::model::Module::new("a.out"),
            offset: 0x1000,
        },
        Relation::Enclosure,
        vec![line],
    );
    let function = Context::new(
        2,
        Scope::Function(hpctoolkit_metadb::model::Function::new("main")),
        Relation::Call,
        vec![point],
    );
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        vec![function],
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));
    Writer::new(Config::new(dir.path())).write(&model).unwrap();
}

#[test]
fn two_consecutive_elided_levels_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let line = Context::new(
        5,
        Scope::Line {
            file: hpctoolkit_metadb::model::File::new("main.c"),
            line: 42,
        },
        Relation::Call,
        Vec::new(),
    );
    let inner_point = Context::new(
        4,
        Scope::Point {
            module: hpctoolkit_metadb::model::Module::new("a.out"),
            offset: 0x1008,
        },
        Relation::Enclosure,
        vec![line],
    );
    let outer_point = Context::new(
        3,
        Scope::Point {
            module: hpctoolkit_metadb::model::Module::new("a.out"),
            offset: 0x1000,
        },
        Relation::Enclosure,
        vec![inner_point],
    );
    let function = Context::new(
        2,
        Scope::Function(hpctoolkit_metadb::model::Function::new("main")),
        Relation::Call,
        vec![outer_point],
    );
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        vec![function],
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));
    let err = Writer::new(Config::new(dir.path())).write(&model).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Invariant));
}

#[test]
fn dry_run_performs_no_io() {
    let model = FixedModel::new(Context::global(Vec::new()));
    Writer::new(Config::dry_run()).write(&model).unwrap();
}

#[test]
fn copy_sources_places_a_copy_under_the_output_directory() {
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();

    let source_path = src_dir.path().join("main.c");
    std::fs::write(&source_path, b"int main(void) { return 0; }\n").unwrap();

    let file = hpctoolkit_metadb::model::File::new("main.c").with_resolved_path(source_path.clone());
    let line_ctx = Context::new(2, Scope::Line { file, line: 1 }, Relation::Call, Vec::new());
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        vec![line_ctx],
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));

    let config = Config::new(out_dir.path()).with_copy_sources(true);
    Writer::new(config).write(&model).unwrap();

    // The writer preserves every `Normal` path component of the resolved
    // source path under `<output>/src/` (`spec.md` §8 scenario 5: an
    // absolute path `/abs/p/q.c` copies to `<output>/src/abs/p/q.c`, not
    // flattened to just its file name), so the expected destination mirrors
    // `source_path`'s own components below the root, whatever the
    // platform-chosen temp directory name happens to be.
    let relative: std::path::PathBuf = source_path
        .components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect();
    let copied = out_dir.path().join("src").join(relative);
    let copied_contents = std::fs::read(&copied).expect("source file was not copied");
    let original_contents = std::fs::read(&source_path).unwrap();
    similar_asserts::assert_eq!(copied_contents, original_contents);
}

#[test]
fn a_failed_source_copy_does_not_fail_the_write() {
    let out_dir = tempfile::tempdir().unwrap();

    // A resolved path that doesn't exist: the copy fails, but the write as a
    // whole must still succeed with the file recorded as uncopied.
    let file = hpctoolkit_metadb::model::File::new("missing.c")
        .with_resolved_path("/nonexistent/does-not-exist/missing.c");
    let line_ctx = Context::new(2, Scope::Line { file, line: 1 }, Relation::Call, Vec::new());
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        vec![line_ctx],
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));

    let config = Config::new(out_dir.path()).with_copy_sources(true);
    Writer::new(config).write(&model).unwrap();
}

#[test]
fn lexical_loop_without_a_binary_anchor_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let loop_ctx = Context::new(
        2,
        Scope::Loop(LoopScope::Lexical {
            file: hpctoolkit_metadb::model::File::new("loop.f90"),
            line: 10,
        }),
        Relation::Enclosure,
        Vec::new(),
    );
    let main_thread = Context::new(
        1,
        Scope::Placeholder(Placeholder::MainThread),
        Relation::Call,
        vec![loop_ctx],
    );
    let model = FixedModel::new(Context::global(vec![main_thread]));
    Writer::new(Config::new(dir.path())).write(&model).unwrap();
}

#[test]
fn a_metric_with_full_identifier_assignments_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let scopes = vec![PropagationScope::Point, PropagationScope::Function];

    let metric = Metric {
        name: "cycles".to_string(),
        description: "CPU cycles".to_string(),
        scopes: scopes.clone(),
        partials: vec![Partial {
            combinator: Combinator::Sum,
            accumulate: Expression::UserValue,
            ids: ids_for(&scopes),
        }],
        statistics: vec![Statistic {
            suffix: "Sum".to_string(),
            finalize: Expression::UserValue,
            combinator: Combinator::Sum,
            ids: ids_for(&scopes),
        }],
    };

    let model = FixedModel::new(Context::global(Vec::new())).with_metrics(vec![metric]);
    Writer::new(Config::new(dir.path())).write(&model).unwrap();
}

#[test]
fn a_metric_missing_an_identifier_assignment_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let scopes = vec![PropagationScope::Point, PropagationScope::Function];

    let metric = Metric {
        name: "cycles".to_string(),
        description: "CPU cycles".to_string(),
        scopes: scopes.clone(),
        partials: vec![Partial {
            combinator: Combinator::Sum,
            accumulate: Expression::UserValue,
            // Only Point has an id; Function is missing.
            ids: ids_for(&[PropagationScope::Point]),
        }],
        statistics: Vec::new(),
    };

    let model = FixedModel::new(Context::global(Vec::new())).with_metrics(vec![metric]);
    let err = Writer::new(Config::new(dir.path())).write(&model).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Invariant));
}

#[test]
fn an_unflattened_formula_leaf_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let metric = Metric {
        name: "cycles".to_string(),
        description: "CPU cycles".to_string(),
        scopes: vec![PropagationScope::Point],
        partials: Vec::new(),
        statistics: vec![Statistic {
            suffix: "Sum".to_string(),
            finalize: Expression::Leaf(hpctoolkit_metadb::LeafKind::Variable),
            combinator: Combinator::Sum,
            ids: ids_for(&[PropagationScope::Point]),
        }],
    };

    let model = FixedModel::new(Context::global(Vec::new())).with_metrics(vec![metric]);
    let err = Writer::new(Config::new(dir.path())).write(&model).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Invariant));
}

#[allow(dead_code)]
fn assert_error_is_send_sync<E: std::error::Error + Send + Sync + 'static>() {}

#[test]
fn error_type_is_send_and_sync() {
    assert_error_is_send_sync::<Error>();
}
