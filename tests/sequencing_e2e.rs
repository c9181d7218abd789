use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use sequencing::{
    ChangeEvent, ChangeListener, ContentNode, ContentStore, EventTypes, FactoryRegistry,
    InMemoryContentStore, PathExpressionSelector, Sequencer, SequencerConfig, SequencerContext,
    SequencerError, SequencerRegistry, SequencingConfig, SequencingSystem, Session,
    SubscriptionFilter,
};

const WAIT: Duration = Duration::from_secs(10);
const SEQUENCER_USER: &str = "sequencer";

/// Writes `<name>.from` on each output path it is given, creating the
/// output node when it does not exist yet. Fails on nodes named `corrupt*`.
struct Deriver {
    config: Option<SequencerConfig>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Sequencer for Deriver {
    fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError> {
        self.config = Some(config);
        Ok(())
    }

    fn configuration(&self) -> Option<&SequencerConfig> {
        self.config.as_ref()
    }

    fn execute(&self, node: &ContentNode, session: &mut dyn Session, ctx: &SequencerContext) -> Result<(), SequencerError> {
        let name = self.config.as_ref().map_or("deriver", SequencerConfig::name).to_string();
        ctx.monitor().check()?;
        self.seen.lock().unwrap().push(node.path.clone());
        if node.name().starts_with("corrupt") {
            return Err(SequencerError::execution(name, format!("cannot read {}", node.path)));
        }
        for output in ctx.output_paths() {
            if session.node(output).is_err() {
                let (parent, child) = output.rsplit_once('/').unwrap_or(("", output.as_str()));
                let parent = if parent.is_empty() { "/" } else { parent };
                session.add_node(parent, child, "nt:unstructured")?;
            }
            session.set_property(output, &format!("{name}.from"), json!(ctx.input_path()))?;
        }
        Ok(())
    }
}

struct Harness {
    store: InMemoryContentStore,
    registry: Arc<SequencerRegistry>,
    system: Arc<SequencingSystem>,
    listener: Arc<ChangeListener>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(config: SequencingConfig) -> Self {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let factory_seen = Arc::clone(&seen);
        let factory = FactoryRegistry::new().with("deriver", move || {
            Ok(Box::new(Deriver {
                config: None,
                seen: Arc::clone(&factory_seen),
            }) as Box<dyn Sequencer>)
        });
        let registry = Arc::new(SequencerRegistry::new(factory));

        let store = InMemoryContentStore::with_workspace("default");
        let mut session = store.open_session("default").unwrap();
        for folder in ["uploads", "derived", "docs"] {
            session.add_node("/", folder, "nt:folder").unwrap();
        }
        session.save().unwrap();

        let system = Arc::new(SequencingSystem::new(Arc::clone(&registry), config));
        system
            .set_content_store(Arc::new(store.as_user(SEQUENCER_USER)))
            .unwrap();
        system.set_selector(Some(Arc::new(PathExpressionSelector)));

        let listener = ChangeListener::new(&system);
        let filter = SubscriptionFilter {
            no_local: true,
            user_id: Some(SEQUENCER_USER.to_string()),
            ..ChangeListener::default_filter("default")
        };
        listener.register(Arc::new(store.clone()), filter).unwrap();

        Self {
            store,
            registry,
            system,
            listener,
            seen,
        }
    }

    fn add_sequencer(&self, name: &str, expressions: &[&str]) {
        let config = SequencerConfig::builder()
            .name(name)
            .implementation("deriver")
            .path_expressions(expressions.iter().copied())
            .build()
            .unwrap();
        assert!(self.registry.add(config).unwrap());
    }

    fn editor(&self) -> Box<dyn Session> {
        Box::new(self.store.open_session_as("default", Some("editor")).unwrap())
    }

    fn finish(&self) {
        self.system.shutdown();
        assert!(self.system.await_termination(WAIT));
    }

    fn property(&self, path: &str, name: &str) -> Option<serde_json::Value> {
        let session = self.store.open_session("default").unwrap();
        session.node(path).ok()?.property(name).cloned()
    }
}

#[test]
fn uploads_are_routed_to_derived_nodes() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("thumbs", &["/derived/$1[/uploads/(*.png)]"]);
    h.system.start().unwrap();

    let mut editor = h.editor();
    editor.add_node("/uploads", "cat.png", "nt:file").unwrap();
    editor.add_node("/uploads", "notes.txt", "nt:file").unwrap();
    editor.save().unwrap();
    h.finish();

    assert_eq!(h.property("/derived/cat.png", "thumbs.from"), Some(json!("/uploads/cat.png")));
    assert_eq!(h.property("/derived/notes.txt", "thumbs.from"), None);

    let stats = h.system.statistics_snapshot();
    assert_eq!(stats.batches_enqueued, 1);
    assert_eq!(stats.events_enqueued, 2);
    assert_eq!(stats.nodes_enqueued, 2);
    assert_eq!(stats.nodes_sequenced, 1);
    assert_eq!(stats.nodes_skipped, 1);
}

#[test]
fn property_changes_select_owning_node() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("titles", &["//*[@title]"]);

    let mut editor = h.editor();
    editor.add_node("/docs", "a.txt", "nt:file").unwrap();
    editor.add_node("/docs", "b.txt", "nt:file").unwrap();
    editor.save().unwrap();

    h.system.start().unwrap();
    let mut editor = h.editor();
    editor.set_property("/docs/a.txt", "title", json!("A")).unwrap();
    editor.set_property("/docs/a.txt", "title", json!("A, revised")).unwrap();
    editor.set_property("/docs/b.txt", "size", json!(12)).unwrap();
    editor.save().unwrap();
    h.finish();

    assert_eq!(*h.seen.lock().unwrap(), ["/docs/a.txt"]);
    assert_eq!(h.property("/docs/a.txt", "titles.from"), Some(json!("/docs/a.txt")));
    assert_eq!(h.property("/docs/b.txt", "titles.from"), None);

    let stats = h.system.statistics_snapshot();
    // The batch before start was ignored, not lost.
    assert_eq!(stats.batches_ignored, 1);
    assert_eq!(stats.events_ignored, 2);
    assert_eq!(stats.events_enqueued, 3);
    assert_eq!(stats.nodes_enqueued, 2);
}

#[test]
fn failing_node_does_not_block_the_pipeline() {
    let h = Harness::new(SequencingConfig {
        workers: 4,
        ..SequencingConfig::default()
    });
    h.add_sequencer("copies", &["/derived/$1[/uploads/(*)]"]);
    h.system.start().unwrap();

    let mut editor = h.editor();
    editor.add_node("/uploads", "corrupt.bin", "nt:file").unwrap();
    editor.add_node("/uploads", "good.bin", "nt:file").unwrap();
    editor.save().unwrap();

    for i in 0..20 {
        let mut editor = h.editor();
        editor.add_node("/uploads", &format!("file-{i}"), "nt:file").unwrap();
        editor.save().unwrap();
    }
    h.finish();

    let stats = h.system.statistics_snapshot();
    assert_eq!(stats.nodes_failed, 1);
    assert_eq!(stats.nodes_sequenced, 21);
    assert_eq!(h.property("/derived/corrupt.bin", "copies.from"), None);
    assert_eq!(h.property("/derived/good.bin", "copies.from"), Some(json!("/uploads/good.bin")));
    for i in 0..20 {
        let expected = json!(format!("/uploads/file-{i}"));
        assert_eq!(h.property(&format!("/derived/file-{i}"), "copies.from"), Some(expected));
    }
}

#[test]
fn sequencers_run_in_registration_order() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("first", &["/uploads/*"]);
    h.add_sequencer("second", &["/uploads/*"]);
    h.system.start().unwrap();

    let mut editor = h.editor();
    editor.add_node("/uploads", "x", "nt:file").unwrap();
    editor.save().unwrap();
    h.finish();

    assert_eq!(*h.seen.lock().unwrap(), ["/uploads/x", "/uploads/x"]);
    assert_eq!(h.property("/uploads/x", "first.from"), Some(json!("/uploads/x")));
    assert_eq!(h.property("/uploads/x", "second.from"), Some(json!("/uploads/x")));
}

#[test]
fn shutdown_detaches_listener() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("copies", &["/derived/$1[/uploads/(*)]"]);
    h.system.start().unwrap();
    h.finish();

    let mut editor = h.editor();
    editor.add_node("/uploads", "late", "nt:file").unwrap();
    editor.save().unwrap();

    assert!(!h.listener.is_registered());
    assert_eq!(h.store.subscription_count(), 0);
    assert!(h.seen.lock().unwrap().is_empty());
    assert!(h.system.start().is_err());
}

#[test]
fn direct_batches_respect_event_filter() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("copies", &["/derived/$1[/uploads/(*)]"]);
    h.system
        .set_event_filter(Some(Arc::new(|e: &ChangeEvent| !e.path.ends_with(".tmp"))));
    h.system.start().unwrap();

    let mut editor = h.editor();
    editor.add_node("/uploads", "keep", "nt:file").unwrap();
    editor.add_node("/uploads", "scratch.tmp", "nt:file").unwrap();
    editor.save().unwrap();
    h.finish();

    let stats = h.system.statistics_snapshot();
    assert_eq!(stats.events_skipped, 1);
    assert_eq!(stats.nodes_sequenced, 1);
    assert!(h.property("/derived/keep", "copies.from").is_some());
    assert!(h.property("/derived/scratch.tmp", "copies.from").is_none());
}

#[test]
fn statistics_reset_restarts_counting() {
    let h = Harness::new(SequencingConfig::default());
    h.add_sequencer("copies", &["/derived/$1[/uploads/(*)]"]);
    h.system.on_change_batch("default", &[ChangeEvent::new(EventTypes::NODE_ADDED, "/uploads/a")]);
    assert_eq!(h.system.statistics_snapshot().events_ignored, 1);

    h.system.statistics().reset();
    let stats = h.system.statistics_snapshot();
    assert_eq!(stats.events_ignored, 0);
    assert_eq!(stats.batches_ignored, 0);
    h.finish();
}
