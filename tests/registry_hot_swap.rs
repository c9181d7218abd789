use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sequencing::{
    ChangeEvent, ContentNode, ContentStore, EventTypes, FactoryRegistry, InMemoryContentStore,
    PathExpressionSelector, Sequencer, SequencerConfig, SequencerContext, SequencerError,
    SequencerRegistry, SequencingConfig, SequencingSystem, Session,
};

/// Appends `<config name>@<instance>:<path>` to a shared log.
struct Tagged {
    instance: usize,
    config: Option<SequencerConfig>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Sequencer for Tagged {
    fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError> {
        self.config = Some(config);
        Ok(())
    }

    fn configuration(&self) -> Option<&SequencerConfig> {
        self.config.as_ref()
    }

    fn execute(&self, node: &ContentNode, _: &mut dyn Session, _: &SequencerContext) -> Result<(), SequencerError> {
        let name = self.config.as_ref().map_or("?", SequencerConfig::name);
        self.log.lock().unwrap().push(format!("{name}@{}:{}", self.instance, node.path));
        Ok(())
    }
}

fn registry(log: &Arc<Mutex<Vec<String>>>) -> (Arc<SequencerRegistry>, Arc<AtomicUsize>) {
    let instances = Arc::new(AtomicUsize::new(0));
    let factory_instances = Arc::clone(&instances);
    let factory_log = Arc::clone(log);
    let factory = FactoryRegistry::new().with("tagged", move || {
        let instance = factory_instances.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(Tagged {
            instance,
            config: None,
            log: Arc::clone(&factory_log),
        }) as Box<dyn Sequencer>)
    });
    (Arc::new(SequencerRegistry::new(factory)), instances)
}

fn config(name: &str, expression: &str) -> SequencerConfig {
    SequencerConfig::builder()
        .name(name)
        .implementation("tagged")
        .path_expression(expression)
        .build()
        .unwrap()
}

#[test]
fn same_name_replaces_live_instance() {
    let log = Arc::default();
    let (registry, instances) = registry(&log);

    let first = config("images", "//*.png");
    let second = config("images", "//*.jpg");
    assert!(registry.add(first).unwrap());
    assert!(registry.add(second.clone()).unwrap());

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].sequencer().configuration(), Some(&second));
    assert_eq!(instances.load(Ordering::SeqCst), 2);

    assert!(registry.remove(&second));
    assert!(registry.snapshot().is_empty());
    assert_eq!(snapshot.len(), 1);
}

#[test]
fn running_system_picks_up_replaced_sequencer() {
    let log = Arc::default();
    let (registry, _) = registry(&log);
    registry.add(config("files", "/files/*.png")).unwrap();

    let store = InMemoryContentStore::with_workspace("default");
    let mut session = store.open_session("default").unwrap();
    session.add_node("/", "files", "nt:folder").unwrap();
    for name in ["a.png", "b.jpg"] {
        session.add_node("/files", name, "nt:file").unwrap();
    }
    session.save().unwrap();

    let system = SequencingSystem::new(Arc::clone(&registry), SequencingConfig::default());
    system.set_content_store(Arc::new(store)).unwrap();
    system.set_selector(Some(Arc::new(PathExpressionSelector)));
    system.start().unwrap();

    let batch = [
        ChangeEvent::new(EventTypes::NODE_ADDED, "/files/a.png"),
        ChangeEvent::new(EventTypes::NODE_ADDED, "/files/b.jpg"),
    ];
    system.on_change_batch("default", &batch);

    // Wait for the first batch so the swap cannot race with it.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stats = system.statistics_snapshot();
        if stats.nodes_sequenced + stats.nodes_skipped == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "first batch not processed");
        thread::sleep(Duration::from_millis(5));
    }

    registry.update(config("files", "/files/*.jpg")).unwrap();
    system.on_change_batch("default", &batch);
    system.shutdown();
    assert!(system.await_termination(Duration::from_secs(10)));

    assert_eq!(*log.lock().unwrap(), ["files@1:/files/a.png", "files@2:/files/b.jpg"]);
}

#[test]
fn concurrent_readers_never_see_duplicates() {
    let log = Arc::default();
    let (registry, _) = registry(&log);
    registry.add(config("a", "/a")).unwrap();

    let writer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            for i in 0..200 {
                registry.add(config("a", &format!("/a/{i}"))).unwrap();
                registry.add(config("b", &format!("/b/{i}"))).unwrap();
            }
        })
    };

    for _ in 0..2000 {
        let snapshot = registry.snapshot();
        let mut names: Vec<&str> = snapshot.iter().map(|r| r.name()).collect();
        let total = names.len();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(total <= 2);
    }
    writer.join().unwrap();
    assert_eq!(registry.len(), 2);
}
