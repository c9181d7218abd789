//! Test sequencers and store contents shared by the sequencing tests.

use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::config::SequencerConfig;
use crate::error::SequencerError;
use crate::registry::SequencerRegistry;
use crate::sequencer::{FactoryRegistry, Sequencer, SequencerContext};
use crate::store::{ContentNode, ContentStore, InMemoryContentStore, Session};

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

/// Logs every node it sees and marks each output path with `<name>.done`.
/// Refuses nodes whose name starts with `bad` and panics on `panic*`.
pub(crate) struct Recorder {
    config: Option<SequencerConfig>,
    log: Log,
}

impl Sequencer for Recorder {
    fn configure(&mut self, config: SequencerConfig) -> Result<(), SequencerError> {
        self.config = Some(config);
        Ok(())
    }

    fn configuration(&self) -> Option<&SequencerConfig> {
        self.config.as_ref()
    }

    fn execute(&self, node: &ContentNode, session: &mut dyn Session, ctx: &SequencerContext) -> Result<(), SequencerError> {
        let name = self.config.as_ref().map_or("?", SequencerConfig::name).to_string();
        self.log.lock().unwrap().push(format!("{name}:{}", node.path));
        if node.name().starts_with("bad") {
            return Err(SequencerError::execution(name, "refused"));
        }
        assert!(!node.name().starts_with("panic"), "{name} cannot handle {}", node.path);
        for output in ctx.output_paths() {
            session.set_property(output, &format!("{name}.done"), json!(true))?;
        }
        Ok(())
    }
}

/// Registry of `Recorder`s, one per `(name, path expressions)` entry.
pub(crate) fn registry(log: &Log, sequencers: &[(&str, Vec<&str>)]) -> Arc<SequencerRegistry> {
    let constructor_log = Arc::clone(log);
    let factory = FactoryRegistry::new().with("recorder", move || {
        Ok(Box::new(Recorder {
            config: None,
            log: Arc::clone(&constructor_log),
        }) as Box<dyn Sequencer>)
    });
    let registry = SequencerRegistry::new(factory);
    for (name, expressions) in sequencers {
        let config = SequencerConfig::builder()
            .name(*name)
            .implementation("recorder")
            .path_expressions(expressions.iter().copied())
            .build()
            .unwrap();
        registry.add(config).unwrap();
    }
    Arc::new(registry)
}

/// Workspace `default` holding `/docs` with `a.txt`, `b.txt` and `bad.txt`.
pub(crate) fn store() -> InMemoryContentStore {
    let store = InMemoryContentStore::with_workspace("default");
    let mut session = store.open_session("default").unwrap();
    session.add_node("/", "docs", "nt:folder").unwrap();
    for name in ["a.txt", "b.txt", "bad.txt"] {
        session.add_node("/docs", name, "nt:file").unwrap();
    }
    session.save().unwrap();
    store
}

pub(crate) fn property(store: &InMemoryContentStore, path: &str, name: &str) -> Option<serde_json::Value> {
    let session = store.open_session("default").unwrap();
    session.node(path).unwrap().property(name).cloned()
}
