//! Per-execution runtime configuration: checkpointer selection and the
//! event bus sink list. Loaded from a YAML config file with `${NAME}` /
//! `${NAME:default}` environment substitution (§6).

use crate::utils::id_generator::IdGenerator;

use super::checkpointer::CheckpointerType;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub session_id: Option<String>,
    pub checkpointer: Option<CheckpointerType>,
    pub event_bus: EventBusConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_id: Some(IdGenerator::new().generate_session_id()),
            checkpointer: default_checkpointer(),
            event_bus: EventBusConfig::default(),
        }
    }
}

#[cfg(feature = "sqlite")]
fn default_checkpointer() -> Option<CheckpointerType> {
    dotenvy::dotenv().ok();
    let path = std::env::var("STEPGRAPH_DB_PATH").unwrap_or_else(|_| "stepgraph.db".to_string());
    Some(CheckpointerType::Embedded { path })
}

#[cfg(not(feature = "sqlite"))]
fn default_checkpointer() -> Option<CheckpointerType> {
    None
}

impl RuntimeConfig {
    pub fn new(session_id: Option<String>, checkpointer: Option<CheckpointerType>) -> Self {
        Self {
            session_id,
            checkpointer,
            event_bus: EventBusConfig::default(),
        }
    }

    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBusConfig) -> Self {
        self.event_bus = event_bus;
        self
    }

    #[must_use]
    pub fn with_stdout_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_stdout_only())
    }

    #[must_use]
    pub fn with_memory_event_bus(self) -> Self {
        self.with_event_bus(EventBusConfig::with_memory_sink())
    }

    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: CheckpointerType) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkConfig {
    StdOut,
    Memory,
}

#[derive(Clone, Debug)]
pub struct EventBusConfig {
    pub buffer_capacity: usize,
    pub sinks: Vec<SinkConfig>,
}

impl EventBusConfig {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new(buffer_capacity: usize, sinks: Vec<SinkConfig>) -> Self {
        Self {
            buffer_capacity: if buffer_capacity == 0 {
                Self::DEFAULT_BUFFER_CAPACITY
            } else {
                buffer_capacity
            },
            sinks,
        }
    }

    #[must_use]
    pub fn with_stdout_only() -> Self {
        Self::new(Self::DEFAULT_BUFFER_CAPACITY, vec![SinkConfig::StdOut])
    }

    #[must_use]
    pub fn with_memory_sink() -> Self {
        Self::new(
            Self::DEFAULT_BUFFER_CAPACITY,
            vec![SinkConfig::StdOut, SinkConfig::Memory],
        )
    }

    #[must_use]
    pub fn add_sink(mut self, sink: SinkConfig) -> Self {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
        self
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn sinks(&self) -> &[SinkConfig] {
        &self.sinks
    }

    /// Construct the [`crate::event_bus::EventBus`] this config describes.
    #[must_use]
    pub fn build_event_bus(&self) -> crate::event_bus::EventBus {
        use crate::event_bus::{EventSink, MemorySink, StdOutSink};

        let sinks: Vec<Box<dyn EventSink>> = self
            .sinks
            .iter()
            .map(|sink| -> Box<dyn EventSink> {
                match sink {
                    SinkConfig::StdOut => Box::new(StdOutSink::default()),
                    SinkConfig::Memory => Box::new(MemorySink::new()),
                }
            })
            .collect();
        crate::event_bus::EventBus::with_sinks(sinks)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::with_stdout_only()
    }
}
