//! Tributary - Event-time stream processing
//!
//! This crate provides a worker runtime for consuming topic streams,
//! folding them into windowed keyed tables and correlating them with
//! windowed joins. All windowing is event-time driven: retention and
//! expiry follow the timestamps carried by the records, never the wall
//! clock.

pub mod broker;
pub mod codec;
pub mod join;
pub mod record;
pub mod service;
pub mod source;
pub mod table;
pub mod topology;
pub mod value;
pub mod worker;

pub use broker::memory::MemoryBroker;
pub use broker::{BrokerClient, BrokerConsumer, BrokerError, BrokerRecord, TopicSelector};
pub use codec::{Codec, DecodeError, EncodeError, JsonCodec, RawCodec, SharedCodec, Utf8Codec};
pub use join::{Join, JoinSide, JoinSpec};
pub use record::Record;
pub use service::{Lifecycle, Service, ServiceError, ServiceState, StartError, StopError};
pub use source::{RecordSink, Source, SourceOptions, Streamable};
pub use table::{
    field_key, record_key, Count, FnReducer, KeyExtractor, Max, Min, Reducer, Sum, Table,
    TableSpec, WindowSpec,
};
pub use topology::{Topology, TopologyError};
pub use value::Value;
pub use worker::{Worker, DEFAULT_SERVER};

// Kafka exports (client type always available, the real impl requires "kafka")
pub use broker::kafka::{KafkaBroker, KafkaBrokerConfig};
