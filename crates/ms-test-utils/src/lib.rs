// ms-test-utils: Shared test utilities for the metric shipper suite.
//
// Provides a mock ingestion consumer (WebSocket) with scripted control
// responses and a mock queue server speaking the RESP subset the shipper
// uses, so integration tests run hermetically.

pub mod mock_consumer;
pub mod mock_redis;

pub use mock_consumer::{ConsumerOptions, MockConsumer};
pub use mock_redis::MockRedis;
