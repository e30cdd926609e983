// courier-test-utils: shared test helpers for the delivery service.
//
// Provides a typed mock WebSocket client used by the integration suites to
// drive client sessions against a running server.

pub mod mock_ws_client;

pub use mock_ws_client::{MockWsClient, Received};
