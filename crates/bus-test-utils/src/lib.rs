//! Shared test harness for the message bus workspace: a mock broker and a
//! raw WebSocket client, for exercising `services/peer` and `services/broker`
//! without standing up the other side's full binary.

pub mod mock_ws_client;
pub mod mock_ws_server;

pub use mock_ws_client::MockWsClient;
pub use mock_ws_server::MockBrokerServer;
