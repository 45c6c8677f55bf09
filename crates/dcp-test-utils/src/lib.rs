// dcp-test-utils: an in-process mock DCP producer for integration tests.

mod mock_server;

pub use mock_server::{MockDcpServer, ServerOptions};
