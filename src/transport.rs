pub use callcore::{Transport, TransportEvent, TransportFactory};
pub use peercall_tokio_transport::TokioWebSocketTransportFactory;
