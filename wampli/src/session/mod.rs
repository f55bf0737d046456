mod config;
mod connector;
mod dispatcher;
mod handler;
mod requests;
mod session;

pub use config::{
    RawSocketConfig,
    SessionConfig,
    WebSocketConfig,
};
pub use connector::{
    Connection,
    Connector,
    RawSocketConnector,
    WebSocketConnector,
    connector_for_url,
};
pub use handler::{
    EventHandler,
    InvocationHandler,
};
pub use session::{
    Event,
    Invocation,
    ProcedureOptions,
    PublishOptions,
    PublishedEvent,
    RegistrationHandle,
    RpcCall,
    RpcResult,
    RpcYield,
    Session,
    SessionState,
    SubscriptionHandle,
    SubscriptionOptions,
};
