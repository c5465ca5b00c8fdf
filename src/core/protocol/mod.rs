// src/core/protocol/mod.rs

//! The subset of the PostgreSQL wire protocol the pool speaks itself:
//! startup and SSL negotiation, the authentication exchanges, simple query,
//! and error frames. Session payload traffic is relayed, not interpreted.

pub mod message;

pub use message::{
    AUTH_CLEARTEXT_PASSWORD, AUTH_MD5_PASSWORD, AUTH_OK, AUTH_SASL, AUTH_SASL_CONTINUE,
    AUTH_SASL_FINAL, BackendMessage, CANCEL_REQUEST_CODE, PROTOCOL_VERSION_3, SSL_REQUEST_CODE,
    StartupPacket, StartupRequest,
};
