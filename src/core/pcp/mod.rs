// src/core/pcp/mod.rs

//! The pool control protocol: frame codec, reply records, the server worker
//! and the client library the admin tooling links against.

pub mod client;
pub mod frame;
pub mod report;
pub mod server;
pub mod users;

pub use client::PcpClient;
pub use frame::{PcpCodec, PcpFrame};
pub use report::{HealthStatsRow, NodeInfoRow, ProcInfoRow};
pub use server::PcpServer;
