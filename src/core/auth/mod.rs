// src/core/auth/mod.rs

//! The authentication gate: HBA rule matching and the per-method exchanges
//! run against every new client before its session is admitted.

pub mod gate;
pub mod hba;
pub mod ip;
pub mod keyfile;
pub mod md5;
pub mod methods;
pub mod passwd;
pub mod scram;

pub use gate::{AuthContext, authenticate_client};
pub use hba::{ClientInfo, HbaRules};
pub use methods::AuthMethod;
pub use passwd::{PasswordStore, StoredSecret};
