//! Startup errors.
//!
//! Anything that kills the process before the listener is up renders
//! through [`miette::Report`] with a diagnostic code and, where one
//! helps, a hint. Request-time failures never reach this type; they
//! map to HTTP responses in the server module.

use std::net::SocketAddr;

use miette::Diagnostic;
use thiserror::Error;

use gatepass_config::ConfigError;

#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error(transparent)]
    #[diagnostic(code(gatepass::config))]
    Config(#[from] ConfigError),

    #[error("could not bind {addr}")]
    #[diagnostic(
        code(gatepass::bind),
        help("Is another gatepass instance already listening on this address?")
    )]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
