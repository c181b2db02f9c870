use thiserror::Error;

use crate::scheduler::job::JobSpecification;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Job not found: {0}")]
    JobNotFound(JobSpecification),

    #[error("Job already submitted: {0}")]
    DuplicateJob(JobSpecification),

    #[error("Node already connected: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Job registry is at capacity ({0} jobs)")]
    RegistryFull(usize),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Resolver error: {0}")]
    Resolver(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
