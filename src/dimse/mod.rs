//! This module contains the DIMSE network layer of the intake service.
//! - The wire protocol subset lives in [`pdu`]: framing, association
//!   negotiation messages, data transfer and teardown.
//! - [`association`] runs the per-connection state machine.
//! - [`command`] encodes and decodes the minimal DIMSE command sets.
//! - [`storescp`] accepts TCP connections and drives associations, handing
//!   every completed object transfer to the ingestion queue.

pub mod association;
pub mod command;
pub mod pdu;
pub mod storescp;

pub use storescp::StoreServiceClassProvider;
