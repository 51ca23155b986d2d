#![cfg_attr(docsrs, feature(doc_cfg))]
//! # FedLedger coordinator
//!
//! The coordinator side of a cross-organization federation. It drives training rounds through
//! their lifecycle, aggregates the protected updates of the organizations and anchors every
//! completed round in a hash-chained, multi-signed ledger.
//!
//! - [`round`]: the phases of a training round and the submissions it collects.
//! - [`ledger`]: the append-only block chain of model provenance and its storage backends.
//! - [`federation`]: the orchestrator tying rounds, aggregation, privacy and the ledger together.
//! - [`events`]: phase and model updates published by the orchestrator.
//! - [`settings`]: loading and validation of the configuration.
//!
//! The transport layer between the organizations and the coordinator is not part of this crate.

pub mod events;
pub mod federation;
pub mod ledger;
pub mod round;
pub mod settings;
