//! Agora Validation Engine
//!
//! Every fact entering a node, whether submitted locally, published by a
//! peer or relayed during overlay sync, passes the same fixed pipeline:
//!
//! 1. **Structural**: required fields, well-formed id, positive timestamp
//! 2. **Semantic**: entity shape and object shape match the relation
//! 3. **Cryptographic**: hash recomputes; signature verifies against the
//!    creator's key; peer policy (creator == sender, not revoked)
//! 4. **Context**: future skew, maximum age, expiry ordering, coordinates
//! 5. **Business rules**: pluggable [`RuleRegistry`]
//!
//! The first failing stage decides the [`ValidationError`]. Rejections are
//! per fact; nothing here can take the node down.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use agora_fact::{Context, FactFactory, FactIndex, Keypair, Keyring, Signer, now_millis};
//! use agora_validation::{ValidationConfig, ValidationContext, ValidationEngine};
//!
//! let local = Arc::new(Keypair::generate());
//! let mut engine = ValidationEngine::new(ValidationConfig::default(), local.clone());
//! let index = FactIndex::new();
//! let keys = Keyring::new();
//!
//! let mut fact = FactFactory::new(local.peer_id().clone())
//!     .needs("alice", "water", Context::new())
//!     .unwrap();
//! let ctx = ValidationContext { index: &index, keys: &keys, now: now_millis() };
//! engine.validate(&mut fact, &ctx).unwrap();
//! assert!(fact.validated && fact.signature.is_some());
//! ```

mod config;
mod engine;
mod error;
pub mod rules;

pub use config::ValidationConfig;
pub use engine::{Origin, ValidationContext, ValidationEngine, ValidationStats};
pub use error::{Result, Stage, ValidationError};
pub use rules::{RuleContext, RuleRegistry};
