//! # Fleet Provisioner
//!
//! Provisions and tears down the instance fleet for load-balancer
//! performance runs on a cloud provider.
//!
//! ## Overview
//!
//! The tool owns three instance groups named by prefix (load clients, pool
//! backends, service engines) and drives each toward a configured count:
//!
//! 1. **Reconcile** - list the group, create the shortfall (one call per
//!    instance or one batched submission), and re-list as ground truth
//! 2. **Trust** - merge the operator's SSH public key into each instance's
//!    metadata under the provider's optimistic-concurrency fingerprint
//! 3. **Wire** - upsert the controller-side objects (cloud config, pool,
//!    virtual service) and register engine hosts
//! 4. **Run** - fan benchmark tasks out over SSH with a bounded pool
//!
//! Every step is idempotent and failure-absorbing: partial fulfilment is
//! reported, not raised, and a rerun picks up where the previous one left
//! off.

pub mod commands;
pub mod config;
pub mod control_plane;
pub mod fleet;
pub mod metadata;
pub mod poll;
pub mod provider;
pub mod remote;
pub mod tasks;
