//! kt-meshdebug: connect to a Kubernetes cluster and mesh a service in one
//! command.
//!
//! A session validates the requested port exposure, opens a network tunnel
//! into the cluster, redirects the share of a service's traffic carrying a
//! version mark header to processes on this machine, and undoes all of it
//! when it receives SIGINT or SIGTERM.
//!
//! # Architecture
//!
//! - **Expose**: `--expose` parsing and local/remote port validation
//! - **Cluster**: `kubectl` access, service resolution, shadow pods
//! - **Tunnel**: tun2socks and sshuttle backends
//! - **Mesh**: auto (router) and manual (istio) backends
//! - **Cleanup**: undo ledger, cleanup task, leftover sweep
//! - **Orchestrator**: sequences the stages and waits for completion
//! - **Telemetry**: structured syslog audit trail

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cleanup;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod expose;
pub mod mesh;
pub mod orchestrator;
pub mod prepare;
pub mod process;
pub mod session;
pub mod telemetry;
pub mod tunnel;
