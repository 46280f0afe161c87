#![allow(clippy::style)]
#![allow(clippy::complexity)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::mutable_key_type)]
#![allow(clippy::stable_sort_primitive)]
#![allow(clippy::map_entry)]
#![allow(clippy::box_default)]
#![warn(clippy::bool_comparison)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::no_effect)]
#![warn(clippy::unnecessary_unwrap)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::todo)]
#![warn(clippy::wildcard_dependencies)]
#![warn(clippy::zero_prefixed_literal)]
#![warn(clippy::borrowed_box)]
#![warn(clippy::deref_addrof)]
#![warn(clippy::double_must_use)]
#![warn(clippy::double_parens)]
#![warn(clippy::extra_unused_lifetimes)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_question_mark)]
#![warn(clippy::needless_return)]
#![warn(clippy::redundant_pattern)]
#![warn(clippy::redundant_slicing)]
#![warn(clippy::redundant_static_lifetimes)]
#![warn(clippy::single_component_path_imports)]
#![warn(clippy::unnecessary_cast)]
#![warn(clippy::useless_asref)]
#![warn(clippy::useless_conversion)]
#![warn(clippy::builtin_type_shadow)]
#![warn(clippy::duplicate_underscore_argument)]
#![warn(double_negations)]
#![warn(clippy::unnecessary_mut_passed)]
#![warn(clippy::wildcard_in_or_patterns)]
#![warn(clippy::crosspointer_transmute)]
#![warn(clippy::excessive_precision)]
#![warn(clippy::panicking_overflow_checks)]
#![warn(clippy::as_conversions)]
#![warn(clippy::match_overlapping_arm)]
#![warn(clippy::zero_divided_by_zero)]
#![warn(clippy::must_use_unit)]
#![warn(clippy::suspicious_assignment_formatting)]
#![warn(clippy::suspicious_else_formatting)]
#![warn(clippy::suspicious_unary_op_formatting)]
#![warn(clippy::mut_mutex_lock)]
#![warn(clippy::print_literal)]
#![warn(clippy::same_item_push)]
#![warn(clippy::useless_format)]
#![warn(clippy::write_literal)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::redundant_closure_call)]
#![warn(clippy::unnecessary_lazy_evaluations)]
#![warn(clippy::partialeq_ne_impl)]
#![warn(clippy::redundant_field_names)]
#![warn(clippy::transmutes_expressible_as_ptr_casts)]
#![warn(clippy::unused_async)]
#![warn(clippy::disallowed_methods)]
#![warn(clippy::disallowed_macros)]
#![warn(clippy::disallowed_types)]
#![warn(clippy::from_over_into)]

//! This crate implements two Kubernetes controllers on top of a small
//! work-queue driven reconciliation loop:
//!
//! - the cluster controller watches [`ClusterRequest`](crd::ClusterRequest)
//!   objects, creates the requested cluster at a remote provider, waits for
//!   it to come up and records its ID and phase in the request's status;
//! - the expose controller watches `Deployment`s and gives each one a
//!   `Service` and an `Ingress` of the same name.
//!
//! Both share one architecture. A watch keeps a local cache of the watched
//! kind up to date and pushes the key of every object it sees change onto a
//! [`WorkQueue`]. A fixed pool of workers takes keys off the queue and hands
//! the cached object to a [`Context`], or tells it the object is gone. The
//! queue never hands out a key that is already being worked on, and keys
//! whose reconciliation failed come back with exponential backoff until
//! [`MAX_REQUEUES`](controller::MAX_REQUEUES) is reached.
//!
//! To write a controller, implement [`Context`] and run it with a
//! [`Controller`]:
//!
//! ```no_run
//! # use k8s_openapi::api::core::v1::ConfigMap;
//! # use kube::Client;
//! # use kube_runtime::watcher;
//! # use k8s_provisioner::{Context, Controller, ObjectKey, Shutdown};
//! struct Logger;
//!
//! #[async_trait::async_trait]
//! impl Context for Logger {
//!     type Resource = ConfigMap;
//!     type Error = std::convert::Infallible;
//!
//!     const CONTROLLER_NAME: &'static str = "logger";
//!
//!     async fn apply(&self, cm: &ConfigMap, _: &Shutdown) -> Result<(), Self::Error> {
//!         println!("{:?} changed", cm.metadata.name);
//!         Ok(())
//!     }
//!
//!     async fn cleanup(&self, key: &ObjectKey) -> Result<(), Self::Error> {
//!         println!("{key} deleted");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::try_default().await?;
//! Controller::namespaced_all(client, Logger, watcher::Config::default())
//!     .workers(4)
//!     .run(async { tokio::signal::ctrl_c().await.unwrap_or_default() })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod expose;
pub mod provider;
pub mod queue;

pub use controller::{Context, Controller, ErrorAction, ObjectKey};
pub use error::Error;
pub use queue::{RateLimiter, Shutdown, WorkQueue};
