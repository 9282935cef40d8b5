//! Vectis - build and test Debian packages in disposable VMs
//!
//! A [`worker::Worker`] drives an autopkgtest virt server over its line
//! protocol. The [`store::ArtifactStore`] keeps VM images and chroot
//! tarballs per architecture, vendor and suite, and the
//! [`pipeline::Orchestrator`] sequences the stages that create them and
//! use them to build and test packages.

pub mod cli;
pub mod config;
pub mod error;
pub mod journal;
pub mod package;
pub mod pipeline;
pub mod store;
pub mod ui;
pub mod virt;
pub mod worker;

pub use error::{VectisError, VectisResult};
