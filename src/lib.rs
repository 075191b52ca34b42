//! Runs CI build scripts inside disposable containers.
//!
//! A [`queue::BuildTask`] carries a [`repo::Repo`] and a [`script::BuildScript`];
//! [`recipe::generate`] turns them into an image recipe, and a
//! [`build::Orchestrator`] builds the image, runs exactly one container with
//! the privilege decision from [`repo::Repo::should_run_privileged`], and
//! tears it down.

pub mod build;
pub mod config;
pub mod docker;
pub mod queue;
pub mod recipe;
pub mod repo;
pub mod script;
