//! `billrun-worker`: the deployable process hosting the document pipelines.

pub mod pipelines;
